//! Correlation id → pending request routing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::pending::{PendingMap, PendingRequest, Progress, RequestStatus, Slot};
use crate::error::ConnectivityError;
use crate::message::{CorrelatedMessage, InboundHandler};

/// Keyed collection of in-flight requests of one message category.
///
/// Ids have the form `{name}_{session tag}_{counter}`; the session tag is
/// drawn once per registry so ids never repeat across reconnects of a
/// process or across registries sharing a name.
pub struct RequestRegistry<M: CorrelatedMessage> {
    name: String,
    tag: String,
    next_id: AtomicU64,
    pending: Arc<PendingMap<M>>,
}

impl<M: CorrelatedMessage> RequestRegistry<M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: nanoid::nanoid!(8),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_correlation_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}", self.name, self.tag, seq)
    }

    /// Stamp a fresh correlation id onto `message` and track it.
    ///
    /// Callers sending over a session hold its send gate across this call
    /// and the transmission so id order matches wire order.
    pub fn register(&self, message: &mut M, cancel: CancellationToken) -> PendingRequest<M> {
        let correlation_id = self.next_correlation_id();
        message.stamp_correlation_id(&correlation_id);

        let (slot, receiver) = Slot::new();
        self.pending.insert(correlation_id.clone(), slot.clone());
        trace!(registry = %self.name, correlation_id = %correlation_id, "Registered request");

        PendingRequest::new(
            correlation_id,
            message.clone(),
            slot,
            receiver,
            cancel,
            Arc::downgrade(&self.pending),
        )
    }

    /// Route an inbound message to the request it answers.
    ///
    /// Returns false when no pending request carries its correlation id;
    /// that is normal for unsolicited messages and changes nothing.
    pub fn dispatch(&self, message: &M) -> bool {
        let Some(correlation_id) = message.correlation_id() else {
            return false;
        };
        let Some(slot) = self.pending.get(correlation_id).map(|entry| entry.value().clone()) else {
            return false;
        };

        if let Some((kind, reason)) = message.reject() {
            if slot.resolve(
                RequestStatus::Rejected,
                ConnectivityError::Rejected {
                    kind,
                    reason: reason.clone(),
                },
            ) {
                debug!(
                    registry = %self.name,
                    correlation_id = %correlation_id,
                    reason = %reason,
                    "Request rejected"
                );
            }
            self.pending.remove(correlation_id);
            return true;
        }

        match slot.accept(message.clone()) {
            Progress::Partial { received, expected } => {
                trace!(
                    registry = %self.name,
                    correlation_id = %correlation_id,
                    received,
                    expected,
                    "Partial response"
                );
            }
            Progress::Completed | Progress::Ignored => {
                self.pending.remove(correlation_id);
            }
        }
        true
    }

    /// Fail every outstanding request with `error`; returns how many
    pub fn fail_all(&self, error: ConnectivityError) -> usize {
        let mut failed = 0;
        self.pending.retain(|_, slot| {
            if slot.resolve(RequestStatus::Failed, error.clone()) {
                failed += 1;
            }
            false
        });
        if failed > 0 {
            debug!(registry = %self.name, failed, error = %error, "Failed pending requests");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }
}

impl<M: CorrelatedMessage> InboundHandler<M> for RequestRegistry<M> {
    fn handle(&self, message: &M) -> bool {
        self.dispatch(message)
    }
}
