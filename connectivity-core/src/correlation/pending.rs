//! One in-flight request and its completion slot

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::message::CorrelatedMessage;

/// Lifecycle of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed,
    Rejected,
    TimedOut,
    Cancelled,
    /// Failed by the session, e.g. the transport dropped
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

pub(crate) type Outcome<M> = ConnectivityResult<Vec<M>>;

/// Result of feeding a reply into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Slot already terminal; the message was not used
    Ignored,
    Partial { received: usize, expected: usize },
    Completed,
}

struct SlotState<M> {
    status: RequestStatus,
    responses: Vec<M>,
    expected: Option<usize>,
    sender: Option<oneshot::Sender<Outcome<M>>>,
}

/// Completion slot shared by the registry (reply side) and the
/// [`PendingRequest`] (waiting side).
///
/// Every transition runs under one lock and only leaves `Pending` once,
/// so whichever of completion, reject, timeout, cancellation or failure
/// gets there first decides the outcome.
pub(crate) struct Slot<M> {
    state: Mutex<SlotState<M>>,
}

impl<M: CorrelatedMessage> Slot<M> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Outcome<M>>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            state: Mutex::new(SlotState {
                status: RequestStatus::Pending,
                responses: Vec::new(),
                expected: None,
                sender: Some(tx),
            }),
        });
        (slot, rx)
    }

    pub(crate) fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    /// Accumulate one reply; completes once the declared total is reached.
    ///
    /// The first reply that declares a total fixes it; without one a single
    /// reply completes the request. A declared total of zero still needs
    /// the message that announced it.
    pub(crate) fn accept(&self, message: M) -> Progress {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return Progress::Ignored;
        }

        if state.expected.is_none() {
            state.expected = message.declared_total();
        }
        state.responses.push(message);

        let expected = state.expected.unwrap_or(1).max(1);
        let received = state.responses.len();
        if received < expected {
            return Progress::Partial { received, expected };
        }

        state.status = RequestStatus::Completed;
        let responses = std::mem::take(&mut state.responses);
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(Ok(responses));
        }
        Progress::Completed
    }

    /// Move to a failed terminal status; false if already terminal
    pub(crate) fn resolve(&self, status: RequestStatus, error: ConnectivityError) -> bool {
        debug_assert!(status.is_terminal() && status != RequestStatus::Completed);
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.responses.clear();
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(Err(error));
        }
        true
    }
}

pub(crate) type PendingMap<M> = DashMap<String, Arc<Slot<M>>>;

/// Handle held by the caller of a registered request.
///
/// Dropping the handle removes the entry from its registry, so an
/// abandoned request never lingers there.
pub struct PendingRequest<M: CorrelatedMessage> {
    correlation_id: String,
    outbound: M,
    slot: Arc<Slot<M>>,
    receiver: Option<oneshot::Receiver<Outcome<M>>>,
    outcome: Option<Outcome<M>>,
    cancel: CancellationToken,
    registry: Weak<PendingMap<M>>,
    created_at: Instant,
}

impl<M: CorrelatedMessage> PendingRequest<M> {
    pub(crate) fn new(
        correlation_id: String,
        outbound: M,
        slot: Arc<Slot<M>>,
        receiver: oneshot::Receiver<Outcome<M>>,
        cancel: CancellationToken,
        registry: Weak<PendingMap<M>>,
    ) -> Self {
        Self {
            correlation_id,
            outbound,
            slot,
            receiver: Some(receiver),
            outcome: None,
            cancel,
            registry,
            created_at: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Outbound message with the correlation id stamped in
    pub fn outbound(&self) -> &M {
        &self.outbound
    }

    pub fn status(&self) -> RequestStatus {
        self.slot.status()
    }

    /// Cancel the request unless it already reached a terminal status
    pub fn cancel(&self) -> bool {
        let cancelled = self.slot.resolve(
            RequestStatus::Cancelled,
            ConnectivityError::Cancelled {
                correlation_id: self.correlation_id.clone(),
            },
        );
        self.remove_from_registry();
        cancelled
    }

    /// Wait for the terminal outcome, at most `timeout`.
    ///
    /// Returns every reply accumulated for the request. On timeout or
    /// cancellation the request is resolved locally, unless a reply won
    /// the race, in which case that reply is returned. Waiting again
    /// returns the same outcome.
    pub async fn wait(&mut self, timeout: Duration) -> ConnectivityResult<Vec<M>> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(mut receiver) = self.receiver.take() else {
            return Err(ConnectivityError::Protocol(format!(
                "request {} has no completion channel",
                self.correlation_id
            )));
        };

        let outcome = tokio::select! {
            biased;
            outcome = &mut receiver => outcome,
            _ = self.cancel.cancelled() => {
                self.slot.resolve(
                    RequestStatus::Cancelled,
                    ConnectivityError::Cancelled {
                        correlation_id: self.correlation_id.clone(),
                    },
                );
                receiver.await
            }
            _ = tokio::time::sleep(timeout) => {
                if self.slot.resolve(
                    RequestStatus::TimedOut,
                    ConnectivityError::Timeout {
                        correlation_id: self.correlation_id.clone(),
                        elapsed_ms: self.created_at.elapsed().as_millis() as u64,
                    },
                ) {
                    debug!(correlation_id = %self.correlation_id, "Request timed out");
                }
                receiver.await
            }
        };

        // the slot owns the sender until it resolves, so a closed channel
        // means the slot itself was dropped
        let outcome = outcome.unwrap_or_else(|_| {
            Err(ConnectivityError::NotConnected(format!(
                "request {} abandoned",
                self.correlation_id
            )))
        });

        self.remove_from_registry();
        self.outcome = Some(outcome.clone());
        outcome
    }

    fn remove_from_registry(&self) {
        if let Some(pending) = self.registry.upgrade() {
            pending.remove(&self.correlation_id);
        }
    }
}

impl<M: CorrelatedMessage> Drop for PendingRequest<M> {
    fn drop(&mut self) {
        if !self.slot.status().is_terminal() {
            self.slot.resolve(
                RequestStatus::Cancelled,
                ConnectivityError::Cancelled {
                    correlation_id: self.correlation_id.clone(),
                },
            );
        }
        self.remove_from_registry();
    }
}

impl<M: CorrelatedMessage> std::fmt::Debug for PendingRequest<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("correlation_id", &self.correlation_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;

    fn standalone(id: &str) -> PendingRequest<Envelope> {
        let (slot, rx) = Slot::new();
        PendingRequest::new(
            id.to_string(),
            Envelope::new("D").with_correlation_id(id),
            slot,
            rx,
            CancellationToken::new(),
            Weak::new(),
        )
    }

    #[test]
    fn test_first_transition_wins() {
        let (slot, _rx) = Slot::<Envelope>::new();
        assert_eq!(slot.accept(Envelope::new("8")), Progress::Completed);
        assert!(!slot.resolve(
            RequestStatus::TimedOut,
            ConnectivityError::Timeout {
                correlation_id: "x".into(),
                elapsed_ms: 1
            }
        ));
        assert_eq!(slot.accept(Envelope::new("8")), Progress::Ignored);
        assert_eq!(slot.status(), RequestStatus::Completed);
    }

    #[test]
    fn test_partial_accumulation() {
        let (slot, mut rx) = Slot::<Envelope>::new();
        let report = Envelope::new("AP").with_total(3);

        assert_eq!(
            slot.accept(report.clone()),
            Progress::Partial {
                received: 1,
                expected: 3
            }
        );
        assert_eq!(
            slot.accept(report.clone()),
            Progress::Partial {
                received: 2,
                expected: 3
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(slot.accept(report), Progress::Completed);
        assert_eq!(rx.try_recv().unwrap().unwrap().len(), 3);
    }

    #[test]
    fn test_zero_total_completes_with_announcing_message() {
        let (slot, mut rx) = Slot::<Envelope>::new();
        assert_eq!(slot.accept(Envelope::new("AO").with_total(0)), Progress::Completed);
        assert_eq!(rx.try_recv().unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut pending = standalone("T-1");
        let started = Instant::now();
        let err = pending.wait(Duration::from_millis(50)).await.unwrap_err();

        assert!(matches!(err, ConnectivityError::Timeout { ref correlation_id, .. } if correlation_id == "T-1"));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pending.status(), RequestStatus::TimedOut);

        // outcome is cached
        assert!(matches!(
            pending.wait(Duration::from_millis(1)).await,
            Err(ConnectivityError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_token_unblocks_wait() {
        let (slot, rx) = Slot::<Envelope>::new();
        let token = CancellationToken::new();
        let mut pending = PendingRequest::new(
            "C-1".into(),
            Envelope::new("D"),
            slot,
            rx,
            token.clone(),
            Weak::new(),
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = pending.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::Cancelled { .. }));
        assert_eq!(pending.status(), RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_explicit_cancel_after_completion_is_noop() {
        let (slot, rx) = Slot::<Envelope>::new();
        let mut pending = PendingRequest::new(
            "C-2".into(),
            Envelope::new("D"),
            slot.clone(),
            rx,
            CancellationToken::new(),
            Weak::new(),
        );

        slot.accept(Envelope::new("8"));
        assert!(!pending.cancel());
        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap().len(), 1);
        assert_eq!(pending.status(), RequestStatus::Completed);
    }
}
