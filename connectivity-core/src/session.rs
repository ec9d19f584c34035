//! Session connector: one transport, one inbound loop, many requests
//!
//! Outbound requests are registered and written under a single send gate,
//! so correlation ids reach the wire in the order they were issued. The
//! inbound loop decodes every frame and routes it by category; replies
//! complete their pending request, everything else goes to the registered
//! handlers or the unsolicited broadcast.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::MessageCodec;
use crate::connection::{ConnectionState, ManagedSession, SessionFault, SessionLink};
use crate::correlation::RequestRegistry;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::message::{CorrelatedMessage, InboundHandler, MessageCategory};
use crate::transport::{FrameSink, FrameStream, Transport};

const UNSOLICITED_BUFFER: usize = 1024;

#[derive(Default)]
struct SessionMetrics {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    decode_errors: AtomicU64,
    unrouted: AtomicU64,
    rejects_dropped: AtomicU64,
}

/// Point-in-time session counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub decode_errors: u64,
    pub unrouted: u64,
    pub rejects_dropped: u64,
}

struct SessionInner<M: CorrelatedMessage> {
    name: String,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn MessageCodec<M>>,
    gate: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    routes: RwLock<HashMap<MessageCategory, Vec<Arc<dyn InboundHandler<M>>>>>,
    registries: RwLock<Vec<Arc<RequestRegistry<M>>>>,
    link: RwLock<Option<SessionLink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    unsolicited: broadcast::Sender<M>,
    epoch: AtomicU64,
    open: AtomicBool,
    closing: AtomicBool,
    metrics: SessionMetrics,
}

/// Transport session shared by every caller of one exchange channel
pub struct SessionConnector<M: CorrelatedMessage> {
    inner: Arc<SessionInner<M>>,
}

impl<M: CorrelatedMessage> Clone for SessionConnector<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: CorrelatedMessage> SessionConnector<M> {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn MessageCodec<M>>,
    ) -> Self {
        let (unsolicited, _) = broadcast::channel(UNSOLICITED_BUFFER);
        Self {
            inner: Arc::new(SessionInner {
                name: name.into(),
                transport,
                codec,
                gate: tokio::sync::Mutex::new(None),
                routes: RwLock::new(HashMap::new()),
                registries: RwLock::new(Vec::new()),
                link: RwLock::new(None),
                reader: Mutex::new(None),
                unsolicited,
                epoch: AtomicU64::new(0),
                open: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                metrics: SessionMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create a registry whose replies arrive under `category`.
    ///
    /// Rejects are offered to every registry of the session regardless of
    /// category.
    pub fn registry(&self, category: MessageCategory, name: impl Into<String>) -> Arc<RequestRegistry<M>> {
        let registry = Arc::new(RequestRegistry::new(name));
        self.route(category, registry.clone());
        self.inner.registries.write().push(registry.clone());
        registry
    }

    /// Add a handler for `category`; handlers are tried in insertion order
    pub fn route(&self, category: MessageCategory, handler: Arc<dyn InboundHandler<M>>) {
        self.inner.routes.write().entry(category).or_default().push(handler);
    }

    /// Inbound messages no handler consumed
    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<M> {
        self.inner.unsolicited.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        let m = &self.inner.metrics;
        SessionStats {
            frames_in: m.frames_in.load(Ordering::Relaxed),
            frames_out: m.frames_out.load(Ordering::Relaxed),
            decode_errors: m.decode_errors.load(Ordering::Relaxed),
            unrouted: m.unrouted.load(Ordering::Relaxed),
            rejects_dropped: m.rejects_dropped.load(Ordering::Relaxed),
        }
    }

    /// `NotConnected` unless the owning connection is `Connected` and the
    /// transport is up
    pub fn ensure_can_handle_request(&self) -> ConnectivityResult<()> {
        let state = self
            .inner
            .link
            .read()
            .as_ref()
            .map(|link| link.state.get())
            .ok_or_else(|| {
                ConnectivityError::NotConnected(format!("session {} is not attached", self.inner.name))
            })?;

        if state != ConnectionState::Connected {
            return Err(ConnectivityError::NotConnected(format!(
                "connection is {}",
                state
            )));
        }
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(ConnectivityError::NotConnected(format!(
                "session {} is closed",
                self.inner.name
            )));
        }
        Ok(())
    }

    /// Send `message` and wait for its reply.
    ///
    /// Registration, encoding and the write happen under the send gate;
    /// the wait does not. `cancel` is honoured while queued for the gate
    /// too: a request cancelled before its turn is never registered or sent.
    pub async fn send_request(
        &self,
        registry: &RequestRegistry<M>,
        mut message: M,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> ConnectivityResult<Vec<M>> {
        self.ensure_can_handle_request()?;

        let mut pending = {
            let mut gate = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        session = %self.inner.name,
                        registry = %registry.name(),
                        "Request cancelled before send"
                    );
                    return Err(ConnectivityError::Cancelled {
                        correlation_id: message.correlation_id().unwrap_or("unsent").to_string(),
                    });
                }
                gate = self.inner.gate.lock() => gate,
            };
            let sink = gate.as_mut().ok_or_else(|| {
                ConnectivityError::NotConnected(format!("session {} is closed", self.inner.name))
            })?;

            let pending = registry.register(&mut message, cancel);
            let frame = self.inner.codec.encode(pending.outbound())?;
            sink.send(frame).await?;
            self.inner.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
            debug!(
                session = %self.inner.name,
                correlation_id = %pending.correlation_id(),
                "Request sent"
            );
            pending
        };

        pending.wait(timeout).await
    }

    /// Fire-and-forget write; only needs an open transport
    pub async fn send(&self, message: &M) -> ConnectivityResult<()> {
        let frame = self.inner.codec.encode(message)?;
        let mut gate = self.inner.gate.lock().await;
        let sink = gate.as_mut().ok_or_else(|| {
            ConnectivityError::NotConnected(format!("session {} is closed", self.inner.name))
        })?;
        sink.send(frame).await?;
        self.inner.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub async fn open(&self) -> ConnectivityResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let (sink, frames) = self.inner.transport.connect().await?;

        *self.inner.gate.lock().await = Some(sink);
        let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.closing.store(false, Ordering::Release);
        self.inner.open.store(true, Ordering::Release);

        let reader = tokio::spawn(read_loop(self.inner.clone(), frames, epoch));
        if let Some(previous) = self.inner.reader.lock().replace(reader) {
            previous.abort();
        }

        info!(
            session = %self.inner.name,
            transport = self.inner.transport.kind(),
            "Session opened"
        );
        Ok(())
    }

    pub async fn close(&self) -> ConnectivityResult<()> {
        self.inner.closing.store(true, Ordering::Release);

        let sink = self.inner.gate.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                warn!(session = %self.inner.name, error = %e, "Transport close failed");
            }
        }
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }

        let was_open = self.inner.open.swap(false, Ordering::AcqRel);
        let failed = self
            .inner
            .fail_pending(ConnectivityError::NotConnected(format!("session {} closed", self.inner.name)));
        if was_open {
            info!(session = %self.inner.name, failed, "Session closed");
        }
        Ok(())
    }
}

impl<M: CorrelatedMessage> SessionInner<M> {
    fn fail_pending(&self, error: ConnectivityError) -> usize {
        self.registries
            .read()
            .iter()
            .map(|registry| registry.fail_all(error.clone()))
            .sum()
    }

    fn route(&self, message: M) {
        let category = message.category();

        if category == MessageCategory::Reject {
            let handled = self
                .registries
                .read()
                .iter()
                .any(|registry| registry.dispatch(&message));
            if !handled {
                self.drop_reject(&message);
            }
            return;
        }

        let handled = self
            .routes
            .read()
            .get(&category)
            .map(|handlers| handlers.iter().any(|handler| handler.handle(&message)))
            .unwrap_or(false);
        if handled {
            return;
        }

        if message.reject().is_some() {
            self.drop_reject(&message);
            return;
        }
        self.metrics.unrouted.fetch_add(1, Ordering::Relaxed);
        debug!(session = %self.name, ?category, "Unsolicited inbound message");
        let _ = self.unsolicited.send(message);
    }

    fn drop_reject(&self, message: &M) {
        self.metrics.rejects_dropped.fetch_add(1, Ordering::Relaxed);
        let reason = message.reject().map(|(_, reason)| reason).unwrap_or_default();
        warn!(
            session = %self.name,
            correlation_id = message.correlation_id().unwrap_or("<none>"),
            reason = %reason,
            "Reject for unknown request dropped"
        );
    }

    async fn fault(&self, epoch: u64, reason: String) {
        if self.closing.load(Ordering::Acquire) || self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        self.open.store(false, Ordering::Release);
        let _ = self.gate.lock().await.take();

        let failed = self.fail_pending(ConnectivityError::NotConnected(reason.clone()));
        error!(session = %self.name, reason = %reason, failed, "Session transport failed");

        let link = self.link.read().clone();
        if let Some(link) = link {
            let _ = link.faults.send(SessionFault {
                session: self.name.clone(),
                reason,
            });
        }
    }
}

async fn read_loop<M: CorrelatedMessage>(
    inner: Arc<SessionInner<M>>,
    mut frames: Box<dyn FrameStream>,
    epoch: u64,
) {
    loop {
        match frames.next_frame().await {
            Some(Ok(frame)) => {
                inner.metrics.frames_in.fetch_add(1, Ordering::Relaxed);
                match inner.codec.decode(&frame) {
                    Ok(message) => inner.route(message),
                    Err(e) => {
                        inner.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(session = %inner.name, error = %e, "Dropping undecodable frame");
                    }
                }
            }
            // a malformed frame; the transport has already skipped past it
            Some(Err(ConnectivityError::Protocol(reason))) => {
                inner.metrics.frames_in.fetch_add(1, Ordering::Relaxed);
                inner.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(session = %inner.name, reason = %reason, "Dropping malformed frame");
            }
            Some(Err(e)) => {
                inner.fault(epoch, e.to_string()).await;
                break;
            }
            None => {
                inner.fault(epoch, "connection closed by peer".to_string()).await;
                break;
            }
        }
    }
    debug!(session = %inner.name, epoch, "Inbound loop finished");
}

#[async_trait]
impl<M: CorrelatedMessage> ManagedSession for SessionConnector<M> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn attach(&self, link: SessionLink) {
        *self.inner.link.write() = Some(link);
    }

    async fn open(&self) -> ConnectivityResult<()> {
        SessionConnector::open(self).await
    }

    async fn close(&self) -> ConnectivityResult<()> {
        SessionConnector::close(self).await
    }

    fn is_open(&self) -> bool {
        SessionConnector::is_open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::connection::StateHandle;
    use crate::error::RejectKind;
    use crate::message::{msg_type, tag, Envelope};
    use crate::transport::{MemoryTransport, MemoryVenue, VenueConnection};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Instant};

    struct Harness {
        session: SessionConnector<Envelope>,
        orders: Arc<RequestRegistry<Envelope>>,
        positions: Arc<RequestRegistry<Envelope>>,
        venue: MemoryVenue,
        state: StateHandle,
        faults: mpsc::UnboundedReceiver<SessionFault>,
    }

    fn harness() -> Harness {
        let (transport, venue) = MemoryTransport::new();
        let session = SessionConnector::new("orders", Arc::new(transport), Arc::new(JsonCodec));
        let orders = session.registry(MessageCategory::Order, "ORD");
        let positions = session.registry(MessageCategory::Position, "POS");
        let state = StateHandle::new("test", 16);
        let (faults_tx, faults) = mpsc::unbounded_channel();
        session.attach(SessionLink {
            state: state.clone(),
            faults: faults_tx,
        });
        Harness {
            session,
            orders,
            positions,
            venue,
            state,
            faults,
        }
    }

    async fn connected(h: &mut Harness) -> VenueConnection {
        h.session.open().await.unwrap();
        h.state.transition(ConnectionState::Connected);
        h.venue.accept().await.unwrap()
    }

    fn order() -> Envelope {
        Envelope::new(msg_type::NEW_ORDER_SINGLE)
            .with_field(tag::SYMBOL, "BTC-USD")
            .with_field(tag::ORDER_QTY, 1)
    }

    async fn recv_envelope(conn: &mut VenueConnection) -> Envelope {
        let frame = conn.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met");
    }

    #[tokio::test]
    async fn test_requires_connected_state() {
        let mut h = harness();
        let err = h
            .session
            .send_request(&h.orders, order(), CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::NotConnected(_)));

        h.session.open().await.unwrap();
        let _conn = h.venue.accept().await.unwrap();
        h.state.transition(ConnectionState::Connecting);
        assert!(h.session.ensure_can_handle_request().is_err());
        h.state.transition(ConnectionState::Connected);
        assert!(h.session.ensure_can_handle_request().is_ok());
        assert!(h.orders.is_empty());
    }

    #[tokio::test]
    async fn test_reply_completes_request() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let session = h.session.clone();
        let orders = h.orders.clone();
        let request = tokio::spawn(async move {
            session
                .send_request(&orders, order(), CancellationToken::new(), Duration::from_secs(2))
                .await
        });

        let sent = recv_envelope(&mut conn).await;
        let id = sent.correlation_id.clone().unwrap();
        let ack = Envelope::new(msg_type::EXECUTION_REPORT)
            .with_correlation_id(id)
            .with_field(tag::ORDER_ID, "X-1")
            .with_field(tag::ORD_STATUS, "0");
        conn.send(serde_json::to_string(&ack).unwrap());

        let replies = request.await.unwrap().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].field(tag::ORDER_ID), Some("X-1"));
        assert!(h.orders.is_empty());
        assert_eq!(h.session.stats().frames_out, 1);
        assert_eq!(h.session.stats().frames_in, 1);
    }

    #[tokio::test]
    async fn test_silent_venue_times_out_and_forgets_the_request() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let started = Instant::now();
        let err = h
            .session
            .send_request(&h.orders, order(), CancellationToken::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, ConnectivityError::Timeout { .. }));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(600));
        assert!(h.orders.is_empty());

        // a late reply is unsolicited now
        let sent = recv_envelope(&mut conn).await;
        let mut unsolicited = h.session.subscribe_unsolicited();
        let late = Envelope::new(msg_type::EXECUTION_REPORT)
            .with_correlation_id(sent.correlation_id.unwrap())
            .with_field(tag::ORD_STATUS, "0");
        conn.send(serde_json::to_string(&late).unwrap());
        let seen = timeout(Duration::from_secs(1), unsolicited.recv()).await.unwrap().unwrap();
        assert_eq!(seen.msg_type, msg_type::EXECUTION_REPORT);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_for_gate_never_sends() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let gate = h.session.inner.gate.lock().await;
        let cancel = CancellationToken::new();
        let session = h.session.clone();
        let orders = h.orders.clone();
        let token = cancel.clone();
        let request = tokio::spawn(async move {
            session
                .send_request(&orders, order(), token, Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = timeout(Duration::from_secs(1), request)
            .await
            .expect("cancel not observed while queued")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::Cancelled { .. }));
        assert!(h.orders.is_empty());
        drop(gate);

        // an already-cancelled token short-circuits even with the gate free
        let err = h
            .session
            .send_request(&h.orders, order(), cancel, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::Cancelled { .. }));

        assert!(timeout(Duration::from_millis(50), conn.recv()).await.is_err());
        assert_eq!(h.session.stats().frames_out, 0);
    }

    #[tokio::test]
    async fn test_reject_for_unknown_request_leaves_others_pending() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let session = h.session.clone();
        let orders = h.orders.clone();
        let request = tokio::spawn(async move {
            session
                .send_request(&orders, order(), CancellationToken::new(), Duration::from_secs(2))
                .await
        });
        let sent = recv_envelope(&mut conn).await;

        let stray = Envelope::new(msg_type::BUSINESS_REJECT)
            .with_correlation_id("X")
            .with_text("no such request");
        conn.send(serde_json::to_string(&stray).unwrap());
        let session = h.session.clone();
        eventually(move || session.stats().rejects_dropped == 1).await;
        assert_eq!(h.orders.len(), 1);

        let reject = Envelope::new(msg_type::BUSINESS_REJECT)
            .with_correlation_id(sent.correlation_id.unwrap())
            .with_text("Insufficient funds");
        conn.send(serde_json::to_string(&reject).unwrap());

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::Rejected {
                kind: RejectKind::InsufficientFunds,
                ..
            }
        ));
        assert!(h.orders.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_reach_the_wire_in_id_order() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let session = h.session.clone();
            let positions = h.positions.clone();
            tasks.push(tokio::spawn(async move {
                let request = Envelope::new(msg_type::REQUEST_FOR_POSITIONS);
                session
                    .send_request(&positions, request, CancellationToken::new(), Duration::from_secs(2))
                    .await
            }));
        }

        let mut sequence = Vec::new();
        for _ in 0..20 {
            let sent = recv_envelope(&mut conn).await;
            let id = sent.correlation_id.unwrap();
            let counter: u64 = id.rsplit('_').next().unwrap().parse().unwrap();
            sequence.push(counter);

            let ack = Envelope::new(msg_type::REQUEST_FOR_POSITIONS_ACK)
                .with_correlation_id(id)
                .with_total(0);
            conn.send(serde_json::to_string(&ack).unwrap());
        }

        assert!(sequence.windows(2).all(|w| w[0] < w[1]), "{:?}", sequence);
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_counted_and_skipped() {
        let mut h = harness();
        let conn = connected(&mut h).await;

        conn.send("{not json");
        conn.send(serde_json::to_string(&Envelope::new(msg_type::HEARTBEAT)).unwrap());
        let session = h.session.clone();
        eventually(move || session.stats().frames_in == 2).await;

        let stats = h.session.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.unrouted, 1);
        assert!(h.session.is_open());
    }

    #[tokio::test]
    async fn test_transport_failure_fails_pending_and_reports() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let session = h.session.clone();
        let orders = h.orders.clone();
        let request = tokio::spawn(async move {
            session
                .send_request(&orders, order(), CancellationToken::new(), Duration::from_secs(5))
                .await
        });
        recv_envelope(&mut conn).await;

        conn.fail("reset by peer");
        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectivityError::NotConnected(reason) if reason.contains("reset by peer")));

        let fault = timeout(Duration::from_secs(1), h.faults.recv()).await.unwrap().unwrap();
        assert_eq!(fault.session, "orders");
        assert!(!h.session.is_open());
        assert!(h.session.ensure_can_handle_request().is_err());
    }

    #[tokio::test]
    async fn test_local_close_fails_pending_without_fault() {
        let mut h = harness();
        let mut conn = connected(&mut h).await;

        let session = h.session.clone();
        let positions = h.positions.clone();
        let request = tokio::spawn(async move {
            session
                .send_request(
                    &positions,
                    Envelope::new(msg_type::REQUEST_FOR_POSITIONS),
                    CancellationToken::new(),
                    Duration::from_secs(5),
                )
                .await
        });
        recv_envelope(&mut conn).await;

        h.session.close().await.unwrap();
        assert!(matches!(
            request.await.unwrap(),
            Err(ConnectivityError::NotConnected(_))
        ));
        assert!(h.faults.try_recv().is_err());

        // reopen on a fresh connection
        h.session.open().await.unwrap();
        assert!(h.venue.accept().await.is_some());
        assert!(h.session.is_open());
    }
}
