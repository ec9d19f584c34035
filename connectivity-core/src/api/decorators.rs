//! Wrappers composed around an [`ExchangeApi`] at construction time

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::stats::{AuditRecord, AuditSink, CallStatsSink};
use super::ExchangeApi;
use crate::error::ConnectivityResult;
use crate::types::{CancelRequest, OrderAck, OrderRequest, Position};

/// Records latency and failures of every call into a [`CallStatsSink`]
pub struct InstrumentedExchange<E> {
    inner: E,
    sink: Arc<dyn CallStatsSink>,
}

impl<E: ExchangeApi> InstrumentedExchange<E> {
    pub fn new(inner: E, sink: Arc<dyn CallStatsSink>) -> Self {
        Self { inner, sink }
    }

    async fn measure<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = ConnectivityResult<T>>,
    ) -> ConnectivityResult<T> {
        let started = Instant::now();
        let result = call.await;
        self.sink
            .record(self.inner.exchange(), operation, started.elapsed(), result.as_ref().err());
        result
    }
}

#[async_trait]
impl<E: ExchangeApi> ExchangeApi for InstrumentedExchange<E> {
    fn exchange(&self) -> &str {
        self.inner.exchange()
    }

    async fn add_order(&self, order: &OrderRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        self.measure("add_order", self.inner.add_order(order, cancel)).await
    }

    async fn cancel_order(&self, request: &CancelRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        self.measure("cancel_order", self.inner.cancel_order(request, cancel)).await
    }

    async fn get_positions(&self, cancel: CancellationToken) -> ConnectivityResult<Vec<Position>> {
        self.measure("get_positions", self.inner.get_positions(cancel)).await
    }
}

/// Writes order entry requests and their outcome to an [`AuditSink`]
pub struct AuditedExchange<E> {
    inner: E,
    sink: Arc<dyn AuditSink>,
}

impl<E: ExchangeApi> AuditedExchange<E> {
    pub fn new(inner: E, sink: Arc<dyn AuditSink>) -> Self {
        Self { inner, sink }
    }

    fn audit<R: Serialize, T>(&self, operation: &'static str, request: &R, result: &ConnectivityResult<T>) {
        let request = match serde_json::to_value(request) {
            Ok(value) => value,
            Err(e) => {
                warn!(operation, error = %e, "Cannot serialize request for audit");
                serde_json::Value::Null
            }
        };
        self.sink.record(AuditRecord {
            exchange: self.inner.exchange().to_string(),
            operation,
            request,
            error: result.as_ref().err().map(|e| e.to_string()),
            recorded_at: Utc::now(),
        });
    }
}

#[async_trait]
impl<E: ExchangeApi> ExchangeApi for AuditedExchange<E> {
    fn exchange(&self) -> &str {
        self.inner.exchange()
    }

    async fn add_order(&self, order: &OrderRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        let result = self.inner.add_order(order, cancel).await;
        self.audit("add_order", order, &result);
        result
    }

    async fn cancel_order(&self, request: &CancelRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        let result = self.inner.cancel_order(request, cancel).await;
        self.audit("cancel_order", request, &result);
        result
    }

    async fn get_positions(&self, cancel: CancellationToken) -> ConnectivityResult<Vec<Position>> {
        self.inner.get_positions(cancel).await
    }
}

/// Caller-side retry of retryable failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Retries calls whose error is retryable; insufficient funds never is
pub struct RetryingExchange<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: ExchangeApi> RetryingExchange<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: CancellationToken,
        mut call: F,
    ) -> ConnectivityResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ConnectivityResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call(cancel.clone()).await {
                Err(e) if e.should_retry() && attempt < self.policy.max_retries && !cancel.is_cancelled() => {
                    attempt += 1;
                    warn!(
                        exchange = %self.inner.exchange(),
                        operation,
                        attempt,
                        error = %e,
                        "Retrying exchange call"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                        _ = cancel.cancelled() => return Err(e),
                    }
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<E: ExchangeApi> ExchangeApi for RetryingExchange<E> {
    fn exchange(&self) -> &str {
        self.inner.exchange()
    }

    async fn add_order(&self, order: &OrderRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        self.retry("add_order", cancel, |token| self.inner.add_order(order, token))
            .await
    }

    async fn cancel_order(&self, request: &CancelRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        self.retry("cancel_order", cancel, |token| self.inner.cancel_order(request, token))
            .await
    }

    async fn get_positions(&self, cancel: CancellationToken) -> ConnectivityResult<Vec<Position>> {
        self.retry("get_positions", cancel, |token| self.inner.get_positions(token))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::stats::InMemoryCallStats;
    use crate::error::{ConnectivityError, RejectKind};
    use crate::types::{OrderStatus, Side, Symbol};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Replays scripted outcomes for `add_order`
    struct ScriptedExchange {
        outcomes: Mutex<VecDeque<ConnectivityResult<OrderAck>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExchange {
        fn new(outcomes: Vec<ConnectivityResult<OrderAck>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for ScriptedExchange {
        fn exchange(&self) -> &str {
            "scripted"
        }

        async fn add_order(&self, _order: &OrderRequest, _cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ConnectivityError::Protocol("script exhausted".into())))
        }

        async fn cancel_order(&self, _request: &CancelRequest, _cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
            Ok(ack())
        }

        async fn get_positions(&self, _cancel: CancellationToken) -> ConnectivityResult<Vec<Position>> {
            Ok(Vec::new())
        }
    }

    fn ack() -> OrderAck {
        OrderAck {
            order_id: "X-1".into(),
            client_order_id: "ORD_t_1".into(),
            status: OrderStatus::New,
            filled_quantity: 0.0,
            received_at: Utc::now(),
        }
    }

    fn order() -> OrderRequest {
        OrderRequest::market(Symbol::new("BTC-USD"), Side::Buy, 1.0)
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retry_once_after_business_reject() {
        let scripted = Arc::new(ScriptedExchange::new(vec![
            Err(ConnectivityError::Rejected {
                kind: RejectKind::Business,
                reason: "price out of band".into(),
            }),
            Ok(ack()),
        ]));
        let exchange = RetryingExchange::new(scripted.clone(), quick_retry());

        assert_ok!(exchange.add_order(&order(), CancellationToken::new()).await);
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let scripted = Arc::new(ScriptedExchange::new(vec![
            Err(ConnectivityError::Protocol("garbled".into())),
            Err(ConnectivityError::Protocol("garbled again".into())),
            Ok(ack()),
        ]));
        let exchange = RetryingExchange::new(scripted.clone(), quick_retry());

        let err = assert_err!(exchange.add_order(&order(), CancellationToken::new()).await);
        assert!(matches!(err, ConnectivityError::Protocol(reason) if reason == "garbled again"));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_insufficient_funds_and_timeouts_are_not_retried() {
        let scripted = Arc::new(ScriptedExchange::new(vec![
            Err(ConnectivityError::Rejected {
                kind: RejectKind::InsufficientFunds,
                reason: "Insufficient funds".into(),
            }),
            Err(ConnectivityError::Timeout {
                correlation_id: "ORD_t_2".into(),
                elapsed_ms: 100,
            }),
        ]));
        let exchange = RetryingExchange::new(scripted.clone(), quick_retry());

        let err = assert_err!(exchange.add_order(&order(), CancellationToken::new()).await);
        assert!(err.is_insufficient_funds());
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);

        let err = assert_err!(exchange.add_order(&order(), CancellationToken::new()).await);
        assert!(matches!(err, ConnectivityError::Timeout { .. }));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_instrumented_and_audited_composition() {
        struct Collecting(Mutex<Vec<AuditRecord>>);
        impl AuditSink for Collecting {
            fn record(&self, record: AuditRecord) {
                self.0.lock().push(record);
            }
        }

        let scripted = Arc::new(ScriptedExchange::new(vec![
            Ok(ack()),
            Err(ConnectivityError::Rejected {
                kind: RejectKind::Business,
                reason: "unknown symbol".into(),
            }),
        ]));
        let stats = Arc::new(InMemoryCallStats::new());
        let audit = Arc::new(Collecting(Mutex::new(Vec::new())));
        let exchange = AuditedExchange::new(
            InstrumentedExchange::new(scripted.clone(), stats.clone()),
            audit.clone(),
        );

        assert_ok!(exchange.add_order(&order(), CancellationToken::new()).await);
        assert_err!(exchange.add_order(&order(), CancellationToken::new()).await);
        assert_ok!(exchange.get_positions(CancellationToken::new()).await);

        let add = stats.get("scripted", "add_order").unwrap();
        assert_eq!(add.calls, 2);
        assert_eq!(add.errors, 1);
        assert_eq!(stats.get("scripted", "get_positions").unwrap().calls, 1);

        let records = audit.0.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, "add_order");
        assert_eq!(records[0].request["symbol"], "BTC-USD");
        assert!(records[0].error.is_none());
        assert!(records[1].error.as_deref().unwrap().contains("unknown symbol"));
    }
}
