//! Fire-and-forget sinks for call statistics and the order audit trail

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConnectivityError;

/// Receives one record per exchange call. Must not block.
pub trait CallStatsSink: Send + Sync {
    fn record(&self, exchange: &str, operation: &'static str, latency: Duration, error: Option<&ConnectivityError>);
}

/// Aggregated counters for one operation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub calls: u64,
    pub errors: u64,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

impl CallStats {
    pub fn average_latency(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us / self.calls)
    }
}

/// Lock-free in-process statistics keyed by `(exchange, operation)`
#[derive(Default)]
pub struct InMemoryCallStats {
    stats: DashMap<(String, &'static str), CallStats>,
}

impl InMemoryCallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, exchange: &str, operation: &'static str) -> Option<CallStats> {
        self.stats
            .get(&(exchange.to_string(), operation))
            .map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<(String, &'static str, CallStats)> {
        self.stats
            .iter()
            .map(|entry| {
                let (exchange, operation) = entry.key();
                (exchange.clone(), *operation, entry.value().clone())
            })
            .collect()
    }
}

impl CallStatsSink for InMemoryCallStats {
    fn record(&self, exchange: &str, operation: &'static str, latency: Duration, error: Option<&ConnectivityError>) {
        let latency_us = latency.as_micros().min(u64::MAX as u128) as u64;
        let mut entry = self.stats.entry((exchange.to_string(), operation)).or_default();
        entry.calls += 1;
        if error.is_some() {
            entry.errors += 1;
        }
        entry.total_latency_us = entry.total_latency_us.saturating_add(latency_us);
        entry.max_latency_us = entry.max_latency_us.max(latency_us);
    }
}

/// One translated request and how it ended
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub exchange: String,
    pub operation: &'static str,
    pub request: serde_json::Value,
    /// `None` on success
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Receives the audit trail of order entry. Must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes audit records to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        match &record.error {
            None => info!(
                exchange = %record.exchange,
                operation = record.operation,
                request = %record.request,
                "Audit"
            ),
            Some(error) => warn!(
                exchange = %record.exchange,
                operation = record.operation,
                request = %record.request,
                error = %error,
                "Audit"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_stats_aggregate() {
        let stats = InMemoryCallStats::new();
        stats.record("sim", "add_order", Duration::from_micros(100), None);
        stats.record("sim", "add_order", Duration::from_micros(300), None);
        stats.record(
            "sim",
            "add_order",
            Duration::from_micros(200),
            Some(&ConnectivityError::Protocol("bad".into())),
        );

        let add = stats.get("sim", "add_order").unwrap();
        assert_eq!(add.calls, 3);
        assert_eq!(add.errors, 1);
        assert_eq!(add.max_latency_us, 300);
        assert_eq!(add.average_latency(), Duration::from_micros(200));
        assert!(stats.get("sim", "get_positions").is_none());
        assert!(stats.get("other", "add_order").is_none());
        assert_eq!(stats.all().len(), 1);
    }

    #[test]
    fn test_empty_stats_average() {
        assert_eq!(CallStats::default().average_latency(), Duration::ZERO);
    }
}
