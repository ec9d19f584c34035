//! Book ownership, gap recovery and snapshot fetching
//!
//! The inbound loop hands every sequenced delta to [`BookManager::apply`].
//! A sequence gap never reaches the caller as an error: the manager
//! discards the ladder, starts buffering, announces `BookEvent::Resyncing`
//! and queues the symbol for the resync worker, which fetches a snapshot
//! from a [`SnapshotSource`] and replays what was buffered.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::book::{BookOperation, OrderBook, OrderBookItem};
use super::guard::{ApplyOutcome, SequenceGuard, DEFAULT_MAX_BUFFERED};
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::types::{Side, Symbol};

/// Notification for book subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    Updated {
        symbol: Symbol,
        sequence: u64,
    },
    /// Ladder discarded after a gap; a snapshot has been requested
    Resyncing {
        symbol: Symbol,
        expected: u64,
        received: u64,
    },
    Resynced {
        symbol: Symbol,
        sequence: u64,
        replayed: usize,
    },
    ResyncFailed {
        symbol: Symbol,
        reason: String,
    },
}

/// Full book state at a sequence number
#[derive(Debug, Clone, Default)]
pub struct BookSnapshot {
    pub sequence: u64,
    pub items: Vec<OrderBookItem>,
}

/// Where fresh snapshots come from during a resync
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &Symbol) -> ConnectivityResult<BookSnapshot>;
}

/// REST depth endpoint returning `{"lastUpdateId", "bids", "asks"}`
pub struct RestSnapshotSource {
    client: reqwest::Client,
    url_template: String,
}

#[derive(Deserialize)]
struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

impl RestSnapshotSource {
    /// `url_template` contains `{symbol}`, e.g.
    /// `https://api.binance.com/api/v3/depth?symbol={symbol}&limit=1000`
    pub fn new(url_template: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url_template)
    }

    pub fn with_client(client: reqwest::Client, url_template: impl Into<String>) -> Self {
        Self {
            client,
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, symbol: &Symbol) -> String {
        self.url_template.replace("{symbol}", symbol.as_str())
    }

    /// Price levels are keyed by their price text
    pub fn parse(symbol: &Symbol, body: &str) -> ConnectivityResult<BookSnapshot> {
        let depth: DepthResponse = serde_json::from_str(body)?;

        let mut items = Vec::with_capacity(depth.bids.len() + depth.asks.len());
        for (side, levels) in [(Side::Buy, depth.bids), (Side::Sell, depth.asks)] {
            for (price, size) in levels {
                let parsed_price: f64 = price.parse().map_err(|_| {
                    ConnectivityError::Protocol(format!("invalid price '{}' in snapshot", price))
                })?;
                let parsed_size: f64 = size.parse().map_err(|_| {
                    ConnectivityError::Protocol(format!("invalid size '{}' in snapshot", size))
                })?;
                if parsed_size == 0.0 {
                    continue;
                }
                items.push(OrderBookItem::new(
                    price,
                    side,
                    parsed_price,
                    parsed_size,
                    symbol.clone(),
                ));
            }
        }

        Ok(BookSnapshot {
            sequence: depth.last_update_id,
            items,
        })
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch(&self, symbol: &Symbol) -> ConnectivityResult<BookSnapshot> {
        let url = self.url_for(symbol);
        debug!(symbol = %symbol, url = %url, "Fetching book snapshot");
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Self::parse(symbol, &body)
    }
}

/// Counters exposed by [`BookManager::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookStats {
    pub applied: u64,
    pub stale: u64,
    pub gaps: u64,
    pub resyncs: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    stale: AtomicU64,
    gaps: AtomicU64,
    resyncs: AtomicU64,
}

/// Tunables for [`BookManager`]
#[derive(Debug, Clone)]
pub struct BookManagerConfig {
    pub max_buffered: usize,
    pub event_buffer: usize,
    /// Delay before a failed resync is attempted again
    pub retry_delay: Duration,
}

impl Default for BookManagerConfig {
    fn default() -> Self {
        Self {
            max_buffered: DEFAULT_MAX_BUFFERED,
            event_buffer: 1024,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// One [`SequenceGuard`] per instrument plus the resync machinery
pub struct BookManager {
    guards: DashMap<Symbol, Arc<SequenceGuard>>,
    events: broadcast::Sender<BookEvent>,
    resync_tx: mpsc::UnboundedSender<Symbol>,
    resync_rx: Mutex<Option<mpsc::UnboundedReceiver<Symbol>>>,
    config: BookManagerConfig,
    counters: Counters,
}

impl BookManager {
    pub fn new(config: BookManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        Self {
            guards: DashMap::new(),
            events,
            resync_tx,
            resync_rx: Mutex::new(Some(resync_rx)),
            config,
            counters: Counters::default(),
        }
    }

    /// Guard for `symbol`, created empty at sequence zero if unknown
    pub fn track(&self, symbol: Symbol) -> Arc<SequenceGuard> {
        self.guards
            .entry(symbol.clone())
            .or_insert_with(|| {
                Arc::new(SequenceGuard::with_buffer(symbol, self.config.max_buffered))
            })
            .clone()
    }

    /// Start tracking `symbol` from a known snapshot
    pub fn track_with_snapshot(
        &self,
        symbol: Symbol,
        snapshot: BookSnapshot,
    ) -> ConnectivityResult<()> {
        let guard = self.track(symbol);
        guard.install_snapshot(snapshot.sequence, snapshot.items)?;
        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.guards.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Consistent copy of the current book for `symbol`
    pub fn snapshot(&self, symbol: &Symbol) -> Option<Arc<OrderBook>> {
        self.guards.get(symbol).map(|guard| guard.snapshot())
    }

    pub fn is_resyncing(&self, symbol: &Symbol) -> bool {
        self.guards
            .get(symbol)
            .map(|guard| guard.is_resyncing())
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> BookStats {
        BookStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
            resyncs: self.counters.resyncs.load(Ordering::Relaxed),
        }
    }

    /// Apply one sequenced delta.
    ///
    /// Gaps are recovered here and reported as `ApplyOutcome::ResyncStarted`;
    /// only malformed operations come back as errors.
    pub fn apply(&self, sequence: u64, operation: BookOperation) -> ConnectivityResult<ApplyOutcome> {
        let guard = self.track(operation.symbol().clone());

        match guard.apply(sequence, operation.clone()) {
            Ok(outcome) => {
                match outcome {
                    ApplyOutcome::Applied => {
                        self.counters.applied.fetch_add(1, Ordering::Relaxed);
                        let _ = self.events.send(BookEvent::Updated {
                            symbol: guard.symbol().clone(),
                            sequence,
                        });
                    }
                    ApplyOutcome::Stale => {
                        self.counters.stale.fetch_add(1, Ordering::Relaxed);
                    }
                    ApplyOutcome::Buffered | ApplyOutcome::ResyncStarted => {}
                }
                Ok(outcome)
            }
            Err(ConnectivityError::OrderBookInconsistency {
                expected, received, ..
            }) => {
                self.counters.gaps.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %guard.symbol(),
                    expected,
                    received,
                    "Book sequence gap detected, re-syncing"
                );
                self.start_resync(&guard, expected, received);
                guard.apply(sequence, operation)?;
                Ok(ApplyOutcome::ResyncStarted)
            }
            Err(err) => Err(err),
        }
    }

    /// Discard the book for `symbol` and fetch a fresh snapshot
    pub fn request_resync(&self, symbol: &Symbol) {
        let guard = self.track(symbol.clone());
        let expected = guard.last_sequence() + 1;
        self.start_resync(&guard, expected, expected);
    }

    fn start_resync(&self, guard: &SequenceGuard, expected: u64, received: u64) {
        if !guard.begin_resync() {
            return;
        }
        let _ = self.events.send(BookEvent::Resyncing {
            symbol: guard.symbol().clone(),
            expected,
            received,
        });
        if self.resync_tx.send(guard.symbol().clone()).is_err() {
            warn!(symbol = %guard.symbol(), "Resync worker is gone; book stays empty");
        }
    }

    /// Spawn the task serving resync requests.
    ///
    /// Only one worker can exist per manager; later calls return `None`.
    /// The worker stops once the manager is dropped.
    pub fn spawn_resync_worker(self: &Arc<Self>, source: Arc<dyn SnapshotSource>) -> Option<JoinHandle<()>> {
        let mut requests = self.resync_rx.lock().take()?;
        let weak: Weak<BookManager> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(symbol) = requests.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.resync(symbol, source.as_ref()).await;
            }
            debug!("Resync worker stopped");
        }))
    }

    async fn resync(self: Arc<Self>, symbol: Symbol, source: &dyn SnapshotSource) {
        let Some(guard) = self.guards.get(&symbol).map(|g| g.clone()) else {
            return;
        };

        let failure = match source.fetch(&symbol).await {
            Ok(snapshot) => match guard.install_snapshot(snapshot.sequence, snapshot.items) {
                Ok(report) => {
                    self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
                    info!(
                        symbol = %symbol,
                        sequence = report.sequence,
                        replayed = report.replayed,
                        stale = report.stale,
                        "Book re-synced from snapshot"
                    );
                    let _ = self.events.send(BookEvent::Resynced {
                        symbol,
                        sequence: report.sequence,
                        replayed: report.replayed,
                    });
                    return;
                }
                Err(err) => err,
            },
            Err(err) => err,
        };

        warn!(symbol = %symbol, error = %failure, "Book resync failed, retrying");
        let _ = self.events.send(BookEvent::ResyncFailed {
            symbol: symbol.clone(),
            reason: failure.to_string(),
        });

        // guard is back in (or still in) the buffering state; queue another attempt
        let delay = self.config.retry_delay;
        let retry = self.resync_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry.send(symbol);
        });
    }
}

impl Default for BookManager {
    fn default() -> Self {
        Self::new(BookManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::timeout;

    fn btc() -> Symbol {
        Symbol::new("BTC-USD")
    }

    fn bid(id: &str, price: f64) -> BookOperation {
        BookOperation::Insert(OrderBookItem::new(id, Side::Buy, price, 1.0, btc()))
    }

    /// Hands out queued snapshots, then fails
    struct ScriptedSource {
        snapshots: Mutex<VecDeque<ConnectivityResult<BookSnapshot>>>,
    }

    impl ScriptedSource {
        fn new(snapshots: Vec<ConnectivityResult<BookSnapshot>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self, _symbol: &Symbol) -> ConnectivityResult<BookSnapshot> {
            self.snapshots
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ConnectivityError::Transport("no snapshot".into())))
        }
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<BookEvent>,
        pred: impl Fn(&BookEvent) -> bool,
    ) -> BookEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received")
    }

    #[test]
    fn test_apply_in_order() {
        let manager = BookManager::default();
        assert_eq!(manager.apply(1, bid("1", 10.0)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(manager.apply(1, bid("1", 10.0)).unwrap(), ApplyOutcome::Stale);
        assert_eq!(manager.apply(2, bid("2", 11.0)).unwrap(), ApplyOutcome::Applied);

        let book = manager.snapshot(&btc()).unwrap();
        assert_eq!(book.best_bid().unwrap().id, "2");
        assert_eq!(
            manager.stats(),
            BookStats {
                applied: 2,
                stale: 1,
                gaps: 0,
                resyncs: 0
            }
        );
    }

    #[tokio::test]
    async fn test_gap_triggers_resync_and_replay() {
        let manager = Arc::new(BookManager::default());
        let mut events = manager.subscribe();

        manager.apply(1, bid("1", 10.0)).unwrap();
        manager.apply(2, bid("2", 11.0)).unwrap();
        assert_eq!(manager.apply(5, bid("5", 12.0)).unwrap(), ApplyOutcome::ResyncStarted);
        assert!(manager.is_resyncing(&btc()));
        assert!(manager.snapshot(&btc()).unwrap().is_empty());
        assert_eq!(manager.apply(6, bid("6", 13.0)).unwrap(), ApplyOutcome::Buffered);

        let resyncing = next_matching(&mut events, |e| matches!(e, BookEvent::Resyncing { .. })).await;
        assert_eq!(
            resyncing,
            BookEvent::Resyncing {
                symbol: btc(),
                expected: 3,
                received: 5
            }
        );

        let snapshot = BookSnapshot {
            sequence: 4,
            items: vec![OrderBookItem::new("s", Side::Sell, 20.0, 2.0, btc())],
        };
        let source = Arc::new(ScriptedSource::new(vec![Ok(snapshot)]));
        let worker = manager.spawn_resync_worker(source.clone()).unwrap();
        assert!(manager.spawn_resync_worker(source).is_none());

        let resynced = next_matching(&mut events, |e| matches!(e, BookEvent::Resynced { .. })).await;
        assert_eq!(
            resynced,
            BookEvent::Resynced {
                symbol: btc(),
                sequence: 4,
                replayed: 2
            }
        );

        let book = manager.snapshot(&btc()).unwrap();
        assert_eq!(book.last_sequence(), 6);
        assert_eq!(book.best_bid().unwrap().id, "6");
        assert_eq!(book.best_ask().unwrap().id, "s");
        assert_eq!(manager.stats().gaps, 1);
        assert_eq!(manager.stats().resyncs, 1);

        drop(manager);
        timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried() {
        let manager = Arc::new(BookManager::new(BookManagerConfig {
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        }));
        let mut events = manager.subscribe();

        let source = Arc::new(ScriptedSource::new(vec![
            Err(ConnectivityError::Transport("503".into())),
            Ok(BookSnapshot {
                sequence: 10,
                items: vec![],
            }),
        ]));
        manager.spawn_resync_worker(source).unwrap();
        manager.request_resync(&btc());

        let failed = next_matching(&mut events, |e| matches!(e, BookEvent::ResyncFailed { .. })).await;
        assert!(matches!(failed, BookEvent::ResyncFailed { reason, .. } if reason.contains("503")));

        next_matching(&mut events, |e| matches!(e, BookEvent::Resynced { .. })).await;
        assert_eq!(manager.snapshot(&btc()).unwrap().last_sequence(), 10);
        assert!(!manager.is_resyncing(&btc()));
    }

    #[test]
    fn test_track_with_snapshot() {
        let manager = BookManager::default();
        manager
            .track_with_snapshot(
                btc(),
                BookSnapshot {
                    sequence: 41,
                    items: vec![OrderBookItem::new("a", Side::Sell, 5.0, 1.0, btc())],
                },
            )
            .unwrap();

        assert_eq!(manager.apply(42, bid("b", 4.0)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(manager.snapshot(&btc()).unwrap().mid_price(), Some(4.5));
        assert_eq!(manager.symbols(), vec![btc()]);
    }

    #[test]
    fn test_parse_rest_depth_snapshot() {
        let body = r#"{
            "lastUpdateId": 1027024,
            "bids": [["4.00000000", "431.00000000"], ["3.90000000", "0.00000000"]],
            "asks": [["4.00000200", "12.00000000"]]
        }"#;
        let snapshot = RestSnapshotSource::parse(&btc(), body).unwrap();
        assert_eq!(snapshot.sequence, 1027024);
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.items[0].id, "4.00000000");
        assert_eq!(snapshot.items[0].side, Side::Buy);
        assert_eq!(snapshot.items[1].size, 12.0);

        assert!(RestSnapshotSource::parse(&btc(), r#"{"lastUpdateId":1,"bids":[["x","1"]],"asks":[]}"#).is_err());
        let source = RestSnapshotSource::new("https://example.test/depth?symbol={symbol}");
        assert_eq!(source.url_for(&btc()), "https://example.test/depth?symbol=BTC-USD");
    }
}
