//! Scripted in-process venue speaking JSON envelopes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::memory::{MemoryVenue, VenueConnection};
use crate::message::{msg_type, tag, Envelope};
use crate::types::{Position, Symbol};

/// Accounts that always get an insufficient funds reject
pub const UNFUNDED_ACCOUNT: &str = "UNFUNDED";

/// Venue that acknowledges orders and cancels, reports fixed positions and
/// optionally streams a synthetic incremental book per symbol.
#[derive(Clone, Default)]
pub struct SimulatedVenue {
    positions: Vec<Position>,
    book_symbols: Vec<Symbol>,
    book_interval: Option<Duration>,
    order_ids: Arc<AtomicU64>,
}

impl SimulatedVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.push(position);
        self
    }

    pub fn with_market_data(mut self, symbols: Vec<Symbol>, every: Duration) -> Self {
        self.book_symbols = symbols;
        self.book_interval = Some(every);
        self
    }

    /// Serve every connection accepted by `venue`
    pub fn spawn(self, mut venue: MemoryVenue) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(connection) = venue.accept().await {
                info!("Simulated venue accepted a connection");
                tokio::spawn(self.clone().serve(connection));
            }
            debug!("Simulated venue stopped");
        })
    }

    async fn serve(self, mut connection: VenueConnection) {
        let mut ticker: Option<Interval> = self.book_interval.map(|every| {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut book_seq = 0u64;

        loop {
            tokio::select! {
                frame = connection.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let request: Envelope = match serde_json::from_str(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "Simulated venue received an undecodable frame");
                            continue;
                        }
                    };
                    for reply in self.replies_to(&request) {
                        if let Ok(frame) = serde_json::to_string(&reply) {
                            connection.send(frame);
                        }
                    }
                }
                _ = tick(&mut ticker) => {
                    book_seq += 1;
                    for (i, symbol) in self.book_symbols.iter().enumerate() {
                        let update = book_update(symbol, book_seq, i);
                        if let Ok(frame) = serde_json::to_string(&update) {
                            connection.send(frame);
                        }
                    }
                }
            }
        }
    }

    /// Replies the venue sends for one inbound message
    pub fn replies_to(&self, request: &Envelope) -> Vec<Envelope> {
        let correlation_id = request.correlation_id.clone().unwrap_or_default();
        let reply = |kind: &str| Envelope::new(kind).with_correlation_id(correlation_id.clone());

        match request.msg_type.as_str() {
            msg_type::NEW_ORDER_SINGLE => {
                let quantity = request.field(tag::ORDER_QTY).and_then(|q| q.parse::<f64>().ok());
                let report = reply(msg_type::EXECUTION_REPORT)
                    .with_field(tag::SYMBOL, request.field(tag::SYMBOL).unwrap_or_default())
                    .with_field(tag::CUM_QTY, 0);

                if request.field(tag::ACCOUNT) == Some(UNFUNDED_ACCOUNT) {
                    return vec![report
                        .with_field(tag::ORD_STATUS, "8")
                        .with_text("Insufficient funds")];
                }
                match quantity {
                    Some(q) if q > 0.0 => {
                        let id = self.order_ids.fetch_add(1, Ordering::Relaxed) + 1;
                        vec![report
                            .with_field(tag::ORDER_ID, format!("SIM-{}", id))
                            .with_field(tag::ORD_STATUS, "0")]
                    }
                    _ => vec![report
                        .with_field(tag::ORD_STATUS, "8")
                        .with_text("Invalid order quantity")],
                }
            }
            msg_type::ORDER_CANCEL_REQUEST => match request.field(tag::ORDER_ID) {
                Some(order_id) if order_id.starts_with("SIM-") => vec![reply(msg_type::EXECUTION_REPORT)
                    .with_field(tag::ORDER_ID, order_id)
                    .with_field(tag::ORIG_CL_ORD_ID, request.field(tag::ORIG_CL_ORD_ID).unwrap_or_default())
                    .with_field(tag::ORD_STATUS, "4")],
                _ => vec![reply(msg_type::ORDER_CANCEL_REJECT).with_text("Unknown order")],
            },
            msg_type::REQUEST_FOR_POSITIONS => {
                if self.positions.is_empty() {
                    return vec![reply(msg_type::REQUEST_FOR_POSITIONS_ACK).with_total(0)];
                }
                let total = self.positions.len();
                self.positions
                    .iter()
                    .map(|position| {
                        let mut report = reply(msg_type::POSITION_REPORT)
                            .with_total(total)
                            .with_field(tag::SYMBOL, &position.symbol)
                            .with_field(tag::LONG_QTY, position.long_quantity)
                            .with_field(tag::SHORT_QTY, position.short_quantity);
                        if let Some(account) = &position.account {
                            report = report.with_field(tag::ACCOUNT, account);
                        }
                        if let Some(price) = position.average_price {
                            report = report.with_field(tag::SETTL_PRICE, price);
                        }
                        report
                    })
                    .collect()
            }
            msg_type::HEARTBEAT | msg_type::TEST_REQUEST | msg_type::LOGON | msg_type::LOGOUT => Vec::new(),
            other => vec![reply(msg_type::BUSINESS_REJECT)
                .with_text(format!("Unsupported message type {}", other))],
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Four entries per symbol: two bids, two asks. The first round inserts,
/// later rounds resize.
fn book_update(symbol: &Symbol, seq: u64, symbol_index: usize) -> Envelope {
    let slot = (seq - 1) % 4;
    let (entry_type, price) = match slot {
        0 => ("0", 100.0),
        1 => ("1", 101.0),
        2 => ("0", 99.5),
        _ => ("1", 101.5),
    };
    let action = if seq <= 4 { "0" } else { "1" };
    let size = 1.0 + ((seq + symbol_index as u64) % 7) as f64;

    Envelope::new(msg_type::MARKET_DATA_INCREMENTAL)
        .with_field(tag::RPT_SEQ, seq)
        .with_field(tag::SYMBOL, symbol)
        .with_field(tag::MD_UPDATE_ACTION, action)
        .with_field(tag::MD_ENTRY_TYPE, entry_type)
        .with_field(tag::MD_ENTRY_ID, format!("{}-{}", entry_type, slot))
        .with_field(tag::MD_ENTRY_PX, price)
        .with_field(tag::MD_ENTRY_SIZE, size)
}
