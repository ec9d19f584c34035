//! Market data incremental refresh adapter

use std::sync::Arc;
use tracing::warn;

use super::book::{BookKey, BookOperation, OrderBookItem};
use super::manager::BookManager;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::message::{msg_type, tag, Envelope, InboundHandler};
use crate::types::{Side, Symbol};

/// Feeds `MarketDataIncrementalRefresh` messages into a [`BookManager`].
///
/// Each message carries one entry: `RptSeq(83)`, `MDUpdateAction(279)`
/// (0 new, 1 change, 2 delete), `MDEntryType(269)` (0 bid, 1 offer),
/// `MDEntryID(278)`, `MDEntryPx(270)`, `MDEntrySize(271)` and `Symbol(55)`.
pub struct BookFeed {
    books: Arc<BookManager>,
}

impl BookFeed {
    pub fn new(books: Arc<BookManager>) -> Self {
        Self { books }
    }

    pub fn books(&self) -> &Arc<BookManager> {
        &self.books
    }

    /// Sequence number and operation carried by an incremental refresh
    pub fn parse(message: &Envelope) -> ConnectivityResult<(u64, BookOperation)> {
        let sequence = message.require_u64(tag::RPT_SEQ)?;
        let symbol = Symbol::new(message.require(tag::SYMBOL)?);
        let id = message.require(tag::MD_ENTRY_ID)?;

        let side = match message.require(tag::MD_ENTRY_TYPE)? {
            "0" => Side::Buy,
            "1" => Side::Sell,
            other => {
                return Err(ConnectivityError::Protocol(format!(
                    "unsupported MDEntryType {}",
                    other
                )))
            }
        };

        let operation = match message.require(tag::MD_UPDATE_ACTION)? {
            "2" => BookOperation::Delete(BookKey::new(id, side, symbol)),
            action @ ("0" | "1") => {
                let item = OrderBookItem::new(
                    id,
                    side,
                    message.require_f64(tag::MD_ENTRY_PX)?,
                    message.require_f64(tag::MD_ENTRY_SIZE)?,
                    symbol,
                );
                if action == "0" {
                    BookOperation::Insert(item)
                } else {
                    BookOperation::Update(item)
                }
            }
            other => {
                return Err(ConnectivityError::Protocol(format!(
                    "unsupported MDUpdateAction {}",
                    other
                )))
            }
        };

        Ok((sequence, operation))
    }
}

impl InboundHandler<Envelope> for BookFeed {
    fn handle(&self, message: &Envelope) -> bool {
        if message.msg_type != msg_type::MARKET_DATA_INCREMENTAL {
            return false;
        }

        let result = Self::parse(message).and_then(|(sequence, operation)| {
            self.books.apply(sequence, operation)
        });
        if let Err(err) = result {
            warn!(error = %err, "Dropping market data message");
        }
        true
    }
}
