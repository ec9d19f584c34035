//! Order book ladders

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::types::{Side, Symbol};

/// One order or price level on one side of a book
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBookItem {
    pub id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub symbol: Symbol,
}

impl OrderBookItem {
    pub fn new(id: impl Into<String>, side: Side, price: f64, size: f64, symbol: Symbol) -> Self {
        Self {
            id: id.into(),
            side,
            price,
            size,
            symbol,
        }
    }

    pub fn key(&self) -> BookKey {
        BookKey {
            id: self.id.clone(),
            side: self.side,
            symbol: self.symbol.clone(),
        }
    }
}

/// Identity of a book entry. Price and size do not take part.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookKey {
    pub id: String,
    pub side: Side,
    pub symbol: Symbol,
}

impl BookKey {
    pub fn new(id: impl Into<String>, side: Side, symbol: Symbol) -> Self {
        Self {
            id: id.into(),
            side,
            symbol,
        }
    }
}

/// Incremental book operation
#[derive(Clone, Debug, PartialEq)]
pub enum BookOperation {
    Insert(OrderBookItem),
    Update(OrderBookItem),
    Delete(BookKey),
}

impl BookOperation {
    pub fn symbol(&self) -> &Symbol {
        match self {
            Self::Insert(item) | Self::Update(item) => &item.symbol,
            Self::Delete(key) => &key.symbol,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            Self::Insert(item) | Self::Update(item) => item.side,
            Self::Delete(key) => key.side,
        }
    }
}

/// One side of the book, best price first.
///
/// Entries are ranked by `(rank price, id)` where the rank price is the
/// negated price on the bid side, so iteration order is always best first.
#[derive(Clone, Debug)]
pub struct Ladder {
    side: Side,
    entries: BTreeMap<(OrderedFloat<f64>, String), OrderBookItem>,
    index: HashMap<String, OrderedFloat<f64>>,
}

impl Ladder {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn rank(&self, price: f64) -> OrderedFloat<f64> {
        match self.side {
            Side::Buy => OrderedFloat(-price),
            Side::Sell => OrderedFloat(price),
        }
    }

    /// Insert or replace the entry with the same id
    pub fn upsert(&mut self, item: OrderBookItem) {
        if let Some(previous) = self.index.remove(&item.id) {
            self.entries.remove(&(previous, item.id.clone()));
        }
        let rank = self.rank(item.price);
        self.index.insert(item.id.clone(), rank);
        self.entries.insert((rank, item.id.clone()), item);
    }

    /// Remove by id; returns whether an entry existed
    pub fn remove(&mut self, id: &str) -> bool {
        match self.index.remove(id) {
            Some(rank) => {
                self.entries.remove(&(rank, id.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&OrderBookItem> {
        let rank = self.index.get(id)?;
        self.entries.get(&(*rank, id.to_string()))
    }

    pub fn best(&self) -> Option<&OrderBookItem> {
        self.entries.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderBookItem> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Aggregate size per price, best first, at most `n` prices
    pub fn levels(&self, n: usize) -> Vec<(f64, f64)> {
        let mut levels: Vec<(f64, f64)> = Vec::new();
        for item in self.entries.values() {
            match levels.last_mut() {
                Some((price, size)) if *price == item.price => *size += item.size,
                _ => {
                    if levels.len() == n {
                        break;
                    }
                    levels.push((item.price, item.size));
                }
            }
        }
        levels
    }
}

/// Bid/ask ladders for one instrument
#[derive(Clone, Debug)]
pub struct OrderBook {
    pub symbol: Symbol,
    bids: Ladder,
    asks: Ladder,
    last_sequence: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: Ladder::new(Side::Buy),
            asks: Ladder::new(Side::Sell),
            last_sequence: 0,
            updated_at: None,
        }
    }

    /// Build a book from a full snapshot taken at `sequence`
    pub fn from_snapshot(
        symbol: Symbol,
        sequence: u64,
        items: impl IntoIterator<Item = OrderBookItem>,
    ) -> ConnectivityResult<Self> {
        let mut book = Self::new(symbol);
        for item in items {
            book.apply(BookOperation::Insert(item))?;
        }
        book.last_sequence = sequence;
        book.updated_at = Some(Utc::now());
        Ok(book)
    }

    /// Apply one operation, ignoring sequencing.
    ///
    /// Insert on an existing identity is an upsert, Update of a missing
    /// entry inserts it, an Update to size zero removes the entry and
    /// Delete of a missing entry is a no-op.
    pub fn apply(&mut self, operation: BookOperation) -> ConnectivityResult<()> {
        if operation.symbol() != &self.symbol {
            return Err(ConnectivityError::Protocol(format!(
                "operation for {} applied to {} book",
                operation.symbol(),
                self.symbol
            )));
        }

        match operation {
            BookOperation::Insert(item) => {
                Self::check_item(&item)?;
                self.ladder_mut(item.side).upsert(item);
            }
            BookOperation::Update(item) => {
                Self::check_item(&item)?;
                if item.size == 0.0 {
                    self.ladder_mut(item.side).remove(&item.id);
                } else {
                    self.ladder_mut(item.side).upsert(item);
                }
            }
            BookOperation::Delete(key) => {
                self.ladder_mut(key.side).remove(&key.id);
            }
        }

        Ok(())
    }

    fn check_item(item: &OrderBookItem) -> ConnectivityResult<()> {
        if !item.price.is_finite() || !item.size.is_finite() || item.size < 0.0 {
            return Err(ConnectivityError::Protocol(format!(
                "invalid book entry {}: price {} size {}",
                item.id, item.price, item.size
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_applied(&mut self, sequence: u64) {
        self.last_sequence = sequence;
        self.updated_at = Some(Utc::now());
    }

    fn ladder_mut(&mut self, side: Side) -> &mut Ladder {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn bids(&self) -> &Ladder {
        &self.bids
    }

    pub fn asks(&self) -> &Ladder {
        &self.asks
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn best_bid(&self) -> Option<&OrderBookItem> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<&OrderBookItem> {
        self.asks.best()
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<f64> {
        let best_bid = self.best_bid()?.price;
        let best_ask = self.best_ask()?.price;
        Some((best_bid + best_ask) / 2.0)
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<f64> {
        let best_bid = self.best_bid()?.price;
        let best_ask = self.best_ask()?.price;
        let mid = (best_bid + best_ask) / 2.0;
        Some(((best_ask - best_bid) / mid) * 10000.0)
    }

    /// Get top N price levels per side
    pub fn top_levels(&self, n: usize) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        (self.bids.levels(n), self.asks.levels(n))
    }

    /// Best bid must be below best ask
    pub fn verify_integrity(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price < ask.price,
            _ => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
