//! Sequence validation in front of an order book

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

use super::book::{BookOperation, OrderBook, OrderBookItem};
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::types::Symbol;

/// Maximum number of deltas held while waiting for a snapshot
pub const DEFAULT_MAX_BUFFERED: usize = 1000;

/// What happened to a delta handed to the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Sequence number at or below the baseline; dropped
    Stale,
    /// Held until the next snapshot is installed
    Buffered,
    /// A gap was found; the book was discarded and a snapshot requested
    ResyncStarted,
}

/// Result of installing a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResyncReport {
    pub sequence: u64,
    pub replayed: usize,
    pub stale: usize,
}

enum SyncState {
    Synced,
    Resyncing { buffer: VecDeque<(u64, BookOperation)> },
}

/// Order book plus the sequence number of the last applied delta.
///
/// The book lives behind an `Arc` that readers clone out of the lock, so a
/// reader always holds a complete book. Writers mutate through
/// `Arc::make_mut`, which copies the book only while a reader still holds
/// the previous version; a resync swaps in a new `Arc`.
pub struct SequenceGuard {
    symbol: Symbol,
    book: RwLock<Arc<OrderBook>>,
    state: Mutex<SyncState>,
    max_buffered: usize,
}

impl SequenceGuard {
    /// Empty book at sequence zero; the first expected delta is 1
    pub fn new(symbol: Symbol) -> Self {
        Self::with_buffer(symbol, DEFAULT_MAX_BUFFERED)
    }

    pub fn with_buffer(symbol: Symbol, max_buffered: usize) -> Self {
        Self {
            book: RwLock::new(Arc::new(OrderBook::new(symbol.clone()))),
            symbol,
            state: Mutex::new(SyncState::Synced),
            max_buffered: max_buffered.max(1),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Consistent copy of the current book
    pub fn snapshot(&self) -> Arc<OrderBook> {
        self.book.read().clone()
    }

    pub fn last_sequence(&self) -> u64 {
        self.book.read().last_sequence()
    }

    pub fn is_resyncing(&self) -> bool {
        matches!(*self.state.lock(), SyncState::Resyncing { .. })
    }

    pub fn buffered(&self) -> usize {
        match &*self.state.lock() {
            SyncState::Resyncing { buffer } => buffer.len(),
            SyncState::Synced => 0,
        }
    }

    /// Validate `sequence` and apply `operation`.
    ///
    /// At or below the last applied sequence the delta is stale and
    /// dropped. Exactly one above it is applied. Anything further ahead
    /// fails with `OrderBookInconsistency` and leaves the book untouched.
    /// While resyncing, deltas are buffered instead.
    pub fn apply(&self, sequence: u64, operation: BookOperation) -> ConnectivityResult<ApplyOutcome> {
        let mut state = self.state.lock();
        if let SyncState::Resyncing { buffer } = &mut *state {
            if buffer.len() >= self.max_buffered {
                buffer.pop_front();
            }
            buffer.push_back((sequence, operation));
            return Ok(ApplyOutcome::Buffered);
        }
        self.apply_in_order(sequence, operation)
    }

    fn apply_in_order(&self, sequence: u64, operation: BookOperation) -> ConnectivityResult<ApplyOutcome> {
        let mut slot = self.book.write();
        let last = slot.last_sequence();

        if sequence <= last {
            return Ok(ApplyOutcome::Stale);
        }
        if sequence != last + 1 {
            return Err(ConnectivityError::OrderBookInconsistency {
                symbol: self.symbol.to_string(),
                expected: last + 1,
                received: sequence,
            });
        }

        // validate against the current version before paying for a copy
        if operation.symbol() != &self.symbol {
            return Err(ConnectivityError::Protocol(format!(
                "operation for {} applied to {} book",
                operation.symbol(),
                self.symbol
            )));
        }

        let book = Arc::make_mut(&mut slot);
        book.apply(operation)?;
        book.mark_applied(sequence);
        Ok(ApplyOutcome::Applied)
    }

    /// Discard the ladders and hold deltas until a snapshot arrives.
    ///
    /// Returns false if a resync was already in progress.
    pub fn begin_resync(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SyncState::Resyncing { .. }) {
            return false;
        }
        *state = SyncState::Resyncing {
            buffer: VecDeque::new(),
        };
        *self.book.write() = Arc::new(OrderBook::new(self.symbol.clone()));
        true
    }

    /// Replace the whole book and its baseline sequence in one swap, then
    /// replay buffered deltas newer than the snapshot.
    ///
    /// If the buffered deltas still leave a gap the guard goes back to
    /// resyncing with the remaining deltas and the gap error is returned.
    pub fn install_snapshot(
        &self,
        sequence: u64,
        items: Vec<OrderBookItem>,
    ) -> ConnectivityResult<ResyncReport> {
        let fresh = OrderBook::from_snapshot(self.symbol.clone(), sequence, items)?;

        let mut state = self.state.lock();
        *self.book.write() = Arc::new(fresh);

        let mut pending: Vec<(u64, BookOperation)> =
            match std::mem::replace(&mut *state, SyncState::Synced) {
                SyncState::Resyncing { buffer } => buffer.into_iter().collect(),
                SyncState::Synced => Vec::new(),
            };
        pending.sort_by_key(|(seq, _)| *seq);

        let mut report = ResyncReport {
            sequence,
            ..Default::default()
        };
        let mut remaining = pending.into_iter();
        while let Some((seq, operation)) = remaining.next() {
            match self.apply_in_order(seq, operation.clone()) {
                Ok(ApplyOutcome::Applied) => report.replayed += 1,
                Ok(_) => report.stale += 1,
                Err(err) => {
                    let mut buffer: VecDeque<(u64, BookOperation)> = VecDeque::new();
                    buffer.push_back((seq, operation));
                    buffer.extend(remaining);
                    *state = SyncState::Resyncing { buffer };
                    *self.book.write() = Arc::new(OrderBook::new(self.symbol.clone()));
                    return Err(err);
                }
            }
        }

        Ok(report)
    }
}
