//! Order book reconstruction from sequenced deltas

pub mod book;
pub mod feed;
pub mod guard;
pub mod manager;

pub use book::{BookKey, BookOperation, Ladder, OrderBook, OrderBookItem};
pub use feed::BookFeed;
pub use guard::{ApplyOutcome, ResyncReport, SequenceGuard};
pub use manager::{
    BookEvent, BookManager, BookManagerConfig, BookSnapshot, BookStats, RestSnapshotSource,
    SnapshotSource,
};
