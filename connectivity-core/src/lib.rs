//! Exchange Connectivity Core
//!
//! Session lifecycle, request/response correlation, order book sequencing
//! and nonce generation shared by every exchange adapter. Transports (FIX
//! over TCP, WebSocket, HTTP, in-process) only move frames; everything
//! above them is the same for all venues.

pub mod api;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod message;
pub mod nonce;
pub mod orderbook;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for easy access
pub use api::{ExchangeApi, SessionExchange};
pub use config::{ConnectionConfig, TransportConfig};
pub use connection::{ConnectionEvent, ConnectionState, ExchangeConnection};
pub use correlation::{PendingRequest, RequestRegistry, RequestStatus};
pub use error::{ConnectivityError, ConnectivityResult, ErrorKind, RejectKind};
pub use gateway::Gateway;
pub use message::{CorrelatedMessage, Envelope, MessageCategory};
pub use nonce::{NonceGenerator, NonceUnit};
pub use orderbook::{BookEvent, BookManager, OrderBook, SequenceGuard};
pub use session::SessionConnector;
pub use types::{CancelRequest, OrderAck, OrderRequest, OrderStatus, OrderType, Position, Side, Symbol};
