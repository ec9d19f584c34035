//! Physical transports carrying text frames
//!
//! A transport only moves frames. Encoding lives in [`crate::codec`] and
//! correlation in [`crate::correlation`], so FIX over TCP, JSON over
//! WebSocket, HTTP request/response and the in-process venue all look the
//! same to a session.

use async_trait::async_trait;

use crate::error::ConnectivityResult;

pub mod http;
pub mod memory;
pub mod simulated;
pub mod tcp;
pub mod websocket;

pub use http::{HttpMethod, HttpRoute, HttpTransport};
pub use memory::{MemoryTransport, MemoryVenue, VenueConnection};
pub use simulated::{SimulatedVenue, UNFUNDED_ACCOUNT};
pub use tcp::FixTcpTransport;
pub use websocket::WebSocketTransport;

/// Outbound half of an open connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> ConnectivityResult<()>;

    async fn close(&mut self) -> ConnectivityResult<()>;
}

/// Inbound half of an open connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; `None` once the peer closed the connection.
    ///
    /// `ConnectivityError::Protocol` reports one malformed frame that was
    /// skipped; the stream stays usable. Any other error ends it.
    async fn next_frame(&mut self) -> Option<ConnectivityResult<String>>;
}

/// Opens connections to one venue endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> ConnectivityResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}
