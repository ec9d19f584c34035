//! In-process transport
//!
//! [`MemoryTransport`] is the client side handed to a session;
//! [`MemoryVenue`] is the other end, accepting one [`VenueConnection`]
//! per successful connect. Tests drive the venue by hand, the simulated
//! venue drives it with canned replies.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{FrameSink, FrameStream, Transport};
use crate::error::{ConnectivityError, ConnectivityResult};

#[derive(Default)]
struct Control {
    fail_next: Mutex<Option<String>>,
}

/// Client side of an in-process connection
#[derive(Clone)]
pub struct MemoryTransport {
    accepts: mpsc::UnboundedSender<VenueConnection>,
    control: Arc<Control>,
}

/// Venue side: yields one connection per successful client connect
pub struct MemoryVenue {
    accepts: mpsc::UnboundedReceiver<VenueConnection>,
    control: Arc<Control>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryVenue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(Control::default());
        (
            Self {
                accepts: tx,
                control: control.clone(),
            },
            MemoryVenue {
                accepts: rx,
                control,
            },
        )
    }

    /// Make the next `connect` fail with `reason`
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        *self.control.fail_next.lock() = Some(reason.into());
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> ConnectivityResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        if let Some(reason) = self.control.fail_next.lock().take() {
            return Err(ConnectivityError::NotConnected(reason));
        }

        let (to_venue, from_client) = mpsc::unbounded_channel();
        let (to_client, from_venue) = mpsc::unbounded_channel();
        self.accepts
            .send(VenueConnection {
                inbound: from_client,
                outbound: Some(to_client),
            })
            .map_err(|_| ConnectivityError::NotConnected("venue is not listening".into()))?;

        let sink: Box<dyn FrameSink> = Box::new(MemorySink {
            outbound: Some(to_venue),
        });
        let frames: Box<dyn FrameStream> = Box::new(MemoryFrames { inbound: from_venue });
        Ok((sink, frames))
    }
}

impl MemoryVenue {
    /// Next connection opened by the client; `None` once the transport is gone
    pub async fn accept(&mut self) -> Option<VenueConnection> {
        self.accepts.recv().await
    }

    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        *self.control.fail_next.lock() = Some(reason.into());
    }
}

/// One open connection as seen by the venue
pub struct VenueConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<ConnectivityResult<String>>>,
}

impl VenueConnection {
    /// Next frame sent by the client; `None` after the client closed
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Deliver a frame to the client; false if the connection is gone
    pub fn send(&self, frame: impl Into<String>) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Break the connection with a transport error on the client side
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Err(ConnectivityError::Transport(reason.into())));
        }
    }

    /// Close from the venue side; the client sees end of stream
    pub fn close(&mut self) {
        self.outbound = None;
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> ConnectivityResult<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| ConnectivityError::NotConnected("connection closed".into()))?;
        tx.send(frame)
            .map_err(|_| ConnectivityError::Transport("venue dropped the connection".into()))
    }

    async fn close(&mut self) -> ConnectivityResult<()> {
        self.outbound = None;
        Ok(())
    }
}

struct MemoryFrames {
    inbound: mpsc::UnboundedReceiver<ConnectivityResult<String>>,
}

#[async_trait]
impl FrameStream for MemoryFrames {
    async fn next_frame(&mut self) -> Option<ConnectivityResult<String>> {
        self.inbound.recv().await
    }
}
