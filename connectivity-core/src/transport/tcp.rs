//! FIX over plain TCP

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::info;

use super::{FrameSink, FrameStream, Transport};
use crate::error::{ConnectivityError, ConnectivityResult};

const TRAILER: &[u8] = b"\x0110=";
const MAX_FRAME_LEN: usize = 64 * 1024;

/// TCP connection carrying SOH-delimited FIX frames
pub struct FixTcpTransport {
    addr: String,
}

impl FixTcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for FixTcpTransport {
    fn kind(&self) -> &'static str {
        "fix-tcp"
    }

    async fn connect(&self) -> ConnectivityResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            ConnectivityError::NotConnected(format!("FIX connect to {} failed: {}", self.addr, e))
        })?;
        stream.set_nodelay(true)?;
        info!(addr = %self.addr, "FIX TCP connected");

        let (read, write) = stream.into_split();
        let sink: Box<dyn FrameSink> = Box::new(TcpSink { write });
        let frames: Box<dyn FrameStream> = Box::new(TcpFrames {
            read,
            buffer: Vec::with_capacity(4096),
            discarding: false,
        });
        Ok((sink, frames))
    }
}

struct TcpSink {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: String) -> ConnectivityResult<()> {
        self.write.write_all(frame.as_bytes()).await?;
        Ok(())
    }

    async fn close(&mut self) -> ConnectivityResult<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}

struct TcpFrames {
    read: OwnedReadHalf,
    buffer: Vec<u8>,
    /// Dropping the rest of an oversized frame up to its trailer
    discarding: bool,
}

/// Length of the first complete frame in `buffer`, if any.
///
/// A frame ends after the checksum field: `<SOH>10=` followed by three
/// digits and a closing SOH.
pub(crate) fn complete_frame_len(buffer: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = buffer[from..]
        .windows(TRAILER.len())
        .position(|w| w == TRAILER)
        .map(|p| p + from)
    {
        let digits = pos + TRAILER.len();
        let end = digits + 3;
        if buffer.len() <= end {
            return None;
        }
        if buffer[digits..end].iter().all(u8::is_ascii_digit) && buffer[end] == 0x01 {
            return Some(end + 1);
        }
        from = pos + 1;
    }
    None
}

#[async_trait]
impl FrameStream for TcpFrames {
    async fn next_frame(&mut self) -> Option<ConnectivityResult<String>> {
        loop {
            if self.discarding {
                match complete_frame_len(&self.buffer) {
                    Some(len) => {
                        self.buffer.drain(..len);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        // keep enough bytes to spot a trailer split across reads
                        let keep = self.buffer.len().min(TRAILER.len() + 4);
                        self.buffer.drain(..self.buffer.len() - keep);
                    }
                }
            } else if let Some(len) = complete_frame_len(&self.buffer) {
                let frame: Vec<u8> = self.buffer.drain(..len).collect();
                return Some(String::from_utf8(frame).map_err(|e| {
                    ConnectivityError::Protocol(format!("FIX frame is not UTF-8: {}", e))
                }));
            } else if self.buffer.len() > MAX_FRAME_LEN {
                self.buffer.clear();
                self.discarding = true;
                return Some(Err(ConnectivityError::Protocol(
                    "FIX frame exceeds maximum length".into(),
                )));
            }

            let mut chunk = [0u8; 4096];
            match self.read.read(&mut chunk).await {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FixCodec;
    use crate::connection::{ManagedSession, SessionFault, SessionLink, StateHandle};
    use crate::message::Envelope;
    use crate::session::SessionConnector;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const HEARTBEAT: &str = "8=FIX.4.4\x019=5\x0135=0\x0110=163\x01";

    /// FIX session connected to a listener that writes `bytes` and keeps
    /// the socket open until the client goes away
    async fn session_fed_with(
        bytes: Vec<u8>,
    ) -> (SessionConnector<Envelope>, mpsc::UnboundedReceiver<SessionFault>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&bytes).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let session = SessionConnector::<Envelope>::new(
            "fix",
            Arc::new(FixTcpTransport::new(addr)),
            Arc::new(FixCodec::default()),
        );
        let (faults_tx, faults) = mpsc::unbounded_channel();
        session.attach(SessionLink {
            state: StateHandle::new("fix", 16),
            faults: faults_tx,
        });
        session.open().await.unwrap();
        (session, faults)
    }

    async fn wait_for_unrouted(session: &SessionConnector<Envelope>, count: u64) {
        timeout(Duration::from_secs(5), async {
            while session.stats().unrouted < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("valid frame never routed");
    }

    #[tokio::test]
    async fn test_non_utf8_frame_is_skipped_by_session() {
        let mut bytes = b"8=FIX.4.4\x019=14\x0135=0\x0158=caf\xe9\x0110=000\x01".to_vec();
        bytes.extend_from_slice(HEARTBEAT.as_bytes());
        let (session, mut faults) = session_fed_with(bytes).await;

        wait_for_unrouted(&session, 1).await;
        let stats = session.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.frames_in, 2);
        assert!(session.is_open());
        assert!(faults.try_recv().is_err());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_discarded_up_to_its_trailer() {
        let mut bytes = b"8=FIX.4.4\x019=70005\x0158=".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(MAX_FRAME_LEN + 4_000));
        bytes.extend_from_slice(b"\x0110=000\x01");
        bytes.extend_from_slice(HEARTBEAT.as_bytes());
        let (session, mut faults) = session_fed_with(bytes).await;

        wait_for_unrouted(&session, 1).await;
        let stats = session.stats();
        assert_eq!(stats.decode_errors, 1);
        assert!(session.is_open());
        assert!(faults.try_recv().is_err());
        session.close().await.unwrap();
    }

    #[test]
    fn test_frame_boundaries() {
        assert_eq!(complete_frame_len(HEARTBEAT.as_bytes()), Some(HEARTBEAT.len()));
        assert_eq!(complete_frame_len(&HEARTBEAT.as_bytes()[..HEARTBEAT.len() - 1]), None);

        let two = format!("{}{}", HEARTBEAT, HEARTBEAT);
        assert_eq!(complete_frame_len(two.as_bytes()), Some(HEARTBEAT.len()));

        // a "10=" inside a value that is not a checksum does not end the frame
        let tricky = "8=FIX.4.4\x019=12\x0158=x\x0110=ab\x0110=001\x01";
        assert_eq!(complete_frame_len(tricky.as_bytes()), Some(tricky.len()));
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let bytes = format!("{}{}", HEARTBEAT, HEARTBEAT).into_bytes();
            socket.write_all(&bytes[..10]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            socket.write_all(&bytes[10..]).await.unwrap();

            let mut received = vec![0u8; HEARTBEAT.len()];
            socket.read_exact(&mut received).await.unwrap();
            String::from_utf8(received).unwrap()
        });

        let transport = FixTcpTransport::new(addr);
        let (mut sink, mut frames) = transport.connect().await.unwrap();

        assert_eq!(frames.next_frame().await.unwrap().unwrap(), HEARTBEAT);
        assert_eq!(frames.next_frame().await.unwrap().unwrap(), HEARTBEAT);

        sink.send(HEARTBEAT.to_string()).await.unwrap();
        assert_eq!(server.await.unwrap(), HEARTBEAT);
        assert!(frames.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let transport = FixTcpTransport::new("127.0.0.1:9");
        assert!(matches!(
            transport.connect().await,
            Err(ConnectivityError::NotConnected(_))
        ));
    }
}
