//! WebSocket transport

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::{FrameSink, FrameStream, Transport};
use crate::error::{ConnectivityError, ConnectivityResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Text-frame WebSocket client
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> ConnectivityResult<Self> {
        let url = Url::parse(url).map_err(|e| {
            ConnectivityError::Transport(format!("Invalid WebSocket URL: {}", e))
        })?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self) -> ConnectivityResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (ws_stream, _) = connect_async(self.url.clone()).await.map_err(|e| {
            ConnectivityError::NotConnected(format!("WebSocket connection failed: {}", e))
        })?;
        info!(url = %self.url, "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        let sink: Box<dyn FrameSink> = Box::new(WsSink { sink });
        let frames: Box<dyn FrameStream> = Box::new(WsFrames { stream });
        Ok((sink, frames))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> ConnectivityResult<()> {
        self.sink.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> ConnectivityResult<()> {
        self.sink.send(Message::Close(None)).await?;
        self.sink.close().await?;
        Ok(())
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<ConnectivityResult<String>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        ConnectivityError::Protocol(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Message::Close(frame) => {
                    info!("WebSocket close frame: {:?}", frame);
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    debug!("Received control frame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::connection::{ManagedSession, SessionLink, StateHandle};
    use crate::message::{msg_type, Envelope};
    use crate::session::SessionConnector;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_non_utf8_binary_frame_is_skipped_by_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
            let heartbeat = serde_json::to_string(&Envelope::new(msg_type::HEARTBEAT)).unwrap();
            ws.send(Message::Text(heartbeat)).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let session = SessionConnector::<Envelope>::new(
            "ws",
            Arc::new(WebSocketTransport::new(&url).unwrap()),
            Arc::new(JsonCodec),
        );
        let (faults_tx, mut faults) = mpsc::unbounded_channel();
        session.attach(SessionLink {
            state: StateHandle::new("ws", 16),
            faults: faults_tx,
        });
        session.open().await.unwrap();

        timeout(Duration::from_secs(5), async {
            while session.stats().unrouted < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("text frame never routed");

        let stats = session.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.frames_in, 2);
        assert!(session.is_open());
        assert!(faults.try_recv().is_err());
        session.close().await.unwrap();
    }

    #[test]
    fn test_url_validation() {
        let transport = WebSocketTransport::new("wss://stream.example.test/ws").unwrap();
        assert_eq!(transport.url().scheme(), "wss");
        assert_eq!(transport.kind(), "websocket");

        assert!(matches!(
            WebSocketTransport::new("not a url"),
            Err(ConnectivityError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_not_connected() {
        // port 9 on localhost is closed in test environments
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws").unwrap();
        assert!(matches!(
            transport.connect().await,
            Err(ConnectivityError::NotConnected(_))
        ));
    }
}
