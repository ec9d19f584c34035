//! Assembly of one exchange connection from its configuration

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{
    AuditedExchange, ExchangeApi, InMemoryCallStats, InstrumentedExchange, RetryPolicy, RetryingExchange,
    SessionExchange, TracingAuditSink,
};
use crate::auth::RequestSigner;
use crate::codec::{FixCodec, JsonCodec, MessageCodec};
use crate::config::{ConnectionConfig, TransportConfig};
use crate::connection::{ConnectionEvent, ConnectionState, ExchangeConnection, ManagedSession};
use crate::error::ConnectivityResult;
use crate::message::{Envelope, MessageCategory};
use crate::nonce::NonceGenerator;
use crate::orderbook::{BookEvent, BookFeed, BookManager, BookManagerConfig, RestSnapshotSource};
use crate::session::{SessionConnector, SessionStats};
use crate::transport::{
    FixTcpTransport, HttpTransport, MemoryTransport, SimulatedVenue, Transport, WebSocketTransport,
};

/// A configured exchange connection with its books and typed API
pub struct Gateway {
    name: String,
    connection: ExchangeConnection,
    session: SessionConnector<Envelope>,
    exchange: Arc<dyn ExchangeApi>,
    books: Arc<BookManager>,
    call_stats: Arc<InMemoryCallStats>,
    nonces: Arc<NonceGenerator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Build every component; must run inside a tokio runtime.
    pub fn from_config(config: &ConnectionConfig) -> ConnectivityResult<Self> {
        config.validate()?;
        let nonces = Arc::new(NonceGenerator::new(config.nonce_unit));
        let signer = config
            .credentials
            .clone()
            .map(|credentials| Arc::new(RequestSigner::new(credentials, nonces.clone())));
        let mut tasks = Vec::new();

        let (transport, codec) = build_transport(config, signer.as_ref(), &mut tasks)?;
        if signer.is_some() && !matches!(config.transport, TransportConfig::Http { .. }) {
            warn!(connection = %config.name, "Credentials are only used by the HTTP transport");
        }

        let session = SessionConnector::new(format!("{}-session", config.name), transport, codec);

        let books = Arc::new(BookManager::new(BookManagerConfig {
            max_buffered: config.max_buffered_deltas,
            event_buffer: config.event_buffer,
            ..BookManagerConfig::default()
        }));
        for symbol in &config.instruments {
            books.track(symbol.clone());
        }
        session.route(MessageCategory::MarketData, Arc::new(BookFeed::new(books.clone())));
        match &config.snapshot_url {
            Some(template) => {
                let source = Arc::new(RestSnapshotSource::new(template.clone()));
                tasks.extend(books.spawn_resync_worker(source));
            }
            None => warn!(
                connection = %config.name,
                "No snapshot_url configured; books cannot recover from sequence gaps"
            ),
        }

        let call_stats = Arc::new(InMemoryCallStats::new());
        let exchange: Arc<dyn ExchangeApi> = Arc::new(RetryingExchange::new(
            AuditedExchange::new(
                InstrumentedExchange::new(
                    SessionExchange::new(config.name.clone(), session.clone(), config.request_timeout()),
                    call_stats.clone(),
                ),
                Arc::new(TracingAuditSink),
            ),
            RetryPolicy::default(),
        ));

        let connection = ExchangeConnection::new(
            config.name.clone(),
            config.instruments.clone(),
            vec![Arc::new(session.clone()) as Arc<dyn ManagedSession>],
            config.event_buffer,
        );

        info!(
            connection = %config.name,
            instruments = config.instruments.len(),
            "Gateway assembled"
        );

        Ok(Self {
            name: config.name.clone(),
            connection,
            session,
            exchange,
            books,
            call_stats,
            nonces,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn start(&self) -> ConnectivityResult<()> {
        self.connection.start().await
    }

    pub async fn stop(&self) -> ConnectivityResult<()> {
        self.connection.stop().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ExchangeConnection {
        &self.connection
    }

    pub fn exchange(&self) -> Arc<dyn ExchangeApi> {
        self.exchange.clone()
    }

    pub fn books(&self) -> &Arc<BookManager> {
        &self.books
    }

    pub fn nonces(&self) -> &Arc<NonceGenerator> {
        &self.nonces
    }

    pub fn call_stats(&self) -> &Arc<InMemoryCallStats> {
        &self.call_stats
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    pub fn subscribe_books(&self) -> broadcast::Receiver<BookEvent> {
        self.books.subscribe()
    }

    /// Inbound messages nothing else consumed, e.g. fills for earlier orders
    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<Envelope> {
        self.session.subscribe_unsolicited()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

type Wire = (Arc<dyn Transport>, Arc<dyn MessageCodec<Envelope>>);

fn build_transport(
    config: &ConnectionConfig,
    signer: Option<&Arc<RequestSigner>>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> ConnectivityResult<Wire> {
    let json: Arc<dyn MessageCodec<Envelope>> = Arc::new(JsonCodec);

    match &config.transport {
        TransportConfig::WebSocket { url } => {
            let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(url)?);
            Ok((transport, json))
        }
        TransportConfig::Http { base_url, routes } => {
            let mut http = HttpTransport::new(base_url, routes.clone())?;
            if let Some(signer) = signer {
                http = http.with_signer(signer.clone());
            }
            let transport: Arc<dyn Transport> = Arc::new(http);
            Ok((transport, json))
        }
        TransportConfig::FixTcp { addr, begin_string } => {
            let transport: Arc<dyn Transport> = Arc::new(FixTcpTransport::new(addr.clone()));
            let codec: Arc<dyn MessageCodec<Envelope>> = Arc::new(FixCodec::new(begin_string.clone()));
            Ok((transport, codec))
        }
        TransportConfig::Simulated {
            market_data_interval_ms,
        } => {
            let (memory, venue) = MemoryTransport::new();
            tasks.push(
                SimulatedVenue::new()
                    .with_market_data(
                        config.instruments.clone(),
                        Duration::from_millis((*market_data_interval_ms).max(1)),
                    )
                    .spawn(venue),
            );
            let transport: Arc<dyn Transport> = Arc::new(memory);
            Ok((transport, json))
        }
    }
}
