//! Exchange Gateway
//!
//! Runs one exchange connection from a JSON configuration file, logs
//! lifecycle and order book events and shuts down cleanly on Ctrl+C.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use connectivity_core::{BookEvent, ConnectionConfig, ConnectionEvent, Gateway};

const CONFIG_ENV: &str = "GATEWAY_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    info!("🚀 Starting exchange gateway '{}'", config.name);

    let gateway = Gateway::from_config(&config).context("failed to assemble gateway")?;

    let mut connection_events = gateway.subscribe_connection();
    let connection_task = tokio::spawn(async move {
        loop {
            match connection_events.recv().await {
                Ok(ConnectionEvent::Faulted { session, reason }) => {
                    error!("❌ Session {} faulted: {}", session, reason);
                }
                Ok(event) => info!("🔌 {:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("Connection event subscriber lagged by {}", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut book_events = gateway.subscribe_books();
    let book_task = tokio::spawn(async move {
        loop {
            match book_events.recv().await {
                Ok(BookEvent::Updated { symbol, sequence }) => debug!("📈 {} book at {}", symbol, sequence),
                Ok(BookEvent::Resyncing { symbol, expected, received }) => {
                    warn!("⚠️ {} resyncing (expected {}, got {})", symbol, expected, received)
                }
                Ok(BookEvent::Resynced { symbol, sequence, replayed }) => {
                    info!("✅ {} resynced at {} ({} replayed)", symbol, sequence, replayed)
                }
                Ok(BookEvent::ResyncFailed { symbol, reason }) => error!("❌ {} resync failed: {}", symbol, reason),
                Err(RecvError::Lagged(missed)) => debug!("Book event subscriber lagged by {}", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    gateway.start().await.context("failed to start connection")?;
    info!(
        "✅ Connection '{}' is {} ({} instruments)",
        gateway.name(),
        gateway.state(),
        gateway.connection().instruments().len()
    );

    let shutdown = CancellationToken::new();
    match gateway.exchange().get_positions(shutdown.child_token()).await {
        Ok(positions) => info!("💰 {} open positions", positions.len()),
        Err(e) => warn!("Position query failed: {}", e),
    }

    let mut monitor = tokio::time::interval(Duration::from_secs(10));
    monitor.tick().await;

    info!("📊 Gateway is running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("🛑 Shutdown signal received...");
                break;
            }
            _ = monitor.tick() => {
                let session = gateway.session_stats();
                let books = gateway.books().stats();
                info!(
                    "📊 frames in/out {}/{}, decode errors {}, book deltas {}, gaps {}, resyncs {}",
                    session.frames_in, session.frames_out, session.decode_errors,
                    books.applied, books.gaps, books.resyncs
                );
                for symbol in gateway.books().symbols() {
                    if let Some(book) = gateway.books().snapshot(&symbol) {
                        if let (Some(mid), Some(spread)) = (book.mid_price(), book.spread_bps()) {
                            info!("📈 {} mid {:.4} spread {:.2} bps", symbol, mid, spread);
                        }
                    }
                }
            }
        }
    }

    // Clean shutdown
    shutdown.cancel();
    gateway.stop().await.context("failed to stop connection")?;
    connection_task.abort();
    book_task.abort();
    info!("✅ Exchange gateway shutdown complete");

    Ok(())
}

/// Path from the first argument or `GATEWAY_CONFIG`; defaults otherwise
fn load_config() -> Result<ConnectionConfig> {
    let path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok());
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path);
            ConnectionConfig::from_json_file(&path).with_context(|| format!("invalid configuration {}", path))
        }
        None => {
            info!("No configuration given, running against the simulated venue");
            Ok(ConnectionConfig::default())
        }
    }
}
