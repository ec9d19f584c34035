//! Connection configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::auth::Credentials;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::nonce::NonceUnit;
use crate::transport::HttpRoute;
use crate::types::Symbol;

/// Wire transport of the exchange session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    #[serde(rename = "websocket")]
    WebSocket {
        url: String,
    },
    Http {
        base_url: String,
        #[serde(default)]
        routes: Vec<HttpRoute>,
    },
    FixTcp {
        addr: String,
        #[serde(default = "default_begin_string")]
        begin_string: String,
    },
    /// In-process venue with canned replies and a synthetic book
    Simulated {
        #[serde(default = "default_market_data_interval_ms")]
        market_data_interval_ms: u64,
    },
}

fn default_begin_string() -> String {
    "FIX.4.4".to_string()
}

fn default_market_data_interval_ms() -> u64 {
    250
}

/// Everything needed to build one exchange connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub name: String,
    pub instruments: Vec<Symbol>,
    pub request_timeout_ms: u64,
    pub nonce_unit: NonceUnit,
    pub transport: TransportConfig,
    pub credentials: Option<Credentials>,
    /// REST depth endpoint with a `{symbol}` placeholder
    pub snapshot_url: Option<String>,
    pub event_buffer: usize,
    /// Deltas kept per symbol while waiting for a snapshot
    pub max_buffered_deltas: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "simulated".to_string(),
            instruments: vec![Symbol::new("BTC-USD"), Symbol::new("ETH-USD")],
            request_timeout_ms: 5_000,
            nonce_unit: NonceUnit::Milliseconds,
            transport: TransportConfig::Simulated {
                market_data_interval_ms: default_market_data_interval_ms(),
            },
            credentials: None,
            snapshot_url: None,
            event_buffer: 1024,
            max_buffered_deltas: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> ConnectivityResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConnectivityError::Protocol(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> ConnectivityResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> ConnectivityResult<()> {
        if self.name.is_empty() {
            return Err(ConnectivityError::Protocol("connection name is empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConnectivityError::Protocol("request_timeout_ms must be positive".into()));
        }
        if let Some(symbol) = self.instruments.iter().find(|s| !s.validate()) {
            return Err(ConnectivityError::Protocol(format!("invalid instrument '{}'", symbol)));
        }
        if let Some(template) = &self.snapshot_url {
            if !template.contains("{symbol}") {
                return Err(ConnectivityError::Protocol(
                    "snapshot_url must contain a {symbol} placeholder".into(),
                ));
            }
        }
        Ok(())
    }
}
