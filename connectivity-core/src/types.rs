//! Exchange data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading symbol
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn validate(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Order / book side
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// FIX `Side(54)` code
    pub fn fix_code(&self) -> &'static str {
        match self {
            Side::Buy => "1",
            Side::Sell => "2",
        }
    }
}

/// Order types
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum OrderType {
    Market,
    Limit { price: f64 },
}

/// Order request for placing new orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub account: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: Side, quantity: f64) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            account: None,
        }
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit { price },
            quantity,
            account: None,
        }
    }
}

/// Cancel request for an order previously acknowledged by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub symbol: Symbol,
    pub side: Side,
    /// Venue-assigned order id
    pub order_id: String,
    /// Correlation id the order was originally sent with
    pub orig_client_order_id: String,
}

/// Order status as reported in execution reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// Decode FIX `OrdStatus(39)`
    pub fn from_fix_code(code: &str) -> Self {
        match code {
            "0" => Self::New,
            "1" => Self::PartiallyFilled,
            "2" => Self::Filled,
            "4" => Self::Canceled,
            "6" => Self::PendingCancel,
            "8" => Self::Rejected,
            _ => Self::Unknown,
        }
    }

    pub fn fix_code(&self) -> &'static str {
        match self {
            Self::New => "0",
            Self::PartiallyFilled => "1",
            Self::Filled => "2",
            Self::Canceled => "4",
            Self::PendingCancel => "6",
            Self::Rejected => "8",
            Self::Unknown => "?",
        }
    }
}

/// Acknowledgement returned by `add_order` / `cancel_order`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub received_at: DateTime<Utc>,
}

/// Open position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub account: Option<String>,
    pub long_quantity: f64,
    pub short_quantity: f64,
    pub average_price: Option<f64>,
}

impl Position {
    pub fn net_quantity(&self) -> f64 {
        self.long_quantity - self.short_quantity
    }
}
