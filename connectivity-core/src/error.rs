//! Connectivity error types

use thiserror::Error;

use crate::connection::ConnectionState;

/// Custom result type for connectivity operations
pub type ConnectivityResult<T> = Result<T, ConnectivityError>;

/// Sub-kind of an exchange rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Business rejection for lack of balance or margin. Never retried.
    InsufficientFunds,
    /// Any other business-level rejection (unknown order, bad price, ...)
    Business,
    /// Session-level rejection (malformed request as seen by the venue)
    Session,
}

#[derive(Error, Debug, Clone)]
pub enum ConnectivityError {
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Request {correlation_id} timed out after {elapsed_ms} ms")]
    Timeout { correlation_id: String, elapsed_ms: u64 },

    #[error("Request {correlation_id} cancelled")]
    Cancelled { correlation_id: String },

    #[error("Rejected ({kind:?}): {reason}")]
    Rejected { kind: RejectKind, reason: String },

    #[error("Order book inconsistency on {symbol}: expected sequence {expected}, got {received}")]
    OrderBookInconsistency {
        symbol: String,
        expected: u64,
        received: u64,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Coarse classification used by callers deciding what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resolved by reconnecting or resynchronising; not worth retrying the call as-is
    Recoverable,
    /// May be retried once by the caller layer
    Retryable,
    Fatal,
}

impl ConnectivityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected {
                kind: RejectKind::InsufficientFunds,
                ..
            } => ErrorKind::Fatal,
            Self::Rejected { .. } | Self::Protocol(_) => ErrorKind::Retryable,
            Self::InvalidState { .. } => ErrorKind::Fatal,
            Self::NotConnected(_)
            | Self::Timeout { .. }
            | Self::Cancelled { .. }
            | Self::OrderBookInconsistency { .. }
            | Self::Transport(_) => ErrorKind::Recoverable,
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                kind: RejectKind::InsufficientFunds,
                ..
            }
        )
    }
}

impl From<serde_json::Error> for ConnectivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectivityError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ConnectivityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("HTTP timeout: {}", err))
        } else if err.is_connect() {
            Self::NotConnected(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for ConnectivityError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_is_never_retried() {
        let err = ConnectivityError::Rejected {
            kind: RejectKind::InsufficientFunds,
            reason: "Insufficient funds".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(!err.should_retry());
        assert!(err.is_insufficient_funds());
    }

    #[test]
    fn test_business_reject_and_protocol_errors_are_retryable() {
        let reject = ConnectivityError::Rejected {
            kind: RejectKind::Business,
            reason: "Unknown order".to_string(),
        };
        assert!(reject.should_retry());
        assert!(ConnectivityError::Protocol("bad checksum".into()).should_retry());
        assert!(!ConnectivityError::NotConnected("down".into()).should_retry());
    }

    #[test]
    fn test_error_messages() {
        let err = ConnectivityError::OrderBookInconsistency {
            symbol: "BTC-USD".to_string(),
            expected: 3,
            received: 4,
        };
        assert_eq!(
            err.to_string(),
            "Order book inconsistency on BTC-USD: expected sequence 3, got 4"
        );

        let err = ConnectivityError::InvalidState {
            operation: "start",
            state: ConnectionState::Stopping,
        };
        assert_eq!(err.to_string(), "Invalid state: cannot start while Stopping");
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err: ConnectivityError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConnectivityError::Protocol(_)));
    }
}
