//! Transport-neutral protocol messages
//!
//! Every transport (FIX session, WebSocket, HTTP) is reduced to the same
//! [`Envelope`]: a FIX-style message type, the correlation id the venue
//! echoes back, and a tag/value field map. The correlation engine only
//! relies on the [`CorrelatedMessage`] trait, so other message types can
//! be plugged in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConnectivityError, ConnectivityResult, RejectKind};

/// Routing category of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Session,
    Order,
    Position,
    MarketData,
    Reject,
    Unknown,
}

/// Message that can be correlated with an outstanding request
pub trait CorrelatedMessage: Clone + Send + Sync + fmt::Debug + 'static {
    fn category(&self) -> MessageCategory;

    fn correlation_id(&self) -> Option<&str>;

    /// Write the correlation id into the transport-specific field
    fn stamp_correlation_id(&mut self, id: &str);

    /// Number of messages the venue announced for this reply
    fn declared_total(&self) -> Option<usize> {
        None
    }

    /// Rejection carried by this message, if it is one
    fn reject(&self) -> Option<(RejectKind, String)> {
        None
    }
}

/// Receiver of routed inbound messages.
///
/// Called from the single inbound loop of a session; implementations must
/// not block. Returns `false` when the message was not consumed.
pub trait InboundHandler<M>: Send + Sync {
    fn handle(&self, message: &M) -> bool;
}

/// FIX `MsgType(35)` values understood by the core
pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const REJECT: &str = "3";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
    pub const EXECUTION_REPORT: &str = "8";
    pub const ORDER_CANCEL_REJECT: &str = "9";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const ORDER_CANCEL_REQUEST: &str = "F";
    pub const ORDER_CANCEL_REPLACE: &str = "G";
    pub const BUSINESS_REJECT: &str = "j";
    pub const MARKET_DATA_REQUEST: &str = "V";
    pub const MARKET_DATA_SNAPSHOT: &str = "W";
    pub const MARKET_DATA_INCREMENTAL: &str = "X";
    pub const MARKET_DATA_REJECT: &str = "Y";
    pub const REQUEST_FOR_POSITIONS: &str = "AN";
    pub const REQUEST_FOR_POSITIONS_ACK: &str = "AO";
    pub const POSITION_REPORT: &str = "AP";
}

/// FIX tag numbers used as field keys
pub mod tag {
    pub const ACCOUNT: &str = "1";
    pub const AVG_PX: &str = "6";
    pub const BEGIN_STRING: &str = "8";
    pub const BODY_LENGTH: &str = "9";
    pub const CHECKSUM: &str = "10";
    pub const CL_ORD_ID: &str = "11";
    pub const CUM_QTY: &str = "14";
    pub const MSG_TYPE: &str = "35";
    pub const ORDER_ID: &str = "37";
    pub const ORDER_QTY: &str = "38";
    pub const ORD_STATUS: &str = "39";
    pub const ORD_TYPE: &str = "40";
    pub const ORIG_CL_ORD_ID: &str = "41";
    pub const PRICE: &str = "44";
    pub const SIDE: &str = "54";
    pub const SYMBOL: &str = "55";
    pub const TEXT: &str = "58";
    pub const RPT_SEQ: &str = "83";
    pub const ORD_REJ_REASON: &str = "103";
    pub const BUSINESS_REJECT_REF_ID: &str = "379";
    pub const MD_ENTRY_TYPE: &str = "269";
    pub const MD_ENTRY_PX: &str = "270";
    pub const MD_ENTRY_SIZE: &str = "271";
    pub const MD_ENTRY_ID: &str = "278";
    pub const MD_UPDATE_ACTION: &str = "279";
    pub const LONG_QTY: &str = "704";
    pub const SHORT_QTY: &str = "705";
    pub const POS_REQ_ID: &str = "710";
    pub const POS_REQ_TYPE: &str = "724";
    pub const TOTAL_NUM_POS_REPORTS: &str = "727";
    pub const SETTL_PRICE: &str = "730";
    pub const TOT_NUM_REPORTS: &str = "911";
}

/// Protocol message exchanged with a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            correlation_id: None,
            total: None,
            text: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, tag: &str, value: impl ToString) -> Self {
        self.fields.insert(tag.to_string(), value.to_string());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn field(&self, tag: &str) -> Option<&str> {
        self.fields.get(tag).map(String::as_str)
    }

    /// Field that must be present
    pub fn require(&self, tag: &str) -> ConnectivityResult<&str> {
        self.field(tag).ok_or_else(|| {
            ConnectivityError::Protocol(format!(
                "{} message missing tag {}",
                self.msg_type, tag
            ))
        })
    }

    pub fn require_f64(&self, tag: &str) -> ConnectivityResult<f64> {
        let raw = self.require(tag)?;
        raw.parse::<f64>().map_err(|e| {
            ConnectivityError::Protocol(format!("tag {} is not a number ({}): {}", tag, raw, e))
        })
    }

    pub fn optional_f64(&self, tag: &str) -> ConnectivityResult<Option<f64>> {
        match self.field(tag) {
            Some(_) => self.require_f64(tag).map(Some),
            None => Ok(None),
        }
    }

    pub fn require_u64(&self, tag: &str) -> ConnectivityResult<u64> {
        let raw = self.require(tag)?;
        raw.parse::<u64>().map_err(|e| {
            ConnectivityError::Protocol(format!("tag {} is not an integer ({}): {}", tag, raw, e))
        })
    }

    /// Tag the correlation id travels in for this message type
    pub fn correlation_tag(&self) -> &'static str {
        correlation_tag_for(&self.msg_type)
    }

    /// Tag the reply count travels in for this message type
    pub fn total_tag(&self) -> &'static str {
        total_tag_for(&self.msg_type)
    }
}

/// Session rejects (`3`) carry the id in ClOrdID(11); the venues we talk to
/// echo it there instead of RefSeqNum(45).
pub(crate) fn correlation_tag_for(msg_type: &str) -> &'static str {
    match msg_type {
        msg_type::REQUEST_FOR_POSITIONS
        | msg_type::REQUEST_FOR_POSITIONS_ACK
        | msg_type::POSITION_REPORT => tag::POS_REQ_ID,
        msg_type::BUSINESS_REJECT => tag::BUSINESS_REJECT_REF_ID,
        _ => tag::CL_ORD_ID,
    }
}

pub(crate) fn total_tag_for(msg_type: &str) -> &'static str {
    match msg_type {
        msg_type::REQUEST_FOR_POSITIONS_ACK | msg_type::POSITION_REPORT => {
            tag::TOTAL_NUM_POS_REPORTS
        }
        _ => tag::TOT_NUM_REPORTS,
    }
}

fn classify_reject(text: Option<&str>) -> RejectKind {
    match text {
        Some(text) => {
            let lower = text.to_lowercase();
            if lower.contains("insufficient") {
                RejectKind::InsufficientFunds
            } else {
                RejectKind::Business
            }
        }
        None => RejectKind::Business,
    }
}

impl CorrelatedMessage for Envelope {
    fn category(&self) -> MessageCategory {
        match self.msg_type.as_str() {
            msg_type::HEARTBEAT
            | msg_type::TEST_REQUEST
            | msg_type::RESEND_REQUEST
            | msg_type::SEQUENCE_RESET
            | msg_type::LOGOUT
            | msg_type::LOGON => MessageCategory::Session,
            msg_type::REJECT | msg_type::BUSINESS_REJECT | msg_type::ORDER_CANCEL_REJECT => {
                MessageCategory::Reject
            }
            msg_type::NEW_ORDER_SINGLE
            | msg_type::ORDER_CANCEL_REQUEST
            | msg_type::ORDER_CANCEL_REPLACE
            | msg_type::EXECUTION_REPORT => MessageCategory::Order,
            msg_type::REQUEST_FOR_POSITIONS
            | msg_type::REQUEST_FOR_POSITIONS_ACK
            | msg_type::POSITION_REPORT => MessageCategory::Position,
            msg_type::MARKET_DATA_REQUEST
            | msg_type::MARKET_DATA_SNAPSHOT
            | msg_type::MARKET_DATA_INCREMENTAL
            | msg_type::MARKET_DATA_REJECT => MessageCategory::MarketData,
            _ => MessageCategory::Unknown,
        }
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn stamp_correlation_id(&mut self, id: &str) {
        self.correlation_id = Some(id.to_string());
    }

    fn declared_total(&self) -> Option<usize> {
        self.total
    }

    fn reject(&self) -> Option<(RejectKind, String)> {
        let reason = || {
            self.text
                .clone()
                .unwrap_or_else(|| format!("{} rejected by venue", self.msg_type))
        };

        match self.msg_type.as_str() {
            msg_type::REJECT => Some((RejectKind::Session, reason())),
            msg_type::BUSINESS_REJECT | msg_type::ORDER_CANCEL_REJECT | msg_type::MARKET_DATA_REJECT => {
                Some((classify_reject(self.text.as_deref()), reason()))
            }
            msg_type::EXECUTION_REPORT if self.field(tag::ORD_STATUS) == Some("8") => {
                Some((classify_reject(self.text.as_deref()), reason()))
            }
            _ => None,
        }
    }
}
