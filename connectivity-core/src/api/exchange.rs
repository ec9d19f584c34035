//! Exchange operations over a message session

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ExchangeApi;
use crate::correlation::RequestRegistry;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::message::{msg_type, tag, Envelope, MessageCategory};
use crate::session::SessionConnector;
use crate::types::{CancelRequest, OrderAck, OrderRequest, OrderStatus, OrderType, Position, Symbol};

/// `PosReqType(724)` for open positions
const POSITIONS_REQUEST: &str = "0";

/// [`ExchangeApi`] translating calls into envelopes on one session
pub struct SessionExchange {
    name: String,
    session: SessionConnector<Envelope>,
    orders: Arc<RequestRegistry<Envelope>>,
    positions: Arc<RequestRegistry<Envelope>>,
    timeout: Duration,
}

impl SessionExchange {
    /// Registers the order and position registries on `session`
    pub fn new(name: impl Into<String>, session: SessionConnector<Envelope>, timeout: Duration) -> Self {
        let orders = session.registry(MessageCategory::Order, "ORD");
        let positions = session.registry(MessageCategory::Position, "POS");
        Self {
            name: name.into(),
            session,
            orders,
            positions,
            timeout,
        }
    }

    pub fn session(&self) -> &SessionConnector<Envelope> {
        &self.session
    }

    pub fn pending_orders(&self) -> usize {
        self.orders.len()
    }

    pub fn pending_position_requests(&self) -> usize {
        self.positions.len()
    }

    pub fn new_order_message(order: &OrderRequest) -> ConnectivityResult<Envelope> {
        if !order.symbol.validate() {
            return Err(ConnectivityError::Protocol(format!("invalid symbol '{}'", order.symbol)));
        }
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(ConnectivityError::Protocol(format!(
                "invalid order quantity {}",
                order.quantity
            )));
        }

        let mut message = Envelope::new(msg_type::NEW_ORDER_SINGLE)
            .with_field(tag::SYMBOL, &order.symbol)
            .with_field(tag::SIDE, order.side.fix_code())
            .with_field(tag::ORDER_QTY, order.quantity);
        message = match order.order_type {
            OrderType::Market => message.with_field(tag::ORD_TYPE, "1"),
            OrderType::Limit { price } => message.with_field(tag::ORD_TYPE, "2").with_field(tag::PRICE, price),
        };
        if let Some(account) = &order.account {
            message = message.with_field(tag::ACCOUNT, account);
        }
        Ok(message)
    }

    pub fn cancel_message(request: &CancelRequest) -> Envelope {
        Envelope::new(msg_type::ORDER_CANCEL_REQUEST)
            .with_field(tag::ORDER_ID, &request.order_id)
            .with_field(tag::ORIG_CL_ORD_ID, &request.orig_client_order_id)
            .with_field(tag::SYMBOL, &request.symbol)
            .with_field(tag::SIDE, request.side.fix_code())
    }

    /// First execution report of a reply
    pub fn parse_ack(replies: &[Envelope]) -> ConnectivityResult<OrderAck> {
        let report = replies
            .iter()
            .find(|m| m.msg_type == msg_type::EXECUTION_REPORT)
            .ok_or_else(|| ConnectivityError::Protocol("reply carries no execution report".into()))?;

        Ok(OrderAck {
            order_id: report.require(tag::ORDER_ID)?.to_string(),
            client_order_id: report.correlation_id.clone().unwrap_or_default(),
            status: OrderStatus::from_fix_code(report.require(tag::ORD_STATUS)?),
            filled_quantity: report.optional_f64(tag::CUM_QTY)?.unwrap_or(0.0),
            received_at: Utc::now(),
        })
    }

    pub fn parse_position(report: &Envelope) -> ConnectivityResult<Position> {
        Ok(Position {
            symbol: Symbol::new(report.require(tag::SYMBOL)?),
            account: report.field(tag::ACCOUNT).map(str::to_string),
            long_quantity: report.optional_f64(tag::LONG_QTY)?.unwrap_or(0.0),
            short_quantity: report.optional_f64(tag::SHORT_QTY)?.unwrap_or(0.0),
            average_price: report.optional_f64(tag::SETTL_PRICE)?,
        })
    }
}

#[async_trait]
impl ExchangeApi for SessionExchange {
    fn exchange(&self) -> &str {
        &self.name
    }

    async fn add_order(&self, order: &OrderRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        let message = Self::new_order_message(order)?;
        let replies = self
            .session
            .send_request(&self.orders, message, cancel, self.timeout)
            .await?;
        let ack = Self::parse_ack(&replies)?;
        debug!(
            exchange = %self.name,
            order_id = %ack.order_id,
            client_order_id = %ack.client_order_id,
            status = ?ack.status,
            "Order acknowledged"
        );
        Ok(ack)
    }

    async fn cancel_order(&self, request: &CancelRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        let replies = self
            .session
            .send_request(&self.orders, Self::cancel_message(request), cancel, self.timeout)
            .await?;
        Self::parse_ack(&replies)
    }

    async fn get_positions(&self, cancel: CancellationToken) -> ConnectivityResult<Vec<Position>> {
        let request = Envelope::new(msg_type::REQUEST_FOR_POSITIONS).with_field(tag::POS_REQ_TYPE, POSITIONS_REQUEST);
        let replies = self
            .session
            .send_request(&self.positions, request, cancel, self.timeout)
            .await?;

        replies
            .iter()
            .filter(|m| m.msg_type == msg_type::POSITION_REPORT)
            .map(Self::parse_position)
            .collect()
    }
}
