//! Typed operations exposed to the trading engine

pub mod decorators;
pub mod exchange;
pub mod stats;

pub use decorators::*;
pub use exchange::*;
pub use stats::*;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectivityResult;
use crate::types::{CancelRequest, OrderAck, OrderRequest, Position};

/// Order entry and account queries against one exchange
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Name of the exchange connection serving the calls
    fn exchange(&self) -> &str;

    /// Place a new order and wait for the venue's acknowledgement
    async fn add_order(&self, order: &OrderRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck>;

    /// Cancel an acknowledged order
    async fn cancel_order(&self, request: &CancelRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck>;

    /// All open positions; empty when the venue reports none
    async fn get_positions(&self, cancel: CancellationToken) -> ConnectivityResult<Vec<Position>>;
}

#[async_trait]
impl<T: ExchangeApi + ?Sized> ExchangeApi for std::sync::Arc<T> {
    fn exchange(&self) -> &str {
        (**self).exchange()
    }

    async fn add_order(&self, order: &OrderRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        (**self).add_order(order, cancel).await
    }

    async fn cancel_order(&self, request: &CancelRequest, cancel: CancellationToken) -> ConnectivityResult<OrderAck> {
        (**self).cancel_order(request, cancel).await
    }

    async fn get_positions(&self, cancel: CancellationToken) -> ConnectivityResult<Vec<Position>> {
        (**self).get_positions(cancel).await
    }
}
