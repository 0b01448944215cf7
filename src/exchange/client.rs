// src/exchange/client.rs
use crate::domain::errors::ExchangeResult;
use crate::domain::models::{Candle, ExchangePosition, OrderAck, OrderRequest, OrderStatus, Ticker};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Raw exchange wire operations. One call is one round trip; spacing and
/// retries are layered on top by the gateway.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a new order
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Cancel an existing order
    async fn cancel_order(&self, instrument: &str, order_id: &str) -> ExchangeResult<()>;

    /// Replace the stop-loss attached to an order
    async fn amend_order(
        &self,
        instrument: &str,
        order_id: &str,
        stop_loss: Decimal,
    ) -> ExchangeResult<()>;

    /// Set the leverage used for new positions on an instrument
    async fn set_leverage(&self, instrument: &str, leverage: Decimal) -> ExchangeResult<()>;

    /// Get order status. `None` when the exchange no longer knows the order.
    async fn get_order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderStatus>>;

    /// Get open positions for an instrument
    async fn get_positions(&self, instrument: &str) -> ExchangeResult<Vec<ExchangePosition>>;

    /// Get wallet balance for a coin
    async fn get_wallet_balance(&self, coin: &str) -> ExchangeResult<Decimal>;

    /// Get latest ticker for an instrument
    async fn get_ticker(&self, instrument: &str) -> ExchangeResult<Ticker>;

    /// Get historical klines, oldest first
    async fn get_klines(
        &self,
        instrument: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>>;
}
