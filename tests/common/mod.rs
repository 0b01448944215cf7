// Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use perpbot::config::{Config, GatewayConfig, InstrumentConfig, TradingHours};
use perpbot::domain::errors::{ExchangeError, ExchangeResult, TradingResult};
use perpbot::domain::models::{
    Candle, ExchangePosition, OrderAck, OrderRequest, OrderStatus, Signal, Ticker,
};
use perpbot::exchange::{ExchangeClient, Gateway, SimulatedExchange};
use perpbot::market_data::MarketView;
use perpbot::trading::SignalSource;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Trading window covering the whole day with no maintenance slot
pub fn always_open() -> TradingHours {
    let end = NaiveTime::from_hms_nano_opt(23, 59, 59, 1_999_999_999).unwrap();
    TradingHours {
        start: NaiveTime::MIN,
        end,
        // Start after end: the maintenance check never matches
        maintenance_start: end,
        maintenance_end: NaiveTime::MIN,
    }
}

pub fn fast_gateway_config() -> GatewayConfig {
    GatewayConfig {
        min_call_spacing_ms: 0,
        max_retries: 1,
        retry_delay_ms: 1,
    }
}

/// Default configuration trading ETHUSDT only, with no call spacing and a
/// trading window that is always open.
pub fn test_config(fee_rate: Decimal) -> Config {
    let mut config = Config::default();
    config.gateway = fast_gateway_config();
    config.trading.symbols = vec!["ETHUSDT".to_string()];
    config.trading.reconcile_every = 1;
    config.risk.trading_hours = always_open();
    config.positions.fee_rate = fee_rate;
    config
}

pub fn instrument(config: &Config) -> InstrumentConfig {
    config.instrument("ETHUSDT").cloned().unwrap()
}

pub async fn sim_gateway(price: Decimal) -> (Arc<SimulatedExchange>, Arc<Gateway>) {
    let exchange = Arc::new(SimulatedExchange::new(Decimal::from(1000)));
    exchange.set_price("ETHUSDT", price).await;
    let gateway = Arc::new(Gateway::new(exchange.clone(), fast_gateway_config(), true));
    (exchange, gateway)
}

/// Emits each queued result once, one per call, then nothing.
pub struct QueuedSignals {
    queue: Mutex<Vec<TradingResult<Option<Signal>>>>,
}

impl QueuedSignals {
    pub fn new(signals: Vec<Signal>) -> Self {
        Self::scripted(signals.into_iter().map(|s| Ok(Some(s))).collect())
    }

    /// Replay arbitrary strategy outcomes, errors included
    pub fn scripted(mut results: Vec<TradingResult<Option<Signal>>>) -> Self {
        results.reverse();
        Self {
            queue: Mutex::new(results),
        }
    }
}

impl SignalSource for QueuedSignals {
    fn name(&self) -> &str {
        "queued"
    }

    fn generate(
        &self,
        _view: &MarketView<'_>,
        _instrument: &InstrumentConfig,
    ) -> TradingResult<Option<Signal>> {
        self.queue.lock().unwrap().pop().unwrap_or(Ok(None))
    }
}

/// Exchange that accepts every order as resting (`New`) until told otherwise.
#[derive(Default)]
pub struct RestingExchange {
    statuses: Mutex<HashMap<String, OrderStatus>>,
    sequence: Mutex<u64>,
}

impl RestingExchange {
    pub fn set_status(&self, order_id: &str, status: OrderStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(order_id.to_string(), status);
    }
}

#[async_trait]
impl ExchangeClient for RestingExchange {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        request.validate()?;
        let mut sequence = self.sequence.lock().unwrap();
        *sequence += 1;
        let order_id = format!("REST-{}", sequence);
        self.set_status(&order_id, OrderStatus::New);
        Ok(OrderAck {
            order_id,
            status: OrderStatus::New,
            avg_price: None,
        })
    }

    async fn cancel_order(&self, _instrument: &str, order_id: &str) -> ExchangeResult<()> {
        self.set_status(order_id, OrderStatus::Cancelled);
        Ok(())
    }

    async fn amend_order(
        &self,
        _instrument: &str,
        _order_id: &str,
        _stop_loss: Decimal,
    ) -> ExchangeResult<()> {
        Ok(())
    }

    async fn set_leverage(&self, _instrument: &str, _leverage: Decimal) -> ExchangeResult<()> {
        Ok(())
    }

    async fn get_order_status(
        &self,
        _instrument: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderStatus>> {
        Ok(self.statuses.lock().unwrap().get(order_id).copied())
    }

    async fn get_positions(&self, _instrument: &str) -> ExchangeResult<Vec<ExchangePosition>> {
        Ok(Vec::new())
    }

    async fn get_wallet_balance(&self, _coin: &str) -> ExchangeResult<Decimal> {
        Ok(Decimal::from(1000))
    }

    async fn get_ticker(&self, instrument: &str) -> ExchangeResult<Ticker> {
        Err(ExchangeError::Network(format!("no ticker for {}", instrument)))
    }

    async fn get_klines(
        &self,
        _instrument: &str,
        _interval: &str,
        _start: Option<i64>,
        _end: Option<i64>,
        _limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        Ok(Vec::new())
    }
}

/// Simulated exchange whose next entry order is applied but whose reply is
/// lost, as when the connection drops after the request went out.
pub struct DroppedReplyExchange {
    pub inner: Arc<SimulatedExchange>,
    drop_next_entry: AtomicBool,
    pub entries: AtomicUsize,
    pub position_queries: AtomicUsize,
}

impl DroppedReplyExchange {
    pub fn new(inner: Arc<SimulatedExchange>) -> Self {
        Self {
            inner,
            drop_next_entry: AtomicBool::new(true),
            entries: AtomicUsize::new(0),
            position_queries: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExchangeClient for DroppedReplyExchange {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        if request.reduce_only {
            return self.inner.place_order(request).await;
        }
        self.entries.fetch_add(1, Ordering::SeqCst);
        let ack = self.inner.place_order(request).await?;
        if self.drop_next_entry.swap(false, Ordering::SeqCst) {
            return Err(ExchangeError::Network("connection reset by peer".to_string()));
        }
        Ok(ack)
    }

    async fn cancel_order(&self, instrument: &str, order_id: &str) -> ExchangeResult<()> {
        self.inner.cancel_order(instrument, order_id).await
    }

    async fn amend_order(
        &self,
        instrument: &str,
        order_id: &str,
        stop_loss: Decimal,
    ) -> ExchangeResult<()> {
        self.inner.amend_order(instrument, order_id, stop_loss).await
    }

    async fn set_leverage(&self, instrument: &str, leverage: Decimal) -> ExchangeResult<()> {
        self.inner.set_leverage(instrument, leverage).await
    }

    async fn get_order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderStatus>> {
        self.inner.get_order_status(instrument, order_id).await
    }

    async fn get_positions(&self, instrument: &str) -> ExchangeResult<Vec<ExchangePosition>> {
        self.position_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.get_positions(instrument).await
    }

    async fn get_wallet_balance(&self, coin: &str) -> ExchangeResult<Decimal> {
        self.inner.get_wallet_balance(coin).await
    }

    async fn get_ticker(&self, instrument: &str) -> ExchangeResult<Ticker> {
        self.inner.get_ticker(instrument).await
    }

    async fn get_klines(
        &self,
        instrument: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        self.inner
            .get_klines(instrument, interval, start, end, limit)
            .await
    }
}

/// Flat candles at `price`, one minute apart, ending now
pub fn flat_candles(price: Decimal, count: i64) -> Vec<Candle> {
    let now = Utc::now();
    (0..count)
        .map(|i| Candle {
            timestamp: now - chrono::Duration::minutes(count - i),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
        })
        .collect()
}
