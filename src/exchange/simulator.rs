// src/exchange/simulator.rs
use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::models::{
    Candle, ExchangePosition, OrderAck, OrderRequest, OrderSide, OrderStatus, Ticker,
};
use crate::exchange::client::ExchangeClient;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Slippage bounds in units of 1/100000 of price (0.05% to 0.2%).
const MIN_SLIPPAGE: i64 = 50;
const MAX_SLIPPAGE: i64 = 200;

#[derive(Debug, Clone)]
struct SimOrder {
    instrument: String,
    status: OrderStatus,
    stop_loss: Option<Decimal>,
}

#[derive(Default)]
struct SimState {
    prices: HashMap<String, Decimal>,
    candles: HashMap<String, Vec<Candle>>,
    orders: HashMap<String, SimOrder>,
    positions: HashMap<String, ExchangePosition>,
    leverage: HashMap<String, Decimal>,
    balance: Decimal,
    sequence: u64,
}

/// Paper exchange: mutating calls are fabricated locally and fill
/// immediately at the last known price with unfavourable slippage.
///
/// Read-only market data is served from an optional upstream feed (usually
/// the public Bybit endpoints) or from prices pushed in with
/// [`SimulatedExchange::set_price`] and [`SimulatedExchange::set_candles`].
///
/// The wallet starts at the paper balance, pays the taker fee on every fill
/// and moves by the leveraged P&L of every reduce-only fill.
pub struct SimulatedExchange {
    feed: Option<Arc<dyn ExchangeClient>>,
    fee_rate: Decimal,
    state: Mutex<SimState>,
}

impl SimulatedExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            feed: None,
            fee_rate: Decimal::ZERO,
            state: Mutex::new(SimState {
                balance,
                ..SimState::default()
            }),
        }
    }

    /// Use `feed` for tickers and klines.
    pub fn with_feed(balance: Decimal, feed: Arc<dyn ExchangeClient>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new(balance)
        }
    }

    /// Charge `fee_rate` of leveraged notional on every fill.
    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub async fn set_price(&self, instrument: &str, price: Decimal) {
        let mut state = self.state.lock().await;
        state.prices.insert(instrument.to_string(), price);
    }

    pub async fn set_candles(&self, instrument: &str, candles: Vec<Candle>) {
        let mut state = self.state.lock().await;
        if let Some(last) = candles.last() {
            state.prices.insert(instrument.to_string(), last.close);
        }
        state.candles.insert(instrument.to_string(), candles);
    }

    pub async fn last_price(&self, instrument: &str) -> Option<Decimal> {
        self.state.lock().await.prices.get(instrument).copied()
    }

    /// Fill price for `side` at `reference` with random adverse slippage.
    fn slipped_price(side: OrderSide, reference: Decimal) -> Decimal {
        let slip = Decimal::new(
            rand::thread_rng().gen_range(MIN_SLIPPAGE..=MAX_SLIPPAGE),
            5,
        );
        match side {
            OrderSide::Buy => reference * (Decimal::ONE + slip),
            OrderSide::Sell => reference * (Decimal::ONE - slip),
        }
    }

    fn apply_fill(&self, state: &mut SimState, request: &OrderRequest, fill: Decimal) {
        let leverage = state
            .leverage
            .get(&request.instrument)
            .copied()
            .unwrap_or(Decimal::ONE);

        if request.reduce_only {
            if let Some(position) = state.positions.remove(&request.instrument) {
                let sign = match position.side {
                    OrderSide::Buy => Decimal::ONE,
                    OrderSide::Sell => Decimal::NEGATIVE_ONE,
                };
                let closed = position.size.min(request.quantity);
                let pnl = sign * (fill - position.entry_price) * closed * position.leverage;
                let fee = fill * closed * position.leverage * self.fee_rate;
                state.balance += pnl - fee;
            }
            return;
        }

        state.balance -= fill * request.quantity * leverage * self.fee_rate;
        state.positions.insert(
            request.instrument.clone(),
            ExchangePosition {
                instrument: request.instrument.clone(),
                side: request.side,
                size: request.quantity,
                entry_price: fill,
                mark_price: fill,
                unrealized_pnl: Decimal::ZERO,
                leverage,
            },
        );
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        request.validate()?;

        let mut state = self.state.lock().await;
        let reference = state
            .prices
            .get(&request.instrument)
            .copied()
            .or(request.price)
            .ok_or_else(|| {
                ExchangeError::Validation(format!(
                    "no market price known for {}",
                    request.instrument
                ))
            })?;

        let fill = Self::slipped_price(request.side, reference);
        state.sequence += 1;
        let order_id = format!("SIM-{}-{}", Utc::now().timestamp_millis(), state.sequence);

        state.orders.insert(
            order_id.clone(),
            SimOrder {
                instrument: request.instrument.clone(),
                status: OrderStatus::Filled,
                stop_loss: request.stop_loss,
            },
        );
        self.apply_fill(&mut state, request, fill);

        log::info!(
            "[SIM] {} {} {} filled at {} (ref {})",
            request.side,
            request.quantity,
            request.instrument,
            fill,
            reference
        );

        Ok(OrderAck {
            order_id,
            status: OrderStatus::Filled,
            avg_price: Some(fill),
        })
    }

    async fn cancel_order(&self, instrument: &str, order_id: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.instrument == instrument => {
                if !order.status.is_terminal() {
                    order.status = OrderStatus::Cancelled;
                }
                Ok(())
            }
            _ => Err(ExchangeError::Rejected {
                code: 110001,
                message: format!("order {} does not exist", order_id),
            }),
        }
    }

    async fn amend_order(
        &self,
        instrument: &str,
        order_id: &str,
        stop_loss: Decimal,
    ) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.instrument == instrument => {
                order.stop_loss = Some(stop_loss);
                Ok(())
            }
            _ => Err(ExchangeError::Rejected {
                code: 110001,
                message: format!("order {} does not exist", order_id),
            }),
        }
    }

    async fn set_leverage(&self, instrument: &str, leverage: Decimal) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        state.leverage.insert(instrument.to_string(), leverage);
        log::info!("[SIM] Leverage for {} set to {}", instrument, leverage);
        Ok(())
    }

    async fn get_order_status(
        &self,
        _instrument: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderStatus>> {
        let state = self.state.lock().await;
        Ok(state.orders.get(order_id).map(|order| order.status))
    }

    async fn get_positions(&self, instrument: &str) -> ExchangeResult<Vec<ExchangePosition>> {
        let state = self.state.lock().await;
        let mark = state.prices.get(instrument).copied();
        Ok(state
            .positions
            .get(instrument)
            .cloned()
            .map(|mut position| {
                if let Some(mark) = mark {
                    let sign = match position.side {
                        OrderSide::Buy => Decimal::ONE,
                        OrderSide::Sell => Decimal::NEGATIVE_ONE,
                    };
                    position.mark_price = mark;
                    position.unrealized_pnl =
                        sign * (mark - position.entry_price) * position.size * position.leverage;
                }
                position
            })
            .into_iter()
            .collect())
    }

    async fn get_wallet_balance(&self, _coin: &str) -> ExchangeResult<Decimal> {
        Ok(self.state.lock().await.balance)
    }

    async fn get_ticker(&self, instrument: &str) -> ExchangeResult<Ticker> {
        if let Some(feed) = &self.feed {
            let ticker = feed.get_ticker(instrument).await?;
            self.set_price(instrument, ticker.last_price).await;
            return Ok(ticker);
        }

        let price = self.last_price(instrument).await.ok_or_else(|| {
            ExchangeError::Validation(format!("no market price known for {}", instrument))
        })?;
        Ok(Ticker {
            instrument: instrument.to_string(),
            last_price: price,
            timestamp: Utc::now(),
        })
    }

    async fn get_klines(
        &self,
        instrument: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        if let Some(feed) = &self.feed {
            let candles = feed
                .get_klines(instrument, interval, start, end, limit)
                .await?;
            if let Some(last) = candles.last() {
                self.set_price(instrument, last.close).await;
            }
            return Ok(candles);
        }

        let state = self.state.lock().await;
        let candles = state.candles.get(instrument).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles.into_iter().skip(skip).collect())
    }
}
