// src/trading/positions.rs
use crate::config::{InstrumentConfig, PositionConfig};
use crate::domain::errors::{TradingError, TradingResult};
use crate::domain::models::{
    CloseReason, Direction, ExchangePosition, OrderSide, OrderStatus, Position, Signal, Trade,
};
use crate::trading::execution::ExecutionEngine;
use crate::trading::recorder::OutcomeRecorder;
use crate::trading::risk::{OpenExposure, RiskGate};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Live figures for one open position
#[derive(Debug, Clone, Serialize)]
pub struct PositionMetrics {
    pub instrument: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub pnl: Decimal,
    pub pnl_percentage: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub leverage: Decimal,
    pub trailing_enabled: bool,
}

/// Local view that has to be checked against the exchange before the
/// instrument can trade again.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingSync {
    /// An entry order may or may not have been applied
    Entry(Signal),
    /// An exit order may or may not have been applied
    Exit(CloseReason),
}

/// Entry order accepted as resting, not yet filled
#[derive(Debug, Clone)]
struct RestingEntry {
    signal: Signal,
    order_id: String,
}

/// Owner of every open position: at most one per instrument.
///
/// Lifecycle: FLAT -> OPEN (entry order filled) -> OPEN with any number
/// of trailing-stop updates -> CLOSED (exit order succeeded; the position
/// leaves the live map and a `Trade` is appended to history).
///
/// A limit entry that rests on the book is held as pending until
/// reconciliation reports it filled. An order whose outcome is unknown marks
/// the instrument for a position check against the exchange.
pub struct PositionStore {
    config: PositionConfig,
    instruments: HashMap<String, InstrumentConfig>,
    positions: BTreeMap<String, Position>,
    resting: BTreeMap<String, RestingEntry>,
    pending_sync: BTreeMap<String, PendingSync>,
    trades: Vec<Trade>,
}

impl PositionStore {
    pub fn new(config: PositionConfig, instruments: HashMap<String, InstrumentConfig>) -> Self {
        Self {
            config,
            instruments,
            positions: BTreeMap::new(),
            resting: BTreeMap::new(),
            pending_sync: BTreeMap::new(),
            trades: Vec::new(),
        }
    }

    pub fn get(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn has_position(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    /// Order id of a resting entry for `instrument`
    pub fn resting_entry(&self, instrument: &str) -> Option<&str> {
        self.resting.get(instrument).map(|r| r.order_id.as_str())
    }

    /// True when the last order's outcome is unknown and exchange state must be read
    pub fn needs_sync(&self, instrument: &str) -> bool {
        self.pending_sync.contains_key(instrument)
    }

    pub fn pending_sync(&self, instrument: &str) -> Option<&PendingSync> {
        self.pending_sync.get(instrument)
    }

    /// Open positions ordered by instrument
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    fn leverage_for(&self, instrument: &str) -> TradingResult<Decimal> {
        self.instruments
            .get(instrument)
            .map(|inst| inst.leverage)
            .ok_or_else(|| TradingError::Validation(format!("no configuration for {}", instrument)))
    }

    /// Open a position for an already validated signal.
    ///
    /// Returns `None` when the entry was accepted but rests on the book; it
    /// becomes a position once `promote_resting` sees it filled. A second open
    /// for an instrument that is held, resting or awaiting a sync is refused
    /// here even though the risk gate normally filters it first.
    pub async fn open(
        &mut self,
        signal: &Signal,
        engine: &mut ExecutionEngine,
        recorder: &mut dyn OutcomeRecorder,
    ) -> TradingResult<Option<&Position>> {
        let instrument = signal.instrument.clone();
        if self.positions.contains_key(&instrument) || self.resting.contains_key(&instrument) {
            log::warn!("Position already exists for {}", instrument);
            return Err(TradingError::InvariantViolation(format!(
                "position already open for {}",
                instrument
            )));
        }
        if self.pending_sync.contains_key(&instrument) {
            return Err(TradingError::InvariantViolation(format!(
                "exchange state for {} not yet confirmed",
                instrument
            )));
        }
        let leverage = self.leverage_for(&instrument)?;

        let result = engine.open(signal).await;
        let order_id = match (result.success, result.order_id.clone()) {
            (true, Some(order_id)) => order_id,
            _ => {
                if result.outcome_unknown {
                    log::warn!("Entry for {} may have reached the exchange, will re-check", instrument);
                    self.pending_sync
                        .insert(instrument.clone(), PendingSync::Entry(signal.clone()));
                }
                return Err(TradingError::Execution(result.error.unwrap_or_else(|| {
                    format!("entry order for {} failed", instrument)
                })));
            }
        };

        // Market entries are immediate-or-cancel; only a limit entry can rest
        if signal.limit_price.is_some() && result.is_resting() {
            log::info!("Entry for {} resting as order {}", instrument, order_id);
            self.resting.insert(
                instrument,
                RestingEntry {
                    signal: signal.clone(),
                    order_id,
                },
            );
            return Ok(None);
        }

        let entry_price = result.fill_price.unwrap_or(signal.entry_price);
        let position = self.filled_position(signal, order_id, entry_price, leverage, engine);
        Ok(Some(self.insert_opened(position, recorder)))
    }

    fn filled_position(
        &self,
        signal: &Signal,
        order_id: String,
        entry_price: Decimal,
        leverage: Decimal,
        engine: &ExecutionEngine,
    ) -> Position {
        // What was actually sent, after lot and tick rounding
        let (size, stop_loss, take_profit) = match engine.order(&order_id) {
            Some(order) => (order.quantity, order.stop_loss, order.take_profit),
            None => (signal.size, signal.stop_loss, signal.take_profit),
        };

        Position {
            instrument: signal.instrument.clone(),
            direction: signal.direction,
            size,
            entry_price,
            stop_loss,
            take_profit,
            leverage,
            opened_at: Utc::now(),
            trailing_enabled: true,
            initial_stop_loss: stop_loss,
            order_id,
        }
    }

    fn insert_opened(&mut self, position: Position, recorder: &mut dyn OutcomeRecorder) -> &Position {
        recorder.on_position_opened(&position);
        log::info!(
            "Successfully opened position for {}: {} {} @ {}",
            position.instrument,
            position.direction,
            position.size,
            position.entry_price
        );

        let instrument = position.instrument.clone();
        self.positions.entry(instrument).or_insert(position)
    }

    /// Turn a resting entry into a position once reconciliation saw it fill.
    ///
    /// Cancelled or rejected entries are dropped. An entry the exchange no
    /// longer knows about while still marked `New` goes to the sync queue.
    /// Returns true when a position was opened.
    pub fn promote_resting(
        &mut self,
        instrument: &str,
        engine: &ExecutionEngine,
        recorder: &mut dyn OutcomeRecorder,
    ) -> bool {
        let entry = match self.resting.get(instrument) {
            Some(entry) => entry.clone(),
            None => return false,
        };

        match engine.order(&entry.order_id).map(|o| (o.status, o.price)) {
            Some((OrderStatus::Filled, price)) => {
                self.resting.remove(instrument);
                let leverage = match self.leverage_for(instrument) {
                    Ok(leverage) => leverage,
                    Err(e) => {
                        log::error!("Filled entry for {} not tracked: {}", instrument, e);
                        return false;
                    }
                };
                let entry_price = price.unwrap_or(entry.signal.entry_price);
                let position =
                    self.filled_position(&entry.signal, entry.order_id, entry_price, leverage, engine);
                self.insert_opened(position, recorder);
                true
            }
            Some((OrderStatus::New, _)) => {
                if !engine.open_order_ids().contains(&entry.order_id) {
                    log::warn!(
                        "Entry {} for {} vanished from the exchange, will re-check",
                        entry.order_id,
                        instrument
                    );
                    self.resting.remove(instrument);
                    self.pending_sync
                        .insert(instrument.to_string(), PendingSync::Entry(entry.signal));
                }
                false
            }
            Some((status, _)) => {
                log::info!("Entry {} for {} ended {}", entry.order_id, instrument, status);
                self.resting.remove(instrument);
                false
            }
            None => {
                self.resting.remove(instrument);
                false
            }
        }
    }

    /// Settle an unknown order outcome against the positions the exchange
    /// reports for `instrument`.
    ///
    /// An entry that did reach the exchange is adopted with the exchange's size
    /// and entry price. Adopted positions have no order to amend, so their
    /// trailing stop is off and exits are driven by the local checks alone. An
    /// exit the exchange applied is booked as a trade at `price`.
    pub fn sync_with_exchange(
        &mut self,
        instrument: &str,
        reported: &[ExchangePosition],
        price: Decimal,
        engine: &ExecutionEngine,
        risk: &mut RiskGate,
        recorder: &mut dyn OutcomeRecorder,
    ) {
        let pending = match self.pending_sync.remove(instrument) {
            Some(pending) => pending,
            None => return,
        };
        let live = reported
            .iter()
            .find(|p| p.instrument == instrument && p.size > Decimal::ZERO);
        let held = self.positions.contains_key(instrument);

        match (pending, live, held) {
            (PendingSync::Entry(signal), Some(found), false) => {
                let leverage = if found.leverage > Decimal::ZERO {
                    found.leverage
                } else {
                    signal_leverage(&self.instruments, instrument)
                };
                let direction = match found.side {
                    OrderSide::Buy => Direction::Long,
                    OrderSide::Sell => Direction::Short,
                };
                let stop_loss = signal.stop_loss.map(|p| engine.round_price(instrument, p));
                let position = Position {
                    instrument: instrument.to_string(),
                    direction,
                    size: found.size,
                    entry_price: found.entry_price,
                    stop_loss,
                    take_profit: signal.take_profit.map(|p| engine.round_price(instrument, p)),
                    leverage,
                    opened_at: Utc::now(),
                    trailing_enabled: false,
                    initial_stop_loss: stop_loss,
                    order_id: String::new(),
                };
                log::warn!("Adopting {} position for {} reported by the exchange", direction, instrument);
                self.insert_opened(position, recorder);
            }
            (PendingSync::Entry(_), None, _) => {
                log::info!("Entry for {} never reached the exchange", instrument);
            }
            (PendingSync::Exit(reason), None, true) => {
                if let Some(position) = self.positions.get(instrument).cloned() {
                    log::warn!("Exit for {} was applied by the exchange, booking it", instrument);
                    self.book_close(position, price, None, reason, risk, recorder);
                }
            }
            (PendingSync::Exit(_), Some(_), true) => {
                log::warn!("Position for {} still open on the exchange, kept", instrument);
            }
            (pending, _, _) => {
                log::warn!("Nothing to settle for {} ({:?})", instrument, pending);
            }
        }
    }

    /// Close the whole position. On failure the position stays open.
    ///
    /// `price` is used as the exit price when the exchange does not report
    /// an average fill.
    pub async fn close(
        &mut self,
        instrument: &str,
        price: Decimal,
        reason: CloseReason,
        engine: &mut ExecutionEngine,
        risk: &mut RiskGate,
        recorder: &mut dyn OutcomeRecorder,
    ) -> TradingResult<Trade> {
        let position = self
            .positions
            .get(instrument)
            .cloned()
            .ok_or_else(|| TradingError::PositionNotFound(instrument.to_string()))?;

        let result = engine.close(&position, reason).await;
        if !result.success {
            if result.outcome_unknown {
                log::warn!("Exit for {} may have reached the exchange, will re-check", instrument);
                self.pending_sync
                    .insert(instrument.to_string(), PendingSync::Exit(reason));
            }
            return Err(TradingError::Execution(result.error.unwrap_or_else(|| {
                format!("exit order for {} failed", instrument)
            })));
        }

        let exit_price = result.fill_price.unwrap_or(price);
        Ok(self.book_close(position, exit_price, result.order_id, reason, risk, recorder))
    }

    fn book_close(
        &mut self,
        position: Position,
        exit_price: Decimal,
        exit_order_id: Option<String>,
        reason: CloseReason,
        risk: &mut RiskGate,
        recorder: &mut dyn OutcomeRecorder,
    ) -> Trade {
        let gross_pnl = position.pnl_at(exit_price);
        let fees = (position.entry_price + exit_price)
            * position.size
            * position.leverage
            * self.config.fee_rate;

        let trade = Trade {
            instrument: position.instrument.clone(),
            direction: position.direction,
            size: position.size,
            leverage: position.leverage,
            entry_price: position.entry_price,
            exit_price,
            gross_pnl,
            fees,
            net_pnl: gross_pnl - fees,
            reason,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
            entry_order_id: position.order_id.clone(),
            exit_order_id,
        };

        risk.record_outcome(trade.net_pnl, true);
        recorder.on_position_closed(&trade);

        self.positions.remove(&position.instrument);
        self.trades.push(trade.clone());
        log::info!(
            "Successfully closed position for {}: pnl {} ({})",
            position.instrument,
            trade.net_pnl,
            reason
        );
        trade
    }

    /// Close every open position, logging and skipping individual failures.
    pub async fn close_all(
        &mut self,
        prices: &HashMap<String, Decimal>,
        reason: CloseReason,
        engine: &mut ExecutionEngine,
        risk: &mut RiskGate,
        recorder: &mut dyn OutcomeRecorder,
    ) -> BTreeMap<String, bool> {
        let held: Vec<(String, Decimal)> = self
            .positions
            .values()
            .map(|p| {
                let price = prices.get(&p.instrument).copied().unwrap_or(p.entry_price);
                (p.instrument.clone(), price)
            })
            .collect();

        let mut results = BTreeMap::new();
        for (instrument, price) in held {
            let closed = match self
                .close(&instrument, price, reason, engine, risk, recorder)
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    log::error!("Error closing position {}: {}", instrument, e);
                    false
                }
            };
            log::info!(
                "Close position {}: {}",
                instrument,
                if closed { "Success" } else { "Failed" }
            );
            results.insert(instrument, closed);
        }
        results
    }

    /// First close trigger that applies at `price`, if any.
    pub fn check_exit(
        &self,
        instrument: &str,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<CloseReason> {
        let position = self.positions.get(instrument)?;

        let (stop_hit, target_hit) = match position.direction {
            Direction::Long => (
                position.stop_loss.map_or(false, |sl| price <= sl),
                position.take_profit.map_or(false, |tp| price >= tp),
            ),
            Direction::Short => (
                position.stop_loss.map_or(false, |sl| price >= sl),
                position.take_profit.map_or(false, |tp| price <= tp),
            ),
        };

        if stop_hit {
            return Some(CloseReason::StopLoss);
        }
        if target_hit {
            return Some(CloseReason::TakeProfit);
        }
        if now - position.opened_at > Duration::seconds(self.config.max_hold_secs) {
            return Some(CloseReason::MaxHoldTime);
        }
        if position.move_pct(price) < -self.config.max_loss_pct {
            return Some(CloseReason::MaxLoss);
        }
        None
    }

    /// Candidate trailing stop at `price`, rounded to tick, or `None` when it
    /// would not tighten the current stop or would cross take-profit.
    pub fn trailing_candidate(
        &self,
        position: &Position,
        price: Decimal,
        volatility: Option<Decimal>,
        engine: &ExecutionEngine,
    ) -> Option<Decimal> {
        if !position.trailing_enabled {
            return None;
        }

        let distance = match volatility {
            Some(v) if v > Decimal::ZERO => v * self.config.trailing_atr_multiplier,
            _ => price * self.config.trailing_fallback_pct,
        };

        let candidate = match position.direction {
            Direction::Long => price - distance,
            Direction::Short => price + distance,
        };
        let candidate = engine.round_price(&position.instrument, candidate);
        if candidate <= Decimal::ZERO {
            return None;
        }

        let tightens = match (position.direction, position.stop_loss) {
            (_, None) => true,
            (Direction::Long, Some(current)) => candidate > current,
            (Direction::Short, Some(current)) => candidate < current,
        };
        let crosses_target = match (position.direction, position.take_profit) {
            (_, None) => false,
            (Direction::Long, Some(tp)) => candidate >= tp,
            (Direction::Short, Some(tp)) => candidate <= tp,
        };

        (tightens && !crosses_target).then_some(candidate)
    }

    /// Tighten the trailing stop for `instrument` if the market allows it.
    /// The stored stop only changes when the exchange accepted the amend.
    pub async fn update_trailing_stop(
        &mut self,
        instrument: &str,
        price: Decimal,
        volatility: Option<Decimal>,
        engine: &mut ExecutionEngine,
    ) -> Option<Decimal> {
        let position = self.positions.get(instrument)?.clone();
        let candidate = self.trailing_candidate(&position, price, volatility, engine)?;

        let result = engine.amend_stop(&position, candidate).await;
        if !result.success {
            log::warn!(
                "Trailing stop for {} kept at {:?}: {}",
                instrument,
                position.stop_loss,
                result.error.unwrap_or_default()
            );
            return None;
        }

        let stored = self.positions.get_mut(instrument)?;
        stored.stop_loss = Some(candidate);
        log::info!(
            "Updated trailing stop for {}: {:?} -> {}",
            instrument,
            position.stop_loss,
            candidate
        );
        Some(candidate)
    }

    /// Leveraged notional of every open position at entry
    pub fn exposure(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    /// Unrealized P&L per instrument for the prices given
    pub fn unrealized_pnl(&self, prices: &HashMap<String, Decimal>) -> BTreeMap<String, Decimal> {
        self.positions
            .values()
            .filter_map(|p| {
                prices
                    .get(&p.instrument)
                    .map(|price| (p.instrument.clone(), p.pnl_at(*price)))
            })
            .collect()
    }

    pub fn position_metrics(&self, instrument: &str, price: Decimal) -> Option<PositionMetrics> {
        let position = self.positions.get(instrument)?;
        let pnl = position.pnl_at(price);
        let value = position.entry_price * position.size;
        let pnl_percentage = if value > Decimal::ZERO {
            (pnl / value * Decimal::ONE_HUNDRED).round_dp(2)
        } else {
            Decimal::ZERO
        };

        Some(PositionMetrics {
            instrument: position.instrument.clone(),
            direction: position.direction,
            size: position.size,
            entry_price: position.entry_price,
            current_price: price,
            pnl,
            pnl_percentage,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            opened_at: position.opened_at,
            leverage: position.leverage,
            trailing_enabled: position.trailing_enabled,
        })
    }
}

fn signal_leverage(instruments: &HashMap<String, InstrumentConfig>, instrument: &str) -> Decimal {
    instruments
        .get(instrument)
        .map_or(Decimal::ONE, |inst| inst.leverage)
}

// Resting entries count as exposure: they can fill at any moment.
impl OpenExposure for PositionStore {
    fn open_count(&self) -> usize {
        self.positions.len() + self.resting.len()
    }

    fn direction_of(&self, instrument: &str) -> Option<Direction> {
        self.positions
            .get(instrument)
            .map(|p| p.direction)
            .or_else(|| self.resting.get(instrument).map(|r| r.signal.direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GatewayConfig};
    use crate::exchange::{Gateway, SimulatedExchange};
    use crate::trading::recorder::PerformanceRecorder;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Harness {
        store: PositionStore,
        engine: ExecutionEngine,
        risk: RiskGate,
        recorder: PerformanceRecorder,
        exchange: Arc<SimulatedExchange>,
    }

    async fn harness(fee_rate: Decimal) -> Harness {
        let config = Config::default();
        let exchange = Arc::new(SimulatedExchange::new(dec!(1000)));
        exchange.set_price("ETHUSDT", dec!(2000)).await;
        let gateway = Arc::new(Gateway::new(
            exchange.clone(),
            GatewayConfig {
                min_call_spacing_ms: 0,
                max_retries: 1,
                retry_delay_ms: 1,
            },
            true,
        ));
        let positions = PositionConfig {
            fee_rate,
            ..config.positions.clone()
        };
        Harness {
            store: PositionStore::new(positions, config.instruments.clone()),
            engine: ExecutionEngine::new(gateway, config.instruments.clone()),
            risk: RiskGate::new(config.risk.clone(), config.instruments.clone()),
            recorder: PerformanceRecorder::new(None),
            exchange,
        }
    }

    fn long_signal() -> Signal {
        Signal::open("ETHUSDT", Direction::Long, dec!(0.1), dec!(2000))
            .with_stop_loss(dec!(1950))
            .with_take_profit(dec!(2100))
    }

    #[tokio::test]
    async fn test_duplicate_open_is_invariant_violation() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap();

        let err = h
            .store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::InvariantViolation(_)));
        assert_eq!(h.store.open_count(), 1);
        assert_eq!(h.engine.orders_summary().total_orders, 1);
    }

    #[tokio::test]
    async fn test_close_books_trade_and_updates_risk() {
        let mut h = harness(dec!(0.001)).await;
        let opened = h
            .store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap()
            .unwrap()
            .clone();
        h.exchange.set_price("ETHUSDT", dec!(2050)).await;

        let trade = h
            .store
            .close(
                "ETHUSDT",
                dec!(2050),
                CloseReason::Manual,
                &mut h.engine,
                &mut h.risk,
                &mut h.recorder,
            )
            .await
            .unwrap();

        assert!(!h.store.has_position("ETHUSDT"));
        assert_eq!(h.store.trades().len(), 1);
        assert_eq!(trade.net_pnl, trade.gross_pnl - trade.fees);
        assert_eq!(trade.gross_pnl, opened.pnl_at(trade.exit_price));
        assert!(trade.fees > Decimal::ZERO);
        assert_eq!(h.risk.state().daily_trade_count, 1);
        assert_eq!(h.recorder.summary().total_trades, 1);
    }

    #[tokio::test]
    async fn test_close_unknown_instrument() {
        let mut h = harness(Decimal::ZERO).await;
        let err = h
            .store
            .close(
                "BTCUSDT",
                dec!(1),
                CloseReason::Manual,
                &mut h.engine,
                &mut h.risk,
                &mut h.recorder,
            )
            .await
            .unwrap_err();
        assert_eq!(err, TradingError::PositionNotFound("BTCUSDT".to_string()));
    }

    #[tokio::test]
    async fn test_exit_triggers() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap();
        let now = Utc::now();

        assert_eq!(h.store.check_exit("ETHUSDT", dec!(1949), now), Some(CloseReason::StopLoss));
        assert_eq!(h.store.check_exit("ETHUSDT", dec!(2100), now), Some(CloseReason::TakeProfit));
        assert_eq!(h.store.check_exit("ETHUSDT", dec!(2010), now), None);
        assert_eq!(
            h.store
                .check_exit("ETHUSDT", dec!(2010), now + Duration::hours(25)),
            Some(CloseReason::MaxHoldTime)
        );
        assert_eq!(h.store.check_exit("SOLUSDT", dec!(1), now), None);
    }

    #[tokio::test]
    async fn test_max_loss_without_stop() {
        let mut h = harness(Decimal::ZERO).await;
        let signal = Signal::open("ETHUSDT", Direction::Short, dec!(0.1), dec!(2000));
        let entry = h
            .store
            .open(&signal, &mut h.engine, &mut h.recorder)
            .await
            .unwrap()
            .unwrap()
            .entry_price;

        let far = entry * dec!(1.11);
        assert_eq!(
            h.store.check_exit("ETHUSDT", far, Utc::now()),
            Some(CloseReason::MaxLoss)
        );
    }

    #[tokio::test]
    async fn test_trailing_uses_volatility_and_fallback() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap();

        // 2 x ATR of 10 below 2060
        let stop = h
            .store
            .update_trailing_stop("ETHUSDT", dec!(2060), Some(dec!(10)), &mut h.engine)
            .await;
        assert_eq!(stop, Some(dec!(2040)));

        // Looser candidate is ignored
        let stop = h
            .store
            .update_trailing_stop("ETHUSDT", dec!(2045), Some(dec!(10)), &mut h.engine)
            .await;
        assert_eq!(stop, None);
        assert_eq!(h.store.get("ETHUSDT").unwrap().stop_loss, Some(dec!(2040)));

        // 2% fallback: 2090 * 0.98 = 2048.2
        let stop = h
            .store
            .update_trailing_stop("ETHUSDT", dec!(2090), None, &mut h.engine)
            .await;
        assert_eq!(stop, Some(dec!(2048.2)));
    }

    #[tokio::test]
    async fn test_trailing_never_crosses_take_profit() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap();

        let stop = h
            .store
            .update_trailing_stop("ETHUSDT", dec!(2200), Some(dec!(10)), &mut h.engine)
            .await;
        assert_eq!(stop, None);
        assert_eq!(h.store.get("ETHUSDT").unwrap().stop_loss, Some(dec!(1950)));
    }

    #[tokio::test]
    async fn test_rejected_amend_keeps_previous_stop() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap();
        // The exchange no longer knows the order the stop is attached to
        if let Some(position) = h.store.positions.get_mut("ETHUSDT") {
            position.order_id = "missing".to_string();
        }

        let stop = h
            .store
            .update_trailing_stop("ETHUSDT", dec!(2060), Some(dec!(10)), &mut h.engine)
            .await;
        assert_eq!(stop, None);
        assert_eq!(h.store.get("ETHUSDT").unwrap().stop_loss, Some(dec!(1950)));
    }

    #[tokio::test]
    async fn test_exposure_and_metrics() {
        let mut h = harness(Decimal::ZERO).await;
        let position = h
            .store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap()
            .unwrap()
            .clone();

        assert_eq!(h.store.exposure(), position.notional());

        let mut prices = HashMap::new();
        prices.insert("ETHUSDT".to_string(), position.entry_price + dec!(10));
        let pnl = h.store.unrealized_pnl(&prices);
        assert_eq!(pnl["ETHUSDT"], dec!(10) * dec!(0.1) * position.leverage);

        let metrics = h
            .store
            .position_metrics("ETHUSDT", position.entry_price)
            .unwrap();
        assert_eq!(metrics.pnl, Decimal::ZERO);
        assert!(metrics.trailing_enabled);
    }

    fn reported(side: OrderSide, size: Decimal, entry_price: Decimal) -> ExchangePosition {
        ExchangePosition {
            instrument: "ETHUSDT".to_string(),
            side,
            size,
            entry_price,
            mark_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            leverage: dec!(5),
        }
    }

    #[tokio::test]
    async fn test_unknown_exit_applied_by_exchange_is_booked() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap();
        h.store
            .pending_sync
            .insert("ETHUSDT".to_string(), PendingSync::Exit(CloseReason::StopLoss));
        assert!(h.store.needs_sync("ETHUSDT"));

        h.store.sync_with_exchange(
            "ETHUSDT",
            &[],
            dec!(1940),
            &h.engine,
            &mut h.risk,
            &mut h.recorder,
        );

        assert!(!h.store.needs_sync("ETHUSDT"));
        assert!(!h.store.has_position("ETHUSDT"));
        let trade = &h.store.trades()[0];
        assert_eq!(trade.reason, CloseReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(1940));
        assert_eq!(trade.exit_order_id, None);
        assert_eq!(h.risk.state().daily_trade_count, 1);
        assert_eq!(h.recorder.summary().total_trades, 1);
    }

    #[tokio::test]
    async fn test_unknown_exit_not_applied_keeps_position() {
        let mut h = harness(Decimal::ZERO).await;
        let entry = h
            .store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap()
            .unwrap()
            .entry_price;
        h.store
            .pending_sync
            .insert("ETHUSDT".to_string(), PendingSync::Exit(CloseReason::Manual));

        let still_open = [reported(OrderSide::Buy, dec!(0.1), entry)];
        h.store.sync_with_exchange(
            "ETHUSDT",
            &still_open,
            dec!(1990),
            &h.engine,
            &mut h.risk,
            &mut h.recorder,
        );

        assert!(!h.store.needs_sync("ETHUSDT"));
        assert!(h.store.has_position("ETHUSDT"));
        assert!(h.store.trades().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_entry_is_adopted_or_forgotten() {
        let mut h = harness(Decimal::ZERO).await;
        let signal = Signal::open("ETHUSDT", Direction::Short, dec!(0.1), dec!(2000))
            .with_stop_loss(dec!(2050.003))
            .with_take_profit(dec!(1900));

        // Not on the exchange: nothing is adopted and opens are free again
        h.store
            .pending_sync
            .insert("ETHUSDT".to_string(), PendingSync::Entry(signal.clone()));
        h.store
            .sync_with_exchange("ETHUSDT", &[], dec!(2000), &h.engine, &mut h.risk, &mut h.recorder);
        assert!(!h.store.needs_sync("ETHUSDT"));
        assert!(!h.store.has_position("ETHUSDT"));

        h.store
            .pending_sync
            .insert("ETHUSDT".to_string(), PendingSync::Entry(signal));
        let found = [reported(OrderSide::Sell, dec!(0.1), dec!(1998.5))];
        h.store
            .sync_with_exchange("ETHUSDT", &found, dec!(2000), &h.engine, &mut h.risk, &mut h.recorder);

        let adopted = h.store.get("ETHUSDT").unwrap();
        assert_eq!(adopted.direction, Direction::Short);
        assert_eq!(adopted.entry_price, dec!(1998.5));
        assert_eq!(adopted.leverage, dec!(5));
        assert_eq!(adopted.stop_loss, Some(dec!(2050)));
        assert!(!adopted.trailing_enabled);
        assert_eq!(h.recorder.summary().positions_opened, 1);
    }

    #[tokio::test]
    async fn test_open_refused_while_sync_pending() {
        let mut h = harness(Decimal::ZERO).await;
        h.store
            .pending_sync
            .insert("ETHUSDT".to_string(), PendingSync::Entry(long_signal()));

        let err = h
            .store
            .open(&long_signal(), &mut h.engine, &mut h.recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::InvariantViolation(_)));
        assert_eq!(h.engine.orders_summary().total_orders, 0);
    }
}
