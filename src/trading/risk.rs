// src/trading/risk.rs
use crate::config::{InstrumentConfig, RiskConfig};
use crate::domain::errors::{AppError, AppResult};
use crate::domain::models::{Direction, Signal};
use chrono::{Local, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;

/// Read access to currently held exposure, needed by the position checks.
pub trait OpenExposure {
    fn open_count(&self) -> usize;
    fn direction_of(&self, instrument: &str) -> Option<Direction>;
}

/// Why a signal was refused. A denial is a decision, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    EmergencyStop(String),
    OutsideTradingHours,
    MaintenanceWindow,
    DailyLossLimit { daily_loss: Decimal, limit: Decimal },
    DailyTradeLimit { trades: u32, limit: u32 },
    MaxOpenPositions { open: usize, limit: usize },
    RiskRewardTooLow { ratio: Decimal, minimum: Decimal },
    ZeroRisk,
    UnknownInstrument,
    SizeOutOfBounds { size: Decimal, min: Decimal, max: Decimal },
    ConflictingDirection { existing: Direction },
    DrawdownExceeded { drawdown: Decimal, limit: Decimal },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DenyReason::EmergencyStop(reason) => write!(f, "emergency stop active: {}", reason),
            DenyReason::OutsideTradingHours => write!(f, "outside trading hours"),
            DenyReason::MaintenanceWindow => write!(f, "inside maintenance window"),
            DenyReason::DailyLossLimit { daily_loss, limit } => {
                write!(f, "daily loss limit reached ({} >= {})", daily_loss, limit)
            }
            DenyReason::DailyTradeLimit { trades, limit } => {
                write!(f, "daily trade limit reached ({} >= {})", trades, limit)
            }
            DenyReason::MaxOpenPositions { open, limit } => {
                write!(f, "max open positions reached ({} >= {})", open, limit)
            }
            DenyReason::RiskRewardTooLow { ratio, minimum } => write!(
                f,
                "risk/reward ratio too low ({:.2} < {})",
                ratio, minimum
            ),
            DenyReason::ZeroRisk => write!(f, "stop loss equals entry price"),
            DenyReason::UnknownInstrument => write!(f, "no configuration for instrument"),
            DenyReason::SizeOutOfBounds { size, min, max } => {
                write!(f, "size {} outside [{}, {}]", size, min, max)
            }
            DenyReason::ConflictingDirection { existing } => {
                write!(f, "conflicting direction with open {} position", existing)
            }
            DenyReason::DrawdownExceeded { drawdown, limit } => {
                write!(f, "maximum drawdown exceeded ({:.4} > {})", drawdown, limit)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allow,
    Deny(DenyReason),
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }
}

/// Daily counters and the emergency switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub daily_loss: Decimal,
    pub daily_profit: Decimal,
    pub daily_trade_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub emergency_stopped: bool,
    pub emergency_reason: String,
    pub last_reset_date: NaiveDate,
    pub peak_balance: Decimal,
    pub max_drawdown: Decimal,
}

impl RiskState {
    fn fresh(today: NaiveDate) -> Self {
        Self {
            daily_loss: Decimal::ZERO,
            daily_profit: Decimal::ZERO,
            daily_trade_count: 0,
            win_count: 0,
            loss_count: 0,
            emergency_stopped: false,
            emergency_reason: String::new(),
            last_reset_date: today,
            peak_balance: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
        }
    }
}

/// Summary of the risk state for reporting
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub daily_trades: u32,
    pub daily_profit: Decimal,
    pub daily_loss: Decimal,
    pub net_pnl: Decimal,
    pub win_rate: Decimal,
    pub max_drawdown: Decimal,
    pub emergency_stop: bool,
    pub emergency_reason: String,
    pub last_reset: NaiveDate,
}

/// Stateful gate in front of every opening order.
pub struct RiskGate {
    config: RiskConfig,
    instruments: HashMap<String, InstrumentConfig>,
    state: RiskState,
}

impl RiskGate {
    pub fn new(config: RiskConfig, instruments: HashMap<String, InstrumentConfig>) -> Self {
        let today = Local::now().date_naive();
        Self {
            config,
            instruments,
            state: RiskState::fresh(today),
        }
    }

    /// Build a gate, restoring persisted state when `state_path` is set and
    /// the file exists. A file that cannot be parsed is an error.
    pub fn restore(
        config: RiskConfig,
        instruments: HashMap<String, InstrumentConfig>,
    ) -> AppResult<Self> {
        let mut gate = Self::new(config, instruments);

        if let Some(path) = &gate.config.state_path {
            if path.exists() {
                let contents = fs::read_to_string(path)?;
                gate.state = serde_json::from_str(&contents).map_err(|e| {
                    AppError::Config(format!(
                        "corrupt risk state in {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                log::info!(
                    "Restored risk state from {} (emergency stop: {})",
                    path.display(),
                    gate.state.emergency_stopped
                );
            }
        }

        Ok(gate)
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.state.emergency_stopped
    }

    /// Validate an opening signal against the current local time.
    pub fn validate(&mut self, signal: &Signal, exposure: &impl OpenExposure) -> RiskDecision {
        self.validate_at(signal, exposure, Local::now().naive_local())
    }

    /// Ordered, short-circuiting validation chain. Only the drawdown check
    /// has a side effect: it trips the emergency stop.
    pub fn validate_at(
        &mut self,
        signal: &Signal,
        exposure: &impl OpenExposure,
        now: NaiveDateTime,
    ) -> RiskDecision {
        let decision = self.evaluate(signal, exposure, now);

        if let RiskDecision::Deny(reason) = &decision {
            log::warn!("Signal denied for {}: {} [{}]", signal.instrument, reason, signal);
        } else {
            log::info!("Position validation passed for {}", signal.instrument);
        }
        decision
    }

    fn evaluate(
        &mut self,
        signal: &Signal,
        exposure: &impl OpenExposure,
        now: NaiveDateTime,
    ) -> RiskDecision {
        use RiskDecision::Deny;

        if self.state.emergency_stopped {
            return Deny(DenyReason::EmergencyStop(self.state.emergency_reason.clone()));
        }

        let hours = &self.config.trading_hours;
        if !hours.is_trading_time(now.time()) {
            return Deny(DenyReason::OutsideTradingHours);
        }
        if hours.is_maintenance(now.time()) {
            return Deny(DenyReason::MaintenanceWindow);
        }

        if self.state.daily_loss >= self.config.max_daily_loss {
            return Deny(DenyReason::DailyLossLimit {
                daily_loss: self.state.daily_loss,
                limit: self.config.max_daily_loss,
            });
        }
        if self.state.daily_trade_count >= self.config.max_daily_trades {
            return Deny(DenyReason::DailyTradeLimit {
                trades: self.state.daily_trade_count,
                limit: self.config.max_daily_trades,
            });
        }

        let open = exposure.open_count();
        if open >= self.config.max_open_positions {
            return Deny(DenyReason::MaxOpenPositions {
                open,
                limit: self.config.max_open_positions,
            });
        }

        if let Some(reason) = self.check_risk_reward(signal) {
            return Deny(reason);
        }

        match self.instruments.get(&signal.instrument) {
            None => return Deny(DenyReason::UnknownInstrument),
            Some(inst) if signal.size < inst.min_position || signal.size > inst.max_position => {
                return Deny(DenyReason::SizeOutOfBounds {
                    size: signal.size,
                    min: inst.min_position,
                    max: inst.max_position,
                });
            }
            Some(_) => {}
        }

        if let Some(existing) = exposure.direction_of(&signal.instrument) {
            if existing != signal.direction {
                return Deny(DenyReason::ConflictingDirection { existing });
            }
        }

        if self.state.max_drawdown > self.config.drawdown_limit {
            let reason = DenyReason::DrawdownExceeded {
                drawdown: self.state.max_drawdown,
                limit: self.config.drawdown_limit,
            };
            self.trigger_emergency_stop("Maximum drawdown exceeded");
            return Deny(reason);
        }

        RiskDecision::Allow
    }

    /// Reward over risk. Skipped when any price is missing or non-positive.
    fn check_risk_reward(&self, signal: &Signal) -> Option<DenyReason> {
        let (stop_loss, take_profit) = match (signal.stop_loss, signal.take_profit) {
            (Some(sl), Some(tp)) => (sl, tp),
            _ => return None,
        };
        if signal.entry_price <= Decimal::ZERO
            || stop_loss <= Decimal::ZERO
            || take_profit <= Decimal::ZERO
        {
            return None;
        }

        let risk = (signal.entry_price - stop_loss).abs();
        let reward = (take_profit - signal.entry_price).abs();
        if risk.is_zero() {
            return Some(DenyReason::ZeroRisk);
        }

        let ratio = reward / risk;
        if ratio < self.config.min_risk_reward {
            return Some(DenyReason::RiskRewardTooLow {
                ratio,
                minimum: self.config.min_risk_reward,
            });
        }
        None
    }

    /// Update daily counters after a realized trade and re-check the
    /// emergency triggers.
    pub fn record_outcome(&mut self, pnl: Decimal, closed: bool) {
        if closed {
            self.state.daily_trade_count += 1;
            if pnl > Decimal::ZERO {
                self.state.daily_profit += pnl;
                self.state.win_count += 1;
            } else {
                self.state.daily_loss += pnl.abs();
                self.state.loss_count += 1;
            }
            log::info!(
                "Trade recorded: pnl {} (daily profit {}, daily loss {}, trades {})",
                pnl,
                self.state.daily_profit,
                self.state.daily_loss,
                self.state.daily_trade_count
            );
        }

        self.check_emergency_conditions();
        self.persist();
    }

    fn check_emergency_conditions(&mut self) {
        if self.state.daily_loss > self.config.emergency_daily_loss {
            let reason = format!("Emergency loss limit exceeded: {}", self.state.daily_loss);
            self.trigger_emergency_stop(&reason);
        }

        if self.state.loss_count >= self.config.max_consecutive_losses
            && self.state.win_count == 0
        {
            self.trigger_emergency_stop("Too many consecutive losing trades");
        }
    }

    fn trigger_emergency_stop(&mut self, reason: &str) {
        if !self.state.emergency_stopped {
            log::error!("EMERGENCY STOP TRIGGERED: {}", reason);
        }
        self.state.emergency_stopped = true;
        self.state.emergency_reason = reason.to_string();
        self.persist();
    }

    /// Clear the emergency stop. Only ever called by an operator.
    pub fn reset_emergency(&mut self) {
        self.state.emergency_stopped = false;
        self.state.emergency_reason.clear();
        log::info!("Emergency stop reset manually");
        self.persist();
    }

    /// Reset the daily counters when `today` is a new local day. The
    /// emergency stop and drawdown tracking carry over.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today <= self.state.last_reset_date {
            return false;
        }

        self.state = RiskState {
            emergency_stopped: self.state.emergency_stopped,
            emergency_reason: std::mem::take(&mut self.state.emergency_reason),
            peak_balance: self.state.peak_balance,
            max_drawdown: self.state.max_drawdown,
            ..RiskState::fresh(today)
        };
        log::info!("Daily metrics reset for {}", today);
        self.persist();
        true
    }

    /// Track peak balance and the worst drawdown from it.
    pub fn update_equity(&mut self, balance: Decimal) {
        let mut changed = false;
        if balance > self.state.peak_balance {
            self.state.peak_balance = balance;
            changed = true;
        }
        if self.state.peak_balance > Decimal::ZERO {
            let drawdown = (self.state.peak_balance - balance) / self.state.peak_balance;
            if drawdown > self.state.max_drawdown {
                self.state.max_drawdown = drawdown;
                changed = true;
                log::warn!("New maximum drawdown: {:.4}", drawdown);
            }
        }
        if changed {
            self.persist();
        }
    }

    /// Size that risks `risk_per_trade` of `balance` between entry and stop,
    /// clamped to the instrument bounds and the notional cap, and scaled down
    /// while in drawdown. Zero when no sensible size exists.
    pub fn position_size(
        &self,
        balance: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        instrument: &str,
    ) -> Decimal {
        if balance <= Decimal::ZERO || entry_price <= Decimal::ZERO {
            log::warn!("Invalid account balance or entry price");
            return Decimal::ZERO;
        }

        let distance = (entry_price - stop_loss).abs();
        if distance < dec!(0.00000001) {
            log::warn!("Stop-loss too close to entry price for {}", instrument);
            return Decimal::ZERO;
        }

        let inst = match self.instruments.get(instrument) {
            Some(inst) => inst,
            None => return Decimal::ZERO,
        };

        let risk_amount = balance * self.config.risk_per_trade;
        let mut size = (risk_amount / distance)
            .min(inst.max_position)
            .max(inst.min_position);

        if size * entry_price > self.config.max_position_value {
            size = self.config.max_position_value / entry_price;
        }

        if self.state.max_drawdown > Decimal::ZERO {
            let factor = (Decimal::ONE - self.state.max_drawdown * dec!(2)).max(dec!(0.5));
            size *= factor;
        }

        size.round_dp(8)
    }

    pub fn metrics(&self) -> RiskMetrics {
        let win_rate = if self.state.daily_trade_count > 0 {
            Decimal::from(self.state.win_count) / Decimal::from(self.state.daily_trade_count)
                * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        RiskMetrics {
            daily_trades: self.state.daily_trade_count,
            daily_profit: self.state.daily_profit.round_dp(2),
            daily_loss: self.state.daily_loss.round_dp(2),
            net_pnl: (self.state.daily_profit - self.state.daily_loss).round_dp(2),
            win_rate: win_rate.round_dp(2),
            max_drawdown: self.state.max_drawdown.round_dp(4),
            emergency_stop: self.state.emergency_stopped,
            emergency_reason: self.state.emergency_reason.clone(),
            last_reset: self.state.last_reset_date,
        }
    }

    fn persist(&self) {
        let path = match &self.config.state_path {
            Some(path) => path,
            None => return,
        };

        let result = serde_json::to_string_pretty(&self.state)
            .map_err(AppError::from)
            .and_then(|json| fs::write(path, json).map_err(AppError::from));

        if let Err(e) = result {
            log::error!("Failed to persist risk state to {}: {}", path.display(), e);
        }
    }
}
