// src/trading/recorder.rs
use crate::domain::errors::AppResult;
use crate::domain::models::{Position, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

const RISK_FREE_RATE: f64 = 0.02;
const PERIODS_PER_YEAR: f64 = 252.0;

/// Passive sink for position lifecycle events.
pub trait OutcomeRecorder: Send {
    fn on_position_opened(&mut self, position: &Position);

    fn on_position_closed(&mut self, trade: &Trade);

    /// Persist whatever has been recorded so far
    fn flush(&mut self) -> AppResult<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstrumentPerformance {
    pub trades: u32,
    pub wins: u32,
    pub net_pnl: Decimal,
    pub fees: Decimal,
}

/// Running performance figures over every recorded trade
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub started_at: DateTime<Utc>,
    pub positions_opened: u32,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: Decimal,
    pub gross_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    /// Worst peak-to-trough decline of cumulative net P&L
    pub max_drawdown: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    /// Gross wins over gross losses; `None` while nothing has lost
    pub profit_factor: Option<Decimal>,
    pub expectancy: Decimal,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub avg_trade_duration_secs: i64,
    pub initial_balance: Decimal,
    pub total_return_pct: Decimal,
    pub trades_per_day: Decimal,
    pub by_instrument: BTreeMap<String, InstrumentPerformance>,
    pub by_reason: BTreeMap<String, u32>,
}

impl PerformanceSummary {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            positions_opened: 0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: Decimal::ZERO,
            gross_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            net_pnl: Decimal::ZERO,
            best_trade: Decimal::ZERO,
            worst_trade: Decimal::ZERO,
            consecutive_wins: 0,
            consecutive_losses: 0,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            max_drawdown: Decimal::ZERO,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            profit_factor: None,
            expectancy: Decimal::ZERO,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            avg_trade_duration_secs: 0,
            initial_balance: Decimal::ZERO,
            total_return_pct: Decimal::ZERO,
            trades_per_day: Decimal::ZERO,
            by_instrument: BTreeMap::new(),
            by_reason: BTreeMap::new(),
        }
    }
}

/// Per-trade return on position value in percent, before fees and without leverage
fn trade_roi(trade: &Trade) -> f64 {
    let value = trade.entry_price * trade.size;
    if value <= Decimal::ZERO {
        return 0.0;
    }
    (trade.gross_pnl / value * Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; zero below two values
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Annualised Sharpe and Sortino ratios over per-trade returns
fn risk_adjusted(returns: &[f64]) -> (f64, f64) {
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let excess: Vec<f64> = returns
        .iter()
        .map(|r| r - RISK_FREE_RATE / PERIODS_PER_YEAR)
        .collect();
    let m = mean(&excess);
    let annualise = PERIODS_PER_YEAR.sqrt();

    let sd = std_dev(&excess);
    let sharpe = if sd > 0.0 { annualise * m / sd } else { 0.0 };

    let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
    let dd = std_dev(&downside);
    let sortino = if dd > 0.0 { annualise * m / dd } else { 0.0 };

    (sharpe, sortino)
}

#[derive(Serialize)]
struct PerformanceFile<'a> {
    summary: &'a PerformanceSummary,
    trades: &'a [Trade],
}

/// Keeps trade history and statistics in memory and writes them as JSON on
/// flush when a path is configured.
pub struct PerformanceRecorder {
    path: Option<PathBuf>,
    summary: PerformanceSummary,
    trades: Vec<Trade>,
    peak_pnl: Decimal,
}

impl PerformanceRecorder {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            summary: PerformanceSummary::new(),
            trades: Vec::new(),
            peak_pnl: Decimal::ZERO,
        }
    }

    pub fn with_initial_balance(mut self, balance: Decimal) -> Self {
        self.set_initial_balance(balance);
        self
    }

    /// Balance returns are measured against. Only the first positive value counts.
    pub fn set_initial_balance(&mut self, balance: Decimal) {
        if self.summary.initial_balance > Decimal::ZERO || balance <= Decimal::ZERO {
            return;
        }
        self.summary.initial_balance = balance;
        self.update_ratios(Utc::now());
    }

    pub fn summary(&self) -> &PerformanceSummary {
        &self.summary
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Recompute the figures that depend on the whole trade history
    fn update_ratios(&mut self, now: DateTime<Utc>) {
        let s = &mut self.summary;
        if s.initial_balance > Decimal::ZERO {
            s.total_return_pct =
                (s.net_pnl / s.initial_balance * Decimal::ONE_HUNDRED).round_dp(2);
        }
        if self.trades.is_empty() {
            return;
        }

        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) = self
            .trades
            .iter()
            .map(|t| t.net_pnl)
            .filter(|pnl| !pnl.is_zero())
            .partition(|pnl| *pnl > Decimal::ZERO);
        let win_sum: Decimal = wins.iter().sum();
        let loss_sum: Decimal = losses.iter().sum();

        s.avg_win = if wins.is_empty() {
            Decimal::ZERO
        } else {
            (win_sum / Decimal::from(wins.len())).round_dp(4)
        };
        s.avg_loss = if losses.is_empty() {
            Decimal::ZERO
        } else {
            (loss_sum / Decimal::from(losses.len())).round_dp(4)
        };
        s.profit_factor = if loss_sum.is_zero() {
            None
        } else {
            Some((win_sum / loss_sum).abs().round_dp(4))
        };

        let total = Decimal::from(self.trades.len());
        let win_share = Decimal::from(s.winning_trades) / total;
        s.expectancy = (win_share * s.avg_win + (Decimal::ONE - win_share) * s.avg_loss).round_dp(4);

        let returns: Vec<f64> = self.trades.iter().map(trade_roi).collect();
        let (sharpe, sortino) = risk_adjusted(&returns);
        s.sharpe_ratio = sharpe;
        s.sortino_ratio = sortino;

        let held: i64 = self
            .trades
            .iter()
            .map(|t| (t.closed_at - t.opened_at).num_seconds())
            .sum();
        s.avg_trade_duration_secs = held / self.trades.len() as i64;

        let days = (now - s.started_at).num_days().max(1);
        s.trades_per_day = (total / Decimal::from(days)).round_dp(2);
    }
}

impl OutcomeRecorder for PerformanceRecorder {
    fn on_position_opened(&mut self, position: &Position) {
        self.summary.positions_opened += 1;
        log::info!(
            "Position opened: {} {} {} @ {} (SL {:?}, TP {:?})",
            position.instrument,
            position.direction,
            position.size,
            position.entry_price,
            position.stop_loss,
            position.take_profit
        );
    }

    fn on_position_closed(&mut self, trade: &Trade) {
        let s = &mut self.summary;
        s.total_trades += 1;
        s.gross_pnl += trade.gross_pnl;
        s.total_fees += trade.fees;
        s.net_pnl += trade.net_pnl;

        if trade.net_pnl > Decimal::ZERO {
            s.winning_trades += 1;
            s.consecutive_wins += 1;
            s.consecutive_losses = 0;
            s.max_consecutive_wins = s.max_consecutive_wins.max(s.consecutive_wins);
        } else {
            s.losing_trades += 1;
            s.consecutive_losses += 1;
            s.consecutive_wins = 0;
            s.max_consecutive_losses = s.max_consecutive_losses.max(s.consecutive_losses);
        }

        if s.total_trades == 1 {
            s.best_trade = trade.net_pnl;
            s.worst_trade = trade.net_pnl;
        } else {
            s.best_trade = s.best_trade.max(trade.net_pnl);
            s.worst_trade = s.worst_trade.min(trade.net_pnl);
        }

        s.win_rate = (Decimal::from(s.winning_trades) / Decimal::from(s.total_trades)
            * Decimal::ONE_HUNDRED)
            .round_dp(2);

        self.peak_pnl = self.peak_pnl.max(s.net_pnl);
        s.max_drawdown = s.max_drawdown.max(self.peak_pnl - s.net_pnl);

        let per = s.by_instrument.entry(trade.instrument.clone()).or_default();
        per.trades += 1;
        per.net_pnl += trade.net_pnl;
        per.fees += trade.fees;
        if trade.net_pnl > Decimal::ZERO {
            per.wins += 1;
        }
        *s.by_reason.entry(trade.reason.to_string()).or_insert(0) += 1;

        log::info!(
            "Position closed: {} @ {} pnl {} fees {} ({})",
            trade.instrument,
            trade.exit_price,
            trade.net_pnl,
            trade.fees,
            trade.reason
        );
        self.trades.push(trade.clone());
        self.update_ratios(Utc::now());
    }

    fn flush(&mut self) -> AppResult<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = PerformanceFile {
            summary: &self.summary,
            trades: &self.trades,
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        log::info!("Performance data saved to {}", path.display());
        Ok(())
    }
}
