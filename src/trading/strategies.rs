// src/trading/strategies.rs
use crate::analysis::close_prices;
use crate::config::InstrumentConfig;
use crate::domain::errors::{TradingError, TradingResult};
use crate::domain::models::{Direction, Signal};
use crate::market_data::MarketView;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ta::indicators::{ExponentialMovingAverage, RelativeStrengthIndex};
use ta::Next;

/// Capability every signal source implements. The execution core only
/// depends on this trait.
pub trait SignalSource: Send + Sync {
    /// Get the name of the strategy
    fn name(&self) -> &str;

    /// Inspect the market and optionally emit a signal.
    ///
    /// `Ok(None)` means "nothing to do this cycle"; an error means the
    /// computation itself failed.
    fn generate(
        &self,
        view: &MarketView<'_>,
        instrument: &InstrumentConfig,
    ) -> TradingResult<Option<Signal>>;
}

/// Built-in strategies, selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TrendFollowing,
    MeanReversion,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trend_following" | "trend" => Ok(StrategyKind::TrendFollowing),
            "mean_reversion" | "reversion" => Ok(StrategyKind::MeanReversion),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StrategyKind::TrendFollowing => write!(f, "trend_following"),
            StrategyKind::MeanReversion => write!(f, "mean_reversion"),
        }
    }
}

/// Create a signal source for `kind` with default parameters
pub fn create_strategy(kind: StrategyKind) -> Box<dyn SignalSource> {
    match kind {
        StrategyKind::TrendFollowing => Box::new(TrendFollowingStrategy::new(9, 21)),
        StrategyKind::MeanReversion => Box::new(MeanReversionStrategy::new(14, 30.0, 70.0)),
    }
}

/// Entry signal with stop and target placed at the instrument's configured distances.
fn entry_signal(
    view: &MarketView<'_>,
    instrument: &InstrumentConfig,
    direction: Direction,
    confidence: f64,
) -> Signal {
    let entry = view.last_price;
    let (stop_loss, take_profit) = match direction {
        Direction::Long => (
            entry * (Decimal::ONE - instrument.stop_loss_pct),
            entry * (Decimal::ONE + instrument.take_profit_pct),
        ),
        Direction::Short => (
            entry * (Decimal::ONE + instrument.stop_loss_pct),
            entry * (Decimal::ONE - instrument.take_profit_pct),
        ),
    };

    Signal::open(view.instrument, direction, instrument.default_size, entry)
        .with_stop_loss(stop_loss)
        .with_take_profit(take_profit)
        .with_confidence(confidence)
}

/// EMA crossover. Opens in the direction of a fresh cross when flat and
/// exits a held position when the averages cross against it.
pub struct TrendFollowingStrategy {
    fast_period: usize,
    slow_period: usize,
}

impl TrendFollowingStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast_period,
            slow_period,
        }
    }

    /// Last two (fast, slow) EMA pairs
    fn ema_pairs(&self, closes: &[f64]) -> TradingResult<((f64, f64), (f64, f64))> {
        let mut fast = ExponentialMovingAverage::new(self.fast_period)?;
        let mut slow = ExponentialMovingAverage::new(self.slow_period)?;

        let mut previous = (0.0, 0.0);
        let mut current = (0.0, 0.0);
        for close in closes {
            previous = current;
            current = (fast.next(*close), slow.next(*close));
        }
        Ok((previous, current))
    }
}

impl SignalSource for TrendFollowingStrategy {
    fn name(&self) -> &str {
        "trend_following"
    }

    fn generate(
        &self,
        view: &MarketView<'_>,
        instrument: &InstrumentConfig,
    ) -> TradingResult<Option<Signal>> {
        if self.fast_period >= self.slow_period {
            return Err(TradingError::Strategy(format!(
                "fast period {} must be below slow period {}",
                self.fast_period, self.slow_period
            )));
        }

        let closes = close_prices(view.candles);
        if closes.len() < self.slow_period + 2 {
            return Ok(None);
        }

        let ((fast_prev, slow_prev), (fast_now, slow_now)) = self.ema_pairs(&closes)?;
        let crossed_up = fast_prev <= slow_prev && fast_now > slow_now;
        let crossed_down = fast_prev >= slow_prev && fast_now < slow_now;

        let signal = match (view.open_direction, crossed_up, crossed_down) {
            (Some(Direction::Long), _, true) => Some(Signal::close(
                view.instrument,
                Direction::Long,
                view.last_price,
            )),
            (Some(Direction::Short), true, _) => Some(Signal::close(
                view.instrument,
                Direction::Short,
                view.last_price,
            )),
            (None, true, _) | (None, _, true) => {
                let direction = if crossed_up {
                    Direction::Long
                } else {
                    Direction::Short
                };
                // Separation of the averages relative to price
                let spread = ((fast_now - slow_now) / slow_now * 100.0).abs();
                Some(entry_signal(view, instrument, direction, 0.5 + spread.min(0.5)))
            }
            _ => None,
        };

        Ok(signal)
    }
}

/// RSI mean reversion. Buys oversold and sells overbought when flat, exits
/// once RSI returns through the midline.
pub struct MeanReversionStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl MeanReversionStrategy {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Self {
        Self {
            period,
            oversold,
            overbought,
        }
    }

    fn rsi(&self, closes: &[f64]) -> TradingResult<f64> {
        let mut rsi = RelativeStrengthIndex::new(self.period)?;
        let mut value = 50.0;
        for close in closes {
            value = rsi.next(*close);
        }
        Ok(value)
    }
}

impl SignalSource for MeanReversionStrategy {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn generate(
        &self,
        view: &MarketView<'_>,
        instrument: &InstrumentConfig,
    ) -> TradingResult<Option<Signal>> {
        let closes = close_prices(view.candles);
        if closes.len() <= self.period {
            return Ok(None);
        }

        let rsi = self.rsi(&closes)?;
        let depth = |distance: f64| 0.5 + (distance / 60.0).min(0.5);

        let signal = match view.open_direction {
            Some(Direction::Long) if rsi > 50.0 => Some(Signal::close(
                view.instrument,
                Direction::Long,
                view.last_price,
            )),
            Some(Direction::Short) if rsi < 50.0 => Some(Signal::close(
                view.instrument,
                Direction::Short,
                view.last_price,
            )),
            None if rsi < self.oversold => Some(entry_signal(
                view,
                instrument,
                Direction::Long,
                depth(self.oversold - rsi),
            )),
            None if rsi > self.overbought => Some(entry_signal(
                view,
                instrument,
                Direction::Short,
                depth(rsi - self.overbought),
            )),
            _ => None,
        };

        if let Some(signal) = &signal {
            log::debug!(
                "{} RSI {:.1} -> {}",
                view.instrument,
                rsi,
                signal
            );
        }
        Ok(signal)
    }
}
