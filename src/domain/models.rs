// src/domain/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::ExchangeError;

/// Exposure direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "BUY")]
    Long,
    #[serde(alias = "SELL")]
    Short,
}

impl Direction {
    /// Order side that opens exposure in this direction.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces exposure in this direction.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Open,
    Close,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalAction::Open => write!(f, "OPEN"),
            SignalAction::Close => write!(f, "CLOSE"),
        }
    }
}

/// A candidate trading instruction produced by a strategy, not yet risk-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: String,
    pub action: SignalAction,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    /// Limit price for the entry order. `None` sends a market order.
    pub limit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    pub fn open(instrument: &str, direction: Direction, size: Decimal, entry_price: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            action: SignalAction::Open,
            direction,
            size,
            entry_price,
            limit_price: None,
            stop_loss: None,
            take_profit: None,
            confidence: 1.0,
            generated_at: Utc::now(),
        }
    }

    pub fn close(instrument: &str, direction: Direction, price: Decimal) -> Self {
        Self {
            action: SignalAction::Close,
            ..Self::open(instrument, direction, Decimal::ZERO, price)
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: Decimal) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_limit_price(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} size={} entry={} sl={:?} tp={:?} conf={:.2}",
            self.action,
            self.direction,
            self.instrument,
            self.size,
            self.entry_price,
            self.stop_loss,
            self.take_profit,
            self.confidence
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "Market",
            OrderKind::Limit => "Limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::New)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrderStatus::New => write!(f, "NEW"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Parameters of a place-order call as sent over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn kind(&self) -> OrderKind {
        if self.price.is_some() {
            OrderKind::Limit
        } else {
            OrderKind::Market
        }
    }

    /// Basic parameter checks applied before any network call, live or simulated.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        validate_instrument(&self.instrument)?;
        if self.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Validation(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        for (name, value) in [
            ("price", self.price),
            ("stop_loss", self.stop_loss),
            ("take_profit", self.take_profit),
        ] {
            if let Some(v) = value {
                if v <= Decimal::ZERO {
                    return Err(ExchangeError::Validation(format!(
                        "{} must be positive, got {}",
                        name, v
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Instrument symbols are upper-case alphanumerics, e.g. `BTCUSDT` or `1000PEPEUSDT`.
pub fn validate_instrument(instrument: &str) -> Result<(), ExchangeError> {
    let well_formed = instrument.len() >= 3
        && instrument
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if well_formed {
        Ok(())
    } else {
        Err(ExchangeError::Validation(format!(
            "malformed instrument symbol '{}'",
            instrument
        )))
    }
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    pub avg_price: Option<Decimal>,
}

/// Local record of an order, owned by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub reduce_only: bool,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an execution-engine operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub fill_price: Option<Decimal>,
    /// Status reported when the order was accepted
    pub status: Option<OrderStatus>,
    pub error: Option<String>,
    /// The request may have reached the exchange even though it failed here
    pub outcome_unknown: bool,
}

impl OrderResult {
    pub fn ok(order_id: &str, fill_price: Option<Decimal>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.to_string()),
            fill_price,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Failure after which exchange state has to be re-queried
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            outcome_unknown: true,
            ..Self::failed(error)
        }
    }

    /// Accepted but still resting on the book
    pub fn is_resting(&self) -> bool {
        self.success && self.status.map_or(false, |s| !s.is_terminal())
    }
}

/// An open exposure in one instrument. Owned by the position store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: Decimal,
    pub opened_at: DateTime<Utc>,
    pub trailing_enabled: bool,
    pub initial_stop_loss: Option<Decimal>,
    pub order_id: String,
}

impl Position {
    /// Direction-signed `(price - entry) * size * leverage`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.direction.sign() * (price - self.entry_price) * self.size * self.leverage
    }

    /// Price move against entry in percent, positive when in profit. Leverage is not applied.
    pub fn move_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.direction.sign() * (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * self.size * self.leverage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    MaxHoldTime,
    MaxLoss,
    StrategyExit,
    Shutdown,
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::MaxHoldTime => "max_time",
            CloseReason::MaxLoss => "max_loss",
            CloseReason::StrategyExit => "strategy_exit",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Immutable record of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub direction: Direction,
    pub size: Decimal,
    pub leverage: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub entry_order_id: String,
    pub exit_order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub instrument: String,
    pub last_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Position as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub instrument: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pnl_is_direction_signed_and_levered() {
        let mut position = Position {
            instrument: "BTCUSDT".to_string(),
            direction: Direction::Long,
            size: dec!(2),
            entry_price: dec!(100),
            stop_loss: None,
            take_profit: None,
            leverage: dec!(5),
            opened_at: Utc::now(),
            trailing_enabled: true,
            initial_stop_loss: None,
            order_id: "1".to_string(),
        };
        assert_eq!(position.pnl_at(dec!(101)), dec!(10));

        position.direction = Direction::Short;
        assert_eq!(position.pnl_at(dec!(101)), dec!(-10));
        assert_eq!(position.move_pct(dec!(90)), dec!(10));
    }

    #[test]
    fn test_order_request_validation() {
        let mut request = OrderRequest {
            instrument: "ETHUSDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(0.1),
            price: None,
            stop_loss: Some(dec!(95)),
            take_profit: None,
            reduce_only: false,
        };
        assert!(request.validate().is_ok());
        assert_eq!(request.kind(), OrderKind::Market);

        request.quantity = Decimal::ZERO;
        assert!(matches!(request.validate(), Err(ExchangeError::Validation(_))));

        request.quantity = dec!(1);
        request.instrument = "eth-usdt".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_direction_parses_buy_sell_aliases() {
        let d: Direction = serde_json::from_str("\"BUY\"").unwrap();
        assert_eq!(d, Direction::Long);
        let d: Direction = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(d, Direction::Short);
    }
}
