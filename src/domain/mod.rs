// src/domain/mod.rs
pub mod errors;
pub mod models;

// Re-export common types for convenience
pub use errors::{
    AppError, AppResult, ExchangeError, ExchangeResult, GatewayError, GatewayResult, TradingError,
    TradingResult,
};
pub use models::{
    Candle, CloseReason, Direction, ExchangePosition, Order, OrderAck, OrderKind, OrderRequest,
    OrderResult, OrderSide, OrderStatus, Position, Signal, SignalAction, Ticker, Trade,
};
