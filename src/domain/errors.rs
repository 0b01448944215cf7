// src/domain/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Trading error: {0}")]
    Trading(#[from] TradingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors produced by a single exchange round trip, before any retry policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Response parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Transient failures are worth another attempt; rejections and bad input are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::RateLimit(_) | ExchangeError::Parse(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimit(_))
    }
}

/// Errors surfaced by the gateway after spacing and retries have been applied.
///
/// `Exhausted` means the outcome is unknown: the request may or may not have
/// reached the exchange, so callers must re-query state instead of assuming
/// nothing happened.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} failed after {attempts} attempts (outcome unknown): {last_error}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
}

impl GatewayError {
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, GatewayError::Exhausted { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("No open position for {0}")]
    PositionNotFound(String),

    #[error("Order execution error: {0}")]
    Execution(String),

    #[error("Strategy error: {0}")]
    Strategy(String),
}

impl From<ta::errors::TaError> for TradingError {
    fn from(e: ta::errors::TaError) -> Self {
        TradingError::Strategy(format!("indicator error: {:?}", e))
    }
}

// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;
pub type ExchangeResult<T> = Result<T, ExchangeError>;
pub type GatewayResult<T> = Result<T, GatewayError>;
pub type TradingResult<T> = Result<T, TradingError>;
