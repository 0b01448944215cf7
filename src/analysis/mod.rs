// src/analysis/mod.rs
pub mod volatility;

pub use volatility::{average_true_range, close_prices};
