// src/market_data/mod.rs
pub mod processor;

pub use processor::{MarketDataProcessor, MarketView};
