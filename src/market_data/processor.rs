// src/market_data/processor.rs
use crate::domain::models::{Candle, Direction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

const MAX_CANDLES: usize = 1000;

/// Read-only view of one instrument's market state, handed to signal sources.
#[derive(Debug, Clone, Copy)]
pub struct MarketView<'a> {
    pub instrument: &'a str,
    /// Candles oldest first
    pub candles: &'a [Candle],
    pub last_price: Decimal,
    pub volatility: Option<Decimal>,
    /// Direction of the position currently held, if any
    pub open_direction: Option<Direction>,
}

/// Market data processor that stores candle history and last prices.
///
/// Owned by the trading controller; only the main cycle writes to it.
#[derive(Debug, Default)]
pub struct MarketDataProcessor {
    // Candle history by instrument
    histories: HashMap<String, Vec<Candle>>,

    // Latest traded price and when it was seen
    latest: HashMap<String, (Decimal, DateTime<Utc>)>,
}

impl MarketDataProcessor {
    /// Create a new market data processor
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge freshly fetched candles into the history.
    ///
    /// Candles at or before the newest stored timestamp replace the stored
    /// bar with the same timestamp (the still-forming bar updates every fetch).
    pub fn update_candles(&mut self, instrument: &str, candles: Vec<Candle>) {
        let history = self.histories.entry(instrument.to_string()).or_default();

        for candle in candles {
            match history.last() {
                Some(last) if candle.timestamp < last.timestamp => {
                    if let Some(existing) = history
                        .iter_mut()
                        .rev()
                        .find(|c| c.timestamp == candle.timestamp)
                    {
                        *existing = candle;
                    }
                }
                Some(last) if candle.timestamp == last.timestamp => {
                    if let Some(back) = history.last_mut() {
                        *back = candle;
                    }
                }
                _ => history.push(candle),
            }
        }

        // Remove oldest candles if we've exceeded the maximum
        if history.len() > MAX_CANDLES {
            let excess = history.len() - MAX_CANDLES;
            history.drain(0..excess);
        }

        if let Some(last) = history.last() {
            let (price, at) = (last.close, last.timestamp);
            self.latest
                .entry(instrument.to_string())
                .and_modify(|entry| {
                    if at >= entry.1 {
                        *entry = (price, at);
                    }
                })
                .or_insert((price, at));
        }
    }

    /// Record a ticker price
    pub fn update_price(&mut self, instrument: &str, price: Decimal, at: DateTime<Utc>) {
        self.latest.insert(instrument.to_string(), (price, at));
    }

    /// Get the latest price for an instrument
    pub fn latest_price(&self, instrument: &str) -> Option<Decimal> {
        self.latest.get(instrument).map(|(price, _)| *price)
    }

    /// Candle history, oldest first
    pub fn candles(&self, instrument: &str) -> &[Candle] {
        self.histories
            .get(instrument)
            .map(|history| history.as_slice())
            .unwrap_or(&[])
    }

    /// Snapshot of one instrument for signal generation. Volatility and
    /// position state are left empty for the caller to fill in.
    pub fn view<'a>(&'a self, instrument: &'a str) -> Option<MarketView<'a>> {
        let last_price = self.latest_price(instrument)?;
        Some(MarketView {
            instrument,
            candles: self.candles(instrument),
            last_price,
            volatility: None,
            open_direction: None,
        })
    }
}
