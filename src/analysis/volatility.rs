// src/analysis/volatility.rs
use crate::domain::errors::TradingResult;
use crate::domain::models::Candle;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use ta::indicators::AverageTrueRange;
use ta::{DataItem, Next};

/// Close prices as f64, oldest first
pub fn close_prices(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .filter_map(|c| c.close.to_f64())
        .collect()
}

fn to_data_item(candle: &Candle) -> TradingResult<DataItem> {
    let f = |d: Decimal| d.to_f64().unwrap_or(0.0);
    Ok(DataItem::builder()
        .open(f(candle.open))
        .high(f(candle.high))
        .low(f(candle.low))
        .close(f(candle.close))
        .volume(f(candle.volume))
        .build()?)
}

/// Average True Range over the last `period` candles.
///
/// Returns `None` when there are fewer than `period + 1` candles, in which
/// case callers fall back to a fixed percentage of price.
pub fn average_true_range(candles: &[Candle], period: usize) -> TradingResult<Option<Decimal>> {
    if period == 0 || candles.len() <= period {
        return Ok(None);
    }

    let mut atr = AverageTrueRange::new(period)?;
    let mut value = 0.0;
    for candle in candles {
        value = atr.next(&to_data_item(candle)?);
    }

    Ok(Decimal::from_f64(value).filter(|v| *v > Decimal::ZERO))
}
