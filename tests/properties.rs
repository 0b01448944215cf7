//! Property tests for the execution core:
//! 1. At most one open position per instrument under any open/close sequence
//! 2. Trailing stops only ever tighten
//! 3. The risk gate never allows a signal while emergency-stopped

mod common;

use chrono::{NaiveDate, NaiveDateTime};
use common::*;
use perpbot::domain::errors::TradingError;
use perpbot::domain::models::{CloseReason, Direction, Signal};
use perpbot::exchange::{Gateway, SimulatedExchange};
use perpbot::trading::risk::OpenExposure;
use perpbot::trading::{ExecutionEngine, PerformanceRecorder, PositionStore, RiskGate};
use proptest::prelude::*;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;
use std::sync::Arc;

const SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn sim_parts() -> (ExecutionEngine, PositionStore, RiskGate, PerformanceRecorder) {
    let config = test_config(Decimal::ZERO);
    let exchange = Arc::new(SimulatedExchange::new(dec!(10000)));
    for (symbol, price) in SYMBOLS.iter().zip([dec!(30000), dec!(2000), dec!(100)]) {
        exchange.set_price(symbol, price).await;
    }
    let gateway = Arc::new(Gateway::new(exchange, fast_gateway_config(), true));

    (
        ExecutionEngine::new(gateway, config.instruments.clone()),
        PositionStore::new(config.positions.clone(), config.instruments.clone()),
        RiskGate::new(config.risk.clone(), config.instruments.clone()),
        PerformanceRecorder::new(None),
    )
}

fn decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(2)
}

struct Flat;

impl OpenExposure for Flat {
    fn open_count(&self) -> usize {
        0
    }

    fn direction_of(&self, _instrument: &str) -> Option<Direction> {
        None
    }
}

// ── 1. Single position per instrument ────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn at_most_one_position_per_instrument(
        ops in prop::collection::vec((0usize..3, any::<bool>()), 1..25),
    ) {
        let config = test_config(Decimal::ZERO);
        runtime().block_on(async {
            let (mut engine, mut store, mut risk, mut recorder) = sim_parts().await;
            let mut held = BTreeSet::new();

            for (index, open) in ops {
                let symbol = SYMBOLS[index];
                if open {
                    let inst = config.instrument(symbol).unwrap();
                    let signal = Signal::open(symbol, Direction::Long, inst.default_size, dec!(1));
                    let result = store.open(&signal, &mut engine, &mut recorder).await;
                    if held.contains(symbol) {
                        prop_assert!(matches!(result, Err(TradingError::InvariantViolation(_))));
                    } else {
                        prop_assert!(result.is_ok());
                        held.insert(symbol);
                    }
                } else {
                    let result = store
                        .close(symbol, dec!(1), CloseReason::Manual, &mut engine, &mut risk, &mut recorder)
                        .await;
                    prop_assert_eq!(result.is_ok(), held.remove(symbol));
                }

                prop_assert_eq!(store.open_count(), held.len());
                prop_assert!(store.positions().count() <= SYMBOLS.len());
            }
            Ok(())
        })?;
    }
}

// ── 2. Trailing stop monotonicity ────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn trailing_stop_only_tightens(
        short in any::<bool>(),
        steps in prop::collection::vec((-30.0..30.0_f64, prop::option::of(1.0..40.0_f64)), 1..30),
    ) {
        runtime().block_on(async {
            let (mut engine, mut store, _risk, mut recorder) = sim_parts().await;
            let direction = if short { Direction::Short } else { Direction::Long };
            // No stop and a distant target so every step is eligible
            let mut signal = Signal::open("ETHUSDT", direction, dec!(0.1), dec!(2000));
            signal.take_profit = Some(if short { dec!(10) } else { dec!(100000) });
            store.open(&signal, &mut engine, &mut recorder).await.unwrap();

            let mut price = dec!(2000);
            let mut previous: Option<Decimal> = None;
            for (change, atr) in steps {
                price = (price + decimal(change)).max(dec!(100));
                store
                    .update_trailing_stop("ETHUSDT", price, atr.map(decimal), &mut engine)
                    .await;

                let current = store.get("ETHUSDT").unwrap().stop_loss;
                if let (Some(before), Some(now)) = (previous, current) {
                    if short {
                        prop_assert!(now <= before, "short stop loosened {} -> {}", before, now);
                    } else {
                        prop_assert!(now >= before, "long stop loosened {} -> {}", before, now);
                    }
                }
                if previous.is_some() {
                    prop_assert!(current.is_some());
                }
                previous = current;
            }
            Ok(())
        })?;
    }
}

// ── 3. Emergency stop blocks everything ──────────────────────────────

proptest! {
    #[test]
    fn emergency_stop_denies_every_signal(
        long in any::<bool>(),
        entry in 1.0..50000.0_f64,
        stop_offset in -0.5..0.5_f64,
        target_offset in -0.5..0.5_f64,
        size in 0.0..10.0_f64,
        minute in 0u32..1440,
    ) {
        let config = test_config(Decimal::ZERO);
        let mut gate = RiskGate::new(config.risk.clone(), config.instruments.clone());
        gate.record_outcome(dec!(-1000), true);
        prop_assert!(gate.is_emergency_stopped());

        let direction = if long { Direction::Long } else { Direction::Short };
        let entry_price = decimal(entry);
        let signal = Signal::open("ETHUSDT", direction, Decimal::from_f64(size).unwrap_or_default(), entry_price)
            .with_stop_loss(entry_price * (Decimal::ONE + decimal(stop_offset)))
            .with_take_profit(entry_price * (Decimal::ONE + decimal(target_offset)));

        let now: NaiveDateTime = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(minute / 60, minute % 60, 0)
            .unwrap();
        prop_assert!(!gate.validate_at(&signal, &Flat, now).is_allowed());
        prop_assert!(gate.is_emergency_stopped());
    }
}
