// src/trading/mod.rs
pub mod controller;
pub mod execution;
pub mod positions;
pub mod recorder;
pub mod reporter;
pub mod risk;
pub mod strategies;

pub use controller::{ControllerSnapshot, TradingController};
pub use execution::ExecutionEngine;
pub use positions::PositionStore;
pub use recorder::{OutcomeRecorder, PerformanceRecorder};
pub use risk::{RiskDecision, RiskGate};
pub use strategies::{create_strategy, SignalSource, StrategyKind};
