// src/exchange/mod.rs
pub mod bybit;
pub mod client;
pub mod gateway;
pub mod simulator;

pub use bybit::BybitClient;
pub use client::ExchangeClient;
pub use gateway::Gateway;
pub use simulator::SimulatedExchange;
