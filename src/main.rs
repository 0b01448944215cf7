// src/main.rs
use perpbot::config::Config;
use perpbot::domain::errors::AppResult;
use perpbot::exchange::{BybitClient, ExchangeClient, Gateway, SimulatedExchange};
use perpbot::trading::reporter::spawn_reporter;
use perpbot::trading::TradingController;

use std::sync::Arc;
use tokio::signal::ctrl_c;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    config.init_logging()?;

    log::info!("Starting perpbot v{}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "Using Bybit {} ({})",
        if config.exchange.testnet { "testnet" } else { "mainnet" },
        if config.exchange.simulation { "simulated orders" } else { "LIVE orders" }
    );

    // Create exchange client
    let client = create_exchange_client(&config);
    let gateway = Arc::new(Gateway::new(
        client,
        config.gateway.clone(),
        config.exchange.simulation,
    ));

    let mut controller = TradingController::new(config.clone(), gateway)?;

    // Wire shutdown and start the reporter
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = spawn_reporter(
        controller.subscribe(),
        shutdown_rx.clone(),
        config.trading.report_interval(),
    );

    tokio::spawn(async move {
        match ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl+C, stopping after the current cycle..."),
            Err(e) => log::error!("Failed to listen for control-c event: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    log::info!("Bot is running. Press Ctrl+C to stop.");
    let result = controller.run(shutdown_rx).await;

    if let Err(e) = reporter.await {
        log::error!("Reporter task failed: {}", e);
    }

    log::info!("Shutdown complete. Goodbye!");
    result
}

/// Live client, or the paper exchange fed by live market data in simulation.
fn create_exchange_client(config: &Config) -> Arc<dyn ExchangeClient> {
    let bybit: Arc<dyn ExchangeClient> = Arc::new(BybitClient::new(&config.exchange));
    if !config.exchange.simulation {
        return bybit;
    }

    log::info!(
        "Simulation mode: paper balance {}, fee rate {}",
        config.exchange.paper_balance,
        config.positions.fee_rate
    );
    Arc::new(
        SimulatedExchange::with_feed(config.exchange.paper_balance, bybit)
            .with_fee_rate(config.positions.fee_rate),
    )
}
