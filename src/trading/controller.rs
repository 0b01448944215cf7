// src/trading/controller.rs
use crate::analysis::average_true_range;
use crate::config::Config;
use crate::domain::errors::{AppResult, TradingError};
use crate::domain::models::{CloseReason, Position, Signal, SignalAction};
use crate::exchange::Gateway;
use crate::market_data::{MarketDataProcessor, MarketView};
use crate::trading::execution::{ExecutionEngine, OrdersSummary};
use crate::trading::positions::PositionStore;
use crate::trading::recorder::{OutcomeRecorder, PerformanceRecorder, PerformanceSummary};
use crate::trading::risk::{RiskDecision, RiskGate, RiskMetrics};
use crate::trading::strategies::{create_strategy, SignalSource};
use chrono::{DateTime, Duration, Local, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// Consistent copy of controller state, published at the end of every cycle.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub cycle: u64,
    pub taken_at: DateTime<Utc>,
    pub simulated: bool,
    pub balance: Decimal,
    pub positions: Vec<Position>,
    pub unrealized_pnl: BTreeMap<String, Decimal>,
    pub exposure: Decimal,
    pub risk: RiskMetrics,
    pub orders: OrdersSummary,
    pub performance: PerformanceSummary,
}

/// Owns every component and drives the decision cycle. Nothing else writes
/// to the position store, risk gate or order registry.
pub struct TradingController {
    config: Config,
    gateway: Arc<Gateway>,
    market: MarketDataProcessor,
    strategy: Box<dyn SignalSource>,
    risk: RiskGate,
    engine: ExecutionEngine,
    positions: PositionStore,
    recorder: PerformanceRecorder,
    balance: Decimal,
    cycle: u64,
    snapshots: watch::Sender<Arc<ControllerSnapshot>>,
}

impl TradingController {
    pub fn new(config: Config, gateway: Arc<Gateway>) -> AppResult<Self> {
        let risk = RiskGate::restore(config.risk.clone(), config.instruments.clone())?;
        Ok(Self::with_parts(
            config.clone(),
            gateway,
            create_strategy(config.trading.strategy),
            risk,
        ))
    }

    /// Assemble a controller around an explicit strategy and risk gate.
    pub fn with_parts(
        config: Config,
        gateway: Arc<Gateway>,
        strategy: Box<dyn SignalSource>,
        risk: RiskGate,
    ) -> Self {
        let engine = ExecutionEngine::new(gateway.clone(), config.instruments.clone());
        let positions = PositionStore::new(config.positions.clone(), config.instruments.clone());
        let recorder = PerformanceRecorder::new(config.recorder.path.clone());

        let initial = ControllerSnapshot {
            cycle: 0,
            taken_at: Utc::now(),
            simulated: gateway.is_simulated(),
            balance: Decimal::ZERO,
            positions: Vec::new(),
            unrealized_pnl: BTreeMap::new(),
            exposure: Decimal::ZERO,
            risk: risk.metrics(),
            orders: engine.orders_summary(),
            performance: recorder.summary().clone(),
        };
        let (snapshots, _) = watch::channel(Arc::new(initial));

        log::info!(
            "Controller ready: strategy {}, symbols {:?}, {} mode",
            strategy.name(),
            config.trading.symbols,
            if gateway.is_simulated() { "simulation" } else { "live" }
        );

        Self {
            config,
            gateway,
            market: MarketDataProcessor::new(),
            strategy,
            risk,
            engine,
            positions,
            recorder,
            balance: Decimal::ZERO,
            cycle: 0,
            snapshots,
        }
    }

    /// Receiver for the snapshot published after each cycle.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ControllerSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn positions(&self) -> &PositionStore {
        &self.positions
    }

    pub fn risk(&self) -> &RiskGate {
        &self.risk
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }

    /// Run cycles until `shutdown` flips to true, then close out.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        log::info!("Trading loop started");

        while !*shutdown.borrow() {
            if let Err(e) = self.run_cycle().await {
                log::error!("Error in main loop: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.trading.cycle_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// One pass over every configured instrument.
    pub async fn run_cycle(&mut self) -> AppResult<()> {
        self.cycle += 1;
        log::debug!("Starting cycle {}", self.cycle);

        self.risk.roll_day(Local::now().date_naive());

        let can_open = match self.gateway.wallet_balance(&self.config.trading.quote_coin).await {
            Ok(balance) => {
                self.balance = balance;
                self.risk.update_equity(balance);
                self.recorder.set_initial_balance(balance);
                if balance < self.config.trading.min_balance {
                    log::warn!(
                        "Balance {} below minimum {}, no new positions this cycle",
                        balance,
                        self.config.trading.min_balance
                    );
                }
                balance >= self.config.trading.min_balance
            }
            Err(e) => {
                log::error!("Failed to fetch wallet balance: {}", e);
                false
            }
        };

        for symbol in self.config.trading.symbols.clone() {
            if let Err(e) = self.process_instrument(&symbol, can_open).await {
                log::error!("Error processing {}: {}", symbol, e);
            }
        }

        let every = self.config.trading.reconcile_every;
        if every > 0 && self.cycle % every == 0 {
            let removed = self.engine.reconcile().await;
            if removed > 0 {
                log::info!("Reconciled {} completed orders", removed);
            }
        }

        self.publish();
        Ok(())
    }

    /// One instrument's share of a cycle. Only a missing price ends it early;
    /// failures in candles, indicators, strategy or signal execution are
    /// logged and exits still run.
    async fn process_instrument(&mut self, symbol: &str, can_open: bool) -> AppResult<()> {
        let since = (Utc::now() - Duration::days(1)).timestamp_millis();
        match self
            .gateway
            .klines(
                symbol,
                &self.config.trading.interval,
                Some(since),
                None,
                self.config.trading.kline_limit,
            )
            .await
        {
            Ok(candles) => self.market.update_candles(symbol, candles),
            Err(e) => log::warn!("Kline refresh for {} failed: {}", symbol, e),
        }

        let ticker = self.gateway.ticker(symbol).await?;
        self.market
            .update_price(symbol, ticker.last_price, ticker.timestamp);
        let price = ticker.last_price;

        let mut can_open = can_open;
        if self.positions.needs_sync(symbol) {
            match self.gateway.positions(symbol).await {
                Ok(reported) => self.positions.sync_with_exchange(
                    symbol,
                    &reported,
                    price,
                    &self.engine,
                    &mut self.risk,
                    &mut self.recorder,
                ),
                Err(e) => {
                    log::error!("Position check for {} failed, opens blocked: {}", symbol, e);
                    can_open = false;
                }
            }
        }
        self.positions
            .promote_resting(symbol, &self.engine, &mut self.recorder);

        let volatility =
            match average_true_range(self.market.candles(symbol), self.config.positions.atr_period) {
                Ok(volatility) => volatility,
                Err(e) => {
                    log::warn!("ATR for {} unavailable: {}", symbol, e);
                    None
                }
            };

        let signal = match self.signal_for(symbol, volatility) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Signal generation for {} failed: {}", symbol, e);
                None
            }
        };

        if let Some(signal) = signal {
            if let Err(e) = self.execute_signal(symbol, signal, price, can_open).await {
                log::error!("Signal for {} not executed: {}", symbol, e);
            }
        }

        if let Some(reason) = self.positions.check_exit(symbol, price, Utc::now()) {
            log::info!("Exit triggered for {}: {}", symbol, reason);
            self.positions
                .close(
                    symbol,
                    price,
                    reason,
                    &mut self.engine,
                    &mut self.risk,
                    &mut self.recorder,
                )
                .await?;
        } else if self.positions.has_position(symbol) {
            self.positions
                .update_trailing_stop(symbol, price, volatility, &mut self.engine)
                .await;
        }

        Ok(())
    }

    fn signal_for(
        &self,
        symbol: &str,
        volatility: Option<Decimal>,
    ) -> Result<Option<Signal>, TradingError> {
        let instrument = self
            .config
            .instrument(symbol)
            .ok_or_else(|| TradingError::Validation(format!("no configuration for {}", symbol)))?;

        match self.market.view(symbol) {
            Some(view) => {
                let view = MarketView {
                    volatility,
                    open_direction: self.positions.get(symbol).map(|p| p.direction),
                    ..view
                };
                self.strategy.generate(&view, instrument)
            }
            None => Ok(None),
        }
    }

    async fn execute_signal(
        &mut self,
        symbol: &str,
        mut signal: Signal,
        price: Decimal,
        can_open: bool,
    ) -> Result<(), TradingError> {
        log::info!("Signal for {}: {}", symbol, signal);
        match signal.action {
            SignalAction::Close => {
                let held = self.positions.get(symbol).map(|p| p.direction);
                if held == Some(signal.direction) {
                    self.positions
                        .close(
                            symbol,
                            price,
                            CloseReason::StrategyExit,
                            &mut self.engine,
                            &mut self.risk,
                            &mut self.recorder,
                        )
                        .await?;
                } else {
                    log::info!("Close signal for {} ignored: no matching position", symbol);
                }
            }
            SignalAction::Open if !can_open => {
                log::info!("Open signal for {} skipped: opens blocked this cycle", symbol);
            }
            SignalAction::Open => {
                if let Some(stop) = signal.stop_loss {
                    let sized = self
                        .risk
                        .position_size(self.balance, signal.entry_price, stop, symbol);
                    if sized > Decimal::ZERO {
                        signal.size = sized;
                    }
                }

                match self.risk.validate(&signal, &self.positions) {
                    RiskDecision::Allow => {
                        self.positions
                            .open(&signal, &mut self.engine, &mut self.recorder)
                            .await?;
                    }
                    // The gate already logged the reason at warn level
                    RiskDecision::Deny(reason) => {
                        log::debug!("Open for {} dropped after denial: {}", symbol, reason);
                    }
                }
            }
        }
        Ok(())
    }

    /// Close every position with reason `Shutdown`, then flush the recorder.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        log::info!("Shutting down trading controller...");

        let prices: HashMap<String, Decimal> = self
            .positions
            .positions()
            .filter_map(|p| {
                self.market
                    .latest_price(&p.instrument)
                    .map(|price| (p.instrument.clone(), price))
            })
            .collect();

        let results = self
            .positions
            .close_all(
                &prices,
                CloseReason::Shutdown,
                &mut self.engine,
                &mut self.risk,
                &mut self.recorder,
            )
            .await;
        let failed = results.values().filter(|closed| !**closed).count();
        if failed > 0 {
            log::error!("{} positions could not be closed on shutdown", failed);
        }

        self.publish();
        self.recorder.flush()?;
        log::info!("Trading controller stopped");
        Ok(())
    }

    fn publish(&self) {
        let prices: HashMap<String, Decimal> = self
            .config
            .trading
            .symbols
            .iter()
            .filter_map(|s| self.market.latest_price(s).map(|p| (s.clone(), p)))
            .collect();

        let snapshot = ControllerSnapshot {
            cycle: self.cycle,
            taken_at: Utc::now(),
            simulated: self.gateway.is_simulated(),
            balance: self.balance,
            positions: self.positions.positions().cloned().collect(),
            unrealized_pnl: self.positions.unrealized_pnl(&prices),
            exposure: self.positions.exposure(),
            risk: self.risk.metrics(),
            orders: self.engine.orders_summary(),
            performance: self.recorder.summary().clone(),
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}
