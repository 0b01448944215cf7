// src/trading/reporter.rs
use crate::trading::controller::ControllerSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn the periodic status reporter. It only ever reads published
/// snapshots and stops when `shutdown` flips to true.
pub fn spawn_reporter(
    snapshots: watch::Receiver<Arc<ControllerSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; skip it so the first report has data
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = snapshots.borrow().clone();
                    for line in report_lines(&snapshot) {
                        log::info!("{}", line);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::debug!("Reporter stopped");
    })
}

/// Render a snapshot as log lines.
pub fn report_lines(snapshot: &ControllerSnapshot) -> Vec<String> {
    let mut lines = vec![format!(
        "=== Status report: cycle {} at {} ({}) ===",
        snapshot.cycle,
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S"),
        if snapshot.simulated { "simulation" } else { "live" }
    )];

    lines.push(format!(
        "Balance: {} | Exposure: {} | Open positions: {}",
        snapshot.balance.round_dp(2),
        snapshot.exposure.round_dp(2),
        snapshot.positions.len()
    ));

    for position in &snapshot.positions {
        let pnl = snapshot
            .unrealized_pnl
            .get(&position.instrument)
            .copied()
            .unwrap_or_default();
        lines.push(format!(
            "  {}: {} {} @ {} SL {:?} TP {:?} uPnL {}",
            position.instrument,
            position.direction,
            position.size,
            position.entry_price,
            position.stop_loss,
            position.take_profit,
            pnl.round_dp(4)
        ));
    }

    let risk = &snapshot.risk;
    lines.push(format!(
        "Daily: trades {} | profit {} | loss {} | net {} | win rate {}% | max drawdown {}",
        risk.daily_trades,
        risk.daily_profit,
        risk.daily_loss,
        risk.net_pnl,
        risk.win_rate,
        risk.max_drawdown
    ));
    if risk.emergency_stop {
        lines.push(format!("EMERGENCY STOP ACTIVE: {}", risk.emergency_reason));
    }

    let perf = &snapshot.performance;
    lines.push(format!(
        "Session: {} trades | win rate {}% | net {} | fees {} | orders {} ({} open)",
        perf.total_trades,
        perf.win_rate,
        perf.net_pnl.round_dp(4),
        perf.total_fees.round_dp(4),
        snapshot.orders.total_orders,
        snapshot.orders.open_orders
    ));
    if perf.total_trades > 0 {
        let profit_factor = perf
            .profit_factor
            .map_or_else(|| "n/a".to_string(), |pf| pf.round_dp(2).to_string());
        lines.push(format!(
            "Quality: profit factor {} | expectancy {} | sharpe {:.2} | sortino {:.2} | return {}%",
            profit_factor,
            perf.expectancy.round_dp(4),
            perf.sharpe_ratio,
            perf.sortino_ratio,
            perf.total_return_pct
        ));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::{Gateway, SimulatedExchange};
    use crate::trading::controller::TradingController;
    use rust_decimal_macros::dec;

    fn controller() -> TradingController {
        let exchange = Arc::new(SimulatedExchange::new(dec!(1000)));
        let gateway = Arc::new(Gateway::new(exchange, Default::default(), true));
        TradingController::new(Config::default(), gateway).unwrap()
    }

    #[test]
    fn test_report_lines_for_empty_snapshot() {
        let controller = controller();
        let snapshot = controller.subscribe().borrow().clone();

        let lines = report_lines(&snapshot);
        assert!(lines[0].contains("cycle 0"));
        assert!(lines[0].contains("simulation"));
        assert!(lines.iter().any(|l| l.starts_with("Balance:")));
        assert!(!lines.iter().any(|l| l.contains("EMERGENCY")));
        assert!(!lines.iter().any(|l| l.starts_with("Quality:")));
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let controller = controller();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_reporter(controller.subscribe(), rx, Duration::from_secs(3600));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
