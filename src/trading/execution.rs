// src/trading/execution.rs
use crate::config::InstrumentConfig;
use crate::domain::models::{
    CloseReason, Order, OrderRequest, OrderResult, OrderStatus, Position, Signal,
};
use crate::exchange::Gateway;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Round `value` to the nearest multiple of `step`.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).round() * step).normalize()
}

/// Aggregate view of the order registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrdersSummary {
    pub total_orders: usize,
    pub open_orders: usize,
    pub status_breakdown: BTreeMap<String, usize>,
    pub last_order_time: Option<DateTime<Utc>>,
}

/// Turns signals and position actions into exchange orders and keeps the
/// local order registry.
///
/// Every order ever placed stays in `orders`; `open` holds the ids that are
/// not yet known to be terminal.
pub struct ExecutionEngine {
    gateway: Arc<Gateway>,
    instruments: HashMap<String, InstrumentConfig>,
    orders: HashMap<String, Order>,
    open: BTreeSet<String>,
    // Instruments whose configured leverage the exchange has confirmed
    leverage_set: HashSet<String>,
}

impl ExecutionEngine {
    pub fn new(gateway: Arc<Gateway>, instruments: HashMap<String, InstrumentConfig>) -> Self {
        Self {
            gateway,
            instruments,
            orders: HashMap::new(),
            open: BTreeSet::new(),
            leverage_set: HashSet::new(),
        }
    }

    /// Round a price to the instrument's tick size
    pub fn round_price(&self, instrument: &str, price: Decimal) -> Decimal {
        match self.instruments.get(instrument) {
            Some(inst) => round_to_step(price, inst.tick_size),
            None => price,
        }
    }

    /// Round a quantity to the instrument's lot size
    pub fn round_quantity(&self, instrument: &str, quantity: Decimal) -> Decimal {
        match self.instruments.get(instrument) {
            Some(inst) => round_to_step(quantity, inst.lot_size),
            None => quantity,
        }
    }

    /// Place the entry order for a validated signal.
    pub async fn open(&mut self, signal: &Signal) -> OrderResult {
        let leverage = match self.instruments.get(&signal.instrument) {
            Some(inst) => inst.leverage,
            None => {
                log::error!("No configuration found for {}", signal.instrument);
                return OrderResult::failed(format!(
                    "no configuration found for {}",
                    signal.instrument
                ));
            }
        };

        if !self.leverage_set.contains(&signal.instrument) {
            if let Err(e) = self.gateway.set_leverage(&signal.instrument, leverage).await {
                log::error!("Failed to set leverage for {}: {}", signal.instrument, e);
                return OrderResult::failed(format!("leverage not set: {}", e));
            }
            log::info!("Leverage for {} set to {}", signal.instrument, leverage);
            self.leverage_set.insert(signal.instrument.clone());
        }

        let instrument = signal.instrument.as_str();
        let quantity = self.round_quantity(instrument, signal.size);
        if quantity <= Decimal::ZERO {
            log::error!(
                "Invalid quantity for {}: {} rounds to {}",
                instrument,
                signal.size,
                quantity
            );
            return OrderResult::failed(format!(
                "quantity {} rounds to zero for {}",
                signal.size, instrument
            ));
        }

        let request = OrderRequest {
            instrument: instrument.to_string(),
            side: signal.direction.entry_side(),
            quantity,
            price: signal.limit_price.map(|p| self.round_price(instrument, p)),
            stop_loss: signal.stop_loss.map(|p| self.round_price(instrument, p)),
            take_profit: signal.take_profit.map(|p| self.round_price(instrument, p)),
            reduce_only: false,
        };

        log::info!(
            "Placing order for {}: {} {} @ {:?}",
            instrument,
            request.side,
            request.quantity,
            request.price
        );
        self.submit(request).await
    }

    /// Close the full size of `position` with a reduce-only market order.
    pub async fn close(&mut self, position: &Position, reason: CloseReason) -> OrderResult {
        let request = OrderRequest {
            instrument: position.instrument.clone(),
            side: position.direction.exit_side(),
            quantity: position.size,
            price: None,
            stop_loss: None,
            take_profit: None,
            reduce_only: true,
        };

        log::info!(
            "Closing {} {} {} ({})",
            position.direction,
            position.size,
            position.instrument,
            reason
        );
        self.submit(request).await
    }

    /// Move the stop-loss attached to the position's entry order.
    pub async fn amend_stop(&mut self, position: &Position, new_stop: Decimal) -> OrderResult {
        let new_stop = self.round_price(&position.instrument, new_stop);

        match self
            .gateway
            .amend_stop(&position.instrument, &position.order_id, new_stop)
            .await
        {
            Ok(()) => {
                if let Some(order) = self.orders.get_mut(&position.order_id) {
                    order.stop_loss = Some(new_stop);
                }
                log::info!("Stop loss updated for {}: {}", position.instrument, new_stop);
                OrderResult::ok(&position.order_id, None)
            }
            Err(e) => {
                log::error!(
                    "Failed to update stop loss for {}: {}",
                    position.instrument,
                    e
                );
                OrderResult::failed(e.to_string())
            }
        }
    }

    /// Cancel a known order by id.
    pub async fn cancel(&mut self, order_id: &str) -> OrderResult {
        let instrument = match self.orders.get(order_id) {
            Some(order) => order.instrument.clone(),
            None => return OrderResult::failed(format!("unknown order {}", order_id)),
        };

        match self.gateway.cancel_order(&instrument, order_id).await {
            Ok(()) => {
                if let Some(order) = self.orders.get_mut(order_id) {
                    order.status = OrderStatus::Cancelled;
                }
                self.open.remove(order_id);
                log::info!("Order cancelled successfully: {}", order_id);
                OrderResult::ok(order_id, None)
            }
            Err(e) => {
                log::error!("Failed to cancel order {}: {}", order_id, e);
                OrderResult::failed(e.to_string())
            }
        }
    }

    /// Cancel every open order, optionally only for one instrument.
    pub async fn cancel_all(&mut self, instrument: Option<&str>) -> BTreeMap<String, bool> {
        let targets: Vec<String> = self
            .open
            .iter()
            .filter(|id| match (instrument, self.orders.get(*id)) {
                (Some(wanted), Some(order)) => order.instrument == wanted,
                _ => true,
            })
            .cloned()
            .collect();

        let mut results = BTreeMap::new();
        for order_id in targets {
            let result = self.cancel(&order_id).await;
            results.insert(order_id, result.success);
        }
        results
    }

    /// Query each open order and drop the ones that reached a terminal state.
    /// Returns how many were dropped. Orders whose status cannot be fetched
    /// stay open until a later pass.
    pub async fn reconcile(&mut self) -> usize {
        let ids: Vec<String> = self.open.iter().cloned().collect();
        let mut removed = 0;

        for order_id in ids {
            let instrument = match self.orders.get(&order_id) {
                Some(order) => order.instrument.clone(),
                None => continue,
            };

            let status = match self.gateway.order_status(&instrument, &order_id).await {
                Ok(status) => status,
                Err(e) => {
                    log::error!("Error updating status for order {}: {}", order_id, e);
                    continue;
                }
            };

            if let (Some(status), Some(order)) = (status, self.orders.get_mut(&order_id)) {
                order.status = status;
            }

            if status.map_or(true, |s| s.is_terminal()) {
                log::info!("Removing completed order: {}", order_id);
                self.open.remove(&order_id);
                removed += 1;
            }
        }

        removed
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Ids of orders not yet known to be terminal, in sorted order
    pub fn open_order_ids(&self) -> &BTreeSet<String> {
        &self.open
    }

    pub fn open_orders(&self, instrument: Option<&str>) -> Vec<&Order> {
        self.open
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|order| instrument.map_or(true, |i| order.instrument == i))
            .collect()
    }

    pub fn orders_summary(&self) -> OrdersSummary {
        let mut status_breakdown = BTreeMap::new();
        for order in self.orders.values() {
            *status_breakdown.entry(order.status.to_string()).or_insert(0) += 1;
        }

        OrdersSummary {
            total_orders: self.orders.len(),
            open_orders: self.open.len(),
            status_breakdown,
            last_order_time: self.orders.values().map(|o| o.created_at).max(),
        }
    }

    /// Send a request and record the resulting order on success.
    async fn submit(&mut self, request: OrderRequest) -> OrderResult {
        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                if e.is_outcome_unknown() {
                    log::error!(
                        "Order for {} may or may not have reached the exchange: {}",
                        request.instrument,
                        e
                    );
                    return OrderResult::unknown(e.to_string());
                }
                log::error!("Failed to place order for {}: {}", request.instrument, e);
                return OrderResult::failed(e.to_string());
            }
        };

        let order = Order {
            order_id: ack.order_id.clone(),
            instrument: request.instrument.clone(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            kind: request.kind(),
            status: ack.status,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            reduce_only: request.reduce_only,
            simulated: self.gateway.is_simulated(),
            created_at: Utc::now(),
        };

        if !order.status.is_terminal() {
            self.open.insert(order.order_id.clone());
        }
        self.orders.insert(order.order_id.clone(), order);

        log::info!(
            "Order {} recorded for {} ({})",
            ack.order_id,
            request.instrument,
            ack.status
        );
        OrderResult::ok(&ack.order_id, ack.avg_price).with_status(ack.status)
    }
}
