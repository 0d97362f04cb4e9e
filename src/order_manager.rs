use log::{info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

use crate::error::{AgentError, AgentResult};
use crate::gateway::{BalanceSnapshot, ExchangeGateway, NewOrderRequest, PositionSnapshot, Side, SymbolInfo, TimeInForce};
use crate::market_feed::PrivateOrderUpdate;

const SYNC_YOUNG_THRESHOLD: Duration = Duration::from_secs(3);
const SYNC_OLD_THRESHOLD: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedOrderStatus {
    Pending,
    Submitted,
    Open,
    Filled,
    Cancelled,
    Rejected,
    Error,
}

impl ManagedOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ManagedOrderStatus::Filled
                | ManagedOrderStatus::Cancelled
                | ManagedOrderStatus::Rejected
                | ManagedOrderStatus::Error
        )
    }
}

#[derive(Debug, Clone)]
pub struct ManagedOrder {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub ladder_index: usize,
    pub status: ManagedOrderStatus,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub filled_quantity: f64,
    pub last_error: Option<String>,
}

impl ManagedOrder {
    pub fn is_active(&self) -> bool {
        matches!(self.status, ManagedOrderStatus::Submitted | ManagedOrderStatus::Open)
    }

    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

fn hex_suffix() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

fn new_client_order_id(symbol: &str, side: Side) -> String {
    format!("maker_{symbol}_{side:?}_{}", hex_suffix())
}

fn new_liquidation_client_order_id(symbol: &str, side: Side) -> String {
    // Must contain the literal token `_mkt_` so observers can ignore its fill event.
    format!("liq_mkt_{symbol}_{side:?}_{}", hex_suffix())
}

/// Owns the authoritative local view of working orders. Mirrors the
/// teacher's cancel/reconcile shape but speaks the spec's state machine and
/// the staged 3s/10s reconciliation tolerance instead of Hyperliquid specifics.
pub struct OrderManager {
    gateway: Mutex<ExchangeGateway>,
    orders: StdMutex<HashMap<String, ManagedOrder>>,
    events: broadcast::Sender<ManagedOrder>,
}

impl OrderManager {
    pub fn new(gateway: ExchangeGateway) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        OrderManager {
            gateway: Mutex::new(gateway),
            orders: StdMutex::new(HashMap::new()),
            events,
        }
    }

    pub fn on_update(&self) -> broadcast::Receiver<ManagedOrder> {
        self.events.subscribe()
    }

    /// Drains the private order-stream into the state machine so a live
    /// ack/fill lands immediately instead of waiting for the next `sync()`
    /// poll (§4.2/§4.6 expect the stream to drive transitions at-least-once;
    /// `sync()` remains the reconciling fallback for anything the stream drops).
    pub fn spawn_live_order_listener(self: Arc<Self>, mut updates: broadcast::Receiver<PrivateOrderUpdate>) {
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => self.apply_live_update(&update),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn apply_live_update(&self, update: &PrivateOrderUpdate) {
        let status = match parse_order_status(&update.status) {
            Some(s) => s,
            None => return,
        };
        let filled_quantity = update.filled_quantity;
        let exchange_order_id = update.exchange_order_id.clone();
        self.transition(&update.client_order_id, |o| {
            o.status = status;
            o.filled_quantity = filled_quantity;
            if o.exchange_order_id.is_none() {
                o.exchange_order_id = Some(exchange_order_id.clone());
            }
        });
    }

    fn emit(&self, order: ManagedOrder) {
        let _ = self.events.send(order);
    }

    pub fn get(&self, client_order_id: &str) -> Option<ManagedOrder> {
        self.orders.lock().unwrap().get(client_order_id).cloned()
    }

    pub fn active_orders(&self, symbol: &str) -> Vec<ManagedOrder> {
        self.orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.symbol == symbol && o.is_active())
            .cloned()
            .collect()
    }

    pub fn active_orders_by_side(&self, symbol: &str, side: Side) -> Vec<ManagedOrder> {
        self.active_orders(symbol)
            .into_iter()
            .filter(|o| o.side == side)
            .collect()
    }

    pub fn total_notional(&self, symbol: &str) -> f64 {
        self.active_orders(symbol).iter().map(|o| o.notional()).sum()
    }

    /// Places a resting limit order. Runs entirely off the strategy's own
    /// future by being `async` over the shared gateway, so one slow REST
    /// round-trip never stalls the control loop's own tick.
    pub async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
        ladder_index: usize,
    ) -> AgentResult<ManagedOrder> {
        let client_order_id = new_client_order_id(symbol, side);
        let now = Instant::now();
        let pending = ManagedOrder {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            ladder_index,
            status: ManagedOrderStatus::Pending,
            created_at: now,
            updated_at: now,
            filled_quantity: 0.0,
            last_error: None,
        };
        self.orders.lock().unwrap().insert(client_order_id.clone(), pending.clone());
        self.emit(pending);

        let req = NewOrderRequest {
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: client_order_id.clone(),
        };

        let gateway = self.gateway.lock().await;
        let result = gateway.submit_order(&req).await;
        drop(gateway);

        let updated = match result {
            Ok(resp) => self.transition(&client_order_id, |o| {
                o.status = ManagedOrderStatus::Submitted;
                o.exchange_order_id = Some(resp.exchange_order_id.clone());
            }),
            Err(e) => self.transition(&client_order_id, |o| {
                o.status = ManagedOrderStatus::Error;
                o.last_error = Some(e.to_string());
            }),
        };

        match updated {
            Some(order) if order.status == ManagedOrderStatus::Error => Err(AgentError::Exchange {
                status: 0,
                body: order.last_error.clone().unwrap_or_default(),
            }),
            Some(order) => Ok(order),
            None => Err(AgentError::FatalInvariant("order vanished after placement".to_string())),
        }
    }

    /// IOC reduce-only liquidation order. The client id carries `_mkt_` so
    /// the strategy's fill handler can ignore the self-generated fill event.
    pub async fn place_market_reduce(&self, symbol: &str, side: Side, quantity: f64) -> AgentResult<ManagedOrder> {
        let client_order_id = new_liquidation_client_order_id(symbol, side);
        let now = Instant::now();
        let pending = ManagedOrder {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            symbol: symbol.to_string(),
            side,
            price: 0.0,
            quantity,
            ladder_index: 0,
            status: ManagedOrderStatus::Pending,
            created_at: now,
            updated_at: now,
            filled_quantity: 0.0,
            last_error: None,
        };
        self.orders.lock().unwrap().insert(client_order_id.clone(), pending.clone());

        let req = NewOrderRequest {
            symbol: symbol.to_string(),
            side,
            price: 0.0,
            quantity,
            time_in_force: TimeInForce::Ioc,
            reduce_only: true,
            client_order_id: client_order_id.clone(),
        };

        let gateway = self.gateway.lock().await;
        let result = gateway.submit_order(&req).await;
        drop(gateway);

        match result {
            Ok(resp) => Ok(self
                .transition(&client_order_id, |o| {
                    o.status = ManagedOrderStatus::Submitted;
                    o.exchange_order_id = Some(resp.exchange_order_id.clone());
                })
                .expect("just inserted")),
            Err(e) => {
                let order = self
                    .transition(&client_order_id, |o| {
                        o.status = ManagedOrderStatus::Error;
                        o.last_error = Some(e.to_string());
                    })
                    .expect("just inserted");
                Err(AgentError::Exchange {
                    status: 0,
                    body: order.last_error.unwrap_or_default(),
                })
            }
        }
    }

    /// Idempotent: HTTP 404 / "not found" is treated as success.
    pub async fn cancel(&self, client_order_id: &str) -> AgentResult<()> {
        let existing = self.get(client_order_id);
        if let Some(order) = &existing {
            if order.status.is_terminal() {
                return Ok(());
            }
        }

        let exchange_order_id = existing.as_ref().and_then(|o| o.exchange_order_id.clone());
        let gateway = self.gateway.lock().await;
        let result = gateway
            .cancel_order(Some(client_order_id), exchange_order_id.as_deref())
            .await;
        drop(gateway);

        match result {
            Ok(()) | Err(AgentError::NotFound(_)) => {
                self.transition(client_order_id, |o| o.status = ManagedOrderStatus::Cancelled);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_all(&self, symbol: Option<&str>) -> AgentResult<usize> {
        let targets: Vec<String> = {
            let orders = self.orders.lock().unwrap();
            orders
                .values()
                .filter(|o| o.is_active() && symbol.map(|s| o.symbol == s).unwrap_or(true))
                .map(|o| o.client_order_id.clone())
                .collect()
        };
        let mut cancelled = 0;
        for id in &targets {
            if self.cancel(id).await.is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Cancel-then-place at the same symbol/side/ladder slot.
    pub async fn replace(&self, client_order_id: &str, new_price: f64, new_quantity: Option<f64>) -> AgentResult<ManagedOrder> {
        let existing = self
            .get(client_order_id)
            .ok_or_else(|| AgentError::NotFound(client_order_id.to_string()))?;
        self.cancel(client_order_id).await?;
        self.place_limit(
            &existing.symbol,
            existing.side,
            new_price,
            new_quantity.unwrap_or(existing.quantity),
            existing.ladder_index,
        )
        .await
    }

    /// Reconciles local active orders with `query_open_orders`, applying the
    /// staged 3s/10s tolerance: younger than 3s is skipped outright (the
    /// exchange may not have indexed it yet); 3s-10s queries the order
    /// directly and only acts on a terminal status; past 10s a missing order
    /// is declared cancelled.
    pub async fn sync(&self, symbol: Option<&str>) -> AgentResult<()> {
        let active: Vec<ManagedOrder> = {
            let orders = self.orders.lock().unwrap();
            orders
                .values()
                .filter(|o| o.is_active() && symbol.map(|s| o.symbol == s).unwrap_or(true))
                .cloned()
                .collect()
        };
        if active.is_empty() {
            return Ok(());
        }

        let mut gateway = self.gateway.lock().await;
        let exchange_orders = gateway.query_open_orders(symbol).await?;
        let exchange_ids: std::collections::HashSet<&str> = exchange_orders
            .iter()
            .map(|o| o.client_order_id.as_str())
            .collect();

        for order in &active {
            if exchange_ids.contains(order.client_order_id.as_str()) {
                continue;
            }

            let age = order.created_at.elapsed();
            if age < SYNC_YOUNG_THRESHOLD {
                continue;
            }

            if age <= SYNC_OLD_THRESHOLD {
                match gateway.query_order(&order.client_order_id).await {
                    Ok(snapshot) => {
                        if let Some(status) = parse_terminal_status(&snapshot.status) {
                            self.transition(&order.client_order_id, |o| o.status = status);
                        }
                    }
                    Err(e) if e.is_benign_not_found() => {
                        // Still within the grace window; wait for the 10s mark.
                    }
                    Err(e) => warn!("order_manager: sync query_order failed for {}: {e}", order.client_order_id),
                }
                continue;
            }

            match gateway.query_order(&order.client_order_id).await {
                Err(e) if e.is_benign_not_found() => {
                    info!("order_manager: declaring {} cancelled after {age:?}", order.client_order_id);
                    self.transition(&order.client_order_id, |o| o.status = ManagedOrderStatus::Cancelled);
                }
                Ok(snapshot) => {
                    if let Some(status) = parse_terminal_status(&snapshot.status) {
                        self.transition(&order.client_order_id, |o| o.status = status);
                    }
                }
                Err(e) => warn!("order_manager: sync query_order failed for {}: {e}", order.client_order_id),
            }
        }

        Ok(())
    }

    /// Passthrough used by the Safety Guard's position-cap enforcement.
    pub async fn query_positions(&self) -> AgentResult<Vec<PositionSnapshot>> {
        self.gateway.lock().await.query_positions().await
    }

    /// Passthrough used by the strategy's effective-order-size recomputation.
    pub async fn query_balance(&self) -> AgentResult<BalanceSnapshot> {
        self.gateway.lock().await.query_balance().await
    }

    /// Passthrough used by the strategy's quantity/price rounding policy.
    pub async fn query_symbol_info(&self, symbol: &str) -> AgentResult<SymbolInfo> {
        self.gateway.lock().await.query_symbol_info(symbol).await
    }

    fn transition(&self, client_order_id: &str, f: impl FnOnce(&mut ManagedOrder)) -> Option<ManagedOrder> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(client_order_id)?;
        f(order);
        order.updated_at = Instant::now();
        let snapshot = order.clone();
        drop(orders);
        self.emit(snapshot.clone());
        Some(snapshot)
    }
}

fn parse_terminal_status(status: &str) -> Option<ManagedOrderStatus> {
    match status.to_uppercase().as_str() {
        "FILLED" => Some(ManagedOrderStatus::Filled),
        "CANCELLED" | "CANCELED" => Some(ManagedOrderStatus::Cancelled),
        "REJECTED" => Some(ManagedOrderStatus::Rejected),
        _ => None,
    }
}

/// Wider than `parse_terminal_status`: the live stream also announces the
/// non-terminal `OPEN` ack that `sync()` never needs to act on directly.
fn parse_order_status(status: &str) -> Option<ManagedOrderStatus> {
    match status.to_uppercase().as_str() {
        "OPEN" => Some(ManagedOrderStatus::Open),
        "SUBMITTED" => Some(ManagedOrderStatus::Submitted),
        other => parse_terminal_status(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_id_is_prefixed_maker() {
        let id = new_client_order_id("BTC-USD", Side::Buy);
        assert!(id.starts_with("maker_"));
    }

    #[test]
    fn liquidation_client_order_id_contains_mkt_token() {
        let id = new_liquidation_client_order_id("BTC-USD", Side::Sell);
        assert!(id.contains("_mkt_"));
    }

    #[test]
    fn terminal_status_parsing_is_case_insensitive() {
        assert_eq!(parse_terminal_status("filled"), Some(ManagedOrderStatus::Filled));
        assert_eq!(parse_terminal_status("OPEN"), None);
        assert_eq!(parse_terminal_status("Cancelled"), Some(ManagedOrderStatus::Cancelled));
    }

    #[test]
    fn is_active_only_for_submitted_or_open() {
        let base = ManagedOrder {
            client_order_id: "x".into(),
            exchange_order_id: None,
            symbol: "BTC-USD".into(),
            side: Side::Buy,
            price: 1.0,
            quantity: 1.0,
            ladder_index: 0,
            status: ManagedOrderStatus::Pending,
            created_at: Instant::now(),
            updated_at: Instant::now(),
            filled_quantity: 0.0,
            last_error: None,
        };
        assert!(!base.is_active());
        let mut open = base.clone();
        open.status = ManagedOrderStatus::Open;
        assert!(open.is_active());
    }
}
