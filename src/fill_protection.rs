use log::info;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::FillProtectionConfig;
use crate::error::AgentResult;
use crate::gateway::Side;
use crate::market_feed::{MarketFeed, OrderbookUpdate};
use crate::order_manager::{ManagedOrder, OrderManager};
use crate::reference_feed::ReferenceFeed;
use crate::safety_guard::SafetyGuard;

const RING_BUFFER_CAPACITY: usize = 50;

/// Reference-feed leading-indicator trigger + local queue-ahead trigger,
/// both gated by "Smart Protection" (a Lock young enough is left alone).
/// Grounded directly on `fill_protection.py`'s `FillProtection` class.
pub struct FillProtection {
    config: FillProtectionConfig,
    safety_guard: Arc<SafetyGuard>,
    order_manager: Arc<OrderManager>,
    reference_feed: Arc<ReferenceFeed>,
    orderbook_history: Mutex<HashMap<String, VecDeque<(Instant, OrderbookUpdate)>>>,
    reference_cooldown_until: Mutex<HashMap<String, Instant>>,
}

impl FillProtection {
    pub fn new(
        config: FillProtectionConfig,
        safety_guard: Arc<SafetyGuard>,
        order_manager: Arc<OrderManager>,
        reference_feed: Arc<ReferenceFeed>,
    ) -> Self {
        FillProtection {
            config,
            safety_guard,
            order_manager,
            reference_feed,
            orderbook_history: Mutex::new(HashMap::new()),
            reference_cooldown_until: Mutex::new(HashMap::new()),
        }
    }

    /// Drains orderbook snapshots from the Market Feed into a bounded
    /// per-symbol ring buffer, used by the queue-ahead trigger.
    pub fn spawn_orderbook_ingest(self: &Arc<Self>, market_feed: Arc<MarketFeed>) {
        let this = self.clone();
        let mut rx = market_feed.on_orderbook();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => {
                        let mut history = this.orderbook_history.lock().unwrap();
                        let ring = history.entry(update.symbol.clone()).or_insert_with(VecDeque::new);
                        ring.push_back((Instant::now(), update));
                        if ring.len() > RING_BUFFER_CAPACITY {
                            ring.pop_front();
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn spawn_loop(self: Arc<Self>, symbols: Vec<String>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs_f64(self.config.check_interval_seconds));
            loop {
                interval.tick().await;
                for symbol in &symbols {
                    if let Err(e) = self.check_reference_trigger(symbol).await {
                        log::warn!("fill_protection: reference trigger failed for {symbol}: {e}");
                    }
                    if let Err(e) = self.check_queue_trigger(symbol).await {
                        log::warn!("fill_protection: queue trigger failed for {symbol}: {e}");
                    }
                }
            }
        });
    }

    async fn check_reference_trigger(&self, symbol: &str) -> AgentResult<()> {
        if !self.config.reference.enabled {
            return Ok(());
        }
        {
            let cooldowns = self.reference_cooldown_until.lock().unwrap();
            if let Some(until) = cooldowns.get(symbol) {
                if *until > Instant::now() {
                    return Ok(());
                }
            }
        }

        let change = self
            .reference_feed
            .change_bps(symbol, self.config.reference.window_seconds);
        if change.abs() < self.config.reference.trigger_bps {
            return Ok(());
        }

        let side_to_cancel = if change > 0.0 { Side::Buy } else { Side::Sell };
        info!(
            "fill_protection: reference trigger on {symbol} change={change:.2}bps -> cancelling {side_to_cancel:?}"
        );

        self.reference_cooldown_until.lock().unwrap().insert(
            symbol.to_string(),
            Instant::now() + Duration::from_secs_f64(self.config.reference.cooldown_seconds),
        );

        for order in self.order_manager.active_orders_by_side(symbol, side_to_cancel) {
            self.apply_smart_protected_cancel(&order).await?;
        }
        Ok(())
    }

    async fn check_queue_trigger(&self, symbol: &str) -> AgentResult<()> {
        if !self.config.queue.enabled {
            return Ok(());
        }

        let (latest, older) = {
            let history = self.orderbook_history.lock().unwrap();
            let ring = match history.get(symbol) {
                Some(r) if !r.is_empty() => r,
                _ => return Ok(()),
            };
            let latest = ring.back().unwrap().clone();
            let half_window = Duration::from_secs_f64(self.config.queue.window_seconds / 2.0);
            let target = latest.0.checked_sub(half_window);
            let older = target
                .and_then(|t| ring.iter().find(|(at, _)| *at <= t).cloned())
                .unwrap_or_else(|| ring.front().unwrap().clone());
            (latest, older)
        };

        for order in self.order_manager.active_orders(symbol) {
            let new_queue = queue_ahead_usd(order.side, order.price, &latest.1);
            let old_queue = queue_ahead_usd(order.side, order.price, &older.1);

            let below_floor = new_queue < self.config.queue.min_queue_ahead_usd;
            let dropped = old_queue > 0.0
                && (old_queue - new_queue) / old_queue * 100.0 > self.config.queue.drop_threshold_percent;

            if below_floor || dropped {
                info!(
                    "fill_protection: queue trigger on {} (old={old_queue:.2}, new={new_queue:.2})",
                    order.client_order_id
                );
                self.apply_smart_protected_cancel(&order).await?;
            }
        }
        Ok(())
    }

    /// If the order is Locked and its elapsed dwell is below the smart
    /// threshold, the priority is preserving points-accrual dwell — skip.
    /// Otherwise clear the Lock and cancel.
    async fn apply_smart_protected_cancel(&self, order: &ManagedOrder) -> AgentResult<()> {
        if let Some(elapsed) = self.safety_guard.get_lock_elapsed(&order.client_order_id) {
            if elapsed < Duration::from_secs_f64(self.config.smart_protection_threshold_seconds) {
                return Ok(());
            }
        }
        self.safety_guard.clear_lock(&order.client_order_id);
        self.order_manager.cancel(&order.client_order_id).await
    }
}

fn queue_ahead_usd(side: Side, order_price: f64, book: &OrderbookUpdate) -> f64 {
    match side {
        Side::Buy => book
            .bids
            .iter()
            .filter(|level| level.price >= order_price)
            .map(|level| level.price * level.quantity)
            .sum(),
        Side::Sell => book
            .asks
            .iter()
            .filter(|level| level.price <= order_price)
            .map(|level| level.price * level.quantity)
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_feed::DepthLevel;

    fn book(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> OrderbookUpdate {
        OrderbookUpdate {
            symbol: "BTC-USD".to_string(),
            bids: bids.into_iter().map(|(p, q)| DepthLevel { price: p, quantity: q }).collect(),
            asks: asks.into_iter().map(|(p, q)| DepthLevel { price: p, quantity: q }).collect(),
        }
    }

    #[test]
    fn queue_ahead_buy_sums_bids_at_or_above_order_price() {
        let book = book(vec![(100.0, 1.0), (99.0, 2.0), (98.0, 3.0)], vec![]);
        let total = queue_ahead_usd(Side::Buy, 99.0, &book);
        assert_eq!(total, 100.0 * 1.0 + 99.0 * 2.0);
    }

    #[test]
    fn queue_ahead_sell_sums_asks_at_or_below_order_price() {
        let book = book(vec![], vec![(101.0, 1.0), (102.0, 2.0), (103.0, 3.0)]);
        let total = queue_ahead_usd(Side::Sell, 102.0, &book);
        assert_eq!(total, 101.0 * 1.0 + 102.0 * 2.0);
    }

    #[test]
    fn queue_ahead_is_zero_when_nothing_qualifies() {
        let book = book(vec![(90.0, 1.0)], vec![]);
        assert_eq!(queue_ahead_usd(Side::Buy, 99.0, &book), 0.0);
    }
}
