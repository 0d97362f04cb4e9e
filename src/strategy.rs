use log::{info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::band_calculator::{self, BandConfig};
use crate::config::{ConsecutiveFillProtectionConfig, DynamicDistanceConfig, StrategyConfig};
use crate::error::AgentResult;
use crate::gateway::Side;
use crate::order_manager::{ManagedOrder, OrderManager};
use crate::price_tracker::PriceTracker;
use crate::safety_guard::SafetyGuard;

const LIQUIDATION_FEE_RESERVE_USD: f64 = 0.50;
const MINIMUM_ORDER_USD: f64 = 10.0;
const OUTER_RUNG_SIZE_FACTOR: f64 = 0.30;
const HELD_POSITION_TICK: Duration = Duration::from_millis(500);
const HELD_POSITION_TP_PCT: f64 = 1.0;
const HELD_POSITION_SL_PCT: f64 = 1.0;
const HELD_POSITION_TIMEOUT_S: f64 = 300.0;
const POINTS_MIN_INTERVAL: Duration = Duration::from_millis(100);
const SECONDS_PER_DAY: f64 = 86_400.0;
const SYNC_EVERY: Duration = Duration::from_secs(2);
const PAUSE_LOG_EVERY: Duration = Duration::from_secs(10);

/// The single at-most-one position the agent will ever carry, opened on an
/// unintended maker fill and liquidated on TP/SL/timeout.
#[derive(Debug, Clone)]
pub struct HeldPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: Instant,
    pub tp_pct: f64,
    pub sl_pct: f64,
    pub timeout_s: f64,
}

impl HeldPosition {
    /// Directional PnL: positive for a long that rose, or a short that fell.
    pub fn pnl_pct(&self, mark: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = (mark - self.entry_price) / self.entry_price * 100.0;
        match self.side {
            Side::Buy => raw,
            Side::Sell => -raw,
        }
    }

    pub fn exit_reason(&self, mark: f64, now: Instant) -> Option<&'static str> {
        let pnl = self.pnl_pct(mark);
        if pnl >= self.tp_pct {
            Some("take_profit")
        } else if pnl <= -self.sl_pct {
            Some("stop_loss")
        } else if now.duration_since(self.entry_time).as_secs_f64() >= self.timeout_s {
            Some("timeout")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FarmingStats {
    pub orders_placed: u64,
    pub orders_cancelled: u64,
    pub orders_rebalanced: u64,
    pub fills: u64,
    pub tp_closes: u64,
    pub sl_closes: u64,
    pub timeout_closes: u64,
    pub consecutive_fill_pauses: u64,
    pub points: f64,
}

/// Tracks fills within a rolling window and escalates the pause duration on
/// repeated breaches. Grounded in the teacher's `RiskManager` halt-bookkeeping
/// shape (a timestamp-gated state machine), generalized to the spec's levels.
struct ConsecutiveFillTracker {
    config: ConsecutiveFillProtectionConfig,
    fill_times: VecDeque<Instant>,
    level: usize,
    paused_until: Option<Instant>,
    last_pause_triggered_at: Option<Instant>,
}

struct PauseEvent {
    duration: Duration,
    escalated: bool,
}

impl ConsecutiveFillTracker {
    fn new(config: ConsecutiveFillProtectionConfig) -> Self {
        ConsecutiveFillTracker {
            config,
            fill_times: VecDeque::new(),
            level: 0,
            paused_until: None,
            last_pause_triggered_at: None,
        }
    }

    fn is_paused(&self, now: Instant) -> bool {
        self.paused_until.map(|until| until > now).unwrap_or(false)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.paused_until.and_then(|until| until.checked_duration_since(now))
    }

    /// Registers a fill; returns `Some` the tick the pause threshold is hit.
    fn register_fill(&mut self, now: Instant) -> Option<PauseEvent> {
        if !self.config.enabled {
            return None;
        }
        let window = Duration::from_secs_f64(self.config.window_seconds);
        self.fill_times.push_back(now);
        while let Some(front) = self.fill_times.front() {
            if now.duration_since(*front) > window {
                self.fill_times.pop_front();
            } else {
                break;
            }
        }

        if self.fill_times.len() < self.config.max_fills {
            return None;
        }

        self.level += 1;
        let escalated = self.level > 1;
        let duration = if escalated {
            Duration::from_secs_f64(self.config.escalated_pause_duration_seconds)
        } else {
            Duration::from_secs_f64(self.config.pause_duration_seconds)
        };
        self.paused_until = Some(now + duration);
        self.last_pause_triggered_at = Some(now);
        self.fill_times.clear();
        Some(PauseEvent { duration, escalated })
    }

    /// After `escalation_reset_seconds` without a further pause, the
    /// escalation level decays back to 0.
    fn maybe_reset_escalation(&mut self, now: Instant) {
        if let Some(last) = self.last_pause_triggered_at {
            let reset_window = Duration::from_secs_f64(self.config.escalation_reset_seconds);
            if now.duration_since(last) >= reset_window {
                self.level = 0;
                self.last_pause_triggered_at = None;
            }
        }
    }

    fn reset(&mut self) {
        self.fill_times.clear();
        self.level = 0;
        self.paused_until = None;
        self.last_pause_triggered_at = None;
    }
}

#[derive(Clone)]
struct RuntimeParams {
    symbols: Vec<String>,
    leverage: u32,
    order_size_usd: f64,
    effective_order_size_usd: f64,
    margin_reserve_percent: f64,
    num_orders_per_side: usize,
    order_distances_bps: Vec<f64>,
    order_lock_seconds: f64,
    rebalance_cooldown_seconds: f64,
    drift_threshold_bps: f64,
    check_interval_seconds: f64,
    dynamic_distance: DynamicDistanceConfig,
    orders_enabled: bool,
}

struct SymbolRuntime {
    last_reference_price: f64,
    rebalance_cooldown_until: Option<Instant>,
    last_sync_at: Instant,
}

/// Reply to a remote-control mutator, per §9's explicit-state design note:
/// every mutator reports what changed instead of living as hidden singleton
/// state on the strategy object.
#[derive(Debug, Clone)]
pub struct RemoteControlReply {
    pub message: String,
    pub force_rebalance_scheduled: bool,
}

/// The farming control loop (C9): rebalances ladders toward Band A, reacts to
/// fills by opening a `HeldPosition`, and integrates points accrual. Grounded
/// in the teacher's `market_maker.rs`/`execution.rs` task-orchestration shape,
/// generalized to the spec's priority-ordered tick.
pub struct Strategy {
    order_manager: Arc<OrderManager>,
    safety_guard: Arc<SafetyGuard>,
    price_tracker: Arc<PriceTracker>,
    band_config: BandConfig,

    params: Mutex<RuntimeParams>,
    symbol_runtime: Mutex<HashMap<String, SymbolRuntime>>,
    held_position: Mutex<Option<HeldPosition>>,
    pending_liquidations: Mutex<VecDeque<(String, Side, f64)>>,
    fill_tracker: Mutex<ConsecutiveFillTracker>,
    force_rebalance: AtomicBool,
    stats: Mutex<FarmingStats>,
    last_points_update: Mutex<Instant>,
    pause_log_last_at: Mutex<Option<Instant>>,
    tick_bps_cache: Mutex<HashMap<String, f64>>,
}

impl Strategy {
    pub fn new(
        config: StrategyConfig,
        consecutive_fill_config: ConsecutiveFillProtectionConfig,
        order_manager: Arc<OrderManager>,
        safety_guard: Arc<SafetyGuard>,
        price_tracker: Arc<PriceTracker>,
    ) -> Self {
        let params = RuntimeParams {
            symbols: config.symbols,
            leverage: config.leverage,
            order_size_usd: config.order_size_usd,
            effective_order_size_usd: config.order_size_usd,
            margin_reserve_percent: config.margin_reserve_percent,
            num_orders_per_side: config.num_orders_per_side,
            order_distances_bps: config.order_distances_bps,
            order_lock_seconds: config.order_lock_seconds,
            rebalance_cooldown_seconds: config.rebalance_cooldown_seconds,
            drift_threshold_bps: config.drift_threshold_bps,
            check_interval_seconds: config.check_interval_seconds,
            dynamic_distance: config.dynamic_distance,
            orders_enabled: true,
        };
        Strategy {
            order_manager,
            safety_guard,
            price_tracker,
            band_config: BandConfig::default(),
            params: Mutex::new(params),
            symbol_runtime: Mutex::new(HashMap::new()),
            held_position: Mutex::new(None),
            pending_liquidations: Mutex::new(VecDeque::new()),
            fill_tracker: Mutex::new(ConsecutiveFillTracker::new(consecutive_fill_config)),
            force_rebalance: AtomicBool::new(false),
            stats: Mutex::new(FarmingStats::default()),
            last_points_update: Mutex::new(Instant::now()),
            pause_log_last_at: Mutex::new(None),
            tick_bps_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> FarmingStats {
        self.stats.lock().unwrap().clone()
    }

    // ─── Effective order size, rounding ────────────────────────────────

    /// `max_notional = (B·(1−r) − F)·L`; `max_per_order = max_notional /
    /// (symbols · orders_per_side · 2)`. The configured size is clamped to
    /// this ceiling, floored at `MINIMUM_ORDER_USD`.
    pub fn effective_order_size(
        balance_usd: f64,
        leverage: u32,
        margin_reserve_percent: f64,
        num_symbols: usize,
        orders_per_side: usize,
        configured_order_size_usd: f64,
    ) -> f64 {
        let r = margin_reserve_percent / 100.0;
        let max_notional = (balance_usd * (1.0 - r) - LIQUIDATION_FEE_RESERVE_USD) * leverage as f64;
        let denom = (num_symbols.max(1) * orders_per_side.max(1) * 2) as f64;
        let max_per_order = max_notional / denom;
        if configured_order_size_usd > max_per_order {
            max_per_order.max(MINIMUM_ORDER_USD)
        } else {
            configured_order_size_usd
        }
    }

    async fn recompute_effective_size(&self) -> AgentResult<()> {
        let balance = self.order_manager.query_balance().await?;
        let mut params = self.params.lock().unwrap();
        let effective = Strategy::effective_order_size(
            balance.available_usd,
            params.leverage,
            params.margin_reserve_percent,
            params.symbols.len(),
            params.num_orders_per_side,
            params.order_size_usd,
        );
        params.effective_order_size_usd = effective;
        Ok(())
    }

    /// BTC → 4 dp, ETH → 3 dp, else 2 dp. Placeholder policy, per §4.9, until
    /// `query_symbol_info` decimals are threaded through per-symbol.
    pub fn round_quantity(symbol: &str, quantity: f64) -> f64 {
        let dp = if symbol.starts_with("BTC") {
            4
        } else if symbol.starts_with("ETH") {
            3
        } else {
            2
        };
        let factor = 10f64.powi(dp);
        (quantity * factor).round() / factor
    }

    pub fn round_price(symbol: &str, price: f64) -> f64 {
        let dp = if symbol.starts_with("BTC") { 1 } else { 2 };
        let factor = 10f64.powi(dp);
        (price * factor).round() / factor
    }

    fn rung_notional(base_notional: f64, ladder_index: usize) -> f64 {
        if ladder_index == 0 {
            base_notional
        } else {
            base_notional * OUTER_RUNG_SIZE_FACTOR
        }
    }

    fn rung_price(reference_price: f64, side: Side, distance_bps: f64) -> f64 {
        match side {
            Side::Buy => reference_price * (1.0 - distance_bps / 10_000.0),
            Side::Sell => reference_price * (1.0 + distance_bps / 10_000.0),
        }
    }

    /// Symbol tick size expressed in bps of the reference price, fetched
    /// once via `query_symbol_info` and cached for the process lifetime
    /// (tick size does not change at runtime).
    async fn tick_bps_for(&self, symbol: &str, reference_price: f64) -> f64 {
        if let Some(cached) = self.tick_bps_cache.lock().unwrap().get(symbol) {
            return *cached;
        }
        let tick_bps = match self.order_manager.query_symbol_info(symbol).await {
            Ok(info) => {
                let tick_size = 10f64.powi(-(info.price_decimals as i32));
                if reference_price > 0.0 {
                    tick_size / reference_price * 10_000.0
                } else {
                    0.0
                }
            }
            Err(e) => {
                warn!("strategy: query_symbol_info failed for {symbol}, assuming zero tick: {e}");
                0.0
            }
        };
        self.tick_bps_cache.lock().unwrap().insert(symbol.to_string(), tick_bps);
        tick_bps
    }

    /// Per-rung distances in bps: the configured static ladder, or — when
    /// `dynamic_distance.enabled` — a tick/spread/volatility-derived base
    /// distance for the inner rung, scaled by rung index for outer rungs.
    async fn distances_for(&self, symbol: &str, reference_price: f64, params: &RuntimeParams) -> Vec<f64> {
        if !params.dynamic_distance.enabled {
            return params.order_distances_bps.clone();
        }
        let tick_bps = self.tick_bps_for(symbol, reference_price).await;
        let spread_bps = self.price_tracker.get_price(symbol).map(|p| p.spread_bps).unwrap_or(0.0);
        let volatility_bps = self.price_tracker.volatility_bps(symbol, 30.0);
        let dyn_cfg = band_calculator::DynamicDistanceConfig {
            min_bps: params.dynamic_distance.min_bps,
            max_bps: params.dynamic_distance.max_bps,
            spread_factor: params.dynamic_distance.spread_factor,
            volatility_factor: params.dynamic_distance.volatility_factor,
        };
        let base = band_calculator::calculate_dynamic_distance(tick_bps, spread_bps, volatility_bps, &dyn_cfg);
        (0..params.num_orders_per_side)
            .map(|i| (base * (i as f64 + 1.0)).min(params.dynamic_distance.max_bps))
            .collect()
    }

    // ─── Placement / rebalance ──────────────────────────────────────────

    /// Fills missing rungs on both sides without touching existing ones.
    async fn place_missing_rungs(&self, symbol: &str, reference_price: f64) -> AgentResult<()> {
        let params = self.params.lock().unwrap().clone();
        let distances = self.distances_for(symbol, reference_price, &params).await;
        for side in [Side::Buy, Side::Sell] {
            let existing: HashSet<usize> = self
                .order_manager
                .active_orders_by_side(symbol, side)
                .into_iter()
                .map(|o| o.ladder_index)
                .collect();
            for ladder_index in 0..params.num_orders_per_side {
                if existing.contains(&ladder_index) {
                    continue;
                }
                let distance = distances
                    .get(ladder_index)
                    .copied()
                    .unwrap_or(distances.last().copied().unwrap_or(8.0));
                let price = Self::round_price(symbol, Self::rung_price(reference_price, side, distance));
                let notional = Self::rung_notional(params.effective_order_size_usd, ladder_index);
                let quantity = Self::round_quantity(symbol, notional / price.max(1e-9));
                let order = self.order_manager.place_limit(symbol, side, price, quantity, ladder_index).await?;
                self.safety_guard
                    .set_lock(&order.client_order_id, Duration::from_secs_f64(params.order_lock_seconds));
                self.stats.lock().unwrap().orders_placed += 1;
            }
        }
        Ok(())
    }

    /// Cancels every existing rung and places a fresh ladder. Used for
    /// `force_rebalance_requested` and remote-control size/distance changes.
    async fn place_fresh_ladder(&self, symbol: &str, reference_price: f64) -> AgentResult<()> {
        self.order_manager.cancel_all(Some(symbol)).await?;
        self.place_missing_rungs(symbol, reference_price).await
    }

    /// Determines which (side, ladder_index) rungs have drifted out of Band A
    /// and replaces only those, interleaved `BUY₁,SELL₁,BUY₂,SELL₂,…` so at
    /// least one order stays live per side throughout.
    async fn partial_rebalance(&self, symbol: &str, reference_price: f64, force: bool) -> AgentResult<()> {
        let params = self.params.lock().unwrap().clone();
        let order_lock = Duration::from_secs_f64(params.order_lock_seconds);

        let mut buy_rungs: Vec<ManagedOrder> = self.order_manager.active_orders_by_side(symbol, Side::Buy);
        let mut sell_rungs: Vec<ManagedOrder> = self.order_manager.active_orders_by_side(symbol, Side::Sell);
        buy_rungs.sort_by_key(|o| o.ladder_index);
        sell_rungs.sort_by_key(|o| o.ladder_index);

        let to_rebalance = |order: &ManagedOrder| -> bool {
            if !force && order.created_at.elapsed() < order_lock {
                return false;
            }
            force || band_calculator::needs_rebalance(reference_price, order.price, &self.band_config)
        };

        let buy_targets: Vec<ManagedOrder> = buy_rungs.into_iter().filter(to_rebalance).collect();
        let sell_targets: Vec<ManagedOrder> = sell_rungs.into_iter().filter(to_rebalance).collect();
        let distances = self.distances_for(symbol, reference_price, &params).await;

        let max_len = buy_targets.len().max(sell_targets.len());
        for i in 0..max_len {
            if let Some(order) = buy_targets.get(i) {
                self.replace_rung(symbol, order, reference_price, Side::Buy, &distances, order_lock).await?;
            }
            if let Some(order) = sell_targets.get(i) {
                self.replace_rung(symbol, order, reference_price, Side::Sell, &distances, order_lock).await?;
            }
        }

        if !buy_targets.is_empty() || !sell_targets.is_empty() {
            let mut runtime = self.symbol_runtime.lock().unwrap();
            if let Some(r) = runtime.get_mut(symbol) {
                r.rebalance_cooldown_until = Some(Instant::now() + Duration::from_secs_f64(params.rebalance_cooldown_seconds));
                r.last_reference_price = reference_price;
            }
        }
        Ok(())
    }

    async fn replace_rung(
        &self,
        symbol: &str,
        order: &ManagedOrder,
        reference_price: f64,
        side: Side,
        distances: &[f64],
        order_lock: Duration,
    ) -> AgentResult<()> {
        let distance = distances
            .get(order.ladder_index)
            .copied()
            .unwrap_or(distances.last().copied().unwrap_or(8.0));
        let new_price = Self::round_price(symbol, Self::rung_price(reference_price, side, distance));
        let new_order = self.order_manager.replace(&order.client_order_id, new_price, None).await?;
        self.safety_guard.set_lock(&new_order.client_order_id, order_lock);
        self.stats.lock().unwrap().orders_rebalanced += 1;
        Ok(())
    }

    /// One symbol's slice of control-loop step 6: fill missing rungs, or
    /// partial-rebalance drifted ones, or skip inside cooldown.
    async fn evaluate_symbol(&self, symbol: &str) -> AgentResult<()> {
        if self.safety_guard.is_paused(symbol) {
            return Ok(());
        }
        let price = match self.price_tracker.get_price(symbol) {
            Some(p) => p,
            None => return Ok(()),
        };
        let reference_price = price.reference_price();
        if reference_price <= 0.0 {
            return Ok(());
        }

        let params = self.params.lock().unwrap().clone();
        let buy_count = self.order_manager.active_orders_by_side(symbol, Side::Buy).len();
        let sell_count = self.order_manager.active_orders_by_side(symbol, Side::Sell).len();
        if buy_count < params.num_orders_per_side || sell_count < params.num_orders_per_side {
            self.place_missing_rungs(symbol, reference_price).await?;
            return Ok(());
        }

        let (last_reference, cooldown_active) = {
            let mut runtime = self.symbol_runtime.lock().unwrap();
            let entry = runtime.entry(symbol.to_string()).or_insert_with(|| SymbolRuntime {
                last_reference_price: reference_price,
                rebalance_cooldown_until: None,
                last_sync_at: Instant::now(),
            });
            let cooldown_active = entry.rebalance_cooldown_until.map(|u| u > Instant::now()).unwrap_or(false);
            (entry.last_reference_price, cooldown_active)
        };

        let drift_bps = if last_reference > 0.0 {
            (reference_price - last_reference).abs() / last_reference * 10_000.0
        } else {
            0.0
        };
        let drifted = drift_bps > params.drift_threshold_bps;

        let any_order_out_of_band = self
            .order_manager
            .active_orders(symbol)
            .iter()
            .any(|o| band_calculator::needs_rebalance(reference_price, o.price, &self.band_config));

        if drifted || any_order_out_of_band {
            self.partial_rebalance(symbol, reference_price, false).await?;
        } else if !cooldown_active {
            // Steady state inside Band A and outside cooldown: nothing to do.
        }
        Ok(())
    }

    // ─── Fill handling ───────────────────────────────────────────────────

    /// Spawns the task draining `OrderManager::on_update` for Filled
    /// transitions, ignoring self-generated liquidation fills (`_mkt_`).
    pub fn spawn_fill_listener(self: Arc<Self>) {
        let mut rx = self.order_manager.on_update();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(order) => {
                        if order.status == crate::order_manager::ManagedOrderStatus::Filled
                            && !order.client_order_id.contains("_mkt_")
                        {
                            if let Err(e) = self.on_fill(&order).await {
                                warn!("strategy: on_fill handling failed: {e}");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_fill(&self, order: &ManagedOrder) -> AgentResult<()> {
        let now = Instant::now();
        self.stats.lock().unwrap().fills += 1;

        if let Some(event) = self.fill_tracker.lock().unwrap().register_fill(now) {
            self.stats.lock().unwrap().consecutive_fill_pauses += 1;
            info!(
                "strategy: consecutive-fill breaker tripped, pause={:?} escalated={}",
                event.duration, event.escalated
            );
            self.request_close_all_positions();
        }

        let already_held = self.held_position.lock().unwrap().is_some();
        if !already_held {
            let held = HeldPosition {
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.filled_quantity.max(order.quantity),
                entry_price: order.price,
                entry_time: now,
                tp_pct: HELD_POSITION_TP_PCT,
                sl_pct: HELD_POSITION_SL_PCT,
                timeout_s: HELD_POSITION_TIMEOUT_S,
            };
            *self.held_position.lock().unwrap() = Some(held);
        }

        self.order_manager.cancel_all(Some(&order.symbol)).await?;
        Ok(())
    }

    fn request_close_all_positions(&self) {
        let held = self.held_position.lock().unwrap().clone();
        if let Some(h) = held {
            self.pending_liquidations.lock().unwrap().push_back((h.symbol, h.side.opposite(), h.quantity));
        }
    }

    // ─── Held-position monitor (0.5s tick) ──────────────────────────────

    pub fn spawn_held_position_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HELD_POSITION_TICK);
            loop {
                interval.tick().await;
                let held = self.held_position.lock().unwrap().clone();
                let held = match held {
                    Some(h) => h,
                    None => continue,
                };
                let price = match self.price_tracker.get_price(&held.symbol) {
                    Some(p) => p,
                    None => continue,
                };
                let mark = price.reference_price();
                if let Some(reason) = held.exit_reason(mark, Instant::now()) {
                    info!("strategy: closing held position on {} ({reason})", held.symbol);
                    if let Err(e) = self
                        .order_manager
                        .place_market_reduce(&held.symbol, held.side.opposite(), held.quantity)
                        .await
                    {
                        warn!("strategy: held-position close failed: {e}");
                        continue;
                    }
                    let mut stats = self.stats.lock().unwrap();
                    match reason {
                        "take_profit" => stats.tp_closes += 1,
                        "stop_loss" => stats.sl_closes += 1,
                        _ => stats.timeout_closes += 1,
                    }
                    drop(stats);
                    *self.held_position.lock().unwrap() = None;
                }
            }
        });
    }

    // ─── Points accrual ──────────────────────────────────────────────────

    /// `points += active_total_notional × (elapsed / 86400)`. Skips intervals
    /// shorter than 100ms to avoid accruing on back-to-back empty ticks.
    fn accrue_points(&self, symbols: &[String]) {
        let now = Instant::now();
        let mut last = self.last_points_update.lock().unwrap();
        let elapsed = now.duration_since(*last);
        if elapsed < POINTS_MIN_INTERVAL {
            return;
        }
        let total_notional: f64 = symbols.iter().map(|s| self.order_manager.total_notional(s)).sum();
        let delta = total_notional * (elapsed.as_secs_f64() / SECONDS_PER_DAY);
        self.stats.lock().unwrap().points += delta;
        *last = now;
    }

    // ─── Control loop ─────────────────────────────────────────────────────

    pub fn spawn_control_loop(self: Arc<Self>, emergency_stop: Arc<AtomicBool>) {
        tokio::spawn(async move {
            loop {
                let check_interval = Duration::from_secs_f64(self.params.lock().unwrap().check_interval_seconds);
                tokio::time::sleep(check_interval).await;

                if emergency_stop.load(Ordering::SeqCst) {
                    warn!("strategy: emergency stop raised, exiting control loop");
                    break;
                }

                if let Err(e) = self.drain_pending_liquidations().await {
                    warn!("strategy: pending liquidation drain failed: {e}");
                }

                if self.held_position.lock().unwrap().is_some() {
                    continue;
                }

                let now = Instant::now();
                self.fill_tracker.lock().unwrap().maybe_reset_escalation(now);
                let paused = self.fill_tracker.lock().unwrap().is_paused(now);
                if paused {
                    let should_log = {
                        let mut last_log = self.pause_log_last_at.lock().unwrap();
                        let due = last_log.map(|l| now.duration_since(l) >= PAUSE_LOG_EVERY).unwrap_or(true);
                        if due {
                            *last_log = Some(now);
                        }
                        due
                    };
                    if should_log {
                        if let Some(remaining) = self.fill_tracker.lock().unwrap().remaining(now) {
                            info!("strategy: consecutive-fill pause, {:?} remaining", remaining);
                        }
                    }
                    continue;
                }

                if !self.params.lock().unwrap().orders_enabled {
                    continue;
                }

                if self.force_rebalance.swap(false, Ordering::SeqCst) {
                    if let Err(e) = self.recompute_effective_size().await {
                        warn!("strategy: recompute_effective_size failed: {e}");
                    }
                    let symbols = self.params.lock().unwrap().symbols.clone();
                    for symbol in &symbols {
                        if let Some(price) = self.price_tracker.get_price(symbol) {
                            if let Err(e) = self.place_fresh_ladder(symbol, price.reference_price()).await {
                                warn!("strategy: force rebalance failed for {symbol}: {e}");
                            }
                        }
                    }
                    continue;
                }

                let symbols = self.params.lock().unwrap().symbols.clone();
                for symbol in &symbols {
                    if let Err(e) = self.evaluate_symbol(symbol).await {
                        warn!("strategy: evaluate_symbol({symbol}) failed: {e}");
                    }
                }

                self.accrue_points(&symbols);

                for symbol in &symbols {
                    let due = {
                        let mut runtime = self.symbol_runtime.lock().unwrap();
                        match runtime.get_mut(symbol) {
                            Some(r) if r.last_sync_at.elapsed() >= SYNC_EVERY => {
                                r.last_sync_at = Instant::now();
                                true
                            }
                            _ => false,
                        }
                    };
                    if due {
                        if let Err(e) = self.order_manager.sync(Some(symbol)).await {
                            warn!("strategy: sync failed for {symbol}: {e}");
                        }
                    }
                }
            }
        });
    }

    async fn drain_pending_liquidations(&self) -> AgentResult<()> {
        loop {
            let next = self.pending_liquidations.lock().unwrap().pop_front();
            let (symbol, side, quantity) = match next {
                Some(v) => v,
                None => return Ok(()),
            };
            self.order_manager.place_market_reduce(&symbol, side, quantity).await?;
        }
    }

    // ─── Remote control surface ──────────────────────────────────────────

    pub async fn enable_orders(&self) -> RemoteControlReply {
        self.params.lock().unwrap().orders_enabled = true;
        RemoteControlReply {
            message: "orders enabled".to_string(),
            force_rebalance_scheduled: false,
        }
    }

    pub async fn disable_orders(&self) -> RemoteControlReply {
        self.params.lock().unwrap().orders_enabled = false;
        let symbols = self.params.lock().unwrap().symbols.clone();
        for symbol in &symbols {
            let _ = self.order_manager.cancel_all(Some(symbol)).await;
        }
        self.symbol_runtime.lock().unwrap().clear();
        RemoteControlReply {
            message: "orders disabled, working orders cancelled".to_string(),
            force_rebalance_scheduled: false,
        }
    }

    pub fn set_order_size(&self, order_size_usd: f64) -> RemoteControlReply {
        self.params.lock().unwrap().order_size_usd = order_size_usd;
        self.force_rebalance.store(true, Ordering::SeqCst);
        RemoteControlReply {
            message: format!("order_size_usd set to {order_size_usd}"),
            force_rebalance_scheduled: true,
        }
    }

    pub fn set_leverage(&self, leverage: u32) -> RemoteControlReply {
        self.params.lock().unwrap().leverage = leverage;
        self.force_rebalance.store(true, Ordering::SeqCst);
        RemoteControlReply {
            message: format!("leverage set to {leverage}"),
            force_rebalance_scheduled: true,
        }
    }

    pub fn set_strategy(&self, num_orders_per_side: usize) -> RemoteControlReply {
        self.params.lock().unwrap().num_orders_per_side = num_orders_per_side.max(1);
        self.force_rebalance.store(true, Ordering::SeqCst);
        RemoteControlReply {
            message: format!("num_orders_per_side set to {num_orders_per_side}"),
            force_rebalance_scheduled: true,
        }
    }

    pub fn set_distances(&self, distances_bps: Vec<f64>) -> RemoteControlReply {
        self.params.lock().unwrap().order_distances_bps = distances_bps.clone();
        self.force_rebalance.store(true, Ordering::SeqCst);
        RemoteControlReply {
            message: format!("order_distances_bps set to {distances_bps:?}"),
            force_rebalance_scheduled: true,
        }
    }

    pub fn get_status(&self) -> FarmingStats {
        self.stats()
    }

    pub async fn get_positions(&self) -> AgentResult<Vec<crate::gateway::PositionSnapshot>> {
        self.order_manager.query_positions().await
    }

    pub async fn close_all_positions(&self) -> AgentResult<()> {
        for position in self.order_manager.query_positions().await? {
            if position.quantity.abs() <= 0.0 {
                continue;
            }
            self.order_manager
                .place_market_reduce(&position.symbol, position.side.opposite(), position.quantity.abs())
                .await?;
        }
        *self.held_position.lock().unwrap() = None;
        Ok(())
    }

    pub fn reset_consecutive_fill_pause(&self) -> RemoteControlReply {
        self.fill_tracker.lock().unwrap().reset();
        RemoteControlReply {
            message: "consecutive-fill pause and escalation cleared".to_string(),
            force_rebalance_scheduled: false,
        }
    }

    pub fn request_force_rebalance(&self) -> RemoteControlReply {
        self.force_rebalance.store(true, Ordering::SeqCst);
        let was_disabled = {
            let mut params = self.params.lock().unwrap();
            let was_disabled = !params.orders_enabled;
            params.orders_enabled = true;
            was_disabled
        };
        RemoteControlReply {
            message: if was_disabled {
                "force rebalance requested, orders re-enabled".to_string()
            } else {
                "force rebalance requested".to_string()
            },
            force_rebalance_scheduled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ConsecutiveFillProtectionConfig {
        ConsecutiveFillProtectionConfig {
            enabled: true,
            max_fills: 3,
            window_seconds: 60.0,
            pause_duration_seconds: 300.0,
            escalated_pause_duration_seconds: 3600.0,
            escalation_reset_seconds: 1800.0,
        }
    }

    #[test]
    fn effective_order_size_clamps_to_ceiling() {
        // B=100, L=10, r=0.1, F=0.5 -> max_notional=(100*0.9-0.5)*10=895
        // 1 symbol, 2 orders_per_side -> denom=4 -> max_per_order=223.75
        let size = Strategy::effective_order_size(100.0, 10, 10.0, 1, 2, 1000.0);
        assert!((size - 223.75).abs() < 1e-6);
    }

    #[test]
    fn effective_order_size_passes_through_when_under_ceiling() {
        let size = Strategy::effective_order_size(100.0, 10, 10.0, 1, 2, 50.0);
        assert_eq!(size, 50.0);
    }

    #[test]
    fn rung_price_matches_s1_scenario() {
        // mark=50000, distances [7.5, 8.5] bps -> BUY 49962.5/49957.5, SELL 50037.5/50042.5
        assert_eq!(Strategy::rung_price(50000.0, Side::Buy, 7.5), 49962.5);
        assert_eq!(Strategy::rung_price(50000.0, Side::Buy, 8.5), 49957.5);
        assert_eq!(Strategy::rung_price(50000.0, Side::Sell, 7.5), 50037.5);
        assert_eq!(Strategy::rung_price(50000.0, Side::Sell, 8.5), 50042.5);
    }

    #[test]
    fn outer_rung_is_thirty_percent_of_base() {
        assert_eq!(Strategy::rung_notional(100.0, 0), 100.0);
        assert_eq!(Strategy::rung_notional(100.0, 1), 30.0);
    }

    #[test]
    fn round_quantity_uses_per_symbol_decimals() {
        assert_eq!(Strategy::round_quantity("BTC-USD", 0.0020001), 0.002);
        assert_eq!(Strategy::round_quantity("ETH-USD", 0.12345), 0.123);
        assert_eq!(Strategy::round_quantity("SOL-USD", 1.2345), 1.23);
    }

    #[test]
    fn held_position_tp_sl_timeout_directions() {
        let held = HeldPosition {
            symbol: "BTC-USD".to_string(),
            side: Side::Buy,
            quantity: 0.002,
            entry_price: 49962.5,
            entry_time: Instant::now() - Duration::from_secs(301),
            tp_pct: 1.0,
            sl_pct: 1.0,
            timeout_s: 300.0,
        };
        assert_eq!(held.exit_reason(49962.5, Instant::now()), Some("timeout"));

        let tp_price = 49962.5 * 1.01;
        let held_fresh = HeldPosition { entry_time: Instant::now(), ..held.clone() };
        assert_eq!(held_fresh.exit_reason(tp_price, Instant::now()), Some("take_profit"));
    }

    #[test]
    fn consecutive_fill_escalation_matches_s4_and_s5() {
        let mut tracker = ConsecutiveFillTracker::new(cfg());
        let t0 = Instant::now();
        assert!(tracker.register_fill(t0).is_none());
        assert!(tracker.register_fill(t0 + Duration::from_secs(1)).is_none());
        let event = tracker.register_fill(t0 + Duration::from_secs(2)).expect("third fill trips the breaker");
        assert_eq!(event.duration, Duration::from_secs_f64(300.0));
        assert!(!event.escalated);
        assert!(tracker.is_paused(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn escalation_level_resets_after_quiet_period() {
        let mut tracker = ConsecutiveFillTracker::new(cfg());
        let t0 = Instant::now();
        tracker.register_fill(t0);
        tracker.register_fill(t0 + Duration::from_secs(1));
        tracker.register_fill(t0 + Duration::from_secs(2));
        assert_eq!(tracker.level, 1);

        tracker.maybe_reset_escalation(t0 + Duration::from_secs(1900));
        assert_eq!(tracker.level, 0);
    }

    #[test]
    fn operator_reset_clears_pause_unconditionally() {
        let mut tracker = ConsecutiveFillTracker::new(cfg());
        let t0 = Instant::now();
        tracker.register_fill(t0);
        tracker.register_fill(t0 + Duration::from_secs(1));
        tracker.register_fill(t0 + Duration::from_secs(2));
        assert!(tracker.is_paused(t0 + Duration::from_secs(3)));
        tracker.reset();
        assert!(!tracker.is_paused(t0 + Duration::from_secs(3)));
    }
}
