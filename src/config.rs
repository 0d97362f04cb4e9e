use crate::error::{AgentError, AgentResult};
use std::env;

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env_var(key) {
        Some(v) => v.split(',').map(|s| s.trim().to_string()).collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_f64_list(key: &str, default: &[f64]) -> Vec<f64> {
    match env_var(key) {
        Some(v) => v
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect(),
        None => default.to_vec(),
    }
}

#[derive(Debug, Clone)]
pub struct DynamicDistanceConfig {
    pub enabled: bool,
    pub min_bps: f64,
    pub max_bps: f64,
    pub spread_factor: f64,
    pub volatility_factor: f64,
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub symbols: Vec<String>,
    pub leverage: u32,
    pub order_size_usd: f64,
    pub margin_reserve_percent: f64,
    pub num_orders_per_side: usize,
    pub order_distances_bps: Vec<f64>,
    pub target_distance_bps: f64,
    pub max_distance_bps: f64,
    pub order_lock_seconds: f64,
    pub rebalance_cooldown_seconds: f64,
    pub drift_threshold_bps: f64,
    pub check_interval_seconds: f64,
    pub dynamic_distance: DynamicDistanceConfig,
}

#[derive(Debug, Clone)]
pub struct PreKillConfig {
    pub volatility_threshold_bps: f64,
    pub mark_mid_divergence_bps: f64,
    pub pause_duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct HardKillConfig {
    pub min_spread_bps: f64,
    pub max_volatility_bps: f64,
    pub stale_threshold_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_position_usd: f64,
    pub cancel_if_within_bps: f64,
    pub position_grace_seconds: f64,
    pub pre_kill: PreKillConfig,
    pub hard_kill: HardKillConfig,
}

#[derive(Debug, Clone)]
pub struct ReferenceProtectionConfig {
    pub enabled: bool,
    pub trigger_bps: f64,
    pub window_seconds: f64,
    pub cooldown_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct QueueProtectionConfig {
    pub enabled: bool,
    pub drop_threshold_percent: f64,
    pub window_seconds: f64,
    pub min_queue_ahead_usd: f64,
}

#[derive(Debug, Clone)]
pub struct FillProtectionConfig {
    pub reference: ReferenceProtectionConfig,
    pub queue: QueueProtectionConfig,
    pub check_interval_seconds: f64,
    pub smart_protection_threshold_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct ConsecutiveFillProtectionConfig {
    pub enabled: bool,
    pub max_fills: usize,
    pub window_seconds: f64,
    pub pause_duration_seconds: f64,
    pub escalated_pause_duration_seconds: f64,
    pub escalation_reset_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub ws_url: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ReferenceFeedConfig {
    pub ws_url: String,
    pub use_1s_stream: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub reference_feed: ReferenceFeedConfig,
    pub strategy: StrategyConfig,
    pub safety: SafetyConfig,
    pub fill_protection: FillProtectionConfig,
    pub consecutive_fill_protection: ConsecutiveFillProtectionConfig,
}

impl Config {
    /// Loads configuration from `.env` (if present) merged with the process
    /// environment, then validates cross-field invariants. A `ConfigError`
    /// here is fatal at startup, per the error taxonomy.
    pub fn load() -> AgentResult<Config> {
        dotenvy::dotenv().ok();

        let symbols = env_list("STRATEGY_SYMBOLS", &["BTC-USD"]);
        let order_distances_bps = env_f64_list("STRATEGY_ORDER_DISTANCES_BPS", &[7.5, 8.5]);
        let num_orders_per_side = env_usize("STRATEGY_NUM_ORDERS_PER_SIDE", order_distances_bps.len());

        let config = Config {
            exchange: ExchangeConfig {
                base_url: env_var("EXCHANGE_BASE_URL")
                    .unwrap_or_else(|| "https://api.exchange.example".to_string()),
                ws_url: env_var("EXCHANGE_WS_URL")
                    .unwrap_or_else(|| "wss://stream.exchange.example".to_string()),
                request_timeout_seconds: env_u64("EXCHANGE_REQUEST_TIMEOUT_SECONDS", 30),
            },
            reference_feed: ReferenceFeedConfig {
                ws_url: env_var("REFERENCE_FEED_WS_URL")
                    .unwrap_or_else(|| "wss://stream.binance.com:9443/ws".to_string()),
                use_1s_stream: env_bool("REFERENCE_FEED_USE_1S_STREAM", true),
            },
            strategy: StrategyConfig {
                symbols,
                leverage: env_u64("STRATEGY_LEVERAGE", 10) as u32,
                order_size_usd: env_f64("STRATEGY_ORDER_SIZE_USD", 100.0),
                margin_reserve_percent: env_f64("STRATEGY_MARGIN_RESERVE_PERCENT", 20.0),
                num_orders_per_side,
                order_distances_bps,
                target_distance_bps: env_f64("STRATEGY_TARGET_DISTANCE_BPS", 5.0),
                max_distance_bps: env_f64("STRATEGY_MAX_DISTANCE_BPS", 10.0),
                order_lock_seconds: env_f64("STRATEGY_ORDER_LOCK_SECONDS", 0.7),
                rebalance_cooldown_seconds: env_f64("STRATEGY_REBALANCE_COOLDOWN_SECONDS", 3.0),
                drift_threshold_bps: env_f64("STRATEGY_DRIFT_THRESHOLD_BPS", 4.0),
                check_interval_seconds: env_f64("STRATEGY_CHECK_INTERVAL_SECONDS", 1.0),
                dynamic_distance: DynamicDistanceConfig {
                    enabled: env_bool("STRATEGY_DYNAMIC_DISTANCE_ENABLED", true),
                    min_bps: env_f64("STRATEGY_DYNAMIC_DISTANCE_MIN_BPS", 5.0),
                    max_bps: env_f64("STRATEGY_DYNAMIC_DISTANCE_MAX_BPS", 9.0),
                    spread_factor: env_f64("STRATEGY_DYNAMIC_DISTANCE_SPREAD_FACTOR", 0.6),
                    volatility_factor: env_f64("STRATEGY_DYNAMIC_DISTANCE_VOLATILITY_FACTOR", 0.8),
                },
            },
            safety: SafetyConfig {
                max_position_usd: env_f64("SAFETY_MAX_POSITION_USD", 1000.0),
                cancel_if_within_bps: env_f64("SAFETY_CANCEL_IF_WITHIN_BPS", 2.0),
                position_grace_seconds: env_f64("SAFETY_POSITION_GRACE_SECONDS", 5.0),
                pre_kill: PreKillConfig {
                    volatility_threshold_bps: env_f64("SAFETY_PRE_KILL_VOLATILITY_THRESHOLD_BPS", 15.0),
                    mark_mid_divergence_bps: env_f64("SAFETY_PRE_KILL_MARK_MID_DIVERGENCE_BPS", 3.0),
                    pause_duration_seconds: env_f64("SAFETY_PRE_KILL_PAUSE_DURATION_SECONDS", 5.0),
                },
                hard_kill: HardKillConfig {
                    min_spread_bps: env_f64("SAFETY_HARD_KILL_MIN_SPREAD_BPS", 1.5),
                    max_volatility_bps: env_f64("SAFETY_HARD_KILL_MAX_VOLATILITY_BPS", 30.0),
                    stale_threshold_seconds: env_f64("SAFETY_HARD_KILL_STALE_THRESHOLD_SECONDS", 10.0),
                },
            },
            fill_protection: FillProtectionConfig {
                reference: ReferenceProtectionConfig {
                    enabled: env_bool("FILL_PROTECTION_REFERENCE_ENABLED", true),
                    trigger_bps: env_f64("FILL_PROTECTION_REFERENCE_TRIGGER_BPS", 3.0),
                    window_seconds: env_f64("FILL_PROTECTION_REFERENCE_WINDOW_SECONDS", 0.5),
                    cooldown_seconds: env_f64("FILL_PROTECTION_REFERENCE_COOLDOWN_SECONDS", 0.5),
                },
                queue: QueueProtectionConfig {
                    enabled: env_bool("FILL_PROTECTION_QUEUE_ENABLED", true),
                    drop_threshold_percent: env_f64("FILL_PROTECTION_QUEUE_DROP_THRESHOLD_PERCENT", 30.0),
                    window_seconds: env_f64("FILL_PROTECTION_QUEUE_WINDOW_SECONDS", 2.0),
                    min_queue_ahead_usd: env_f64("FILL_PROTECTION_QUEUE_MIN_QUEUE_AHEAD_USD", 100.0),
                },
                check_interval_seconds: env_f64("FILL_PROTECTION_CHECK_INTERVAL_SECONDS", 0.1),
                smart_protection_threshold_seconds: env_f64(
                    "FILL_PROTECTION_SMART_PROTECTION_THRESHOLD_SECONDS",
                    2.5,
                ),
            },
            consecutive_fill_protection: ConsecutiveFillProtectionConfig {
                enabled: env_bool("CONSECUTIVE_FILL_PROTECTION_ENABLED", true),
                max_fills: env_usize("CONSECUTIVE_FILL_PROTECTION_MAX_FILLS", 3),
                window_seconds: env_f64("CONSECUTIVE_FILL_PROTECTION_WINDOW_SECONDS", 60.0),
                pause_duration_seconds: env_f64("CONSECUTIVE_FILL_PROTECTION_PAUSE_DURATION_SECONDS", 300.0),
                escalated_pause_duration_seconds: env_f64(
                    "CONSECUTIVE_FILL_PROTECTION_ESCALATED_PAUSE_DURATION_SECONDS",
                    3600.0,
                ),
                escalation_reset_seconds: env_f64(
                    "CONSECUTIVE_FILL_PROTECTION_ESCALATION_RESET_SECONDS",
                    1800.0,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AgentResult<()> {
        if self.strategy.symbols.is_empty() {
            return Err(AgentError::Config("strategy.symbols must not be empty".into()));
        }
        if self.strategy.num_orders_per_side == 0 {
            return Err(AgentError::Config(
                "strategy.num_orders_per_side must be >= 1".into(),
            ));
        }
        if self.strategy.order_distances_bps.len() < self.strategy.num_orders_per_side {
            return Err(AgentError::Config(format!(
                "order_distances_bps has {} entries but num_orders_per_side is {}",
                self.strategy.order_distances_bps.len(),
                self.strategy.num_orders_per_side
            )));
        }
        if self.strategy.order_size_usd <= 0.0 {
            return Err(AgentError::Config("strategy.order_size_usd must be positive".into()));
        }
        if env_var("EXCHANGE_API_KEY_ID").is_none() || env_var("EXCHANGE_API_PRIVATE_KEY").is_none() {
            return Err(AgentError::Config(
                "EXCHANGE_API_KEY_ID and EXCHANGE_API_PRIVATE_KEY must be set".into(),
            ));
        }
        Ok(())
    }
}
