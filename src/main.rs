mod band_calculator;
mod config;
mod error;
mod fill_protection;
mod gateway;
mod market_feed;
mod order_manager;
mod price_tracker;
mod reference_feed;
mod safety_guard;
mod signing;
mod strategy;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::Engine;
use ed25519_dalek::SigningKey;

use config::Config;
use fill_protection::FillProtection;
use gateway::ExchangeGateway;
use market_feed::{Channel, MarketFeed};
use order_manager::OrderManager;
use price_tracker::PriceTracker;
use reference_feed::ReferenceFeed;
use safety_guard::SafetyGuard;
use signing::AuthHandle;
use strategy::Strategy;

/// Builds the Ed25519 `AuthHandle` from the already-issued credentials.
/// Obtaining `EXCHANGE_API_KEY_ID` (bearer JWT) and `EXCHANGE_API_PRIVATE_KEY`
/// (base64 32-byte seed) via the wallet-signature handshake is an
/// out-of-scope external collaborator per the spec; this only consumes it.
fn build_auth_handle() -> AuthHandle {
    let bearer_token = std::env::var("EXCHANGE_API_KEY_ID").expect("EXCHANGE_API_KEY_ID must be set");
    let private_key_b64 =
        std::env::var("EXCHANGE_API_PRIVATE_KEY").expect("EXCHANGE_API_PRIVATE_KEY must be set");
    let seed_bytes = base64::engine::general_purpose::STANDARD
        .decode(private_key_b64.trim())
        .expect("EXCHANGE_API_PRIVATE_KEY must be valid base64");
    let seed: [u8; 32] = seed_bytes
        .as_slice()
        .try_into()
        .expect("EXCHANGE_API_PRIVATE_KEY must decode to 32 bytes");
    AuthHandle::new(bearer_token, SigningKey::from_bytes(&seed))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::load().expect("failed to load configuration");
    log::info!(
        "maker farming agent starting: symbols={:?} leverage={}x order_size=${}",
        config.strategy.symbols, config.strategy.leverage, config.strategy.order_size_usd
    );

    let auth = build_auth_handle();
    let gateway = ExchangeGateway::new(config.exchange.base_url.clone(), auth);

    let market_feed_bearer_token =
        std::env::var("EXCHANGE_API_KEY_ID").expect("EXCHANGE_API_KEY_ID must be set");
    let market_feed = Arc::new(MarketFeed::new(config.exchange.ws_url.clone(), Some(market_feed_bearer_token)));
    for symbol in &config.strategy.symbols {
        market_feed.track_subscription(Channel::Price, symbol);
        market_feed.track_subscription(Channel::Orderbook, symbol);
        market_feed.track_subscription(Channel::Order, symbol);
    }

    let reference_symbol_map = build_reference_symbol_map(&config.strategy.symbols);
    let reference_symbols: Vec<String> = reference_symbol_map.0.values().cloned().collect();
    let reference_feed = Arc::new(ReferenceFeed::new(
        config.reference_feed.ws_url.clone(),
        config.reference_feed.use_1s_stream,
        reference_symbol_map,
    ));

    let price_tracker_gateway = Arc::new(gateway);
    let price_tracker = Arc::new(PriceTracker::new(market_feed.clone(), price_tracker_gateway.clone()));

    let order_manager_gateway = ExchangeGateway::new(config.exchange.base_url.clone(), build_auth_handle());
    let order_manager = Arc::new(OrderManager::new(order_manager_gateway));

    let safety_guard = Arc::new(SafetyGuard::new(config.safety.clone(), price_tracker.clone(), order_manager.clone()));
    let fill_protection = Arc::new(FillProtection::new(
        config.fill_protection.clone(),
        safety_guard.clone(),
        order_manager.clone(),
        reference_feed.clone(),
    ));

    let strategy = Arc::new(Strategy::new(
        config.strategy.clone(),
        config.consecutive_fill_protection.clone(),
        order_manager.clone(),
        safety_guard.clone(),
        price_tracker.clone(),
    ));

    // ─── Required tasks (§5): receive loops, guard loops, control loop ─────
    {
        let market_feed = market_feed.clone();
        tokio::spawn(async move { market_feed.run().await });
    }
    {
        let reference_feed = reference_feed.clone();
        let reference_symbols = reference_symbols.clone();
        tokio::spawn(async move { reference_feed.run(reference_symbols).await });
    }

    order_manager.clone().spawn_live_order_listener(market_feed.on_order_update());

    price_tracker.clone().spawn_ingest_loop();
    safety_guard.clone().spawn_loop(config.strategy.symbols.clone());
    fill_protection.clone().spawn_orderbook_ingest(market_feed.clone());
    fill_protection.clone().spawn_loop(config.strategy.symbols.clone());

    strategy.clone().spawn_fill_listener();
    strategy.clone().spawn_held_position_monitor();

    let emergency_stop = safety_guard.emergency_stop_flag();
    strategy.clone().spawn_control_loop(emergency_stop.clone());

    // Position-check loop (§5 task f): separated from the control loop so a
    // slow REST round-trip never stalls the 1s tick budget.
    {
        let safety_guard = safety_guard.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                if let Err(e) = safety_guard.check_position_cap().await {
                    log::warn!("position-check loop: {e}");
                }
            }
        });
    }

    log::info!("all tasks spawned, entering shutdown watch");

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        if emergency_stop.load(Ordering::SeqCst) {
            log::error!("EMERGENCY STOP raised — cancelling all working orders and exiting");
            if let Err(e) = order_manager.cancel_all(None).await {
                log::error!("final cancel_all failed: {e}");
            }
            std::process::exit(1);
        }
    }
}

fn build_reference_symbol_map(symbols: &[String]) -> gateway::SymbolMap {
    let mut map = std::collections::HashMap::new();
    for symbol in symbols {
        let reference = symbol.split('-').next().unwrap_or(symbol).to_uppercase() + "USDT";
        map.insert(symbol.clone(), reference);
    }
    gateway::SymbolMap(map)
}
