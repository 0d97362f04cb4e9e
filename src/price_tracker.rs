use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::AgentResult;
use crate::gateway::ExchangeGateway;
use crate::market_feed::{MarketFeed, PriceUpdate};

const STALE_THRESHOLD: Duration = Duration::from_secs(10);
const HISTORY_WINDOW: Duration = Duration::from_secs(30);
const CHANGE_THRESHOLD_BPS: f64 = 1.0;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A merged per-symbol snapshot. `age` reflects whichever source (price
/// topic vs. orderbook top) was actually used to derive `best_bid`/`best_ask`,
/// per the precedence rule below.
#[derive(Debug, Clone)]
pub struct SymbolPrice {
    pub mark: f64,
    pub mid: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_bps: f64,
    pub index: f64,
    pub last: f64,
    pub age: Duration,
}

impl SymbolPrice {
    pub fn reference_price(&self) -> f64 {
        if self.mark > 0.0 {
            self.mark
        } else {
            self.mid
        }
    }

    pub fn mark_mid_divergence_bps(&self) -> f64 {
        if self.mid <= 0.0 {
            return 0.0;
        }
        (self.mark - self.mid).abs() / self.mid * 10_000.0
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age > threshold
    }
}

struct HistorySample {
    elapsed_at_insert: std::time::Instant,
    price: f64,
}

/// Fuses the Market Feed's price/orderbook caches into `SymbolPrice`, keeps
/// rolling reference-price history for volatility queries, and falls back to
/// REST only when the stream cache is absent or stale.
pub struct PriceTracker {
    market_feed: Arc<MarketFeed>,
    gateway: Arc<ExchangeGateway>,
    history: Mutex<HashMap<String, VecDeque<HistorySample>>>,
    last_mid: Mutex<HashMap<String, f64>>,
    change_tx: broadcast::Sender<String>,
}

impl PriceTracker {
    pub fn new(market_feed: Arc<MarketFeed>, gateway: Arc<ExchangeGateway>) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        PriceTracker {
            market_feed,
            gateway,
            history: Mutex::new(HashMap::new()),
            last_mid: Mutex::new(HashMap::new()),
            change_tx,
        }
    }

    pub fn on_change(&self) -> broadcast::Receiver<String> {
        self.change_tx.subscribe()
    }

    /// Best-bid/ask precedence per §4.4/§9: prefer the orderbook top when
    /// both sources are fresh; fall back to the price-topic spread when the
    /// orderbook is stale but the price topic is fresh.
    pub fn get_price(&self, symbol: &str) -> Option<SymbolPrice> {
        let price_cached = self.market_feed.cached_price(symbol);
        let book_cached = self.market_feed.cached_orderbook(symbol);

        let (mark, mid, index, last, price_topic_bid, price_topic_ask, price_topic_spread, price_age) =
            match &price_cached {
                Some((p, age)) => (
                    p.mark,
                    p.mid,
                    p.index,
                    p.last,
                    p.best_bid,
                    p.best_ask,
                    p.spread_bps,
                    *age,
                ),
                None => return None,
            };

        let price_fresh = price_age <= STALE_THRESHOLD;
        let book_fresh = book_cached
            .as_ref()
            .map(|(_, age)| *age <= STALE_THRESHOLD)
            .unwrap_or(false);

        let (best_bid, best_ask, age) = if book_fresh {
            let (book, age) = book_cached.as_ref().unwrap();
            (
                book.bids.first().map(|l| l.price).unwrap_or(0.0),
                book.asks.first().map(|l| l.price).unwrap_or(0.0),
                *age,
            )
        } else if price_fresh {
            (price_topic_bid, price_topic_ask, price_age)
        } else if let Some((book, age)) = &book_cached {
            (
                book.bids.first().map(|l| l.price).unwrap_or(0.0),
                book.asks.first().map(|l| l.price).unwrap_or(0.0),
                *age,
            )
        } else {
            (price_topic_bid, price_topic_ask, price_age)
        };

        Some(SymbolPrice {
            mark,
            mid,
            best_bid,
            best_ask,
            spread_bps: price_topic_spread,
            index,
            last,
            age,
        })
    }

    /// `reference_price` if the stream cache is fresh; otherwise a REST
    /// fallback that also repopulates the Market Feed's cache. Not a regular
    /// path — only exercised when the stream cache is absent/stale.
    pub async fn reference_price(&self, symbol: &str) -> AgentResult<f64> {
        if let Some(price) = self.get_price(symbol) {
            if !price.is_stale(STALE_THRESHOLD) {
                return Ok(price.reference_price());
            }
        }

        let fetched = self.gateway.query_symbol_price(symbol).await?;
        let update = PriceUpdate {
            symbol: symbol.to_string(),
            mark: fetched.mark,
            mid: fetched.mid,
            best_bid: fetched.best_bid,
            best_ask: fetched.best_ask,
            spread_bps: if fetched.mid > 0.0 {
                (fetched.best_ask - fetched.best_bid) / fetched.mid * 10_000.0
            } else {
                0.0
            },
            index: fetched.index,
            last: fetched.last,
        };
        self.market_feed.inject_price(update.clone());
        Ok(if update.mark > 0.0 { update.mark } else { update.mid })
    }

    /// `(max − min)/midpoint × 10000` over reference-price samples within
    /// `window_s`; 0 with fewer than 2 samples.
    pub fn volatility_bps(&self, symbol: &str, window_s: f64) -> f64 {
        let history = self.history.lock().unwrap();
        let samples = match history.get(symbol) {
            Some(s) => s,
            None => return 0.0,
        };

        let window = Duration::from_secs_f64(window_s);
        let now = std::time::Instant::now();
        let in_window: Vec<f64> = samples
            .iter()
            .filter(|s| now.duration_since(s.elapsed_at_insert) <= window)
            .map(|s| s.price)
            .collect();

        if in_window.len() < 2 {
            return 0.0;
        }

        let max = in_window.iter().cloned().fold(f64::MIN, f64::max);
        let min = in_window.iter().cloned().fold(f64::MAX, f64::min);
        let midpoint = (max + min) / 2.0;
        if midpoint <= 0.0 {
            return 0.0;
        }
        (max - min) / midpoint * 10_000.0
    }

    /// Appends an incoming price update to history and fires a change
    /// callback when mid has moved by more than `CHANGE_THRESHOLD_BPS`.
    /// Intended to be called from a task subscribed to `MarketFeed::on_price`.
    pub fn record_update(&self, update: &PriceUpdate) {
        let reference_price = if update.mark > 0.0 { update.mark } else { update.mid };
        {
            let mut history = self.history.lock().unwrap();
            let samples = history.entry(update.symbol.clone()).or_insert_with(VecDeque::new);
            let now = std::time::Instant::now();
            samples.push_back(HistorySample {
                elapsed_at_insert: now,
                price: reference_price,
            });
            while let Some(front) = samples.front() {
                if now.duration_since(front.elapsed_at_insert) > HISTORY_WINDOW {
                    samples.pop_front();
                } else {
                    break;
                }
            }
        }

        let mut last_mid = self.last_mid.lock().unwrap();
        let changed = match last_mid.get(&update.symbol) {
            Some(&prev) if prev > 0.0 => {
                let change_bps = (update.mid - prev).abs() / prev * 10_000.0;
                change_bps > CHANGE_THRESHOLD_BPS
            }
            _ => false,
        };
        last_mid.insert(update.symbol.clone(), update.mid);
        drop(last_mid);

        if changed {
            debug!("price_tracker: {} mid moved > {CHANGE_THRESHOLD_BPS} bps", update.symbol);
            let _ = self.change_tx.send(update.symbol.clone());
        }
    }

    /// Spawns the background task that drains `MarketFeed::on_price` into
    /// this tracker's history/change-detection.
    pub fn spawn_ingest_loop(self: Arc<Self>) {
        let mut rx = self.market_feed.on_price();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => self.record_update(&update),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update(symbol: &str, mark: f64, mid: f64) -> PriceUpdate {
        PriceUpdate {
            symbol: symbol.to_string(),
            mark,
            mid,
            best_bid: mid - 1.0,
            best_ask: mid + 1.0,
            spread_bps: 0.4,
            index: mark,
            last: mark,
        }
    }

    fn tracker() -> PriceTracker {
        let market_feed = Arc::new(MarketFeed::new("wss://example.invalid/ws".to_string(), None));
        // gateway is never exercised by these tests (no staleness triggers REST)
        let gateway = Arc::new(ExchangeGateway::new(
            "https://example.invalid".to_string(),
            crate::signing::AuthHandle::new(
                "token".to_string(),
                ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]),
            ),
        ));
        PriceTracker::new(market_feed, gateway)
    }

    #[test]
    fn volatility_is_zero_with_fewer_than_two_samples() {
        let t = tracker();
        t.record_update(&sample_update("BTC-USD", 50000.0, 50000.0));
        assert_eq!(t.volatility_bps("BTC-USD", 30.0), 0.0);
    }

    #[test]
    fn volatility_matches_max_min_midpoint_formula() {
        let t = tracker();
        t.record_update(&sample_update("BTC-USD", 50000.0, 50000.0));
        t.record_update(&sample_update("BTC-USD", 50010.0, 50010.0));
        let vol = t.volatility_bps("BTC-USD", 30.0);
        // max=50010, min=50000, midpoint=50005 -> 10/50005*10000
        assert!((vol - (10.0 / 50005.0 * 10_000.0)).abs() < 1e-6);
    }

    #[test]
    fn get_price_is_none_without_any_price_update() {
        let t = tracker();
        assert!(t.get_price("BTC-USD").is_none());
    }

    #[test]
    fn reference_price_prefers_mark_over_mid() {
        let price = SymbolPrice {
            mark: 100.0,
            mid: 99.0,
            best_bid: 98.5,
            best_ask: 99.5,
            spread_bps: 1.0,
            index: 100.0,
            last: 100.0,
            age: Duration::from_millis(10),
        };
        assert_eq!(price.reference_price(), 100.0);
    }

    #[test]
    fn reference_price_falls_back_to_mid_when_mark_is_zero() {
        let price = SymbolPrice {
            mark: 0.0,
            mid: 99.0,
            best_bid: 98.5,
            best_ask: 99.5,
            spread_bps: 1.0,
            index: 0.0,
            last: 99.0,
            age: Duration::from_millis(10),
        };
        assert_eq!(price.reference_price(), 99.0);
    }
}
