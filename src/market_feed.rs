use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

const RECONNECT_CAP: Duration = Duration::from_secs(10);
const RECEIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CALLBACK_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Price,
    Orderbook,
    Order,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub mark: f64,
    pub mid: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_bps: f64,
    pub index: f64,
    pub last: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookUpdate {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateOrderUpdate {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    received_at: Instant,
}

/// Single-writer (receive loop), many-reader caches plus broadcast callbacks.
/// Mirrors the teacher's `MarketDataBuffer` shape but speaks the spec's
/// channel set (`price`, `orderbook`, private `order`) instead of Hyperliquid's.
#[derive(Default)]
struct FeedState {
    prices: HashMap<String, CacheEntry<PriceUpdate>>,
    orderbooks: HashMap<String, CacheEntry<OrderbookUpdate>>,
}

pub struct MarketFeed {
    ws_url: String,
    bearer_token: Option<String>,
    state: Arc<Mutex<FeedState>>,
    subscriptions: Arc<Mutex<HashSet<(Channel, String)>>>,
    price_tx: broadcast::Sender<PriceUpdate>,
    orderbook_tx: broadcast::Sender<OrderbookUpdate>,
    order_tx: broadcast::Sender<PrivateOrderUpdate>,
}

impl MarketFeed {
    pub fn new(ws_url: String, bearer_token: Option<String>) -> Self {
        let (price_tx, _) = broadcast::channel(CALLBACK_CHANNEL_CAPACITY);
        let (orderbook_tx, _) = broadcast::channel(CALLBACK_CHANNEL_CAPACITY);
        let (order_tx, _) = broadcast::channel(CALLBACK_CHANNEL_CAPACITY);
        MarketFeed {
            ws_url,
            bearer_token,
            state: Arc::new(Mutex::new(FeedState::default())),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            price_tx,
            orderbook_tx,
            order_tx,
        }
    }

    pub fn on_price(&self) -> broadcast::Receiver<PriceUpdate> {
        self.price_tx.subscribe()
    }

    pub fn on_orderbook(&self) -> broadcast::Receiver<OrderbookUpdate> {
        self.orderbook_tx.subscribe()
    }

    pub fn on_order_update(&self) -> broadcast::Receiver<PrivateOrderUpdate> {
        self.order_tx.subscribe()
    }

    /// Repopulates the price cache from a REST fallback fetch. Used only by
    /// the Price Tracker when the stream cache is absent or stale — never a
    /// substitute for the normal WS-driven path.
    pub fn inject_price(&self, update: PriceUpdate) {
        self.state.lock().unwrap().prices.insert(
            update.symbol.clone(),
            CacheEntry {
                value: update.clone(),
                received_at: Instant::now(),
            },
        );
        let _ = self.price_tx.send(update);
    }

    pub fn cached_price(&self, symbol: &str) -> Option<(PriceUpdate, Duration)> {
        let state = self.state.lock().unwrap();
        state
            .prices
            .get(symbol)
            .map(|e| (e.value.clone(), e.received_at.elapsed()))
    }

    pub fn cached_orderbook(&self, symbol: &str) -> Option<(OrderbookUpdate, Duration)> {
        let state = self.state.lock().unwrap();
        state
            .orderbooks
            .get(symbol)
            .map(|e| (e.value.clone(), e.received_at.elapsed()))
    }

    /// Registers interest in a channel/symbol. If already connected, the
    /// caller should also send the subscribe frame directly; this set exists
    /// so reconnects can replay every subscription made so far.
    pub fn track_subscription(&self, channel: Channel, symbol: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert((channel, symbol.to_string()));
    }

    /// Runs the reconnect loop forever. Intended to be spawned as its own task.
    pub async fn run(self: Arc<Self>) {
        let mut retry_delay = Duration::from_millis(500);

        loop {
            info!("market_feed: connecting to {}", self.ws_url);
            match tokio_tungstenite::connect_async(
                Url::parse(&self.ws_url).expect("ws_url is validated at config load"),
            )
            .await
            {
                Ok((ws_stream, _)) => {
                    info!("market_feed: connected");
                    retry_delay = Duration::from_millis(500);

                    let (mut write, mut read) = ws_stream.split();
                    self.replay_subscriptions(&mut write).await;

                    loop {
                        let next = tokio::time::timeout(RECEIVE_IDLE_TIMEOUT, read.next()).await;
                        match next {
                            Ok(Some(Ok(Message::Text(text)))) => self.handle_message(&text),
                            Ok(Some(Ok(Message::Ping(data)))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Ok(Some(Ok(Message::Close(_)))) => {
                                warn!("market_feed: server closed connection");
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                error!("market_feed: ws error: {e}");
                                break;
                            }
                            Ok(None) => {
                                warn!("market_feed: stream ended");
                                break;
                            }
                            Err(_) => {
                                warn!("market_feed: no message for {RECEIVE_IDLE_TIMEOUT:?}, forcing reconnect");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("market_feed: connect failed: {e}");
                }
            }

            tokio::time::sleep(retry_delay).await;
            retry_delay = std::cmp::min(retry_delay * 2, RECONNECT_CAP);
        }
    }

    async fn replay_subscriptions<S>(&self, write: &mut S)
    where
        S: SinkExt<Message> + Unpin,
    {
        let subs: Vec<(Channel, String)> = self.subscriptions.lock().unwrap().iter().cloned().collect();
        for (channel, symbol) in subs {
            let frame = match channel {
                Channel::Order => serde_json::json!({
                    "auth": {
                        "token": self.bearer_token,
                        "streams": [{"channel": "order", "symbol": symbol}],
                    }
                }),
                other => serde_json::json!({
                    "subscribe": {"channel": channel_name(other), "symbol": symbol}
                }),
            };
            let _ = write.send(Message::Text(frame.to_string())).await;
        }
    }

    fn handle_message(&self, text: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let channel = parsed["channel"].as_str().unwrap_or("");
        let data = &parsed["data"];

        match channel {
            "price" => {
                if let Ok(update) = serde_json::from_value::<PriceUpdate>(data.clone()) {
                    self.state.lock().unwrap().prices.insert(
                        update.symbol.clone(),
                        CacheEntry {
                            value: update.clone(),
                            received_at: Instant::now(),
                        },
                    );
                    let _ = self.price_tx.send(update);
                }
            }
            "depth_book" => {
                if let Ok(update) = serde_json::from_value::<OrderbookUpdate>(data.clone()) {
                    self.state.lock().unwrap().orderbooks.insert(
                        update.symbol.clone(),
                        CacheEntry {
                            value: update.clone(),
                            received_at: Instant::now(),
                        },
                    );
                    let _ = self.orderbook_tx.send(update);
                }
            }
            "order" => {
                if let Ok(update) = serde_json::from_value::<PrivateOrderUpdate>(data.clone()) {
                    let _ = self.order_tx.send(update);
                }
            }
            _ => {}
        }
    }
}

fn channel_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Price => "price",
        Channel::Orderbook => "depth_book",
        Channel::Order => "order",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_price_is_none_before_any_update() {
        let feed = MarketFeed::new("wss://example.invalid/ws".to_string(), None);
        assert!(feed.cached_price("BTC-USD").is_none());
    }

    #[test]
    fn handle_message_populates_price_cache_and_broadcasts() {
        let feed = MarketFeed::new("wss://example.invalid/ws".to_string(), None);
        let mut rx = feed.on_price();
        let msg = serde_json::json!({
            "channel": "price",
            "data": {
                "symbol": "BTC-USD", "mark": 50000.0, "mid": 50000.0,
                "best_bid": 49999.0, "best_ask": 50001.0, "spread_bps": 0.4,
                "index": 50000.0, "last": 50000.0
            }
        })
        .to_string();
        feed.handle_message(&msg);

        let (cached, age) = feed.cached_price("BTC-USD").unwrap();
        assert_eq!(cached.mark, 50000.0);
        assert!(age < Duration::from_secs(1));
        assert_eq!(rx.try_recv().unwrap().symbol, "BTC-USD");
    }

    #[test]
    fn track_subscription_dedups() {
        let feed = MarketFeed::new("wss://example.invalid/ws".to_string(), None);
        feed.track_subscription(Channel::Price, "BTC-USD");
        feed.track_subscription(Channel::Price, "BTC-USD");
        assert_eq!(feed.subscriptions.lock().unwrap().len(), 1);
    }
}
