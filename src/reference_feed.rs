use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::gateway::SymbolMap;

const RECONNECT_CAP: Duration = Duration::from_secs(10);
const RECEIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    price: f64,
}

/// Secondary-exchange mark-price stream. Same reconnect shape as `MarketFeed`
/// but exposes only the short-window leading-indicator query the spec needs —
/// `change_bps` — rather than a generic price/orderbook cache.
pub struct ReferenceFeed {
    ws_url: String,
    use_1s_stream: bool,
    symbol_map: SymbolMap,
    history: Arc<Mutex<HashMap<String, VecDeque<Sample>>>>,
}

impl ReferenceFeed {
    pub fn new(ws_url: String, use_1s_stream: bool, symbol_map: SymbolMap) -> Self {
        ReferenceFeed {
            ws_url,
            use_1s_stream,
            symbol_map,
            history: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Signed bps change between the newest sample and the oldest sample
    /// within `window_s`. Returns 0.0 if fewer than 2 samples fall in window.
    pub fn change_bps(&self, primary_symbol: &str, window_s: f64) -> f64 {
        let reference_symbol = match self.symbol_map.to_reference(primary_symbol) {
            Some(s) => s,
            None => return 0.0,
        };
        let history = self.history.lock().unwrap();
        let samples = match history.get(reference_symbol) {
            Some(s) => s,
            None => return 0.0,
        };

        let window = Duration::from_secs_f64(window_s);
        let cutoff = Instant::now().checked_sub(window);
        let in_window: Vec<&Sample> = samples
            .iter()
            .filter(|s| cutoff.map(|c| s.at >= c).unwrap_or(true))
            .collect();

        if in_window.len() < 2 {
            return 0.0;
        }
        let oldest = in_window.first().unwrap();
        let newest = in_window.last().unwrap();
        if oldest.price <= 0.0 {
            return 0.0;
        }
        (newest.price - oldest.price) / oldest.price * 10_000.0
    }

    pub async fn run(self: Arc<Self>, reference_symbols: Vec<String>) {
        let mut retry_delay = Duration::from_millis(500);

        loop {
            info!("reference_feed: connecting to {}", self.ws_url);
            match tokio_tungstenite::connect_async(
                Url::parse(&self.ws_url).expect("ws_url is validated at config load"),
            )
            .await
            {
                Ok((ws_stream, _)) => {
                    info!("reference_feed: connected");
                    retry_delay = Duration::from_millis(500);

                    let (mut write, mut read) = ws_stream.split();
                    self.subscribe(&mut write, &reference_symbols).await;

                    loop {
                        let next = tokio::time::timeout(RECEIVE_IDLE_TIMEOUT, read.next()).await;
                        match next {
                            Ok(Some(Ok(Message::Text(text)))) => self.handle_message(&text),
                            Ok(Some(Ok(Message::Ping(data)))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Ok(Some(Ok(Message::Close(_)))) => {
                                warn!("reference_feed: server closed connection");
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                error!("reference_feed: ws error: {e}");
                                break;
                            }
                            Ok(None) => {
                                warn!("reference_feed: stream ended");
                                break;
                            }
                            Err(_) => {
                                warn!("reference_feed: no message for {RECEIVE_IDLE_TIMEOUT:?}, forcing reconnect");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("reference_feed: connect failed: {e}");
                }
            }

            tokio::time::sleep(retry_delay).await;
            retry_delay = std::cmp::min(retry_delay * 2, RECONNECT_CAP);
        }
    }

    async fn subscribe<S>(&self, write: &mut S, reference_symbols: &[String])
    where
        S: SinkExt<Message> + Unpin,
    {
        let suffix = if self.use_1s_stream { "@markPrice@1s" } else { "@markPrice" };
        let params: Vec<String> = reference_symbols
            .iter()
            .map(|s| format!("{}{}", s.to_lowercase(), suffix))
            .collect();
        let frame = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        });
        let _ = write.send(Message::Text(frame.to_string())).await;
    }

    fn handle_message(&self, text: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let symbol = match parsed["s"].as_str() {
            Some(s) => s.to_string(),
            None => return,
        };
        let price: f64 = match parsed["p"].as_str().and_then(|s| s.parse().ok()) {
            Some(p) => p,
            None => return,
        };

        let mut history = self.history.lock().unwrap();
        let samples = history.entry(symbol).or_insert_with(VecDeque::new);
        let now = Instant::now();
        samples.push_back(Sample { at: now, price });
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > HISTORY_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn feed_with_map() -> ReferenceFeed {
        let mut map = StdHashMap::new();
        map.insert("BTC-USD".to_string(), "BTCUSDT".to_string());
        ReferenceFeed::new("wss://example.invalid/ws".to_string(), true, SymbolMap(map))
    }

    #[test]
    fn change_bps_is_zero_with_no_samples() {
        let feed = feed_with_map();
        assert_eq!(feed.change_bps("BTC-USD", 0.5), 0.0);
    }

    #[test]
    fn change_bps_is_zero_for_unmapped_symbol() {
        let feed = feed_with_map();
        assert_eq!(feed.change_bps("ETH-USD", 0.5), 0.0);
    }

    #[test]
    fn change_bps_computes_signed_change_within_window() {
        let feed = feed_with_map();
        feed.handle_message(r#"{"s":"BTCUSDT","p":"50000.0"}"#);
        feed.handle_message(r#"{"s":"BTCUSDT","p":"50020.0"}"#);
        let change = feed.change_bps("BTC-USD", 5.0);
        assert!((change - 4.0).abs() < 1e-6);
    }
}
