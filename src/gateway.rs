use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{AgentError, AgentResult};
use crate::signing::{canonical_json, AuthHandle};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_DURATION: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrderResponse {
    pub exchange_order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSnapshot {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub filled_quantity: f64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceSnapshot {
    pub available_usd: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolPriceSnapshot {
    pub mark: f64,
    pub mid: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub index: f64,
    pub last: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepthBookSnapshot {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub price_decimals: u32,
    pub quantity_decimals: u32,
}

/// Typed, signed request/response client for the primary exchange. Mirrors
/// the teacher's `LiveExchange` shape (caching reads, plain `post_*` helpers)
/// but speaks the spec's endpoint set and auth scheme instead of Hyperliquid's.
pub struct ExchangeGateway {
    base_url: String,
    client: reqwest::Client,
    auth: AuthHandle,

    cached_balance: Option<(BalanceSnapshot, Instant)>,
    cached_positions: Option<(Vec<PositionSnapshot>, Instant)>,
    cached_open_orders: Option<(Vec<OrderSnapshot>, Instant)>,
}

impl ExchangeGateway {
    pub fn new(base_url: String, auth: AuthHandle) -> Self {
        ExchangeGateway {
            base_url,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            auth,
            cached_balance: None,
            cached_positions: None,
            cached_open_orders: None,
        }
    }

    async fn get_public(&self, path: &str, query: &[(&str, &str)]) -> AgentResult<serde_json::Value> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    /// Posts a signed private request. The canonical body is computed once
    /// and that exact string is what is transmitted — never re-serialized.
    async fn post_signed(&self, path: &str, body: serde_json::Value) -> AgentResult<serde_json::Value> {
        let canonical_body = canonical_json(&body);
        let headers = self.auth.sign_request(&body);

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", self.auth.authorization_header())
            .header("x-request-sign-version", headers.sign_version)
            .header("x-request-id", headers.request_id)
            .header("x-request-timestamp", headers.timestamp_ms)
            .header("x-request-signature", headers.signature_b64)
            .header("Content-Type", "application/json")
            .body(canonical_body)
            .send()
            .await?;
        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> AgentResult<serde_json::Value> {
        let status = resp.status();
        let text = resp.text().await?;

        if status.as_u16() == 429 {
            return Err(AgentError::Exchange {
                status: 429,
                body: text,
            });
        }
        if !status.is_success() {
            return Err(AgentError::Exchange {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| AgentError::Transport(e.to_string()))
    }

    pub async fn query_symbol_price(&self, symbol: &str) -> AgentResult<SymbolPriceSnapshot> {
        let data = self
            .get_public("/api/query_symbol_price", &[("symbol", symbol)])
            .await?;
        serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))
    }

    pub async fn query_orderbook(&self, symbol: &str) -> AgentResult<DepthBookSnapshot> {
        let data = self
            .get_public("/api/query_depth_book", &[("symbol", symbol)])
            .await?;
        serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))
    }

    pub async fn query_symbol_info(&self, symbol: &str) -> AgentResult<SymbolInfo> {
        let data = self
            .get_public("/api/query_symbol_info", &[("symbol", symbol)])
            .await?;
        serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))
    }

    pub async fn submit_order(&self, req: &NewOrderRequest) -> AgentResult<NewOrderResponse> {
        let body = serde_json::json!({
            "symbol": req.symbol,
            "side": req.side,
            "price": req.price,
            "quantity": req.quantity,
            "time_in_force": req.time_in_force,
            "reduce_only": req.reduce_only,
            "client_order_id": req.client_order_id,
        });
        let data = self.post_signed("/api/new_order", body).await?;
        serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))
    }

    /// Cancel by local id (preferred) or exchange id. 404 / "not found" is
    /// surfaced as `AgentError::NotFound` so the Order Manager can treat it
    /// as benign per §4.6.
    pub async fn cancel_order(
        &self,
        client_order_id: Option<&str>,
        exchange_order_id: Option<&str>,
    ) -> AgentResult<()> {
        let body = serde_json::json!({
            "client_order_id": client_order_id,
            "exchange_order_id": exchange_order_id,
        });
        match self.post_signed("/api/cancel_order", body).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign_not_found() => Err(AgentError::NotFound(
                client_order_id.unwrap_or_default().to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_batch(&self, client_order_ids: &[String]) -> AgentResult<()> {
        let body = serde_json::json!({ "client_order_ids": client_order_ids });
        self.post_signed("/api/cancel_orders", body).await?;
        Ok(())
    }

    pub async fn query_open_orders(&mut self, symbol: Option<&str>) -> AgentResult<Vec<OrderSnapshot>> {
        if let Some((orders, ts)) = &self.cached_open_orders {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(filter_by_symbol(orders, symbol));
            }
        }
        let body = serde_json::json!({});
        let data = self.post_signed("/api/query_open_orders", body).await?;
        let orders: Vec<OrderSnapshot> =
            serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))?;
        self.cached_open_orders = Some((orders.clone(), Instant::now()));
        Ok(filter_by_symbol(&orders, symbol))
    }

    pub async fn query_order(&self, client_order_id: &str) -> AgentResult<OrderSnapshot> {
        let body = serde_json::json!({ "client_order_id": client_order_id });
        match self.post_signed("/api/query_order", body).await {
            Ok(data) => serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string())),
            Err(e) if e.is_benign_not_found() => Err(AgentError::NotFound(client_order_id.to_string())),
            Err(e) => Err(e),
        }
    }

    pub async fn query_positions(&mut self) -> AgentResult<Vec<PositionSnapshot>> {
        if let Some((positions, ts)) = &self.cached_positions {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(positions.clone());
            }
        }
        let body = serde_json::json!({});
        let data = self.post_signed("/api/query_positions", body).await?;
        let positions: Vec<PositionSnapshot> =
            serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))?;
        self.cached_positions = Some((positions.clone(), Instant::now()));
        Ok(positions)
    }

    pub async fn query_balance(&mut self) -> AgentResult<BalanceSnapshot> {
        if let Some((balance, ts)) = &self.cached_balance {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(balance.clone());
            }
        }
        let body = serde_json::json!({});
        let data = self.post_signed("/api/query_balance", body).await?;
        let balance: BalanceSnapshot =
            serde_json::from_value(data).map_err(|e| AgentError::Transport(e.to_string()))?;
        self.cached_balance = Some((balance.clone(), Instant::now()));
        Ok(balance)
    }
}

fn filter_by_symbol(orders: &[OrderSnapshot], symbol: Option<&str>) -> Vec<OrderSnapshot> {
    match symbol {
        Some(s) => orders.iter().filter(|o| o.symbol == s).cloned().collect(),
        None => orders.to_vec(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolMap(pub HashMap<String, String>);

impl SymbolMap {
    pub fn to_reference(&self, primary_symbol: &str) -> Option<&str> {
        self.0.get(primary_symbol).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_is_involutive() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.opposite().opposite(), Side::Buy);
    }

    #[test]
    fn filter_by_symbol_keeps_only_matching() {
        let orders = vec![
            OrderSnapshot {
                client_order_id: "a".into(),
                exchange_order_id: "1".into(),
                symbol: "BTC-USD".into(),
                side: Side::Buy,
                price: 1.0,
                quantity: 1.0,
                filled_quantity: 0.0,
                status: "OPEN".into(),
            },
            OrderSnapshot {
                client_order_id: "b".into(),
                exchange_order_id: "2".into(),
                symbol: "ETH-USD".into(),
                side: Side::Sell,
                price: 1.0,
                quantity: 1.0,
                filled_quantity: 0.0,
                status: "OPEN".into(),
            },
        ];
        let filtered = filter_by_symbol(&orders, Some("BTC-USD"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].client_order_id, "a");
    }
}
