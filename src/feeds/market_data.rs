use crate::errors::{EngineError, EngineResult};
use crate::interfaces::{ConnectivityCheck, MarketDataProvider, MarketIndicators};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

// Quote service response shapes:
//
// GET /history?symbol=SPY&days=21     {"symbol": "SPY", "closes": [512.3, 514.0, ...]}
// GET /quote?symbol=SPY               {"symbol": "SPY", "last": 515.2}
// GET /change?symbol=SPY&minutes=5    {"symbol": "SPY", "change_pct": -0.42}
// GET /indicators                     {"vix": 17.8, "spy_change_pct": -0.3}

#[derive(serde::Deserialize)]
struct HistoryResponse {
    closes: Option<Vec<f64>>,
}

#[derive(serde::Deserialize)]
struct QuoteResponse {
    last: Option<f64>,
}

#[derive(serde::Deserialize)]
struct ChangeResponse {
    change_pct: Option<f64>,
}

fn client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// REST client for a JSON quote service. Transport failures surface as
/// `Network`/`Timeout` so the loop can route them to network recovery;
/// bad payloads surface as `MarketData`.
#[derive(Clone)]
pub struct HttpMarketData {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpMarketData {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: client(5),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> EngineResult<T> {
        let url = format!("{}/{path}", self.base_url);
        let mut req = self.client.get(&url).query(query);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::MarketData(format!("{path}: HTTP {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| EngineError::Parse(format!("{path}: {e}")))
    }
}

fn finite(value: Option<f64>, what: &str, ticker: &str) -> EngineResult<f64> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        other => Err(EngineError::MarketData(format!("{ticker}: invalid {what}: {other:?}"))),
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for HttpMarketData {
    async fn get_price_history(&self, ticker: &str, days: usize) -> EngineResult<Vec<f64>> {
        let data: HistoryResponse = self
            .get_json("history", &[("symbol", ticker.to_string()), ("days", days.to_string())])
            .await?;
        let closes: Vec<f64> = data
            .closes
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.is_finite() && *c > 0.0)
            .collect();
        if closes.is_empty() {
            return Err(EngineError::MarketData(format!("{ticker}: empty price history")));
        }
        Ok(closes)
    }

    async fn get_last_price(&self, ticker: &str) -> EngineResult<f64> {
        let data: QuoteResponse = self.get_json("quote", &[("symbol", ticker.to_string())]).await?;
        let price = finite(data.last, "last price", ticker)?;
        if price <= 0.0 {
            return Err(EngineError::MarketData(format!("{ticker}: non-positive price {price}")));
        }
        Ok(price)
    }

    async fn get_recent_change_pct(&self, ticker: &str, minutes: i64) -> EngineResult<f64> {
        let data: ChangeResponse = self
            .get_json("change", &[("symbol", ticker.to_string()), ("minutes", minutes.to_string())])
            .await?;
        finite(data.change_pct, "change", ticker)
    }

    async fn get_market_indicators(&self) -> EngineResult<MarketIndicators> {
        let data: MarketIndicators = self.get_json("indicators", &[]).await?;
        Ok(MarketIndicators {
            vix: data.vix.filter(|v| v.is_finite()),
            spy_change_pct: data.spy_change_pct.filter(|v| v.is_finite()),
        })
    }
}

/// Stand-in when no quote service is configured. Every read fails as
/// missing data, which keeps the breaker degraded and buys blocked.
pub struct Unconfigured;

#[async_trait::async_trait]
impl MarketDataProvider for Unconfigured {
    async fn get_price_history(&self, ticker: &str, _days: usize) -> EngineResult<Vec<f64>> {
        Err(EngineError::MarketData(format!("{ticker}: no market data source configured")))
    }

    async fn get_last_price(&self, ticker: &str) -> EngineResult<f64> {
        Err(EngineError::MarketData(format!("{ticker}: no market data source configured")))
    }

    async fn get_recent_change_pct(&self, ticker: &str, _minutes: i64) -> EngineResult<f64> {
        Err(EngineError::MarketData(format!("{ticker}: no market data source configured")))
    }

    async fn get_market_indicators(&self) -> EngineResult<MarketIndicators> {
        Ok(MarketIndicators::default())
    }
}

/// GET against a health URL; any 2xx counts as connected.
pub struct HttpHealthCheck {
    client: Client,
    url: Option<String>,
}

impl HttpHealthCheck {
    pub fn new(url: Option<String>) -> Self {
        Self { client: client(3), url }
    }
}

#[async_trait::async_trait]
impl ConnectivityCheck for HttpHealthCheck {
    async fn is_reachable(&self) -> bool {
        let Some(url) = &self.url else {
            // nothing to reach; treat as connected so recovery does not liquidate
            return true;
        };
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "connectivity check failed");
                false
            }
        }
    }
}
