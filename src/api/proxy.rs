use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{DriverError, ExchangeDriver, OrderRef};
use crate::models::{ActiveOrder, Candle, OrderAck, PositionInfo, Side};

const RATE_LIMIT_RPS: u32 = 10;
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Chase orders block on the proxy until filled
const CHASE_TIMEOUT_SECS: u64 = 600;

type ProxyRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Response envelope of the order-routing proxy
#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyCandle {
    /// Open time, epoch milliseconds
    start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

impl ProxyCandle {
    fn into_candle(self) -> Result<Candle, DriverError> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.start)
            .ok_or_else(|| DriverError::Decode(format!("bad candle timestamp {}", self.start)))?;
        Ok(Candle {
            timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        })
    }
}

/// Client for the order-routing proxy
///
/// Every operation is a `POST {base}/execute` with `{"method", "params"}`.
/// The proxy answers `{"ok": true, "result": ...}` or
/// `{"ok": false, "error": "...", "code": "not_found"}`.
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct ProxyDriver {
    client: Client,
    base_url: String,
    rate_limiter: Arc<ProxyRateLimiter>,
    backoff_base: Duration,
}

impl ProxyDriver {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Base delay for retry backoff (doubled per attempt)
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        self.backoff_base * 2u32.pow(attempt - 1) + Duration::from_millis(jitter_ms)
    }

    /// Rate-limited proxy call with retry on 429, 5xx and network errors
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T, DriverError> {
        let url = format!("{}/execute", self.base_url);
        let body = json!({ "method": method, "params": params });

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.post(&url).json(&body).timeout(timeout).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 429 || status.is_server_error() {
                        if attempt == MAX_RETRIES {
                            return Err(DriverError::Unavailable(format!(
                                "{} returned {} after {} attempts",
                                method, status, MAX_RETRIES
                            )));
                        }
                        let delay = self.backoff(attempt);
                        tracing::warn!(
                            "Proxy returned {} for {}, retrying in {:?} (attempt {}/{})",
                            status,
                            method,
                            delay,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(DriverError::Rejected(format!(
                            "{} ({}): {}",
                            method, status, error_text
                        )));
                    }

                    let envelope: Envelope = response
                        .json()
                        .await
                        .map_err(|e| DriverError::Decode(format!("{}: {}", method, e)))?;
                    return Self::unwrap_envelope(method, envelope);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "Network error calling {}: {}, retrying in {:?} (attempt {}/{})",
                        method,
                        e,
                        delay,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(DriverError::Transport(e)),
            }
        }

        Err(DriverError::Unavailable(format!(
            "{} failed after {} retries",
            method, MAX_RETRIES
        )))
    }

    fn unwrap_envelope<T: DeserializeOwned>(
        method: &str,
        envelope: Envelope,
    ) -> Result<T, DriverError> {
        if !envelope.ok {
            let message = envelope
                .error
                .unwrap_or_else(|| format!("{} failed", method));
            return match envelope.code.as_deref() {
                Some("not_found") => Err(DriverError::NotFound(message)),
                Some("missing_data") => Err(DriverError::MissingData(message)),
                _ => Err(DriverError::Rejected(message)),
            };
        }

        if envelope.result.is_null() {
            // Option results decode to None, anything else is missing data
            return serde_json::from_value(Value::Null).map_err(|_| {
                DriverError::MissingData(format!("{} returned no result", method))
            });
        }

        serde_json::from_value(envelope.result)
            .map_err(|e| DriverError::Decode(format!("{}: {}", method, e)))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, DriverError> {
        self.call(method, params, Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .await
    }
}

#[async_trait]
impl ExchangeDriver for ProxyDriver {
    async fn get_last_price(&self, symbol: &str) -> Result<f64, DriverError> {
        self.request("get_last_price", json!({ "symbol": symbol }))
            .await
    }

    async fn get_position(&self, symbol: &str, side: Side) -> Result<PositionInfo, DriverError> {
        self.request(
            "get_position",
            json!({ "symbol": symbol, "position_idx": side.position_idx() }),
        )
        .await
    }

    async fn get_total_equity(&self) -> Result<f64, DriverError> {
        self.request("get_total_equity", json!({})).await
    }

    async fn get_valid_order_qty(&self, symbol: &str, fraction: f64) -> Result<f64, DriverError> {
        self.request(
            "get_valid_order_qty",
            json!({ "symbol": symbol, "fraction": fraction }),
        )
        .await
    }

    async fn round_order_qty(&self, symbol: &str, qty: f64) -> Result<f64, DriverError> {
        self.request("round_order_qty", json!({ "symbol": symbol, "qty": qty }))
            .await
    }

    async fn place_chase_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        position_idx: u8,
        max_distance_pct: f64,
    ) -> Result<OrderAck, DriverError> {
        self.call(
            "place_chase_order",
            json!({
                "symbol": symbol,
                "side": side.as_str(),
                "qty": qty,
                "position_idx": position_idx,
                "max_distance_pct": max_distance_pct,
            }),
            Duration::from_secs(CHASE_TIMEOUT_SECS),
        )
        .await
    }

    async fn get_filled_order_price(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<f64, DriverError> {
        let price: Option<f64> = self
            .request(
                "get_filled_order_price",
                json!({ "symbol": symbol, "order_id": order_id }),
            )
            .await?;
        price.ok_or_else(|| DriverError::MissingData(format!("no fill price for {}", order_id)))
    }

    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        position_idx: u8,
    ) -> Result<OrderAck, DriverError> {
        self.request(
            "place_market_order",
            json!({
                "symbol": symbol,
                "side": side.as_str(),
                "qty": qty,
                "position_idx": position_idx,
                "reduce_only": true,
            }),
        )
        .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        position_idx: u8,
        link_id: &str,
    ) -> Result<OrderAck, DriverError> {
        self.request(
            "place_limit_order",
            json!({
                "symbol": symbol,
                "side": side.as_str(),
                "qty": qty,
                "price": price,
                "position_idx": position_idx,
                "order_link_id": link_id,
                "reduce_only": true,
            }),
        )
        .await
    }

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<(), DriverError> {
        let params = match order {
            OrderRef::Id(id) => json!({ "symbol": symbol, "order_id": id }),
            OrderRef::LinkId(link) => json!({ "symbol": symbol, "order_link_id": link }),
        };
        let _: Value = self.request("cancel_order", params).await?;
        Ok(())
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
        position_idx: u8,
    ) -> Result<OrderAck, DriverError> {
        self.request(
            "place_stop_order",
            json!({
                "symbol": symbol,
                "side": side.as_str(),
                "qty": qty,
                "trigger_price": trigger_price,
                "position_idx": position_idx,
            }),
        )
        .await
    }

    async fn amend_stop_order(
        &self,
        symbol: &str,
        order_id: &str,
        trigger_price: f64,
    ) -> Result<OrderAck, DriverError> {
        self.request(
            "amend_order",
            json!({
                "symbol": symbol,
                "order_id": order_id,
                "trigger_price": trigger_price,
            }),
        )
        .await
    }

    async fn find_active_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<ActiveOrder>, DriverError> {
        self.request(
            "find_active_order",
            json!({ "symbol": symbol, "order_id": order_id }),
        )
        .await
    }

    async fn get_price_increment(&self, symbol: &str) -> Result<f64, DriverError> {
        self.request("get_price_increment", json!({ "symbol": symbol }))
            .await
    }

    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: u32,
        limit: usize,
    ) -> Result<Vec<Candle>, DriverError> {
        let raw: Vec<ProxyCandle> = self
            .request(
                "get_candles",
                json!({ "symbol": symbol, "interval": timeframe, "limit": limit }),
            )
            .await?;

        let mut candles = raw
            .into_iter()
            .map(ProxyCandle::into_candle)
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}
