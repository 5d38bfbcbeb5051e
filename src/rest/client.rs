// =============================================================================
// Kline REST client - rate-limited history pages for any adapter
// =============================================================================
//
// The adapter builds the request and decodes the body; this client owns the
// HTTP connection pool, the shared rate limiter and the status-code policy:
//   - 429 / exchange rate-limit body -> pause the pool and retry the same page
//   - 418 / 403                      -> banned, surfaced immediately
//   - 5xx / timeouts                 -> bounded retries with backoff
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::rate_limit::{RateLimiterRegistry, WeightTracker};
use crate::error::BackfillError;
use crate::exchanges::ExchangeAdapter;
use crate::market_data::RawFields;
use crate::types::{ExchangeId, MarketType, Timeframe};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Request weight of one Binance klines call (limit <= 1000).
const BINANCE_KLINES_WEIGHT: u32 = 2;

/// How the client reacts to throttling and transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Pause applied after a 429 without a usable `Retry-After`.
    pub rate_limit_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            rate_limit_pause: Duration::from_secs(60),
        }
    }
}

/// Shared REST client for historical klines.
#[derive(Clone)]
pub struct KlineClient {
    http: reqwest::Client,
    limiters: Arc<RateLimiterRegistry>,
    weights: Arc<RwLock<HashMap<String, Arc<WeightTracker>>>>,
    policy: RetryPolicy,
    base_override: Option<String>,
}

impl KlineClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(limiters: Arc<RateLimiterRegistry>) -> Result<Self, BackfillError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        debug!("KlineClient initialised");
        Ok(Self {
            http,
            limiters,
            weights: Arc::new(RwLock::new(HashMap::new())),
            policy: RetryPolicy::default(),
            base_override: None,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send every request to `base` instead of the adapter's REST host.
    pub fn with_base_override(mut self, base: impl Into<String>) -> Self {
        self.base_override = Some(base.into());
        self
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    fn weight_tracker(&self, adapter: &dyn ExchangeAdapter) -> Option<Arc<WeightTracker>> {
        if adapter.id() != ExchangeId::Binance {
            return None;
        }
        let key = adapter.rate_pool();
        if let Some(t) = self.weights.read().get(&key) {
            return Some(t.clone());
        }
        let hard_limit = match adapter.market() {
            MarketType::Spot => 5000,
            MarketType::Linear | MarketType::Inverse => 2000,
        };
        Some(
            self.weights
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(WeightTracker::new(hard_limit)))
                .clone(),
        )
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// One page of candles with open time in `[start_ms, end_ms]`, no retries.
    #[instrument(skip(self, adapter), fields(exchange = %adapter.id()), name = "rest::fetch_page")]
    pub async fn fetch_page(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<RawFields>, BackfillError> {
        self.limiters.acquire(adapter).await;

        let req = adapter.klines_request(symbol, timeframe, start_ms, end_ms, adapter.page_limit());
        let url = match &self.base_override {
            Some(base) => req.url.replacen(origin(&req.url), base, 1),
            None => req.url,
        };

        let resp = self.http.get(&url).query(&req.query).send().await?;
        let status = resp.status();
        let exchange = adapter.id().to_string();

        if let Some(tracker) = self.weight_tracker(adapter) {
            tracker.update_from_headers(resp.headers());
            if !tracker.can_send_request(BINANCE_KLINES_WEIGHT) {
                let now = Utc::now().timestamp_millis();
                let to_next_minute = 60_000 - now.rem_euclid(60_000);
                self.limiters
                    .pause(adapter, Duration::from_millis(to_next_minute as u64));
                tracker.reset_1m_weight();
            }
        }

        match status.as_u16() {
            429 => {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(BackfillError::RateLimited {
                    exchange,
                    retry_after,
                });
            }
            418 | 403 => {
                return Err(BackfillError::Banned {
                    exchange,
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        let text = resp.text().await?;
        if !status.is_success() {
            return Err(BackfillError::Status {
                exchange,
                status: status.as_u16(),
                body: text,
            });
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| BackfillError::Decode(format!("{exchange} klines body: {e}")))?;

        let rows = adapter.parse_klines(symbol, timeframe, &body, Utc::now().timestamp_millis())?;
        debug!(symbol, timeframe = %timeframe, start_ms, end_ms, count = rows.len(), "klines page fetched");
        Ok(rows)
    }

    /// [`fetch_page`](Self::fetch_page) with the throttling and retry policy
    /// applied. Rate-limit responses are retried without limit; transient
    /// failures up to `max_retries` times.
    pub async fn fetch_page_with_retry(
        &self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawFields>, BackfillError> {
        let mut transient_failures: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BackfillError::Cancelled);
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
                r = self.fetch_page(adapter, symbol, timeframe, start_ms, end_ms) => r,
            };

            let delay = match result {
                Ok(rows) => return Ok(rows),
                Err(BackfillError::RateLimited { retry_after, .. }) => {
                    let pause = retry_after.unwrap_or(self.policy.rate_limit_pause);
                    self.limiters.pause(adapter, pause);
                    pause
                }
                Err(e) if e.is_retryable() && transient_failures < self.policy.max_retries => {
                    transient_failures += 1;
                    let exponent = (transient_failures - 1).min(10);
                    let delay = self.policy.initial_backoff.saturating_mul(1_u32 << exponent);
                    warn!(
                        exchange = %adapter.id(),
                        symbol,
                        attempt = transient_failures,
                        error = %e,
                        "klines request failed; retrying"
                    );
                    delay
                }
                Err(e) => return Err(e),
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Scheme and authority of `url` ("https://api.binance.com").
fn origin(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    match url[after_scheme..].find('/') {
        Some(j) => &url[..after_scheme + j],
        None => url,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::adapter_for;
    use crate::rest::test_support::spawn_http;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(5),
            rate_limit_pause: Duration::from_millis(5),
        }
    }

    async fn flaky_klines(State(calls): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        let mut headers = HeaderMap::new();
        match n {
            0 => {
                headers.insert("Retry-After", "0".parse().unwrap());
                (StatusCode::TOO_MANY_REQUESTS, headers, Json(json!({"code": -1003}))).into_response()
            }
            1 => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))).into_response(),
            _ => {
                headers.insert("X-MBX-USED-WEIGHT-1M", "12".parse().unwrap());
                (
                    StatusCode::OK,
                    headers,
                    Json(json!([[1_700_000_040_000_i64, "1", "2", "0.5", "1.5", "10", 1_700_000_099_999_i64, "15", 3]])),
                )
                    .into_response()
            }
        }
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(origin("https://api.binance.com/api/v3/klines"), "https://api.binance.com");
        assert_eq!(origin("http://127.0.0.1:8080"), "http://127.0.0.1:8080");
    }

    #[tokio::test]
    async fn retries_through_throttle_and_server_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/v3/klines", get(flaky_klines))
            .with_state(calls.clone());
        let base = spawn_http(app).await;

        let client = KlineClient::new(Arc::new(RateLimiterRegistry::new()))
            .unwrap()
            .with_policy(fast_policy())
            .with_base_override(base);
        let adapter = adapter_for(ExchangeId::Binance, MarketType::Spot);

        let rows = client
            .fetch_page_with_retry(
                adapter.as_ref(),
                "BTCUSDT",
                Timeframe::M1,
                1_700_000_040_000,
                1_700_000_099_999,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ban_status_is_not_retried() {
        let app = Router::new().route(
            "/api/v3/klines",
            get(|| async { (StatusCode::IM_A_TEAPOT, "banned") }),
        );
        let base = spawn_http(app).await;
        let client = KlineClient::new(Arc::new(RateLimiterRegistry::new()))
            .unwrap()
            .with_policy(fast_policy())
            .with_base_override(base);
        let adapter = adapter_for(ExchangeId::Binance, MarketType::Spot);

        let err = client
            .fetch_page_with_retry(adapter.as_ref(), "BTCUSDT", Timeframe::M1, 0, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackfillError::Banned { status: 418, .. }));
    }
}
