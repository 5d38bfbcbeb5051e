// =============================================================================
// Warmup Loader - closed base candles preceding live start
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backfill::{page_windows, resolve_page, BackfillReport};
use crate::error::BackfillError;
use crate::exchanges::ExchangeAdapter;
use crate::market_data::{AliasResolver, Candle};
use crate::rest::KlineClient;
use crate::types::Timeframe;

/// What the runner does when a warmup fetch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupFailurePolicy {
    /// Do not start the subscription.
    #[default]
    Abort,
    /// Stream anyway; the first aggregates may be partial.
    ProceedWithout,
}

pub struct WarmupLoader {
    client: KlineClient,
    adapter: Arc<dyn ExchangeAdapter>,
    resolver: Arc<AliasResolver>,
}

impl WarmupLoader {
    pub fn new(client: KlineClient, adapter: Arc<dyn ExchangeAdapter>, resolver: Arc<AliasResolver>) -> Self {
        Self {
            client,
            adapter,
            resolver,
        }
    }

    /// The `horizon` closed base candles immediately before the current base
    /// window.
    pub async fn load(
        &self,
        symbol: &str,
        base: Timeframe,
        horizon: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>, BackfillError> {
        self.load_before(symbol, base, horizon, Utc::now().timestamp_millis(), cancel)
            .await
    }

    /// As [`load`](Self::load), with the live start given explicitly.
    pub async fn load_before(
        &self,
        symbol: &str,
        base: Timeframe,
        horizon: usize,
        live_start_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>, BackfillError> {
        if horizon == 0 {
            return Ok(Vec::new());
        }
        let symbol = symbol.trim().to_uppercase();
        let current_window = base.window_start(live_start_ms);
        let start_ms = current_window - horizon as i64 * base.duration_ms();
        let end_ms = current_window - 1;

        let mut candles: Vec<Candle> = Vec::with_capacity(horizon);
        let mut report = BackfillReport::default();
        for (page_start, page_end) in page_windows(start_ms, end_ms, base, self.adapter.page_limit()) {
            let rows = self
                .client
                .fetch_page_with_retry(self.adapter.as_ref(), &symbol, base, page_start, page_end, cancel)
                .await?;
            for candle in resolve_page(&self.resolver, self.adapter.as_ref(), &rows, page_start, page_end, &mut report) {
                if candles.last().is_some_and(|last| candle.open_time <= last.open_time) {
                    continue;
                }
                candles.push(candle);
            }
        }

        if report.skipped_open > 0 {
            debug!(symbol = %symbol, skipped = report.skipped_open, "in-progress candles left out of warmup");
        }
        info!(
            exchange = %self.adapter.id(),
            symbol = %symbol,
            timeframe = %base,
            requested = horizon,
            loaded = candles.len(),
            "warmup loaded"
        );
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::adapter_for;
    use crate::market_data::TimeframeAggregator;
    use crate::rest::test_support::spawn_http;
    use crate::rest::RateLimiterRegistry;
    use crate::types::{ExchangeId, MarketType};
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    const LIVE: i64 = 1_700_000_100_000 + 30_000; // inside a 5m window

    /// Serves closed 1m klines whose close price is the minute index.
    async fn klines(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        let start: i64 = q["startTime"].parse().unwrap();
        let end: i64 = q["endTime"].parse().unwrap();
        let rows: Vec<Value> = (0..)
            .map(|i| start + i * 60_000)
            .take_while(|t| *t <= end)
            .map(|t| {
                let px = ((t / 60_000) % 1000) as f64;
                json!([t, px.to_string(), (px + 1.0).to_string(), (px - 1.0).to_string(), px.to_string(), "1", t + 59_999, "1", 1])
            })
            .collect();
        Json(Value::Array(rows))
    }

    async fn loader() -> WarmupLoader {
        let base = spawn_http(Router::new().route("/api/v3/klines", get(klines))).await;
        let client = KlineClient::new(Arc::new(RateLimiterRegistry::new()))
            .unwrap()
            .with_base_override(base);
        WarmupLoader::new(
            client,
            adapter_for(ExchangeId::Binance, MarketType::Spot),
            Arc::new(AliasResolver::standard().unwrap()),
        )
    }

    #[tokio::test]
    async fn loads_closed_candles_right_before_live_window() {
        let loader = loader().await;
        let candles = loader
            .load_before("btcusdt", Timeframe::M1, 4, LIVE, &CancellationToken::new())
            .await
            .unwrap();

        let live_window = Timeframe::M1.window_start(LIVE);
        assert_eq!(candles.len(), 4);
        assert!(candles.iter().all(|c| c.is_closed && c.symbol == "BTCUSDT"));
        assert_eq!(candles.last().map(|c| c.close_time), Some(live_window));
        assert_eq!(candles[0].open_time, live_window - 4 * 60_000);
    }

    #[tokio::test]
    async fn warmup_then_one_live_candle_completes_aggregate() {
        // live start sits on the 5th minute of a 5m window
        let window_5m = Timeframe::M5.window_start(LIVE);
        let live_start = window_5m + 4 * 60_000 + 1_000;
        let loader = loader().await;
        let mut agg = TimeframeAggregator::new(Timeframe::M1, &[Timeframe::M5]).unwrap();
        let warm = loader
            .load_before("BTCUSDT", Timeframe::M1, agg.warmup_horizon() - 1, live_start, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(warm.len(), 4);
        assert!(agg.seed("BTCUSDT", &warm).is_empty());

        let mut live = warm[3].clone();
        live.open_time += 60_000;
        live.close_time += 60_000;
        let out = agg.push(&live);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time, window_5m);
        assert_eq!(agg.partial_emitted(), 0);
    }

    #[tokio::test]
    async fn zero_horizon_skips_the_network() {
        let loader = WarmupLoader::new(
            KlineClient::new(Arc::new(RateLimiterRegistry::new())).unwrap(),
            adapter_for(ExchangeId::Okx, MarketType::Spot),
            Arc::new(AliasResolver::standard().unwrap()),
        );
        let out = loader
            .load("BTC-USDT", Timeframe::M1, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
