// =============================================================================
// Status API - Axum 0.7
// =============================================================================
//
// Read-only endpoints under `/api/v1/`. CORS is permissive; the API exposes
// feed health only and never changes pipeline state.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::monitor::FeedMonitor;
use crate::sink::SinkRegistry;

/// Shared handles the handlers read from.
#[derive(Clone)]
pub struct ApiState {
    pub monitor: Arc<FeedMonitor>,
    pub registry: Arc<SinkRegistry>,
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/feeds", get(feeds))
        .route("/api/v1/sinks", get(sinks))
        .layer(cors)
        .with_state(state)
}

/// Serve the router on `bind_addr` until `cancel` fires.
pub async fn serve(bind_addr: &str, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind status API on {bind_addr}"))?;
    info!(addr = %bind_addr, "status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("status API failed")?;
    info!("status API stopped");
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    feeds: usize,
    sinks: usize,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.monitor.build_snapshot();
    Json(HealthResponse {
        status: "ok",
        state_version: snapshot.state_version,
        server_time: snapshot.server_time,
        feeds: snapshot.feeds.len(),
        sinks: state.registry.len(),
    })
}

async fn feeds(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.monitor.build_snapshot())
}

async fn sinks(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::rest::test_support::spawn_http;
    use crate::sink::LogSink;
    use crate::types::Timeframe;
    use serde_json::Value;

    fn state() -> ApiState {
        let registry = Arc::new(SinkRegistry::default());
        registry.register(Arc::new(LogSink::default()));
        ApiState {
            monitor: Arc::new(FeedMonitor::new()),
            registry,
        }
    }

    async fn get_json(base: &str, path: &str) -> Value {
        reqwest::get(format!("{base}{path}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn endpoints_report_feeds_and_sinks() {
        let state = state();
        state.monitor.record_candle(&Candle {
            source: "binance".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_time: 0,
            close_time: 60_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            quote_volume: None,
            trade_count: 0,
            is_closed: true,
        });
        let base = spawn_http(router(state)).await;

        let health = get_json(&base, "/api/v1/health").await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["feeds"], 1);
        assert_eq!(health["sinks"], 1);

        let feeds = get_json(&base, "/api/v1/feeds").await;
        assert_eq!(feeds["feeds"][0]["key"], "binance:BTCUSDT@1m");
        assert!(feeds["feeds"][0]["seconds_since_last"].as_f64().is_some());

        let sinks = get_json(&base, "/api/v1/sinks").await;
        assert_eq!(sinks[0]["name"], "log");
        assert_eq!(sinks[0]["delivered"], 0);
    }
}
