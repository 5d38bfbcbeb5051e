// =============================================================================
// StreamForge - Main Entry Point
// =============================================================================

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use streamforge::api::{self, ApiState};
use streamforge::monitor::FeedMonitor;
use streamforge::runner::{build_sinks, Runner};
use streamforge::runtime_config::RuntimeConfig;
use streamforge::sink::SinkRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("StreamForge starting up");

    let config_path = RuntimeConfig::default_path();
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path.display(), "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();

    for (sub, result) in config.subscriptions.iter().zip(config.validate_subscriptions()) {
        if let Err(e) = result {
            warn!(exchange = %sub.exchange, market = %sub.market_type, error = %e, "subscription will be skipped");
        }
    }

    // ── 2. Shared state ──────────────────────────────────────────────────
    let registry = Arc::new(SinkRegistry::new(config.emit_timeout()));
    for sink in build_sinks(&config.sinks) {
        registry.register(sink);
    }
    let monitor = Arc::new(FeedMonitor::new());
    let cancel = CancellationToken::new();

    // ── 3. Status API ────────────────────────────────────────────────────
    let api_task = if config.api_enabled {
        let state = ApiState {
            monitor: monitor.clone(),
            registry: registry.clone(),
        };
        let bind_addr = config.bind_addr.clone();
        let api_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&bind_addr, state, api_cancel).await {
                error!(error = ?e, "status API terminated");
            }
        }))
    } else {
        None
    };

    // ── 4. Feeds & backfill ──────────────────────────────────────────────
    let runner = Runner::new(config, registry, monitor)?;
    let run_cancel = cancel.clone();
    let mut run_task = tokio::spawn(runner.run(run_cancel));

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            warn!("Shutdown signal received - stopping gracefully");
            None
        }
        finished = &mut run_task => Some(finished),
    };
    cancel.cancel();
    let finished = match finished {
        Some(finished) => finished,
        None => run_task.await,
    };
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = ?e, "runner failed"),
        Err(e) => error!(error = %e, "runner task panicked"),
    }

    if let Some(task) = api_task {
        let _ = task.await;
    }

    info!("StreamForge shut down complete.");
    Ok(())
}
