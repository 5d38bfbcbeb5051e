// =============================================================================
// Runner - wires subscriptions, backfill jobs and sinks together
// =============================================================================
//
// Per subscription:
//   adapter ─▶ AdapterSession ─▶ FeedPipeline ─┐
//                                              ├─▶ merge ─▶ fan-out ─▶ SinkRegistry
//   adapter ─▶ AdapterSession ─▶ FeedPipeline ─┘
//
// A subscription that fails validation or warmup (with the Abort policy) is
// skipped; the others keep running. The session subscribes before warmup runs
// so live updates queue in its channel while history loads; the aggregator
// drops whatever the two overlap on. Backfill jobs run alongside the live
// feeds and emit straight into the registry.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backfill::BackfillScheduler;
use crate::exchanges::{adapter_for, AdapterSession, Subscription};
use crate::market_data::{merge, AliasResolver, Candle};
use crate::monitor::FeedMonitor;
use crate::pipeline::FeedPipeline;
use crate::rest::{KlineClient, RateLimiterRegistry};
use crate::runtime_config::{RuntimeConfig, SinkConfig};
use crate::sink::{select_columns, CsvSink, LogSink, Sink, SinkRegistry};
use crate::warmup::{WarmupFailurePolicy, WarmupLoader};

/// Build the sinks named in the configuration.
pub fn build_sinks(configs: &[SinkConfig]) -> Vec<Arc<dyn Sink>> {
    configs
        .iter()
        .map(|cfg| -> Arc<dyn Sink> {
            match cfg {
                SinkConfig::Log { name, conflict_keys } => {
                    let mut sink = LogSink::new(name.clone());
                    if let Some(keys) = conflict_keys {
                        sink = sink.with_conflict_keys(keys.clone());
                    }
                    Arc::new(sink)
                }
                SinkConfig::Csv {
                    name,
                    path,
                    conflict_keys,
                    columns,
                } => {
                    let mut sink = CsvSink::new(name.clone(), path.clone());
                    if let Some(keys) = conflict_keys {
                        sink = sink.with_conflict_keys(keys.clone());
                    }
                    if let Some(columns) = columns {
                        sink = sink.with_transform(select_columns(columns.clone()));
                    }
                    Arc::new(sink)
                }
            }
        })
        .collect()
}

pub struct Runner {
    config: RuntimeConfig,
    registry: Arc<SinkRegistry>,
    monitor: Arc<FeedMonitor>,
    resolver: Arc<AliasResolver>,
    client: KlineClient,
    ws_url: Option<String>,
}

impl Runner {
    pub fn new(config: RuntimeConfig, registry: Arc<SinkRegistry>, monitor: Arc<FeedMonitor>) -> Result<Self> {
        config.validate().context("invalid runtime configuration")?;
        let resolver = Arc::new(AliasResolver::standard().context("building alias table")?);
        let client = KlineClient::new(Arc::new(RateLimiterRegistry::new()))
            .context("building REST client")?;
        Ok(Self {
            config,
            registry,
            monitor,
            resolver,
            client,
            ws_url: None,
        })
    }

    /// Use `client` for warmup and backfill instead of the default one.
    pub fn with_client(mut self, client: KlineClient) -> Self {
        self.client = client;
        self
    }

    /// Stream every subscription from `url` instead of the exchange endpoint
    /// (local relays, tests).
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Run until `cancel` fires or every feed and job has finished, then close
    /// the sinks.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let connect = self.registry.connect_all().await;
        if connect.failed > 0 {
            warn!(failed = connect.failed, "some sinks failed to connect");
        }

        let mut outputs = Vec::new();
        for sub in &self.config.subscriptions {
            match self.start_subscription(sub, &cancel).await {
                Ok(rx) => outputs.push(rx),
                Err(e) => error!(
                    exchange = %sub.exchange,
                    market = %sub.market_type,
                    error = ?e,
                    "subscription not started"
                ),
            }
        }

        let mut jobs = JoinSet::new();
        let scheduler = Arc::new(BackfillScheduler::new(self.client.clone(), self.resolver.clone()));
        for job in self.config.backfill.iter().cloned() {
            let scheduler = scheduler.clone();
            let registry = self.registry.clone();
            let cancel = cancel.clone();
            jobs.spawn(async move {
                match scheduler.run(&job, &registry, &cancel).await {
                    Ok(report) => info!(symbol = %job.symbol, report = ?report, "backfill job done"),
                    Err(e) => error!(symbol = %job.symbol, error = %e, "backfill job failed"),
                }
            });
        }

        if outputs.is_empty() && jobs.is_empty() {
            warn!("no feed or backfill job is running");
        }

        let merged = merge(outputs, self.config.channel_capacity);
        let delivered = fan_out(merged, self.registry.clone(), cancel.clone()).await;
        info!(delivered, "fan-out stopped");

        while jobs.join_next().await.is_some() {}
        self.registry.close(self.config.close_grace()).await;
        Ok(())
    }

    async fn start_subscription(
        &self,
        sub: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<Candle>> {
        let adapter = adapter_for(sub.exchange, sub.market_type);
        sub.validate_for(adapter.as_ref())?;

        let mut pipeline = FeedPipeline::new(
            sub,
            adapter.volume_mode(),
            self.resolver.clone(),
            self.monitor.clone(),
            self.config.pipeline_settings(),
        )?;

        let mut session = AdapterSession::new(adapter.clone(), self.config.session_config());
        if let Some(url) = &self.ws_url {
            session = session.with_url(url.clone());
        }
        let session_cancel = cancel.child_token();
        let events = session.start(session_cancel.clone(), sub).await?;

        let horizon = pipeline.warmup_horizon();
        if sub.warmup && horizon > 0 {
            let loader = WarmupLoader::new(self.client.clone(), adapter.clone(), self.resolver.clone());
            let symbols = sub.normalized_symbols();
            let loads = join_all(
                symbols
                    .iter()
                    .map(|sym| loader.load(sym, sub.base_timeframe, horizon, cancel)),
            )
            .await;
            for (symbol, loaded) in symbols.iter().zip(loads) {
                match loaded {
                    Ok(candles) => pipeline.seed(symbol, &candles),
                    Err(e) => match self.config.warmup_failure_policy {
                        WarmupFailurePolicy::Abort => {
                            session_cancel.cancel();
                            return Err(e).with_context(|| format!("warmup for {symbol} failed"));
                        }
                        WarmupFailurePolicy::ProceedWithout => {
                            warn!(symbol = %symbol, error = %e, "warmup failed; first aggregates may be partial");
                        }
                    },
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        tokio::spawn(pipeline.run(events, tx, cancel.clone()));
        Ok(rx)
    }
}

/// Deliver merged candles to the registry until the stream ends or `cancel`
/// fires. Returns the number of candles handed to the registry.
pub async fn fan_out(
    mut merged: mpsc::Receiver<Candle>,
    registry: Arc<SinkRegistry>,
    cancel: CancellationToken,
) -> u64 {
    let mut delivered = 0;
    loop {
        let candle = tokio::select! {
            _ = cancel.cancelled() => break,
            next = merged.recv() => match next {
                Some(c) => c,
                None => break,
            },
        };
        let report = registry.emit(&candle).await;
        if report.failed > 0 && report.delivered == 0 && !registry.is_empty() {
            warn!(key = %candle.key(), "candle reached no sink");
        }
        delivered += 1;
    }
    delivered
}
