// =============================================================================
// Backfill Scheduler - historical candles over REST into the sink registry
// =============================================================================
//
// A job's range is cut into contiguous, non-overlapping page windows of
// `page_limit × timeframe`. Each page goes through the shared rate-limited
// client, is resolved with the same alias table as the live feed, de-duplicated
// by open time across page boundaries and emitted in `batch_size` chunks.
//
// Re-running a job over the same range yields the same candles, so sinks that
// upsert on the candle key end up with the same rows.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BackfillError, ConfigError};
use crate::exchanges::{adapter_for, ExchangeAdapter};
use crate::market_data::{AliasResolver, Candle, RawFields};
use crate::rest::KlineClient;
use crate::sink::SinkRegistry;
use crate::types::{ExchangeId, MarketType, Timeframe};

fn default_batch_size() -> usize {
    1000
}

/// One historical range to fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub exchange: ExchangeId,
    #[serde(default)]
    pub market_type: MarketType,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: DateTime<Utc>,
    /// Exclusive upper bound on open time. Defaults to now.
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Skip candles whose open time is at or before this value (ms).
    #[serde(default)]
    pub resume_after: Option<i64>,
}

impl BackfillJob {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ConfigError> {
        let to = self.to.unwrap_or(now);
        if self.from >= to {
            return Err(ConfigError::InvalidRange(format!(
                "{} {}: from {} is not before to {}",
                self.exchange, self.symbol, self.from, to
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols {
                exchange: self.exchange.to_string(),
            });
        }
        Ok(())
    }
}

/// Counters for one finished job.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub pages: u64,
    pub fetched: u64,
    pub emitted: u64,
    pub duplicates: u64,
    pub skipped_open: u64,
    pub invalid: u64,
    /// Sink deliveries that failed, counted per batch and sink.
    pub sink_failures: u64,
    pub last_open_time: Option<i64>,
}

/// Contiguous `[start, end]` page windows covering `[start_ms, end_ms]`, each
/// at most `limit` candles wide.
pub fn page_windows(start_ms: i64, end_ms: i64, timeframe: Timeframe, limit: u32) -> Vec<(i64, i64)> {
    let span = i64::from(limit.max(1)) * timeframe.duration_ms();
    let mut pages = Vec::new();
    let mut page_start = start_ms;
    while page_start <= end_ms {
        let page_end = (page_start + span - 1).min(end_ms);
        pages.push((page_start, page_end));
        page_start += span;
    }
    pages
}

/// Resolve one page, keeping closed candles inside `[start_ms, end_ms]` in
/// open-time order.
pub(crate) fn resolve_page(
    resolver: &AliasResolver,
    adapter: &dyn ExchangeAdapter,
    rows: &[RawFields],
    start_ms: i64,
    end_ms: i64,
    report: &mut BackfillReport,
) -> Vec<Candle> {
    let source = adapter.id().as_str();
    let mut candles = Vec::with_capacity(rows.len());
    for raw in rows {
        match resolver.resolve(raw, source) {
            Ok(c) if !c.is_closed => report.skipped_open += 1,
            Ok(c) if c.open_time < start_ms || c.open_time > end_ms => report.duplicates += 1,
            Ok(c) => candles.push(c),
            Err(e) => {
                report.invalid += 1;
                warn!(exchange = %adapter.id(), error = %e, "dropping unusable history row");
            }
        }
    }
    candles.sort_by_key(|c| c.open_time);
    candles
}

pub struct BackfillScheduler {
    client: KlineClient,
    resolver: Arc<AliasResolver>,
}

impl BackfillScheduler {
    pub fn new(client: KlineClient, resolver: Arc<AliasResolver>) -> Self {
        Self { client, resolver }
    }

    pub async fn run(
        &self,
        job: &BackfillJob,
        registry: &SinkRegistry,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, BackfillError> {
        let now = Utc::now();
        job.validate(now)?;
        let adapter = adapter_for(job.exchange, job.market_type);
        if !adapter.supports(job.timeframe) {
            return Err(ConfigError::UnsupportedTimeframe {
                exchange: job.exchange.to_string(),
                timeframe: job.timeframe.to_string(),
            }
            .into());
        }

        let tf = job.timeframe;
        let dur = tf.duration_ms();
        let symbol = job.symbol.trim().to_uppercase();

        // First window opening at or after `from`.
        let from_ms = job.from.timestamp_millis();
        let mut start_ms = tf.window_start(from_ms);
        if start_ms < from_ms {
            start_ms += dur;
        }
        if let Some(after) = job.resume_after {
            start_ms = start_ms.max(tf.window_start(after) + dur);
        }
        let end_ms = job.to.unwrap_or(now).timestamp_millis() - 1;

        let pages = page_windows(start_ms, end_ms, tf, adapter.page_limit());
        info!(
            exchange = %job.exchange,
            market = %job.market_type,
            symbol = %symbol,
            timeframe = %tf,
            start_ms,
            end_ms,
            pages = pages.len(),
            "backfill started"
        );

        let mut report = BackfillReport::default();
        let mut batch: Vec<Candle> = Vec::with_capacity(job.batch_size);
        for (page_start, page_end) in pages {
            let rows = self
                .client
                .fetch_page_with_retry(adapter.as_ref(), &symbol, tf, page_start, page_end, cancel)
                .await?;
            report.pages += 1;
            report.fetched += rows.len() as u64;

            let candles = resolve_page(&self.resolver, adapter.as_ref(), &rows, page_start, page_end, &mut report);
            for candle in candles {
                if report.last_open_time.is_some_and(|last| candle.open_time <= last) {
                    report.duplicates += 1;
                    continue;
                }
                report.last_open_time = Some(candle.open_time);
                batch.push(candle);
                if batch.len() >= job.batch_size {
                    self.flush(registry, &mut batch, &mut report).await;
                }
            }
            debug!(symbol = %symbol, page_start, page_end, rows = rows.len(), "backfill page done");
        }
        self.flush(registry, &mut batch, &mut report).await;

        info!(
            exchange = %job.exchange,
            symbol = %symbol,
            timeframe = %tf,
            pages = report.pages,
            emitted = report.emitted,
            duplicates = report.duplicates,
            "backfill finished"
        );
        Ok(report)
    }

    async fn flush(&self, registry: &SinkRegistry, batch: &mut Vec<Candle>, report: &mut BackfillReport) {
        if batch.is_empty() {
            return;
        }
        let emit = registry.emit_bulk(batch.as_slice()).await;
        report.emitted += batch.len() as u64;
        report.sink_failures += emit.failed as u64;
        batch.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
