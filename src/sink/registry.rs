// =============================================================================
// Sink registry - concurrent fan-out with per-sink isolation
// =============================================================================
//
// Emission works on an immutable snapshot of the registered sinks, so a
// `register` during delivery only affects the next emission. Each sink call is
// bounded by `emit_timeout`; one slow or failing sink never blocks or fails the
// others. A sink that panics is counted as failed like any other error.
// =============================================================================

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use super::Sink;
use crate::error::SinkError;
use crate::market_data::Candle;

pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(5);

struct Registration {
    sink: Arc<dyn Sink>,
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl Registration {
    fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    fn record_failure(&self, err: &SinkError) {
        match err {
            SinkError::Timeout { .. } => self.timed_out.fetch_add(1, Ordering::Relaxed),
            SinkError::Failed { .. } => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        *self.last_error.write() = Some(err.to_string());
    }
}

/// Outcome of one fan-out, counted in sinks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Per-sink delivery counters.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStats {
    pub name: String,
    /// Candles accepted by the sink.
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub last_error: Option<String>,
    pub conflict_keys: Vec<String>,
}

pub struct SinkRegistry {
    sinks: RwLock<Arc<Vec<Arc<Registration>>>>,
    emit_timeout: Duration,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EMIT_TIMEOUT)
    }
}

impl SinkRegistry {
    pub fn new(emit_timeout: Duration) -> Self {
        Self {
            sinks: RwLock::new(Arc::new(Vec::new())),
            emit_timeout,
        }
    }

    pub fn register(&self, sink: Arc<dyn Sink>) {
        let mut guard = self.sinks.write();
        let mut next: Vec<_> = guard.iter().cloned().collect();
        info!(sink = %sink.name(), conflict_keys = ?sink.conflict_keys(), "sink registered");
        next.push(Arc::new(Registration::new(sink)));
        *guard = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Registration>>> {
        self.sinks.read().clone()
    }

    /// Connect every sink. Failures are logged and counted, not fatal.
    pub async fn connect_all(&self) -> EmitReport {
        let sinks = self.snapshot();
        let outcomes = join_all(sinks.iter().map(|reg| async move {
            match isolated(reg.sink.connect()).await {
                Ok(()) => true,
                Err(source) => {
                    let err = SinkError::Failed {
                        sink: reg.sink.name().to_string(),
                        source,
                    };
                    warn!(error = %err, "sink connect failed");
                    reg.record_failure(&err);
                    false
                }
            }
        }))
        .await;
        tally(&outcomes)
    }

    /// Deliver one candle to every sink concurrently.
    pub async fn emit(&self, candle: &Candle) -> EmitReport {
        let sinks = self.snapshot();
        let timeout = self.emit_timeout;
        let outcomes = join_all(sinks.iter().map(|reg| async move {
            let result = tokio::time::timeout(timeout, isolated(reg.sink.emit(candle))).await;
            settle(reg, result, 1, timeout)
        }))
        .await;
        tally(&outcomes)
    }

    /// Deliver a batch to every sink concurrently; each sink gets the whole
    /// batch in one `emit_bulk` call.
    pub async fn emit_bulk(&self, candles: &[Candle]) -> EmitReport {
        if candles.is_empty() {
            return EmitReport::default();
        }
        let sinks = self.snapshot();
        let timeout = self.emit_timeout;
        let outcomes = join_all(sinks.iter().map(|reg| async move {
            let result = tokio::time::timeout(timeout, isolated(reg.sink.emit_bulk(candles))).await;
            settle(reg, result, candles.len() as u64, timeout)
        }))
        .await;
        tally(&outcomes)
    }

    /// Close every sink, giving each at most `grace`.
    pub async fn close(&self, grace: Duration) {
        let sinks = self.snapshot();
        join_all(sinks.iter().map(|reg| async move {
            let name = reg.sink.name().to_string();
            match tokio::time::timeout(grace, isolated(reg.sink.close())).await {
                Ok(Ok(())) => info!(sink = %name, "sink closed"),
                Ok(Err(e)) => warn!(sink = %name, error = %e, "sink close failed"),
                Err(_) => warn!(sink = %name, grace_ms = grace.as_millis() as u64, "sink close timed out"),
            }
        }))
        .await;
    }

    pub fn stats(&self) -> Vec<SinkStats> {
        self.snapshot()
            .iter()
            .map(|reg| SinkStats {
                name: reg.sink.name().to_string(),
                delivered: reg.delivered.load(Ordering::Relaxed),
                failed: reg.failed.load(Ordering::Relaxed),
                timed_out: reg.timed_out.load(Ordering::Relaxed),
                last_error: reg.last_error.read().clone(),
                conflict_keys: reg.sink.conflict_keys(),
            })
            .collect()
    }
}

/// Run one sink call, turning a panic into an error.
async fn isolated<F>(call: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("sink panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn settle(
    reg: &Registration,
    result: Result<anyhow::Result<()>, tokio::time::error::Elapsed>,
    count: u64,
    timeout: Duration,
) -> bool {
    let sink = reg.sink.name().to_string();
    let err = match result {
        Ok(Ok(())) => {
            reg.delivered.fetch_add(count, Ordering::Relaxed);
            return true;
        }
        Ok(Err(source)) => SinkError::Failed { sink, source },
        Err(_) => SinkError::Timeout {
            sink,
            timeout_ms: timeout.as_millis() as u64,
        },
    };
    warn!(error = %err, candles = count, "sink delivery failed");
    reg.record_failure(&err);
    false
}

fn tally(outcomes: &[bool]) -> EmitReport {
    let delivered = outcomes.iter().filter(|ok| **ok).count();
    EmitReport {
        delivered,
        failed: outcomes.len() - delivered,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
