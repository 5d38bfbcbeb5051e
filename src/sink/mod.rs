// =============================================================================
// Output sinks
// =============================================================================
//
// A sink receives finalized candles. Delivery is at-least-once: a re-run or a
// reconnect may hand a sink a candle it has already stored, so persistent sinks
// should upsert on `conflict_keys`.
// =============================================================================

pub mod csv;
pub mod log;
pub mod registry;
pub mod transform;

use anyhow::Result;
use async_trait::async_trait;

use crate::market_data::Candle;

pub use self::csv::CsvSink;
pub use self::log::LogSink;
pub use registry::{EmitReport, SinkRegistry, SinkStats};
pub use transform::{candle_row, select_columns, ColumnSpec, Row, RowTransform};

/// Columns that identify one candle for idempotent writes.
pub const DEFAULT_CONFLICT_KEYS: &[&str] = &["source", "symbol", "timeframe", "open_time"];

pub fn default_conflict_keys() -> Vec<String> {
    DEFAULT_CONFLICT_KEYS.iter().map(|k| k.to_string()).collect()
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Advisory upsert key for sinks that persist.
    fn conflict_keys(&self) -> Vec<String> {
        default_conflict_keys()
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn emit(&self, candle: &Candle) -> Result<()>;

    async fn emit_bulk(&self, candles: &[Candle]) -> Result<()> {
        for candle in candles {
            self.emit(candle).await?;
        }
        Ok(())
    }

    /// Flush buffered output and release resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
