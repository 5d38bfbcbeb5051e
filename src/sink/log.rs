use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{default_conflict_keys, Sink};
use crate::market_data::Candle;

/// Writes one structured log line per candle.
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
    conflict_keys: Option<Vec<String>>,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conflict_keys: None,
        }
    }

    pub fn with_conflict_keys(mut self, keys: Vec<String>) -> Self {
        self.conflict_keys = Some(keys);
        self
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn conflict_keys(&self) -> Vec<String> {
        self.conflict_keys.clone().unwrap_or_else(default_conflict_keys)
    }

    async fn emit(&self, candle: &Candle) -> Result<()> {
        info!(
            sink = %self.name,
            key = %candle.key(),
            open_time = candle.open_time,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            closed = candle.is_closed,
            "candle"
        );
        Ok(())
    }

    async fn emit_bulk(&self, candles: &[Candle]) -> Result<()> {
        if let (Some(first), Some(last)) = (candles.first(), candles.last()) {
            info!(
                sink = %self.name,
                key = %first.key(),
                count = candles.len(),
                from = first.open_time,
                to = last.open_time,
                "candle batch"
            );
        }
        Ok(())
    }
}
