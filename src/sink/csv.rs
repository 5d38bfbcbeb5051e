use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use serde_json::Value;

use super::transform::{Row, RowTransform};
use super::{default_conflict_keys, Sink};
use crate::market_data::Candle;

#[derive(Serialize)]
struct CsvRow<'a> {
    source: &'a str,
    symbol: &'a str,
    timeframe: &'a str,
    open_time: i64,
    close_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: Option<f64>,
    trade_count: u64,
    is_closed: bool,
}

impl<'a> From<&'a Candle> for CsvRow<'a> {
    fn from(c: &'a Candle) -> Self {
        Self {
            source: &c.source,
            symbol: &c.symbol,
            timeframe: c.timeframe.as_str(),
            open_time: c.open_time,
            close_time: c.close_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            quote_volume: c.quote_volume,
            trade_count: c.trade_count,
            is_closed: c.is_closed,
        }
    }
}

type Writer = csv::Writer<File>;

struct Output {
    writer: Writer,
    /// Transformed rows carry their own header, written with the first row.
    header_pending: bool,
}

enum Batch {
    Candles(Vec<Candle>),
    Rows(Vec<Row>),
}

/// Appends candles to a CSV file. The header is written only when the file
/// is new or empty. With a transform installed the columns are the keys of
/// the transformed row.
pub struct CsvSink {
    name: String,
    path: PathBuf,
    transform: Option<RowTransform>,
    conflict_keys: Option<Vec<String>>,
    output: Arc<Mutex<Option<Output>>>,
}

impl CsvSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            transform: None,
            conflict_keys: None,
            output: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_transform(mut self, transform: RowTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_conflict_keys(mut self, keys: Vec<String>) -> Self {
        self.conflict_keys = Some(keys);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path, transformed: bool) -> Result<Output> {
        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(fresh && !transformed)
            .from_writer(file);
        Ok(Output {
            writer,
            header_pending: fresh && transformed,
        })
    }

    fn batch(&self, candles: &[Candle]) -> Batch {
        match &self.transform {
            Some(transform) => Batch::Rows(candles.iter().map(|c| transform(c)).collect()),
            None => Batch::Candles(candles.to_vec()),
        }
    }

    /// Serialize `batch` on the blocking pool, opening the file on first use.
    async fn write(&self, batch: Batch) -> Result<()> {
        let output = self.output.clone();
        let path = self.path.clone();
        let transformed = self.transform.is_some();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = output.lock();
            if guard.is_none() {
                *guard = Some(Self::open(&path, transformed)?);
            }
            if let Some(out) = guard.as_mut() {
                match batch {
                    Batch::Candles(candles) => {
                        for candle in &candles {
                            out.writer.serialize(CsvRow::from(candle))?;
                        }
                    }
                    Batch::Rows(rows) => {
                        for row in &rows {
                            if out.header_pending {
                                out.writer.write_record(row.keys())?;
                                out.header_pending = false;
                            }
                            out.writer.write_record(row.values().map(cell))?;
                        }
                    }
                }
                out.writer.flush()?;
            }
            Ok(())
        })
        .await
        .context("csv writer task panicked")?
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn conflict_keys(&self) -> Vec<String> {
        self.conflict_keys.clone().unwrap_or_else(default_conflict_keys)
    }

    async fn connect(&self) -> Result<()> {
        self.write(Batch::Candles(Vec::new())).await?;
        info!(sink = %self.name, path = %self.path.display(), "csv sink ready");
        Ok(())
    }

    async fn emit(&self, candle: &Candle) -> Result<()> {
        self.write(self.batch(std::slice::from_ref(candle))).await
    }

    async fn emit_bulk(&self, candles: &[Candle]) -> Result<()> {
        self.write(self.batch(candles)).await
    }

    async fn close(&self) -> Result<()> {
        let output = self.output.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(mut out) = output.lock().take() {
                out.writer.flush()?;
            }
            Ok(())
        })
        .await
        .context("csv close task panicked")?
    }
}
