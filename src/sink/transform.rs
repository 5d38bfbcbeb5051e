// =============================================================================
// Row transforms - reshape a candle before a sink writes it
// =============================================================================
//
// A transform maps a candle to an ordered row of named values. Sinks that
// write tabular output apply it per candle; the row's keys become the column
// names. Configured sinks can select and rename columns; embedding code can
// install any closure.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::market_data::Candle;

/// One output row. Key order is column order.
pub type Row = Map<String, Value>;

pub type RowTransform = Arc<dyn Fn(&Candle) -> Row + Send + Sync>;

/// Column names of the default row, in output order.
pub const CANDLE_COLUMNS: &[&str] = &[
    "source",
    "symbol",
    "timeframe",
    "open_time",
    "close_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "quote_volume",
    "trade_count",
    "is_closed",
];

/// The default row for `candle`.
pub fn candle_row(c: &Candle) -> Row {
    let mut row = Row::new();
    row.insert("source".into(), c.source.clone().into());
    row.insert("symbol".into(), c.symbol.clone().into());
    row.insert("timeframe".into(), c.timeframe.as_str().into());
    row.insert("open_time".into(), c.open_time.into());
    row.insert("close_time".into(), c.close_time.into());
    row.insert("open".into(), c.open.into());
    row.insert("high".into(), c.high.into());
    row.insert("low".into(), c.low.into());
    row.insert("close".into(), c.close.into());
    row.insert("volume".into(), c.volume.into());
    row.insert("quote_volume".into(), c.quote_volume.map_or(Value::Null, Value::from));
    row.insert("trade_count".into(), c.trade_count.into());
    row.insert("is_closed".into(), c.is_closed.into());
    row
}

/// Keep `field` from the default row, optionally under another name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub field: String,
    #[serde(default)]
    pub rename: Option<String>,
}

impl ColumnSpec {
    pub fn output_name(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.field)
    }
}

/// Output column names for `columns`, after checking every field exists and
/// no two columns share a name.
pub fn output_columns(columns: &[ColumnSpec]) -> Result<Vec<String>, ConfigError> {
    if columns.is_empty() {
        return Err(ConfigError::InvalidSetting {
            field: "columns",
            reason: "must list at least one column".into(),
        });
    }
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(columns.len());
    for col in columns {
        if !CANDLE_COLUMNS.contains(&col.field.as_str()) {
            return Err(ConfigError::InvalidSetting {
                field: "columns",
                reason: format!("unknown candle field '{}'", col.field),
            });
        }
        let name = col.output_name();
        if !seen.insert(name) {
            return Err(ConfigError::InvalidSetting {
                field: "columns",
                reason: format!("column '{name}' appears twice"),
            });
        }
        names.push(name.to_string());
    }
    Ok(names)
}

/// Transform that keeps `columns` in the given order under their output names.
pub fn select_columns(columns: Vec<ColumnSpec>) -> RowTransform {
    Arc::new(move |candle: &Candle| {
        let mut full = candle_row(candle);
        columns
            .iter()
            .map(|col| {
                let value = full.remove(&col.field).unwrap_or(Value::Null);
                (col.output_name().to_string(), value)
            })
            .collect()
    })
}
