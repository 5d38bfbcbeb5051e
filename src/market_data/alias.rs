// =============================================================================
// Alias Resolver - exchange field names -> canonical Candle
// =============================================================================
//
// Every canonical field owns an ordered list of accepted raw field names. The
// first alias present in the raw map wins. The table is static and validated
// once when the resolver is built.
// =============================================================================

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{ConfigError, SchemaError};
use crate::market_data::candle::{normalize_timestamp_ms, Candle};
use crate::types::Timeframe;

/// Decoded exchange frame, keyed by exchange-specific field names.
pub type RawFields = Map<String, Value>;

/// Canonical fields the resolver knows how to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    Symbol,
    Timeframe,
    OpenTime,
    Open,
    High,
    Low,
    Close,
    Volume,
    QuoteVolume,
    TradeCount,
    IsClosed,
}

impl CanonicalField {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Symbol => "symbol",
            Self::Timeframe => "timeframe",
            Self::OpenTime => "open_time",
            Self::Open => "open",
            Self::High => "high",
            Self::Low => "low",
            Self::Close => "close",
            Self::Volume => "volume",
            Self::QuoteVolume => "quote_volume",
            Self::TradeCount => "trade_count",
            Self::IsClosed => "is_closed",
        }
    }
}

/// Default alias table, most specific names first.
pub const STANDARD_ALIASES: &[(CanonicalField, &[&str])] = &[
    (CanonicalField::Symbol, &["symbol", "s", "instId", "inst_id", "pair"]),
    (CanonicalField::Timeframe, &["timeframe", "interval", "i", "bar", "tf"]),
    (
        CanonicalField::OpenTime,
        &["open_time", "openTime", "t", "start", "startTime", "ts"],
    ),
    (CanonicalField::Open, &["open", "o", "open_price"]),
    (CanonicalField::High, &["high", "h", "high_price"]),
    (CanonicalField::Low, &["low", "l", "low_price"]),
    (CanonicalField::Close, &["close", "c", "close_price"]),
    (CanonicalField::Volume, &["volume", "v", "vol", "base_volume"]),
    (
        CanonicalField::QuoteVolume,
        &["quote_volume", "quoteVolume", "q", "turnover", "volCcyQuote"],
    ),
    (
        CanonicalField::TradeCount,
        &["trade_count", "tradeCount", "n", "count", "trades"],
    ),
    (
        CanonicalField::IsClosed,
        &["is_closed", "isClosed", "x", "confirm", "closed"],
    ),
];

const REQUIRED: [CanonicalField; 7] = [
    CanonicalField::Symbol,
    CanonicalField::Timeframe,
    CanonicalField::OpenTime,
    CanonicalField::Open,
    CanonicalField::High,
    CanonicalField::Low,
    CanonicalField::Close,
];

/// Maps heterogeneous exchange field maps onto [`Candle`].
#[derive(Debug, Clone)]
pub struct AliasResolver {
    table: HashMap<CanonicalField, Vec<String>>,
}

impl AliasResolver {
    /// Build a resolver from an alias table, rejecting ambiguous or empty
    /// entries.
    pub fn new(entries: &[(CanonicalField, &[&str])]) -> Result<Self, ConfigError> {
        let mut owner: HashMap<&str, CanonicalField> = HashMap::new();
        let mut table = HashMap::with_capacity(entries.len());

        for (field, aliases) in entries {
            if aliases.is_empty() {
                return Err(ConfigError::EmptyAliasList(field.name()));
            }
            for alias in aliases.iter() {
                if let Some(previous) = owner.insert(alias, *field) {
                    if previous != *field {
                        return Err(ConfigError::AmbiguousAlias {
                            alias: alias.to_string(),
                            first: previous.name(),
                            second: field.name(),
                        });
                    }
                }
            }
            table.insert(*field, aliases.iter().map(|a| a.to_string()).collect());
        }

        for field in REQUIRED {
            if !table.contains_key(&field) {
                return Err(ConfigError::EmptyAliasList(field.name()));
            }
        }

        Ok(Self { table })
    }

    /// Resolver over [`STANDARD_ALIASES`].
    pub fn standard() -> Result<Self, ConfigError> {
        Self::new(STANDARD_ALIASES)
    }

    /// Turn a raw field map into a canonical candle attributed to `source`.
    pub fn resolve(&self, raw: &RawFields, source: &str) -> Result<Candle, SchemaError> {
        let symbol = self
            .required(raw, CanonicalField::Symbol, source)?
            .as_str()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid(CanonicalField::Symbol, raw, self, source))?;

        let timeframe: Timeframe = match self.required(raw, CanonicalField::Timeframe, source)? {
            Value::String(s) => s.parse()?,
            other => return Err(invalid_value(CanonicalField::Timeframe, other, source)),
        };

        let open_time = {
            let v = self.required(raw, CanonicalField::OpenTime, source)?;
            let ts = as_i64(v).ok_or_else(|| invalid_value(CanonicalField::OpenTime, v, source))?;
            normalize_timestamp_ms(ts)
        };

        let open = self.required_f64(raw, CanonicalField::Open, source)?;
        let high = self.required_f64(raw, CanonicalField::High, source)?;
        let low = self.required_f64(raw, CanonicalField::Low, source)?;
        let close = self.required_f64(raw, CanonicalField::Close, source)?;

        let volume = self.optional_f64(raw, CanonicalField::Volume, source)?.unwrap_or(0.0);
        let quote_volume = self.optional_f64(raw, CanonicalField::QuoteVolume, source)?;
        let trade_count = match self.lookup(raw, CanonicalField::TradeCount) {
            Some(v) => as_f64(v)
                .filter(|n| *n >= 0.0)
                .map(|n| n as u64)
                .ok_or_else(|| invalid_value(CanonicalField::TradeCount, v, source))?,
            None => 0,
        };
        let is_closed = match self.lookup(raw, CanonicalField::IsClosed) {
            Some(v) => as_bool(v).ok_or_else(|| invalid_value(CanonicalField::IsClosed, v, source))?,
            None => false,
        };

        let candle = Candle {
            source: source.to_string(),
            symbol,
            timeframe,
            open_time,
            close_time: open_time + timeframe.duration_ms(),
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
            trade_count,
            is_closed,
        };
        candle.validate()?;
        Ok(candle)
    }

    // -------------------------------------------------------------------------
    // Lookup helpers
    // -------------------------------------------------------------------------

    fn lookup<'a>(&self, raw: &'a RawFields, field: CanonicalField) -> Option<&'a Value> {
        self.table
            .get(&field)?
            .iter()
            .find_map(|alias| raw.get(alias).filter(|v| !v.is_null()))
    }

    fn required<'a>(
        &self,
        raw: &'a RawFields,
        field: CanonicalField,
        source: &str,
    ) -> Result<&'a Value, SchemaError> {
        self.lookup(raw, field).ok_or_else(|| SchemaError::MissingField {
            field: field.name(),
            source_id: source.to_string(),
        })
    }

    fn required_f64(
        &self,
        raw: &RawFields,
        field: CanonicalField,
        source: &str,
    ) -> Result<f64, SchemaError> {
        let v = self.required(raw, field, source)?;
        as_f64(v).ok_or_else(|| invalid_value(field, v, source))
    }

    fn optional_f64(
        &self,
        raw: &RawFields,
        field: CanonicalField,
        source: &str,
    ) -> Result<Option<f64>, SchemaError> {
        match self.lookup(raw, field) {
            Some(v) => as_f64(v)
                .map(Some)
                .ok_or_else(|| invalid_value(field, v, source)),
            None => Ok(None),
        }
    }
}

fn invalid(field: CanonicalField, raw: &RawFields, resolver: &AliasResolver, source: &str) -> SchemaError {
    let shown = resolver
        .lookup(raw, field)
        .map(Value::to_string)
        .unwrap_or_default();
    SchemaError::InvalidValue {
        field: field.name(),
        value: shown,
        source_id: source.to_string(),
    }
}

fn invalid_value(field: CanonicalField, value: &Value, source: &str) -> SchemaError {
    SchemaError::InvalidValue {
        field: field.name(),
        value: value.to_string(),
        source_id: source.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Value coercion: exchanges send numbers as JSON strings or numbers, and
// booleans as bools, "0"/"1" or "true"/"false".
// ---------------------------------------------------------------------------

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" | "TRUE" | "True" => Some(true),
            "0" | "false" | "FALSE" | "False" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> RawFields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn standard_table_is_valid() {
        assert!(AliasResolver::standard().is_ok());
    }

    #[test]
    fn resolves_binance_style_short_names() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({
            "s": "btcusdt", "i": "1m", "t": 1_700_000_040_000_i64,
            "o": "37000.0", "h": "37050.5", "l": "36990.0", "c": "37020.0",
            "v": "12.5", "q": "462000.0", "n": 150, "x": false
        }));
        let c = r.resolve(&raw, "binance").unwrap();
        assert_eq!(c.symbol, "BTCUSDT");
        assert_eq!(c.timeframe, Timeframe::M1);
        assert_eq!(c.open_time, 1_700_000_040_000);
        assert_eq!(c.close_time, 1_700_000_100_000);
        assert!((c.high - 37050.5).abs() < f64::EPSILON);
        assert_eq!(c.quote_volume, Some(462000.0));
        assert_eq!(c.trade_count, 150);
        assert!(!c.is_closed);
        assert_eq!(c.source, "binance");
    }

    #[test]
    fn resolves_long_names_and_native_interval_codes() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({
            "symbol": "ETHUSDT", "interval": "60", "start": 1_699_999_200_000_i64,
            "open_price": 2000, "high_price": 2010, "low_price": 1990, "close_price": 2005,
            "turnover": "1000.5", "confirm": "1"
        }));
        let c = r.resolve(&raw, "bybit").unwrap();
        assert_eq!(c.timeframe, Timeframe::H1);
        assert_eq!(c.volume, 0.0);
        assert_eq!(c.quote_volume, Some(1000.5));
        assert!(c.is_closed);
    }

    #[test]
    fn first_alias_wins() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({
            "symbol": "SOLUSDT", "s": "IGNORED", "i": "5m", "t": 1_699_999_800_000_i64,
            "open": 10.0, "o": 99.0, "h": 11.0, "l": 9.0, "c": 10.5
        }));
        let c = r.resolve(&raw, "x").unwrap();
        assert_eq!(c.symbol, "SOLUSDT");
        assert_eq!(c.open, 10.0);
    }

    #[test]
    fn seconds_timestamps_are_normalised() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({
            "s": "BTC-USDT", "bar": "1m", "ts": "1700000040",
            "o": "1", "h": "1", "l": "1", "c": "1"
        }));
        assert_eq!(r.resolve(&raw, "okx").unwrap().open_time, 1_700_000_040_000);
    }

    #[test]
    fn missing_required_field_is_schema_error() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({ "s": "BTCUSDT", "i": "1m", "t": 1_700_000_040_000_i64, "o": 1, "h": 1, "l": 1 }));
        assert_eq!(
            r.resolve(&raw, "binance").unwrap_err(),
            SchemaError::MissingField { field: "close", source_id: "binance".into() }
        );
    }

    #[test]
    fn unparseable_number_is_schema_error() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({ "s": "BTCUSDT", "i": "1m", "t": 1_700_000_040_000_i64, "o": "abc", "h": 1, "l": 1, "c": 1 }));
        assert!(matches!(
            r.resolve(&raw, "binance"),
            Err(SchemaError::InvalidValue { field: "open", .. })
        ));
    }

    #[test]
    fn oversized_interval_code_is_schema_error() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({
            "s": "BTCUSDT", "i": "999999999999999999", "t": 1_700_000_040_000_i64,
            "o": 1, "h": 1, "l": 1, "c": 1
        }));
        assert!(matches!(
            r.resolve(&raw, "binance"),
            Err(SchemaError::UnknownTimeframe(_))
        ));
    }

    #[test]
    fn inconsistent_ohlc_is_rejected() {
        let r = AliasResolver::standard().unwrap();
        let raw = fields(json!({ "s": "BTCUSDT", "i": "1m", "t": 1_700_000_040_000_i64, "o": 5, "h": 4, "l": 1, "c": 2 }));
        assert!(matches!(
            r.resolve(&raw, "binance"),
            Err(SchemaError::InvariantViolated(_))
        ));
    }

    #[test]
    fn ambiguous_table_is_rejected() {
        let table: &[(CanonicalField, &[&str])] = &[
            (CanonicalField::Open, &["o"]),
            (CanonicalField::Close, &["o"]),
        ];
        assert!(matches!(
            AliasResolver::new(table),
            Err(ConfigError::AmbiguousAlias { .. })
        ));
    }

    #[test]
    fn table_missing_required_field_is_rejected() {
        let table: &[(CanonicalField, &[&str])] = &[(CanonicalField::Open, &["o"])];
        assert!(matches!(
            AliasResolver::new(table),
            Err(ConfigError::EmptyAliasList(_))
        ));
    }
}
