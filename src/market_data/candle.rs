use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV record for the half-open window `[open_time, close_time)`.
///
/// Times are Unix milliseconds. `close_time - open_time` always equals the
/// timeframe duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub source: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: Option<f64>,
    pub trade_count: u64,
    pub is_closed: bool,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub source: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.source, self.symbol, self.timeframe)
    }
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            source: self.source.clone(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
        }
    }

    /// Check the OHLC ordering and window-length invariants.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Err(SchemaError::InvariantViolated(format!(
                "{} non-finite value in candle at {}",
                self.key(),
                self.open_time
            )));
        }
        if self.low > self.open.min(self.close) || self.high < self.open.max(self.close) {
            return Err(SchemaError::InvariantViolated(format!(
                "{} low {} / high {} do not bound open {} close {}",
                self.key(),
                self.low,
                self.high,
                self.open,
                self.close
            )));
        }
        if self.close_time - self.open_time != self.timeframe.duration_ms() {
            return Err(SchemaError::InvariantViolated(format!(
                "{} window [{}, {}) does not match {}",
                self.key(),
                self.open_time,
                self.close_time,
                self.timeframe
            )));
        }
        Ok(())
    }
}

/// Normalise a timestamp of unknown precision to milliseconds.
///
/// Precision is inferred from the digit count: 10 digits are seconds, 13 are
/// milliseconds, 16 are microseconds and 19 are nanoseconds.
pub fn normalize_timestamp_ms(ts: i64) -> i64 {
    let digits = ts.unsigned_abs().checked_ilog10().map_or(1, |d| d + 1);
    match digits {
        0..=11 => ts * 1_000,
        12..=14 => ts,
        15..=17 => ts / 1_000,
        _ => ts / 1_000_000,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(open_time: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            source: "binance".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_time,
            close_time: open_time + 60_000,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
            quote_volume: None,
            trade_count: 0,
            is_closed: true,
        }
    }

    #[test]
    fn valid_candle_passes() {
        assert!(sample(0, 100.0, 102.0, 99.0, 101.0).validate().is_ok());
    }

    #[test]
    fn low_above_open_is_rejected() {
        let err = sample(0, 100.0, 102.0, 100.5, 101.0).validate().unwrap_err();
        assert!(matches!(err, SchemaError::InvariantViolated(_)));
    }

    #[test]
    fn wrong_window_length_is_rejected() {
        let mut c = sample(0, 100.0, 102.0, 99.0, 101.0);
        c.close_time = 59_999;
        assert!(c.validate().is_err());
    }

    #[test]
    fn timestamp_precision_detection() {
        assert_eq!(normalize_timestamp_ms(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp_ms(1_700_000_000_000), 1_700_000_000_000);
        assert_eq!(normalize_timestamp_ms(1_700_000_000_000_000), 1_700_000_000_000);
        assert_eq!(
            normalize_timestamp_ms(1_700_000_000_000_000_000),
            1_700_000_000_000
        );
    }

    #[test]
    fn key_display() {
        let c = sample(0, 1.0, 1.0, 1.0, 1.0);
        assert_eq!(c.key().to_string(), "binance:BTCUSDT@1m");
    }
}
