// =============================================================================
// Shared types used across the StreamForge pipeline
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SchemaError;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
/// 1970-01-05, the first Monday after the epoch. Weekly candles open on Monday
/// 00:00 UTC on every supported exchange.
const WEEK_ANCHOR_MS: i64 = 4 * DAY_MS;

// =============================================================================
// Timeframe
// =============================================================================

/// Fixed-duration candle interval.
///
/// Serialised in canonical form ("1m", "4h", "1d"). Parsing also accepts the
/// native interval codes used by the supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 14] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
    ];

    /// Window length in milliseconds.
    pub const fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => MINUTE_MS,
            Self::M3 => 3 * MINUTE_MS,
            Self::M5 => 5 * MINUTE_MS,
            Self::M15 => 15 * MINUTE_MS,
            Self::M30 => 30 * MINUTE_MS,
            Self::H1 => HOUR_MS,
            Self::H2 => 2 * HOUR_MS,
            Self::H4 => 4 * HOUR_MS,
            Self::H6 => 6 * HOUR_MS,
            Self::H8 => 8 * HOUR_MS,
            Self::H12 => 12 * HOUR_MS,
            Self::D1 => DAY_MS,
            Self::D3 => 3 * DAY_MS,
            Self::W1 => 7 * DAY_MS,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
        }
    }

    /// Start of the window containing `ts_ms`.
    ///
    /// Uses floor division so timestamps before the epoch still land on the
    /// correct boundary. Weekly windows start on Monday.
    pub fn window_start(self, ts_ms: i64) -> i64 {
        let dur = self.duration_ms();
        let anchor = if self == Self::W1 { WEEK_ANCHOR_MS } else { 0 };
        (ts_ms - anchor).div_euclid(dur) * dur + anchor
    }

    /// Whether `self` can be built from whole candles of `base`.
    pub fn is_aggregate_of(self, base: Timeframe) -> bool {
        let (target, base) = (self.duration_ms(), base.duration_ms());
        target > base && target % base == 0
    }

    /// Number of `base` candles in one `self` candle, if `self` is an aggregate.
    pub fn ratio_to(self, base: Timeframe) -> Option<i64> {
        self.is_aggregate_of(base)
            .then(|| self.duration_ms() / base.duration_ms())
    }

    fn from_duration_ms(ms: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.duration_ms() == ms)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if let Some(tf) = Self::ALL.into_iter().find(|tf| tf.as_str() == raw) {
            return Ok(tf);
        }

        // Exchange-native codes: Bybit minutes ("1", "60", "D"), OKX upper-case
        // units with optional "utc" suffix ("1H", "1Dutc").
        let stripped = raw.strip_suffix("utc").unwrap_or(raw);
        let ms = match stripped {
            "D" => Some(DAY_MS),
            "W" => Some(7 * DAY_MS),
            _ if stripped.is_empty() || !stripped.is_ascii() => None,
            _ if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) => {
                stripped.parse::<i64>().ok().and_then(|m| m.checked_mul(MINUTE_MS))
            }
            _ => {
                let (num, unit) = stripped.split_at(stripped.len().saturating_sub(1));
                let n: i64 = num.parse().unwrap_or(0);
                let unit_ms = match unit {
                    "m" => Some(MINUTE_MS),
                    "h" | "H" => Some(HOUR_MS),
                    "d" | "D" => Some(DAY_MS),
                    "w" | "W" => Some(7 * DAY_MS),
                    _ => None,
                };
                unit_ms.and_then(|u| n.checked_mul(u))
            }
        };

        ms.and_then(Self::from_duration_ms)
            .ok_or_else(|| SchemaError::UnknownTimeframe(s.to_string()))
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Exchange identity
// =============================================================================

/// Exchanges with a built-in adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bybit,
    Okx,
}

impl ExchangeId {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Okx => "okx",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product family on an exchange. Selects endpoints and rate-limit pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    #[default]
    Spot,
    /// USDT/USDC-margined perpetuals (Binance USD-M, Bybit linear, OKX swap).
    Linear,
    /// Coin-margined contracts (Binance COIN-M, Bybit inverse).
    Inverse,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Linear => write!(f, "linear"),
            Self::Inverse => write!(f, "inverse"),
        }
    }
}

/// How an adapter reports volume inside one candle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    /// Each update carries the running total for the window (kline snapshots).
    Cumulative,
    /// Each update carries only the volume traded since the previous update.
    Incremental,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_and_native_codes() {
        assert_eq!("1m".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!("60".parse::<Timeframe>().unwrap(), Timeframe::H1);
        assert_eq!("D".parse::<Timeframe>().unwrap(), Timeframe::D1);
        assert_eq!("1H".parse::<Timeframe>().unwrap(), Timeframe::H1);
        assert_eq!("1Dutc".parse::<Timeframe>().unwrap(), Timeframe::D1);
        assert_eq!("240".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("7m".parse::<Timeframe>().is_err());
        assert!("1M".parse::<Timeframe>().is_err());
        assert!("".parse::<Timeframe>().is_err());
    }

    #[test]
    fn window_start_floors_to_boundary() {
        let tf = Timeframe::M5;
        assert_eq!(tf.window_start(0), 0);
        assert_eq!(tf.window_start(299_999), 0);
        assert_eq!(tf.window_start(300_000), 300_000);
        assert_eq!(tf.window_start(-1), -300_000);
    }

    #[test]
    fn weekly_windows_open_on_monday() {
        // 2024-01-01T00:00Z is a Monday
        let monday = 1_704_067_200_000;
        let week = Timeframe::W1.duration_ms();
        assert_eq!(Timeframe::W1.window_start(monday), monday);
        assert_eq!(Timeframe::W1.window_start(monday + week - 1), monday);
        assert_eq!(Timeframe::W1.window_start(monday - 1), monday - week);
        // daily windows still align on the epoch
        assert_eq!(Timeframe::D1.window_start(monday + 5), monday);
    }

    #[test]
    fn oversized_interval_codes_are_rejected() {
        for code in ["999999999999999999", "999999999999999999m", "99999999999999999w"] {
            assert!(matches!(
                code.parse::<Timeframe>(),
                Err(SchemaError::UnknownTimeframe(_))
            ));
        }
    }

    #[test]
    fn aggregate_relationship() {
        assert!(Timeframe::M5.is_aggregate_of(Timeframe::M1));
        assert!(Timeframe::H1.is_aggregate_of(Timeframe::M15));
        assert!(!Timeframe::M1.is_aggregate_of(Timeframe::M1));
        assert!(!Timeframe::M5.is_aggregate_of(Timeframe::M3));
        assert!(!Timeframe::M1.is_aggregate_of(Timeframe::M5));
        assert_eq!(Timeframe::H1.ratio_to(Timeframe::M5), Some(12));
        assert_eq!(Timeframe::M5.ratio_to(Timeframe::M3), None);
    }

    #[test]
    fn serde_uses_canonical_strings() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4h\"");
        let tf: Timeframe = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(tf, Timeframe::M15);
        let ex: ExchangeId = serde_json::from_str("\"okx\"").unwrap();
        assert_eq!(ex, ExchangeId::Okx);
    }
}
