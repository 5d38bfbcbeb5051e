// =============================================================================
// Exchange adapters
// =============================================================================
//
// An adapter is pure protocol knowledge: URLs, subscribe payloads, frame
// decoding, REST request shape and response decoding. It never owns a socket.
// `session::AdapterSession` drives any adapter over a reconnecting WebSocket.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod connection_state;
pub mod okx;
pub mod session;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BackfillError, ConfigError};
use crate::market_data::RawFields;
use crate::types::{ExchangeId, MarketType, Timeframe, VolumeMode};

pub use connection_state::ConnectionState;
pub use session::{AdapterSession, SessionConfig};

// =============================================================================
// Subscription
// =============================================================================

/// What to stream from one exchange market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub exchange: ExchangeId,
    #[serde(default)]
    pub market_type: MarketType,
    pub symbols: Vec<String>,
    pub base_timeframe: Timeframe,
    #[serde(default)]
    pub aggregate_timeframes: Vec<Timeframe>,
    /// Load enough history before streaming to fill the largest aggregate.
    #[serde(default)]
    pub warmup: bool,
}

impl Subscription {
    /// Static checks that need no adapter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols {
                exchange: self.exchange.to_string(),
            });
        }
        let mut seen = HashSet::new();
        for sym in &self.symbols {
            if !seen.insert(sym.trim().to_uppercase()) {
                return Err(ConfigError::DuplicateSymbol {
                    exchange: self.exchange.to_string(),
                    symbol: sym.clone(),
                });
            }
        }
        for target in &self.aggregate_timeframes {
            if !target.is_aggregate_of(self.base_timeframe) {
                return Err(ConfigError::InvalidAggregate {
                    base: self.base_timeframe.to_string(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Full check including the adapter's supported timeframes.
    pub fn validate_for(&self, adapter: &dyn ExchangeAdapter) -> Result<(), ConfigError> {
        self.validate()?;
        if !adapter.supports(self.base_timeframe) {
            return Err(ConfigError::UnsupportedTimeframe {
                exchange: self.exchange.to_string(),
                timeframe: self.base_timeframe.to_string(),
            });
        }
        Ok(())
    }

    /// Symbols upper-cased and trimmed, in configured order.
    pub fn normalized_symbols(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.trim().to_uppercase()).collect()
    }
}

// =============================================================================
// Events
// =============================================================================

/// One decoded exchange record, keyed by exchange field names.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub source: ExchangeId,
    pub fields: RawFields,
    pub received_at: DateTime<Utc>,
}

/// What a running session reports to its consumer.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Frame(RawEvent),
    Rejected { symbol: String, reason: String },
    Reconnected { attempt: u32 },
    StateChanged(ConnectionState),
}

// =============================================================================
// Adapter protocol types
// =============================================================================

/// One outbound subscribe message. `symbols` are the symbols it covers so a
/// rejection carrying `id` can be attributed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub id: u64,
    pub symbols: Vec<String>,
    pub payload: String,
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frames(Vec<RawFields>),
    Ack { id: Option<u64> },
    Rejected {
        id: Option<u64>,
        symbol: Option<String>,
        reason: String,
    },
    Pong,
    Ignore,
}

/// Application-level keep-alive sent by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepAlive {
    pub interval: Duration,
    pub payload: String,
}

/// REST request for one page of historical klines.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineRequest {
    pub url: String,
    pub query: Vec<(&'static str, String)>,
}

/// Request budget of one REST rate-limit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub requests: u32,
    pub per: Duration,
}

// =============================================================================
// Adapter trait
// =============================================================================

pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    fn market(&self) -> MarketType;

    fn ws_url(&self) -> String;

    /// Whether the exchange can stream and serve klines of `timeframe`.
    fn supports(&self, timeframe: Timeframe) -> bool;

    /// Subscribe messages for `symbols`; ids start at `first_id`.
    fn subscribe_requests(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        first_id: u64,
    ) -> Vec<SubscribeRequest>;

    /// Minimum spacing between subscribe messages on one connection.
    fn subscribe_pacing(&self) -> Option<Duration> {
        None
    }

    fn decode(&self, text: &str) -> Decoded;

    fn volume_mode(&self) -> VolumeMode {
        VolumeMode::Cumulative
    }

    fn keep_alive(&self) -> Option<KeepAlive> {
        None
    }

    // ---- REST -------------------------------------------------------------

    fn rest_base_url(&self) -> String;

    /// Maximum candles per history page.
    fn page_limit(&self) -> u32;

    fn quota(&self) -> RateQuota;

    /// Name of the REST rate-limit pool this market draws from.
    fn rate_pool(&self) -> String {
        format!("{}:{}", self.id(), self.market())
    }

    /// Request for candles with open time in `[start_ms, end_ms]`.
    fn klines_request(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> KlineRequest;

    /// Decode a history response into raw field maps, oldest first. `now_ms`
    /// decides closed-ness for exchanges that do not flag it.
    fn parse_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        body: &Value,
        now_ms: i64,
    ) -> Result<Vec<RawFields>, BackfillError>;
}

/// Built-in adapter for an exchange market.
pub fn adapter_for(exchange: ExchangeId, market: MarketType) -> Arc<dyn ExchangeAdapter> {
    match exchange {
        ExchangeId::Binance => Arc::new(binance::BinanceAdapter::new(market)),
        ExchangeId::Bybit => Arc::new(bybit::BybitAdapter::new(market)),
        ExchangeId::Okx => Arc::new(okx::OkxAdapter::new(market)),
    }
}

// =============================================================================
// Helpers shared by the adapters
// =============================================================================

/// Element `idx` of a JSON array as a field value, or `Null`.
pub(crate) fn nth(arr: &[Value], idx: usize) -> Value {
    arr.get(idx).cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(symbols: &[&str]) -> Subscription {
        Subscription {
            exchange: ExchangeId::Binance,
            market_type: MarketType::Spot,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            base_timeframe: Timeframe::M1,
            aggregate_timeframes: vec![Timeframe::M5],
            warmup: false,
        }
    }

    #[test]
    fn empty_and_duplicate_symbols_are_config_errors() {
        assert!(matches!(sub(&[]).validate(), Err(ConfigError::NoSymbols { .. })));
        assert!(matches!(
            sub(&["BTCUSDT", "btcusdt"]).validate(),
            Err(ConfigError::DuplicateSymbol { .. })
        ));
        assert!(sub(&["BTCUSDT", "ETHUSDT"]).validate().is_ok());
    }

    #[test]
    fn aggregate_must_be_strict_multiple() {
        let mut s = sub(&["BTCUSDT"]);
        s.base_timeframe = Timeframe::M3;
        assert!(matches!(s.validate(), Err(ConfigError::InvalidAggregate { .. })));
    }

    #[test]
    fn unsupported_base_timeframe_is_rejected_per_adapter() {
        let mut s = sub(&["BTC-USDT"]);
        s.exchange = ExchangeId::Okx;
        s.base_timeframe = Timeframe::H8;
        s.aggregate_timeframes.clear();
        let okx = adapter_for(ExchangeId::Okx, MarketType::Spot);
        assert!(matches!(
            s.validate_for(okx.as_ref()),
            Err(ConfigError::UnsupportedTimeframe { .. })
        ));
    }

    #[test]
    fn subscription_deserializes_with_defaults() {
        let s: Subscription = serde_json::from_str(
            r#"{"exchange":"bybit","symbols":["BTCUSDT"],"base_timeframe":"1m"}"#,
        )
        .unwrap();
        assert_eq!(s.market_type, MarketType::Spot);
        assert!(s.aggregate_timeframes.is_empty());
        assert!(!s.warmup);
    }
}
