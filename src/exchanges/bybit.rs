// =============================================================================
// Bybit v5 adapter - spot, linear and inverse kline streams
// =============================================================================
//
// Stream frame:
//   { "topic": "kline.1.BTCUSDT", "type": "snapshot", "ts": ...,
//     "data": [ { "start", "end", "interval", "open", "close", "high", "low",
//                 "volume", "turnover", "confirm", "timestamp" } ] }
//
// The symbol only appears in the topic, so it is copied into each record.
// REST /v5/market/kline returns `result.list` newest first.
// =============================================================================

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use super::{
    nth, Decoded, ExchangeAdapter, KeepAlive, KlineRequest, RateQuota, SubscribeRequest,
};
use crate::error::BackfillError;
use crate::market_data::RawFields;
use crate::types::{ExchangeId, MarketType, Timeframe};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(5);
const RATE_LIMIT_CODES: [i64; 2] = [10006, 10018];

#[derive(Debug, Clone)]
pub struct BybitAdapter {
    market: MarketType,
}

impl BybitAdapter {
    pub fn new(market: MarketType) -> Self {
        Self { market }
    }

    fn category(&self) -> &'static str {
        match self.market {
            MarketType::Spot => "spot",
            MarketType::Linear => "linear",
            MarketType::Inverse => "inverse",
        }
    }

    /// Bybit interval code for `timeframe`.
    pub fn interval_code(timeframe: Timeframe) -> Option<&'static str> {
        Some(match timeframe {
            Timeframe::M1 => "1",
            Timeframe::M3 => "3",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::M30 => "30",
            Timeframe::H1 => "60",
            Timeframe::H2 => "120",
            Timeframe::H4 => "240",
            Timeframe::H6 => "360",
            Timeframe::H12 => "720",
            Timeframe::D1 => "D",
            Timeframe::W1 => "W",
            Timeframe::H8 | Timeframe::D3 => return None,
        })
    }

    /// Symbol from a topic or a message mentioning one ("kline.1.BTCUSDT").
    fn symbol_from_topic(text: &str) -> Option<String> {
        let start = text.find("kline.")?;
        let topic: String = text[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-' || *c == '_')
            .collect();
        topic
            .rsplit('.')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
    }
}

impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn market(&self) -> MarketType {
        self.market
    }

    fn ws_url(&self) -> String {
        format!("wss://stream.bybit.com/v5/public/{}", self.category())
    }

    fn supports(&self, timeframe: Timeframe) -> bool {
        Self::interval_code(timeframe).is_some()
    }

    fn subscribe_requests(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        first_id: u64,
    ) -> Vec<SubscribeRequest> {
        let Some(code) = Self::interval_code(timeframe) else {
            return Vec::new();
        };
        symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| {
                let id = first_id + i as u64;
                let payload = json!({
                    "op": "subscribe",
                    "req_id": id.to_string(),
                    "args": [format!("kline.{code}.{}", sym.to_uppercase())],
                });
                SubscribeRequest {
                    id,
                    symbols: vec![sym.clone()],
                    payload: payload.to_string(),
                }
            })
            .collect()
    }

    fn decode(&self, text: &str) -> Decoded {
        let Ok(root) = serde_json::from_str::<Value>(text) else {
            return Decoded::Ignore;
        };

        if let Some(topic) = root.get("topic").and_then(Value::as_str) {
            if !topic.starts_with("kline.") {
                return Decoded::Ignore;
            }
            let Some(symbol) = Self::symbol_from_topic(topic) else {
                return Decoded::Ignore;
            };
            let frames = root
                .get("data")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(Value::as_object)
                        .map(|row| {
                            let mut fields = row.clone();
                            fields.insert("symbol".into(), Value::from(symbol.clone()));
                            fields
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            return Decoded::Frames(frames);
        }

        let op = root.get("op").and_then(Value::as_str).unwrap_or_default();
        let ret_msg = root.get("ret_msg").and_then(Value::as_str).unwrap_or_default();
        if op == "pong" || ret_msg == "pong" {
            return Decoded::Pong;
        }
        if op == "subscribe" {
            let id = root
                .get("req_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok());
            if root.get("success").and_then(Value::as_bool) == Some(true) {
                return Decoded::Ack { id };
            }
            return Decoded::Rejected {
                id,
                symbol: Self::symbol_from_topic(ret_msg),
                reason: ret_msg.to_string(),
            };
        }
        Decoded::Ignore
    }

    fn keep_alive(&self) -> Option<KeepAlive> {
        Some(KeepAlive {
            interval: PING_INTERVAL,
            payload: json!({ "op": "ping" }).to_string(),
        })
    }

    fn rest_base_url(&self) -> String {
        "https://api.bybit.com".to_string()
    }

    fn page_limit(&self) -> u32 {
        1000
    }

    /// 20 requests per second, shared by every category.
    fn quota(&self) -> RateQuota {
        RateQuota {
            requests: 20,
            per: Duration::from_secs(1),
        }
    }

    fn rate_pool(&self) -> String {
        self.id().to_string()
    }

    fn klines_request(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> KlineRequest {
        KlineRequest {
            url: format!("{}/v5/market/kline", self.rest_base_url()),
            query: vec![
                ("category", self.category().to_string()),
                ("symbol", symbol.to_uppercase()),
                (
                    "interval",
                    Self::interval_code(timeframe).unwrap_or_default().to_string(),
                ),
                ("start", start_ms.to_string()),
                ("end", end_ms.to_string()),
                ("limit", limit.to_string()),
            ],
        }
    }

    fn parse_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        body: &Value,
        now_ms: i64,
    ) -> Result<Vec<RawFields>, BackfillError> {
        let code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let message = body
                .get("retMsg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if RATE_LIMIT_CODES.contains(&code) || message.to_lowercase().contains("too many") {
                return Err(BackfillError::RateLimited {
                    exchange: self.id().to_string(),
                    retry_after: Some(RATE_LIMIT_PAUSE),
                });
            }
            return Err(BackfillError::Api {
                exchange: self.id().to_string(),
                code: code.to_string(),
                message,
            });
        }

        let rows = body
            .pointer("/result/list")
            .and_then(Value::as_array)
            .ok_or_else(|| BackfillError::Decode("bybit response missing result.list".into()))?;

        let mut out = Vec::with_capacity(rows.len());
        // Newest first on the wire.
        for row in rows.iter().rev() {
            let Some(arr) = row.as_array().filter(|a| a.len() >= 7) else {
                warn!(symbol, "skipping malformed kline entry");
                continue;
            };
            let start = match &arr[0] {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            let closed = start.is_some_and(|t| t + timeframe.duration_ms() <= now_ms);

            let mut fields = RawFields::new();
            fields.insert("symbol".into(), Value::from(symbol.to_uppercase()));
            fields.insert("interval".into(), Value::from(timeframe.as_str()));
            fields.insert("start".into(), nth(arr, 0));
            fields.insert("open".into(), nth(arr, 1));
            fields.insert("high".into(), nth(arr, 2));
            fields.insert("low".into(), nth(arr, 3));
            fields.insert("close".into(), nth(arr, 4));
            fields.insert("volume".into(), nth(arr, 5));
            fields.insert("turnover".into(), nth(arr, 6));
            fields.insert("confirm".into(), Value::Bool(closed));
            out.push(fields);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
