// =============================================================================
// OKX v5 adapter - candle channels on the business endpoint
// =============================================================================
//
// Stream frame:
//   { "arg": { "channel": "candle1m", "instId": "BTC-USDT" },
//     "data": [ [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm] ] }
//
// Keep-alive is a bare text "ping" answered by a bare "pong". Daily and
// longer bars use the UTC-anchored channels so windows align with other
// exchanges.
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

const PING_INTERVAL: Duration = Duration::from_secs(25);
const RATE_LIMIT_CODE: &str = "50011";
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct OkxAdapter {
    market: MarketType,
}

impl OkxAdapter {
    pub fn new(market: MarketType) -> Self {
        Self { market }
    }

    /// OKX `bar` value for `timeframe`.
    pub fn bar(timeframe: Timeframe) -> Option<&'static str> {
        Some(match timeframe {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1H",
            Timeframe::H2 => "2H",
            Timeframe::H4 => "4H",
            Timeframe::H6 => "6Hutc",
            Timeframe::H12 => "12Hutc",
            Timeframe::D1 => "1Dutc",
            Timeframe::D3 => "3Dutc",
            Timeframe::W1 => "1Wutc",
            Timeframe::H8 => return None,
        })
    }

    /// `instId` mentioned in an error message ("...instId:BTC-XXX doesn't exist").
    fn inst_id_from_message(msg: &str) -> Option<String> {
        let start = msg.find("instId:")? + "instId:".len();
        let id: String = msg[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        (!id.is_empty()).then(|| id.to_uppercase())
    }

    fn row_fields(inst_id: &str, bar: &str, arr: &[Value]) -> RawFields {
        let mut fields = RawFields::new();
        fields.insert("instId".into(), Value::from(inst_id.to_uppercase()));
        fields.insert("bar".into(), Value::from(bar));
        fields.insert("ts".into(), nth(arr, 0));
        fields.insert("o".into(), nth(arr, 1));
        fields.insert("h".into(), nth(arr, 2));
        fields.insert("l".into(), nth(arr, 3));
        fields.insert("c".into(), nth(arr, 4));
        fields.insert("vol".into(), nth(arr, 5));
        fields.insert("volCcyQuote".into(), nth(arr, 7));
        fields.insert("confirm".into(), nth(arr, 8));
        fields
    }
}

impl ExchangeAdapter for OkxAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Okx
    }

    fn market(&self) -> MarketType {
        self.market
    }

    fn ws_url(&self) -> String {
        "wss://ws.okx.com:8443/ws/v5/business".to_string()
    }

    fn supports(&self, timeframe: Timeframe) -> bool {
        Self::bar(timeframe).is_some()
    }

    fn subscribe_requests(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        first_id: u64,
    ) -> Vec<SubscribeRequest> {
        let Some(bar) = Self::bar(timeframe) else {
            return Vec::new();
        };
        symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| {
                let id = first_id + i as u64;
                let payload = json!({
                    "id": id.to_string(),
                    "op": "subscribe",
                    "args": [{ "channel": format!("candle{bar}"), "instId": sym.to_uppercase() }],
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
        if text == "pong" {
            return Decoded::Pong;
        }
        let Ok(root) = serde_json::from_str::<Value>(text) else {
            return Decoded::Ignore;
        };
        let id = root
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());

        match root.get("event").and_then(Value::as_str) {
            Some("subscribe") => return Decoded::Ack { id },
            Some("error") => {
                let reason = root
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Decoded::Rejected {
                    id,
                    symbol: Self::inst_id_from_message(&reason),
                    reason,
                };
            }
            Some(_) => return Decoded::Ignore,
            None => {}
        }

        let Some(arg) = root.get("arg") else {
            return Decoded::Ignore;
        };
        let channel = arg.get("channel").and_then(Value::as_str).unwrap_or_default();
        let Some(bar) = channel.strip_prefix("candle") else {
            return Decoded::Ignore;
        };
        let inst_id = arg.get("instId").and_then(Value::as_str).unwrap_or_default();

        let frames = root
            .get("data")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_array)
                    .map(|arr| Self::row_fields(inst_id, bar, arr))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Decoded::Frames(frames)
    }

    fn keep_alive(&self) -> Option<KeepAlive> {
        Some(KeepAlive {
            interval: PING_INTERVAL,
            payload: "ping".to_string(),
        })
    }

    fn rest_base_url(&self) -> String {
        "https://www.okx.com".to_string()
    }

    fn page_limit(&self) -> u32 {
        100
    }

    fn quota(&self) -> RateQuota {
        RateQuota {
            requests: 20,
            per: Duration::from_secs(2),
        }
    }

    /// `after` returns records older than the cursor and `before` newer ones,
    /// so both bounds are shifted by one millisecond to make them inclusive.
    fn klines_request(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> KlineRequest {
        KlineRequest {
            url: format!("{}/api/v5/market/history-candles", self.rest_base_url()),
            query: vec![
                ("instId", symbol.to_uppercase()),
                ("bar", Self::bar(timeframe).unwrap_or_default().to_string()),
                ("after", (end_ms + 1).to_string()),
                ("before", (start_ms - 1).to_string()),
                ("limit", limit.to_string()),
            ],
        }
    }

    fn parse_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        body: &Value,
        _now_ms: i64,
    ) -> Result<Vec<RawFields>, BackfillError> {
        let code = body.get("code").and_then(Value::as_str).unwrap_or("-1");
        if code != "0" {
            let message = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if code == RATE_LIMIT_CODE {
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
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| BackfillError::Decode("okx response missing data".into()))?;
        let bar = Self::bar(timeframe).unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            match row.as_array().filter(|a| a.len() >= 9) {
                Some(arr) => out.push(Self::row_fields(symbol, bar, arr)),
                None => warn!(symbol, "skipping malformed candle entry"),
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::AliasResolver;

    #[test]
    fn bars_parse_back_to_their_timeframe() {
        for tf in Timeframe::ALL {
            if let Some(bar) = OkxAdapter::bar(tf) {
                assert_eq!(bar.parse::<Timeframe>().unwrap(), tf);
            }
        }
        assert!(!OkxAdapter::new(MarketType::Spot).supports(Timeframe::H8));
    }

    #[test]
    fn subscribe_payload_uses_candle_channel() {
        let a = OkxAdapter::new(MarketType::Spot);
        let reqs = a.subscribe_requests(&["btc-usdt".into()], Timeframe::D1, 1);
        let v: Value = serde_json::from_str(&reqs[0].payload).unwrap();
        assert_eq!(v["args"][0]["channel"], "candle1Dutc");
        assert_eq!(v["args"][0]["instId"], "BTC-USDT");
        assert_eq!(v["id"], "1");
    }

    #[test]
    fn decodes_candle_push() {
        let a = OkxAdapter::new(MarketType::Spot);
        let text = r#"{"arg":{"channel":"candle1m","instId":"BTC-USDT"},
            "data":[["1700000040000","8533.02","8553.74","8527.17","8548.26","45247","529.58","529.58","0"]]}"#;
        let Decoded::Frames(frames) = a.decode(text) else {
            panic!("expected frames");
        };
        let c = AliasResolver::standard()
            .unwrap()
            .resolve(&frames[0], "okx")
            .unwrap();
        assert_eq!(c.symbol, "BTC-USDT");
        assert_eq!(c.timeframe, Timeframe::M1);
        assert_eq!(c.open_time, 1_700_000_040_000);
        assert!(!c.is_closed);
        assert_eq!(c.quote_volume, Some(529.58));
    }

    #[test]
    fn decodes_control_messages() {
        let a = OkxAdapter::new(MarketType::Spot);
        assert_eq!(a.decode("pong"), Decoded::Pong);
        assert_eq!(
            a.decode(r#"{"id":"2","event":"subscribe","arg":{"channel":"candle1m","instId":"BTC-USDT"}}"#),
            Decoded::Ack { id: Some(2) }
        );
        let Decoded::Rejected { symbol, .. } = a.decode(
            r#"{"event":"error","code":"60018","msg":"Wrong URL or channel:candle1m,instId:FOO-USDT doesn't exist."}"#,
        ) else {
            panic!("expected rejection");
        };
        assert_eq!(symbol.as_deref(), Some("FOO-USDT"));
    }

    #[test]
    fn history_request_bounds_are_inclusive() {
        let a = OkxAdapter::new(MarketType::Spot);
        let req = a.klines_request("BTC-USDT", Timeframe::M1, 1_000, 5_000, 100);
        assert!(req.query.contains(&("after", "5001".to_string())));
        assert!(req.query.contains(&("before", "999".to_string())));
    }

    #[test]
    fn rate_limit_code_is_a_pause() {
        let a = OkxAdapter::new(MarketType::Spot);
        let body: Value =
            serde_json::from_str(r#"{"code":"50011","msg":"Too Many Requests","data":[]}"#).unwrap();
        assert!(a
            .parse_klines("BTC-USDT", Timeframe::M1, &body, 0)
            .unwrap_err()
            .is_rate_limited());
    }
}
