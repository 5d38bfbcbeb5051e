// =============================================================================
// Binance adapter - spot, USD-M and COIN-M kline streams
// =============================================================================
//
// Stream frame (single-stream form):
//   { "e": "kline", "s": "BTCUSDT", "k": { "t", "T", "i", "o", "h", "l", "c",
//     "v", "q", "n", "x", ... } }
//
// The `k` object already uses the short alias names, so it is forwarded as
// the raw field map unchanged.
//
// REST /klines array indices:
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
//   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades, ...
// =============================================================================

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use super::{
    nth, Decoded, ExchangeAdapter, KlineRequest, RateQuota, SubscribeRequest,
};
use crate::error::BackfillError;
use crate::market_data::RawFields;
use crate::types::{ExchangeId, MarketType, Timeframe};

/// Binance accepts at most 5 inbound messages per second per connection.
const SUBSCRIBE_PACING: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BinanceAdapter {
    market: MarketType,
}

impl BinanceAdapter {
    pub fn new(market: MarketType) -> Self {
        Self { market }
    }

    fn stream_name(symbol: &str, timeframe: Timeframe) -> String {
        format!("{}@kline_{}", symbol.to_lowercase(), timeframe.as_str())
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn market(&self) -> MarketType {
        self.market
    }

    fn ws_url(&self) -> String {
        match self.market {
            MarketType::Spot => "wss://stream.binance.com:9443/ws",
            MarketType::Linear => "wss://fstream.binance.com/ws",
            MarketType::Inverse => "wss://dstream.binance.com/ws",
        }
        .to_string()
    }

    fn supports(&self, _timeframe: Timeframe) -> bool {
        true
    }

    fn subscribe_requests(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        first_id: u64,
    ) -> Vec<SubscribeRequest> {
        symbols
            .iter()
            .enumerate()
            .map(|(i, sym)| {
                let id = first_id + i as u64;
                let payload = json!({
                    "method": "SUBSCRIBE",
                    "params": [Self::stream_name(sym, timeframe)],
                    "id": id,
                });
                SubscribeRequest {
                    id,
                    symbols: vec![sym.clone()],
                    payload: payload.to_string(),
                }
            })
            .collect()
    }

    fn subscribe_pacing(&self) -> Option<Duration> {
        Some(SUBSCRIBE_PACING)
    }

    fn decode(&self, text: &str) -> Decoded {
        let Ok(root) = serde_json::from_str::<Value>(text) else {
            return Decoded::Ignore;
        };
        // Combined-stream envelope or direct payload.
        let data = root.get("data").unwrap_or(&root);

        if data.get("e").and_then(Value::as_str) == Some("kline") {
            return match data.get("k").and_then(Value::as_object) {
                Some(k) => Decoded::Frames(vec![k.clone()]),
                None => Decoded::Ignore,
            };
        }

        let id = root.get("id").and_then(Value::as_u64);
        if let Some(err) = root.get("error") {
            let reason = err
                .get("msg")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Decoded::Rejected {
                id,
                symbol: None,
                reason,
            };
        }
        if root.get("result").is_some() && id.is_some() {
            return Decoded::Ack { id };
        }
        Decoded::Ignore
    }

    fn rest_base_url(&self) -> String {
        match self.market {
            MarketType::Spot => "https://api.binance.com/api/v3",
            MarketType::Linear => "https://fapi.binance.com/fapi/v1",
            MarketType::Inverse => "https://dapi.binance.com/dapi/v1",
        }
        .to_string()
    }

    fn page_limit(&self) -> u32 {
        1000
    }

    fn quota(&self) -> RateQuota {
        let requests = match self.market {
            MarketType::Spot => 1000,
            MarketType::Linear | MarketType::Inverse => 400,
        };
        RateQuota {
            requests,
            per: Duration::from_secs(60),
        }
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
            url: format!("{}/klines", self.rest_base_url()),
            query: vec![
                ("symbol", symbol.to_uppercase()),
                ("interval", timeframe.as_str().to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
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
        let Some(rows) = body.as_array() else {
            if let Some(code) = body.get("code") {
                return Err(BackfillError::Api {
                    exchange: self.id().to_string(),
                    code: code.to_string(),
                    message: body
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            return Err(BackfillError::Decode(format!(
                "binance klines response is not an array: {body}"
            )));
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(arr) = row.as_array().filter(|a| a.len() >= 9) else {
                warn!(symbol, "skipping malformed kline entry");
                continue;
            };
            let closed = arr[6].as_i64().is_some_and(|close_time| close_time < now_ms);

            let mut fields = RawFields::new();
            fields.insert("s".into(), Value::from(symbol.to_uppercase()));
            fields.insert("i".into(), Value::from(timeframe.as_str()));
            fields.insert("t".into(), nth(arr, 0));
            fields.insert("o".into(), nth(arr, 1));
            fields.insert("h".into(), nth(arr, 2));
            fields.insert("l".into(), nth(arr, 3));
            fields.insert("c".into(), nth(arr, 4));
            fields.insert("v".into(), nth(arr, 5));
            fields.insert("q".into(), nth(arr, 7));
            fields.insert("n".into(), nth(arr, 8));
            fields.insert("x".into(), Value::Bool(closed));
            out.push(fields);
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
    fn urls_follow_market_type() {
        assert_eq!(
            BinanceAdapter::new(MarketType::Linear).ws_url(),
            "wss://fstream.binance.com/ws"
        );
        assert_eq!(
            BinanceAdapter::new(MarketType::Inverse).rest_base_url(),
            "https://dapi.binance.com/dapi/v1"
        );
        assert_eq!(BinanceAdapter::new(MarketType::Spot).quota().requests, 1000);
    }

    #[test]
    fn one_subscribe_per_symbol_with_ids() {
        let a = BinanceAdapter::new(MarketType::Spot);
        let reqs = a.subscribe_requests(
            &["BTCUSDT".into(), "ETHUSDT".into()],
            Timeframe::M1,
            1,
        );
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].id, 2);
        assert_eq!(reqs[1].symbols, vec!["ETHUSDT".to_string()]);
        let v: Value = serde_json::from_str(&reqs[0].payload).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["params"][0], "btcusdt@kline_1m");
        assert_eq!(v["id"], 1);
    }

    #[test]
    fn decodes_kline_frame_through_resolver() {
        let a = BinanceAdapter::new(MarketType::Spot);
        let text = r#"{"e":"kline","E":1700000061000,"s":"BTCUSDT","k":{
            "t":1700000040000,"T":1700000099999,"s":"BTCUSDT","i":"1m",
            "o":"37000.00","h":"37050.00","l":"36990.00","c":"37020.00",
            "v":"123.456","q":"4567890.12","n":1500,"x":true,"V":"1","Q":"2"}}"#;
        let Decoded::Frames(frames) = a.decode(text) else {
            panic!("expected frames");
        };
        let candle = AliasResolver::standard()
            .unwrap()
            .resolve(&frames[0], "binance")
            .unwrap();
        assert_eq!(candle.close_time, 1_700_000_100_000);
        assert!(candle.is_closed);
        assert_eq!(candle.trade_count, 1500);
    }

    #[test]
    fn decodes_ack_and_error() {
        let a = BinanceAdapter::new(MarketType::Spot);
        assert_eq!(a.decode(r#"{"result":null,"id":3}"#), Decoded::Ack { id: Some(3) });
        assert_eq!(
            a.decode(r#"{"error":{"code":2,"msg":"Invalid request"},"id":4}"#),
            Decoded::Rejected {
                id: Some(4),
                symbol: None,
                reason: "Invalid request".into()
            }
        );
        assert_eq!(a.decode("not json"), Decoded::Ignore);
    }

    #[test]
    fn parses_rest_klines_and_flags_open_candle() {
        let a = BinanceAdapter::new(MarketType::Spot);
        let body: Value = serde_json::from_str(
            r#"[
              [1700000040000,"1.0","2.0","0.5","1.5","10.0",1700000099999,"15.0",7,"0","0","0"],
              [1700000100000,"1.5","1.6","1.4","1.5","1.0",1700000159999,"1.5",1,"0","0","0"]
            ]"#,
        )
        .unwrap();
        let rows = a
            .parse_klines("btcusdt", Timeframe::M1, &body, 1_700_000_120_000)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["x"], Value::Bool(true));
        assert_eq!(rows[1]["x"], Value::Bool(false));
        assert_eq!(rows[0]["s"], "BTCUSDT");
    }

    #[test]
    fn api_error_body_is_reported() {
        let a = BinanceAdapter::new(MarketType::Spot);
        let body: Value = serde_json::from_str(r#"{"code":-1121,"msg":"Invalid symbol."}"#).unwrap();
        assert!(matches!(
            a.parse_klines("X", Timeframe::M1, &body, 0),
            Err(BackfillError::Api { .. })
        ));
    }
}
