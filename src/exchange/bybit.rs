// =============================================================================
// Bybit v5 (linear perpetuals) — kline REST + public WebSocket
// =============================================================================
//
// REST:  GET /v5/market/kline  -> { retCode, retMsg, result: { list: [[start,
//        open, high, low, close, volume, turnover], ...] } }, newest first.
// WS:    {"op":"subscribe","args":["kline.<interval>.<SYMBOL>"]}
//        -> { topic, data: [{ start, open, high, low, close, volume, confirm }] }
//
// Bybit has no 1-second klines; 1s maps onto the 1-minute token.
// =============================================================================

use serde_json::{json, Value};

use super::{
    live_candle, parse_body, parse_frame, parse_kline_rows, ExchangeAdapter, HistoricalRequest,
    Inbound, Subscription,
};
use crate::error::FeedError;
use crate::market_data::{Candle, CandleFields};
use crate::types::{Exchange, Timeframe};

const REST_URL: &str = "https://api.bybit.com/v5/market/kline";
const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

const INTERVALS: &[(Timeframe, &str)] = &[
    (Timeframe::S1, "1"),
    (Timeframe::M1, "1"),
    (Timeframe::M5, "5"),
    (Timeframe::M15, "15"),
    (Timeframe::H1, "60"),
    (Timeframe::H4, "240"),
    (Timeframe::D1, "D"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct BybitAdapter;

impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn interval_table(&self) -> &'static [(Timeframe, &'static str)] {
        INTERVALS
    }

    fn default_interval(&self) -> &'static str {
        "1"
    }

    fn max_page_size(&self) -> usize {
        1000
    }

    fn instrument_id(&self, instrument: &str) -> String {
        instrument.to_uppercase()
    }

    fn subscription_topic(&self, timeframe: Timeframe, instrument: &str) -> String {
        format!(
            "kline.{}.{}",
            self.interval_code(timeframe),
            self.instrument_id(instrument)
        )
    }

    fn stream_url(&self, _timeframe: Timeframe, _instrument: &str) -> String {
        WS_URL.to_string()
    }

    fn subscribe_payload(&self, timeframe: Timeframe, instrument: &str) -> Option<String> {
        let topic = self.subscription_topic(timeframe, instrument);
        Some(json!({ "op": "subscribe", "args": [topic] }).to_string())
    }

    fn heartbeat_payload(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }

    fn historical_request(
        &self,
        timeframe: Timeframe,
        instrument: &str,
        limit: usize,
    ) -> HistoricalRequest {
        HistoricalRequest {
            url: REST_URL.to_string(),
            query: vec![
                ("category".into(), "linear".into()),
                ("symbol".into(), self.instrument_id(instrument)),
                ("interval".into(), self.interval_code(timeframe).into()),
                ("limit".into(), limit.to_string()),
            ],
        }
    }

    fn parse_historical_batch(&self, raw: &str) -> Result<Vec<Candle>, FeedError> {
        let body = parse_body(Exchange::Bybit, raw)?;

        if let Some(code) = body.get("retCode").and_then(Value::as_i64) {
            if code != 0 {
                let msg = body.get("retMsg").and_then(Value::as_str).unwrap_or("");
                return Err(FeedError::invalid_response(
                    "bybit",
                    format!("retCode {code}: {msg}"),
                ));
            }
        }

        let list = body
            .get("result")
            .and_then(|r| r.get("list"))
            .ok_or_else(|| FeedError::invalid_response("bybit", "missing result.list"))?;

        parse_kline_rows(Exchange::Bybit, list)
    }

    fn classify_live_message(
        &self,
        raw: &str,
        subscription: &Subscription,
    ) -> Result<Inbound, FeedError> {
        let Some(frame) = parse_frame(raw) else {
            return Ok(Inbound::Ignored);
        };

        // Control frames: {"op":"ping","ret_msg":"pong",..} and
        // {"op":"subscribe","success":bool,"ret_msg":..}.
        if let Some(op) = frame.get("op").and_then(Value::as_str) {
            let ret_msg = frame.get("ret_msg").and_then(Value::as_str).unwrap_or("");
            return Ok(match op {
                "pong" => Inbound::Pong,
                "ping" if ret_msg == "pong" => Inbound::Pong,
                "subscribe" => {
                    if frame.get("success").and_then(Value::as_bool).unwrap_or(false) {
                        Inbound::SubscribeAck
                    } else {
                        Inbound::SubscribeRejected(ret_msg.to_string())
                    }
                }
                _ => Inbound::Ignored,
            });
        }

        let topic = frame.get("topic").and_then(Value::as_str).unwrap_or("");
        if topic != subscription.topic {
            return Ok(Inbound::Ignored);
        }

        let Some(k) = frame.get("data").and_then(Value::as_array).and_then(|d| d.first()) else {
            return Ok(Inbound::Ignored);
        };

        let confirmed = k.get("confirm").and_then(Value::as_bool).unwrap_or(false);
        let candle = Candle::from_fields(CandleFields {
            timestamp: &k["start"],
            open: &k["open"],
            high: &k["high"],
            low: &k["low"],
            close: &k["close"],
            volume: &k["volume"],
            confirmed,
        })?;

        Ok(live_candle(Exchange::Bybit, candle))
    }
}
