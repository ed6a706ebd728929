// =============================================================================
// Binance USDⓈ-M Futures — kline REST + single-stream WebSocket
// =============================================================================
//
// REST:  GET /fapi/v1/klines -> [[openTime, open, high, low, close, volume,
//        closeTime, quoteVolume, trades, takerBuyBase, takerBuyQuote, _], ...]
// WS:    wss://fstream.binance.com/ws/<symbol>@kline_<interval>
//        -> { "e": "kline", "s": "BTCUSDT", "k": { t, i, o, h, l, c, v, x, ... } }
//
// The subscription is part of the URL, so no subscribe frame is sent.
// =============================================================================

use serde_json::Value;

use super::{
    live_candle, parse_body, parse_frame, parse_kline_rows, ExchangeAdapter, HistoricalRequest,
    Inbound, Subscription,
};
use crate::error::FeedError;
use crate::market_data::{Candle, CandleFields};
use crate::types::{Exchange, Timeframe};

const REST_URL: &str = "https://fapi.binance.com/fapi/v1/klines";
const WS_URL: &str = "wss://fstream.binance.com/ws";

const INTERVALS: &[(Timeframe, &str)] = &[
    (Timeframe::S1, "1s"),
    (Timeframe::M1, "1m"),
    (Timeframe::M5, "5m"),
    (Timeframe::M15, "15m"),
    (Timeframe::H1, "1h"),
    (Timeframe::H4, "4h"),
    (Timeframe::D1, "1d"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceAdapter;

impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn interval_table(&self) -> &'static [(Timeframe, &'static str)] {
        INTERVALS
    }

    fn default_interval(&self) -> &'static str {
        "1m"
    }

    fn max_page_size(&self) -> usize {
        1500
    }

    fn instrument_id(&self, instrument: &str) -> String {
        instrument.to_uppercase()
    }

    fn subscription_topic(&self, timeframe: Timeframe, instrument: &str) -> String {
        format!(
            "{}@kline_{}",
            instrument.to_lowercase(),
            self.interval_code(timeframe)
        )
    }

    fn stream_url(&self, timeframe: Timeframe, instrument: &str) -> String {
        format!("{WS_URL}/{}", self.subscription_topic(timeframe, instrument))
    }

    fn subscribe_payload(&self, _timeframe: Timeframe, _instrument: &str) -> Option<String> {
        None
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
                ("symbol".into(), self.instrument_id(instrument)),
                ("interval".into(), self.interval_code(timeframe).into()),
                ("limit".into(), limit.to_string()),
            ],
        }
    }

    fn parse_historical_batch(&self, raw: &str) -> Result<Vec<Candle>, FeedError> {
        let body = parse_body(Exchange::Binance, raw)?;

        // Errors come back as {"code": -1121, "msg": "Invalid symbol."}.
        if let Some(msg) = body.get("msg").and_then(Value::as_str) {
            return Err(FeedError::invalid_response("binance", msg));
        }
        if !body.is_array() {
            return Err(FeedError::invalid_response(
                "binance",
                "klines response is not an array",
            ));
        }

        parse_kline_rows(Exchange::Binance, &body)
    }

    fn classify_live_message(
        &self,
        raw: &str,
        subscription: &Subscription,
    ) -> Result<Inbound, FeedError> {
        let Some(frame) = parse_frame(raw) else {
            return Ok(Inbound::Ignored);
        };

        // Combined-stream envelope: { "stream": ..., "data": { ... } }.
        let data = frame.get("data").unwrap_or(&frame);

        // Replies to SUBSCRIBE requests: {"result":null,"id":1} or an error.
        if data.get("id").is_some() {
            if let Some(msg) = data
                .get("error")
                .and_then(|e| e.get("msg"))
                .and_then(Value::as_str)
            {
                return Ok(Inbound::SubscribeRejected(msg.to_string()));
            }
            if data.get("result").is_some() {
                return Ok(Inbound::SubscribeAck);
            }
        }

        let Some(k) = data.get("k") else {
            return Ok(Inbound::Ignored);
        };

        if k.get("i").and_then(Value::as_str) != Some(subscription.interval) {
            return Ok(Inbound::Ignored);
        }
        if let Some(symbol) = data.get("s").and_then(Value::as_str) {
            if !symbol.eq_ignore_ascii_case(&subscription.instrument_id) {
                return Ok(Inbound::Ignored);
            }
        }

        let confirmed = k.get("x").and_then(Value::as_bool).unwrap_or(false);
        let candle = Candle::from_fields(CandleFields {
            timestamp: &k["t"],
            open: &k["o"],
            high: &k["h"],
            low: &k["l"],
            close: &k["c"],
            volume: &k["v"],
            confirmed,
        })?;

        Ok(live_candle(Exchange::Binance, candle))
    }
}
