// =============================================================================
// OKX v5 (perpetual swaps) — candles REST + public WebSocket
// =============================================================================
//
// REST:  GET /api/v5/market/candles -> { code: "0", msg, data: [[ts, o, h, l,
//        c, vol, volCcy, volCcyQuote, confirm], ...] }, newest first.
// WS:    {"op":"subscribe","args":[{"channel":"candle1m","instId":"BTC-USDT-SWAP"}]}
//        -> { arg: { channel, instId }, data: [[ts, o, h, l, c, ..., confirm]] }
//
// The socket answers the text frame "ping" with a bare "pong".
// =============================================================================

use serde_json::{json, Value};

use super::{
    live_candle, parse_body, parse_frame, parse_kline_rows, ExchangeAdapter, HistoricalRequest,
    Inbound, Subscription,
};
use crate::error::FeedError;
use crate::market_data::{Candle, CandleFields};
use crate::types::{Exchange, Timeframe};

const REST_URL: &str = "https://www.okx.com/api/v5/market/candles";
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

const CHANNEL_PREFIX: &str = "candle";

/// Length of the base asset assumed when splitting a concatenated symbol.
const BASE_ASSET_LEN: usize = 3;

// No 1-second candles on OKX: 1s falls back to the default interval.
const INTERVALS: &[(Timeframe, &str)] = &[
    (Timeframe::M1, "1m"),
    (Timeframe::M5, "5m"),
    (Timeframe::M15, "15m"),
    (Timeframe::H1, "1H"),
    (Timeframe::H4, "4H"),
    (Timeframe::D1, "1D"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct OkxAdapter;

impl OkxAdapter {
    fn channel(&self, timeframe: Timeframe) -> String {
        format!("{CHANNEL_PREFIX}{}", self.interval_code(timeframe))
    }
}

impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn interval_table(&self) -> &'static [(Timeframe, &'static str)] {
        INTERVALS
    }

    fn default_interval(&self) -> &'static str {
        "1m"
    }

    fn max_page_size(&self) -> usize {
        300
    }

    /// `BTCUSDT` -> `BTC-USDT-SWAP`.
    ///
    /// The split is positional: the first three characters are taken as the
    /// base asset. Symbols with longer bases (`DOGEUSDT`, `1000PEPEUSDT`)
    /// produce a wrong id; mapping those correctly needs OKX instrument
    /// metadata, which this crate does not load.
    fn instrument_id(&self, instrument: &str) -> String {
        let upper = instrument.to_uppercase();
        let split = upper
            .char_indices()
            .nth(BASE_ASSET_LEN)
            .map_or(upper.len(), |(idx, _)| idx);
        let (base, quote) = upper.split_at(split);
        format!("{base}-{quote}-SWAP")
    }

    fn subscription_topic(&self, timeframe: Timeframe, instrument: &str) -> String {
        format!("{}:{}", self.channel(timeframe), self.instrument_id(instrument))
    }

    fn stream_url(&self, _timeframe: Timeframe, _instrument: &str) -> String {
        WS_URL.to_string()
    }

    fn subscribe_payload(&self, timeframe: Timeframe, instrument: &str) -> Option<String> {
        Some(
            json!({
                "op": "subscribe",
                "args": [{
                    "channel": self.channel(timeframe),
                    "instId": self.instrument_id(instrument),
                }]
            })
            .to_string(),
        )
    }

    fn heartbeat_payload(&self) -> Option<String> {
        Some("ping".to_string())
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
                ("instId".into(), self.instrument_id(instrument)),
                ("bar".into(), self.interval_code(timeframe).into()),
                ("limit".into(), limit.to_string()),
            ],
        }
    }

    fn parse_historical_batch(&self, raw: &str) -> Result<Vec<Candle>, FeedError> {
        let body = parse_body(Exchange::Okx, raw)?;

        if let Some(code) = body.get("code").and_then(Value::as_str) {
            if code != "0" {
                let msg = body.get("msg").and_then(Value::as_str).unwrap_or("");
                return Err(FeedError::invalid_response(
                    "okx",
                    format!("code {code}: {msg}"),
                ));
            }
        }

        let data = body
            .get("data")
            .ok_or_else(|| FeedError::invalid_response("okx", "missing data"))?;

        parse_kline_rows(Exchange::Okx, data)
    }

    fn classify_live_message(
        &self,
        raw: &str,
        subscription: &Subscription,
    ) -> Result<Inbound, FeedError> {
        if raw.trim() == "pong" {
            return Ok(Inbound::Pong);
        }
        let Some(frame) = parse_frame(raw) else {
            return Ok(Inbound::Ignored);
        };

        match frame.get("event").and_then(Value::as_str) {
            Some("subscribe") => return Ok(Inbound::SubscribeAck),
            Some("error") => {
                let msg = frame.get("msg").and_then(Value::as_str).unwrap_or("");
                return Ok(Inbound::SubscribeRejected(msg.to_string()));
            }
            Some(_) => return Ok(Inbound::Ignored),
            None => {}
        }

        let arg = &frame["arg"];
        let channel_matches = arg
            .get("channel")
            .and_then(Value::as_str)
            .and_then(|c| c.strip_prefix(CHANNEL_PREFIX))
            == Some(subscription.interval);
        let inst_matches =
            arg.get("instId").and_then(Value::as_str) == Some(subscription.instrument_id.as_str());
        if !channel_matches || !inst_matches {
            return Ok(Inbound::Ignored);
        }

        let Some(row) = frame
            .get("data")
            .and_then(Value::as_array)
            .and_then(|d| d.first())
            .and_then(Value::as_array)
        else {
            return Ok(Inbound::Ignored);
        };

        // Element 8 is "0" while the bar is open and "1" once it closes.
        let confirmed = row
            .get(8)
            .and_then(Value::as_str)
            .map_or(true, |flag| flag == "1");
        let candle = Candle::from_fields(CandleFields::from_array(row, confirmed)?)?;

        Ok(live_candle(Exchange::Okx, candle))
    }
}
