// =============================================================================
// Exchange Adapters — per-source wire shapes behind one capability trait
// =============================================================================
//
// Each adapter is a stateless unit struct: interval tables, endpoints and
// payload parsers. The variant is selected once, at session construction, via
// `Exchange::adapter()`; nothing on the message path compares exchange names.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod okx;

use serde_json::Value;
use tracing::debug;

use crate::error::FeedError;
use crate::market_data::{Candle, CandleFields};
use crate::types::{Exchange, Timeframe};

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use okx::OkxAdapter;

/// Classification of one inbound push message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A kline update for the subscribed topic.
    Candle(Candle),
    SubscribeAck,
    SubscribeRejected(String),
    Pong,
    /// Anything else multiplexed over the socket (other topics, notices,
    /// non-JSON frames).
    Ignored,
}

/// Subscription identifiers resolved once per feed, so the message path only
/// compares strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Native interval token (after any fallback).
    pub interval: &'static str,
    pub instrument_id: String,
    pub topic: String,
}

/// One REST call: endpoint plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

/// Capability set every supported exchange provides.
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Native interval token for every timeframe this exchange supports.
    fn interval_table(&self) -> &'static [(Timeframe, &'static str)];

    /// Token used when a timeframe is missing from [`interval_table`].
    ///
    /// [`interval_table`]: ExchangeAdapter::interval_table
    fn default_interval(&self) -> &'static str;

    /// Largest `limit` the kline REST endpoint accepts.
    fn max_page_size(&self) -> usize;

    fn instrument_id(&self, instrument: &str) -> String;

    fn subscription_topic(&self, timeframe: Timeframe, instrument: &str) -> String;

    /// Push endpoint to connect to for this subscription.
    fn stream_url(&self, timeframe: Timeframe, instrument: &str) -> String;

    /// Text frame sent right after the connection opens. `None` when the
    /// subscription is expressed by the URL alone.
    fn subscribe_payload(&self, timeframe: Timeframe, instrument: &str) -> Option<String>;

    /// Application-level keepalive frame, if the exchange requires one.
    fn heartbeat_payload(&self) -> Option<String> {
        None
    }

    fn historical_request(
        &self,
        timeframe: Timeframe,
        instrument: &str,
        limit: usize,
    ) -> HistoricalRequest;

    /// Parse a whole kline REST body. Candles come back in payload order and
    /// are always `confirmed`. Any missing envelope or malformed record fails
    /// the entire batch.
    fn parse_historical_batch(&self, raw: &str) -> Result<Vec<Candle>, FeedError>;

    fn classify_live_message(
        &self,
        raw: &str,
        subscription: &Subscription,
    ) -> Result<Inbound, FeedError>;

    // -------------------------------------------------------------------------
    // Provided
    // -------------------------------------------------------------------------

    fn has_native_interval(&self, timeframe: Timeframe) -> bool {
        self.interval_table().iter().any(|(tf, _)| *tf == timeframe)
    }

    /// Interval token for `timeframe`, falling back to the default interval
    /// when the exchange has no native granularity for it.
    fn interval_code(&self, timeframe: Timeframe) -> &'static str {
        match self.interval_table().iter().find(|(tf, _)| *tf == timeframe) {
            Some((_, code)) => *code,
            None => {
                debug!(
                    exchange = %self.exchange(),
                    timeframe = %timeframe,
                    fallback = self.default_interval(),
                    "timeframe not offered natively, using default interval"
                );
                self.default_interval()
            }
        }
    }

    /// Resolve interval, instrument id and topic for one subscription.
    fn subscription(&self, timeframe: Timeframe, instrument: &str) -> Subscription {
        Subscription {
            interval: self.interval_code(timeframe),
            instrument_id: self.instrument_id(instrument),
            topic: self.subscription_topic(timeframe, instrument),
        }
    }

    /// `Some(candle)` for a kline on the subscribed topic, `None` for anything
    /// else. A matching record with bad numbers is a `MalformedCandle`.
    ///
    /// Resolves the subscription on every call; long-lived feeds keep a
    /// [`Subscription`] and call [`classify_live_message`] instead.
    ///
    /// [`classify_live_message`]: ExchangeAdapter::classify_live_message
    fn parse_live_message(
        &self,
        raw: &str,
        timeframe: Timeframe,
        instrument: &str,
    ) -> Result<Option<Candle>, FeedError> {
        let subscription = self.subscription(timeframe, instrument);
        match self.classify_live_message(raw, &subscription)? {
            Inbound::Candle(candle) => Ok(Some(candle)),
            _ => Ok(None),
        }
    }
}

static BYBIT: BybitAdapter = BybitAdapter;
static BINANCE: BinanceAdapter = BinanceAdapter;
static OKX: OkxAdapter = OkxAdapter;

impl Exchange {
    pub fn adapter(self) -> &'static dyn ExchangeAdapter {
        match self {
            Self::Bybit => &BYBIT,
            Self::Binance => &BINANCE,
            Self::Okx => &OKX,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared parsing helpers
// ---------------------------------------------------------------------------

/// Parse a push frame, treating non-JSON text as "not for us".
fn parse_frame(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}

fn parse_body(exchange: Exchange, raw: &str) -> Result<Value, FeedError> {
    serde_json::from_str(raw)
        .map_err(|e| FeedError::invalid_response(exchange.as_str(), format!("body is not JSON: {e}")))
}

/// Wrap a parsed live kline, noting bars whose OHLC falls outside low..high.
fn live_candle(exchange: Exchange, candle: Candle) -> Inbound {
    if !candle.is_consistent() {
        debug!(
            exchange = %exchange,
            timestamp = %candle.timestamp,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            "live bar with OHLC outside low..high kept as reported"
        );
    }
    Inbound::Candle(candle)
}

/// Parse a REST kline list of `[ts, o, h, l, c, v, ...]` arrays.
fn parse_kline_rows(exchange: Exchange, rows: &Value) -> Result<Vec<Candle>, FeedError> {
    let rows = rows
        .as_array()
        .ok_or_else(|| FeedError::invalid_response(exchange.as_str(), "kline list is not an array"))?;

    rows.iter()
        .map(|row| {
            let arr = row
                .as_array()
                .ok_or_else(|| FeedError::malformed("kline", row))?;
            Candle::from_fields(CandleFields::from_array(arr, true)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    const DOCUMENTED: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    #[test]
    fn interval_codes_are_in_each_vocabulary() {
        let vocab: [(Exchange, &[&str]); 3] = [
            (Exchange::Bybit, &["1", "3", "5", "15", "30", "60", "120", "240", "360", "720", "D", "W", "M"]),
            (Exchange::Binance, &["1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M"]),
            (Exchange::Okx, &["1m", "3m", "5m", "15m", "30m", "1H", "2H", "4H", "6H", "12H", "1D", "1W", "1M"]),
        ];
        for (exchange, words) in vocab {
            let adapter = exchange.adapter();
            for tf in DOCUMENTED {
                let code = adapter.interval_code(tf);
                assert!(words.contains(&code), "{exchange} {tf} -> {code}");
            }
            assert!(words.contains(&adapter.default_interval()));
        }
    }

    #[test]
    fn one_second_fallback_is_deterministic() {
        // Bybit maps 1s onto its 1-minute token, Binance has a real 1s
        // stream, OKX has none and falls back to its default.
        assert_eq!(Exchange::Bybit.adapter().interval_code(Timeframe::S1), "1");
        assert_eq!(Exchange::Binance.adapter().interval_code(Timeframe::S1), "1s");
        let okx = Exchange::Okx.adapter();
        assert!(!okx.has_native_interval(Timeframe::S1));
        assert_eq!(okx.interval_code(Timeframe::S1), okx.default_interval());
        assert_eq!(okx.interval_code(Timeframe::S1), "1m");
    }

    #[test]
    fn page_sizes_differ_per_exchange() {
        assert_eq!(Exchange::Bybit.adapter().max_page_size(), 1000);
        assert_eq!(Exchange::Binance.adapter().max_page_size(), 1500);
        assert_eq!(Exchange::Okx.adapter().max_page_size(), 300);
    }

    #[test]
    fn subscription_resolves_identifiers_up_front() {
        let okx = Exchange::Okx.adapter().subscription(Timeframe::S1, "btcusdt");
        assert_eq!(okx.interval, "1m");
        assert_eq!(okx.instrument_id, "BTC-USDT-SWAP");
        assert_eq!(okx.topic, "candle1m:BTC-USDT-SWAP");

        let bybit = Exchange::Bybit.adapter().subscription(Timeframe::H4, "BTCUSDT");
        assert_eq!(bybit.topic, "kline.240.BTCUSDT");

        let binance = Exchange::Binance.adapter().subscription(Timeframe::M5, "btcusdt");
        assert_eq!(binance.interval, "5m");
        assert_eq!(binance.instrument_id, "BTCUSDT");
        assert_eq!(binance.topic, "btcusdt@kline_5m");
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn inconsistent_live_bar_is_kept_and_logged() {
        let raw = json!({
            "topic": "kline.1.BTCUSDT",
            "data": [{
                "start": 60_000,
                "open": "10",
                "high": "9",
                "low": "8",
                "close": "9.5",
                "volume": "1",
                "confirm": true
            }]
        })
        .to_string();

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let adapter = Exchange::Bybit.adapter();
        let subscription = adapter.subscription(Timeframe::M1, "BTCUSDT");
        let classified = tracing::subscriber::with_default(subscriber, || {
            adapter.classify_live_message(&raw, &subscription)
        });

        match classified {
            Ok(Inbound::Candle(candle)) => assert!(!candle.is_consistent()),
            other => panic!("expected a candle, got {other:?}"),
        }
        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("OHLC outside low..high"), "{output}");
    }

    #[test]
    fn adapter_lookup_matches_variant() {
        for exchange in [Exchange::Bybit, Exchange::Binance, Exchange::Okx] {
            assert_eq!(exchange.adapter().exchange(), exchange);
        }
    }
}
