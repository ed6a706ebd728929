use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar, normalized from any supported exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar-open time as reported by the exchange (millisecond resolution).
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// `true` once the bar's window has closed. In-progress live bars may be
    /// revised at the same timestamp.
    pub confirmed: bool,
}

/// Exchange-native fields of one record, already located inside the payload.
///
/// Exchanges disagree on whether numbers travel as JSON strings or numbers,
/// so every field is taken as a raw JSON value.
#[derive(Debug, Clone, Copy)]
pub struct CandleFields<'a> {
    pub timestamp: &'a serde_json::Value,
    pub open: &'a serde_json::Value,
    pub high: &'a serde_json::Value,
    pub low: &'a serde_json::Value,
    pub close: &'a serde_json::Value,
    pub volume: &'a serde_json::Value,
    pub confirmed: bool,
}

impl<'a> CandleFields<'a> {
    /// Fields laid out as `[ts, open, high, low, close, volume, ...]`, the
    /// kline array shape shared by all three REST APIs.
    pub fn from_array(arr: &'a [serde_json::Value], confirmed: bool) -> Result<Self, FeedError> {
        if arr.len() < 6 {
            return Err(FeedError::malformed(
                "kline",
                format!("{} elements", arr.len()),
            ));
        }
        Ok(Self {
            timestamp: &arr[0],
            open: &arr[1],
            high: &arr[2],
            low: &arr[3],
            close: &arr[4],
            volume: &arr[5],
            confirmed,
        })
    }
}

impl Candle {
    /// Build a candle from exchange-native fields.
    ///
    /// Fails with `MalformedCandle` when a numeric field cannot be parsed,
    /// the timestamp is out of range, or the volume is negative. The OHLC
    /// ordering is *not* enforced; see [`Candle::is_consistent`].
    pub fn from_fields(fields: CandleFields<'_>) -> Result<Self, FeedError> {
        let ms = parse_i64(fields.timestamp, "timestamp")?;
        let timestamp = timestamp_from_ms(ms)?;

        let volume = parse_f64(fields.volume, "volume")?;
        if volume < 0.0 {
            return Err(FeedError::malformed("volume", volume));
        }

        Ok(Self {
            timestamp,
            open: parse_f64(fields.open, "open")?,
            high: parse_f64(fields.high, "high")?,
            low: parse_f64(fields.low, "low")?,
            close: parse_f64(fields.close, "close")?,
            volume,
            confirmed: fields.confirmed,
        })
    }

    /// Bar-open time in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Whether `low <= {open, close} <= high` holds. Exchanges occasionally
    /// report bars that violate it, so this is informational only.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }
}

pub(crate) fn timestamp_from_ms(ms: i64) -> Result<DateTime<Utc>, FeedError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| FeedError::malformed("timestamp", ms))
}

/// Numbers arrive either as JSON strings (`"37000.5"`) or JSON numbers.
fn parse_f64(val: &serde_json::Value, name: &'static str) -> Result<f64, FeedError> {
    let parsed = match val {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(FeedError::malformed(name, val)),
    }
}

fn parse_i64(val: &serde_json::Value, name: &'static str) -> Result<i64, FeedError> {
    let parsed = match val {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    };
    parsed.ok_or_else(|| FeedError::malformed(name, val))
}

#[cfg(test)]
pub(crate) fn sample_candle(ts_ms: i64, close: f64, confirmed: bool) -> Candle {
    Candle {
        timestamp: timestamp_from_ms(ts_ms).unwrap(),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100.0,
        confirmed,
    }
}
