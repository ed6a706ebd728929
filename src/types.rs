// =============================================================================
// Shared types used across the candle feed
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Logical aggregation window of a candle, independent of how any exchange
/// names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1D")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Self::S1,
        Self::M1,
        Self::M5,
        Self::M15,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1D",
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M1
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| FeedError::UnsupportedTimeframe(s.to_string()))
    }
}

/// Supported candle sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bybit,
    Binance,
    Okx,
}

impl Exchange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bybit => "bybit",
            Self::Binance => "binance",
            Self::Okx => "okx",
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::Bybit
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bybit" => Ok(Self::Bybit),
            "binance" => Ok(Self::Binance),
            "okx" => Ok(Self::Okx),
            _ => Err(FeedError::UnsupportedExchange(s.to_string())),
        }
    }
}
