// =============================================================================
// Streamer Configuration — CLI flags over env over JSON file over defaults
// =============================================================================
//
// Every field carries a serde default so a config file only needs the keys it
// wants to change. Command-line flags and `CANDLE_FEED_*` environment variables
// are merged by clap; whatever they leave unset falls back to the file, then
// to the defaults below.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::FeedError;
use crate::market_data::{RevisionPolicy, DEFAULT_MAX_CANDLES};
use crate::types::{Exchange, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_bars() -> usize {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_max_candles() -> usize {
    DEFAULT_MAX_CANDLES
}

// =============================================================================
// StreamerConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Instrument symbol, upper case (`BTCUSDT`).
    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default)]
    pub timeframe: Timeframe,

    #[serde(default)]
    pub exchange: Exchange,

    /// Bars requested by the historical backfill (clamped to the exchange
    /// page size).
    #[serde(default = "default_bars")]
    pub bars: usize,

    /// Keep streaming after the backfill.
    #[serde(default)]
    pub live: bool,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub revision_policy: RevisionPolicy,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Timeline capacity.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: Timeframe::default(),
            exchange: Exchange::default(),
            bars: default_bars(),
            live: false,
            output_dir: default_output_dir(),
            revision_policy: RevisionPolicy::default(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_candles: default_max_candles(),
        }
    }
}

impl StreamerConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            exchange = %config.exchange,
            timeframe = %config.timeframe,
            "config file loaded"
        );

        Ok(config)
    }

    /// Build the effective configuration from parsed command-line arguments.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(symbol) = &args.symbol {
            config.symbol = symbol.clone();
        }
        if let Some(tf) = &args.timeframe {
            config.timeframe = tf.parse::<Timeframe>()?;
        }
        if let Some(exchange) = &args.exchange {
            config.exchange = exchange.parse::<Exchange>()?;
        }
        if let Some(bars) = args.bars {
            config.bars = bars;
        }
        if args.live {
            config.live = true;
        }
        if let Some(dir) = &args.output {
            config.output_dir = dir.clone();
        }
        if args.append_revisions {
            config.revision_policy = RevisionPolicy::AppendAll;
        }
        if let Some(secs) = args.reconnect_delay_secs {
            config.reconnect_delay_secs = secs;
        }
        if let Some(secs) = args.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        if let Some(max) = args.max_candles {
            config.max_candles = max;
        }

        config.symbol = config.symbol.trim().to_uppercase();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.symbol.is_empty() {
            return Err(FeedError::InvalidConfig("symbol must not be empty".into()));
        }
        if self.bars == 0 {
            return Err(FeedError::InvalidConfig("bars must be positive".into()));
        }
        if self.max_candles == 0 {
            return Err(FeedError::InvalidConfig("max_candles must be positive".into()));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(FeedError::InvalidConfig("reconnect_delay_secs must be positive".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(FeedError::InvalidConfig("idle_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Command-line surface
// =============================================================================

/// Flags shared by the binary. Each one can also come from the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct CliArgs {
    /// JSON config file; flags and env vars override its values.
    #[arg(short, long, env = "CANDLE_FEED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Instrument symbol [default: BTCUSDT]
    #[arg(short, long, env = "CANDLE_FEED_SYMBOL")]
    pub symbol: Option<String>,

    /// Candle timeframe: 1s, 1m, 5m, 15m, 1h, 4h, 1D [default: 1m]
    #[arg(short, long, env = "CANDLE_FEED_TIMEFRAME")]
    pub timeframe: Option<String>,

    /// Exchange: bybit, binance, okx [default: bybit]
    #[arg(short, long, env = "CANDLE_FEED_EXCHANGE")]
    pub exchange: Option<String>,

    /// Historical bars to fetch [default: 500]
    #[arg(short = 'n', long, env = "CANDLE_FEED_BARS")]
    pub bars: Option<usize>,

    /// Stream live candles after the backfill
    #[arg(short, long, env = "CANDLE_FEED_LIVE")]
    pub live: bool,

    /// Directory for CSV snapshots [default: data]
    #[arg(short, long, env = "CANDLE_FEED_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Store every live revision as its own row instead of replacing the tail
    #[arg(long, env = "CANDLE_FEED_APPEND_REVISIONS")]
    pub append_revisions: bool,

    /// Seconds to wait before reconnecting [default: 5]
    #[arg(long, env = "CANDLE_FEED_RECONNECT_DELAY_SECS")]
    pub reconnect_delay_secs: Option<u64>,

    /// Seconds without any message before the connection is recycled [default: 60]
    #[arg(long, env = "CANDLE_FEED_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Candles kept in memory [default: 10000]
    #[arg(long, env = "CANDLE_FEED_MAX_CANDLES")]
    pub max_candles: Option<usize>,
}
