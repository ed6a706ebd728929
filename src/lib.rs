// =============================================================================
// candle-feed — OHLCV backfill and live streaming for one instrument
// =============================================================================
//
// Layout, leaves first:
//   market_data  canonical Candle + bounded Timeline
//   exchange     Bybit / Binance / OKX payload adapters
//   historical   one-shot REST backfill
//   live         reconnecting WebSocket feed
//   checkpoint   CSV snapshots of the timeline
//   session      ties the above together for one (symbol, timeframe, exchange)
// =============================================================================

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod exchange;
pub mod historical;
pub mod live;
pub mod market_data;
pub mod session;
pub mod types;

pub use checkpoint::{CheckpointLabel, Checkpointer, CsvSnapshotWriter, SnapshotWriter};
pub use config::{CliArgs, StreamerConfig};
pub use error::FeedError;
pub use exchange::{ExchangeAdapter, Inbound};
pub use historical::{HistoricalSync, HttpClient, ReqwestHttpClient};
pub use live::{FeedState, LiveFeedController, PushTransport, TungsteniteTransport};
pub use market_data::{Candle, RevisionPolicy, Timeline};
pub use session::Session;
pub use types::{Exchange, Timeframe};
