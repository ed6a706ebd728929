// =============================================================================
// Historical Sync — one bounded kline backfill seeding the timeline
// =============================================================================
//
// A failed backfill is not fatal: it is logged, the timeline is left as it
// was, and the caller gets an empty vector. Live streaming can still start.
// =============================================================================

pub mod http;

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointLabel, Checkpointer};
use crate::error::{snippet, FeedError};
use crate::exchange::ExchangeAdapter;
use crate::market_data::{Candle, Timeline};
use crate::types::Timeframe;

pub use http::{HttpClient, HttpResponse, ReqwestHttpClient};

/// Timeout applied to every historical request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Backfills one (instrument, timeframe) series through an exchange adapter.
pub struct HistoricalSync<'a> {
    adapter: &'static dyn ExchangeAdapter,
    http: &'a dyn HttpClient,
    instrument: &'a str,
    timeframe: Timeframe,
    timeline: &'a Timeline,
    checkpointer: &'a Checkpointer,
}

impl<'a> HistoricalSync<'a> {
    pub fn new(
        adapter: &'static dyn ExchangeAdapter,
        http: &'a dyn HttpClient,
        instrument: &'a str,
        timeframe: Timeframe,
        timeline: &'a Timeline,
        checkpointer: &'a Checkpointer,
    ) -> Self {
        Self {
            adapter,
            http,
            instrument,
            timeframe,
            timeline,
            checkpointer,
        }
    }

    /// Requested bar count bounded to what the exchange serves in one page.
    pub fn clamp_limit(&self, limit: usize) -> usize {
        limit.clamp(1, self.adapter.max_page_size())
    }

    /// Fetch, parse and order up to `limit` bars without touching the
    /// timeline. The result is sorted ascending and holds at most
    /// `min(limit, max_page_size)` of the most recent bars.
    pub async fn fetch(&self, limit: usize) -> Result<Vec<Candle>, FeedError> {
        let exchange = self.adapter.exchange();
        let limit = self.clamp_limit(limit);
        let req = self
            .adapter
            .historical_request(self.timeframe, self.instrument, limit);

        debug!(exchange = %exchange, url = %req.url, limit, "requesting klines");
        let resp = self.http.get(&req.url, &req.query, HTTP_TIMEOUT).await?;

        if !resp.is_success() {
            return Err(FeedError::invalid_response(
                exchange.as_str(),
                format!("HTTP {}: {}", resp.status, snippet(&resp.body)),
            ));
        }

        let mut candles = self.adapter.parse_historical_batch(&resp.body)?;

        // Not every exchange returns oldest-first.
        candles.sort_by_key(|c| c.timestamp);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }

        let inconsistent = candles.iter().filter(|c| !c.is_consistent()).count();
        if inconsistent > 0 {
            debug!(exchange = %exchange, inconsistent, "bars with OHLC outside low..high kept as reported");
        }

        Ok(candles)
    }

    /// Backfill the timeline and take a `historical` checkpoint.
    ///
    /// Returns the loaded candles, or an empty vector when the fetch failed.
    pub async fn sync(&self, limit: usize) -> Vec<Candle> {
        let exchange = self.adapter.exchange();
        info!(
            exchange = %exchange,
            symbol = %self.instrument,
            timeframe = %self.timeframe,
            limit,
            "fetching historical candles"
        );

        let candles = match self.fetch(limit).await {
            Ok(candles) => candles,
            Err(e) => {
                error!(
                    exchange = %exchange,
                    timeframe = %self.timeframe,
                    error = %e,
                    "historical fetch failed"
                );
                return Vec::new();
            }
        };

        self.timeline.replace_all(candles.clone());
        if let Err(e) = self
            .checkpointer
            .checkpoint(self.timeline, CheckpointLabel::Historical)
        {
            warn!(error = %e, "historical checkpoint failed");
        }

        info!(count = candles.len(), "historical candles loaded");
        candles
    }
}
