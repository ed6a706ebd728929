// =============================================================================
// Session — one instrument, one timeframe, one exchange
// =============================================================================
//
// Owns the timeline and the checkpointer, runs the historical backfill and
// spawns the live worker. `stop()` clears the running flag, waits for the
// worker to close its connection and writes the `final` snapshot exactly once.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointLabel, Checkpointer, SnapshotWriter};
use crate::config::StreamerConfig;
use crate::exchange::ExchangeAdapter;
use crate::historical::{HistoricalSync, HttpClient};
use crate::live::{
    CandleObserver, ControllerOptions, FeedState, LiveFeedController, PushTransport,
};
use crate::market_data::{Candle, Timeline};
use crate::types::{Exchange, Timeframe};

pub struct Session {
    id: Uuid,
    symbol: String,
    timeframe: Timeframe,
    adapter: &'static dyn ExchangeAdapter,
    timeline: Arc<Timeline>,
    checkpointer: Checkpointer,
    options: ControllerOptions,
    observer: Option<CandleObserver>,
    running: watch::Sender<bool>,
    state: watch::Receiver<FeedState>,
    state_tx: Mutex<Option<watch::Sender<FeedState>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Session {
    pub fn new(config: &StreamerConfig, writer: Arc<dyn SnapshotWriter>) -> Self {
        let adapter = config.exchange.adapter();
        if !adapter.has_native_interval(config.timeframe) {
            warn!(
                exchange = %config.exchange,
                timeframe = %config.timeframe,
                fallback = adapter.default_interval(),
                "timeframe not offered by exchange, streaming default interval"
            );
        }

        let (running, _) = watch::channel(false);
        let (state_tx, state) = watch::channel(FeedState::Disconnected);

        Self {
            id: Uuid::new_v4(),
            symbol: config.symbol.clone(),
            timeframe: config.timeframe,
            adapter,
            timeline: Arc::new(Timeline::new(config.max_candles, config.revision_policy)),
            checkpointer: Checkpointer::new(
                writer,
                &config.output_dir,
                &config.symbol,
                config.timeframe,
            ),
            options: ControllerOptions {
                reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
                idle_timeout: Duration::from_secs(config.idle_timeout_secs),
                ..ControllerOptions::default()
            },
            observer: None,
            running,
            state,
            state_tx: Mutex::new(Some(state_tx)),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register the callback for accepted live candles. Must be set before
    /// `start_live`.
    pub fn on_candle(&mut self, observer: impl Fn(&Candle) + Send + Sync + 'static) {
        self.observer = Some(Arc::new(observer));
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn exchange(&self) -> Exchange {
        self.adapter.exchange()
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Snapshot of the current timeline, oldest first.
    pub fn candles(&self) -> Vec<Candle> {
        self.timeline.to_vec()
    }

    pub fn feed_state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Receiver that follows every live state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Backfill up to `limit` bars. See [`HistoricalSync::sync`].
    pub async fn sync_historical(&self, http: &dyn HttpClient, limit: usize) -> Vec<Candle> {
        HistoricalSync::new(
            self.adapter,
            http,
            &self.symbol,
            self.timeframe,
            &self.timeline,
            &self.checkpointer,
        )
        .sync(limit)
        .instrument(info_span!("historical", session = %self.id))
        .await
    }

    /// Spawn the live worker. Returns `false` when the session is already
    /// streaming or has been stopped.
    pub fn start_live(&self, transport: Arc<dyn PushTransport>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(session = %self.id, "session already stopped, live feed not started");
            return false;
        }
        let Some(state_tx) = self.state_tx.lock().take() else {
            warn!(session = %self.id, "live feed already started");
            return false;
        };

        self.running.send_replace(true);
        let controller = LiveFeedController::new(
            self.adapter,
            self.symbol.clone(),
            self.timeframe,
            transport,
            self.timeline.clone(),
            self.checkpointer.clone(),
            self.observer.clone(),
            self.options,
            state_tx,
            self.running.subscribe(),
        );

        let span = info_span!(
            "live",
            session = %self.id,
            exchange = %self.adapter.exchange(),
            symbol = %self.symbol,
            timeframe = %self.timeframe
        );
        let handle = tokio::spawn(controller.run().instrument(span));
        *self.worker.lock() = Some(handle);
        true
    }

    /// Stop streaming and write the `final` snapshot. Safe to call more than
    /// once; only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.running.send_replace(false);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!(session = %self.id, error = %e, "live worker ended abnormally");
            }
        }

        match self.checkpointer.checkpoint(&self.timeline, CheckpointLabel::Final) {
            Ok(_) => info!(session = %self.id, candles = self.timeline.len(), "session stopped"),
            Err(e) => warn!(session = %self.id, error = %e, "final checkpoint failed"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("symbol", &self.symbol)
            .field("timeframe", &self.timeframe)
            .field("exchange", &self.adapter.exchange())
            .field("timeline", &self.timeline)
            .finish()
    }
}
