// =============================================================================
// Live Feed Controller — connection lifecycle for one streaming session
// =============================================================================
//
//   Disconnected -> Connecting -> Subscribed -> (Receiving <-> Subscribed) -> Closed
//
// Every closure (remote close, read error, failed send, idle timeout, failed
// connect) ends in Closed. While the session is running the controller waits
// the reconnect delay and goes back to Connecting, forever. Once the running
// flag drops it closes the connection and returns without reconnecting.
//
// Messages are handled synchronously, in arrival order: classify, push into the
// timeline, notify the observer, maybe checkpoint.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::transport::{PushConnection, PushEvent, PushTransport};
use crate::checkpoint::{CheckpointLabel, Checkpointer};
use crate::error::{snippet, FeedError};
use crate::exchange::{ExchangeAdapter, Inbound, Subscription};
use crate::market_data::{Candle, PushOutcome, Timeline};
use crate::types::Timeframe;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Callback invoked for every accepted live candle, on the feed task.
pub type CandleObserver = Arc<dyn Fn(&Candle) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Closed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Receiving => "receiving",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Timing knobs of the controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub reconnect_delay: Duration,
    /// A connection silent for this long is treated as dead.
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Why a connection ended.
#[derive(Debug)]
enum Closure {
    Stopped,
    Failed(FeedError),
}

/// Outcome of one wait inside the receive loop.
enum Step {
    Stop,
    Heartbeat,
    Event(PushEvent),
    Idle,
}

pub struct LiveFeedController {
    adapter: &'static dyn ExchangeAdapter,
    instrument: String,
    timeframe: Timeframe,
    subscription: Subscription,
    transport: Arc<dyn PushTransport>,
    timeline: Arc<Timeline>,
    checkpointer: Checkpointer,
    observer: Option<CandleObserver>,
    options: ControllerOptions,
    state: watch::Sender<FeedState>,
    running: watch::Receiver<bool>,
}

impl LiveFeedController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: &'static dyn ExchangeAdapter,
        instrument: impl Into<String>,
        timeframe: Timeframe,
        transport: Arc<dyn PushTransport>,
        timeline: Arc<Timeline>,
        checkpointer: Checkpointer,
        observer: Option<CandleObserver>,
        options: ControllerOptions,
        state: watch::Sender<FeedState>,
        running: watch::Receiver<bool>,
    ) -> Self {
        let instrument = instrument.into();
        let subscription = adapter.subscription(timeframe, &instrument);
        Self {
            adapter,
            instrument,
            timeframe,
            subscription,
            transport,
            timeline,
            checkpointer,
            observer,
            options,
            state,
            running,
        }
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn set_state(&self, state: FeedState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            trace!(from = %prev, to = %state, "feed state");
        }
    }

    /// Drive the connection until the running flag is cleared.
    pub async fn run(self) {
        let exchange = self.adapter.exchange();
        let url = self.adapter.stream_url(self.timeframe, &self.instrument);
        let subscribe = self
            .adapter
            .subscribe_payload(self.timeframe, &self.instrument);
        let mut running = self.running.clone();

        while self.is_running() {
            self.set_state(FeedState::Connecting);

            let connected = tokio::select! {
                res = self.transport.connect(&url) => Some(res),
                _ = wait_for_stop(&mut running) => None,
            };

            let closure = match connected {
                None => Closure::Stopped,
                Some(Err(e)) => Closure::Failed(e),
                Some(Ok(mut conn)) => {
                    info!(
                        exchange = %exchange,
                        symbol = %self.instrument,
                        timeframe = %self.timeframe,
                        "connected"
                    );
                    self.receive(conn.as_mut(), subscribe.as_deref(), &mut running)
                        .await
                }
            };

            self.set_state(FeedState::Closed);
            match closure {
                Closure::Stopped => break,
                Closure::Failed(e) => {
                    error!(exchange = %exchange, error = %e, "live feed closed");
                }
            }
            if !self.is_running() {
                break;
            }

            warn!(
                delay_secs = self.options.reconnect_delay.as_secs_f64(),
                "reconnecting after delay"
            );
            let stopped = tokio::select! {
                _ = sleep(self.options.reconnect_delay) => false,
                _ = wait_for_stop(&mut running) => true,
            };
            if stopped {
                break;
            }
        }

        self.set_state(FeedState::Closed);
        info!(exchange = %exchange, "live feed stopped");
    }

    /// Subscribe on a fresh connection and pump messages until it ends.
    async fn receive(
        &self,
        conn: &mut dyn PushConnection,
        subscribe: Option<&str>,
        running: &mut watch::Receiver<bool>,
    ) -> Closure {
        if let Some(payload) = subscribe {
            if let Err(e) = conn.send(payload.to_string()).await {
                conn.close().await;
                return Closure::Failed(e);
            }
            debug!(payload = %payload, "subscribe request sent");
        }
        self.set_state(FeedState::Subscribed);

        let heartbeat = self.adapter.heartbeat_payload();
        let period = self.options.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // One deadline per connection, pushed back only by inbound events.
        let idle = sleep(self.options.idle_timeout);
        tokio::pin!(idle);

        loop {
            let step = tokio::select! {
                _ = wait_for_stop(running) => Step::Stop,
                _ = ticker.tick(), if heartbeat.is_some() => Step::Heartbeat,
                _ = &mut idle => Step::Idle,
                event = conn.next_event() => Step::Event(event),
            };

            if let Step::Event(_) = &step {
                idle.as_mut().reset(Instant::now() + self.options.idle_timeout);
            }

            match step {
                Step::Stop => {
                    conn.close().await;
                    return Closure::Stopped;
                }
                Step::Heartbeat => {
                    if let Some(ping) = &heartbeat {
                        if let Err(e) = conn.send(ping.clone()).await {
                            conn.close().await;
                            return Closure::Failed(e);
                        }
                        trace!("heartbeat sent");
                    }
                }
                Step::Idle => {
                    conn.close().await;
                    return Closure::Failed(FeedError::Transport(format!(
                        "no message for {}s",
                        self.options.idle_timeout.as_secs_f64()
                    )));
                }
                Step::Event(PushEvent::Message(text)) => {
                    self.set_state(FeedState::Receiving);
                    self.dispatch(&text);
                    self.set_state(FeedState::Subscribed);
                }
                Step::Event(PushEvent::Error(e)) => {
                    conn.close().await;
                    return Closure::Failed(FeedError::Transport(e));
                }
                Step::Event(PushEvent::Closed) => {
                    return Closure::Failed(FeedError::Transport("closed by remote".into()));
                }
            }
        }
    }

    /// Classify one inbound payload and act on it.
    fn dispatch(&self, raw: &str) {
        let classified = self.adapter.classify_live_message(raw, &self.subscription);

        match classified {
            Ok(Inbound::Candle(candle)) => self.accept(candle),
            Ok(Inbound::SubscribeAck) => info!(symbol = %self.instrument, "subscription confirmed"),
            Ok(Inbound::SubscribeRejected(reason)) => error!(
                exchange = %self.adapter.exchange(),
                timeframe = %self.timeframe,
                reason = %reason,
                "subscription rejected"
            ),
            Ok(Inbound::Pong) => trace!("pong"),
            Ok(Inbound::Ignored) => trace!(raw = %snippet(raw), "message ignored"),
            Err(e) => warn!(
                exchange = %self.adapter.exchange(),
                timeframe = %self.timeframe,
                error = %e,
                raw = %snippet(raw),
                "skipping malformed live candle"
            ),
        }
    }

    fn accept(&self, candle: Candle) {
        debug!(
            timestamp = %candle.timestamp,
            close = candle.close,
            confirmed = candle.confirmed,
            "candle update"
        );

        let (outcome, len) = self.timeline.push(candle.clone());

        if let Some(observer) = &self.observer {
            observer(&candle);
        }

        if outcome == PushOutcome::Appended && Checkpointer::live_due(len) {
            if let Err(e) = self.checkpointer.checkpoint(&self.timeline, CheckpointLabel::Live) {
                warn!(error = %e, "live checkpoint failed");
            }
        }
    }
}

/// Resolves once the running flag is `false` or its sender is gone.
async fn wait_for_stop(running: &mut watch::Receiver<bool>) {
    loop {
        if !*running.borrow_and_update() {
            return;
        }
        if running.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::checkpoint::SnapshotWriter;
    use crate::market_data::RevisionPolicy;
    use crate::types::Exchange;

    // -- fakes ---------------------------------------------------------------

    /// Shared record of what the controller did with the fake transport.
    #[derive(Default)]
    pub(crate) struct Wire {
        pub connects: AtomicUsize,
        pub sent: Mutex<Vec<String>>,
        pub closes: AtomicUsize,
    }

    /// Each `connect` pops the next scripted event list; when the script is
    /// exhausted the connection stays silent. An empty script list makes
    /// `connect` fail.
    pub(crate) struct FakeTransport {
        pub wire: Arc<Wire>,
        scripts: Mutex<VecDeque<Option<Vec<PushEvent>>>>,
    }

    impl FakeTransport {
        pub fn new(scripts: Vec<Option<Vec<PushEvent>>>) -> Self {
            Self {
                wire: Arc::new(Wire::default()),
                scripts: Mutex::new(scripts.into()),
            }
        }
    }

    #[async_trait]
    impl PushTransport for FakeTransport {
        async fn connect(&self, _url: &str) -> Result<Box<dyn PushConnection>, FeedError> {
            self.wire.connects.fetch_add(1, Ordering::SeqCst);
            match self.scripts.lock().pop_front() {
                Some(None) => Err(FeedError::Transport("connection refused".into())),
                Some(Some(events)) => Ok(Box::new(FakeConnection {
                    wire: self.wire.clone(),
                    events: events.into(),
                })),
                None => Ok(Box::new(FakeConnection {
                    wire: self.wire.clone(),
                    events: VecDeque::new(),
                })),
            }
        }
    }

    struct FakeConnection {
        wire: Arc<Wire>,
        events: VecDeque<PushEvent>,
    }

    #[async_trait]
    impl PushConnection for FakeConnection {
        async fn send(&mut self, text: String) -> Result<(), FeedError> {
            self.wire.sent.lock().push(text);
            Ok(())
        }

        async fn next_event(&mut self) -> PushEvent {
            match self.events.pop_front() {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.wire.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Counts writes per file name instead of touching the disk.
    #[derive(Default)]
    pub(crate) struct RecordingWriter {
        pub writes: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingWriter {
        pub fn count(&self, suffix: &str) -> usize {
            self.writes
                .lock()
                .iter()
                .filter(|(name, _)| name.ends_with(suffix))
                .count()
        }
    }

    impl SnapshotWriter for RecordingWriter {
        fn write(&self, rows: &[Candle], path: &Path) -> anyhow::Result<()> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.writes.lock().push((name, rows.len()));
            Ok(())
        }
    }

    pub(crate) fn bybit_kline(start_ms: i64, close: f64, confirm: bool) -> String {
        json!({
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "data": [{
                "start": start_ms,
                "end": start_ms + 59_999,
                "interval": "1",
                "open": "100",
                "close": close.to_string(),
                "high": "200",
                "low": "50",
                "volume": "1.5",
                "confirm": confirm
            }]
        })
        .to_string()
    }

    fn fast_options() -> ControllerOptions {
        ControllerOptions {
            reconnect_delay: Duration::from_millis(30),
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    struct Harness {
        controller: LiveFeedController,
        timeline: Arc<Timeline>,
        writer: Arc<RecordingWriter>,
        running: watch::Sender<bool>,
        state: watch::Receiver<FeedState>,
        observed: Arc<AtomicUsize>,
    }

    fn harness(transport: Arc<FakeTransport>, options: ControllerOptions) -> Harness {
        let timeline = Arc::new(Timeline::new(10_000, RevisionPolicy::ReplaceTail));
        let writer = Arc::new(RecordingWriter::default());
        let checkpointer = Checkpointer::new(writer.clone(), "data", "BTCUSDT", Timeframe::M1);
        let (running, running_rx) = watch::channel(true);
        let (state_tx, state) = watch::channel(FeedState::Disconnected);
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        let observer: CandleObserver = Arc::new(move |_c: &Candle| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let controller = LiveFeedController::new(
            Exchange::Bybit.adapter(),
            "BTCUSDT",
            Timeframe::M1,
            transport,
            timeline.clone(),
            checkpointer,
            Some(observer),
            options,
            state_tx,
            running_rx,
        );

        Harness {
            controller,
            timeline,
            writer,
            running,
            state,
            observed,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    // -- state machine -------------------------------------------------------

    #[tokio::test]
    async fn reconnects_after_remote_close_and_resubscribes() {
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![
            PushEvent::Message(bybit_kline(0, 101.0, false)),
            PushEvent::Closed,
        ])]));
        let wire = transport.wire.clone();
        let h = harness(transport, fast_options());
        let task = tokio::spawn(h.controller.run());

        wait_until(|| wire.connects.load(Ordering::SeqCst) >= 2).await;
        wait_until(|| wire.sent.lock().len() >= 2).await;

        let sent = wire.sent.lock().clone();
        assert_eq!(sent[0], sent[1]);
        let payload: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(payload, json!({ "op": "subscribe", "args": ["kline.1.BTCUSDT"] }));
        assert_eq!(h.timeline.len(), 1);
        assert_eq!(h.observed.load(Ordering::SeqCst), 1);

        h.running.send_replace(false);
        task.await.unwrap();
        assert_eq!(*h.state.borrow(), FeedState::Closed);
        assert_eq!(wire.connects.load(Ordering::SeqCst), 2);
        assert!(wire.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn reconnect_waits_for_the_delay() {
        let options = ControllerOptions {
            reconnect_delay: Duration::from_millis(300),
            ..fast_options()
        };
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![PushEvent::Closed])]));
        let wire = transport.wire.clone();
        let h = harness(transport, options);
        let started = Instant::now();
        let task = tokio::spawn(h.controller.run());

        wait_until(|| wire.connects.load(Ordering::SeqCst) >= 2).await;
        assert!(started.elapsed() >= Duration::from_millis(300));

        h.running.send_replace(false);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn no_reconnect_after_stop() {
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![])]));
        let wire = transport.wire.clone();
        let mut h = harness(transport, fast_options());
        let task = tokio::spawn(h.controller.run());

        wait_until(|| *h.state.borrow_and_update() == FeedState::Subscribed).await;
        h.running.send_replace(false);
        task.await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(wire.connects.load(Ordering::SeqCst), 1);
        assert_eq!(wire.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*h.state.borrow(), FeedState::Closed);
    }

    #[tokio::test]
    async fn stop_during_reconnect_delay_ends_immediately() {
        let options = ControllerOptions {
            reconnect_delay: Duration::from_secs(60),
            ..fast_options()
        };
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![PushEvent::Error(
            "connection reset".into(),
        )])]));
        let wire = transport.wire.clone();
        let mut h = harness(transport, options);
        let task = tokio::spawn(h.controller.run());

        wait_until(|| *h.state.borrow_and_update() == FeedState::Closed).await;
        h.running.send_replace(false);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("controller should stop without waiting for the delay")
            .unwrap();
        assert_eq!(wire.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_is_retried() {
        let transport = Arc::new(FakeTransport::new(vec![None, None, Some(vec![])]));
        let wire = transport.wire.clone();
        let h = harness(transport, fast_options());
        let task = tokio::spawn(h.controller.run());

        wait_until(|| wire.connects.load(Ordering::SeqCst) >= 3).await;
        wait_until(|| wire.sent.lock().len() == 1).await;

        h.running.send_replace(false);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn idle_connection_is_recycled() {
        let options = ControllerOptions {
            idle_timeout: Duration::from_millis(50),
            ..fast_options()
        };
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![])]));
        let wire = transport.wire.clone();
        let h = harness(transport, options);
        let task = tokio::spawn(h.controller.run());

        wait_until(|| wire.connects.load(Ordering::SeqCst) >= 2).await;
        assert!(wire.closes.load(Ordering::SeqCst) >= 1);

        h.running.send_replace(false);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeats_do_not_keep_a_silent_connection_alive() {
        // Pings go out faster than the idle deadline; only inbound traffic
        // may push the deadline back.
        let options = ControllerOptions {
            idle_timeout: Duration::from_millis(80),
            heartbeat_interval: Duration::from_millis(30),
            ..fast_options()
        };
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![])]));
        let wire = transport.wire.clone();
        let h = harness(transport, options);
        let task = tokio::spawn(h.controller.run());

        wait_until(|| wire.connects.load(Ordering::SeqCst) >= 2).await;
        assert!(wire.sent.lock().iter().any(|s| s == r#"{"op":"ping"}"#));
        assert!(wire.closes.load(Ordering::SeqCst) >= 1);

        h.running.send_replace(false);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_is_sent_while_connected() {
        let options = ControllerOptions {
            heartbeat_interval: Duration::from_millis(20),
            ..fast_options()
        };
        let transport = Arc::new(FakeTransport::new(vec![Some(vec![])]));
        let wire = transport.wire.clone();
        let h = harness(transport, options);
        let task = tokio::spawn(h.controller.run());

        wait_until(|| wire.sent.lock().iter().any(|s| s == r#"{"op":"ping"}"#)).await;

        h.running.send_replace(false);
        task.await.unwrap();
    }

    // -- dispatch ------------------------------------------------------------

    #[test]
    fn unsubscribed_topic_produces_nothing() {
        let h = harness(Arc::new(FakeTransport::new(vec![])), fast_options());
        let other = bybit_kline(0, 1.0, true).replace("kline.1.BTCUSDT", "kline.1.ETHUSDT");

        h.controller.dispatch(&other);
        h.controller.dispatch("not json at all");
        h.controller.dispatch(r#"{"success":true,"ret_msg":"pong","op":"ping"}"#);

        assert!(h.timeline.is_empty());
        assert_eq!(h.observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_record_is_skipped() {
        let h = harness(Arc::new(FakeTransport::new(vec![])), fast_options());
        let bad = bybit_kline(0, 1.0, true).replace("\"1.5\"", "\"lots\"");

        h.controller.dispatch(&bad);
        h.controller.dispatch(&bybit_kline(60_000, 2.0, true));

        assert_eq!(h.timeline.len(), 1);
        assert_eq!(h.observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn revisions_replace_the_in_progress_bar() {
        let h = harness(Arc::new(FakeTransport::new(vec![])), fast_options());
        h.controller.dispatch(&bybit_kline(0, 101.0, false));
        h.controller.dispatch(&bybit_kline(0, 102.0, false));
        h.controller.dispatch(&bybit_kline(0, 103.0, true));

        assert_eq!(h.timeline.len(), 1);
        let tail = h.timeline.tail().unwrap();
        assert!(tail.confirmed);
        assert!((tail.close - 103.0).abs() < f64::EPSILON);
        assert_eq!(h.observed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn live_checkpoint_on_every_hundredth_append() {
        let h = harness(Arc::new(FakeTransport::new(vec![])), fast_options());
        for i in 0..99 {
            h.controller.dispatch(&bybit_kline(i * 60_000, 1.0, true));
        }
        assert_eq!(h.writer.count("_live.csv"), 0);

        h.controller.dispatch(&bybit_kline(99 * 60_000, 1.0, true));
        assert_eq!(h.writer.count("_live.csv"), 1);

        // A revision at length 100 does not write again.
        h.controller.dispatch(&bybit_kline(99 * 60_000, 1.5, true));
        assert_eq!(h.writer.count("_live.csv"), 1);

        for i in 100..200 {
            h.controller.dispatch(&bybit_kline(i * 60_000, 1.0, true));
        }
        assert_eq!(h.writer.count("_live.csv"), 2);
        assert_eq!(h.writer.writes.lock().last().unwrap().1, 200);
    }
}
