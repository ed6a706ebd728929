// =============================================================================
// Live streaming — push transport plus the reconnecting feed controller
// =============================================================================

pub mod controller;
pub mod transport;

pub use controller::{
    CandleObserver, ControllerOptions, FeedState, LiveFeedController, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_RECONNECT_DELAY,
};
pub use transport::{PushConnection, PushEvent, PushTransport, TungsteniteTransport};
