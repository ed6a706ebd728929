pub mod candle;
pub mod timeline;

pub use candle::{Candle, CandleFields};
pub use timeline::{PushOutcome, RevisionPolicy, Timeline, DEFAULT_MAX_CANDLES};
