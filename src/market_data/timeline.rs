use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::candle::Candle;

/// Default number of candles retained in memory.
pub const DEFAULT_MAX_CANDLES: usize = 10_000;

/// How a live candle that repeats the tail's timestamp is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionPolicy {
    /// Same timestamp as the tail replaces the tail (one entry per bar).
    #[default]
    ReplaceTail,
    /// Every live update becomes a new entry, including revisions of the
    /// in-progress bar.
    AppendAll,
}

/// What [`Timeline::push`] did with a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    Replaced,
}

// ---------------------------------------------------------------------------
// Timeline -- bounded ring buffer for one (instrument, timeframe, exchange)
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer holding the most recent candles of one series.
///
/// Historical backfills replace the whole content; live candles are pushed one
/// at a time. On overflow the oldest candles are dropped so that at most
/// `max_candles` remain.
pub struct Timeline {
    ring: RwLock<VecDeque<Candle>>,
    max_candles: usize,
    policy: RevisionPolicy,
}

impl Timeline {
    pub fn new(max_candles: usize, policy: RevisionPolicy) -> Self {
        let max_candles = max_candles.max(1);
        Self {
            ring: RwLock::new(VecDeque::with_capacity(max_candles + 1)),
            max_candles,
            policy,
        }
    }

    /// Add a live candle and return what happened plus the resulting length.
    pub fn push(&self, candle: Candle) -> (PushOutcome, usize) {
        let mut ring = self.ring.write();

        if self.policy == RevisionPolicy::ReplaceTail {
            if let Some(last) = ring.back_mut() {
                if last.timestamp == candle.timestamp {
                    *last = candle;
                    return (PushOutcome::Replaced, ring.len());
                }
            }
        }

        ring.push_back(candle);
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        (PushOutcome::Appended, ring.len())
    }

    /// Replace the whole content, keeping only the most recent `max_candles`.
    pub fn replace_all(&self, candles: Vec<Candle>) {
        let skip = candles.len().saturating_sub(self.max_candles);
        let mut ring = self.ring.write();
        ring.clear();
        ring.extend(candles.into_iter().skip(skip));
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    pub fn tail(&self) -> Option<Candle> {
        self.ring.read().back().cloned()
    }

    /// Copy of the current content, oldest first.
    pub fn to_vec(&self) -> Vec<Candle> {
        self.ring.read().iter().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.max_candles
    }

    pub fn policy(&self) -> RevisionPolicy {
        self.policy
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CANDLES, RevisionPolicy::default())
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("len", &self.len())
            .field("max_candles", &self.max_candles)
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
