// =============================================================================
// Checkpointer — durable CSV snapshots of the in-memory timeline
// =============================================================================
//
// A checkpoint overwrites `<output_dir>/<SYMBOL>_<timeframe>_<label>.csv` with
// the full timeline. Writes go to a `.tmp` sibling first and are renamed into
// place, so a crash mid-write never leaves a truncated snapshot behind.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::market_data::{Candle, Timeline};
use crate::types::Timeframe;

/// Live checkpoints fire whenever the timeline length is a multiple of this.
pub const LIVE_CHECKPOINT_EVERY: usize = 100;

/// Why a snapshot was taken; part of the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointLabel {
    Historical,
    Live,
    Final,
}

impl CheckpointLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Live => "live",
            Self::Final => "final",
        }
    }
}

impl std::fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable tabular sink for candle rows. Writes replace any previous content
/// at `path`.
pub trait SnapshotWriter: Send + Sync {
    fn write(&self, rows: &[Candle], path: &Path) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CSV writer
// ---------------------------------------------------------------------------

/// Writes `timestamp,open,high,low,close,volume,confirmed` rows with RFC 3339
/// timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSnapshotWriter;

impl SnapshotWriter for CsvSnapshotWriter {
    fn write(&self, rows: &[Candle], path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        }

        let tmp_path = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp_path)
                .with_context(|| format!("failed to open {}", tmp_path.display()))?;
            for row in rows {
                writer
                    .serialize(row)
                    .with_context(|| format!("failed to write row to {}", tmp_path.display()))?;
            }
            writer
                .flush()
                .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
        }

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename snapshot to {}", path.display()))?;
        Ok(())
    }
}

/// Read a snapshot written by [`CsvSnapshotWriter`].
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open snapshot {}", path.display()))?;

    reader
        .deserialize::<Candle>()
        .map(|row| row.with_context(|| format!("bad row in {}", path.display())))
        .collect()
}

// ---------------------------------------------------------------------------
// Checkpointer
// ---------------------------------------------------------------------------

/// Knows where snapshots of one session go and writes them on request.
#[derive(Clone)]
pub struct Checkpointer {
    writer: Arc<dyn SnapshotWriter>,
    output_dir: PathBuf,
    symbol: String,
    timeframe: Timeframe,
}

impl Checkpointer {
    pub fn new(
        writer: Arc<dyn SnapshotWriter>,
        output_dir: impl Into<PathBuf>,
        symbol: impl Into<String>,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            writer,
            output_dir: output_dir.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// Deterministic snapshot location for `label`.
    pub fn path_for(&self, label: CheckpointLabel) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}_{}.csv", self.symbol, self.timeframe, label))
    }

    /// Snapshot the timeline. Returns the written path, or `None` when the
    /// timeline is empty and nothing was written.
    pub fn checkpoint(&self, timeline: &Timeline, label: CheckpointLabel) -> Result<Option<PathBuf>> {
        let rows = timeline.to_vec();
        if rows.is_empty() {
            debug!(label = %label, "timeline empty, checkpoint skipped");
            return Ok(None);
        }

        let path = self.path_for(label);
        self.writer.write(&rows, &path)?;
        info!(path = %path.display(), count = rows.len(), label = %label, "checkpoint saved");
        Ok(Some(path))
    }

    /// Whether a live push that left the timeline at `len` should snapshot.
    pub fn live_due(len: usize) -> bool {
        len > 0 && len % LIVE_CHECKPOINT_EVERY == 0
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("output_dir", &self.output_dir)
            .field("symbol", &self.symbol)
            .field("timeframe", &self.timeframe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::sample_candle;
    use crate::market_data::RevisionPolicy;

    fn checkpointer(dir: &Path) -> Checkpointer {
        Checkpointer::new(Arc::new(CsvSnapshotWriter), dir, "BTCUSDT", Timeframe::M1)
    }

    #[test]
    fn path_is_derived_from_symbol_timeframe_and_label() {
        let cp = checkpointer(Path::new("data"));
        assert_eq!(
            cp.path_for(CheckpointLabel::Historical),
            PathBuf::from("data/BTCUSDT_1m_historical.csv")
        );
        assert_eq!(
            cp.path_for(CheckpointLabel::Final),
            PathBuf::from("data/BTCUSDT_1m_final.csv")
        );
    }

    #[test]
    fn round_trip_preserves_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(dir.path());
        let timeline = Timeline::new(100, RevisionPolicy::ReplaceTail);
        let mut expected = Vec::new();
        for i in 0..25 {
            let mut c = sample_candle(1_700_000_000_000 + i * 60_000, 37_000.123 + i as f64 * 0.1, true);
            c.volume = 0.001 * (i + 1) as f64;
            expected.push(c.clone());
            timeline.push(c);
        }
        let mut tail = sample_candle(1_700_000_000_000 + 25 * 60_000, 1.5, false);
        tail.volume = 0.0;
        expected.push(tail.clone());
        timeline.push(tail);

        let path = cp.checkpoint(&timeline, CheckpointLabel::Historical).unwrap().unwrap();
        let back = read_snapshot(&path).unwrap();

        assert_eq!(back.len(), expected.len());
        for (a, b) in back.iter().zip(&expected) {
            assert_eq!(a.timestamp, b.timestamp);
            assert!((a.open - b.open).abs() < 1e-9);
            assert!((a.high - b.high).abs() < 1e-9);
            assert!((a.low - b.low).abs() < 1e-9);
            assert!((a.close - b.close).abs() < 1e-9);
            assert!((a.volume - b.volume).abs() < 1e-12);
            assert_eq!(a.confirmed, b.confirmed);
        }
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn checkpoint_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(dir.path());
        let timeline = Timeline::default();
        for i in 0..10 {
            timeline.push(sample_candle(i * 60_000, 1.0, true));
        }
        cp.checkpoint(&timeline, CheckpointLabel::Live).unwrap();

        timeline.replace_all(vec![sample_candle(0, 2.0, true)]);
        let path = cp.checkpoint(&timeline, CheckpointLabel::Live).unwrap().unwrap();
        assert_eq!(read_snapshot(path).unwrap().len(), 1);
    }

    #[test]
    fn empty_timeline_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(&dir.path().join("nested"));
        let written = cp.checkpoint(&Timeline::default(), CheckpointLabel::Final).unwrap();
        assert!(written.is_none());
        assert!(!cp.path_for(CheckpointLabel::Final).exists());
    }

    #[test]
    fn live_checkpoint_fires_on_multiples_of_one_hundred() {
        assert!(!Checkpointer::live_due(0));
        assert!(!Checkpointer::live_due(99));
        assert!(Checkpointer::live_due(100));
        assert!(!Checkpointer::live_due(101));
        assert!(Checkpointer::live_due(10_000));
    }
}
