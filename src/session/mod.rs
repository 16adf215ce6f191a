//! Recording bookkeeping.
//!
//! Recording nodes write their own data files. What they hand to the engine
//! is a [`RecordLine`] per file, delivered through the context's
//! [`RecordingSink`]. The default sink, [`RecordSetCollector`], groups the
//! lines of each run into a [`Record`] and can persist the whole set as an
//! `index.lst` file next to the run directories.

pub mod index;
pub mod record;

pub use index::{write_to_file, RecordSetReader, RecordSetWriter, INDEX_FILE_NAME};
pub use record::{LineKind, Record, RecordLine, RecordSet};

use crate::error::Result;
use crate::pipeline::lock;
use std::path::Path;
use std::sync::Mutex;

/// Receives the record lines produced while a graph runs.
pub trait RecordingSink: Send + Sync {
    /// A recording node finished a file.
    fn record_line(&self, line: RecordLine);

    /// The run with the given counter value stopped.
    fn run_finished(&self, _run: u32) {}
}

/// Collects record lines into a [`RecordSet`], one record per run.
#[derive(Default)]
pub struct RecordSetCollector {
    inner: Mutex<CollectorState>,
}

#[derive(Default)]
struct CollectorState {
    set: RecordSet,
    current: Record,
}

impl RecordSetCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed records plus the one still being filled, if it has lines.
    pub fn snapshot(&self) -> RecordSet {
        let state = lock(&self.inner);
        let mut set = state.set.clone();
        if !state.current.lines.is_empty() {
            set.records.push(state.current.clone());
        }
        set
    }

    /// Write the collected set to `path`.
    pub fn write_index(&self, path: impl AsRef<Path>) -> Result<()> {
        write_to_file(&self.snapshot(), path)
    }
}

impl RecordingSink for RecordSetCollector {
    fn record_line(&self, line: RecordLine) {
        tracing::debug!("Record line for {:?}", line.path);
        lock(&self.inner).current.lines.push(line);
    }

    fn run_finished(&self, run: u32) {
        let mut state = lock(&self.inner);
        if state.current.lines.is_empty() {
            return;
        }
        let record = std::mem::take(&mut state.current);
        tracing::debug!("Run {} produced {} record lines", run, record.lines.len());
        state.set.records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::time::TimeStamp;

    fn line(name: &str) -> RecordLine {
        RecordLine::stream_1d(
            chrono::Local::now().naive_local(),
            TimeStamp::ZERO,
            TimeStamp::from_seconds(1.0),
            name,
            100,
        )
    }

    #[test]
    fn test_collector_groups_by_run() {
        let collector = RecordSetCollector::new();
        collector.record_line(line("a.bin"));
        collector.record_line(line("b.bin"));
        collector.run_finished(0);
        collector.run_finished(1);
        collector.record_line(line("c.bin"));

        let set = collector.snapshot();
        assert_eq!(set.records.len(), 2);
        assert_eq!(set.records[0].lines.len(), 2);
        assert_eq!(set.records[1].lines.len(), 1);
    }
}
