//! RecorderNode: writes a stream to disk.
//!
//! Samples are written as little-endian `f64` to `<name>.bin` in the run's
//! working directory. When the node stops, the file is closed and described
//! by a [`RecordLine`] handed to the engine's recording sink.

use crate::error::{Result, ResultExt};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;
use crate::session::RecordLine;
use chrono::{Local, NaiveDateTime, Timelike};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const TYPE_KEY: &str = "recorder";

/// Extension of recorded sample files.
pub const FILE_EXTENSION: &str = "bin";

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    samplerate: u32,
    date: NaiveDateTime,
    begin: Option<TimeStamp>,
    end: TimeStamp,
}

#[derive(Default)]
pub struct RecorderNode {
    file: Option<OpenFile>,
    last_path: Option<PathBuf>,
    samples: u64,
}

impl RecorderNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// File written by the current or last run.
    pub fn path(&self) -> Option<&Path> {
        self.file
            .as_ref()
            .map(|f| f.path.as_path())
            .or(self.last_path.as_deref())
    }

    /// Samples written in the current or last run.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    fn write(&mut self, buffer: &TimeLocatedBuffer) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        for sample in buffer.written_samples() {
            file.writer.write_all(&sample.to_le_bytes())?;
        }
        file.begin.get_or_insert(buffer.front_time());
        file.end = buffer.current_time();
        self.samples += buffer.written() as u64;
        Ok(())
    }
}

/// Current local time, truncated to the minute.
fn record_date() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(now)
}

pub fn create(_args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    Ok(Box::new(RecorderNode::new()))
}

impl NodeBehavior for RecorderNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", PortDataType::Array)]
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        core.init_input_buffers()?;
        self.file = None;
        let input = core.input(0);
        if !input.is_connected() {
            return Ok(());
        }
        let dir = core.engine().ensure_working_dir()?;
        let path = dir.join(format!("{}.{}", core.name(), FILE_EXTENSION));
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let writer = BufWriter::new(file);
        tracing::debug!("'{}' recording to {}", core.name(), path.display());
        self.file = Some(OpenFile {
            path,
            writer,
            samplerate: input.samplerate(),
            date: record_date(),
            begin: None,
            end: TimeStamp::ZERO,
        });
        self.samples = 0;
        Ok(())
    }

    fn data_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.write(&buffer)?;
        }
        Ok(())
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        while let Some(buffer) = input.read_count(Some(input.queued())) {
            self.write(&buffer)?;
        }
        Ok(FlushState::Empty)
    }

    fn processing_stopped(&mut self, core: &NodeCore) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.writer.flush()?;
        self.last_path = Some(file.path.clone());
        match file.begin {
            Some(begin) => {
                core.engine().recording_sink().record_line(RecordLine::stream_1d(
                    file.date,
                    begin,
                    file.end,
                    file.path,
                    file.samplerate,
                ));
            }
            None => tracing::info!("'{}' recorded nothing", core.name()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_date_has_minute_resolution() {
        let date = record_date();
        assert_eq!(date.second(), 0);
        assert_eq!(date.nanosecond(), 0);
    }

    #[test]
    fn test_write_without_file_is_ignored() {
        let mut recorder = RecorderNode::new();
        let buffer = TimeLocatedBuffer::from_samples(vec![1.0; 4], 10, TimeStamp::from_seconds(0.4));
        recorder.write(&buffer).unwrap();
        assert_eq!(recorder.samples(), 0);
        assert!(recorder.path().is_none());
    }
}
