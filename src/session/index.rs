//! The `index.lst` record set file.
//!
//! ```text
//! -+-+-RECORDSET-+-+-
//! RECORD
//! LINE
//! -Type: Stream1D
//! -Date: 2024-03-01 12:30
//! -Begin: 00:00:00:000
//! -End: 00:00:01:000
//! -Path: set 1/Recorder.bin
//! -Samplerate: 1000
//! ```
//!
//! Paths inside the working directory are written relative to the index file.

use crate::error::{EngineError, Result, ResultExt};
use crate::session::record::{Record, RecordLine, RecordSet};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: &str = "-+-+-RECORDSET-+-+-";
pub const RECORD_BEGIN: &str = "RECORD";
pub const LINE_BEGIN: &str = "LINE";

/// Default file name of a record set index.
pub const INDEX_FILE_NAME: &str = "index.lst";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Undefined,
    Main,
    Record,
}

/// Streaming writer for the index format.
pub struct RecordSetWriter<W: Write> {
    writer: W,
    state: WriterState,
    /// Directory the index lives in; paths below it are made relative.
    base_dir: Option<PathBuf>,
}

impl<W: Write> RecordSetWriter<W> {
    pub fn new(writer: W, base_dir: Option<PathBuf>) -> Self {
        Self {
            writer,
            state: WriterState::Undefined,
            base_dir,
        }
    }

    fn expect_state(&self, expected: WriterState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(EngineError::InvalidArgument(format!(
                "record set writer: {} is invalid in state {:?}",
                op, self.state
            )));
        }
        Ok(())
    }

    pub fn begin_write(&mut self) -> Result<()> {
        self.expect_state(WriterState::Undefined, "begin_write")?;
        writeln!(self.writer, "{}", MAGIC)?;
        self.state = WriterState::Main;
        Ok(())
    }

    pub fn begin_record(&mut self) -> Result<()> {
        self.expect_state(WriterState::Main, "begin_record")?;
        writeln!(self.writer, "{}", RECORD_BEGIN)?;
        self.state = WriterState::Record;
        Ok(())
    }

    pub fn write_line(&mut self, line: &RecordLine) -> Result<()> {
        self.expect_state(WriterState::Record, "write_line")?;
        writeln!(self.writer, "{}", LINE_BEGIN)?;
        for (key, value) in line.properties() {
            let value = if key == "Path" {
                self.relative(&line.path)
            } else {
                value
            };
            writeln!(self.writer, "-{}: {}", key, value)?;
        }
        Ok(())
    }

    pub fn end_record(&mut self) -> Result<()> {
        self.expect_state(WriterState::Record, "end_record")?;
        self.state = WriterState::Main;
        Ok(())
    }

    /// Finish the file and hand back the underlying writer.
    pub fn end_write(mut self) -> Result<W> {
        self.expect_state(WriterState::Main, "end_write")?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn relative(&self, path: &Path) -> String {
        match &self.base_dir {
            Some(base) => path
                .strip_prefix(base)
                .unwrap_or(path)
                .display()
                .to_string(),
            None => path.display().to_string(),
        }
    }

    /// Write a whole set.
    pub fn write_set(mut self, set: &RecordSet) -> Result<W> {
        self.begin_write()?;
        for record in &set.records {
            self.begin_record()?;
            for line in &record.lines {
                self.write_line(line)?;
            }
            self.end_record()?;
        }
        self.end_write()
    }
}

/// Replace the index at `path` with `set`.
pub fn write_to_file(set: &RecordSet, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let base = path.parent().map(Path::to_path_buf);
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    RecordSetWriter::new(BufWriter::new(file), base).write_set(set)?;
    tracing::info!(
        "Wrote record set with {} records to {:?}",
        set.records.len(),
        path
    );
    Ok(())
}

/// Parser for the index format.
pub struct RecordSetReader;

impl RecordSetReader {
    /// Parse an index. Relative paths are resolved against `base_dir` when given.
    pub fn parse<R: BufRead>(reader: R, base_dir: Option<&Path>) -> Result<RecordSet> {
        let mut lines = reader.lines();
        let first = lines.next().transpose()?.unwrap_or_default();
        if first.trim_end() != MAGIC {
            return Err(EngineError::Serialization(
                "not a record set index (missing magic line)".to_string(),
            ));
        }

        let mut set = RecordSet::new();
        let mut current_line: Option<BTreeMap<String, String>> = None;

        let finish_line = |set: &mut RecordSet,
                           props: Option<BTreeMap<String, String>>|
         -> Result<()> {
            if let Some(props) = props {
                let mut line = RecordLine::from_properties(&props)?;
                if let (Some(base), true) = (base_dir, line.path.is_relative()) {
                    line.path = base.join(&line.path);
                }
                match set.records.last_mut() {
                    Some(record) => record.lines.push(line),
                    None => {
                        return Err(EngineError::Serialization(
                            "LINE outside of a RECORD".to_string(),
                        ))
                    }
                }
            }
            Ok(())
        };

        for (number, text) in lines.enumerate() {
            let text = text?;
            let text = text.trim_end();
            if text.is_empty() {
                continue;
            }
            if text == RECORD_BEGIN {
                finish_line(&mut set, current_line.take())?;
                set.records.push(Record::default());
            } else if text == LINE_BEGIN {
                finish_line(&mut set, current_line.take())?;
                current_line = Some(BTreeMap::new());
            } else if let Some(property) = text.strip_prefix('-') {
                let (key, value) = property.split_once(": ").ok_or_else(|| {
                    EngineError::Serialization(format!(
                        "line {}: malformed property '{}'",
                        number + 2,
                        text
                    ))
                })?;
                match current_line.as_mut() {
                    Some(props) => {
                        props.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        return Err(EngineError::Serialization(format!(
                            "line {}: property outside of a LINE",
                            number + 2
                        )))
                    }
                }
            } else {
                return Err(EngineError::Serialization(format!(
                    "line {}: unexpected '{}'",
                    number + 2,
                    text
                )));
            }
        }
        finish_line(&mut set, current_line.take())?;
        Ok(set)
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<RecordSet> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::parse(BufReader::new(file), path.parent())
    }
}
