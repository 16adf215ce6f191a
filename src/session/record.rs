//! Record lines and record sets.
//!
//! Every recording node reports one [`RecordLine`] per run describing the file
//! it wrote. Lines of the same run form a [`Record`]; the records of a working
//! session form a [`RecordSet`], which is what ends up in `index.lst`.

use crate::error::{EngineError, Result};
use crate::pipeline::time::TimeStamp;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Format of the `Date` property.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Layout of the recorded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// One sample stream at a fixed samplerate.
    Stream1D,
    /// A stream of spectra or other frames.
    Stream2D,
}

impl fmt::Display for LineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineKind::Stream1D => write!(f, "Stream1D"),
            LineKind::Stream2D => write!(f, "Stream2D"),
        }
    }
}

impl FromStr for LineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Stream1D" => Ok(LineKind::Stream1D),
            "Stream2D" => Ok(LineKind::Stream2D),
            other => Err(EngineError::Serialization(format!(
                "unknown record line type '{}'",
                other
            ))),
        }
    }
}

/// Description of one recorded file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLine {
    pub kind: LineKind,
    /// Wall-clock time the run started, minute resolution.
    pub date: NaiveDateTime,
    pub begin: TimeStamp,
    pub end: TimeStamp,
    pub path: PathBuf,
    /// Present for [`LineKind::Stream1D`] lines.
    pub samplerate: Option<u32>,
}

impl RecordLine {
    pub fn stream_1d(
        date: NaiveDateTime,
        begin: TimeStamp,
        end: TimeStamp,
        path: impl Into<PathBuf>,
        samplerate: u32,
    ) -> Self {
        Self {
            kind: LineKind::Stream1D,
            date,
            begin,
            end,
            path: path.into(),
            samplerate: Some(samplerate),
        }
    }

    pub fn stream_2d(
        date: NaiveDateTime,
        begin: TimeStamp,
        end: TimeStamp,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: LineKind::Stream2D,
            date,
            begin,
            end,
            path: path.into(),
            samplerate: None,
        }
    }

    /// Key/value properties as written to the index, in file order.
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("Type", self.kind.to_string()),
            ("Date", self.date.format(DATE_FORMAT).to_string()),
            ("Begin", self.begin.to_short_time_string()),
            ("End", self.end.to_short_time_string()),
            ("Path", self.path.display().to_string()),
        ];
        if let Some(rate) = self.samplerate {
            props.push(("Samplerate", rate.to_string()));
        }
        props
    }

    /// Rebuild a line from the properties read from an index.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            props.get(key).ok_or_else(|| {
                EngineError::Serialization(format!("record line is missing '{}'", key))
            })
        };

        let kind: LineKind = get("Type")?.parse()?;
        let date = NaiveDateTime::parse_from_str(get("Date")?, DATE_FORMAT)
            .map_err(|e| EngineError::Serialization(format!("bad record date: {}", e)))?;
        let begin = TimeStamp::parse_short_time_string(get("Begin")?)?;
        let end = TimeStamp::parse_short_time_string(get("End")?)?;
        let path = PathBuf::from(get("Path")?);
        let samplerate = match kind {
            LineKind::Stream1D => Some(get("Samplerate")?.parse::<u32>().map_err(|e| {
                EngineError::Serialization(format!("bad samplerate: {}", e))
            })?),
            LineKind::Stream2D => None,
        };

        Ok(Self {
            kind,
            date,
            begin,
            end,
            path,
            samplerate,
        })
    }
}

/// The lines recorded during one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub lines: Vec<RecordLine>,
}

impl Record {
    pub fn begin(&self) -> Option<TimeStamp> {
        self.lines.iter().map(|l| l.begin).min()
    }

    pub fn end(&self) -> Option<TimeStamp> {
        self.lines.iter().map(|l| l.end).max()
    }

    pub fn date(&self) -> Option<NaiveDateTime> {
        self.lines.iter().map(|l| l.date).min()
    }
}

/// All records of a working session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.records.iter().map(|r| r.lines.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-03-01 12:30", DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_properties_order_and_format() {
        let line = RecordLine::stream_1d(
            date(),
            TimeStamp::ZERO,
            TimeStamp::from_seconds(61.5),
            "set 1/rec.bin",
            1000,
        );
        let props = line.properties();
        let keys: Vec<_> = props.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, ["Type", "Date", "Begin", "End", "Path", "Samplerate"]);
        assert_eq!(props[1].1, "2024-03-01 12:30");
        assert_eq!(props[3].1, "00:01:01:500");
    }

    #[test]
    fn test_from_properties() {
        let line = RecordLine::stream_2d(
            date(),
            TimeStamp::from_seconds(1.0),
            TimeStamp::from_seconds(2.0),
            "spec.bin",
        );
        let props: BTreeMap<String, String> = line
            .properties()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(RecordLine::from_properties(&props).unwrap(), line);
    }

    #[test]
    fn test_missing_samplerate_is_an_error() {
        let mut props: BTreeMap<String, String> = RecordLine::stream_1d(
            date(),
            TimeStamp::ZERO,
            TimeStamp::ZERO,
            "a.bin",
            10,
        )
        .properties()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        props.remove("Samplerate");
        assert!(RecordLine::from_properties(&props).is_err());
    }

    #[test]
    fn test_record_bounds() {
        let mut record = Record::default();
        assert!(record.begin().is_none());
        record.lines.push(RecordLine::stream_1d(
            date(),
            TimeStamp::from_seconds(2.0),
            TimeStamp::from_seconds(4.0),
            "a.bin",
            10,
        ));
        record.lines.push(RecordLine::stream_1d(
            date(),
            TimeStamp::from_seconds(1.0),
            TimeStamp::from_seconds(3.0),
            "b.bin",
            10,
        ));
        assert_eq!(record.begin(), Some(TimeStamp::from_seconds(1.0)));
        assert_eq!(record.end(), Some(TimeStamp::from_seconds(4.0)));
    }
}
