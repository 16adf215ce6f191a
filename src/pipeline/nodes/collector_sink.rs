//! CollectorSinkNode: consumes a stream and keeps statistics about it.
//!
//! Counts and sums every sample. With `keep` set, the samples themselves are
//! kept as well, which is what tests and small tools usually want.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::arg;
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{field, PersistedFields, PersistedValue};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;

pub const TYPE_KEY: &str = "collector_sink";

#[derive(Debug, Default)]
pub struct CollectorSinkNode {
    keep: bool,
    samples: Vec<f64>,
    sum: f64,
    count: u64,
    buffers: u64,
    last_stamp: Option<TimeStamp>,
}

impl CollectorSinkNode {
    pub fn new(keep: bool) -> Self {
        Self {
            keep,
            ..Self::default()
        }
    }

    /// Samples consumed.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Buffers consumed, flushes included.
    pub fn buffers(&self) -> u64 {
        self.buffers
    }

    /// Kept samples, empty unless `keep` is set.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// End stamp of the last consumed buffer.
    pub fn last_stamp(&self) -> Option<TimeStamp> {
        self.last_stamp
    }

    fn consume(&mut self, buffer: &TimeLocatedBuffer) {
        let samples = buffer.written_samples();
        self.sum += samples.iter().sum::<f64>();
        self.count += samples.len() as u64;
        self.buffers += 1;
        self.last_stamp = Some(buffer.current_time());
        if self.keep {
            self.samples.extend_from_slice(samples);
        }
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let keep = match arg(args, "keep") {
        Some(value) => value.expect_bool("keep")?,
        None => false,
    };
    Ok(Box::new(CollectorSinkNode::new(keep)))
}

impl NodeBehavior for CollectorSinkNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", PortDataType::Array)]
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        self.last_stamp = None;
        Ok(())
    }

    fn data_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.consume(&buffer);
        }
        Ok(())
    }

    /// Sinks have nowhere to push to, so flushing consumes everything queued.
    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        while let Some(buffer) = input.read_count(Some(input.queued())) {
            self.consume(&buffer);
        }
        Ok(FlushState::Empty)
    }

    fn save_state(&self) -> PersistedFields {
        let mut fields = PersistedFields::new();
        fields.insert("sum".into(), PersistedValue::Double(self.sum));
        fields.insert("count".into(), PersistedValue::Int(self.count as i64));
        fields.insert("buffers".into(), PersistedValue::Int(self.buffers as i64));
        if self.keep {
            fields.insert("samples".into(), PersistedValue::Samples(self.samples.clone()));
        }
        fields
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        let bad = |name: &str| EngineError::InvalidArgument(format!("persisted field '{}' has the wrong type", name));
        self.sum = field(fields, "sum")?.as_f64().ok_or_else(|| bad("sum"))?;
        self.count = field(fields, "count")?.as_i64().ok_or_else(|| bad("count"))? as u64;
        self.buffers = fields.get("buffers").and_then(PersistedValue::as_i64).unwrap_or(0) as u64;
        self.samples = fields
            .get("samples")
            .and_then(PersistedValue::as_samples)
            .map(<[f64]>::to_vec)
            .unwrap_or_default();
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("keep", AttributeValue::Bool(self.keep))]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "keep" => {
                self.keep = value.expect_bool(name)?;
                if !self.keep {
                    self.samples.clear();
                }
                Ok(())
            }
            _ => Err(EngineError::UnknownAttribute {
                node: core.name().to_string(),
                attribute: name.to_string(),
            }),
        }
    }
}
