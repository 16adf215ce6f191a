//! ThresholdNode: turns level crossings into time-located events.
//!
//! Every sample is compared against `level`. When a sample lands on the other
//! side of the level than its predecessor, the sample is emitted on the
//! `events` value output, stamped with its own time.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::arg;
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{PersistedFields, PersistedValue};
use crate::pipeline::time_located::{TimeLocatedBuffer, TimeLocatedValue};

pub const TYPE_KEY: &str = "threshold";

#[derive(Debug, Default)]
pub struct ThresholdNode {
    level: f64,
    /// Side of the level the previous sample was on, unknown before the first.
    above: Option<bool>,
    events: u64,
}

impl ThresholdNode {
    pub fn new(level: f64) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Events emitted since creation.
    pub fn events(&self) -> u64 {
        self.events
    }

    fn crossings(&mut self, buffer: &TimeLocatedBuffer) -> Vec<TimeLocatedValue> {
        let mut found = Vec::new();
        for (i, &sample) in buffer.written_samples().iter().enumerate() {
            let above = sample >= self.level;
            if self.above.is_some_and(|previous| previous != above) {
                found.push(TimeLocatedValue::new(sample, buffer.stamp_for_sample(i)));
            }
            self.above = Some(above);
        }
        found
    }

    fn process(&mut self, core: &NodeCore, buffer: &TimeLocatedBuffer) -> Result<usize> {
        let crossings = self.crossings(buffer);
        for event in &crossings {
            core.output(0).send_value(*event)?;
        }
        self.events += crossings.len() as u64;
        Ok(crossings.len())
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let level = match arg(args, "level") {
        Some(value) => value.expect_float("level")?,
        None => 0.0,
    };
    Ok(Box::new(ThresholdNode::new(level)))
}

impl NodeBehavior for ThresholdNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDataType::Array),
            PortDescriptor::output("events", PortDataType::Value),
        ]
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        self.above = None;
        Ok(())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.process(core, &buffer)?;
        }
        Ok(())
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        let mut emitted = 0;
        while let Some(buffer) = input.read_count(Some(input.queued())) {
            emitted += self.process(core, &buffer)?;
        }
        Ok(if emitted > 0 {
            FlushState::Some
        } else {
            FlushState::Empty
        })
    }

    fn save_state(&self) -> PersistedFields {
        let mut fields = PersistedFields::new();
        if let Some(above) = self.above {
            fields.insert("above".into(), PersistedValue::Bool(above));
        }
        fields.insert("events".into(), PersistedValue::Int(self.events as i64));
        fields
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.above = fields.get("above").and_then(PersistedValue::as_bool);
        self.events = fields.get("events").and_then(PersistedValue::as_i64).unwrap_or(0) as u64;
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("level", AttributeValue::Double(self.level))]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "level" => {
                self.level = value.expect_float(name)?;
                Ok(())
            }
            _ => Err(EngineError::UnknownAttribute {
                node: core.name().to_string(),
                attribute: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::time::TimeStamp;

    #[test]
    fn test_crossings_in_both_directions() {
        let mut node = ThresholdNode::new(0.5);
        let buffer = TimeLocatedBuffer::from_samples(
            vec![0.0, 0.2, 0.9, 1.0, 0.1, 0.7],
            10,
            TimeStamp::from_seconds(0.6),
        );
        let events = node.crossings(&buffer);
        let stamps: Vec<TimeStamp> = events.iter().map(|e| e.stamp).collect();
        let values: Vec<f64> = events.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![0.9, 0.1, 0.7]);
        assert_eq!(
            stamps,
            vec![
                TimeStamp::from_seconds(0.2),
                TimeStamp::from_seconds(0.4),
                TimeStamp::from_seconds(0.5)
            ]
        );
    }

    #[test]
    fn test_side_carries_across_buffers() {
        let mut node = ThresholdNode::new(0.0);
        let first = TimeLocatedBuffer::from_samples(vec![1.0, 2.0], 10, TimeStamp::from_seconds(0.2));
        let second = TimeLocatedBuffer::from_samples(vec![-1.0], 10, TimeStamp::from_seconds(0.3));
        assert!(node.crossings(&first).is_empty());
        assert_eq!(node.crossings(&second).len(), 1);

        let mut restored = ThresholdNode::new(0.0);
        restored.load_state(&node.save_state()).unwrap();
        assert_eq!(restored.above, Some(false));
    }
}
