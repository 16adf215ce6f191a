//! AccumulatorNode: running total of every sample it consumes.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{field, PersistedFields, PersistedValue};

pub const TYPE_KEY: &str = "accumulator";

#[derive(Debug, Default)]
pub struct AccumulatorNode {
    total: f64,
}

impl AccumulatorNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    fn add(&mut self, samples: &[f64]) {
        self.total += samples.iter().sum::<f64>();
    }
}

pub fn create(_args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    Ok(Box::new(AccumulatorNode::new()))
}

impl NodeBehavior for AccumulatorNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", PortDataType::Array)]
    }

    fn data_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.add(buffer.written_samples());
        }
        Ok(())
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        while let Some(buffer) = input.read_count(Some(input.queued())) {
            self.add(buffer.written_samples());
        }
        Ok(FlushState::Empty)
    }

    fn save_state(&self) -> PersistedFields {
        PersistedFields::from([("total".to_string(), PersistedValue::Double(self.total))])
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.total = field(fields, "total")?
            .as_f64()
            .ok_or_else(|| EngineError::InvalidArgument("total must be a number".to_string()))?;
        Ok(())
    }

    /// Writing `total` restarts the sum from the given value.
    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("total", AttributeValue::Double(self.total))]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "total" => {
                self.total = value.expect_float(name)?;
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
    use crate::config::EngineSettings;
    use crate::pipeline::context::EngineContext;
    use crate::pipeline::id::NodeId;
    use crate::pipeline::node::Node;
    use crate::pipeline::nodes::signal_source::{feed, SignalSourceNode};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_state_round_trip() {
        let mut acc = AccumulatorNode::new();
        acc.add(&[1.5, 2.5, -1.0]);
        let mut restored = AccumulatorNode::new();
        restored.load_state(&acc.save_state()).unwrap();
        assert_eq!(restored.total(), 3.0);
        assert!(restored.load_state(&PersistedFields::new()).is_err());
    }

    #[test]
    fn test_total_covers_dispatched_and_flushed_samples() {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::new(1000)), Arc::clone(&engine)).unwrap();
        let acc = Node::new(NodeId(1), "Total", Box::new(AccumulatorNode::new()), Arc::clone(&engine)).unwrap();
        source.outputs()[0].connect(&acc.inputs()[0]).unwrap();
        acc.prepare_processing().unwrap();
        for node in [&acc, &source] {
            node.start().unwrap();
        }

        // One full dispatch buffer of 100 samples plus 50 left for the flush.
        feed(&source).unwrap().push(&vec![1.0; 150]).unwrap();
        assert!(engine.scheduler().wait_idle(Duration::from_secs(5)));
        assert_eq!(acc.with_behavior(|a: &AccumulatorNode| a.total()), Some(100.0));
        assert_eq!(acc.flush_data().unwrap(), FlushState::Empty);
        assert_eq!(acc.with_behavior(|a: &AccumulatorNode| a.total()), Some(150.0));

        acc.set_attribute("total", &AttributeValue::Double(0.0)).unwrap();
        assert_eq!(acc.with_behavior(|a: &AccumulatorNode| a.total()), Some(0.0));
        assert!(acc.set_attribute("reset", &AttributeValue::Bool(true)).is_err());

        for node in [&source, &acc] {
            node.stop().unwrap();
        }
    }
}
