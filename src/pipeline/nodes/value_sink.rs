//! ValueSinkNode: collects time-located values.

use crate::error::Result;
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{PersistedFields, PersistedValue};
use crate::pipeline::time_located::TimeLocatedValue;

pub const TYPE_KEY: &str = "value_sink";

#[derive(Debug, Default)]
pub struct ValueSinkNode {
    values: Vec<TimeLocatedValue>,
}

impl ValueSinkNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values received, in arrival order.
    pub fn values(&self) -> &[TimeLocatedValue] {
        &self.values
    }

    pub fn last(&self) -> Option<TimeLocatedValue> {
        self.values.last().copied()
    }
}

pub fn create(_args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    Ok(Box::new(ValueSinkNode::new()))
}

impl NodeBehavior for ValueSinkNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", PortDataType::Value)]
    }

    fn value_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(value) = port.pop_value() {
            self.values.push(value);
        }
        Ok(())
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        while let Some(value) = core.input(0).pop_value() {
            self.values.push(value);
        }
        Ok(FlushState::Empty)
    }

    fn save_state(&self) -> PersistedFields {
        PersistedFields::from([("values".to_string(), PersistedValue::Values(self.values.clone()))])
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.values = fields
            .get("values")
            .and_then(PersistedValue::as_values)
            .map(<[TimeLocatedValue]>::to_vec)
            .unwrap_or_default();
        Ok(())
    }
}
