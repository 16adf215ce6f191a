//! GainNode: multiplies every sample by a factor.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::{arg, flush_through};
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{field, PersistedFields, PersistedValue};

pub const TYPE_KEY: &str = "gain";

#[derive(Debug)]
pub struct GainNode {
    factor: f64,
}

impl GainNode {
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl Default for GainNode {
    fn default() -> Self {
        Self::new(1.0)
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let factor = match arg(args, "factor") {
        Some(value) => value.expect_float("factor")?,
        None => 1.0,
    };
    Ok(Box::new(GainNode::new(factor)))
}

impl NodeBehavior for GainNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDataType::Array),
            PortDescriptor::output("out", PortDataType::Array),
        ]
    }

    fn input_samplerate_changed(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        core.output(0).set_samplerate(port.samplerate())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        let Some(mut buffer) = port.read() else {
            return Ok(());
        };
        let written = buffer.written();
        for sample in &mut buffer.samples_mut()[..written] {
            *sample *= self.factor;
        }
        core.output(0).send(&buffer)
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let factor = self.factor;
        flush_through(core.input(0), core.output(0), |samples| {
            samples.iter_mut().for_each(|s| *s *= factor);
        })
    }

    fn save_state(&self) -> PersistedFields {
        PersistedFields::from([("factor".to_string(), PersistedValue::Double(self.factor))])
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.factor = field(fields, "factor")?
            .as_f64()
            .ok_or_else(|| EngineError::InvalidArgument("factor must be a number".to_string()))?;
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("factor", AttributeValue::Double(self.factor))]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "factor" => {
                self.factor = value.expect_float(name)?;
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

    #[test]
    fn test_create_reads_factor() {
        let mut args = NodeArgs::new();
        args.insert("factor".into(), AttributeValue::Double(2.5));
        let node = create(&args).unwrap();
        assert_eq!(node.attributes()[0].value, AttributeValue::Double(2.5));

        args.insert("factor".into(), AttributeValue::Text("loud".into()));
        assert!(create(&args).is_err());
    }

    #[test]
    fn test_state_round_trip() {
        let gain = GainNode::new(4.0);
        let mut other = GainNode::default();
        other.load_state(&gain.save_state()).unwrap();
        assert_eq!(other.factor(), 4.0);
        assert!(other.load_state(&PersistedFields::new()).is_err());
    }
}
