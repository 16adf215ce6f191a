//! AdderNode: sample-wise sum of N inputs.
//!
//! The number of inputs is fixed when the node is created (`inputs`
//! argument, default 2). A packet is summed once every connected input holds
//! one; unconnected inputs don't take part. All connected inputs must run at
//! the same samplerate.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::arg;
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::time_located::TimeLocatedBuffer;
use std::sync::Arc;

pub const TYPE_KEY: &str = "adder";

const DEFAULT_INPUTS: usize = 2;

#[derive(Debug)]
pub struct AdderNode {
    inputs: usize,
}

impl AdderNode {
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs: inputs.max(1),
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs
    }

    fn connected(core: &NodeCore) -> Vec<&Arc<InputPort>> {
        core.inputs().iter().filter(|p| p.is_connected()).collect()
    }

    /// Read `count` samples from every input in `inputs` and send their sum.
    fn sum_and_send(core: &NodeCore, inputs: &[&Arc<InputPort>], count: usize) -> Result<()> {
        let mut sum: Option<TimeLocatedBuffer> = None;
        for input in inputs {
            let Some(buffer) = input.read_count(Some(count)) else {
                continue;
            };
            match sum.as_mut() {
                None => sum = Some(buffer),
                Some(total) => {
                    let n = total.written().min(buffer.written());
                    for (acc, s) in total.samples_mut()[..n].iter_mut().zip(buffer.written_samples()) {
                        *acc += s;
                    }
                }
            }
        }
        match sum {
            Some(buffer) => core.output(0).send(&buffer),
            None => Ok(()),
        }
    }
}

impl Default for AdderNode {
    fn default() -> Self {
        Self::new(DEFAULT_INPUTS)
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let inputs = match arg(args, "inputs") {
        Some(value) => value.expect_positive("inputs")? as usize,
        None => DEFAULT_INPUTS,
    };
    Ok(Box::new(AdderNode::new(inputs)))
}

impl NodeBehavior for AdderNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        let mut ports: Vec<PortDescriptor> = (0..self.inputs)
            .map(|i| PortDescriptor::input(format!("in{}", i), PortDataType::Array))
            .collect();
        ports.push(PortDescriptor::output("out", PortDataType::Array));
        ports
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        let connected = Self::connected(core);
        if let Some(first) = connected.first() {
            let expected = first.samplerate();
            if let Some(other) = connected.iter().find(|p| p.samplerate() != expected) {
                return Err(EngineError::RateMismatch {
                    expected,
                    actual: other.samplerate(),
                });
            }
        }
        core.init_input_buffers()
    }

    fn input_samplerate_changed(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        if port.samplerate() != 0 {
            core.output(0).set_samplerate(port.samplerate())?;
        }
        Ok(())
    }

    fn data_available(&mut self, core: &NodeCore, _port: &InputPort) -> Result<()> {
        let connected = Self::connected(core);
        let Some(packet) = connected.iter().map(|p| p.buffer_len()).min() else {
            return Ok(());
        };
        let ready = connected.iter().map(|p| p.queued()).min().unwrap_or(0);
        if ready < packet {
            return Ok(());
        }
        Self::sum_and_send(core, &connected, packet)
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let connected = Self::connected(core);
        let Some(packet) = connected.iter().map(|p| p.buffer_len()).min() else {
            return Ok(FlushState::Empty);
        };
        let mut state = FlushState::Empty;
        loop {
            let common = connected.iter().map(|p| p.queued()).min().unwrap_or(0);
            let count = common.min(packet).min(core.output(0).min_free());
            if count == 0 {
                break;
            }
            Self::sum_and_send(core, &connected, count)?;
            state = FlushState::Some;
        }
        Ok(state)
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("inputs", AttributeValue::Int(self.inputs as i64)).locked_while_running()]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "inputs" => {
                let requested = value.expect_positive(name)? as usize;
                if requested != self.inputs {
                    return Err(EngineError::InvalidAttribute {
                        attribute: name.to_string(),
                        message: format!(
                            "input count is fixed at {}, create a new node for {}",
                            self.inputs, requested
                        ),
                    });
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
