//! PassthroughNode: forwards `in` to `out` unchanged.

use crate::error::Result;
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::flush_through;
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;

pub const TYPE_KEY: &str = "passthrough";

#[derive(Debug, Default)]
pub struct PassthroughNode {
    forwarded: u64,
}

impl PassthroughNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples forwarded since creation, flushes included.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

pub fn create(_args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    Ok(Box::new(PassthroughNode::new()))
}

impl NodeBehavior for PassthroughNode {
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
        if let Some(buffer) = port.read() {
            self.forwarded += buffer.written() as u64;
            core.output(0).send(&buffer)?;
        }
        Ok(())
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let forwarded = &mut self.forwarded;
        flush_through(core.input(0), core.output(0), |samples| {
            *forwarded += samples.len() as u64;
        })
    }
}
