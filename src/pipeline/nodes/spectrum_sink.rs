//! SpectrumSinkNode: keeps the latest spectrum frame.

use crate::analysis::Spectrum;
use crate::error::Result;
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::port::{fft_frame_len, InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{PersistedFields, PersistedValue};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;

pub const TYPE_KEY: &str = "spectrum_sink";

#[derive(Debug, Default)]
pub struct SpectrumSinkNode {
    latest: Option<Spectrum>,
    latest_stamp: Option<TimeStamp>,
    frames: u64,
}

impl SpectrumSinkNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&Spectrum> {
        self.latest.as_ref()
    }

    /// End stamp of the latest frame's window.
    pub fn latest_stamp(&self) -> Option<TimeStamp> {
        self.latest_stamp
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frequency of the strongest bin of the latest frame.
    pub fn peak_frequency(&self) -> Option<f64> {
        self.latest.as_ref().and_then(Spectrum::peak).map(|(freq, _)| freq)
    }

    fn consume(&mut self, port: &InputPort, buffer: &TimeLocatedBuffer) {
        let frame = fft_frame_len(port.fft_size());
        let frames = buffer.written() / frame;
        if let Some(last) = buffer.written_samples().chunks_exact(frame).last() {
            self.latest = Some(Spectrum::new(last.to_vec(), port.samplerate(), port.fft_size()));
            self.latest_stamp = Some(buffer.current_time());
        }
        self.frames += frames as u64;
    }
}

pub fn create(_args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    Ok(Box::new(SpectrumSinkNode::new()))
}

impl NodeBehavior for SpectrumSinkNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::input("in", PortDataType::Fft)]
    }

    fn data_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.consume(port, &buffer);
        }
        Ok(())
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        while let Some(buffer) = input.read_count(Some(input.queued())) {
            self.consume(input, &buffer);
        }
        Ok(FlushState::Empty)
    }

    fn save_state(&self) -> PersistedFields {
        PersistedFields::from([("frames".to_string(), PersistedValue::Int(self.frames as i64))])
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.frames = fields.get("frames").and_then(PersistedValue::as_i64).unwrap_or(0) as u64;
        Ok(())
    }
}
