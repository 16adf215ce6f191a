//! ResampleNode: converts a stream to the `samplerate` attribute's rate.
//!
//! The output rate is set by the attribute, not by the input. Outputs are
//! stamped from the first input sample at the output rate; the converter's
//! latency is not part of the stamp. Input still inside the kernel's reach
//! when processing stops is dropped.

use crate::analysis::StreamResampler;
use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::arg;
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{PersistedFields, PersistedValue};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;

pub const TYPE_KEY: &str = "resample";

const DEFAULT_RATE: u32 = 1000;

#[derive(Debug)]
pub struct ResampleNode {
    out_rate: u32,
    in_rate: u32,
    resampler: Option<StreamResampler>,
    origin: Option<TimeStamp>,
}

impl ResampleNode {
    pub fn new(out_rate: u32) -> Self {
        Self {
            out_rate,
            in_rate: 0,
            resampler: None,
            origin: None,
        }
    }

    pub fn samplerate(&self) -> u32 {
        self.out_rate
    }

    /// Outputs produced since start.
    pub fn produced(&self) -> u64 {
        self.resampler.as_ref().map_or(0, StreamResampler::produced)
    }

    fn resampler(&mut self) -> Result<&mut StreamResampler> {
        if self.resampler.is_none() {
            self.resampler = Some(StreamResampler::new(self.in_rate, self.out_rate)?);
        }
        self.resampler
            .as_mut()
            .ok_or_else(|| EngineError::InvalidArgument("resampler not built".to_string()))
    }

    /// Push `buffer` (if any) and send up to `max` outputs.
    fn process(&mut self, core: &NodeCore, buffer: Option<&TimeLocatedBuffer>, max: usize) -> Result<usize> {
        if let Some(buffer) = buffer {
            self.origin.get_or_insert(buffer.front_time());
        }
        let out_rate = self.out_rate;
        let resampler = self.resampler()?;
        if let Some(buffer) = buffer {
            resampler.push(buffer.written_samples());
        }
        let values = resampler.pull(max);
        let produced = resampler.produced();
        if values.is_empty() {
            return Ok(0);
        }
        let origin = self.origin.unwrap_or(TimeStamp::ZERO);
        let end = origin.add_samples(produced as i64, out_rate);
        let count = values.len();
        core.output(0)
            .send(&TimeLocatedBuffer::from_samples(values, out_rate, end))?;
        Ok(count)
    }
}

impl Default for ResampleNode {
    fn default() -> Self {
        Self::new(DEFAULT_RATE)
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let rate = match arg(args, "samplerate") {
        Some(value) => value.expect_positive("samplerate")?,
        None => DEFAULT_RATE,
    };
    Ok(Box::new(ResampleNode::new(rate)))
}

impl NodeBehavior for ResampleNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDataType::Array),
            PortDescriptor::output("out", PortDataType::Array),
        ]
    }

    fn initialize(&mut self, core: &NodeCore) -> Result<()> {
        core.output(0).set_samplerate(self.out_rate)
    }

    fn input_samplerate_changed(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        self.in_rate = port.samplerate();
        self.resampler = None;
        Ok(())
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        core.init_input_buffers()?;
        self.resampler = Some(StreamResampler::new(self.in_rate, self.out_rate)?);
        Ok(())
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.origin = None;
        Ok(())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.process(core, Some(&buffer), usize::MAX)?;
        }
        Ok(())
    }

    /// Outputs are capped by the consumers' free space. What doesn't fit
    /// stays in the converter for the next pass.
    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        let mut state = FlushState::Empty;
        loop {
            let free = core.output(0).min_free();
            if free == 0 {
                break;
            }
            let buffer = match input.queued().min(input.buffer_len()) {
                0 => None,
                count => input.read_count(Some(count)),
            };
            let emitted = self.process(core, buffer.as_ref(), free)?;
            if emitted > 0 {
                state = FlushState::Some;
            } else if buffer.is_none() {
                break;
            }
        }
        Ok(state)
    }

    fn save_state(&self) -> PersistedFields {
        let mut fields = PersistedFields::new();
        if let Some(resampler) = &self.resampler {
            let (history, base, received, produced) = resampler.save();
            fields.insert("history".into(), PersistedValue::Samples(history));
            fields.insert("base".into(), PersistedValue::Int(base as i64));
            fields.insert("received".into(), PersistedValue::Int(received as i64));
            fields.insert("produced".into(), PersistedValue::Int(produced as i64));
        }
        if let Some(origin) = self.origin {
            fields.insert("origin".into(), PersistedValue::Stamp(origin));
        }
        fields
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.origin = fields.get("origin").and_then(PersistedValue::as_stamp);
        let Some(history) = fields.get("history").and_then(PersistedValue::as_samples) else {
            return Ok(());
        };
        let count = |name: &str| fields.get(name).and_then(PersistedValue::as_i64).unwrap_or(0).max(0) as u64;
        let (base, received, produced) = (count("base"), count("received"), count("produced"));
        self.resampler()?.restore(history.to_vec(), base, received, produced)
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("samplerate", AttributeValue::Int(self.out_rate as i64)).locked_while_running()]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "samplerate" => {
                let rate = value.expect_positive(name)?;
                core.output(0).set_samplerate(rate)?;
                self.out_rate = rate;
                self.resampler = None;
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
    use crate::pipeline::nodes::collector_sink::CollectorSinkNode;
    use crate::pipeline::nodes::signal_source::{feed, SignalSourceNode};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_output_rate_comes_from_attribute() {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::new(1000)), Arc::clone(&engine)).unwrap();
        let resample = Node::new(NodeId(1), "Resample", Box::new(ResampleNode::new(500)), Arc::clone(&engine)).unwrap();
        let sink = Node::new(NodeId(2), "Sink", Box::new(CollectorSinkNode::new(false)), engine).unwrap();
        source.outputs()[0].connect(&resample.inputs()[0]).unwrap();
        resample.outputs()[0].connect(&sink.inputs()[0]).unwrap();
        assert_eq!(sink.inputs()[0].samplerate(), 500);

        resample.set_attribute("samplerate", &AttributeValue::Int(250)).unwrap();
        assert_eq!(sink.inputs()[0].samplerate(), 250);
        assert!(resample.set_attribute("samplerate", &AttributeValue::Int(0)).is_err());
        assert_eq!(resample.outputs()[0].samplerate(), 250);
    }

    #[test]
    fn test_downsampled_stream_and_flush() {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::new(1000)), Arc::clone(&engine)).unwrap();
        let resample = Node::new(NodeId(1), "Resample", Box::new(ResampleNode::new(500)), Arc::clone(&engine)).unwrap();
        let sink = Node::new(NodeId(2), "Sink", Box::new(CollectorSinkNode::new(true)), Arc::clone(&engine)).unwrap();
        source.outputs()[0].connect(&resample.inputs()[0]).unwrap();
        resample.outputs()[0].connect(&sink.inputs()[0]).unwrap();
        for node in [&sink, &resample] {
            node.prepare_processing().unwrap();
        }
        for node in [&sink, &resample, &source] {
            node.start().unwrap();
        }

        // 100 samples dispatch, 50 wait for the flush.
        feed(&source).unwrap().push(&vec![1.0; 150]).unwrap();
        assert!(engine.scheduler().wait_idle(Duration::from_secs(5)));
        let before = resample.with_behavior(|r: &ResampleNode| r.produced()).unwrap();
        assert!(before > 0);

        assert_eq!(resample.flush_data().unwrap(), FlushState::Some);
        let produced = resample.with_behavior(|r: &ResampleNode| r.produced()).unwrap();
        assert!(produced > before);
        // Output k sits at input 2k and needs the kernel's reach past it.
        let reach = StreamResampler::new(1000, 500).unwrap().latency();
        assert_eq!(produced, (150 - reach - 1) / 2 + 1);

        sink.flush_data().unwrap();
        let (samples, last) = sink
            .with_behavior(|s: &CollectorSinkNode| (s.samples().to_vec(), s.last_stamp()))
            .unwrap();
        assert_eq!(samples.len() as u64, produced);
        assert!(samples.iter().all(|v| (v - 1.0).abs() < 1e-9));
        assert_eq!(last, Some(TimeStamp::from_samples(produced as i64, 500)));

        for node in [&source, &resample, &sink] {
            node.stop().unwrap();
        }
    }
}
