//! SpectrumNode: windowed FFT of a sample stream.
//!
//! Consecutive windows of `fft_size` samples overlap by half. Each window
//! yields one frame of `fft_size / 2` magnitudes on the FFT output, so the
//! frame stream advances exactly as fast as the input and keeps its
//! samplerate. A frame is stamped with the time of its window's end.

use crate::analysis::{is_valid_fft_size, SpectrumAnalyzer, WindowFunction};
use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::arg;
use crate::pipeline::port::{fft_frame_len, InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{PersistedFields, PersistedValue};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;

pub const TYPE_KEY: &str = "spectrum";

const DEFAULT_FFT_SIZE: usize = 256;

pub struct SpectrumNode {
    fft_size: usize,
    window: WindowFunction,
    analyzer: Option<SpectrumAnalyzer>,
    /// Samples not yet covered by a full window, oldest first.
    pending: Vec<f64>,
    /// Stamp of the end of `pending`.
    pending_end: TimeStamp,
    frames: u64,
}

impl SpectrumNode {
    pub fn new(fft_size: usize, window: WindowFunction) -> Result<Self> {
        check_fft_size(fft_size)?;
        Ok(Self {
            fft_size,
            window,
            analyzer: None,
            pending: Vec::new(),
            pending_end: TimeStamp::ZERO,
            frames: 0,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn window(&self) -> WindowFunction {
        self.window
    }

    /// Frames emitted since creation.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn hop(&self) -> usize {
        fft_frame_len(self.fft_size)
    }

    /// Append `buffer` and emit every full window it completes.
    fn process(&mut self, core: &NodeCore, buffer: &TimeLocatedBuffer) -> Result<usize> {
        self.pending.extend_from_slice(buffer.written_samples());
        self.pending_end = buffer.current_time();

        let rate = buffer.rate();
        let hop = self.hop();
        let mut emitted = 0;
        while self.pending.len() >= self.fft_size {
            if self.analyzer.is_none() {
                self.analyzer = Some(SpectrumAnalyzer::new(self.fft_size, self.window)?);
            }
            let Some(analyzer) = self.analyzer.as_mut() else {
                break;
            };
            let magnitudes = analyzer.frame(&self.pending[..self.fft_size])?;
            let after = (self.pending.len() - self.fft_size) as i64;
            let end = self.pending_end.sub_samples(after, rate);
            core.output(0)
                .send(&TimeLocatedBuffer::from_samples(magnitudes, rate, end))?;
            self.pending.drain(..hop);
            emitted += 1;
        }
        self.frames += emitted as u64;
        Ok(emitted)
    }
}

fn check_fft_size(size: usize) -> Result<()> {
    if is_valid_fft_size(size) {
        Ok(())
    } else {
        Err(EngineError::InvalidAttribute {
            attribute: "fft_size".to_string(),
            message: format!("{} is not a power of two of at least 2", size),
        })
    }
}

fn parse_window(value: &AttributeValue) -> Result<WindowFunction> {
    let key = value.expect_option("window", &WindowFunction::keys())?;
    WindowFunction::from_key(&key).ok_or_else(|| EngineError::InvalidAttribute {
        attribute: "window".to_string(),
        message: format!("unknown window '{}'", key),
    })
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let fft_size = match arg(args, "fft_size") {
        Some(value) => value.expect_positive("fft_size")? as usize,
        None => DEFAULT_FFT_SIZE,
    };
    let window = match arg(args, "window") {
        Some(value) => parse_window(value)?,
        None => WindowFunction::default(),
    };
    Ok(Box::new(SpectrumNode::new(fft_size, window)?))
}

impl NodeBehavior for SpectrumNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDataType::Array),
            PortDescriptor::output("spectrum", PortDataType::Fft),
        ]
    }

    fn initialize(&mut self, core: &NodeCore) -> Result<()> {
        core.output(0).set_fft_size(self.fft_size)
    }

    fn input_samplerate_changed(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        core.output(0).set_samplerate(port.samplerate())
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        self.analyzer = Some(SpectrumAnalyzer::new(self.fft_size, self.window)?);
        core.init_input_buffers()
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        self.pending.clear();
        self.pending_end = TimeStamp::ZERO;
        Ok(())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.process(core, &buffer)?;
        }
        Ok(())
    }

    /// Feeds the queue through one hop at a time, so every chunk yields at
    /// most one frame and never more than the consumers have room for.
    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        let hop = self.hop();
        let mut state = FlushState::Empty;
        while core.output(0).min_free() >= hop {
            let Some(buffer) = input.read_count(Some(hop)) else {
                break;
            };
            if self.process(core, &buffer)? > 0 {
                state = FlushState::Some;
            }
        }
        Ok(state)
    }

    fn save_state(&self) -> PersistedFields {
        let mut fields = PersistedFields::new();
        fields.insert("pending".into(), PersistedValue::Samples(self.pending.clone()));
        fields.insert("pending_end".into(), PersistedValue::Stamp(self.pending_end));
        fields.insert("frames".into(), PersistedValue::Int(self.frames as i64));
        fields
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        self.pending = fields
            .get("pending")
            .and_then(PersistedValue::as_samples)
            .map(<[f64]>::to_vec)
            .unwrap_or_default();
        self.pending_end = fields
            .get("pending_end")
            .and_then(PersistedValue::as_stamp)
            .unwrap_or(TimeStamp::ZERO);
        self.frames = fields.get("frames").and_then(PersistedValue::as_i64).unwrap_or(0) as u64;
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::new("fft_size", AttributeValue::Int(self.fft_size as i64)).locked_while_running(),
            Attribute::enumeration("window", self.window.key(), &WindowFunction::keys())
                .locked_while_running(),
        ]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "fft_size" => {
                let size = value.expect_positive(name)? as usize;
                check_fft_size(size)?;
                core.output(0).set_fft_size(size)?;
                self.fft_size = size;
                self.analyzer = None;
                self.pending.clear();
            }
            "window" => {
                self.window = parse_window(value)?;
                self.analyzer = None;
            }
            _ => {
                return Err(EngineError::UnknownAttribute {
                    node: core.name().to_string(),
                    attribute: name.to_string(),
                })
            }
        }
        Ok(())
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
    use crate::pipeline::nodes::spectrum_sink::SpectrumSinkNode;
    use std::f64::consts::PI;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_rejects_bad_fft_size() {
        assert!(SpectrumNode::new(100, WindowFunction::Hann).is_err());
        let mut args = NodeArgs::new();
        args.insert("window".into(), AttributeValue::Text("kaiser".into()));
        assert!(create(&args).is_err());
    }

    #[test]
    fn test_fft_size_propagates_downstream() {
        let engine = EngineContext::new(EngineSettings::default());
        let spectrum = Node::new(
            NodeId(0),
            "Spectrum",
            Box::new(SpectrumNode::new(64, WindowFunction::Hann).unwrap()),
            Arc::clone(&engine),
        )
        .unwrap();
        let sink = Node::new(NodeId(1), "Peaks", Box::new(SpectrumSinkNode::new()), engine).unwrap();
        spectrum.outputs()[0].connect(&sink.inputs()[0]).unwrap();
        assert_eq!(sink.inputs()[0].fft_size(), 64);

        spectrum.set_attribute("fft_size", &AttributeValue::Int(128)).unwrap();
        assert_eq!(sink.inputs()[0].fft_size(), 128);
        assert!(spectrum.set_attribute("fft_size", &AttributeValue::Int(96)).is_err());
    }

    #[test]
    fn test_frames_overlap_and_find_peak() {
        let engine = EngineContext::new(EngineSettings::default());
        let source = Node::new(NodeId(0), "Source", Box::new(SignalSourceNode::new(1000)), Arc::clone(&engine)).unwrap();
        let spectrum = Node::new(
            NodeId(1),
            "Spectrum",
            Box::new(SpectrumNode::new(64, WindowFunction::Rectangular).unwrap()),
            Arc::clone(&engine),
        )
        .unwrap();
        let sink = Node::new(NodeId(2), "Peaks", Box::new(SpectrumSinkNode::new()), Arc::clone(&engine)).unwrap();
        source.outputs()[0].connect(&spectrum.inputs()[0]).unwrap();
        spectrum.outputs()[0].connect(&sink.inputs()[0]).unwrap();
        for node in [&sink, &spectrum] {
            node.prepare_processing().unwrap();
        }
        for node in [&sink, &spectrum, &source] {
            node.start().unwrap();
        }

        // 125 Hz sits exactly on bin 8 of a 64 point FFT at 1000 Hz.
        let signal: Vec<f64> = (0..300)
            .map(|i| (2.0 * PI * 125.0 * i as f64 / 1000.0).sin())
            .collect();
        feed(&source).unwrap().push(&signal).unwrap();
        assert!(engine.scheduler().wait_idle(Duration::from_secs(5)));

        // Windows end at 64, 96, ..., 288: 8 frames of 32 values.
        assert_eq!(spectrum.with_behavior(|s: &SpectrumNode| s.frames()), Some(8));
        let (frames, peak) = sink
            .with_behavior(|s: &SpectrumSinkNode| (s.frames(), s.peak_frequency()))
            .unwrap();
        assert_eq!(frames, 8);
        assert!((peak.unwrap() - 125.0).abs() < 1e-9);
        assert_eq!(
            sink.inputs()[0].queue_end_time(),
            Some(TimeStamp::from_samples(288, 1000))
        );

        for node in [&source, &spectrum, &sink] {
            node.stop().unwrap();
        }
    }
}
