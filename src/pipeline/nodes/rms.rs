//! RmsNode: root mean square over consecutive windows.
//!
//! Every `window_ms` worth of input yields one value, so the output runs at
//! the input rate divided by the window length in samples. Windows do not
//! overlap. A partial window left over when processing stops is dropped.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::arg;
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{field, PersistedFields, PersistedValue};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;

pub const TYPE_KEY: &str = "rms";

const DEFAULT_WINDOW_MS: f64 = 100.0;

/// Windows of two samples or fewer are not worth a stream of their own.
const MIN_WINDOW: usize = 3;

#[derive(Debug)]
pub struct RmsNode {
    window_ms: f64,
    /// Samples per window at the current input rate
    window: usize,
    counter: usize,
    sum: f64,
    /// Stamp of the first sample after start
    origin: Option<TimeStamp>,
    emitted: u64,
}

impl RmsNode {
    pub fn new(window_ms: f64) -> Self {
        Self {
            window_ms,
            window: 0,
            counter: 0,
            sum: 0.0,
            origin: None,
            emitted: 0,
        }
    }

    pub fn window_ms(&self) -> f64 {
        self.window_ms
    }

    /// Values emitted since start.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn window_for(&self, rate: u32) -> usize {
        (self.window_ms * rate as f64 / 1000.0).max(0.0) as usize
    }

    fn output_rate(window: usize, rate: u32) -> u32 {
        if window >= MIN_WINDOW {
            rate / window as u32
        } else {
            0
        }
    }

    /// Add `samples` to the running window and return the values of every
    /// window they complete.
    fn accumulate(&mut self, samples: &[f64]) -> Vec<f64> {
        let mut values = Vec::new();
        if self.window == 0 {
            return values;
        }
        for sample in samples {
            self.sum += sample * sample;
            self.counter += 1;
            if self.counter == self.window {
                values.push((self.sum / self.window as f64).sqrt());
                self.counter = 0;
                self.sum = 0.0;
            }
        }
        values
    }

    fn process(&mut self, core: &NodeCore, buffer: &TimeLocatedBuffer) -> Result<usize> {
        let origin = *self.origin.get_or_insert(buffer.front_time());
        let values = self.accumulate(buffer.written_samples());
        if values.is_empty() {
            return Ok(0);
        }
        let output = core.output(0);
        let rate = output.samplerate();
        self.emitted += values.len() as u64;
        let end = origin.add_samples(self.emitted as i64, rate);
        let count = values.len();
        output.send(&TimeLocatedBuffer::from_samples(values, rate, end))?;
        Ok(count)
    }

    fn update_output_rate(&mut self, core: &NodeCore) -> Result<()> {
        let rate = core.input(0).samplerate();
        self.window = self.window_for(rate);
        core.output(0).set_samplerate(Self::output_rate(self.window, rate))
    }
}

impl Default for RmsNode {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS)
    }
}

fn check_window_ms(window_ms: f64) -> Result<f64> {
    if window_ms > 0.0 && window_ms.is_finite() {
        Ok(window_ms)
    } else {
        Err(EngineError::InvalidAttribute {
            attribute: "window_ms".to_string(),
            message: format!("{} is not a positive duration", window_ms),
        })
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let window_ms = match arg(args, "window_ms") {
        Some(value) => check_window_ms(value.expect_float("window_ms")?)?,
        None => DEFAULT_WINDOW_MS,
    };
    Ok(Box::new(RmsNode::new(window_ms)))
}

impl NodeBehavior for RmsNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![
            PortDescriptor::input("in", PortDataType::Array),
            PortDescriptor::output("rms", PortDataType::Array),
        ]
    }

    fn input_samplerate_changed(&mut self, core: &NodeCore, _port: &InputPort) -> Result<()> {
        self.update_output_rate(core)
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        let rate = core.input(0).samplerate();
        self.window = self.window_for(rate);
        if rate == 0 || Self::output_rate(self.window, rate) == 0 {
            return Err(EngineError::InvalidAttribute {
                attribute: "window_ms".to_string(),
                message: format!("{} ms is too short at {} Hz", self.window_ms, rate),
            });
        }
        core.init_input_buffers()
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        self.counter = 0;
        self.sum = 0.0;
        self.origin = None;
        self.emitted = 0;
        Ok(())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        if let Some(buffer) = port.read() {
            self.process(core, &buffer)?;
        }
        Ok(())
    }

    /// Reads no more input than the consumers have room for in values.
    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let input = core.input(0);
        let mut state = FlushState::Empty;
        loop {
            let count = core
                .output(0)
                .min_free()
                .saturating_mul(self.window)
                .saturating_sub(self.counter)
                .min(input.queued())
                .min(input.buffer_len());
            if count == 0 {
                break;
            }
            let Some(buffer) = input.read_count(Some(count)) else {
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
        fields.insert("counter".into(), PersistedValue::Int(self.counter as i64));
        fields.insert("sum".into(), PersistedValue::Double(self.sum));
        fields.insert("emitted".into(), PersistedValue::Int(self.emitted as i64));
        if let Some(origin) = self.origin {
            fields.insert("origin".into(), PersistedValue::Stamp(origin));
        }
        fields
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        let bad = |name: &str| EngineError::InvalidArgument(format!("persisted field '{}' has the wrong type", name));
        self.counter = field(fields, "counter")?.as_i64().ok_or_else(|| bad("counter"))?.max(0) as usize;
        self.sum = field(fields, "sum")?.as_f64().ok_or_else(|| bad("sum"))?;
        self.emitted = fields.get("emitted").and_then(PersistedValue::as_i64).unwrap_or(0).max(0) as u64;
        self.origin = fields.get("origin").and_then(PersistedValue::as_stamp);
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![Attribute::new("window_ms", AttributeValue::Double(self.window_ms)).locked_while_running()]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "window_ms" => {
                self.window_ms = check_window_ms(value.expect_float(name)?)?;
                self.counter = 0;
                self.sum = 0.0;
                self.update_output_rate(core)
            }
            _ => Err(EngineError::UnknownAttribute {
                node: core.name().to_string(),
                attribute: name.to_string(),
            }),
        }
    }
}
