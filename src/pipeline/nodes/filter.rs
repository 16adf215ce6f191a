//! FilterNode: one biquad section over a sample stream.
//!
//! The section is designed for the input samplerate, so it is rebuilt when
//! the rate or any filter attribute changes. Rebuilding clears the history.

use crate::analysis::{Biquad, BiquadType};
use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{FlushState, NodeBehavior, NodeCore};
use crate::pipeline::nodes::{arg, flush_through};
use crate::pipeline::port::{InputPort, PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{PersistedFields, PersistedValue};

pub const TYPE_KEY: &str = "filter";

const DEFAULT_CENTER: f64 = 1000.0;
const DEFAULT_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub kind: BiquadType,
    /// Corner or center frequency in Hz
    pub center: f64,
    pub q: f64,
    /// Only used by the peak and shelf types
    pub gain_db: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            kind: BiquadType::default(),
            center: DEFAULT_CENTER,
            q: DEFAULT_Q,
            gain_db: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct FilterNode {
    params: FilterParams,
    rate: u32,
    section: Option<Biquad>,
}

impl FilterNode {
    pub fn new(params: FilterParams) -> Result<Self> {
        check_center(params.center)?;
        check_q(params.q)?;
        Ok(Self {
            params,
            rate: 0,
            section: None,
        })
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }

    fn rebuild(&mut self) {
        self.section = (self.rate > 0).then(|| {
            Biquad::new(
                self.params.kind,
                self.params.center / self.rate as f64,
                self.params.q,
                self.params.gain_db,
            )
        });
    }
}

fn check_center(center: f64) -> Result<()> {
    if center > 0.0 && center.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidAttribute {
            attribute: "center".to_string(),
            message: format!("{} is not a positive frequency", center),
        })
    }
}

/// A rate of 0 means not connected yet, which the input buffers report.
fn check_below_nyquist(center: f64, rate: u32) -> Result<()> {
    if rate == 0 || center * 2.0 < rate as f64 {
        Ok(())
    } else {
        Err(EngineError::InvalidAttribute {
            attribute: "center".to_string(),
            message: format!("{} Hz is not below the Nyquist frequency of {} Hz", center, rate),
        })
    }
}

fn check_q(q: f64) -> Result<()> {
    if q > 0.0 && q.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidAttribute {
            attribute: "q".to_string(),
            message: format!("{} is not a positive quality factor", q),
        })
    }
}

fn parse_kind(value: &AttributeValue) -> Result<BiquadType> {
    let key = value.expect_option("type", &BiquadType::keys())?;
    BiquadType::from_key(&key).ok_or_else(|| EngineError::InvalidAttribute {
        attribute: "type".to_string(),
        message: format!("unknown filter type '{}'", key),
    })
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let mut params = FilterParams::default();
    if let Some(value) = arg(args, "type") {
        params.kind = parse_kind(value)?;
    }
    if let Some(value) = arg(args, "center") {
        params.center = value.expect_float("center")?;
    }
    if let Some(value) = arg(args, "q") {
        params.q = value.expect_float("q")?;
    }
    if let Some(value) = arg(args, "gain_db") {
        params.gain_db = value.expect_float("gain_db")?;
    }
    Ok(Box::new(FilterNode::new(params)?))
}

impl NodeBehavior for FilterNode {
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
        self.rate = port.samplerate();
        self.rebuild();
        core.output(0).set_samplerate(self.rate)
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        check_below_nyquist(self.params.center, self.rate)?;
        core.init_input_buffers()
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        if let Some(section) = self.section.as_mut() {
            section.reset();
        }
        Ok(())
    }

    fn data_available(&mut self, core: &NodeCore, port: &InputPort) -> Result<()> {
        let Some(mut buffer) = port.read() else {
            return Ok(());
        };
        if let Some(section) = self.section.as_mut() {
            let written = buffer.written();
            section.process_in_place(&mut buffer.samples_mut()[..written]);
        }
        core.output(0).send(&buffer)
    }

    fn flush_data(&mut self, core: &NodeCore) -> Result<FlushState> {
        let section = &mut self.section;
        flush_through(core.input(0), core.output(0), |samples| {
            if let Some(section) = section.as_mut() {
                section.process_in_place(samples);
            }
        })
    }

    /// Only the parameters are kept; the filter history starts over.
    fn save_state(&self) -> PersistedFields {
        let mut fields = PersistedFields::new();
        fields.insert("type".into(), PersistedValue::Text(self.params.kind.key().to_string()));
        fields.insert("center".into(), PersistedValue::Double(self.params.center));
        fields.insert("q".into(), PersistedValue::Double(self.params.q));
        fields.insert("gain_db".into(), PersistedValue::Double(self.params.gain_db));
        fields
    }

    fn load_state(&mut self, fields: &PersistedFields) -> Result<()> {
        let mut params = self.params;
        if let Some(kind) = fields.get("type").and_then(PersistedValue::as_text) {
            params.kind = BiquadType::from_key(kind).ok_or_else(|| {
                EngineError::InvalidArgument(format!("unknown filter type '{}'", kind))
            })?;
        }
        let number = |name: &str, current: f64| fields.get(name).and_then(PersistedValue::as_f64).unwrap_or(current);
        params.center = number("center", params.center);
        params.q = number("q", params.q);
        params.gain_db = number("gain_db", params.gain_db);
        check_center(params.center)?;
        check_q(params.q)?;
        self.params = params;
        self.rebuild();
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::enumeration("type", self.params.kind.key(), &BiquadType::keys()),
            Attribute::new("center", AttributeValue::Double(self.params.center)),
            Attribute::new("q", AttributeValue::Double(self.params.q)),
            Attribute::new("gain_db", AttributeValue::Double(self.params.gain_db)),
        ]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "type" => self.params.kind = parse_kind(value)?,
            "center" => {
                let center = value.expect_float(name)?;
                check_center(center)?;
                check_below_nyquist(center, self.rate)?;
                self.params.center = center;
            }
            "q" => {
                let q = value.expect_float(name)?;
                check_q(q)?;
                self.params.q = q;
            }
            "gain_db" => self.params.gain_db = value.expect_float(name)?,
            _ => {
                return Err(EngineError::UnknownAttribute {
                    node: core.name().to_string(),
                    attribute: name.to_string(),
                })
            }
        }
        self.rebuild();
        Ok(())
    }
}
