//! Second-order IIR sections
//!
//! Coefficients follow the usual bilinear-transform cookbook forms. The
//! corner frequency is given relative to the samplerate (`fc / rate`), so a
//! section has to be rebuilt whenever the stream's samplerate changes.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

/// Response shape of a biquad section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiquadType {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
    /// Bell around the center frequency, boost or cut by the gain
    Peak,
    LowShelf,
    HighShelf,
}

impl BiquadType {
    /// Attribute value naming this type
    pub fn key(&self) -> &'static str {
        match self {
            BiquadType::Lowpass => "lowpass",
            BiquadType::Highpass => "highpass",
            BiquadType::Bandpass => "bandpass",
            BiquadType::Notch => "notch",
            BiquadType::Peak => "peak",
            BiquadType::LowShelf => "low_shelf",
            BiquadType::HighShelf => "high_shelf",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.key() == key)
    }

    pub fn keys() -> Vec<&'static str> {
        Self::all().iter().map(BiquadType::key).collect()
    }

    pub fn all() -> &'static [BiquadType] {
        &[
            BiquadType::Lowpass,
            BiquadType::Highpass,
            BiquadType::Bandpass,
            BiquadType::Notch,
            BiquadType::Peak,
            BiquadType::LowShelf,
            BiquadType::HighShelf,
        ]
    }
}

/// One biquad section in transposed direct form II.
#[derive(Debug, Clone, PartialEq)]
pub struct Biquad {
    kind: BiquadType,
    a0: f64,
    a1: f64,
    a2: f64,
    b1: f64,
    b2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    /// `fc` is the corner or center frequency divided by the samplerate.
    pub fn new(kind: BiquadType, fc: f64, q: f64, gain_db: f64) -> Self {
        let mut section = Self {
            kind,
            a0: 1.0,
            a1: 0.0,
            a2: 0.0,
            b1: 0.0,
            b2: 0.0,
            z1: 0.0,
            z2: 0.0,
        };
        section.design(fc, q, gain_db);
        section
    }

    /// Forget the filter history.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let y = x * self.a0 + self.z1;
        self.z1 = x * self.a1 + self.z2 - self.b1 * y;
        self.z2 = x * self.a2 - self.b2 * y;
        y
    }

    pub fn process_in_place(&mut self, samples: &mut [f64]) {
        for sample in samples {
            *sample = self.process(*sample);
        }
    }

    fn design(&mut self, fc: f64, q: f64, gain_db: f64) {
        let v = 10f64.powf(gain_db.abs() / 20.0);
        let k = (PI * fc).tan();
        let kk = k * k;
        let boost = gain_db >= 0.0;

        let (a0, a1, a2, b1, b2) = match self.kind {
            BiquadType::Lowpass => {
                let norm = 1.0 / (1.0 + k / q + kk);
                let a0 = kk * norm;
                (a0, 2.0 * a0, a0, 2.0 * (kk - 1.0) * norm, (1.0 - k / q + kk) * norm)
            }
            BiquadType::Highpass => {
                let norm = 1.0 / (1.0 + k / q + kk);
                (norm, -2.0 * norm, norm, 2.0 * (kk - 1.0) * norm, (1.0 - k / q + kk) * norm)
            }
            BiquadType::Bandpass => {
                let norm = 1.0 / (1.0 + k / q + kk);
                let a0 = k / q * norm;
                (a0, 0.0, -a0, 2.0 * (kk - 1.0) * norm, (1.0 - k / q + kk) * norm)
            }
            BiquadType::Notch => {
                let norm = 1.0 / (1.0 + k / q + kk);
                let a0 = (1.0 + kk) * norm;
                let a1 = 2.0 * (kk - 1.0) * norm;
                (a0, a1, a0, a1, (1.0 - k / q + kk) * norm)
            }
            BiquadType::Peak => {
                let (num, den) = if boost { (v, 1.0) } else { (1.0, v) };
                let norm = 1.0 / (1.0 + den / q * k + kk);
                let a1 = 2.0 * (kk - 1.0) * norm;
                (
                    (1.0 + num / q * k + kk) * norm,
                    a1,
                    (1.0 - num / q * k + kk) * norm,
                    a1,
                    (1.0 - den / q * k + kk) * norm,
                )
            }
            BiquadType::LowShelf => {
                let sv = (2.0 * v).sqrt();
                if boost {
                    let norm = 1.0 / (1.0 + SQRT_2 * k + kk);
                    (
                        (1.0 + sv * k + v * kk) * norm,
                        2.0 * (v * kk - 1.0) * norm,
                        (1.0 - sv * k + v * kk) * norm,
                        2.0 * (kk - 1.0) * norm,
                        (1.0 - SQRT_2 * k + kk) * norm,
                    )
                } else {
                    let norm = 1.0 / (1.0 + sv * k + v * kk);
                    (
                        (1.0 + SQRT_2 * k + kk) * norm,
                        2.0 * (kk - 1.0) * norm,
                        (1.0 - SQRT_2 * k + kk) * norm,
                        2.0 * (v * kk - 1.0) * norm,
                        (1.0 - sv * k + v * kk) * norm,
                    )
                }
            }
            BiquadType::HighShelf => {
                let sv = (2.0 * v).sqrt();
                if boost {
                    let norm = 1.0 / (1.0 + SQRT_2 * k + kk);
                    (
                        (v + sv * k + kk) * norm,
                        2.0 * (kk - v) * norm,
                        (v - sv * k + kk) * norm,
                        2.0 * (kk - 1.0) * norm,
                        (1.0 - SQRT_2 * k + kk) * norm,
                    )
                } else {
                    let norm = 1.0 / (v + sv * k + kk);
                    (
                        (1.0 + SQRT_2 * k + kk) * norm,
                        2.0 * (kk - 1.0) * norm,
                        (1.0 - SQRT_2 * k + kk) * norm,
                        2.0 * (kk - v) * norm,
                        (v - sv * k + kk) * norm,
                    )
                }
            }
        };
        self.a0 = a0;
        self.a1 = a1;
        self.a2 = a2;
        self.b1 = b1;
        self.b2 = b2;
        self.reset();
    }
}
