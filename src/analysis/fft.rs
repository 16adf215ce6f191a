//! FFT frames for spectrum streams
//!
//! Provides the frequency domain side of the engine:
//! - Window functions applied before each transform
//! - A planner-backed analyzer turning `fft_size` samples into one frame of
//!   `fft_size / 2` magnitudes
//! - Peak lookup on a received frame

use crate::error::{EngineError, Result};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// Window function type for FFT preprocessing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    /// Rectangular window (no windowing)
    Rectangular,
    /// Hann window (good general purpose)
    #[default]
    Hann,
    /// Hamming window (reduced side lobes)
    Hamming,
    /// Blackman window (very low side lobes)
    Blackman,
    /// Flat-top window (accurate amplitude measurement)
    FlatTop,
}

impl WindowFunction {
    /// Attribute value naming this window
    pub fn key(&self) -> &'static str {
        match self {
            WindowFunction::Rectangular => "rectangular",
            WindowFunction::Hann => "hann",
            WindowFunction::Hamming => "hamming",
            WindowFunction::Blackman => "blackman",
            WindowFunction::FlatTop => "flat_top",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::all().iter().copied().find(|w| w.key() == key)
    }

    /// Keys of all window functions, for enum attributes
    pub fn keys() -> Vec<&'static str> {
        Self::all().iter().map(WindowFunction::key).collect()
    }

    pub fn all() -> &'static [WindowFunction] {
        &[
            WindowFunction::Rectangular,
            WindowFunction::Hann,
            WindowFunction::Hamming,
            WindowFunction::Blackman,
            WindowFunction::FlatTop,
        ]
    }

    /// Window coefficient at position i out of n samples
    pub fn coefficient(&self, i: usize, n: usize) -> f64 {
        let x = 2.0 * PI * i as f64 / n as f64;
        match self {
            WindowFunction::Rectangular => 1.0,
            WindowFunction::Hann => 0.5 * (1.0 - x.cos()),
            WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
            // Exactly 0 at the ends, but 0.42 and 0.08 round to -ε there.
            WindowFunction::Blackman => (0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()).max(0.0),
            WindowFunction::FlatTop => {
                0.21557895 - 0.41663158 * x.cos() + 0.277263158 * (2.0 * x).cos()
                    - 0.083578947 * (3.0 * x).cos()
                    + 0.006947368 * (4.0 * x).cos()
            }
        }
    }

    pub fn generate(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.coefficient(i, n)).collect()
    }
}

/// Whether `size` can be used as an FFT size
pub fn is_valid_fft_size(size: usize) -> bool {
    size >= 2 && size.is_power_of_two()
}

/// Turns blocks of `fft_size` samples into magnitude frames.
pub struct SpectrumAnalyzer {
    fft_size: usize,
    window: WindowFunction,
    coefficients: Vec<f64>,
    plan: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize, window: WindowFunction) -> Result<Self> {
        if !is_valid_fft_size(fft_size) {
            return Err(EngineError::InvalidArgument(format!(
                "FFT size {} is not a power of two",
                fft_size
            )));
        }
        let plan = FftPlanner::new().plan_fft_forward(fft_size);
        Ok(Self {
            fft_size,
            window,
            coefficients: window.generate(fft_size),
            plan,
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn window(&self) -> WindowFunction {
        self.window
    }

    /// Values per frame
    pub fn frame_len(&self) -> usize {
        self.fft_size / 2
    }

    /// Magnitudes of bins `0..fft_size / 2` of `samples`, scaled by `2 / N`
    /// so a full-scale sine reads as its amplitude (times the window gain).
    /// `samples` must hold exactly `fft_size` values.
    pub fn frame(&mut self, samples: &[f64]) -> Result<Vec<f64>> {
        if samples.len() != self.fft_size {
            return Err(EngineError::InvalidArgument(format!(
                "FFT of size {} got {} samples",
                self.fft_size,
                samples.len()
            )));
        }
        for ((slot, &s), &w) in self.scratch.iter_mut().zip(samples).zip(&self.coefficients) {
            *slot = Complex::new(s * w, 0.0);
        }
        self.plan.process(&mut self.scratch);

        let scale = 2.0 / self.fft_size as f64;
        Ok(self.scratch[..self.frame_len()]
            .iter()
            .map(|c| c.norm() * scale)
            .collect())
    }
}

/// One magnitude frame with its frequency axis
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub magnitudes: Vec<f64>,
    /// Samplerate of the transformed signal
    pub samplerate: u32,
    pub fft_size: usize,
}

impl Spectrum {
    pub fn new(magnitudes: Vec<f64>, samplerate: u32, fft_size: usize) -> Self {
        Self {
            magnitudes,
            samplerate,
            fft_size,
        }
    }

    /// Hz per bin
    pub fn resolution(&self) -> f64 {
        if self.fft_size == 0 {
            return 0.0;
        }
        self.samplerate as f64 / self.fft_size as f64
    }

    pub fn frequency_at(&self, bin: usize) -> f64 {
        bin as f64 * self.resolution()
    }

    /// Strongest bin above DC as (frequency, magnitude)
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(bin, &mag)| (self.frequency_at(bin), mag))
    }

    /// Magnitudes in dB, floored at -200
    pub fn magnitudes_db(&self) -> Vec<f64> {
        self.magnitudes
            .iter()
            .map(|&m| if m > 1e-10 { 20.0 * m.log10() } else { -200.0 })
            .collect()
    }
}
