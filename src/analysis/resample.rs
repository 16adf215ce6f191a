//! Streaming samplerate conversion
//!
//! Every output sample is a windowed-sinc interpolation of the input at its
//! exact position on the input time axis. Output `k` sits at input position
//! `k * in_rate / out_rate`, so arbitrary ratios work without drift. When
//! decimating, the sinc is stretched to cut at 90% of the output Nyquist.
//!
//! An output needs `reach` input samples past its position, which is the
//! latency of the converter. Weights are normalized per output, so DC passes
//! unchanged and a 1:1 conversion returns its input exactly.

use crate::error::{EngineError, Result};
use std::f64::consts::PI;

/// Zero crossings of the sinc on each side of the center
const ZERO_CROSSINGS: f64 = 8.0;

/// Guard band below the output Nyquist when decimating
const DECIMATION_CUTOFF: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct StreamResampler {
    in_rate: u32,
    out_rate: u32,
    /// Normalized to the input Nyquist
    cutoff: f64,
    /// Kernel half width in input samples
    half: f64,
    reach: u64,
    history: Vec<f64>,
    /// Input index of `history[0]`
    base: u64,
    received: u64,
    produced: u64,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self> {
        if in_rate == 0 || out_rate == 0 {
            return Err(EngineError::InvalidArgument(format!(
                "Cannot resample from {} Hz to {} Hz",
                in_rate, out_rate
            )));
        }
        let cutoff = if out_rate < in_rate {
            DECIMATION_CUTOFF * out_rate as f64 / in_rate as f64
        } else {
            1.0
        };
        let half = ZERO_CROSSINGS / cutoff;
        Ok(Self {
            in_rate,
            out_rate,
            cutoff,
            half,
            reach: half.ceil() as u64,
            history: Vec::new(),
            base: 0,
            received: 0,
            produced: 0,
        })
    }

    /// Input samples an output waits for past its own position.
    pub fn latency(&self) -> u64 {
        self.reach
    }

    /// Outputs produced since the last reset.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.base = 0;
        self.received = 0;
        self.produced = 0;
    }

    pub fn push(&mut self, samples: &[f64]) {
        self.history.extend_from_slice(samples);
        self.received += samples.len() as u64;
    }

    /// Compute up to `max` outputs from what has been pushed.
    pub fn pull(&mut self, max: usize) -> Vec<f64> {
        let mut out = Vec::new();
        while out.len() < max {
            let t = self.position(self.produced);
            if self.received <= t.floor() as u64 + self.reach {
                break;
            }
            out.push(self.interpolate(t));
            self.produced += 1;
        }
        self.discard_consumed();
        out
    }

    fn position(&self, output: u64) -> f64 {
        output as f64 * self.in_rate as f64 / self.out_rate as f64
    }

    fn kernel(&self, offset: f64) -> f64 {
        let x = self.cutoff * offset;
        let sinc = if x.abs() < 1e-12 { 1.0 } else { (PI * x).sin() / (PI * x) };
        let u = offset / self.half;
        let window = 0.42 + 0.5 * (PI * u).cos() + 0.08 * (2.0 * PI * u).cos();
        sinc * window
    }

    fn interpolate(&self, t: f64) -> f64 {
        let lo = (t - self.half).ceil().max(0.0) as u64;
        let hi = (t + self.half).floor() as u64;
        let mut acc = 0.0;
        let mut weight = 0.0;
        for n in lo.max(self.base)..=hi {
            let h = self.kernel(t - n as f64);
            acc += h * self.history[(n - self.base) as usize];
            weight += h;
        }
        if weight.abs() > 1e-12 {
            acc / weight
        } else {
            0.0
        }
    }

    fn discard_consumed(&mut self) {
        let keep_from = (self.position(self.produced).floor() as u64).saturating_sub(self.reach);
        if keep_from > self.base {
            let drop = ((keep_from - self.base) as usize).min(self.history.len());
            self.history.drain(..drop);
            self.base += drop as u64;
        }
    }

    /// Pending input and counters, for snapshots.
    pub fn save(&self) -> (Vec<f64>, u64, u64, u64) {
        (self.history.clone(), self.base, self.received, self.produced)
    }

    pub fn restore(&mut self, history: Vec<f64>, base: u64, received: u64, produced: u64) -> Result<()> {
        if base + history.len() as u64 != received {
            return Err(EngineError::InvalidArgument(format!(
                "resampler history of {} samples from {} doesn't end at {}",
                history.len(),
                base,
                received
            )));
        }
        self.history = history;
        self.base = base;
        self.received = received;
        self.produced = produced;
        Ok(())
    }
}
