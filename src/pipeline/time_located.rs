//! Working buffers that know where their samples sit in time.

use crate::pipeline::time::TimeStamp;
use serde::{Deserialize, Serialize};

/// A block of samples at one rate, stamped with the time just past its last
/// written sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeLocatedBuffer {
    samples: Vec<f64>,
    rate: u32,
    current_time: TimeStamp,
    written: usize,
}

impl TimeLocatedBuffer {
    /// A zeroed buffer of `len` samples (at least one) starting at time zero.
    pub fn new(len: usize, rate: u32) -> Self {
        Self {
            samples: vec![0.0; len.max(1)],
            rate,
            current_time: TimeStamp::ZERO,
            written: 0,
        }
    }

    /// Wrap existing samples, all of them counted as written, ending at `end`.
    pub fn from_samples(samples: Vec<f64>, rate: u32, end: TimeStamp) -> Self {
        let written = samples.len();
        Self {
            samples,
            rate,
            current_time: end,
            written,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn current_time(&self) -> TimeStamp {
        self.current_time
    }

    /// Stamp of the first written sample.
    pub fn front_time(&self) -> TimeStamp {
        self.current_time.sub_samples(self.written as i64, self.rate)
    }

    pub fn stamp_for_sample(&self, index: usize) -> TimeStamp {
        self.front_time().add_samples(index as i64, self.rate)
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f64] {
        &mut self.samples
    }

    /// The part of the buffer holding valid data.
    pub fn written_samples(&self) -> &[f64] {
        &self.samples[..self.written]
    }

    /// Mark `count` samples as written and advance the clock past them.
    pub fn set_written(&mut self, count: usize) {
        self.written = count.min(self.samples.len());
        self.current_time = self.current_time.add_samples(self.written as i64, self.rate);
    }

    pub fn set_time(&mut self, stamp: TimeStamp) {
        self.current_time = stamp;
    }

    pub fn reset_time(&mut self) {
        self.current_time = TimeStamp::ZERO;
    }

    /// A new buffer holding `count` written samples starting at `offset`,
    /// stamped with its own end time.
    pub fn slice(&self, offset: usize, count: usize) -> TimeLocatedBuffer {
        let end = (offset + count).min(self.written);
        let start = offset.min(end);
        TimeLocatedBuffer::from_samples(
            self.samples[start..end].to_vec(),
            self.rate,
            self.stamp_for_sample(end),
        )
    }

    /// Copy as much of `data` as fits and mark it written. Returns the count copied.
    pub fn copy_from_slice(&mut self, data: &[f64]) -> usize {
        let n = data.len().min(self.samples.len());
        self.samples[..n].copy_from_slice(&data[..n]);
        self.set_written(n);
        n
    }
}

/// A single value at a point in time, carried by value ports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeLocatedValue {
    pub stamp: TimeStamp,
    pub value: f64,
}

impl TimeLocatedValue {
    pub fn new(value: f64, stamp: TimeStamp) -> Self {
        Self { stamp, value }
    }
}
