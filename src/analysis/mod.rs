//! Analysis module for signal processing
//!
//! This module provides the spectral tools used by the spectrum nodes:
//! - Window functions
//! - Fixed-size FFT frames normalized to signal amplitude
//! - Peak detection
//! - Biquad filter sections
//! - Streaming samplerate conversion

pub mod biquad;
pub mod fft;
pub mod resample;

pub use biquad::{Biquad, BiquadType};
pub use fft::{is_valid_fft_size, Spectrum, SpectrumAnalyzer, WindowFunction};
pub use resample::StreamResampler;
