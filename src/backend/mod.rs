//! Sampling devices
//!
//! Devices are the engine's boundary to hardware. The engine only talks to
//! them through the [`Device`] trait; vendor drivers live outside this crate.
//!
//! # Components
//!
//! - [`Device`] - Port status, samplerates, buffer callbacks, start/stop
//! - [`SimulatedDevice`] - Waveform generator on a sampling thread
//!
//! # Example
//!
//! ```ignore
//! use flowgraph_rs::backend::{Device, PortStatus, SignalPattern, SimulatedDevice};
//! use std::sync::Arc;
//!
//! let device = Arc::new(SimulatedDevice::new("sim", vec![(SignalPattern::default(), 1000)]));
//! device.set_port_status(0, PortStatus::Active)?;
//! device.set_buffer_callback(0, Some(Arc::new(|buf| println!("{} samples", buf.written()))))?;
//! device.start_sampling()?;
//! ```

pub mod device;
pub mod simulated;

pub use device::{BufferCallback, Device, PortStatus};
pub use simulated::{SignalPattern, SimulatedDevice};

#[cfg(test)]
pub use device::MockDevice;
