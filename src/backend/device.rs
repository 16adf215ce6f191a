//! Device trait for external sample producers
//!
//! A device owns one or more sampling ports. Each port produces buffers at its
//! own samplerate and pushes them to the engine through a buffer callback,
//! typically installed by a `device_source` node. The graph starts every
//! device with at least one active port after all nodes are running, and
//! stops them first when the graph stops.

use crate::error::Result;
use crate::pipeline::time_located::TimeLocatedBuffer;
use std::sync::Arc;

/// Receives every buffer a device port produces.
pub type BufferCallback = Arc<dyn Fn(&TimeLocatedBuffer) + Send + Sync>;

/// Whether a device port takes part in sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortStatus {
    /// Sampled while the device runs
    Active,
    /// Ignored
    #[default]
    Idle,
}

/// Unified interface for sampling devices
///
/// Implementations use interior mutability: a device is shared between the
/// graph, the nodes reading from it and its own sampling thread.
#[cfg_attr(test, mockall::automock)]
pub trait Device: Send + Sync {
    /// Unique device name, used by nodes to look the device up
    fn name(&self) -> String;

    /// Number of sampling ports
    fn port_count(&self) -> usize;

    fn port_status(&self, port: usize) -> PortStatus;

    fn set_port_status(&self, port: usize, status: PortStatus) -> Result<()>;

    /// Samplerate of a port in Hz
    fn samplerate(&self, port: usize) -> u32;

    /// Change the samplerate of a port. Fails while sampling.
    fn set_samplerate(&self, port: usize, rate: u32) -> Result<()>;

    /// Install or remove the callback receiving a port's buffers
    fn set_buffer_callback(&self, port: usize, callback: Option<BufferCallback>) -> Result<()>;

    /// Start sampling all active ports. Starting a sampling device is a no-op.
    fn start_sampling(&self) -> Result<()>;

    /// Stop sampling and wait for the producer to finish. Stopping an idle
    /// device is a no-op.
    fn stop_sampling(&self) -> Result<()>;

    fn is_sampling(&self) -> bool;

    /// Whether any port is active
    fn has_active_ports(&self) -> bool {
        (0..self.port_count()).any(|p| self.port_status(p) == PortStatus::Active)
    }
}

impl std::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("ports", &self.port_count())
            .field("sampling", &self.is_sampling())
            .finish()
    }
}
