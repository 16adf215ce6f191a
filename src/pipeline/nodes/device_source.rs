//! DeviceSourceNode: forwards the buffers of one device port.
//!
//! The device is looked up by name in the engine context. While the node
//! runs, its port is marked active and every buffer the device produces is
//! sent to `out`. The graph starts devices after all nodes run and stops
//! them before suspending any node.

use crate::backend::{BufferCallback, Device, PortStatus};
use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::node::{NodeBehavior, NodeCore};
use crate::pipeline::nodes::{arg, send_in_chunks};
use crate::pipeline::port::{PortDataType, PortDescriptor};
use crate::pipeline::registry::NodeArgs;
use std::sync::Arc;

pub const TYPE_KEY: &str = "device_source";

#[derive(Default)]
pub struct DeviceSourceNode {
    device: String,
    port: usize,
}

impl DeviceSourceNode {
    pub fn new(device: impl Into<String>, port: usize) -> Self {
        Self {
            device: device.into(),
            port,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn port(&self) -> usize {
        self.port
    }

    fn lookup(&self, core: &NodeCore) -> Result<Arc<dyn Device>> {
        if self.device.is_empty() {
            return Err(EngineError::InvalidAttribute {
                attribute: "device".to_string(),
                message: format!("'{}' has no device selected", core.name()),
            });
        }
        let device = core.engine().device(&self.device).ok_or_else(|| EngineError::InvalidAttribute {
            attribute: "device".to_string(),
            message: format!("no device named '{}'", self.device),
        })?;
        if self.port >= device.port_count() {
            return Err(EngineError::InvalidAttribute {
                attribute: "port".to_string(),
                message: format!("device '{}' has no port {}", self.device, self.port),
            });
        }
        Ok(device)
    }

    /// Take over the samplerate of the selected device port, if it exists.
    fn sync_samplerate(&self, core: &NodeCore) -> Result<()> {
        match self.lookup(core) {
            Ok(device) => core.output(0).set_samplerate(device.samplerate(self.port)),
            Err(e) => {
                tracing::debug!("'{}' can't take a samplerate yet: {}", core.name(), e);
                Ok(())
            }
        }
    }
}

pub fn create(args: &NodeArgs) -> Result<Box<dyn NodeBehavior>> {
    let device = match arg(args, "device") {
        Some(value) => value.expect_str("device")?.to_string(),
        None => String::new(),
    };
    let port = match arg(args, "port") {
        Some(value) => value
            .as_int()
            .filter(|p| *p >= 0)
            .ok_or_else(|| EngineError::InvalidAttribute {
                attribute: "port".to_string(),
                message: "expected a port index".to_string(),
            })? as usize,
        None => 0,
    };
    Ok(Box::new(DeviceSourceNode::new(device, port)))
}

impl NodeBehavior for DeviceSourceNode {
    fn type_key(&self) -> &str {
        TYPE_KEY
    }

    fn ports(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor::output("out", PortDataType::Array)]
    }

    fn initialize(&mut self, core: &NodeCore) -> Result<()> {
        self.sync_samplerate(core)
    }

    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        let device = self.lookup(core)?;
        let rate = device.samplerate(self.port);
        let expected = core.output(0).samplerate();
        if rate != expected {
            return Err(EngineError::RateMismatch {
                expected,
                actual: rate,
            });
        }
        core.init_input_buffers()
    }

    fn processing_started(&mut self, core: &NodeCore) -> Result<()> {
        let device = self.lookup(core)?;
        let node = core
            .output(0)
            .owner()
            .map(|node| Arc::downgrade(&node))
            .unwrap_or_default();
        let callback: BufferCallback = Arc::new(move |buffer| {
            let Some(node) = node.upgrade() else {
                return;
            };
            if let Some(Err(e)) = node.run_exclusive(|core| send_in_chunks(core.output(0), buffer)) {
                node.engine().request_emergency_stop(
                    format!("'{}' failed to forward device data: {}", node.name(), e),
                    Some(node.id()),
                );
            }
        });
        device.set_buffer_callback(self.port, Some(callback))?;
        device.set_port_status(self.port, PortStatus::Active)
    }

    fn processing_stopped(&mut self, core: &NodeCore) -> Result<()> {
        let device = self.lookup(core)?;
        device.set_port_status(self.port, PortStatus::Idle)?;
        device.set_buffer_callback(self.port, None)
    }

    fn attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::new("device", AttributeValue::Text(self.device.clone())).locked_while_running(),
            Attribute::new("port", AttributeValue::Int(self.port as i64)).locked_while_running(),
        ]
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            "device" => self.device = value.expect_str(name)?.to_string(),
            "port" => {
                self.port = value
                    .as_int()
                    .filter(|p| *p >= 0)
                    .ok_or_else(|| EngineError::InvalidAttribute {
                        attribute: name.to_string(),
                        message: format!("expected a port index, got {}", value.kind()),
                    })? as usize
            }
            _ => {
                return Err(EngineError::UnknownAttribute {
                    node: core.name().to_string(),
                    attribute: name.to_string(),
                })
            }
        }
        self.sync_samplerate(core)
    }
}
