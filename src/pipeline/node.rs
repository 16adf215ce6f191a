//! Node abstraction for the pipeline.
//!
//! Two-layer design:
//! - **`NodeBehavior` trait**: what a node type does with its data. Built-in
//!   and user-defined node types implement it.
//! - **`Node`**: the engine side. Owns the ports, the processing state and
//!   the locks serializing each concern, and turns data arrival into work
//!   units on the scheduler.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start──► Running ──suspend──► Suspended ──stop──► Stopped
//!                       └────────────────stop───────────────────┘
//! ```
//!
//! Data is only dispatched to the behavior while the node is Running. A
//! Suspended node keeps its queued data until the graph flushes it.

use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::context::EngineContext;
use crate::pipeline::id::NodeId;
use crate::pipeline::lock;
use crate::pipeline::port::{
    fft_frame_len, InputPort, OutputPort, PortDataType, PortDescriptor, PortDirection,
};
use crate::pipeline::state::PersistedFields;
use crate::pipeline::time::TimeStamp;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Processing state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessingState {
    #[default]
    Stopped,
    Suspended,
    Running,
}

/// Result of a flush call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing was emitted.
    Empty,
    /// Data was emitted downstream; the graph runs another flush pass.
    Some,
}

/// Downcasting support for behaviors.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// What a node type does.
///
/// All methods run with the node's behavior lock held. Hooks receive the
/// [`NodeCore`] for access to ports, the clock and engine services.
pub trait NodeBehavior: Send + AsAny {
    /// Registry key of this node type.
    fn type_key(&self) -> &str;

    /// Ports in declaration order. Called once when the node is created.
    fn ports(&self) -> Vec<PortDescriptor>;

    /// Called once after the ports exist, e.g. to set output samplerates.
    fn initialize(&mut self, _core: &NodeCore) -> Result<()> {
        Ok(())
    }

    /// Called before the graph starts. Sizes the input queues by default.
    fn prepare_processing(&mut self, core: &NodeCore) -> Result<()> {
        core.init_input_buffers()
    }

    /// At least one dispatch buffer is queued at `port`.
    fn data_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        port.read();
        Ok(())
    }

    /// A value arrived at `port`.
    fn value_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
        port.pop_value();
        Ok(())
    }

    fn input_samplerate_changed(&mut self, _core: &NodeCore, _port: &InputPort) -> Result<()> {
        Ok(())
    }

    fn fft_size_changed(&mut self, _core: &NodeCore, _port: &InputPort) -> Result<()> {
        Ok(())
    }

    fn output_connections_changed(&mut self, _core: &NodeCore, _port: &OutputPort) -> Result<()> {
        Ok(())
    }

    fn input_connection_changed(&mut self, _core: &NodeCore, _port: &InputPort) -> Result<()> {
        Ok(())
    }

    fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
        Ok(())
    }

    fn processing_suspended(&mut self, _core: &NodeCore) -> Result<()> {
        Ok(())
    }

    fn processing_stopped(&mut self, _core: &NodeCore) -> Result<()> {
        Ok(())
    }

    /// Push out whatever is still queued, within downstream free space.
    fn flush_data(&mut self, _core: &NodeCore) -> Result<FlushState> {
        Ok(FlushState::Empty)
    }

    /// Fields to keep in a state snapshot.
    fn save_state(&self) -> PersistedFields {
        PersistedFields::new()
    }

    fn load_state(&mut self, _fields: &PersistedFields) -> Result<()> {
        Ok(())
    }

    fn attributes(&self) -> Vec<Attribute> {
        Vec::new()
    }

    fn set_attribute(&mut self, core: &NodeCore, name: &str, _value: &AttributeValue) -> Result<()> {
        Err(EngineError::UnknownAttribute {
            node: core.name().to_string(),
            attribute: name.to_string(),
        })
    }
}

/// The parts of a node its behavior may touch.
pub struct NodeCore {
    id: NodeId,
    name: String,
    type_key: String,
    inputs: Vec<Arc<InputPort>>,
    outputs: Vec<Arc<OutputPort>>,
    state: Mutex<ProcessingState>,
    engine: Arc<EngineContext>,
}

fn samples_for(ms: u32, rate: u32) -> usize {
    ((ms as u64 * rate as u64).div_ceil(1000) as usize).max(1)
}

fn whole_frames(samples: usize, frame: usize) -> usize {
    samples.div_ceil(frame).max(1) * frame
}

impl NodeCore {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    pub fn inputs(&self) -> &[Arc<InputPort>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<OutputPort>] {
        &self.outputs
    }

    /// Input by index. Behaviors index their own declared ports.
    pub fn input(&self, index: usize) -> &Arc<InputPort> {
        &self.inputs[index]
    }

    pub fn output(&self, index: usize) -> &Arc<OutputPort> {
        &self.outputs[index]
    }

    pub fn state(&self) -> ProcessingState {
        *lock(&self.state)
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    /// Current graph clock reading.
    pub fn now(&self) -> TimeStamp {
        self.engine.clock().now()
    }

    /// Size every connected sample input from the engine's queue and buffer
    /// durations. FFT queues hold whole frames.
    pub fn init_input_buffers(&self) -> Result<()> {
        let settings = self.engine.settings();
        for input in &self.inputs {
            if input.data_type() == PortDataType::Value || !input.is_connected() {
                continue;
            }
            let rate = input.samplerate();
            if rate == 0 {
                return Err(EngineError::InvalidArgument(format!(
                    "input '{}' is connected but has no samplerate",
                    input.full_name()
                )));
            }
            let mut capacity = samples_for(settings.queue_ms, rate);
            let mut buffer_len = samples_for(settings.buffer_ms, rate);
            if input.data_type() == PortDataType::Fft {
                if input.fft_size() < 2 {
                    return Err(EngineError::InvalidArgument(format!(
                        "FFT input '{}' has no FFT size",
                        input.full_name()
                    )));
                }
                let frame = fft_frame_len(input.fft_size());
                capacity = whole_frames(capacity, frame);
                buffer_len = whole_frames(buffer_len, frame);
            }
            input.init_buffers(capacity.max(buffer_len), buffer_len);
        }
        Ok(())
    }
}

/// A node in a graph.
pub struct Node {
    core: NodeCore,
    behavior: Mutex<Box<dyn NodeBehavior>>,
    data_lock: Mutex<()>,
    value_lock: Mutex<()>,
    out_conn_lock: Mutex<()>,
    in_conn_lock: Mutex<()>,
    rate_lock: Mutex<()>,
    fft_lock: Mutex<()>,
}

impl Node {
    /// Create the node, its ports and run the behavior's `initialize` hook.
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        behavior: Box<dyn NodeBehavior>,
        engine: Arc<EngineContext>,
    ) -> Result<Arc<Node>> {
        let name = name.into();
        let descriptors = behavior.ports();
        let type_key = behavior.type_key().to_string();

        let node = Arc::new_cyclic(|weak| {
            let inputs = descriptors
                .iter()
                .filter(|d| d.direction == PortDirection::Input)
                .enumerate()
                .map(|(i, d)| Arc::new(InputPort::new(d, i, id, &name, weak.clone())))
                .collect();
            let outputs = descriptors
                .iter()
                .filter(|d| d.direction == PortDirection::Output)
                .enumerate()
                .map(|(i, d)| Arc::new(OutputPort::new(d, i, id, &name, weak.clone())))
                .collect();
            Node {
                core: NodeCore {
                    id,
                    name: name.clone(),
                    type_key,
                    inputs,
                    outputs,
                    state: Mutex::new(ProcessingState::Stopped),
                    engine,
                },
                behavior: Mutex::new(behavior),
                data_lock: Mutex::new(()),
                value_lock: Mutex::new(()),
                out_conn_lock: Mutex::new(()),
                in_conn_lock: Mutex::new(()),
                rate_lock: Mutex::new(()),
                fft_lock: Mutex::new(()),
            }
        });

        lock(&node.behavior).initialize(&node.core)?;
        Ok(node)
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn type_key(&self) -> &str {
        &self.core.type_key
    }

    pub fn inputs(&self) -> &[Arc<InputPort>] {
        &self.core.inputs
    }

    pub fn outputs(&self) -> &[Arc<OutputPort>] {
        &self.core.outputs
    }

    pub fn input(&self, index: usize) -> Result<&Arc<InputPort>> {
        self.core.inputs.get(index).ok_or_else(|| EngineError::UnknownPort {
            node: self.core.name.clone(),
            index,
        })
    }

    pub fn output(&self, index: usize) -> Result<&Arc<OutputPort>> {
        self.core.outputs.get(index).ok_or_else(|| EngineError::UnknownPort {
            node: self.core.name.clone(),
            index,
        })
    }

    pub fn input_by_name(&self, name: &str) -> Option<&Arc<InputPort>> {
        self.core.inputs.iter().find(|p| p.name() == name)
    }

    pub fn output_by_name(&self, name: &str) -> Option<&Arc<OutputPort>> {
        self.core.outputs.iter().find(|p| p.name() == name)
    }

    pub fn state(&self) -> ProcessingState {
        self.core.state()
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.core.engine
    }

    fn set_state(&self, state: ProcessingState) {
        *lock(&self.core.state) = state;
    }

    fn transition_error(&self, message: String) -> EngineError {
        EngineError::InvalidTransition {
            name: self.core.name.clone(),
            message,
        }
    }

    fn wake_senders(&self) {
        for input in &self.core.inputs {
            input.notify_space();
        }
    }

    /// Nodes feeding this node's inputs, without duplicates.
    pub fn upstream_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = Vec::new();
        for input in &self.core.inputs {
            if let Some(owner) = input.connection().and_then(|output| output.owner()) {
                if !nodes.iter().any(|n| n.id() == owner.id()) {
                    nodes.push(owner);
                }
            }
        }
        nodes
    }

    /// Nodes fed by this node's outputs, without duplicates.
    pub fn downstream_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = Vec::new();
        for output in &self.core.outputs {
            for input in output.connections() {
                if let Some(owner) = input.owner() {
                    if !nodes.iter().any(|n| n.id() == owner.id()) {
                        nodes.push(owner);
                    }
                }
            }
        }
        nodes
    }

    /// Run the behavior's prepare hook. Only valid while stopped.
    pub fn prepare_processing(&self) -> Result<()> {
        if self.state() != ProcessingState::Stopped {
            return Err(self.transition_error(format!(
                "can't prepare while {:?}",
                self.state()
            )));
        }
        lock(&self.behavior).prepare_processing(&self.core)
    }

    /// Stopped -> Running.
    pub fn start(&self) -> Result<()> {
        let _data = lock(&self.data_lock);
        let _values = lock(&self.value_lock);
        {
            let mut state = lock(&self.core.state);
            if *state != ProcessingState::Stopped {
                return Err(self.transition_error(format!("can't start while {:?}", *state)));
            }
            *state = ProcessingState::Running;
        }
        tracing::debug!("Node '{}' started", self.core.name);
        lock(&self.behavior).processing_started(&self.core)
    }

    /// Running -> Suspended. Waits for an in-flight dispatch to finish.
    pub fn suspend(&self) -> Result<()> {
        let _data = lock(&self.data_lock);
        let _values = lock(&self.value_lock);
        {
            let mut state = lock(&self.core.state);
            if *state != ProcessingState::Running {
                return Err(self.transition_error(format!("can't suspend while {:?}", *state)));
            }
            *state = ProcessingState::Suspended;
        }
        self.wake_senders();
        tracing::debug!("Node '{}' suspended", self.core.name);
        lock(&self.behavior).processing_suspended(&self.core)
    }

    /// Running or Suspended -> Stopped.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.core.state);
            if *state == ProcessingState::Stopped {
                return Err(self.transition_error("already stopped".to_string()));
            }
            *state = ProcessingState::Stopped;
        }
        self.wake_senders();
        let _data = lock(&self.data_lock);
        let _values = lock(&self.value_lock);
        tracing::debug!("Node '{}' stopped", self.core.name);
        lock(&self.behavior).processing_stopped(&self.core)
    }

    pub fn flush_data(&self) -> Result<FlushState> {
        let _data = lock(&self.data_lock);
        lock(&self.behavior).flush_data(&self.core)
    }

    /// Run `f` as a unit of work of this node, serialized with dispatches and
    /// state changes. Returns `None` without calling `f` unless Running.
    ///
    /// Sources fed from outside the scheduler push their data through this,
    /// so suspending the node waits for a push in progress.
    pub fn run_exclusive<R>(&self, f: impl FnOnce(&NodeCore) -> R) -> Option<R> {
        let _data = lock(&self.data_lock);
        (self.state() == ProcessingState::Running).then(|| f(&self.core))
    }

    /// Queue a data dispatch for input `index` unless one is already pending.
    pub(crate) fn schedule_data(self: &Arc<Self>, index: usize) {
        let Some(input) = self.core.inputs.get(index) else {
            return;
        };
        if input.dispatch_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = Arc::clone(self);
        let submitted = self
            .core
            .engine
            .scheduler()
            .submit(Box::new(move || node.dispatch_data(index)));
        if let Err(e) = submitted {
            input.dispatch_pending.store(false, Ordering::SeqCst);
            tracing::warn!("Failed to schedule '{}': {}", input.full_name(), e);
        }
    }

    pub(crate) fn schedule_value(self: &Arc<Self>, index: usize) {
        let node = Arc::clone(self);
        if let Err(e) = self
            .core
            .engine
            .scheduler()
            .submit(Box::new(move || node.dispatch_value(index)))
        {
            tracing::warn!("Failed to schedule value for '{}': {}", self.core.name, e);
        }
    }

    fn processing_failed(&self, error: EngineError) {
        tracing::error!("Node '{}' failed to process data: {}", self.core.name, error);
        self.core.engine.request_emergency_stop(
            format!("Node '{}' failed to process data: {}", self.core.name, error),
            Some(self.core.id),
        );
    }

    fn dispatch_data(&self, index: usize) {
        let input = &self.core.inputs[index];
        input.dispatch_pending.store(false, Ordering::SeqCst);

        let _data = lock(&self.data_lock);
        if self.state() != ProcessingState::Running {
            return;
        }
        let packets = input.queued() / input.buffer_len().max(1);
        if packets == 0 {
            return;
        }
        let mut behavior = lock(&self.behavior);
        for _ in 0..packets {
            if let Err(e) = behavior.data_available(&self.core, input) {
                drop(behavior);
                self.processing_failed(e);
                return;
            }
        }
    }

    fn dispatch_value(&self, index: usize) {
        let input = &self.core.inputs[index];
        let _values = lock(&self.value_lock);
        if self.state() != ProcessingState::Running {
            return;
        }
        let mut behavior = lock(&self.behavior);
        while input.value_count() > 0 {
            if let Err(e) = behavior.value_available(&self.core, input) {
                drop(behavior);
                self.processing_failed(e);
                return;
            }
        }
    }

    pub(crate) fn input_samplerate_changed(&self, index: usize, apply: impl FnOnce()) -> Result<()> {
        debug_assert_eq!(self.state(), ProcessingState::Stopped);
        let _rate = lock(&self.rate_lock);
        apply();
        lock(&self.behavior).input_samplerate_changed(&self.core, &self.core.inputs[index])
    }

    pub(crate) fn fft_size_changed(&self, index: usize, apply: impl FnOnce()) -> Result<()> {
        debug_assert_eq!(self.state(), ProcessingState::Stopped);
        let _fft = lock(&self.fft_lock);
        apply();
        lock(&self.behavior).fft_size_changed(&self.core, &self.core.inputs[index])
    }

    pub(crate) fn output_connections_changed(&self, index: usize) -> Result<()> {
        let _conn = lock(&self.out_conn_lock);
        lock(&self.behavior).output_connections_changed(&self.core, &self.core.outputs[index])
    }

    pub(crate) fn input_connection_changed(&self, index: usize) -> Result<()> {
        let _conn = lock(&self.in_conn_lock);
        lock(&self.behavior).input_connection_changed(&self.core, &self.core.inputs[index])
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        lock(&self.behavior).attributes()
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes()
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.value)
    }

    /// Write an attribute. Attributes locked while running are only writable
    /// while the node is stopped.
    pub fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<()> {
        let mut behavior = lock(&self.behavior);
        let attribute = behavior
            .attributes()
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| EngineError::UnknownAttribute {
                node: self.core.name.clone(),
                attribute: name.to_string(),
            })?;
        if attribute.read_only_while_running && self.state() != ProcessingState::Stopped {
            return Err(EngineError::AttributeReadOnly(name.to_string()));
        }
        behavior.set_attribute(&self.core, name, value)
    }

    pub(crate) fn save_fields(&self) -> PersistedFields {
        lock(&self.behavior).save_state()
    }

    pub(crate) fn load_fields(&self, fields: &PersistedFields) -> Result<()> {
        lock(&self.behavior).load_state(fields)
    }

    /// Run `f` on the behavior if it is a `T`.
    pub fn with_behavior<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = lock(&self.behavior);
        let behavior: &dyn NodeBehavior = &**guard;
        behavior.as_any().downcast_ref::<T>().map(f)
    }

    pub fn with_behavior_mut<T: 'static, R>(&self, f: impl FnOnce(&mut T, &NodeCore) -> R) -> Option<R> {
        let mut guard = lock(&self.behavior);
        let behavior: &mut dyn NodeBehavior = &mut **guard;
        behavior
            .as_any_mut()
            .downcast_mut::<T>()
            .map(|b| f(b, &self.core))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("type", &self.core.type_key)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::pipeline::time_located::TimeLocatedBuffer;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        packets: Vec<usize>,
        started: usize,
        stopped: usize,
        gain: f64,
    }

    impl NodeBehavior for Counting {
        fn type_key(&self) -> &str {
            "counting"
        }

        fn ports(&self) -> Vec<PortDescriptor> {
            vec![
                PortDescriptor::input("in", PortDataType::Array),
                PortDescriptor::output("out", PortDataType::Array),
            ]
        }

        fn data_available(&mut self, _core: &NodeCore, port: &InputPort) -> Result<()> {
            if let Some(buffer) = port.read() {
                self.packets.push(buffer.written());
            }
            Ok(())
        }

        fn processing_started(&mut self, _core: &NodeCore) -> Result<()> {
            self.started += 1;
            Ok(())
        }

        fn processing_stopped(&mut self, _core: &NodeCore) -> Result<()> {
            self.stopped += 1;
            Ok(())
        }

        fn attributes(&self) -> Vec<Attribute> {
            vec![
                Attribute::new("gain", AttributeValue::Double(self.gain)),
                Attribute::new("mode", AttributeValue::Text("fixed".into())).locked_while_running(),
            ]
        }

        fn set_attribute(&mut self, _core: &NodeCore, name: &str, value: &AttributeValue) -> Result<()> {
            if name == "gain" {
                self.gain = value.expect_float(name)?;
            }
            Ok(())
        }
    }

    fn engine() -> Arc<EngineContext> {
        EngineContext::new(EngineSettings::default())
    }

    fn node(engine: &Arc<EngineContext>) -> Arc<Node> {
        Node::new(NodeId(0), "Counter", Box::new(Counting::default()), Arc::clone(engine)).unwrap()
    }

    #[test]
    fn test_ports_are_built_from_descriptors() {
        let engine = engine();
        let node = node(&engine);
        assert_eq!(node.inputs().len(), 1);
        assert_eq!(node.outputs().len(), 1);
        assert_eq!(node.input_by_name("in").unwrap().full_name(), "Counter.in");
        assert!(node.output(1).is_err());
        assert!(Arc::ptr_eq(&node.inputs()[0].owner().unwrap(), &node));
    }

    #[test]
    fn test_state_machine() {
        let engine = engine();
        let node = node(&engine);
        assert!(node.suspend().is_err());
        assert!(node.stop().is_err());

        node.start().unwrap();
        assert_eq!(node.state(), ProcessingState::Running);
        assert!(node.start().is_err());
        assert!(node.prepare_processing().is_err());

        node.suspend().unwrap();
        assert_eq!(node.state(), ProcessingState::Suspended);
        assert!(node.suspend().is_err());
        assert!(node.start().is_err());

        node.stop().unwrap();
        assert_eq!(node.state(), ProcessingState::Stopped);

        // Running -> Stopped directly is allowed too.
        node.start().unwrap();
        node.stop().unwrap();
        assert_eq!(node.with_behavior(|c: &Counting| (c.started, c.stopped)), Some((2, 2)));
    }

    #[test]
    fn test_read_only_attribute_while_running() {
        let engine = engine();
        let node = node(&engine);
        node.set_attribute("gain", &AttributeValue::Double(2.0)).unwrap();
        node.start().unwrap();
        node.set_attribute("gain", &AttributeValue::Double(3.0)).unwrap();
        assert!(matches!(
            node.set_attribute("mode", &AttributeValue::Text("x".into())),
            Err(EngineError::AttributeReadOnly(_))
        ));
        assert!(matches!(
            node.set_attribute("nope", &AttributeValue::Bool(true)),
            Err(EngineError::UnknownAttribute { .. })
        ));
        node.stop().unwrap();
        node.set_attribute("mode", &AttributeValue::Text("x".into())).unwrap();
        assert_eq!(node.attribute("gain"), Some(AttributeValue::Double(3.0)));
    }

    #[test]
    fn test_dispatches_whole_buffers_only_while_running() {
        let engine = engine();
        let node = node(&engine);
        let input = Arc::clone(&node.inputs()[0]);
        input.set_samplerate(1000).unwrap();
        input.init_buffers(1000, 100);

        let mut buffer = TimeLocatedBuffer::new(250, 1000);
        buffer.copy_from_slice(&[1.0; 250]);

        // Stopped: data stays queued.
        input.receive(&buffer).unwrap();
        assert!(engine.scheduler().wait_idle(Duration::from_secs(5)));
        assert_eq!(input.queued(), 250);

        node.start().unwrap();
        input.receive(&buffer).unwrap();
        assert!(engine.scheduler().wait_idle(Duration::from_secs(5)));
        let packets = node.with_behavior(|c: &Counting| c.packets.clone()).unwrap();
        assert_eq!(packets, vec![100; 5]);
        assert_eq!(input.queued(), 0);
        node.stop().unwrap();
    }

    #[test]
    fn test_init_input_buffers_sizes_connected_inputs() {
        let engine = engine();
        let source = node(&engine);
        let sink = Node::new(NodeId(1), "Sink", Box::new(Counting::default()), Arc::clone(&engine)).unwrap();

        // Unconnected inputs are skipped.
        sink.prepare_processing().unwrap();
        assert!(!sink.inputs()[0].is_initialized());

        source.outputs()[0].connect(&sink.inputs()[0]).unwrap();
        assert!(sink.prepare_processing().is_err(), "connected input without a rate");

        source.outputs()[0].set_samplerate(1000).unwrap();
        sink.prepare_processing().unwrap();
        let input = &sink.inputs()[0];
        let settings = engine.settings();
        assert_eq!(input.capacity(), settings.queue_ms as usize);
        assert_eq!(input.buffer_len(), settings.buffer_ms as usize);
        assert_eq!(sink.upstream_nodes()[0].id(), source.id());
        assert_eq!(source.downstream_nodes()[0].id(), sink.id());
    }

    #[test]
    fn test_rate_change_rejected_while_consumer_runs() {
        let engine = engine();
        let source = node(&engine);
        let sink = Node::new(NodeId(1), "Sink", Box::new(Counting::default()), Arc::clone(&engine)).unwrap();
        source.outputs()[0].set_samplerate(1000).unwrap();
        source.outputs()[0].connect(&sink.inputs()[0]).unwrap();

        sink.start().unwrap();
        assert_eq!(source.state(), ProcessingState::Stopped);
        assert!(matches!(
            source.outputs()[0].set_samplerate(500),
            Err(EngineError::RateChangeWhileRunning { .. })
        ));
        assert!(matches!(
            source.outputs()[0].set_fft_size(64),
            Err(EngineError::RateChangeWhileRunning { .. })
        ));
        assert_eq!(source.outputs()[0].samplerate(), 1000);
        assert_eq!(sink.inputs()[0].samplerate(), 1000);

        sink.stop().unwrap();
        source.outputs()[0].set_samplerate(500).unwrap();
        assert_eq!(sink.inputs()[0].samplerate(), 500);
    }

    #[test]
    fn test_frame_rounding() {
        assert_eq!(samples_for(100, 1000), 100);
        assert_eq!(samples_for(1, 10), 1);
        assert_eq!(samples_for(100, 15), 2);
        assert_eq!(whole_frames(100, 64), 128);
        assert_eq!(whole_frames(0, 64), 64);
    }
}
