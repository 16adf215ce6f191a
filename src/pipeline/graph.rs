//! Graph of nodes and its run/stop protocol.
//!
//! # Run
//!
//! 1. Pick the run's working directory.
//! 2. Prepare every node (input queues are sized here).
//! 3. Start the clock, start every node, then start devices with active
//!    ports.
//!
//! # Stop
//!
//! 1. Stop devices, so no new data enters the graph.
//! 2. Suspend nodes breadth-first from the roots, each node only after all
//!    of its producers. No consumer is suspended while a producer upstream
//!    of it can still hand it data.
//! 3. Flush breadth-first from the leaves, consumers before producers, and
//!    repeat the pass while any node reports emitted data.
//! 4. Stop every node and the clock.
//!
//! Data that was queued when stop began reaches the sinks. An emergency stop
//! (queue overflow, failing node) skips the flush and loses queued data.

use crate::config::{
    ConnectionDocument, EngineSettings, GraphDocument, NodeDocument, COUNT_PLACEHOLDER,
};
use crate::error::{EngineError, Result};
use crate::pipeline::attributes::{Attribute, AttributeValue};
use crate::pipeline::context::{EmergencyStop, EngineContext, GraphEvent, NotificationLevel};
use crate::pipeline::id::{NodeId, PortId};
use crate::pipeline::node::{FlushState, Node, NodeBehavior, ProcessingState};
use crate::pipeline::nodes::signal_source::{self, OutputFeed};
use crate::pipeline::registry::NodeArgs;
use crate::pipeline::state::{GraphSnapshot, NodeState};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::{lock, read, write};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError, Weak};
use std::time::Duration;

/// Run state of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GraphState {
    #[default]
    Stopped,
    Running,
    /// Running, but no new work units start.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// From producers to consumers.
    Downstream,
    /// From consumers to producers.
    Upstream,
}

/// Breadth-first traversal over the connection topology.
///
/// A node is visited once all of its neighbours on the near side have been
/// visited. Nodes the traversal can't reach (cycles) follow at the end in
/// graph order.
#[derive(Default)]
struct Traversal {
    queue: VecDeque<Arc<Node>>,
    visited: HashSet<NodeId>,
    pending: HashMap<NodeId, usize>,
}

impl Traversal {
    fn order(&mut self, nodes: &[Arc<Node>], direction: Direction) -> Vec<Arc<Node>> {
        assert!(
            self.queue.is_empty(),
            "traversal queue holds {} nodes at the start of a pass",
            self.queue.len()
        );
        self.visited.clear();
        self.pending.clear();

        let near = |node: &Node| match direction {
            Direction::Downstream => node.upstream_nodes(),
            Direction::Upstream => node.downstream_nodes(),
        };
        let far = |node: &Node| match direction {
            Direction::Downstream => node.downstream_nodes(),
            Direction::Upstream => node.upstream_nodes(),
        };

        for node in nodes {
            let count = near(node).len();
            self.pending.insert(node.id(), count);
            if count == 0 {
                self.queue.push_back(Arc::clone(node));
            }
        }

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(node) = self.queue.pop_front() {
            if !self.visited.insert(node.id()) {
                continue;
            }
            for next in far(&node) {
                if let Some(count) = self.pending.get_mut(&next.id()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.queue.push_back(next);
                    }
                }
            }
            order.push(node);
        }

        for node in nodes {
            if !self.visited.contains(&node.id()) {
                order.push(Arc::clone(node));
            }
        }
        order
    }
}

struct GraphInner {
    engine: Arc<EngineContext>,
    nodes: RwLock<Vec<Arc<Node>>>,
    state: Mutex<GraphState>,
    /// Held by run, stop, emergency stop and topology changes.
    lifecycle: Mutex<()>,
    /// Set while a regular stop is in progress.
    stopping: AtomicBool,
    run_count: AtomicU32,
    next_id: AtomicU32,
}

/// A graph of processing nodes.
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        let inner = Arc::new(GraphInner {
            engine,
            nodes: RwLock::new(Vec::new()),
            state: Mutex::new(GraphState::Stopped),
            lifecycle: Mutex::new(()),
            stopping: AtomicBool::new(false),
            run_count: AtomicU32::new(0),
            next_id: AtomicU32::new(0),
        });
        let weak: Weak<GraphInner> = Arc::downgrade(&inner);
        let target: Weak<dyn EmergencyStop> = weak;
        inner.engine.set_emergency_target(target);
        Self { inner }
    }

    /// A graph on a fresh engine context with the built-in node types.
    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::new(EngineContext::new(settings))
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.inner.engine
    }

    pub fn state(&self) -> GraphState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() != GraphState::Stopped
    }

    /// Completed runs.
    pub fn run_count(&self) -> u32 {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Receiver<GraphEvent> {
        self.inner.engine.notifications().subscribe()
    }

    /// Working directory of the current or last run.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.inner.engine.working_dir()
    }

    pub fn current_clock_time(&self) -> TimeStamp {
        self.inner.engine.clock().now()
    }

    /// Correct the clock so that it reads `should_be` now.
    pub fn synchronize_clock(&self, should_be: TimeStamp) {
        self.inner.engine.clock().synchronize(should_be);
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes()
    }

    pub fn node_count(&self) -> usize {
        read(&self.inner.nodes).len()
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        read(&self.inner.nodes).iter().find(|n| n.id() == id).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        read(&self.inner.nodes).iter().find(|n| n.name() == name).cloned()
    }

    fn require_node(&self, id: NodeId) -> Result<Arc<Node>> {
        self.node(id).ok_or(EngineError::UnknownNode(id))
    }

    fn require_node_named(&self, name: &str) -> Result<Arc<Node>> {
        self.node_by_name(name).ok_or_else(|| {
            EngineError::InvalidArgument(format!("no node named '{}'", name))
        })
    }

    /// Lifecycle guard for a topology change. Fails unless stopped.
    fn edit_guard(&self, action: &str) -> Result<MutexGuard<'_, ()>> {
        let guard = lock(&self.inner.lifecycle);
        if self.state() != GraphState::Stopped {
            return Err(EngineError::GraphRunning(action.to_string()));
        }
        Ok(guard)
    }

    pub fn add_node(&self, type_key: &str, name: &str) -> Result<NodeId> {
        self.add_node_with(type_key, name, &NodeArgs::new())
    }

    /// Create a node from the registry, passing construction arguments.
    pub fn add_node_with(&self, type_key: &str, name: &str, args: &NodeArgs) -> Result<NodeId> {
        let behavior = self.inner.engine.registry().create(type_key, args)?;
        self.add_behavior(name, behavior)
    }

    /// Add a node with a behavior built outside the registry.
    pub fn add_behavior(&self, name: &str, behavior: Box<dyn NodeBehavior>) -> Result<NodeId> {
        let _guard = self.edit_guard("can't add nodes while running")?;
        let node = {
            let mut nodes = write(&self.inner.nodes);
            if nodes.iter().any(|n| n.name() == name) {
                return Err(EngineError::DuplicateNodeName(name.to_string()));
            }
            let id = NodeId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            let node = Node::new(id, name, behavior, Arc::clone(&self.inner.engine))?;
            nodes.push(Arc::clone(&node));
            node
        };
        tracing::info!("Added node '{}' ({}) as {}", node.name(), node.type_key(), node.id());
        self.inner.engine.notifications().emit(GraphEvent::NodeAdded {
            id: node.id(),
            name: node.name().to_string(),
        });
        Ok(node.id())
    }

    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        let _guard = self.edit_guard("can't remove nodes while running")?;
        let node = self.require_node(id)?;
        for input in node.inputs() {
            if let Some(output) = input.connection() {
                output.disconnect(input)?;
            }
        }
        for output in node.outputs() {
            output.disconnect_all();
        }
        write(&self.inner.nodes).retain(|n| n.id() != id);
        tracing::info!("Removed node '{}'", node.name());
        self.inner.engine.notifications().emit(GraphEvent::NodeRemoved {
            id,
            name: node.name().to_string(),
        });
        Ok(())
    }

    /// Connect output port `output` to input port `input`.
    pub fn connect(&self, output: PortId, input: PortId) -> Result<()> {
        let _guard = self.edit_guard("can't connect ports while running")?;
        let source = self.require_node(output.node())?;
        let target = self.require_node(input.node())?;
        let out_port = source.output(output.port_index())?;
        let in_port = target.input(input.port_index())?;
        out_port.connect(in_port)?;
        self.inner
            .engine
            .notifications()
            .emit(GraphEvent::Connected { output, input });
        Ok(())
    }

    pub fn connect_by_name(
        &self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<()> {
        let source = self.require_node_named(from_node)?;
        let target = self.require_node_named(to_node)?;
        let output = source.output_by_name(from_port).ok_or_else(|| {
            EngineError::InvalidArgument(format!("'{}' has no output '{}'", from_node, from_port))
        })?;
        let input = target.input_by_name(to_port).ok_or_else(|| {
            EngineError::InvalidArgument(format!("'{}' has no input '{}'", to_node, to_port))
        })?;
        self.connect(output.id(), input.id())
    }

    pub fn disconnect(&self, output: PortId, input: PortId) -> Result<()> {
        let _guard = self.edit_guard("can't disconnect ports while running")?;
        let source = self.require_node(output.node())?;
        let target = self.require_node(input.node())?;
        source
            .output(output.port_index())?
            .disconnect(target.input(input.port_index())?)?;
        self.inner
            .engine
            .notifications()
            .emit(GraphEvent::Disconnected { output, input });
        Ok(())
    }

    pub fn attributes(&self, id: NodeId) -> Result<Vec<Attribute>> {
        Ok(self.require_node(id)?.attributes())
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: AttributeValue) -> Result<()> {
        self.require_node(id)?.set_attribute(name, &value)
    }

    /// Run `f` on the behavior of node `id` if it is a `T`.
    pub fn with_behavior<T: 'static, R>(&self, id: NodeId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.node(id)?.with_behavior(f)
    }

    /// Handle for pushing samples into a `signal_source` node.
    pub fn feed(&self, id: NodeId) -> Result<OutputFeed> {
        signal_source::feed(&self.require_node(id)?)
    }

    /// Prepare and start every node, then start devices.
    pub fn run(&self) -> Result<()> {
        let inner = &self.inner;
        let guard = lock(&inner.lifecycle);
        if inner.state() != GraphState::Stopped {
            return Err(EngineError::GraphRunning("graph is already running".to_string()));
        }
        inner.stopping.store(false, Ordering::SeqCst);
        inner.engine.clear_emergency();
        inner.assign_working_dir();

        let nodes = inner.nodes();
        for node in &nodes {
            if let Err(e) = node.prepare_processing() {
                let message = format!("Node '{}' failed to prepare processing: {}", node.name(), e);
                tracing::error!("{}", message);
                inner
                    .engine
                    .notifications()
                    .notify(NotificationLevel::Error, message, Some(node.id()));
                return Err(EngineError::PrepareFailed {
                    node: node.name().to_string(),
                    source: Box::new(e),
                });
            }
        }

        inner.engine.clock().start();
        for (i, node) in nodes.iter().enumerate() {
            if let Err(e) = node.start() {
                tracing::error!("Node '{}' failed to start: {}", node.name(), e);
                for started in &nodes[..i] {
                    if let Err(e) = started.stop() {
                        tracing::warn!("Failed to stop '{}': {}", started.name(), e);
                    }
                }
                inner.engine.clock().stop();
                return Err(e);
            }
        }
        inner.set_state(GraphState::Running);
        tracing::info!(
            "Graph running with {} nodes in {:?}",
            nodes.len(),
            inner.engine.working_dir()
        );

        for device in inner.engine.devices() {
            if !device.has_active_ports() {
                continue;
            }
            if let Err(e) = device.start_sampling() {
                tracing::error!("Device '{}' failed to start: {}", device.name(), e);
                drop(guard);
                if let Err(stop_error) = self.stop() {
                    tracing::error!("Stop after failed device start failed: {}", stop_error);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop with suspend and flush.
    ///
    /// Returns `Ok(false)` without doing anything if the graph is already
    /// stopped or another run, stop or topology change is in progress.
    pub fn stop(&self) -> Result<bool> {
        self.inner.stop()
    }

    /// Stop without flushing. Queued data is lost.
    pub fn emergency_stop(&self, reason: &str) {
        self.inner.emergency_stop(reason, None);
    }

    /// Hold new work units back while running.
    pub fn pause(&self) -> Result<()> {
        let _guard = lock(&self.inner.lifecycle);
        if self.state() != GraphState::Running {
            return Err(EngineError::InvalidTransition {
                name: "graph".to_string(),
                message: format!("can't pause while {:?}", self.state()),
            });
        }
        self.inner.engine.scheduler().pause();
        self.inner.set_state(GraphState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let _guard = lock(&self.inner.lifecycle);
        if self.state() != GraphState::Paused {
            return Err(EngineError::InvalidTransition {
                name: "graph".to_string(),
                message: format!("can't resume while {:?}", self.state()),
            });
        }
        self.inner.engine.scheduler().resume();
        self.inner.set_state(GraphState::Running);
        Ok(())
    }

    /// Run flush passes outside of a stop, e.g. after an emergency stop.
    /// Returns the number of passes.
    pub fn flush(&self) -> Result<usize> {
        let _guard = lock(&self.inner.lifecycle);
        if self.state() == GraphState::Running {
            return Err(EngineError::GraphRunning("can't flush while running".to_string()));
        }
        Ok(self.inner.flush_passes(&self.inner.nodes()))
    }

    /// Capture every node's state.
    ///
    /// No work unit starts while the snapshot is taken; fails if running
    /// units don't finish within the quiesce timeout.
    pub fn save_state(&self) -> Result<GraphSnapshot> {
        let engine = &self.inner.engine;
        let _quiet = engine.scheduler().quiesce(engine.settings().quiesce_timeout())?;
        let captured_at = engine.clock().now();
        let states = self
            .nodes()
            .iter()
            .map(|node| NodeState::capture(node, captured_at))
            .collect();
        Ok(GraphSnapshot {
            captured_at,
            states,
        })
    }

    /// Install a snapshot. States of nodes that no longer exist are skipped.
    ///
    /// Every state is checked against its node first; if one doesn't fit,
    /// nothing is installed and the mismatch is returned.
    pub fn load_state(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let engine = &self.inner.engine;
        let restored = {
            let _quiet = engine.scheduler().quiesce(engine.settings().quiesce_timeout())?;
            let mut matched = Vec::new();
            for state in &snapshot.states {
                match self.node(state.node) {
                    Some(node) => {
                        state.check(&node)?;
                        matched.push((state, node));
                    }
                    None => tracing::warn!(
                        "Skipping state of '{}': node {} no longer exists",
                        state.name,
                        state.node
                    ),
                }
            }
            let mut restored = Vec::with_capacity(matched.len());
            for (state, node) in matched {
                state.restore(&node)?;
                restored.push(node);
            }
            restored
        };

        // Restored queues of running nodes are dispatched right away.
        for node in restored {
            if node.state() != ProcessingState::Running {
                continue;
            }
            for (i, input) in node.inputs().iter().enumerate() {
                if input.queued() > 0 {
                    node.schedule_data(i);
                }
                if input.value_count() > 0 {
                    node.schedule_value(i);
                }
            }
        }
        Ok(())
    }

    /// Describe nodes, attributes and connections.
    pub fn to_document(&self) -> GraphDocument {
        let nodes = self.nodes();
        let mut document = GraphDocument::new();
        for node in &nodes {
            document.nodes.push(NodeDocument {
                node_type: node.type_key().to_string(),
                name: node.name().to_string(),
                attributes: node
                    .attributes()
                    .into_iter()
                    .map(|a| (a.name, a.value))
                    .collect(),
            });
            for output in node.outputs() {
                for input in output.connections() {
                    let Some(target) = input.owner() else { continue };
                    document.connections.push(ConnectionDocument {
                        from_node: node.name().to_string(),
                        from_port: output.name().to_string(),
                        to_node: target.name().to_string(),
                        to_port: input.name().to_string(),
                    });
                }
            }
        }
        document
    }

    /// Build a graph from a document on `engine`.
    pub fn from_document(engine: Arc<EngineContext>, document: &GraphDocument) -> Result<Self> {
        let graph = Self::new(engine);
        for node in &document.nodes {
            let id = graph.add_node_with(&node.node_type, &node.name, &node.attributes)?;
            for (name, value) in &node.attributes {
                graph.set_attribute(id, name, value.clone())?;
            }
        }
        for c in &document.connections {
            graph.connect_by_name(&c.from_node, &c.from_port, &c.to_node, &c.to_port)?;
        }
        Ok(graph)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("state", &self.state())
            .field("nodes", &self.node_count())
            .field("runs", &self.run_count())
            .finish()
    }
}

impl GraphInner {
    fn state(&self) -> GraphState {
        *lock(&self.state)
    }

    fn set_state(&self, state: GraphState) {
        *lock(&self.state) = state;
        self.engine.notifications().emit(GraphEvent::StatusChanged(state));
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        read(&self.nodes).clone()
    }

    /// Pick `<base>/<mask>` for this run, counting up past existing
    /// directories. The directory itself is created on first use.
    fn assign_working_dir(&self) {
        let settings = self.engine.settings();
        let mut run = self.run_count.load(Ordering::SeqCst);
        let mut dir = settings.working_dir_base.join(settings.working_dir_name(run));
        if settings.working_dir_mask.contains(COUNT_PLACEHOLDER) {
            while dir.exists() {
                run += 1;
                dir = settings.working_dir_base.join(settings.working_dir_name(run));
            }
            self.run_count.store(run, Ordering::SeqCst);
        }
        tracing::debug!("Working directory for this run: {:?}", dir);
        self.engine.set_working_dir(Some(dir));
    }

    fn stop_devices(&self) {
        for device in self.engine.devices() {
            if device.is_sampling() {
                if let Err(e) = device.stop_sampling() {
                    tracing::error!("Device '{}' failed to stop: {}", device.name(), e);
                }
            }
        }
    }

    /// Flush until a pass emits nothing. Returns the number of passes.
    fn flush_passes(&self, nodes: &[Arc<Node>]) -> usize {
        let max_passes = self.engine.settings().max_flush_passes;
        let mut traversal = Traversal::default();
        let mut passes = 0;
        loop {
            passes += 1;
            let mut emitted = false;
            for node in traversal.order(nodes, Direction::Upstream) {
                match node.flush_data() {
                    Ok(FlushState::Some) => emitted = true,
                    Ok(FlushState::Empty) => {}
                    Err(e) => tracing::error!("Node '{}' failed to flush: {}", node.name(), e),
                }
            }
            if !emitted {
                break;
            }
            if passes >= max_passes {
                tracing::error!("Flush didn't settle after {} passes, giving up", passes);
                break;
            }
        }
        tracing::debug!("Flush finished after {} passes", passes);
        passes
    }

    fn finish_stop(&self) {
        let scheduler = self.engine.scheduler();
        if !scheduler.wait_idle(self.engine.settings().quiesce_timeout()) {
            tracing::warn!(
                "{} work units still outstanding after stop",
                scheduler.outstanding()
            );
        }
        self.engine.clock().stop();
        let run = self.run_count.fetch_add(1, Ordering::SeqCst);
        self.set_state(GraphState::Stopped);
        self.engine.recording_sink().run_finished(run);
    }

    fn stop(&self) -> Result<bool> {
        let _guard = match self.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Stop skipped, graph is busy");
                return Ok(false);
            }
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        if self.state() == GraphState::Stopped {
            return Ok(false);
        }
        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!("Stopping graph");

        let scheduler = self.engine.scheduler();
        if scheduler.is_paused() {
            scheduler.resume();
        }

        self.stop_devices();

        let nodes = self.nodes();
        let mut traversal = Traversal::default();
        for node in traversal.order(&nodes, Direction::Downstream) {
            if node.state() != ProcessingState::Running {
                continue;
            }
            if let Err(e) = node.suspend() {
                tracing::error!("Failed to suspend '{}': {}", node.name(), e);
            }
        }

        self.flush_passes(&nodes);

        for node in &nodes {
            if node.state() == ProcessingState::Stopped {
                continue;
            }
            if let Err(e) = node.stop() {
                tracing::error!("Failed to stop '{}': {}", node.name(), e);
            }
        }

        self.finish_stop();
        self.stopping.store(false, Ordering::SeqCst);
        tracing::info!("Graph stopped");
        Ok(true)
    }
}

impl EmergencyStop for GraphInner {
    fn emergency_stop(&self, reason: &str, source: Option<NodeId>) {
        let _guard = loop {
            match self.lifecycle.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(e)) => break e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        tracing::warn!("Emergency stop dropped, graph is already stopping: {}", reason);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        };
        if self.state() == GraphState::Stopped {
            return;
        }
        tracing::error!("Emergency stop: {}", reason);

        let scheduler = self.engine.scheduler();
        if scheduler.is_paused() {
            scheduler.resume();
        }
        self.stop_devices();

        let nodes = self.nodes();
        for node in &nodes {
            if node.state() == ProcessingState::Running {
                if let Err(e) = node.suspend() {
                    tracing::warn!("Failed to suspend '{}': {}", node.name(), e);
                }
            }
        }
        for node in &nodes {
            if node.state() != ProcessingState::Stopped {
                if let Err(e) = node.stop() {
                    tracing::warn!("Failed to stop '{}': {}", node.name(), e);
                }
            }
        }

        self.finish_stop();
        self.engine.notifications().notify(
            NotificationLevel::Error,
            format!("Graph stopped after an error: {}", reason),
            source,
        );
    }
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        if self.state() != GraphState::Stopped {
            if let Err(e) = self.stop() {
                tracing::error!("Failed to stop graph on drop: {}", e);
            }
        }
    }
}
