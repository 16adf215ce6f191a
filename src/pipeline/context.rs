//! Engine context shared by a graph and its nodes.
//!
//! Everything a node may need beyond its own ports comes from here: settings,
//! the worker pool, the graph clock, the node registry, registered devices,
//! the recording sink and the notification hub. A context is created once
//! and handed to the graph, which hands it to every node it creates.

use crate::backend::Device;
use crate::config::EngineSettings;
use crate::error::{Result, ResultExt};
use crate::pipeline::graph::GraphState;
use crate::pipeline::id::{NodeId, PortId};
use crate::pipeline::registry::NodeRegistry;
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::time::{TimeStamp, MASTER_RATE};
use crate::pipeline::{lock, read, write};
use crate::session::{RecordSetCollector, RecordingSink};
use crossbeam_channel::{Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

/// Severity of a graph notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A message for whoever supervises the graph
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    /// Node the message is about, if any
    pub source: Option<NodeId>,
}

/// Events published to graph subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    StatusChanged(GraphState),
    NodeAdded { id: NodeId, name: String },
    NodeRemoved { id: NodeId, name: String },
    Connected { output: PortId, input: PortId },
    Disconnected { output: PortId, input: PortId },
    Notification(Notification),
}

/// Fan-out of graph events to any number of channel subscribers.
#[derive(Default)]
pub struct NotificationHub {
    subscribers: Mutex<Vec<Sender<GraphEvent>>>,
}

impl NotificationHub {
    pub fn subscribe(&self) -> Receiver<GraphEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping disconnected ones.
    pub fn emit(&self, event: GraphEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>, source: Option<NodeId>) {
        self.emit(GraphEvent::Notification(Notification {
            level,
            message: message.into(),
            source,
        }));
    }
}

/// Monotonic run clock with an additive correction.
///
/// While running the clock reads the time since [`GraphClock::start`]; when
/// stopped it reads the value it had at [`GraphClock::stop`]. The correction
/// persists across runs.
#[derive(Default)]
pub struct GraphClock {
    inner: Mutex<ClockState>,
    correction_ticks: AtomicI64,
}

#[derive(Default)]
struct ClockState {
    started_at: Option<Instant>,
    frozen: Duration,
}

impl GraphClock {
    pub fn start(&self) {
        let mut state = lock(&self.inner);
        state.started_at = Some(Instant::now());
        state.frozen = Duration::ZERO;
    }

    pub fn stop(&self) {
        let mut state = lock(&self.inner);
        if let Some(started) = state.started_at.take() {
            state.frozen = started.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner).started_at.is_some()
    }

    fn elapsed(&self) -> Duration {
        let state = lock(&self.inner);
        match state.started_at {
            Some(started) => started.elapsed(),
            None => state.frozen,
        }
    }

    /// Current clock reading including the correction.
    pub fn now(&self) -> TimeStamp {
        let ticks = (self.elapsed().as_nanos() as i128 * MASTER_RATE as i128 / 1_000_000_000) as i64;
        TimeStamp::from_ticks(ticks + self.correction_ticks.load(Ordering::SeqCst))
    }

    /// Shift the clock so that it reads `should_be` now.
    pub fn synchronize(&self, should_be: TimeStamp) {
        let now = self.now();
        let delta = (should_be - now).ticks();
        self.correction_ticks.fetch_add(delta, Ordering::SeqCst);
        tracing::debug!("Clock corrected by {} ticks", delta);
    }

    pub fn correction(&self) -> TimeStamp {
        TimeStamp::from_ticks(self.correction_ticks.load(Ordering::SeqCst))
    }
}

/// Receiver of emergency stop requests, implemented by the graph.
pub trait EmergencyStop: Send + Sync {
    fn emergency_stop(&self, reason: &str, source: Option<NodeId>);
}

/// Services shared by a graph and all of its nodes.
pub struct EngineContext {
    settings: EngineSettings,
    scheduler: Scheduler,
    clock: GraphClock,
    registry: NodeRegistry,
    notifications: NotificationHub,
    devices: RwLock<Vec<Arc<dyn Device>>>,
    recording_sink: RwLock<Arc<dyn RecordingSink>>,
    working_dir: RwLock<Option<PathBuf>>,
    emergency_target: RwLock<Option<Weak<dyn EmergencyStop>>>,
    emergency_pending: AtomicBool,
}

impl EngineContext {
    /// Context with the built-in node types registered.
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        Self::with_registry(settings, NodeRegistry::with_builtins())
    }

    pub fn with_registry(settings: EngineSettings, registry: NodeRegistry) -> Arc<Self> {
        let scheduler = Scheduler::new(settings.min_workers(), settings.max_workers);
        let context = Arc::new(Self {
            settings,
            scheduler,
            clock: GraphClock::default(),
            registry,
            notifications: NotificationHub::default(),
            devices: RwLock::new(Vec::new()),
            recording_sink: RwLock::new(Arc::new(RecordSetCollector::new())),
            working_dir: RwLock::new(None),
            emergency_target: RwLock::new(None),
            emergency_pending: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&context);
        context.scheduler.set_panic_handler(Arc::new(move |message| {
            if let Some(context) = weak.upgrade() {
                context.request_emergency_stop(format!("work unit panicked: {}", message), None);
            }
        }));
        context
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &GraphClock {
        &self.clock
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn notifications(&self) -> &NotificationHub {
        &self.notifications
    }

    pub fn register_device(&self, device: Arc<dyn Device>) {
        tracing::info!("Registered device '{}'", device.name());
        write(&self.devices).push(device);
    }

    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        read(&self.devices).iter().find(|d| d.name() == name).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        read(&self.devices).clone()
    }

    pub fn set_recording_sink(&self, sink: Arc<dyn RecordingSink>) {
        *write(&self.recording_sink) = sink;
    }

    pub fn recording_sink(&self) -> Arc<dyn RecordingSink> {
        Arc::clone(&read(&self.recording_sink))
    }

    /// Working directory of the current (or last) run.
    pub fn working_dir(&self) -> Option<PathBuf> {
        read(&self.working_dir).clone()
    }

    pub(crate) fn set_working_dir(&self, dir: Option<PathBuf>) {
        *write(&self.working_dir) = dir;
    }

    /// The current working directory, created on first use.
    pub fn ensure_working_dir(&self) -> Result<PathBuf> {
        let dir = self.working_dir().unwrap_or_else(|| self.settings.working_dir_base.clone());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating working directory {}", dir.display()))?;
        Ok(dir)
    }

    pub(crate) fn set_emergency_target(&self, target: Weak<dyn EmergencyStop>) {
        *write(&self.emergency_target) = Some(target);
    }

    /// Re-arm emergency stop requests for a new run.
    pub(crate) fn clear_emergency(&self) {
        self.emergency_pending.store(false, Ordering::SeqCst);
    }

    /// Whether an emergency stop was requested since the graph last started.
    pub fn emergency_requested(&self) -> bool {
        self.emergency_pending.load(Ordering::SeqCst)
    }

    /// Ask the graph to stop without flushing.
    ///
    /// Safe to call from any thread, including scheduler workers and device
    /// threads: the stop itself runs on a thread of its own. Only the first
    /// request of a run is acted upon.
    pub fn request_emergency_stop(&self, reason: impl Into<String>, source: Option<NodeId>) {
        let reason = reason.into();
        if self.emergency_pending.swap(true, Ordering::SeqCst) {
            tracing::debug!("Emergency stop already requested, ignoring: {}", reason);
            return;
        }
        tracing::error!("Emergency stop requested: {}", reason);
        self.notifications
            .notify(NotificationLevel::Error, reason.clone(), source);

        let target = read(&self.emergency_target).clone();
        let Some(target) = target else {
            tracing::warn!("No graph to stop");
            return;
        };
        let spawned = std::thread::Builder::new()
            .name("emergency-stop".to_string())
            .spawn(move || {
                if let Some(graph) = target.upgrade() {
                    graph.emergency_stop(&reason, source);
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn emergency stop thread: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_freezes_when_stopped() {
        let clock = GraphClock::default();
        assert_eq!(clock.now(), TimeStamp::ZERO);
        clock.start();
        std::thread::sleep(Duration::from_millis(5));
        clock.stop();
        let frozen = clock.now();
        assert!(frozen >= TimeStamp::from_millis(5.0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), frozen);
    }

    #[test]
    fn test_synchronize_clock() {
        let clock = GraphClock::default();
        clock.synchronize(TimeStamp::from_seconds(10.0));
        assert_eq!(clock.now(), TimeStamp::from_seconds(10.0));

        // The correction survives a restart.
        clock.start();
        assert!(clock.now() >= TimeStamp::from_seconds(10.0));
        clock.stop();
        assert_eq!(clock.correction(), TimeStamp::from_seconds(10.0));
    }

    #[test]
    fn test_hub_drops_closed_subscribers() {
        let hub = NotificationHub::default();
        let rx = hub.subscribe();
        let closed = hub.subscribe();
        drop(closed);
        hub.notify(NotificationLevel::Info, "hello", None);
        match rx.try_recv().unwrap() {
            GraphEvent::Notification(n) => assert_eq!(n.message, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(lock(&hub.subscribers).len(), 1);
    }

    struct Recorder(Mutex<Vec<String>>);

    impl EmergencyStop for Recorder {
        fn emergency_stop(&self, reason: &str, _source: Option<NodeId>) {
            self.0.lock().unwrap().push(reason.to_string());
        }
    }

    #[test]
    fn test_emergency_requests_are_deduplicated() {
        let context = EngineContext::new(EngineSettings::default());
        let target = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak: Weak<dyn EmergencyStop> = Arc::downgrade(&target) as Weak<dyn EmergencyStop>;
        context.set_emergency_target(weak);

        context.request_emergency_stop("first", None);
        context.request_emergency_stop("second", None);

        let deadline = Instant::now() + Duration::from_secs(5);
        while target.0.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*target.0.lock().unwrap(), vec!["first".to_string()]);
        assert!(context.emergency_requested());

        context.clear_emergency();
        assert!(!context.emergency_requested());
    }
}
