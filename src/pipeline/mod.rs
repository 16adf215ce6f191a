//! Streaming dataflow engine.
//!
//! Nodes own typed input and output ports. Outputs push time-stamped sample
//! buffers (or single values, or FFT frames) into the bounded queues of the
//! inputs they connect to, and every arrival schedules a work unit on the
//! shared [`Scheduler`]. A [`Graph`] owns the nodes and drives their
//! Stopped / Suspended / Running lifecycle.
//!
//! # Architecture
//!
//! ```text
//! [SignalSource] ──► [Gain] ──► [CollectorSink]
//!        │
//!        └─────────► [Spectrum] ──► [SpectrumSink]
//! ```
//!
//! # Design
//!
//! - **Work units, not threads**: nodes never own a thread. Data arrival
//!   submits a coalesced dispatch job to the worker pool.
//! - **Backpressure**: a sender waits (bounded, re-checked) for queue space
//!   while the consumer runs. Overflow anyway is fatal and stops the graph.
//! - **Ordered shutdown**: stop suspends nodes from the sources downstream,
//!   then flushes from the sinks upstream until no data moves.
//! - **Rate-independent time**: [`TimeStamp`] ticks convert exactly between
//!   samplerates.

pub mod attributes;
pub mod context;
pub mod graph;
pub mod id;
pub mod node;
pub mod nodes;
pub mod port;
pub mod registry;
pub mod ring_buffer;
pub mod scheduler;
pub mod state;
pub mod time;
pub mod time_located;

pub use attributes::{Attribute, AttributeValue};
pub use context::{
    EngineContext, GraphClock, GraphEvent, Notification, NotificationHub, NotificationLevel,
};
pub use graph::{Graph, GraphState};
pub use id::{NodeId, PortId};
pub use node::{FlushState, Node, NodeBehavior, NodeCore, ProcessingState};
pub use port::{InputPort, OutputPort, PortDataType, PortDescriptor, PortDirection};
pub use registry::{NodeArgs, NodeCategory, NodeRegistry};
pub use ring_buffer::{OverflowPolicy, RingBuffer, TimedRingBuffer};
pub use scheduler::{QuiesceGuard, Scheduler};
pub use state::{GraphSnapshot, NodeState, PersistedFields, PersistedValue};
pub use time::{TimeInterval, TimeStamp, MASTER_RATE};
pub use time_located::{TimeLocatedBuffer, TimeLocatedValue};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking work unit is reported through the scheduler and stops the
// graph; the data behind the lock stays usable for the shutdown path.

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T: ?Sized>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T: ?Sized>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
