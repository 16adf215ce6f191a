//! Typed, time-stamped ports.
//!
//! Each node declares its ports as [`PortDescriptor`]s; the node turns them
//! into [`InputPort`]s and [`OutputPort`]s when it is created. An output fans
//! out to any number of inputs, an input accepts at most one connection.
//!
//! Array and FFT inputs own a bounded [`TimedRingBuffer`] queue sized when
//! processing is prepared. Value inputs keep a time-ordered list of single
//! [`TimeLocatedValue`]s. Every arrival schedules a dispatch on the owning
//! node while that node is running.

use crate::error::{EngineError, Result};
use crate::pipeline::context::EngineContext;
use crate::pipeline::id::{NodeId, PortId};
use crate::pipeline::node::{Node, ProcessingState};
use crate::pipeline::ring_buffer::TimedRingBuffer;
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::{TimeLocatedBuffer, TimeLocatedValue};
use crate::pipeline::{lock, read, write};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};

/// The kind of data flowing through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDataType {
    /// Continuous sample stream.
    Array,
    /// Discrete time-stamped values.
    Value,
    /// Spectrum frames of `fft_size / 2` magnitudes each.
    Fft,
}

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Descriptor for a node's port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: String,
    pub direction: PortDirection,
    pub data_type: PortDataType,
}

impl PortDescriptor {
    pub fn input(name: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Input,
            data_type,
        }
    }

    pub fn output(name: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Output,
            data_type,
        }
    }
}

/// Number of values in one frame of an FFT stream.
pub fn fft_frame_len(fft_size: usize) -> usize {
    (fft_size / 2).max(1)
}

/// Receiving end of a connection.
pub struct InputPort {
    name: String,
    node_name: String,
    node_id: NodeId,
    index: usize,
    data_type: PortDataType,
    owner: Weak<Node>,
    connection: Mutex<Option<Weak<OutputPort>>>,
    rate: AtomicU32,
    fft_size: AtomicUsize,
    buffer_len: AtomicUsize,
    queue: Mutex<Option<TimedRingBuffer>>,
    /// Signalled whenever queued samples are consumed.
    space: Condvar,
    values: Mutex<VecDeque<TimeLocatedValue>>,
    pub(crate) dispatch_pending: AtomicBool,
}

impl InputPort {
    pub(crate) fn new(
        descriptor: &PortDescriptor,
        index: usize,
        node_id: NodeId,
        node_name: &str,
        owner: Weak<Node>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            node_name: node_name.to_string(),
            node_id,
            index,
            data_type: descriptor.data_type,
            owner,
            connection: Mutex::new(None),
            rate: AtomicU32::new(0),
            fft_size: AtomicUsize::new(0),
            buffer_len: AtomicUsize::new(0),
            queue: Mutex::new(None),
            space: Condvar::new(),
            values: Mutex::new(VecDeque::new()),
            dispatch_pending: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `node.port`, for messages.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.node_name, self.name)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> PortId {
        PortId::new(self.node_id, self.index as u16)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn data_type(&self) -> PortDataType {
        self.data_type
    }

    pub fn owner(&self) -> Option<Arc<Node>> {
        self.owner.upgrade()
    }

    pub fn samplerate(&self) -> u32 {
        self.rate.load(Ordering::SeqCst)
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size.load(Ordering::SeqCst)
    }

    /// Samples handed to the node per dispatch.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> Option<Arc<OutputPort>> {
        lock(&self.connection).as_ref().and_then(Weak::upgrade)
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub(crate) fn set_connection(&self, output: Option<Weak<OutputPort>>) {
        *lock(&self.connection) = output;
    }

    /// Samples waiting in the queue.
    pub fn queued(&self) -> usize {
        lock(&self.queue).as_ref().map_or(0, TimedRingBuffer::len)
    }

    pub fn free(&self) -> usize {
        lock(&self.queue).as_ref().map_or(0, TimedRingBuffer::free)
    }

    pub fn capacity(&self) -> usize {
        lock(&self.queue).as_ref().map_or(0, TimedRingBuffer::capacity)
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.queue).is_some()
    }

    /// Stamp just past the newest queued sample.
    pub fn queue_end_time(&self) -> Option<TimeStamp> {
        lock(&self.queue).as_ref().map(TimedRingBuffer::end_time)
    }

    /// Fails unless the owning node is stopped.
    pub(crate) fn ensure_owner_stopped(&self, what: &'static str) -> Result<()> {
        match self.owner.upgrade() {
            Some(owner) if owner.state() != ProcessingState::Stopped => {
                Err(EngineError::RateChangeWhileRunning {
                    port: self.full_name(),
                    what,
                })
            }
            _ => Ok(()),
        }
    }

    /// Set the samplerate. The queue is dropped and must be prepared again.
    pub(crate) fn set_samplerate(&self, rate: u32) -> Result<()> {
        if self.samplerate() == rate {
            return Ok(());
        }
        self.ensure_owner_stopped("samplerate")?;
        match self.owner.upgrade() {
            Some(owner) => owner.input_samplerate_changed(self.index, || {
                self.rate.store(rate, Ordering::SeqCst);
                *lock(&self.queue) = None;
            }),
            None => {
                self.rate.store(rate, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    pub(crate) fn set_fft_size(&self, size: usize) -> Result<()> {
        if self.fft_size() == size {
            return Ok(());
        }
        self.ensure_owner_stopped("FFT size")?;
        match self.owner.upgrade() {
            Some(owner) => owner.fft_size_changed(self.index, || {
                self.fft_size.store(size, Ordering::SeqCst);
                *lock(&self.queue) = None;
            }),
            None => {
                self.fft_size.store(size, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Allocate a queue of `capacity` samples, dispatched `buffer_len` at a time.
    pub fn init_buffers(&self, capacity: usize, buffer_len: usize) {
        let rate = self.samplerate();
        *lock(&self.queue) = Some(TimedRingBuffer::new(capacity, rate));
        self.buffer_len.store(buffer_len.max(1), Ordering::SeqCst);
        lock(&self.values).clear();
        tracing::debug!(
            "Input '{}' prepared: {} Hz, queue {} samples, buffer {} samples",
            self.full_name(),
            rate,
            capacity,
            buffer_len
        );
    }

    fn engine(&self) -> Option<Arc<EngineContext>> {
        self.owner.upgrade().map(|owner| Arc::clone(owner.engine()))
    }

    fn owner_running(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.state() == ProcessingState::Running)
    }

    /// Enqueue a buffer from the connected output.
    ///
    /// A missing queue or a buffer that doesn't fit is fatal: the graph is
    /// asked for an emergency stop and the error is returned.
    pub fn receive(&self, buffer: &TimeLocatedBuffer) -> Result<()> {
        let result = {
            let mut queue = lock(&self.queue);
            match queue.as_mut() {
                None => Err(EngineError::QueueNotInitialized {
                    port: self.full_name(),
                }),
                Some(queue) => {
                    let incoming = buffer.written();
                    let frame = fft_frame_len(self.fft_size());
                    if self.data_type == PortDataType::Fft && incoming % frame != 0 {
                        Err(EngineError::FftFrameLength {
                            len: incoming,
                            frame,
                        })
                    } else if queue.len() + incoming > queue.capacity() {
                        Err(EngineError::QueueOverflow {
                            port: self.full_name(),
                            queued: queue.len(),
                            capacity: queue.capacity(),
                            incoming,
                        })
                    } else {
                        queue.enqueue(buffer).map(|_| ())
                    }
                }
            }
        };

        if let Err(e) = result {
            if e.is_capacity_error() {
                if let Some(engine) = self.engine() {
                    engine.request_emergency_stop(e.to_string(), Some(self.node_id));
                }
            }
            return Err(e);
        }

        if let Some(owner) = self.owner.upgrade() {
            if owner.state() == ProcessingState::Running {
                owner.schedule_data(self.index);
            }
        }
        Ok(())
    }

    /// Block until at least `needed` samples fit into the queue and return
    /// the free space.
    ///
    /// Gives up with `None` as soon as the owning node stops running or an
    /// emergency stop is pending, and never waits for more space than the
    /// queue has.
    pub fn wait_for_space(&self, needed: usize) -> Option<usize> {
        let engine = self.engine();
        let poll = engine
            .as_ref()
            .map(|engine| engine.settings().backpressure_poll())
            .unwrap_or_default();
        let emergency = || engine.as_ref().is_some_and(|e| e.emergency_requested());
        let mut queue = lock(&self.queue);
        loop {
            let q = queue.as_ref()?;
            if q.free() >= needed {
                return Some(q.free());
            }
            if needed > q.capacity() || !self.owner_running() || poll.is_zero() || emergency() {
                return None;
            }
            queue = self
                .space
                .wait_timeout(queue, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Smallest piece a sender may split a buffer into: one frame for FFT
    /// inputs, one sample otherwise.
    pub fn transfer_step(&self) -> usize {
        match self.data_type {
            PortDataType::Fft => fft_frame_len(self.fft_size()).max(1),
            _ => 1,
        }
    }

    /// Wake senders waiting for space.
    pub(crate) fn notify_space(&self) {
        self.space.notify_all();
    }

    /// Dequeue one dispatch buffer.
    pub fn read(&self) -> Option<TimeLocatedBuffer> {
        self.read_count(None)
    }

    /// Dequeue up to `count` samples (default: the dispatch buffer length).
    pub fn read_count(&self, count: Option<usize>) -> Option<TimeLocatedBuffer> {
        let mut queue = lock(&self.queue);
        let q = queue.as_mut()?;
        let count = count.unwrap_or_else(|| self.buffer_len()).min(q.len());
        if count == 0 {
            return None;
        }
        let mut buffer = TimeLocatedBuffer::new(count, q.rate());
        let read = q.dequeue(&mut buffer, Some(count)).ok()?;
        drop(queue);
        self.space.notify_all();
        (read > 0).then_some(buffer)
    }

    /// All queued samples, oldest first, without consuming them.
    pub fn peek_all(&self) -> Vec<f64> {
        lock(&self.queue)
            .as_ref()
            .map(TimedRingBuffer::peek_all)
            .unwrap_or_default()
    }

    /// Drop up to `count` queued samples.
    pub fn skip(&self, count: usize) -> usize {
        let skipped = lock(&self.queue).as_mut().map_or(0, |q| q.skip(count));
        self.space.notify_all();
        skipped
    }

    /// Insert a value keeping the list ordered by stamp.
    pub fn receive_value(&self, value: TimeLocatedValue) -> Result<()> {
        {
            let mut values = lock(&self.values);
            let at = values.partition_point(|v| v.stamp <= value.stamp);
            values.insert(at, value);
        }
        if let Some(owner) = self.owner.upgrade() {
            if owner.state() == ProcessingState::Running {
                owner.schedule_value(self.index);
            }
        }
        Ok(())
    }

    pub fn pop_value(&self) -> Option<TimeLocatedValue> {
        lock(&self.values).pop_front()
    }

    /// Remove and return every value stamped at or before `stamp`.
    pub fn values_until(&self, stamp: TimeStamp) -> Vec<TimeLocatedValue> {
        let mut values = lock(&self.values);
        let count = values.partition_point(|v| v.stamp <= stamp);
        values.drain(..count).collect()
    }

    pub fn value_count(&self) -> usize {
        lock(&self.values).len()
    }

    pub(crate) fn snapshot_queue(&self) -> Option<TimedRingBuffer> {
        lock(&self.queue).clone()
    }

    /// Fails if a saved queue was taken at another samplerate.
    pub(crate) fn check_queue(&self, queue: Option<&TimedRingBuffer>) -> Result<()> {
        match queue {
            Some(q) if q.rate() != self.samplerate() => Err(EngineError::StateRateMismatch {
                port: self.full_name(),
                saved: q.rate(),
                current: self.samplerate(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn restore_queue(&self, queue: Option<TimedRingBuffer>) -> Result<()> {
        self.check_queue(queue.as_ref())?;
        *lock(&self.queue) = queue;
        self.space.notify_all();
        Ok(())
    }

    pub(crate) fn snapshot_values(&self) -> Vec<TimeLocatedValue> {
        lock(&self.values).iter().copied().collect()
    }

    pub(crate) fn restore_values(&self, values: Vec<TimeLocatedValue>) {
        let mut sorted = values;
        sorted.sort_by_key(|v| v.stamp);
        *lock(&self.values) = sorted.into();
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("name", &self.full_name())
            .field("data_type", &self.data_type)
            .field("rate", &self.samplerate())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Sending end of any number of connections.
pub struct OutputPort {
    name: String,
    node_name: String,
    node_id: NodeId,
    index: usize,
    data_type: PortDataType,
    owner: Weak<Node>,
    connections: RwLock<Vec<Arc<InputPort>>>,
    rate: AtomicU32,
    fft_size: AtomicUsize,
}

impl OutputPort {
    pub(crate) fn new(
        descriptor: &PortDescriptor,
        index: usize,
        node_id: NodeId,
        node_name: &str,
        owner: Weak<Node>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            node_name: node_name.to_string(),
            node_id,
            index,
            data_type: descriptor.data_type,
            owner,
            connections: RwLock::new(Vec::new()),
            rate: AtomicU32::new(0),
            fft_size: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.node_name, self.name)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> PortId {
        PortId::new(self.node_id, self.index as u16)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn data_type(&self) -> PortDataType {
        self.data_type
    }

    pub fn owner(&self) -> Option<Arc<Node>> {
        self.owner.upgrade()
    }

    pub fn samplerate(&self) -> u32 {
        self.rate.load(Ordering::SeqCst)
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<InputPort>> {
        read(&self.connections).clone()
    }

    pub fn is_connected(&self) -> bool {
        !read(&self.connections).is_empty()
    }

    /// Fails unless this port's node and every connected node are stopped.
    fn ensure_owners_stopped(&self, what: &'static str) -> Result<()> {
        if let Some(owner) = self.owner.upgrade() {
            if owner.state() != ProcessingState::Stopped {
                return Err(EngineError::RateChangeWhileRunning {
                    port: self.full_name(),
                    what,
                });
            }
        }
        for input in read(&self.connections).iter() {
            input.ensure_owner_stopped(what)?;
        }
        Ok(())
    }

    /// Set the samplerate and propagate it to every connected input.
    pub fn set_samplerate(&self, rate: u32) -> Result<()> {
        self.ensure_owners_stopped("samplerate")?;
        if self.samplerate() == rate {
            return Ok(());
        }
        self.rate.store(rate, Ordering::SeqCst);
        for input in self.connections() {
            input.set_samplerate(rate)?;
        }
        Ok(())
    }

    pub fn set_fft_size(&self, size: usize) -> Result<()> {
        self.ensure_owners_stopped("FFT size")?;
        if self.fft_size() == size {
            return Ok(());
        }
        self.fft_size.store(size, Ordering::SeqCst);
        for input in self.connections() {
            input.set_fft_size(size)?;
        }
        Ok(())
    }

    /// Connect to `input`, handing it this port's samplerate and FFT size.
    pub fn connect(self: &Arc<Self>, input: &Arc<InputPort>) -> Result<()> {
        let owner = self.owner.upgrade();
        if let Some(owner) = &owner {
            if owner.state() != ProcessingState::Stopped {
                return Err(EngineError::GraphRunning(format!(
                    "can't connect '{}' while '{}' is processing",
                    self.full_name(),
                    owner.name()
                )));
            }
        }
        if let Some(target) = input.owner() {
            if target.state() != ProcessingState::Stopped {
                return Err(EngineError::GraphRunning(format!(
                    "can't connect '{}' while '{}' is processing",
                    input.full_name(),
                    target.name()
                )));
            }
        }
        if self.data_type != input.data_type() {
            return Err(EngineError::IncompatibleType {
                output: self.data_type,
                input: input.data_type(),
            });
        }
        {
            let mut connection = lock(&input.connection);
            if connection.as_ref().and_then(Weak::upgrade).is_some() {
                return Err(EngineError::InputAlreadyConnected {
                    port: input.full_name(),
                });
            }
            *connection = Some(Arc::downgrade(self));
        }
        write(&self.connections).push(Arc::clone(input));
        tracing::debug!("Connected '{}' -> '{}'", self.full_name(), input.full_name());

        input.set_samplerate(self.samplerate())?;
        input.set_fft_size(self.fft_size())?;
        if let Some(owner) = &owner {
            owner.output_connections_changed(self.index)?;
        }
        if let Some(target) = input.owner() {
            target.input_connection_changed(input.index())?;
        }
        Ok(())
    }

    pub fn disconnect(&self, input: &Arc<InputPort>) -> Result<()> {
        let removed = {
            let mut connections = write(&self.connections);
            let before = connections.len();
            connections.retain(|c| !Arc::ptr_eq(c, input));
            before != connections.len()
        };
        if !removed {
            return Err(EngineError::NotConnected {
                output: self.full_name(),
                input: input.full_name(),
            });
        }
        input.set_connection(None);
        tracing::debug!("Disconnected '{}' -> '{}'", self.full_name(), input.full_name());

        if let Some(owner) = self.owner.upgrade() {
            owner.output_connections_changed(self.index)?;
        }
        if let Some(target) = input.owner() {
            target.input_connection_changed(input.index())?;
        }
        Ok(())
    }

    pub(crate) fn disconnect_all(&self) {
        for input in self.connections() {
            if let Err(e) = self.disconnect(&input) {
                tracing::warn!("Failed to disconnect '{}': {}", input.full_name(), e);
            }
        }
    }

    /// Free space of the fullest connected queue.
    pub fn min_free(&self) -> usize {
        read(&self.connections)
            .iter()
            .map(|input| input.free())
            .min()
            .unwrap_or(usize::MAX)
    }

    /// Deliver a buffer to every connected input.
    ///
    /// Every input is served even if an earlier one fails; the first error
    /// is returned.
    pub fn send(&self, buffer: &TimeLocatedBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut first_error = None;
        for input in self.connections() {
            if let Err(e) = transfer(&input, buffer) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn send_value(&self, value: TimeLocatedValue) -> Result<()> {
        let mut first_error = None;
        for input in self.connections() {
            if let Err(e) = input.receive_value(value) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Hand `buffer` to `input` in pieces that fit its free space, waiting for
/// the consumer between pieces.
///
/// A full queue always holds at least one dispatch buffer, so the consumer
/// keeps making room. If the wait gives up, the rest is enqueued anyway and
/// overflows.
fn transfer(input: &InputPort, buffer: &TimeLocatedBuffer) -> Result<()> {
    let total = buffer.written();
    let step = input.transfer_step();
    let mut offset = 0;
    while offset < total {
        let remaining = total - offset;
        let count = input
            .wait_for_space(step.min(remaining))
            .map_or(0, |free| remaining.min(free) / step * step);
        if count == 0 {
            return input.receive(&buffer.slice(offset, remaining));
        }
        if count == total {
            return input.receive(buffer);
        }
        input.receive(&buffer.slice(offset, count))?;
        offset += count;
    }
    Ok(())
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("name", &self.full_name())
            .field("data_type", &self.data_type)
            .field("rate", &self.samplerate())
            .field("connections", &read(&self.connections).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_input(data_type: PortDataType) -> InputPort {
        InputPort::new(
            &PortDescriptor::input("in", data_type),
            0,
            NodeId(1),
            "Node",
            Weak::new(),
        )
    }

    fn detached_output(data_type: PortDataType) -> Arc<OutputPort> {
        Arc::new(OutputPort::new(
            &PortDescriptor::output("out", data_type),
            0,
            NodeId(0),
            "Source",
            Weak::new(),
        ))
    }

    fn buffer(values: &[f64], rate: u32) -> TimeLocatedBuffer {
        let mut buf = TimeLocatedBuffer::new(values.len(), rate);
        buf.copy_from_slice(values);
        buf
    }

    #[test]
    fn test_receive_without_queue_fails() {
        let input = detached_input(PortDataType::Array);
        let err = input.receive(&buffer(&[1.0], 10)).unwrap_err();
        assert!(matches!(err, EngineError::QueueNotInitialized { .. }));
    }

    #[test]
    fn test_receive_overflow_is_rejected() {
        let input = detached_input(PortDataType::Array);
        input.set_samplerate(10).unwrap();
        input.init_buffers(4, 2);
        input.receive(&buffer(&[1.0, 2.0, 3.0], 10)).unwrap();
        let err = input.receive(&buffer(&[4.0, 5.0], 10)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::QueueOverflow {
                queued: 3,
                capacity: 4,
                incoming: 2,
                ..
            }
        ));
        // The rejected buffer left the queue untouched.
        assert_eq!(input.peek_all(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_read_uses_buffer_len() {
        let input = detached_input(PortDataType::Array);
        input.set_samplerate(10).unwrap();
        input.init_buffers(10, 3);
        input.receive(&buffer(&[1.0, 2.0, 3.0, 4.0, 5.0], 10)).unwrap();

        let first = input.read().unwrap();
        assert_eq!(first.written_samples(), &[1.0, 2.0, 3.0]);
        assert_eq!(first.front_time(), TimeStamp::ZERO);
        let rest = input.read().unwrap();
        assert_eq!(rest.written_samples(), &[4.0, 5.0]);
        assert_eq!(rest.front_time(), TimeStamp::from_seconds(0.3));
        assert!(input.read().is_none());
    }

    #[test]
    fn test_fft_frames_must_be_whole() {
        let input = detached_input(PortDataType::Fft);
        input.set_samplerate(100).unwrap();
        input.set_fft_size(8).unwrap();
        input.init_buffers(16, 4);
        input.receive(&buffer(&[0.0; 4], 100)).unwrap();
        let err = input.receive(&buffer(&[0.0; 3], 100)).unwrap_err();
        assert!(matches!(err, EngineError::FftFrameLength { len: 3, frame: 4 }));
    }

    #[test]
    fn test_values_stay_ordered() {
        let input = detached_input(PortDataType::Value);
        for (value, ms) in [(1.0, 30.0), (2.0, 10.0), (3.0, 20.0), (4.0, 10.0)] {
            input
                .receive_value(TimeLocatedValue::new(value, TimeStamp::from_millis(ms)))
                .unwrap();
        }
        let order: Vec<f64> = input.snapshot_values().iter().map(|v| v.value).collect();
        // Equal stamps keep arrival order.
        assert_eq!(order, vec![2.0, 4.0, 3.0, 1.0]);

        let early = input.values_until(TimeStamp::from_millis(15.0));
        assert_eq!(early.len(), 2);
        assert_eq!(input.pop_value().map(|v| v.value), Some(3.0));
        assert_eq!(input.value_count(), 1);
    }

    #[test]
    fn test_connect_checks_types_and_single_connection() {
        let out = detached_output(PortDataType::Array);
        let other = detached_output(PortDataType::Array);
        let fft_in = Arc::new(detached_input(PortDataType::Fft));
        assert!(matches!(
            out.connect(&fft_in),
            Err(EngineError::IncompatibleType { .. })
        ));

        let input = Arc::new(detached_input(PortDataType::Array));
        out.set_samplerate(250).unwrap();
        out.connect(&input).unwrap();
        assert_eq!(input.samplerate(), 250);
        assert!(input.is_connected());
        assert!(matches!(
            other.connect(&input),
            Err(EngineError::InputAlreadyConnected { .. })
        ));

        // Rate changes propagate along connections.
        out.set_samplerate(500).unwrap();
        assert_eq!(input.samplerate(), 500);

        out.disconnect(&input).unwrap();
        assert!(!input.is_connected());
        assert!(matches!(
            out.disconnect(&input),
            Err(EngineError::NotConnected { .. })
        ));
        other.connect(&input).unwrap();
    }

    #[test]
    fn test_rate_change_drops_queue() {
        let input = detached_input(PortDataType::Array);
        input.set_samplerate(10).unwrap();
        input.init_buffers(10, 5);
        assert!(input.is_initialized());
        input.set_samplerate(20).unwrap();
        assert!(!input.is_initialized());
    }

    #[test]
    fn test_send_fans_out_and_tracks_min_free() {
        let out = detached_output(PortDataType::Array);
        out.set_samplerate(10).unwrap();
        assert_eq!(out.min_free(), usize::MAX);

        let a = Arc::new(detached_input(PortDataType::Array));
        let b = Arc::new(detached_input(PortDataType::Array));
        out.connect(&a).unwrap();
        out.connect(&b).unwrap();
        a.init_buffers(10, 5);
        b.init_buffers(6, 5);

        out.send(&buffer(&[1.0, 2.0, 3.0, 4.0], 10)).unwrap();
        assert_eq!(a.queued(), 4);
        assert_eq!(b.queued(), 4);
        assert_eq!(out.min_free(), 2);
    }

    #[test]
    fn test_wait_for_space_gives_up_without_running_owner() {
        let input = detached_input(PortDataType::Array);
        input.set_samplerate(10).unwrap();
        input.init_buffers(4, 4);
        input.receive(&buffer(&[1.0; 4], 10)).unwrap();
        assert_eq!(input.wait_for_space(1), None);
        assert_eq!(input.wait_for_space(0), Some(0));
        input.skip(2);
        assert_eq!(input.wait_for_space(2), Some(2));
    }
}
