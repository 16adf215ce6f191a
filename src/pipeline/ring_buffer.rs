//! Circular sample stores.
//!
//! [`RingBuffer`] is the plain FIFO with a fixed (drop oldest) or growable
//! overflow policy. [`TimedRingBuffer`] adds a samplerate and the stamp of the
//! newest sample; it backs every data input queue.
//!
//! Neither type locks internally. The owning port keeps each queue behind a
//! single mutex, so a producer and a consumer never interleave partial
//! operations on the same buffer.

use crate::error::{EngineError, Result};
use crate::pipeline::time::TimeStamp;
use crate::pipeline::time_located::TimeLocatedBuffer;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// Growable buffers round their capacity up to this granularity.
const GROW_GRANULARITY: usize = 2048;

/// What a write does when it doesn't fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the oldest samples to make room.
    #[default]
    DropOldest,
    /// Enlarge the backing store.
    Grow,
}

/// Fixed-capacity circular FIFO.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
    head: usize,
    tail: usize,
    len: usize,
    policy: OverflowPolicy,
}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            data: vec![T::default(); capacity],
            head: 0,
            tail: 0,
            len: 0,
            policy,
        }
    }

    pub fn fixed(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::DropOldest)
    }

    pub fn growable(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::Grow)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: OverflowPolicy) {
        self.policy = policy;
    }

    /// Append all of `data`. See [`RingBuffer::write_range`].
    pub fn write(&mut self, data: &[T]) -> usize {
        self.write_range(data, 0, data.len())
    }

    /// Append `count` samples of `data` starting at `offset`.
    ///
    /// Returns the number of samples stored. In fixed mode that is at most the
    /// capacity: the oldest queued samples are skipped to make room, and when
    /// `count` alone exceeds the capacity only the newest `capacity` input
    /// samples are kept. In growable mode everything is stored.
    pub fn write_range(&mut self, data: &[T], offset: usize, count: usize) -> usize {
        let count = count.min(data.len().saturating_sub(offset));
        if count == 0 {
            return 0;
        }
        let mut src = &data[offset..offset + count];

        if self.len + src.len() > self.capacity() {
            match self.policy {
                OverflowPolicy::Grow => {
                    let needed = self.len + src.len();
                    self.set_capacity((needed + GROW_GRANULARITY - 1) & !(GROW_GRANULARITY - 1));
                }
                OverflowPolicy::DropOldest => {
                    let to_skip = self.len.min(self.len + src.len() - self.capacity());
                    self.skip(to_skip);
                    if src.len() > self.capacity() {
                        src = &src[src.len() - self.capacity()..];
                    }
                }
            }
        }

        let cap = self.capacity();
        if cap == 0 || src.is_empty() {
            return 0;
        }

        let first = src.len().min(cap - self.tail);
        self.data[self.tail..self.tail + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }

        self.tail = (self.tail + src.len()) % cap;
        self.len += src.len();
        src.len()
    }

    /// Fill `dst` from the head, consuming what was copied.
    pub fn read(&mut self, dst: &mut [T]) -> usize {
        let count = dst.len();
        self.read_into(dst, 0, count)
    }

    /// Copy up to `count` samples into `dst[offset..]` and consume them.
    pub fn read_into(&mut self, dst: &mut [T], offset: usize, count: usize) -> usize {
        let read = self.peek(dst, 0, offset, count);
        self.skip(read);
        read
    }

    /// Copy up to `count` samples starting `src_offset` past the head into
    /// `dst[dst_offset..]` without consuming them.
    pub fn peek(&self, dst: &mut [T], src_offset: usize, dst_offset: usize, count: usize) -> usize {
        let available = self.len.saturating_sub(src_offset);
        let room = dst.len().saturating_sub(dst_offset);
        let count = count.min(available).min(room);
        if count == 0 {
            return 0;
        }

        let cap = self.capacity();
        let start = (self.head + src_offset) % cap;
        let first = count.min(cap - start);
        dst[dst_offset..dst_offset + first].copy_from_slice(&self.data[start..start + first]);
        let rest = count - first;
        if rest > 0 {
            dst[dst_offset + first..dst_offset + count].copy_from_slice(&self.data[..rest]);
        }
        count
    }

    /// Discard up to `count` samples from the head.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        if count == 0 {
            return 0;
        }
        self.head = (self.head + count) % self.capacity();
        self.len -= count;
        if self.len == 0 {
            self.head = 0;
            self.tail = 0;
        }
        count
    }

    /// Sample `index` positions past the head.
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        Some(self.data[(self.head + index) % self.capacity()])
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.data[(self.head + i) % self.capacity()])
    }

    /// Copy of the queued samples in FIFO order.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    fn set_capacity(&mut self, capacity: usize) {
        let mut data = vec![T::default(); capacity];
        let queued = self.len;
        self.peek(&mut data, 0, 0, queued);
        self.data = data;
        self.head = 0;
        self.tail = if capacity == 0 { 0 } else { queued % capacity };
        self.len = queued;
    }
}

impl<T: Copy + Default> Index<usize> for RingBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(
            index < self.len,
            "index {} out of range for ring buffer of length {}",
            index,
            self.len
        );
        &self.data[(self.head + index) % self.capacity()]
    }
}

/// Ring of samples at one rate, stamped with the time of its newest sample.
#[derive(Debug, Clone)]
pub struct TimedRingBuffer {
    ring: RingBuffer<f64>,
    rate: u32,
    end_time: TimeStamp,
    /// Whether `end_time` follows a stream yet; the first buffer sets it.
    synced: bool,
}

impl TimedRingBuffer {
    pub fn new(capacity: usize, rate: u32) -> Self {
        Self {
            ring: RingBuffer::fixed(capacity),
            rate,
            end_time: TimeStamp::ZERO,
            synced: false,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn free(&self) -> usize {
        self.ring.free()
    }

    /// Stamp of the newest queued sample.
    pub fn end_time(&self) -> TimeStamp {
        self.end_time
    }

    /// Stamp of the oldest queued sample.
    pub fn begin_time(&self) -> TimeStamp {
        self.end_time.sub_samples(self.len() as i64, self.rate)
    }

    pub fn ring(&self) -> &RingBuffer<f64> {
        &self.ring
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.end_time = TimeStamp::ZERO;
        self.synced = false;
    }

    /// Append the written part of `buffer`.
    ///
    /// The queue's clock advances by the written samples. When that does not
    /// land on the buffer's own stamp, samples went missing (or overlapped)
    /// upstream; the gap is logged and the queue adopts the buffer's stamp.
    pub fn enqueue(&mut self, buffer: &TimeLocatedBuffer) -> Result<usize> {
        if buffer.rate() != self.rate {
            return Err(EngineError::RateMismatch {
                expected: self.rate,
                actual: buffer.rate(),
            });
        }

        let incoming = buffer.written();
        if incoming == 0 {
            return Ok(0);
        }
        let overflow = (self.len() + incoming).saturating_sub(self.capacity());
        if overflow > 0 && self.ring.policy() == OverflowPolicy::DropOldest {
            tracing::warn!(
                "Ring buffer too small ({} samples), dropping {} samples",
                self.capacity(),
                overflow
            );
        }

        let written = self.ring.write(buffer.written_samples());
        if !self.synced {
            self.synced = true;
            self.end_time = buffer.current_time();
            return Ok(written);
        }
        self.end_time = self.end_time.add_samples(incoming as i64, self.rate);

        if buffer.current_time() != self.end_time {
            tracing::warn!(
                "Ring buffer: missing samples. Buffer timestamp: {}, ring timestamp: {}",
                buffer.current_time(),
                self.end_time
            );
            self.end_time = buffer.current_time();
        }

        Ok(written)
    }

    /// Move up to `count` samples (all the buffer holds when `None`) into
    /// `buffer`, stamping it with the time of the last sample moved.
    pub fn dequeue(&mut self, buffer: &mut TimeLocatedBuffer, count: Option<usize>) -> Result<usize> {
        if buffer.rate() != self.rate {
            return Err(EngineError::RateMismatch {
                expected: self.rate,
                actual: buffer.rate(),
            });
        }

        let count = count.unwrap_or(buffer.len()).min(buffer.len());
        buffer.set_time(self.begin_time());
        let read = self.ring.read_into(buffer.samples_mut(), 0, count);
        buffer.set_written(read);
        Ok(read)
    }

    /// Copy of all queued samples without consuming them.
    pub fn peek_all(&self) -> Vec<f64> {
        self.ring.to_vec()
    }

    pub fn skip(&mut self, count: usize) -> usize {
        self.ring.skip(count)
    }
}
