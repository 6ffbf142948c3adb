//! Sample ring buffers fed by (or draining into) board DMA.
//!
//! [`CircularBuffer`] uses a power-of-two capacity so positions wrap with a
//! mask, and keeps an explicit fill count so a full buffer is never confused
//! with an empty one.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StcError};
use crate::pfi::Subsystem;

/// Largest ring a channel may allocate, in samples.
pub const MAX_BUFFER_SAMPLES: usize = 1 << 24;

/// Fixed-capacity ring of samples.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    buf: Vec<T>,
    head: usize,
    tail: usize,
    len: usize,
    mask: usize,
}

impl<T: Copy + Default> CircularBuffer<T> {
    /// Allocate a ring of at least `requested` slots (rounded up to a power
    /// of two, minimum 1, at most [`MAX_BUFFER_SAMPLES`]).
    pub fn with_capacity(requested: usize) -> Result<Self> {
        let capacity = requested
            .max(1)
            .checked_next_power_of_two()
            .filter(|&capacity| capacity <= MAX_BUFFER_SAMPLES)
            .ok_or_else(|| {
                StcError::invalid(format!(
                    "buffer of {requested} samples exceeds {MAX_BUFFER_SAMPLES}"
                ))
            })?;
        Ok(Self {
            buf: vec![T::default(); capacity],
            head: 0,
            tail: 0,
            len: 0,
            mask: capacity - 1,
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no samples are stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when no slot is free.
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Number of free slots.
    pub fn space(&self) -> usize {
        self.capacity() - self.len
    }

    /// Producer position.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Consumer position.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Append as many samples as fit; returns how many were stored.
    pub fn push_slice(&mut self, data: &[T]) -> usize {
        let n = data.len().min(self.space());
        for &sample in &data[..n] {
            self.buf[self.head] = sample;
            self.head = (self.head + 1) & self.mask;
        }
        self.len += n;
        n
    }

    /// Remove up to `out.len()` samples into `out`; returns how many.
    pub fn pop_into(&mut self, out: &mut [T]) -> usize {
        let n = out.len().min(self.len);
        for slot in &mut out[..n] {
            *slot = self.buf[self.tail];
            self.tail = (self.tail + 1) & self.mask;
        }
        self.len -= n;
        n
    }

    /// Drop all stored samples.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}

/// DMA channel of one subsystem.
///
/// The acquisition side produces with [`DmaChannel::put`] and user space
/// consumes with [`DmaChannel::get`]; for output the roles are swapped.
#[derive(Debug)]
pub struct DmaChannel {
    subsystem: Subsystem,
    ring: Mutex<Option<CircularBuffer<u16>>>,
}

impl DmaChannel {
    /// Create a channel with no buffer allocated.
    pub fn new(subsystem: Subsystem) -> Self {
        Self {
            subsystem,
            ring: Mutex::new(None),
        }
    }

    /// Owning subsystem.
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// (Re)allocate an empty buffer of at least `samples` slots.
    ///
    /// An oversized request fails with EINVAL and leaves the current buffer
    /// in place.
    pub fn allocate(&self, samples: usize) -> Result<()> {
        let ring = CircularBuffer::with_capacity(samples)?;
        debug!(subsystem = %self.subsystem, capacity = ring.capacity(), "DMA buffer allocated");
        *self.ring.lock() = Some(ring);
        Ok(())
    }

    /// Free the buffer and drop any samples in it.
    pub fn shutdown(&self) {
        if self.ring.lock().take().is_some() {
            debug!(subsystem = %self.subsystem, "DMA buffer released");
        }
    }

    /// Whether a buffer is allocated.
    pub fn is_allocated(&self) -> bool {
        self.ring.lock().is_some()
    }

    /// Samples waiting to be consumed.
    pub fn available(&self) -> usize {
        self.ring.lock().as_ref().map_or(0, CircularBuffer::len)
    }

    /// Free slots.
    pub fn space(&self) -> usize {
        self.ring.lock().as_ref().map_or(0, CircularBuffer::space)
    }

    /// Buffer capacity (0 when not allocated).
    pub fn capacity(&self) -> usize {
        self.ring.lock().as_ref().map_or(0, CircularBuffer::capacity)
    }

    /// Consume samples.
    pub fn get(&self, out: &mut [u16]) -> usize {
        self.ring
            .lock()
            .as_mut()
            .map_or(0, |ring| ring.pop_into(out))
    }

    /// Produce samples; returns how many fit.
    pub fn put(&self, data: &[u16]) -> usize {
        self.ring
            .lock()
            .as_mut()
            .map_or(0, |ring| ring.push_slice(data))
    }

    /// Current (head, tail) positions.
    pub fn positions(&self) -> Option<(usize, usize)> {
        self.ring
            .lock()
            .as_ref()
            .map(|ring| (ring.head(), ring.tail()))
    }
}
