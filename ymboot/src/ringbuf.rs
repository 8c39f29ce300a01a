//! Fixed-capacity single-producer/single-consumer byte queue.
//!
//! The ring buffer decouples byte reception from the protocol parser: the
//! producer is the serial reader (interrupt context on the device, a reader
//! thread on the host), the consumer is the protocol loop. Writes never
//! block; a write that does not fit is truncated to the available free space.
//!
//! Index and free-count updates happen as one atomic step relative to the
//! other side. [`SharedRing`] wraps the buffer in a mutex held only for the
//! duration of a single queue operation, which is the host-side equivalent of
//! the original firmware's interrupt-disable critical section.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Fixed-capacity circular byte queue.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    write_idx: usize,
    read_idx: usize,
    free: usize,
}

impl RingBuffer {
    /// Create a ring buffer with the given capacity.
    ///
    /// Fails with [`Error::InvalidArgument`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("ring buffer capacity is zero"));
        }
        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            write_idx: 0,
            read_idx: 0,
            free: capacity,
        })
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes currently queued.
    pub fn used(&self) -> usize {
        self.buf.len() - self.free
    }

    /// Number of bytes that can still be written without truncation.
    pub fn free(&self) -> usize {
        self.free
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.free == self.buf.len()
    }

    /// Write as many bytes of `data` as fit, returning the count written.
    ///
    /// Never blocks. A full buffer accepts zero bytes.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free);
        if n == 0 {
            return 0;
        }

        let cap = self.buf.len();
        // Split into two contiguous copies when the range wraps.
        let first = n.min(cap - self.write_idx);
        self.buf[self.write_idx..self.write_idx + first].copy_from_slice(&data[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&data[first..n]);
        }

        self.write_idx = (self.write_idx + n) % cap;
        self.free -= n;
        n
    }

    /// Read up to `out.len()` bytes into `out`, returning the count read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.used());
        if n == 0 {
            return 0;
        }

        let cap = self.buf.len();
        let first = n.min(cap - self.read_idx);
        out[..first].copy_from_slice(&self.buf[self.read_idx..self.read_idx + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }

        self.read_idx = (self.read_idx + n) % cap;
        self.free += n;
        n
    }
}

/// Clonable handle to a [`RingBuffer`] shared between a producer and a
/// consumer running on different threads.
///
/// The lock is held only for one queue operation at a time, so the peer
/// never observes a torn index/free-count update.
#[derive(Debug, Clone)]
pub struct SharedRing {
    inner: Arc<Mutex<RingBuffer>>,
}

impl SharedRing {
    /// Create a shared ring buffer with the given capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(capacity)?)),
        })
    }

    /// Producer side: write as many bytes as fit, returning the count.
    pub fn write(&self, data: &[u8]) -> usize {
        self.inner.lock().unwrap().write(data)
    }

    /// Consumer side: read up to `out.len()` bytes, returning the count.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.inner.lock().unwrap().read(out)
    }

    /// Number of bytes currently queued.
    pub fn used(&self) -> usize {
        self.inner.lock().unwrap().used()
    }
}
