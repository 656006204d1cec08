//! Direct write buffer for a client connection.
//!
//! The broker appends encoded frames to the buffer while holding its lock;
//! the connection task waits on the notify handle and flushes the buffer to
//! the socket outside the lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Transport;

/// Shared write buffer between the broker and one connection task
pub struct SharedWriter {
    /// Encoded bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Signalled when the buffer gains data or the writer is closed
    notify: Notify,
    alive: AtomicBool,
}

impl SharedWriter {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Get the notify handle for the connection loop
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    /// Get buffer length (for debugging and tests)
    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl Default for SharedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SharedWriter {
    fn send(&self, bytes: Bytes) {
        if !self.is_alive() {
            return;
        }
        self.buffer.lock().extend_from_slice(&bytes);
        self.notify.notify_one();
    }

    /// Mark the connection as closed; bytes already buffered are still
    /// flushed by the connection task
    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        !self.is_alive()
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter")
            .field("alive", &self.is_alive())
            .field("buffered", &self.buffer_len())
            .finish()
    }
}
