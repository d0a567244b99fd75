//! Per-connection send queue
//!
//! The dispatch path appends pre-encoded packet bytes to a shared buffer and
//! the connection task flushes the buffer to the socket when notified. A
//! partial OS write leaves the remainder in the task's local buffer, so the
//! byte offset inside the head packet is preserved across writes.
//!
//! Socket failures set a sticky `send_error` flag instead of tearing the
//! connection down inline: the caller may be dispatching under the shared
//! state lock, so the writer reaps the connection on its next cleanup pass.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::Packet;

pub struct SendQueue {
    /// Pre-encoded bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Wakes the connection task when the buffer has new data
    notify: Notify,
    /// Cleared on logout so the connection task exits its drain loop
    alive: AtomicBool,
    /// Sticky: set on any socket send failure
    send_error: AtomicBool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
            send_error: AtomicBool::new(false),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection dead and wake the drain loop
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn mark_send_error(&self) {
        self.send_error.store(true, Ordering::Release);
    }

    pub fn has_send_error(&self) -> bool {
        self.send_error.load(Ordering::Acquire)
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        let mut buf = self.buffer.lock();
        buf.split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Append pre-encoded packet bytes
    pub fn push_bytes(&self, bytes: &[u8]) {
        if !self.is_alive() {
            return;
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let was_empty = buffer.is_empty();
            buffer.extend_from_slice(bytes);
            was_empty
        };

        // Coalesces notifications during bursts
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// Encode a packet straight into the buffer
    pub fn push_packet(&self, packet: &Packet) {
        if !self.is_alive() {
            return;
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let was_empty = buffer.is_empty();
            let start_len = buffer.len();
            if Encoder::new().encode(packet, &mut buffer).is_err() {
                buffer.truncate(start_len);
                return;
            }
            was_empty
        };

        if was_empty {
            self.notify.notify_one();
        }
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("buffer_len", &self.buffer_len())
            .field("alive", &self.is_alive())
            .field("send_error", &self.has_send_error())
            .finish()
    }
}
