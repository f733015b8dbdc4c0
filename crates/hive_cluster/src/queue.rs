//! Bounded outbound queue between caller threads and the writer thread.
//!
//! The queue is a `crossbeam_channel::bounded` pair held behind a lock so
//! its capacity can be changed at runtime by swapping in a fresh pair.
//! Messages resident at swap time are carried over while they fit; the
//! rest are dropped.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::RwLock;

use crate::error::{ClusterError, Result};
use crate::node::Message;

struct Buffer {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    capacity: usize,
    generation: u64,
}

impl Buffer {
    fn new(capacity: usize, generation: u64) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            generation,
        }
    }
}

/// FIFO of messages awaiting transmission.
pub struct OutboundQueue {
    buffer: RwLock<Buffer>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(Buffer::new(capacity.max(1), 0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.read().capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.read().rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sender(&self) -> (Sender<Message>, u64) {
        let buffer = self.buffer.read();
        (buffer.tx.clone(), buffer.generation)
    }

    /// Enqueue, blocking while the queue is full.
    ///
    /// Returns [`ClusterError::Closed`] if `cancel` fires (or is dropped)
    /// before a slot frees up.
    pub fn send(&self, mut message: Message, cancel: &Receiver<()>) -> Result<()> {
        loop {
            let (tx, generation) = self.sender();
            let failed = select! {
                send(tx, message) -> res => match res {
                    Ok(()) => return Ok(()),
                    Err(e) => e.into_inner(),
                },
                recv(cancel) -> _ => return Err(ClusterError::Closed),
            };
            // The buffer was swapped out from under us; retry on the new one.
            if self.sender().1 == generation {
                tracing::warn!("Outbound queue disconnected, dropping message");
                return Ok(());
            }
            message = failed;
        }
    }

    /// Enqueue within `timeout`, dropping the message otherwise.
    pub fn send_timeout(&self, message: Message, timeout: Duration) -> bool {
        let (tx, _) = self.sender();
        match tx.send_timeout(message, timeout) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Outbound queue full, dropped command {}", e.into_inner().command);
                false
            }
        }
    }

    /// Take the next message, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout or when `cancel` fires; callers re-poll so a
    /// capacity swap is picked up within one timeout.
    pub fn recv(&self, cancel: &Receiver<()>, timeout: Duration) -> Option<Message> {
        let rx = self.buffer.read().rx.clone();
        select! {
            recv(rx) -> msg => msg.ok(),
            recv(cancel) -> _ => None,
            default(timeout) => None,
        }
    }

    /// Non-blocking take, used to drain the queue.
    pub fn try_recv(&self) -> Option<Message> {
        self.buffer.read().rx.try_recv().ok()
    }

    /// Replace the buffer with one of `capacity` slots. Returns the number of
    /// resident messages that did not fit and were dropped.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let capacity = capacity.max(1);
        let mut buffer = self.buffer.write();
        let next = Buffer::new(capacity, buffer.generation + 1);
        let old = std::mem::replace(&mut *buffer, next);
        let mut dropped = 0;
        while let Ok(message) = old.rx.try_recv() {
            if buffer.tx.try_send(message).is_err() {
                dropped += 1;
            }
        }
        // Producers still blocked on the old buffer see it disconnect and retry.
        drop(old);
        if dropped > 0 {
            tracing::warn!("Queue resized to {capacity}, dropped {dropped} pending messages");
        } else {
            tracing::debug!("Queue resized to {capacity}");
        }
        dropped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
