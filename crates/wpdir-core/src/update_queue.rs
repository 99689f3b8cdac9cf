//! Bounded FIFO of pending package updates.
//!
//! One instance is shared by both corpora, their pollers and the worker
//! pool. Producers block while the queue is full; nothing is ever dropped.

use crate::error::{Result, WpdirError};
use crate::types::UpdateRequest;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a blocked producer re-checks for shutdown
const PUSH_POLL: Duration = Duration::from_millis(100);

pub struct UpdateQueue {
    tx: Sender<UpdateRequest>,
    rx: Receiver<UpdateRequest>,
    capacity: usize,
    closed: AtomicBool,
}

impl UpdateQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        UpdateQueue {
            tx,
            rx,
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a request, blocking while the queue is full.
    ///
    /// Fails only once the queue has been closed.
    pub fn push(&self, request: UpdateRequest) -> Result<()> {
        let mut request = request;
        loop {
            if self.is_closed() {
                return Err(WpdirError::QueueClosed);
            }
            match self.tx.send_timeout(request, PUSH_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(r)) => request = r,
                Err(SendTimeoutError::Disconnected(_)) => return Err(WpdirError::QueueClosed),
            }
        }
    }

    /// Next request, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<UpdateRequest> {
        match self.rx.recv_timeout(timeout) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<UpdateRequest> {
        self.rx.try_recv().ok()
    }

    /// Receiving end, for `select!` loops.
    pub fn receiver(&self) -> &Receiver<UpdateRequest> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting new requests. Queued ones can still be received.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
