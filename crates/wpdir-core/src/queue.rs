//! FIFO of pending search ids with queue positions.
//!
//! Positions are 1-based: the id at the head of the queue is at position 1
//! and every `get` moves the remaining ids up by one. Each id gets a ticket
//! when it is added; its position is its ticket minus the number of ids
//! already served, so a `get` shifts every position without touching them.

use crate::error::{Result, WpdirError};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct Positions {
    tickets: HashMap<String, u64>,
    next_ticket: u64,
    served: u64,
}

pub struct SearchQueue {
    tx: Sender<String>,
    rx: Receiver<String>,
    /// Serialises producers so ticket order matches channel order
    producer: Mutex<()>,
    positions: Mutex<Positions>,
}

impl SearchQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        SearchQueue {
            tx,
            rx,
            producer: Mutex::new(()),
            positions: Mutex::new(Positions::default()),
        }
    }

    /// Push an id, blocking while the queue is full.
    pub fn add(&self, id: &str) -> Result<()> {
        let _producer = self.producer.lock();
        let ticket = {
            let mut positions = self.positions.lock();
            let ticket = positions.next_ticket;
            positions.next_ticket += 1;
            positions.tickets.insert(id.to_string(), ticket);
            ticket
        };
        if self.tx.send(id.to_string()).is_err() {
            let mut positions = self.positions.lock();
            positions.tickets.remove(id);
            if positions.next_ticket == ticket + 1 {
                positions.next_ticket = ticket;
            }
            return Err(WpdirError::ShuttingDown);
        }
        Ok(())
    }

    /// Pop the next id, blocking until one is available.
    pub fn get(&self) -> Option<String> {
        let id = self.rx.recv().ok()?;
        self.served(&id);
        Some(id)
    }

    /// Pop the next id, waiting at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(id) => {
                self.served(&id);
                Some(id)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pop the next id if one is queued, without blocking.
    pub fn try_get(&self) -> Option<String> {
        let id = self.rx.try_recv().ok()?;
        self.served(&id);
        Some(id)
    }

    /// Pop the next id, or `None` once `shutdown` fires or disconnects.
    pub fn get_until(&self, shutdown: &Receiver<()>) -> Option<String> {
        select! {
            recv(shutdown) -> _ => None,
            recv(self.rx) -> msg => {
                let id = msg.ok()?;
                self.served(&id);
                Some(id)
            }
        }
    }

    /// 1-based position of `id`, or -1 if it is not queued.
    pub fn pos(&self, id: &str) -> i64 {
        let positions = self.positions.lock();
        match positions.tickets.get(id) {
            Some(ticket) => (ticket - positions.served + 1) as i64,
            None => -1,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.lock().tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn served(&self, id: &str) {
        let mut positions = self.positions.lock();
        if let Some(ticket) = positions.tickets.remove(id) {
            positions.served = ticket + 1;
        }
    }
}

impl std::fmt::Debug for SearchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchQueue").field("len", &self.len()).finish()
    }
}
