//! Sends waiting for a worker-owned connection to come back.
//!
//! Owned by the reactor thread. Each connection has a FIFO so that
//! back-to-back sends leave in the order they were issued; each queued
//! message is taken exactly once.

use crate::runtime::connection::ConnectionId;
use crate::runtime::event::OutboundMessage;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct PendingSends {
    queues: HashMap<ConnectionId, VecDeque<OutboundMessage>>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` behind any others for `id`.
    pub fn push(&mut self, id: ConnectionId, message: OutboundMessage) {
        self.queues.entry(id).or_default().push_back(message);
    }

    /// Remove and return the oldest message for `id`.
    pub fn take_next(&mut self, id: ConnectionId) -> Option<OutboundMessage> {
        let queue = self.queues.get_mut(&id)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&id);
        }
        message
    }

    /// Drop everything queued for `id`, returning it.
    pub fn purge(&mut self, id: ConnectionId) -> Vec<OutboundMessage> {
        self.queues
            .remove(&id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Take everything still queued, per connection.
    pub fn drain(&mut self) -> HashMap<ConnectionId, Vec<OutboundMessage>> {
        self.queues
            .drain()
            .map(|(id, queue)| (id, Vec::from(queue)))
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Total queued messages across all connections.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
