//! Named-queue delivery of RPC traffic to application code.
//!
//! The server never calls application code directly: correlated replies,
//! forwarded requests and disconnect notices are posted by name to an
//! `EventSink`. `QueueHub` is an in-process sink backed by channels.

use crate::rpc::message::RequestId;
use crate::runtime::ConnectionId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// Events delivered to named application queues.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    /// Reply to a request sent on `connection_id`.
    Response {
        connection_id: ConnectionId,
        id: String,
        is_error: bool,
        /// The `result` or `error` member of the reply.
        data: Value,
        /// Opaque value supplied when the request was sent.
        user_data: Value,
    },
    /// Inbound request (with `id`) or notification (without) forwarded
    /// to a configured receiver instead of the method dispatcher.
    Request {
        connection_id: ConnectionId,
        method: String,
        id: Option<RequestId>,
        params: Value,
    },
    /// The connection is gone; no reply will arrive on it.
    Disconnect { connection_id: ConnectionId },
}

/// Named-queue dispatch facility.
pub trait EventSink: Send + Sync {
    /// Deliver `event` to `queue`. Returns false if no such queue exists.
    fn post(&self, queue: &str, event: RpcEvent) -> bool;
}

/// Channel-backed queues keyed by name.
#[derive(Default)]
pub struct QueueHub {
    queues: Mutex<HashMap<String, Sender<RpcEvent>>>,
}

impl QueueHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the queue `name` and return its receiving end.
    pub fn register(&self, name: &str) -> Receiver<RpcEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().insert(name.to_string(), tx);
        debug!(queue = name, "Registered event queue");
        rx
    }

    /// Remove the queue `name`. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Sender<RpcEvent>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for QueueHub {
    fn post(&self, queue: &str, event: RpcEvent) -> bool {
        let mut queues = self.lock();
        let Some(tx) = queues.get(queue) else {
            trace!(queue, "No such event queue");
            return false;
        };
        if tx.send(event).is_ok() {
            return true;
        }
        // Receiver dropped: the queue is gone for good.
        queues.remove(queue);
        debug!(queue, "Event queue receiver dropped");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnect(id: u64) -> RpcEvent {
        RpcEvent::Disconnect {
            connection_id: ConnectionId::from(id),
        }
    }

    #[test]
    fn test_post_to_registered_queue() {
        let hub = QueueHub::new();
        let rx = hub.register("app");

        assert!(hub.post("app", disconnect(1)));
        assert_eq!(rx.try_recv().unwrap(), disconnect(1));
    }

    #[test]
    fn test_post_to_missing_queue() {
        let hub = QueueHub::new();
        assert!(!hub.post("nobody", disconnect(1)));
    }

    #[test]
    fn test_dropped_receiver_removes_queue() {
        let hub = QueueHub::new();
        drop(hub.register("gone"));

        assert!(!hub.post("gone", disconnect(2)));
        assert!(!hub.contains("gone"));
    }

    #[test]
    fn test_unregister() {
        let hub = QueueHub::new();
        let _rx = hub.register("app");
        assert!(hub.unregister("app"));
        assert!(!hub.unregister("app"));
    }
}
