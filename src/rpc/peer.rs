//! Per-connection JSON-RPC state: outbound id counter, reply correlation
//! table, direct receivers and close flags.

use crate::rpc::queue::{EventSink, RpcEvent};
use crate::runtime::ConnectionId;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Conditions under which a connection is closed rather than kept open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CloseFlags(u32);

impl CloseFlags {
    /// Close after each processed inbound message.
    pub const CLOSE_ALWAYS: Self = Self(1);
    /// Close when a reply carries an id with no outstanding request.
    pub const CLOSE_WRONG_REPLY: Self = Self(2);
    /// Close when a reply's sink queue no longer exists.
    pub const CLOSE_NO_REPLY_LINK: Self = Self(4);
    /// Close when the request receiver queue is missing.
    pub const CLOSE_NO_REQUEST_RECEIVER: Self = Self(8);
    /// Close when the notification receiver queue is missing.
    pub const CLOSE_NO_NOTIFICATION_RECEIVER: Self = Self(16);

    const ALL: u32 = 31;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from wire bits; unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for CloseFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Close flags as written in a configuration file.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct CloseFlagsConfig {
    pub close_always: bool,
    pub close_on_wrong_reply: bool,
    pub close_on_missing_reply_link: bool,
    pub close_on_missing_request_receiver: bool,
    pub close_on_missing_notification_receiver: bool,
}

impl From<CloseFlagsConfig> for CloseFlags {
    fn from(cfg: CloseFlagsConfig) -> Self {
        [
            (cfg.close_always, Self::CLOSE_ALWAYS),
            (cfg.close_on_wrong_reply, Self::CLOSE_WRONG_REPLY),
            (cfg.close_on_missing_reply_link, Self::CLOSE_NO_REPLY_LINK),
            (cfg.close_on_missing_request_receiver, Self::CLOSE_NO_REQUEST_RECEIVER),
            (
                cfg.close_on_missing_notification_receiver,
                Self::CLOSE_NO_NOTIFICATION_RECEIVER,
            ),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(Self::empty(), |acc, (_, flag)| acc | flag)
    }
}

/// Where the reply to an outbound request goes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySink {
    pub queue: String,
    pub user_data: Value,
}

/// JSON-RPC state for one connection.
#[derive(Debug, Default)]
pub struct Peer {
    next_request_id: u64,
    reply_receivers: HashMap<String, ReplySink>,
    /// Queue receiving inbound notifications instead of the dispatcher.
    pub notification_receiver: Option<String>,
    /// Queue receiving inbound requests instead of the dispatcher.
    pub request_receiver: Option<String>,
    pub flags: CloseFlags,
    /// Queues already told that this connection is gone.
    notified: BTreeSet<String>,
}

impl Peer {
    pub fn new(flags: CloseFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Allocate the next outbound request id.
    pub fn next_request_id(&mut self) -> String {
        self.next_request_id += 1;
        self.next_request_id.to_string()
    }

    /// The id most recently handed out by `next_request_id`.
    pub fn last_request_id(&self) -> String {
        self.next_request_id.to_string()
    }

    /// Route the reply to request `id` to `queue`.
    pub fn expect_reply(&mut self, id: String, queue: String, user_data: Value) {
        debug!(queue = %queue, id = %id, "Registering reply sink");
        self.reply_receivers.insert(id, ReplySink { queue, user_data });
    }

    /// Remove and return the sink for reply `id`.
    pub fn take_reply_sink(&mut self, id: &str) -> Option<ReplySink> {
        self.reply_receivers.remove(id)
    }

    pub fn outstanding_replies(&self) -> usize {
        self.reply_receivers.len()
    }

    /// Tell every reply sink and direct receiver that `conn_id` is gone,
    /// together with the `extra` queues of requests that were never sent.
    ///
    /// A queue receives at most one `Disconnect` per connection, however
    /// often this is called.
    pub fn notify_disconnect<I>(&mut self, conn_id: ConnectionId, sink: &dyn EventSink, extra: I)
    where
        I: IntoIterator<Item = String>,
    {
        let queues: BTreeSet<String> = self
            .notification_receiver
            .iter()
            .chain(self.request_receiver.iter())
            .cloned()
            .chain(self.reply_receivers.drain().map(|(_, s)| s.queue))
            .chain(extra)
            .filter(|queue| !self.notified.contains(queue))
            .collect();
        if queues.is_empty() {
            return;
        }

        debug!(conn_id = %conn_id, receivers = queues.len(), "Notifying receivers about broken connection");
        for queue in &queues {
            sink.post(
                queue,
                RpcEvent::Disconnect {
                    connection_id: conn_id,
                },
            );
        }
        self.notified.extend(queues);
    }

    /// Queues notified by `notify_disconnect` so far.
    pub fn notified(&self) -> &BTreeSet<String> {
        &self.notified
    }
}
