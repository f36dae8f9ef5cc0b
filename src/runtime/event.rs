//! Events exchanged between the reactor, the workers and API callers.
//!
//! A `Connection` is only ever reachable through one of these values
//! (or the reactor's idle table), which is what makes a handoff explicit.

use crate::rpc::message::RequestId;
use crate::runtime::connection::{Connection, ConnectionId};
use serde_json::Value;
use std::collections::BTreeSet;

/// Kinds of message that can be originated through `send_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
    Error,
    Notification,
}

impl MessageKind {
    /// Wire code used by the `jsonrpc.sendMessage` DI function.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Request),
            1 => Some(Self::Reply),
            2 => Some(Self::Error),
            3 => Some(Self::Notification),
            _ => None,
        }
    }
}

/// A message to be framed and written on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Request whose reply, if `reply_sink` is set, is posted there.
    Request {
        method: String,
        params: Value,
        reply_sink: Option<String>,
        user_data: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Reply {
        id: RequestId,
        result: Value,
    },
    Error {
        id: RequestId,
        error: Value,
    },
}

impl OutboundMessage {
    /// Build from the flat argument list of the external interface.
    pub fn from_parts(
        kind: MessageKind,
        method: &str,
        id: &str,
        reply_sink: &str,
        params: Value,
        user_data: Value,
    ) -> Self {
        match kind {
            MessageKind::Request => OutboundMessage::Request {
                method: method.to_string(),
                params,
                reply_sink: (!reply_sink.is_empty()).then(|| reply_sink.to_string()),
                user_data,
            },
            MessageKind::Notification => OutboundMessage::Notification {
                method: method.to_string(),
                params,
            },
            MessageKind::Reply => OutboundMessage::Reply {
                id: RequestId::from(id),
                result: params,
            },
            MessageKind::Error => OutboundMessage::Error {
                id: RequestId::from(id),
                error: params,
            },
        }
    }

    /// Queue awaiting a reply to this message, if any.
    pub fn reply_sink(&self) -> Option<&str> {
        match self {
            OutboundMessage::Request { reply_sink, .. } => reply_sink.as_deref(),
            _ => None,
        }
    }

    /// Rough size of the JSON body, used to reject oversize sends early.
    pub fn approximate_len(&self) -> usize {
        let body = match self {
            OutboundMessage::Request {
                method, params, ..
            }
            | OutboundMessage::Notification { method, params } => {
                method.len() + params.to_string().len()
            }
            OutboundMessage::Reply { result: v, .. } | OutboundMessage::Error { error: v, .. } => {
                v.to_string().len()
            }
        };
        body + 64
    }
}

/// Events processed on the reactor thread.
#[derive(Debug)]
pub enum ServerEvent {
    /// A worker hands a connection back. Before re-arming the read
    /// watcher the reactor dispatches any pending send for it.
    StartReadLoop(Box<Connection>),
    /// Send `message` on connection `id`, wherever it currently is.
    SendMessage(ConnectionId, OutboundMessage),
    /// The application removed `id` from the registry. Close it as soon
    /// as the reactor holds it.
    Remove(ConnectionId),
    /// A worker closed `id` after notifying `notified`. Sends still parked
    /// for it are dropped and only the other sinks are told.
    Closed {
        id: ConnectionId,
        notified: BTreeSet<String>,
    },
    /// Stop the event loop.
    Shutdown,
}

/// Events processed on a worker thread.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A complete inbound frame is buffered on the connection.
    Process(Box<Connection>),
    /// Frame and write `message` on the connection.
    Send(Box<Connection>, OutboundMessage),
    /// First request on a new outbound connection. The connection is
    /// closed if the request cannot be sent.
    Open(Box<Connection>, OutboundMessage),
    /// Exit the worker loop.
    Shutdown,
}
