//! Error types shared across the runtime and the RPC layer.

use crate::runtime::ConnectionId;
use serde::Serialize;
use serde_json::Value;
use std::io;
use thiserror::Error;

/// JSON-RPC error codes used by this server.
pub mod codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const SERVER_ERROR: i64 = -32000;
}

/// A JSON-RPC error object, serialized as the `error` member of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn method_not_found(data: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found", data)
    }

    pub fn invalid_params(data: &str) -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params", data)
    }

    pub fn server_error(data: &str) -> Self {
        Self::new(codes::SERVER_ERROR, "Server error", data)
    }
}

/// A decoded frame that violates the JSON-RPC message rules.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("wrong json-rpc version received; only 2.0 supported")]
    WrongVersion,
    #[error("reply without a usable id")]
    MissingReplyId,
    #[error("reply {0} has neither result nor error")]
    NoResultOrError(String),
    #[error("reply for unknown request id {0}")]
    UnknownReplyId(String),
    #[error("reply sink queue '{0}' does not exist")]
    NoReplyLink(String),
    #[error("request receiver queue '{0}' does not exist")]
    NoRequestReceiver(String),
    #[error("notification receiver queue '{0}' does not exist")]
    NoNotificationReceiver(String),
    #[error("message of {0} bytes exceeds the maximum message size")]
    TooLarge(usize),
}

/// Connection registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
    #[error("connection limit of {0} reached")]
    Full(usize),
}

/// Outbound connection failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("resolving '{host}' failed: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("resolving '{0}' returned no addresses")]
    NoAddress(String),
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("error connecting to {host}: {source}")]
    Connect { host: String, source: io::Error },
    #[error("connect to {0} timed out")]
    TimedOut(String),
    #[error("message of {0} bytes exceeds the maximum message size")]
    TooLarge(usize),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("server is shutting down")]
    Stopped,
}

/// Failures of the `send_message` entry point.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection {0} not found")]
    UnknownConnection(ConnectionId),
    #[error("message of {0} bytes exceeds the maximum message size")]
    TooLarge(usize),
    #[error("server is shutting down")]
    Stopped,
}
