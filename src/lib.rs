//! nsrpc: netstring-framed JSON-RPC 2.0 server and client.
//!
//! Messages travel as netstrings (`LEN:PAYLOAD,`) whose payload is a
//! JSON-RPC 2.0 object. One reactor thread watches idle connections and
//! a pool of workers processes complete frames. A connection is owned by
//! exactly one of them at any time and moves between them by value.
//!
//! Calls named `factory.function` are resolved through a
//! [`rpc::PluginRegistry`]; replies to outbound requests, forwarded calls
//! and disconnect notices are delivered to named queues through an
//! [`rpc::EventSink`].

pub mod config;
pub mod error;
pub mod logging;
pub mod rpc;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::JsonRpcError;
pub use server::{ExecRpc, Server, ServerBuilder, WeakServer};
