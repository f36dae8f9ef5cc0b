//! Transport runtime: framing, connections, the reactor and the workers.
//!
//! Threads and what they own:
//! - Reactor (one thread): the listener, idle connections, pending sends
//! - Workers (N threads): the connection currently being processed
//!
//! A connection moves between them by value inside `ServerEvent` and
//! `WorkerEvent`; the `ConnectionRegistry` only records who holds it.

pub mod client;
pub mod connection;
pub mod event;
pub mod netstring;
pub mod pending;
pub mod reactor;
pub mod registry;
pub mod worker;

pub use client::{Resolver, SystemResolver};
pub use connection::{Connection, ConnectionId, Direction};
pub use event::{MessageKind, OutboundMessage, ServerEvent, WorkerEvent};
pub use reactor::{Reactor, ReactorHandle, ReactorSettings};
pub use registry::{ConnectionHandle, ConnectionRegistry, Owner};
pub use worker::{WorkerContext, WorkerPool};
