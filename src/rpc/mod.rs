//! JSON-RPC 2.0 layer on top of the netstring transport.

pub mod dispatcher;
pub mod handler;
pub mod message;
pub mod module;
pub mod peer;
pub mod plugin;
pub mod queue;

pub use dispatcher::Dispatcher;
pub use message::RequestId;
pub use peer::{CloseFlags, CloseFlagsConfig};
pub use plugin::{Args, DynInvoke, InvokeError, PluginRegistry, Plugins};
pub use queue::{EventSink, QueueHub, RpcEvent};
