//! Resolution and invocation of `factory.function` methods.
//!
//! `core.*` is served in-process; every other factory is looked up in the
//! plugin registry. All failures become JSON-RPC error objects and never
//! close the connection.

use crate::error::JsonRpcError;
use crate::logging::LogLevel;
use crate::rpc::plugin::{Args, InvokeError, LookupError, PluginRegistry};
use crate::runtime::ConnectionRegistry;
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Reserved factory name for built-in methods.
pub const CORE_FACTORY: &str = "core";

pub struct Dispatcher {
    plugins: Arc<dyn PluginRegistry>,
    log_level: Arc<LogLevel>,
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(
        plugins: Arc<dyn PluginRegistry>,
        log_level: Arc<LogLevel>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            plugins,
            log_level,
            registry,
        }
    }

    /// Run `method` with `params` and return its result.
    pub fn execute(&self, method: &str, params: &Value) -> Result<Value, JsonRpcError> {
        let Some((factory, function)) = method.split_once('.') else {
            return Err(JsonRpcError::method_not_found(
                "use module.method as rpc method name",
            ));
        };

        if factory == CORE_FACTORY {
            return self.run_core(function, params).map_err(into_rpc_error);
        }

        debug!(factory, function, "Searching for factory");
        let instance = self.plugins.lookup(factory).map_err(|e| match e {
            LookupError::NotFound => JsonRpcError::method_not_found("module not loaded"),
            LookupError::NoInstance => {
                JsonRpcError::method_not_found("failed to instantiate module")
            }
        })?;

        match panic::catch_unwind(AssertUnwindSafe(|| instance.invoke(function, params))) {
            Ok(result) => result.map_err(into_rpc_error),
            Err(_) => {
                error!(method, "Unexpected panic in RPC call");
                Err(JsonRpcError::server_error("unexpected exception"))
            }
        }
    }

    fn run_core(&self, function: &str, params: &Value) -> Result<Value, InvokeError> {
        match function {
            "get_loglevel" => Ok(json!([self.log_level.get()])),
            "set_loglevel" => {
                let level = Args::new(params).int(0)?;
                self.log_level.set(level).map_err(|e| {
                    InvokeError::Rpc(JsonRpcError::invalid_params(&e.to_string()))
                })?;
                Ok(Value::Null)
            }
            // `calls` is the older name of the same counter.
            "connections" | "calls" => Ok(json!([self.registry.len()])),
            _ => Err(InvokeError::Rpc(JsonRpcError::method_not_found(
                "function unknown in core",
            ))),
        }
    }
}

fn into_rpc_error(err: InvokeError) -> JsonRpcError {
    match err {
        InvokeError::NotImplemented(function) => {
            info!(function = %function, "Not implemented DI function");
            JsonRpcError::method_not_found("function unknown in module")
        }
        InvokeError::OutOfBounds(index) => {
            info!(index, "Out of bounds in RPC DI call");
            JsonRpcError::invalid_params("out of bounds in function call")
        }
        InvokeError::TypeMismatch { index, expected } => {
            info!(index, expected, "Type mismatch in RPC DI call");
            JsonRpcError::invalid_params("parameters type mismatch in function call")
        }
        InvokeError::Rpc(e) => e,
        InvokeError::Other(reason) => {
            error!(reason = %reason, "Unexpected failure in RPC DI call");
            JsonRpcError::server_error("unexpected exception")
        }
    }
}
