//! Dynamic-invocation plugin contract.
//!
//! A plugin ("factory") is looked up by name and exposes string-keyed
//! functions taking and returning JSON values. Method names on the wire
//! are `factory.function`.

use crate::error::JsonRpcError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Failures reported by a plugin function.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The function name is unknown to the plugin.
    #[error("function '{0}' not implemented")]
    NotImplemented(String),
    /// A positional argument was requested beyond the end of `params`.
    #[error("argument index {0} out of bounds")]
    OutOfBounds(usize),
    /// An argument has the wrong JSON type.
    #[error("argument {index} is not {expected}")]
    TypeMismatch { index: usize, expected: &'static str },
    /// The plugin chose an explicit JSON-RPC error.
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),
    #[error("{0}")]
    Other(String),
}

/// A named object whose functions can be invoked dynamically.
pub trait DynInvoke: Send + Sync {
    fn invoke(&self, function: &str, params: &Value) -> Result<Value, InvokeError>;
}

/// Why a factory could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("module not loaded")]
    NotFound,
    #[error("failed to instantiate module")]
    NoInstance,
}

/// Lookup of plugin instances by factory name.
pub trait PluginRegistry: Send + Sync {
    fn lookup(&self, factory: &str) -> Result<Arc<dyn DynInvoke>, LookupError>;
}

/// In-process plugin registry.
#[derive(Default)]
pub struct Plugins {
    factories: RwLock<HashMap<String, Arc<dyn DynInvoke>>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance` under `name`, replacing any previous one.
    pub fn register(&self, name: &str, instance: Arc<dyn DynInvoke>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), instance);
        debug!(factory = name, "Registered plugin");
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}

impl PluginRegistry for Plugins {
    fn lookup(&self, factory: &str) -> Result<Arc<dyn DynInvoke>, LookupError> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(factory)
            .cloned()
            .ok_or(LookupError::NotFound)
    }
}

/// Positional access to `params` for plugin implementations.
///
/// Array params are indexed directly; any other value is treated as a
/// one-element argument list so `f(x)` and `f([x])` behave alike.
pub struct Args<'a> {
    params: &'a Value,
}

impl<'a> Args<'a> {
    pub fn new(params: &'a Value) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        match self.params {
            Value::Array(items) => items.len(),
            Value::Null => 0,
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<&'a Value, InvokeError> {
        match self.params {
            Value::Array(items) => items.get(index).ok_or(InvokeError::OutOfBounds(index)),
            Value::Null => Err(InvokeError::OutOfBounds(index)),
            other if index == 0 => Ok(other),
            _ => Err(InvokeError::OutOfBounds(index)),
        }
    }

    /// Like `get`, but `None` when the argument is absent.
    pub fn opt(&self, index: usize) -> Option<&'a Value> {
        self.get(index).ok()
    }

    pub fn str(&self, index: usize) -> Result<&'a str, InvokeError> {
        self.get(index)?.as_str().ok_or(InvokeError::TypeMismatch {
            index,
            expected: "a string",
        })
    }

    pub fn int(&self, index: usize) -> Result<i64, InvokeError> {
        self.get(index)?.as_i64().ok_or(InvokeError::TypeMismatch {
            index,
            expected: "an integer",
        })
    }

    /// A structured argument: array or object.
    pub fn structured(&self, index: usize) -> Result<&'a Value, InvokeError> {
        match self.get(index)? {
            v @ (Value::Array(_) | Value::Object(_)) => Ok(v),
            _ => Err(InvokeError::TypeMismatch {
                index,
                expected: "an array or object",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl DynInvoke for Echo {
        fn invoke(&self, function: &str, params: &Value) -> Result<Value, InvokeError> {
            match function {
                "echo" => Ok(params.clone()),
                other => Err(InvokeError::NotImplemented(other.to_string())),
            }
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let plugins = Plugins::new();
        assert_eq!(plugins.lookup("echo").err(), Some(LookupError::NotFound));

        plugins.register("echo", Arc::new(Echo));
        let echo = plugins.lookup("echo").unwrap();
        assert_eq!(echo.invoke("echo", &json!([1])).unwrap(), json!([1]));

        assert!(plugins.unregister("echo"));
        assert!(plugins.lookup("echo").is_err());
    }

    #[test]
    fn test_args_access() {
        let params = json!(["a", 2, {"k": true}]);
        let args = Args::new(&params);
        assert_eq!(args.len(), 3);
        assert_eq!(args.str(0).unwrap(), "a");
        assert_eq!(args.int(1).unwrap(), 2);
        assert!(args.structured(2).is_ok());
        assert!(matches!(args.get(3), Err(InvokeError::OutOfBounds(3))));
        assert!(matches!(
            args.int(0),
            Err(InvokeError::TypeMismatch { index: 0, .. })
        ));
        assert!(args.opt(5).is_none());
    }

    #[test]
    fn test_args_scalar_and_null() {
        let scalar = json!(4);
        assert_eq!(Args::new(&scalar).int(0).unwrap(), 4);
        assert!(Args::new(&scalar).get(1).is_err());

        let null = Value::Null;
        assert!(Args::new(&null).is_empty());
        assert!(matches!(Args::new(&null).get(0), Err(InvokeError::OutOfBounds(0))));
    }
}
