//! JSON-RPC 2.0 message parsing and construction.

use crate::error::{JsonRpcError, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

pub const JSONRPC_VERSION: &str = "2.0";

/// Id of an inbound request. Replies echo it with the same JSON type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Request (`id` present) or notification (`id` absent).
    Call {
        method: String,
        params: Value,
        id: Option<RequestId>,
    },
    /// Reply to a request this side sent.
    Reply {
        id: String,
        /// `Ok(result)` or `Err(error)`.
        outcome: Result<Value, Value>,
    },
}

/// Parse a frame payload into a message.
pub fn parse(payload: &[u8]) -> Result<Incoming, ProtocolError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(mut obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(ProtocolError::WrongVersion);
    }

    if let Some(Value::String(method)) = obj.remove("method") {
        let params = obj.remove("params").unwrap_or(Value::Null);
        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(RequestId::String(s)),
            Some(Value::Number(n)) if n.is_i64() => n.as_i64().map(RequestId::Number),
            Some(other) => {
                warn!(id = %other, "Incorrect type for json-rpc id, treating as notification");
                None
            }
        };
        return Ok(Incoming::Call { method, params, id });
    }

    let id = match obj.remove("id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(ProtocolError::MissingReplyId),
    };
    let outcome = match (obj.remove("result"), obj.remove("error")) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(error),
        (None, None) => return Err(ProtocolError::NoResultOrError(id)),
    };
    Ok(Incoming::Reply { id, outcome })
}

fn is_null(value: &&Value) -> bool {
    value.is_null()
}

#[derive(Serialize)]
struct RequestFrame<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

#[derive(Serialize)]
struct ReplyFrame<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a Value>,
}

/// Serialize an outbound request, or a notification when `id` is `None`.
pub fn request(method: &str, params: &Value, id: Option<&str>) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&RequestFrame {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
        id,
    })
}

/// Serialize a successful reply.
pub fn reply(id: &RequestId, result: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&ReplyFrame {
        jsonrpc: JSONRPC_VERSION,
        id,
        result: Some(result),
        error: None,
    })
}

/// Serialize an error reply carrying an arbitrary error value.
pub fn error_reply(id: &RequestId, error: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&ReplyFrame {
        jsonrpc: JSONRPC_VERSION,
        id,
        result: None,
        error: Some(error),
    })
}

/// The reply object for a dispatcher outcome, as a JSON value.
pub fn reply_value(id: &RequestId, outcome: &Result<Value, JsonRpcError>) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
    obj.insert(
        "id".into(),
        serde_json::to_value(id).unwrap_or(Value::Null),
    );
    match outcome {
        Ok(result) => {
            obj.insert("result".into(), result.clone());
        }
        Err(e) => {
            obj.insert(
                "error".into(),
                serde_json::to_value(e).unwrap_or(Value::Null),
            );
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let msg = parse(br#"{"jsonrpc":"2.0","method":"core.get_loglevel","id":"1"}"#).unwrap();
        assert_eq!(
            msg,
            Incoming::Call {
                method: "core.get_loglevel".into(),
                params: Value::Null,
                id: Some(RequestId::from("1")),
            }
        );
    }

    #[test]
    fn test_parse_integer_id_and_notification() {
        let msg = parse(br#"{"jsonrpc":"2.0","method":"a.b","params":[1],"id":7}"#).unwrap();
        assert!(matches!(msg, Incoming::Call { id: Some(RequestId::Number(7)), .. }));

        let msg = parse(br#"{"jsonrpc":"2.0","method":"a.b","params":{"x":1}}"#).unwrap();
        assert!(matches!(msg, Incoming::Call { id: None, .. }));

        // Unsupported id types degrade to a notification.
        let msg = parse(br#"{"jsonrpc":"2.0","method":"a.b","id":[1]}"#).unwrap();
        assert!(matches!(msg, Incoming::Call { id: None, .. }));
    }

    #[test]
    fn test_parse_replies() {
        let msg = parse(br#"{"jsonrpc":"2.0","id":"3","result":null}"#).unwrap();
        assert_eq!(
            msg,
            Incoming::Reply {
                id: "3".into(),
                outcome: Ok(Value::Null)
            }
        );

        let msg = parse(br#"{"jsonrpc":"2.0","id":"4","error":{"code":1}}"#).unwrap();
        assert_eq!(
            msg,
            Incoming::Reply {
                id: "4".into(),
                outcome: Err(json!({"code": 1}))
            }
        );
    }

    #[test]
    fn test_parse_violations() {
        assert!(matches!(parse(b"{nope"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse(b"[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            parse(br#"{"jsonrpc":"1.0","method":"a.b"}"#),
            Err(ProtocolError::WrongVersion)
        ));
        assert!(matches!(
            parse(br#"{"method":"a.b"}"#),
            Err(ProtocolError::WrongVersion)
        ));
        assert!(matches!(
            parse(br#"{"jsonrpc":"2.0","result":1}"#),
            Err(ProtocolError::MissingReplyId)
        ));
        assert!(matches!(
            parse(br#"{"jsonrpc":"2.0","id":"","result":1}"#),
            Err(ProtocolError::MissingReplyId)
        ));
        assert!(matches!(
            parse(br#"{"jsonrpc":"2.0","id":"9"}"#),
            Err(ProtocolError::NoResultOrError(_))
        ));
    }

    #[test]
    fn test_build_request_and_notification() {
        let req = request("app.ping", &json!([1]), Some("12")).unwrap();
        assert_eq!(
            String::from_utf8(req).unwrap(),
            r#"{"jsonrpc":"2.0","method":"app.ping","params":[1],"id":"12"}"#
        );

        let note = request("app.tick", &Value::Null, None).unwrap();
        assert_eq!(
            String::from_utf8(note).unwrap(),
            r#"{"jsonrpc":"2.0","method":"app.tick"}"#
        );
    }

    #[test]
    fn test_build_replies() {
        let ok = reply(&RequestId::from("1"), &json!([2])).unwrap();
        assert_eq!(
            String::from_utf8(ok).unwrap(),
            r#"{"jsonrpc":"2.0","id":"1","result":[2]}"#
        );

        let err = error_reply(&RequestId::Number(5), &json!({"code": -32601})).unwrap();
        assert_eq!(
            String::from_utf8(err).unwrap(),
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601}}"#
        );
    }

    #[test]
    fn test_reply_value() {
        let outcome = Err(JsonRpcError::method_not_found("module not loaded"));
        assert_eq!(
            reply_value(&RequestId::from("x"), &outcome),
            json!({
                "jsonrpc": "2.0",
                "id": "x",
                "error": {"code": -32601, "message": "Method not found", "data": "module not loaded"}
            })
        );
    }
}
