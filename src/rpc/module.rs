//! The server's own plugin, registered as factory `jsonrpc`.
//!
//! Functions (positional params):
//! - `execRpc(reply_sink, notification_receiver, request_receiver, flags,
//!   host, port, method[, params[, user_data]])` -> `[200, "OK", conn_id]`
//! - `sendMessage(conn_id, kind, method, id, reply_sink[, params[,
//!   user_data]])` -> `[200, "OK"]`
//! - `execServerFunction(method, id[, params])` -> the reply object
//! - `getServerPort()` -> `[port]`
//! - `_list()` -> function names
//!
//! Operational failures are reported as `[400, reason]` rather than as
//! JSON-RPC errors; malformed arguments are invalid params.

use crate::rpc::message::{self, RequestId};
use crate::rpc::peer::CloseFlags;
use crate::rpc::plugin::{Args, DynInvoke, InvokeError};
use crate::runtime::event::{MessageKind, OutboundMessage};
use crate::runtime::ConnectionId;
use crate::server::{ExecRpc, Server, WeakServer};
use serde_json::{json, Value};

/// Factory name under which the module is usually registered.
pub const FACTORY_NAME: &str = "jsonrpc";

const FUNCTIONS: [&str; 5] = [
    "execRpc",
    "sendMessage",
    "getServerPort",
    "execServerFunction",
    "_list",
];

pub struct RpcModule {
    server: WeakServer,
}

impl RpcModule {
    pub fn new(server: WeakServer) -> Self {
        Self { server }
    }

    fn server(&self) -> Result<Server, InvokeError> {
        self.server
            .upgrade()
            .ok_or_else(|| InvokeError::Other("server is not running".to_string()))
    }
}

fn failed(reason: impl std::fmt::Display) -> Value {
    json!([400, reason.to_string()])
}

/// Optional queue name; empty strings mean "none".
fn queue(args: &Args<'_>, index: usize) -> Result<Option<String>, InvokeError> {
    let name = args.str(index)?;
    Ok((!name.is_empty()).then(|| name.to_string()))
}

/// Optional trailing params, which must be an array or an object.
fn trailing_params(args: &Args<'_>, index: usize) -> Result<Value, InvokeError> {
    if args.len() > index {
        Ok(args.structured(index)?.clone())
    } else {
        Ok(Value::Null)
    }
}

fn trailing(args: &Args<'_>, index: usize) -> Value {
    args.opt(index).cloned().unwrap_or(Value::Null)
}

impl DynInvoke for RpcModule {
    fn invoke(&self, function: &str, params: &Value) -> Result<Value, InvokeError> {
        let args = Args::new(params);
        match function {
            "execRpc" => {
                let port = args.int(5)?;
                let port = u16::try_from(port).map_err(|_| InvokeError::TypeMismatch {
                    index: 5,
                    expected: "a port number",
                })?;
                let flags = u32::try_from(args.int(3)?).map_err(|_| InvokeError::TypeMismatch {
                    index: 3,
                    expected: "a flag set",
                })?;
                let call = ExecRpc {
                    reply_sink: queue(&args, 0)?,
                    notification_receiver: queue(&args, 1)?,
                    request_receiver: queue(&args, 2)?,
                    flags: CloseFlags::from_bits_truncate(flags),
                    host: args.str(4)?.to_string(),
                    port,
                    method: args.str(6)?.to_string(),
                    params: trailing_params(&args, 7)?,
                    user_data: trailing(&args, 8),
                };

                Ok(match self.server()?.exec_rpc(call) {
                    Ok(id) => json!([200, "OK", id.to_string()]),
                    Err(e) => failed(format!("Error in connect: {e}")),
                })
            }
            "sendMessage" => {
                let conn_id: ConnectionId = match args.str(0)?.parse() {
                    Ok(id) => id,
                    Err(_) => return Ok(failed("invalid connection id")),
                };
                let Some(kind) = MessageKind::from_code(args.int(1)?) else {
                    return Ok(failed("unknown message type"));
                };
                let message = OutboundMessage::from_parts(
                    kind,
                    args.str(2)?,
                    args.str(3)?,
                    args.str(4)?,
                    trailing_params(&args, 5)?,
                    trailing(&args, 6),
                );

                Ok(match self.server()?.send_message(conn_id, message) {
                    Ok(()) => json!([200, "OK"]),
                    Err(e) => failed(e),
                })
            }
            "execServerFunction" => {
                let method = args.str(0)?;
                let id = RequestId::from(args.str(1)?);
                let outcome = self
                    .server()?
                    .exec_server_function(method, &trailing(&args, 2));
                Ok(message::reply_value(&id, &outcome))
            }
            "getServerPort" => Ok(json!([self.server()?.port()])),
            "_list" => Ok(json!(FUNCTIONS)),
            other => Err(InvokeError::NotImplemented(other.to_string())),
        }
    }
}
