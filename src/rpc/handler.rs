//! Processing of one inbound frame and construction of outbound ones.
//!
//! `process_frame` decides what a complete frame means for its
//! connection: a reply routed to a waiting queue, a call forwarded to a
//! receiver queue, or a call executed by the dispatcher. An `Err` means
//! the connection must be closed.

use crate::error::ProtocolError;
use crate::rpc::dispatcher::Dispatcher;
use crate::rpc::message::{self, Incoming};
use crate::rpc::peer::{CloseFlags, Peer};
use crate::rpc::queue::{EventSink, RpcEvent};
use crate::runtime::event::OutboundMessage;
use crate::runtime::ConnectionId;
use tracing::{debug, info, trace};

/// What a worker needs to process frames.
pub struct FrameContext<'a> {
    pub dispatcher: &'a Dispatcher,
    pub sink: &'a dyn EventSink,
    pub max_message_size: usize,
}

/// Handle the frame `payload` received on `conn_id`.
///
/// Returns the JSON body of the reply to send, if any.
pub fn process_frame(
    conn_id: ConnectionId,
    peer: &mut Peer,
    payload: &[u8],
    ctx: &FrameContext<'_>,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    trace!(conn_id = %conn_id, payload = %String::from_utf8_lossy(payload), "Processing message");

    match message::parse(payload)? {
        Incoming::Reply { id, outcome } => {
            route_reply(conn_id, peer, id, outcome, ctx.sink)?;
            Ok(None)
        }
        Incoming::Call { method, params, id } => {
            let receiver = match id {
                Some(_) => peer.request_receiver.as_deref(),
                None => peer.notification_receiver.as_deref(),
            };
            if let Some(queue) = receiver {
                forward_call(conn_id, peer.flags, queue, method, id, params, ctx.sink)?;
                return Ok(None);
            }

            let outcome = ctx.dispatcher.execute(&method, &params);
            let Some(id) = id else {
                debug!(conn_id = %conn_id, method = %method, "Executed notification");
                return Ok(None);
            };

            let body = match &outcome {
                Ok(result) => message::reply(&id, result)?,
                Err(e) => {
                    info!(conn_id = %conn_id, method = %method, code = e.code, message = %e.message, "RPC call failed");
                    message::error_reply(&id, &serde_json::to_value(e)?)?
                }
            };
            check_size(body, ctx.max_message_size).map(Some)
        }
    }
}

fn route_reply(
    conn_id: ConnectionId,
    peer: &mut Peer,
    id: String,
    outcome: Result<serde_json::Value, serde_json::Value>,
    sink: &dyn EventSink,
) -> Result<(), ProtocolError> {
    let Some(reply_sink) = peer.take_reply_sink(&id) else {
        debug!(conn_id = %conn_id, id = %id, "Received reply for unknown request");
        if peer.flags.contains(CloseFlags::CLOSE_WRONG_REPLY) {
            return Err(ProtocolError::UnknownReplyId(id));
        }
        return Ok(());
    };

    let (is_error, data) = match outcome {
        Ok(result) => (false, result),
        Err(error) => (true, error),
    };
    let event = RpcEvent::Response {
        connection_id: conn_id,
        id,
        is_error,
        data,
        user_data: reply_sink.user_data,
    };

    if sink.post(&reply_sink.queue, event) {
        debug!(conn_id = %conn_id, queue = %reply_sink.queue, "Posted reply to event queue");
        return Ok(());
    }

    debug!(conn_id = %conn_id, queue = %reply_sink.queue, "Reply receiver queue does not exist any more");
    if peer.flags.contains(CloseFlags::CLOSE_NO_REPLY_LINK) {
        return Err(ProtocolError::NoReplyLink(reply_sink.queue));
    }
    Ok(())
}

fn forward_call(
    conn_id: ConnectionId,
    flags: CloseFlags,
    queue: &str,
    method: String,
    id: Option<message::RequestId>,
    params: serde_json::Value,
    sink: &dyn EventSink,
) -> Result<(), ProtocolError> {
    let is_request = id.is_some();
    let event = RpcEvent::Request {
        connection_id: conn_id,
        method,
        id,
        params,
    };

    if sink.post(queue, event) {
        debug!(conn_id = %conn_id, queue, is_request, "Passed call directly to event queue");
        return Ok(());
    }

    debug!(conn_id = %conn_id, queue, is_request, "Receiver event queue does not exist any more");
    if is_request && flags.contains(CloseFlags::CLOSE_NO_REQUEST_RECEIVER) {
        return Err(ProtocolError::NoRequestReceiver(queue.to_string()));
    }
    if !is_request && flags.contains(CloseFlags::CLOSE_NO_NOTIFICATION_RECEIVER) {
        return Err(ProtocolError::NoNotificationReceiver(queue.to_string()));
    }
    Ok(())
}

/// Serialize `message` for sending, registering a reply sink for
/// requests that expect an answer.
pub fn prepare_outbound(
    peer: &mut Peer,
    message: OutboundMessage,
    max_message_size: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let body = match message {
        OutboundMessage::Request {
            method,
            params,
            reply_sink,
            user_data,
        } => {
            let id = peer.next_request_id();
            let body = message::request(&method, &params, Some(&id))?;
            let body = check_size(body, max_message_size)?;
            if let Some(queue) = reply_sink {
                peer.expect_reply(id, queue, user_data);
            }
            return Ok(body);
        }
        OutboundMessage::Notification { method, params } => {
            message::request(&method, &params, None)?
        }
        OutboundMessage::Reply { id, result } => message::reply(&id, &result)?,
        OutboundMessage::Error { id, error } => message::error_reply(&id, &error)?,
    };
    check_size(body, max_message_size)
}

fn check_size(body: Vec<u8>, max_message_size: usize) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > max_message_size {
        return Err(ProtocolError::TooLarge(body.len()));
    }
    Ok(body)
}
