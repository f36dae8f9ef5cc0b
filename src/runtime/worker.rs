//! Worker pool.
//!
//! Each worker owns a FIFO channel and handles one connection at a time:
//! stage an outbound message, process the buffered frame, flush, then
//! hand the connection back to the reactor (or close it). Dispatch is
//! round-robin under a single mutex.

use crate::error::{JsonRpcError, ProtocolError};
use crate::rpc::dispatcher::Dispatcher;
use crate::rpc::handler::{self, FrameContext};
use crate::rpc::peer::CloseFlags;
use crate::rpc::queue::{EventSink, RpcEvent};
use crate::runtime::connection::{Connection, WriteOutcome};
use crate::runtime::event::{OutboundMessage, ServerEvent, WorkerEvent};
use crate::runtime::reactor::ReactorHandle;
use crate::runtime::registry::ConnectionRegistry;
use serde_json::Value;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Everything a worker needs to run a connection cycle.
pub struct WorkerContext {
    pub dispatcher: Dispatcher,
    pub sink: Arc<dyn EventSink>,
    pub registry: Arc<ConnectionRegistry>,
    pub reactor: ReactorHandle,
    pub max_message_size: usize,
}

impl WorkerContext {
    /// Run one cycle for `conn`, ending with a hand-back or a close.
    pub fn handle(&self, worker: usize, mut conn: Box<Connection>, message: Option<OutboundMessage>) {
        if let Some(message) = message {
            self.stage(worker, &mut conn, message);
            if conn.write() == WriteOutcome::Remove {
                self.close(conn);
                return;
            }
        }

        let processed = match self.process(&mut conn) {
            Ok(processed) => processed,
            Err(e) => {
                info!(worker, conn_id = %conn.id(), error = %e, "Closing connection on protocol error");
                self.close(conn);
                return;
            }
        };

        if conn.write() == WriteOutcome::Remove {
            self.close(conn);
            return;
        }

        if processed && conn.peer.flags.contains(CloseFlags::CLOSE_ALWAYS) {
            debug!(worker, conn_id = %conn.id(), "Closing connection after exchange");
            self.close(conn);
            return;
        }

        self.hand_back(conn);
    }

    /// Send the first request on a new outbound connection. Without it the
    /// connection has no purpose, so a rejected request closes it.
    pub fn open(&self, worker: usize, mut conn: Box<Connection>, message: OutboundMessage) {
        if !self.stage(worker, &mut conn, message) {
            debug!(worker, conn_id = %conn.id(), "Closing new connection");
            self.close(conn);
            return;
        }
        self.handle(worker, conn, None);
    }

    /// Frame `message` as the pending write. A request that cannot be
    /// framed is answered locally with an error response to its sink.
    fn stage(&self, worker: usize, conn: &mut Connection, message: OutboundMessage) -> bool {
        let waiter = match &message {
            OutboundMessage::Request {
                reply_sink: Some(queue),
                user_data,
                ..
            } => Some((queue.clone(), user_data.clone())),
            _ => None,
        };

        match handler::prepare_outbound(&mut conn.peer, message, self.max_message_size) {
            Ok(body) => {
                if !conn.set_outbound(&body) {
                    warn!(worker, conn_id = %conn.id(), "Dropping send, a message is already pending");
                }
                true
            }
            Err(e) => {
                warn!(worker, conn_id = %conn.id(), error = %e, "Failed to build outbound message");
                if let Some((queue, user_data)) = waiter {
                    let error = JsonRpcError::server_error(&e.to_string());
                    self.sink.post(
                        &queue,
                        RpcEvent::Response {
                            connection_id: conn.id(),
                            id: conn.peer.last_request_id(),
                            is_error: true,
                            data: serde_json::to_value(&error).unwrap_or(Value::Null),
                            user_data,
                        },
                    );
                }
                false
            }
        }
    }

    /// Handle the buffered frame, if any. Returns whether one was handled.
    fn process(&self, conn: &mut Connection) -> Result<bool, ProtocolError> {
        let id = conn.id();
        let ctx = FrameContext {
            dispatcher: &self.dispatcher,
            sink: self.sink.as_ref(),
            max_message_size: self.max_message_size,
        };

        let Some((payload, peer)) = conn.split_frame() else {
            return Ok(false);
        };
        let reply = handler::process_frame(id, peer, payload, &ctx);
        conn.reset_read();

        if let Some(body) = reply? {
            conn.set_outbound(&body);
        }
        Ok(true)
    }

    fn hand_back(&self, conn: Box<Connection>) {
        if let Err(ServerEvent::StartReadLoop(conn)) =
            self.reactor.post(ServerEvent::StartReadLoop(conn))
        {
            debug!(conn_id = %conn.id(), "Reactor stopped, closing connection");
            self.close(conn);
        }
    }

    /// Close `conn` and tell its queues, together with the reply sinks of
    /// sends that were queued for it but never left.
    pub(crate) fn close(&self, mut conn: Box<Connection>) {
        let id = conn.id();
        conn.close();
        self.registry.remove(id);
        let unsent = self.reactor.take_sends(id);
        conn.notify_disconnect(self.sink.as_ref(), &unsent);

        let notified = conn.peer.notified().clone();
        if self.reactor.post(ServerEvent::Closed { id, notified }).is_err() {
            // The reactor stopped and left its parked sends behind.
            let unsent = self.reactor.take_sends(id);
            conn.notify_disconnect(self.sink.as_ref(), &unsent);
        }
        debug!(conn_id = %id, "Connection closed");
    }
}

struct Cursor {
    next: usize,
    stopped: bool,
}

/// Fixed set of worker threads.
pub struct WorkerPool {
    senders: Vec<Sender<WorkerEvent>>,
    cursor: Mutex<Cursor>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` threads (at least one).
    pub fn spawn(workers: usize, ctx: Arc<WorkerContext>) -> io::Result<Self> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel();
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("rpc-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, rx, ctx))?;
            senders.push(tx);
            handles.push(handle);
        }

        info!(workers, "Worker pool started");
        Ok(Self {
            senders,
            cursor: Mutex::new(Cursor {
                next: 0,
                stopped: false,
            }),
            handles: Mutex::new(handles),
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Queue `event` on the next worker in turn. After shutdown the event
    /// is handed back.
    pub fn dispatch(&self, event: WorkerEvent) -> Result<(), WorkerEvent> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.stopped {
            return Err(event);
        }
        let worker = cursor.next;
        cursor.next = (cursor.next + 1) % self.senders.len();
        self.senders[worker].send(event).map_err(|e| e.0)
    }

    /// Stop accepting work, let every worker drain its queue and join them.
    pub fn shutdown(&self) {
        {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            if cursor.stopped {
                return;
            }
            cursor.stopped = true;
            for tx in &self.senders {
                let _ = tx.send(WorkerEvent::Shutdown);
            }
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

fn worker_loop(worker: usize, rx: Receiver<WorkerEvent>, ctx: Arc<WorkerContext>) {
    debug!(worker, "Worker started");
    while let Ok(event) = rx.recv() {
        match event {
            WorkerEvent::Process(conn) => ctx.handle(worker, conn, None),
            WorkerEvent::Send(conn, message) => ctx.handle(worker, conn, Some(message)),
            WorkerEvent::Open(conn, message) => ctx.open(worker, conn, message),
            WorkerEvent::Shutdown => break,
        }
    }
    debug!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use crate::rpc::message::RequestId;
    use crate::rpc::plugin::Plugins;
    use crate::rpc::queue::{QueueHub, RpcEvent};
    use crate::runtime::connection::test_support::{loopback, read_until_settled};
    use crate::runtime::netstring::{ReadOutcome, ReadPhase, MAX_PAYLOAD_SIZE};
    use crate::runtime::ConnectionId;
    use mio::Poll;
    use serde_json::{json, Value};
    use std::collections::{BTreeSet, HashMap};
    use std::io::{Read, Write};

    struct Fixture {
        _poll: Poll,
        hub: Arc<QueueHub>,
        ctx: Arc<WorkerContext>,
    }

    fn fixture() -> Fixture {
        fixture_with_limit(MAX_PAYLOAD_SIZE)
    }

    fn fixture_with_limit(max_message_size: usize) -> Fixture {
        let poll = Poll::new().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(16));
        let hub = Arc::new(QueueHub::new());
        let ctx = Arc::new(WorkerContext {
            dispatcher: Dispatcher::new(
                Arc::new(Plugins::new()),
                LogLevel::detached(1),
                Arc::clone(&registry),
            ),
            sink: hub.clone(),
            registry,
            reactor: ReactorHandle::new(&poll).unwrap(),
            max_message_size,
        });
        Fixture {
            _poll: poll,
            hub,
            ctx,
        }
    }

    /// A registered loopback connection holding one complete frame.
    fn with_frame(fx: &Fixture, id: u64, frame: &[u8]) -> (Box<Connection>, std::net::TcpStream) {
        let (mut conn, mut remote) = loopback(id);
        fx.ctx.registry.register(&conn).unwrap();
        remote.write_all(frame).unwrap();
        assert!(matches!(read_until_settled(&mut conn), ReadOutcome::Dispatch));
        (Box::new(conn), remote)
    }

    fn read_reply(remote: &mut std::net::TcpStream) -> Value {
        let mut buf = vec![0u8; 256];
        let n = remote.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        let (_, body) = text.split_once(':').unwrap();
        serde_json::from_str(body.trim_end_matches(',')).unwrap()
    }

    #[test]
    fn test_process_replies_and_hands_back() {
        let fx = fixture();
        let body = br#"{"jsonrpc":"2.0","method":"core.get_loglevel","id":"1"}"#;
        let frame = [format!("{}:", body.len()).as_bytes(), body, b","].concat();
        let (conn, mut remote) = with_frame(&fx, 1, &frame);

        fx.ctx.handle(0, conn, None);

        assert_eq!(
            read_reply(&mut remote),
            json!({"jsonrpc": "2.0", "id": "1", "result": [1]})
        );
        let events = fx.ctx.reactor.take_all();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::StartReadLoop(conn) => {
                assert_eq!(conn.read_phase(), ReadPhase::ReadingLength);
                assert!(!conn.has_frame());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_close_always() {
        let fx = fixture();
        let body = br#"{"jsonrpc":"2.0","method":"core.connections"}"#;
        let frame = [format!("{}:", body.len()).as_bytes(), body, b","].concat();
        let (mut conn, mut remote) = with_frame(&fx, 2, &frame);
        conn.peer.flags = CloseFlags::CLOSE_ALWAYS;

        fx.ctx.handle(0, conn, None);

        assert!(!fx.ctx.registry.contains(ConnectionId::from(2)));
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
        assert!(matches!(
            fx.ctx.reactor.take_all().pop_front(),
            Some(ServerEvent::Closed { id, .. }) if id == ConnectionId::from(2)
        ));
    }

    #[test]
    fn test_protocol_error_closes_and_notifies() {
        let fx = fixture();
        let rx = fx.hub.register("replies");
        let (mut conn, _remote) = with_frame(&fx, 3, b"8:not json,");
        conn.peer.expect_reply("1".into(), "replies".into(), Value::Null);

        fx.ctx.handle(0, conn, None);

        assert_eq!(
            rx.try_recv().unwrap(),
            RpcEvent::Disconnect {
                connection_id: ConnectionId::from(3)
            }
        );
        assert!(!fx.ctx.registry.contains(ConnectionId::from(3)));
    }

    #[test]
    fn test_send_is_written() {
        let fx = fixture();
        let (conn, mut remote) = loopback(4);
        fx.ctx.registry.register(&conn).unwrap();

        fx.ctx.handle(
            0,
            Box::new(conn),
            Some(OutboundMessage::Reply {
                id: RequestId::from(9),
                result: json!("done"),
            }),
        );

        assert_eq!(
            read_reply(&mut remote),
            json!({"jsonrpc": "2.0", "id": 9, "result": "done"})
        );
        assert!(matches!(
            fx.ctx.reactor.take_all().pop_front(),
            Some(ServerEvent::StartReadLoop(_))
        ));
    }

    #[test]
    fn test_hand_back_after_reactor_stopped_closes() {
        let fx = fixture();
        let (conn, mut remote) = loopback(5);
        fx.ctx.registry.register(&conn).unwrap();
        fx.ctx.reactor.stop_with(|_| HashMap::new());

        fx.ctx.handle(0, Box::new(conn), None);

        assert!(!fx.ctx.registry.contains(ConnectionId::from(5)));
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    fn oversize_request(sink: &str) -> OutboundMessage {
        OutboundMessage::Request {
            method: "remote.store".into(),
            params: json!(["x".repeat(512)]),
            reply_sink: Some(sink.into()),
            user_data: json!("ctx"),
        }
    }

    #[test]
    fn test_rejected_request_answers_sink() {
        let fx = fixture_with_limit(256);
        let rx = fx.hub.register("replies");
        let (conn, _remote) = loopback(6);
        fx.ctx.registry.register(&conn).unwrap();

        fx.ctx.handle(0, Box::new(conn), Some(oversize_request("replies")));

        match rx.try_recv().unwrap() {
            RpcEvent::Response {
                connection_id,
                is_error,
                data,
                user_data,
                ..
            } => {
                assert_eq!(connection_id, ConnectionId::from(6));
                assert!(is_error);
                assert_eq!(data["code"], json!(-32000));
                assert_eq!(user_data, json!("ctx"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        // The connection itself stays usable.
        assert!(fx.ctx.registry.contains(ConnectionId::from(6)));
        assert!(matches!(
            fx.ctx.reactor.take_all().pop_front(),
            Some(ServerEvent::StartReadLoop(_))
        ));
    }

    #[test]
    fn test_open_closes_on_rejected_request() {
        let fx = fixture_with_limit(256);
        let rx = fx.hub.register("replies");
        let (conn, mut remote) = loopback(7);
        fx.ctx.registry.register(&conn).unwrap();

        fx.ctx.open(0, Box::new(conn), oversize_request("replies"));

        assert!(matches!(
            rx.try_recv().unwrap(),
            RpcEvent::Response { is_error: true, .. }
        ));
        assert!(rx.try_recv().is_err());
        assert!(!fx.ctx.registry.contains(ConnectionId::from(7)));
        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_close_merges_queued_sends() {
        let fx = fixture();
        let replies = fx.hub.register("replies");
        let late = fx.hub.register("late");
        let (mut conn, _remote) = loopback(8);
        fx.ctx.registry.register(&conn).unwrap();
        conn.peer.expect_reply("1".into(), "replies".into(), Value::Null);

        let id = conn.id();
        for sink in ["replies", "late"] {
            fx.ctx
                .reactor
                .post_send(
                    &fx.ctx.registry,
                    id,
                    OutboundMessage::Request {
                        method: "remote.ping".into(),
                        params: Value::Null,
                        reply_sink: Some(sink.into()),
                        user_data: Value::Null,
                    },
                )
                .unwrap();
        }

        fx.ctx.close(Box::new(conn));

        let expected = RpcEvent::Disconnect { connection_id: id };
        assert_eq!(replies.try_recv().unwrap(), expected);
        assert!(replies.try_recv().is_err());
        assert_eq!(late.try_recv().unwrap(), expected);
        assert!(late.try_recv().is_err());

        let events = fx.ctx.reactor.take_all();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Closed { id: closed, notified } => {
                assert_eq!(*closed, id);
                let expected: BTreeSet<String> = ["late".to_string(), "replies".to_string()].into();
                assert_eq!(*notified, expected);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_pool_dispatch_and_shutdown() {
        let fx = fixture();
        let pool = WorkerPool::spawn(2, Arc::clone(&fx.ctx)).unwrap();
        assert_eq!(pool.len(), 2);

        let mut remotes = Vec::new();
        for id in 10..14 {
            let body = br#"{"jsonrpc":"2.0","method":"core.get_loglevel","id":"x"}"#;
            let frame = [format!("{}:", body.len()).as_bytes(), body, b","].concat();
            let (conn, remote) = with_frame(&fx, id, &frame);
            pool.dispatch(WorkerEvent::Process(conn)).unwrap();
            remotes.push(remote);
        }
        for remote in &mut remotes {
            assert_eq!(read_reply(remote)["result"], json!([1]));
        }

        pool.shutdown();
        let (conn, _remote) = loopback(20);
        assert!(matches!(
            pool.dispatch(WorkerEvent::Process(Box::new(conn))),
            Err(WorkerEvent::Process(_))
        ));
    }
}
