//! mio reactor.
//!
//! Runs on one thread and owns the listener plus every idle connection.
//! An idle connection is registered for read readiness; as soon as it
//! holds a complete frame (or has a send to perform) it is deregistered
//! and moved to a worker. Other threads reach the reactor only through
//! `ReactorHandle::post`, which queues a `ServerEvent` and wakes the poll.
//!
//! Sends addressed to a connection a worker currently holds are parked in
//! `PendingSends` and dispatched when the worker hands the connection
//! back, before the read watcher is re-armed.

use crate::error::SendError;
use crate::rpc::peer::CloseFlags;
use crate::rpc::queue::{EventSink, RpcEvent};
use crate::runtime::connection::{Connection, ConnectionId, Direction};
use crate::runtime::event::{OutboundMessage, ServerEvent, WorkerEvent};
use crate::runtime::netstring::ReadOutcome;
use crate::runtime::pending::PendingSends;
use crate::runtime::registry::{ConnectionRegistry, Owner};
use crate::runtime::worker::WorkerPool;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 1024;

struct Injector {
    events: VecDeque<ServerEvent>,
    running: bool,
    /// Sends left behind at shutdown for connections a worker still held.
    orphans: HashMap<ConnectionId, Vec<OutboundMessage>>,
}

/// Cross-thread entry point into the reactor's event queue.
#[derive(Clone)]
pub struct ReactorHandle {
    injector: Arc<Mutex<Injector>>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    pub(crate) fn new(poll: &Poll) -> io::Result<Self> {
        Ok(Self {
            injector: Arc::new(Mutex::new(Injector {
                events: VecDeque::new(),
                running: true,
                orphans: HashMap::new(),
            })),
            waker: Arc::new(Waker::new(poll.registry(), WAKER)?),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Injector> {
        self.injector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `event` for the reactor thread.
    ///
    /// Once the reactor has stopped the event is handed back so the
    /// caller can dispose of whatever it carries.
    pub fn post(&self, event: ServerEvent) -> Result<(), ServerEvent> {
        {
            let mut injector = self.lock();
            if !injector.running {
                return Err(event);
            }
            injector.events.push_back(event);
        }
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake reactor");
        }
        Ok(())
    }

    /// Queue `message` for connection `id` if it is still registered.
    ///
    /// The registry is checked while the queue is locked, so a send is
    /// either refused or queued before the connection leaves the registry;
    /// whoever removes it then finds it with `take_sends`.
    pub fn post_send(
        &self,
        registry: &ConnectionRegistry,
        id: ConnectionId,
        message: OutboundMessage,
    ) -> Result<(), SendError> {
        {
            let mut injector = self.lock();
            if !injector.running {
                return Err(SendError::Stopped);
            }
            if !registry.contains(id) {
                return Err(SendError::UnknownConnection(id));
            }
            injector.events.push_back(ServerEvent::SendMessage(id, message));
        }
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake reactor");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub(crate) fn take_all(&self) -> VecDeque<ServerEvent> {
        std::mem::take(&mut self.lock().events)
    }

    /// Remove the sends for `id` the reactor has not picked up yet,
    /// including any it left behind when it stopped.
    pub(crate) fn take_sends(&self, id: ConnectionId) -> Vec<OutboundMessage> {
        let mut injector = self.lock();
        let mut taken = injector.orphans.remove(&id).unwrap_or_default();
        let events = std::mem::take(&mut injector.events);
        for event in events {
            match event {
                ServerEvent::SendMessage(target, message) if target == id => taken.push(message),
                other => injector.events.push_back(other),
            }
        }
        taken
    }

    /// Refuse further events and hand the queued ones to `park`, which
    /// returns the sends it could not deliver. Both happen under one lock,
    /// so a caller refused by `post` can already find its orphans.
    pub(crate) fn stop_with<F>(&self, park: F)
    where
        F: FnOnce(VecDeque<ServerEvent>) -> HashMap<ConnectionId, Vec<OutboundMessage>>,
    {
        let mut injector = self.lock();
        injector.running = false;
        let queued = std::mem::take(&mut injector.events);
        let orphans = park(queued);
        injector.orphans.extend(orphans);
    }
}

/// Per-connection settings applied to accepted connections.
#[derive(Debug, Clone, Copy)]
pub struct ReactorSettings {
    pub flags: CloseFlags,
    pub max_message_size: usize,
}

pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    handle: ReactorHandle,
    /// Idle connections, keyed by their poll token.
    idle: Slab<Box<Connection>>,
    idle_ids: HashMap<ConnectionId, usize>,
    pending: PendingSends,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn EventSink>,
    settings: ReactorSettings,
    stopping: bool,
}

impl Reactor {
    /// Bind the listening socket and set up the poll.
    pub fn bind(
        addr: SocketAddr,
        settings: ReactorSettings,
        registry: Arc<ConnectionRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let handle = ReactorHandle::new(&poll)?;

        Ok(Self {
            poll,
            listener,
            handle,
            idle: Slab::new(),
            idle_ids: HashMap::new(),
            pending: PendingSends::new(),
            registry,
            sink,
            settings,
            stopping: false,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until a `Shutdown` event arrives.
    pub fn run(mut self, pool: Arc<WorkerPool>) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(addr = ?self.listener.local_addr().ok(), "Reactor started");

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed, stopping reactor");
                self.stop(&pool);
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(&pool),
                    WAKER => {}
                    Token(key) => self.readable(key, &pool),
                }
            }

            for event in self.handle.take_all() {
                self.process(event, &pool);
            }

            if self.stopping {
                self.stop(&pool);
                return Ok(());
            }
        }
    }

    fn accept(&mut self, pool: &WorkerPool) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = self.registry.allocate_id();
                    let conn = Box::new(Connection::new(
                        id,
                        stream,
                        Direction::Inbound,
                        self.settings.flags,
                        self.settings.max_message_size,
                    ));
                    if let Err(e) = self.registry.register(&conn) {
                        warn!(peer = %peer, error = %e, "Rejecting connection");
                        continue;
                    }
                    debug!(conn_id = %id, peer = %peer, "Accepted connection");
                    self.arm(conn, pool);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Make `conn` idle: register it for reads and consume anything that
    /// arrived while it was away.
    fn arm(&mut self, conn: Box<Connection>, pool: &WorkerPool) {
        let id = conn.id();
        let entry = self.idle.vacant_entry();
        let key = entry.key();
        let conn = entry.insert(conn);

        if let Err(e) = self
            .poll
            .registry()
            .register(conn.stream_mut(), Token(key), Interest::READABLE)
        {
            error!(conn_id = %id, error = %e, "Failed to register connection");
            let conn = self.idle.remove(key);
            self.close_connection(conn);
            return;
        }

        self.idle_ids.insert(id, key);
        self.registry.set_owner(id, Owner::Reactor);
        self.readable(key, pool);
    }

    /// Take an idle connection out of the poll.
    fn disarm(&mut self, key: usize) -> Option<Box<Connection>> {
        let mut conn = self.idle.try_remove(key)?;
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(conn_id = %conn.id(), error = %e, "Deregister failed");
        }
        self.idle_ids.remove(&conn.id());
        self.registry.set_owner(conn.id(), Owner::Worker);
        Some(conn)
    }

    fn readable(&mut self, key: usize, pool: &WorkerPool) {
        let Some(conn) = self.idle.get_mut(key) else {
            return;
        };

        match conn.on_read_event() {
            ReadOutcome::Continue => {}
            ReadOutcome::Dispatch => {
                if let Some(conn) = self.disarm(key) {
                    self.dispatch(WorkerEvent::Process(conn), pool);
                }
            }
            ReadOutcome::Remove(_) => {
                if let Some(conn) = self.disarm(key) {
                    self.close_connection(conn);
                }
            }
        }
    }

    fn process(&mut self, event: ServerEvent, pool: &WorkerPool) {
        match event {
            ServerEvent::StartReadLoop(conn) => self.start_read_loop(conn, pool),
            ServerEvent::SendMessage(id, message) => self.send_message(id, message, pool),
            ServerEvent::Remove(id) => match self.idle_ids.get(&id).copied() {
                Some(key) => {
                    if let Some(conn) = self.disarm(key) {
                        self.close_connection(conn);
                    }
                }
                None => debug!(conn_id = %id, "Removed while busy, closing at hand-back"),
            },
            ServerEvent::Closed { id, notified } => self.discard_pending(id, &notified),
            ServerEvent::Shutdown => {
                info!("Reactor shutting down");
                self.stopping = true;
            }
        }
    }

    /// A worker is done with `conn`. Pending sends go first; only a
    /// connection with nothing left to send becomes idle.
    fn start_read_loop(&mut self, conn: Box<Connection>, pool: &WorkerPool) {
        let id = conn.id();
        if !self.registry.contains(id) {
            debug!(conn_id = %id, "Connection was removed while busy");
            self.close_connection(conn);
            return;
        }

        match self.pending.take_next(id) {
            Some(message) => {
                debug!(conn_id = %id, "Dispatching pending send");
                self.dispatch(WorkerEvent::Send(conn, message), pool);
            }
            None => self.arm(conn, pool),
        }
    }

    /// Sends are only queued for registered connections, so one that is
    /// not idle is held by a worker. It is parked until the worker hands
    /// the connection back or reports it closed.
    fn send_message(&mut self, id: ConnectionId, message: OutboundMessage, pool: &WorkerPool) {
        if let Some(key) = self.idle_ids.get(&id).copied() {
            if let Some(conn) = self.disarm(key) {
                self.dispatch(WorkerEvent::Send(conn, message), pool);
            }
            return;
        }

        debug!(conn_id = %id, "Connection busy, queueing send");
        self.pending.push(id, message);
    }

    fn dispatch(&mut self, event: WorkerEvent, pool: &WorkerPool) {
        let Err(event) = pool.dispatch(event) else {
            return;
        };

        warn!("Worker pool stopped, closing connection");
        match event {
            WorkerEvent::Process(conn) => self.close_connection(conn),
            WorkerEvent::Send(conn, message) | WorkerEvent::Open(conn, message) => {
                self.pending.push(conn.id(), message);
                self.close_connection(conn);
            }
            WorkerEvent::Shutdown => {}
        }
    }

    fn close_connection(&mut self, conn: Box<Connection>) {
        let id = conn.id();
        self.registry.remove(id);
        // Nothing new is queued for `id` once it left the registry.
        let mut unsent = self.pending.purge(id);
        unsent.extend(self.handle.take_sends(id));
        self.finish_close(conn, &unsent);
    }

    /// Close `conn` and send one disconnect notice to each of its queues
    /// and to the reply sinks of `unsent`.
    fn finish_close(&self, mut conn: Box<Connection>, unsent: &[OutboundMessage]) {
        let id = conn.id();
        conn.close();
        if !unsent.is_empty() {
            debug!(conn_id = %id, count = unsent.len(), "Discarding pending sends");
        }
        conn.notify_disconnect(self.sink.as_ref(), unsent);
        debug!(conn_id = %id, "Connection closed");
    }

    /// Drop the sends parked for `id`, which a worker has closed, and tell
    /// their reply sinks unless the worker already did.
    fn discard_pending(&mut self, id: ConnectionId, notified: &BTreeSet<String>) {
        let dropped = self.pending.purge(id);
        if dropped.is_empty() {
            return;
        }
        debug!(conn_id = %id, count = dropped.len(), "Discarding pending sends");

        let queues: BTreeSet<&str> = dropped
            .iter()
            .filter_map(OutboundMessage::reply_sink)
            .filter(|queue| !notified.contains(*queue))
            .collect();
        for queue in queues {
            self.sink.post(queue, RpcEvent::Disconnect { connection_id: id });
        }
    }

    fn stop(&mut self, pool: &WorkerPool) {
        let handle = self.handle.clone();
        handle.stop_with(|queued| {
            let mut others = Vec::new();
            for event in queued {
                match event {
                    ServerEvent::SendMessage(id, message) => self.pending.push(id, message),
                    other => others.push(other),
                }
            }
            for event in others {
                match event {
                    ServerEvent::StartReadLoop(conn) => self.close_stopped(conn),
                    ServerEvent::Closed { id, notified } => self.discard_pending(id, &notified),
                    _ => {}
                }
            }

            let keys: Vec<usize> = self.idle.iter().map(|(key, _)| key).collect();
            for key in keys {
                if let Some(conn) = self.disarm(key) {
                    self.close_stopped(conn);
                }
            }

            // Connections still held by workers are closed by those
            // workers, which collect what is left here.
            self.pending.drain()
        });

        info!(workers = pool.len(), "Reactor stopped");
    }

    /// `close_connection` for use while the event queue is locked.
    fn close_stopped(&mut self, conn: Box<Connection>) {
        let id = conn.id();
        self.registry.remove(id);
        let unsent = self.pending.purge(id);
        self.finish_close(conn, &unsent);
    }
}

/// Create a non-blocking listening socket.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::RequestId;
    use crate::runtime::connection::test_support::loopback;
    use serde_json::Value;

    fn reply(id: &str) -> OutboundMessage {
        OutboundMessage::Reply {
            id: RequestId::from(id),
            result: Value::Null,
        }
    }

    #[test]
    fn test_post_after_stop_is_refused() {
        let poll = Poll::new().unwrap();
        let handle = ReactorHandle::new(&poll).unwrap();
        let id = ConnectionId::from(1);

        assert!(handle.post(ServerEvent::SendMessage(id, reply("a"))).is_ok());
        assert!(handle.is_running());

        let mut seen = 0;
        handle.stop_with(|queued| {
            seen = queued.len();
            HashMap::new()
        });
        assert_eq!(seen, 1);
        assert!(!handle.is_running());

        match handle.post(ServerEvent::Remove(id)) {
            Err(ServerEvent::Remove(returned)) => assert_eq!(returned, id),
            other => panic!("expected the event back, got {other:?}"),
        }
    }

    #[test]
    fn test_post_send_requires_registration() {
        let poll = Poll::new().unwrap();
        let handle = ReactorHandle::new(&poll).unwrap();
        let registry = ConnectionRegistry::new(4);
        let (conn, _remote) = loopback(3);
        registry.register(&conn).unwrap();

        assert!(handle.post_send(&registry, conn.id(), reply("1")).is_ok());
        assert!(matches!(
            handle.post_send(&registry, ConnectionId::from(99), reply("2")),
            Err(SendError::UnknownConnection(_))
        ));

        handle.stop_with(|_| HashMap::new());
        assert!(matches!(
            handle.post_send(&registry, conn.id(), reply("3")),
            Err(SendError::Stopped)
        ));
    }

    #[test]
    fn test_take_sends_leaves_other_events() {
        let poll = Poll::new().unwrap();
        let handle = ReactorHandle::new(&poll).unwrap();
        let id = ConnectionId::from(4);
        let other = ConnectionId::from(5);

        handle.post(ServerEvent::SendMessage(id, reply("1"))).unwrap();
        handle.post(ServerEvent::SendMessage(other, reply("2"))).unwrap();
        handle.post(ServerEvent::Remove(other)).unwrap();
        handle.post(ServerEvent::SendMessage(id, reply("3"))).unwrap();

        assert_eq!(handle.take_sends(id), vec![reply("1"), reply("3")]);
        assert_eq!(handle.take_all().len(), 2);

        handle.stop_with(|_| HashMap::from([(id, vec![reply("4")])]));
        assert_eq!(handle.take_sends(id), vec![reply("4")]);
        assert!(handle.take_sends(id).is_empty());
    }

    #[test]
    fn test_events_taken_in_order() {
        let poll = Poll::new().unwrap();
        let handle = ReactorHandle::new(&poll).unwrap();
        let id = ConnectionId::from(2);

        handle.post(ServerEvent::SendMessage(id, reply("1"))).unwrap();
        handle.post(ServerEvent::SendMessage(id, reply("2"))).unwrap();

        let ids: Vec<String> = handle
            .take_all()
            .into_iter()
            .map(|event| match event {
                ServerEvent::SendMessage(_, OutboundMessage::Reply { id, .. }) => id.to_string(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(ids, ["1", "2"]);
        assert!(handle.take_all().is_empty());
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let reactor = Reactor::bind(
            "127.0.0.1:0".parse().unwrap(),
            ReactorSettings {
                flags: CloseFlags::empty(),
                max_message_size: 1024,
            },
            Arc::new(ConnectionRegistry::new(4)),
            Arc::new(crate::rpc::queue::QueueHub::new()),
        )
        .unwrap();
        assert_ne!(reactor.local_addr().unwrap().port(), 0);
    }
}
