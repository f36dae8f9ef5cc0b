//! JSON-RPC server.
//!
//! `Server` ties the pieces together: it binds the listener, starts the
//! reactor thread and the worker pool, and exposes the entry points used
//! by application code (sending messages, originating calls, managing
//! connections). It is a cheap clonable handle.

use crate::config::Config;
use crate::error::{ConnectError, JsonRpcError, SendError};
use crate::logging::{self, LogLevel};
use crate::rpc::dispatcher::Dispatcher;
use crate::rpc::module::RpcModule;
use crate::rpc::peer::CloseFlags;
use crate::rpc::plugin::{PluginRegistry, Plugins};
use crate::rpc::queue::{EventSink, QueueHub};
use crate::runtime::client::{self, Resolver, SystemResolver};
use crate::runtime::{
    Connection, ConnectionHandle, ConnectionId, ConnectionRegistry, Direction, OutboundMessage,
    Reactor, ReactorHandle, ReactorSettings, ServerEvent, WorkerContext, WorkerEvent, WorkerPool,
};
use serde_json::Value;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// An outbound call on a brand-new connection.
#[derive(Debug, Clone, Default)]
pub struct ExecRpc {
    pub host: String,
    pub port: u16,
    pub method: String,
    pub params: Value,
    /// Queue receiving the reply; `None` sends without correlation.
    pub reply_sink: Option<String>,
    /// Queue receiving notifications the remote side sends back.
    pub notification_receiver: Option<String>,
    /// Queue receiving requests the remote side sends back.
    pub request_receiver: Option<String>,
    pub flags: CloseFlags,
    pub user_data: Value,
}

struct Shared {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    reactor: ReactorHandle,
    pool: Arc<WorkerPool>,
    ctx: Arc<WorkerContext>,
    resolver: Arc<dyn Resolver>,
    max_message_size: usize,
    connect_timeout: Duration,
    reactor_thread: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

/// Non-owning reference to a running server.
#[derive(Clone)]
pub struct WeakServer(Weak<Shared>);

impl WeakServer {
    pub fn upgrade(&self) -> Option<Server> {
        self.0.upgrade().map(|shared| Server { shared })
    }
}

pub struct ServerBuilder {
    config: Config,
    plugins: Option<Arc<dyn PluginRegistry>>,
    sink: Option<Arc<dyn EventSink>>,
    resolver: Option<Arc<dyn Resolver>>,
    log_level: Option<Arc<LogLevel>>,
}

impl ServerBuilder {
    /// Registry consulted for `factory.function` calls.
    pub fn plugins(mut self, plugins: Arc<dyn PluginRegistry>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Destination for replies, forwarded calls and disconnect notices.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Level reported and changed by `core.get_loglevel` / `core.set_loglevel`.
    pub fn log_level(mut self, log_level: Arc<LogLevel>) -> Self {
        self.log_level = Some(log_level);
        self
    }

    /// Bind the listener and start the reactor and worker threads.
    pub fn start(self) -> io::Result<Server> {
        let config = self.config;
        let plugins = self
            .plugins
            .unwrap_or_else(|| Arc::new(Plugins::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(QueueHub::new()));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(SystemResolver));
        let log_level = self.log_level.unwrap_or_else(|| {
            LogLevel::detached(logging::level_from_name(&config.log_level).unwrap_or(2))
        });

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}:{}", config.host, config.port),
                )
            })?;

        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let reactor = Reactor::bind(
            addr,
            ReactorSettings {
                flags: config.close_flags,
                max_message_size: config.max_message_size,
            },
            Arc::clone(&registry),
            Arc::clone(&sink),
        )?;
        let local_addr = reactor.local_addr()?;
        let handle = reactor.handle();

        let ctx = Arc::new(WorkerContext {
            dispatcher: Dispatcher::new(plugins, log_level, Arc::clone(&registry)),
            sink,
            registry: Arc::clone(&registry),
            reactor: handle.clone(),
            max_message_size: config.max_message_size,
        });
        let pool = Arc::new(WorkerPool::spawn(config.workers, Arc::clone(&ctx))?);

        let reactor_pool = Arc::clone(&pool);
        let reactor_thread = match thread::Builder::new()
            .name("rpc-reactor".to_string())
            .spawn(move || reactor.run(reactor_pool))
        {
            Ok(thread) => thread,
            Err(e) => {
                pool.shutdown();
                return Err(e);
            }
        };

        info!(
            addr = %local_addr,
            workers = pool.len(),
            max_connections = config.max_connections,
            "JSON-RPC server listening"
        );

        Ok(Server {
            shared: Arc::new(Shared {
                local_addr,
                registry,
                reactor: handle,
                pool,
                ctx,
                resolver,
                max_message_size: config.max_message_size,
                connect_timeout: config.connect_timeout,
                reactor_thread: Mutex::new(Some(reactor_thread)),
            }),
        })
    }
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            plugins: None,
            sink: None,
            resolver: None,
            log_level: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    pub fn downgrade(&self) -> WeakServer {
        WeakServer(Arc::downgrade(&self.shared))
    }

    /// The `jsonrpc` plugin exposing this server over RPC.
    pub fn rpc_module(&self) -> RpcModule {
        RpcModule::new(self.downgrade())
    }

    pub fn is_running(&self) -> bool {
        self.shared.reactor.is_running()
    }

    /// Number of registered connections.
    pub fn connections(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.shared.registry.get(id)
    }

    /// Adopt an already connected stream and start reading from it.
    pub fn register_connection(
        &self,
        stream: mio::net::TcpStream,
        direction: Direction,
        flags: CloseFlags,
    ) -> Result<ConnectionId, ConnectError> {
        let conn = self.new_connection(stream, direction, flags)?;
        let id = conn.id();
        if let Err(ServerEvent::StartReadLoop(conn)) =
            self.shared.reactor.post(ServerEvent::StartReadLoop(conn))
        {
            self.discard(conn);
            return Err(ConnectError::Stopped);
        }
        Ok(id)
    }

    /// Remove `id` from the registry. The connection is closed as soon as
    /// the reactor holds it. Returns false if `id` was not registered.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        if !self.shared.registry.remove(id) {
            return false;
        }
        let _ = self.shared.reactor.post(ServerEvent::Remove(id));
        true
    }

    /// Send `message` on connection `id`.
    ///
    /// Delivery is asynchronous; if the connection is busy the message is
    /// queued and sent right after the current exchange.
    pub fn send_message(&self, id: ConnectionId, message: OutboundMessage) -> Result<(), SendError> {
        let len = message.approximate_len();
        if len > self.shared.max_message_size {
            return Err(SendError::TooLarge(len));
        }
        self.shared
            .reactor
            .post_send(&self.shared.registry, id, message)
    }

    /// Connect to `call.host` and send `call.method` on the new connection.
    pub fn exec_rpc(&self, call: ExecRpc) -> Result<ConnectionId, ConnectError> {
        if !self.is_running() {
            return Err(ConnectError::Stopped);
        }

        let message = OutboundMessage::Request {
            method: call.method,
            params: call.params,
            reply_sink: call.reply_sink,
            user_data: call.user_data,
        };
        let len = message.approximate_len();
        if len > self.shared.max_message_size {
            return Err(ConnectError::TooLarge(len));
        }

        let stream = client::connect(
            self.shared.resolver.as_ref(),
            &call.host,
            call.port,
            self.shared.connect_timeout,
        )?;
        let mut conn = self.new_connection(stream, Direction::Outbound, call.flags)?;
        conn.peer.notification_receiver = call.notification_receiver;
        conn.peer.request_receiver = call.request_receiver;
        let id = conn.id();

        debug!(conn_id = %id, host = %call.host, port = call.port, "Sending request on new connection");
        if let Err(WorkerEvent::Open(conn, _)) =
            self.shared.pool.dispatch(WorkerEvent::Open(conn, message))
        {
            self.discard(conn);
            return Err(ConnectError::Stopped);
        }
        Ok(id)
    }

    /// Run `method` locally, as if it had arrived over the wire.
    pub fn exec_server_function(&self, method: &str, params: &Value) -> Result<Value, JsonRpcError> {
        self.shared.ctx.dispatcher.execute(method, params)
    }

    /// Stop the reactor, then drain and join the workers.
    pub fn shutdown(&self) {
        let _ = self.shared.reactor.post(ServerEvent::Shutdown);
        if let Err(e) = self.wait() {
            error!(error = %e, "Reactor failed");
        }
    }

    /// Block until the reactor has stopped and the workers are joined.
    pub fn wait(&self) -> io::Result<()> {
        let thread = self
            .shared
            .reactor_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match thread {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("reactor thread panicked"))),
            None => Ok(()),
        };
        self.shared.pool.shutdown();
        result
    }

    fn new_connection(
        &self,
        stream: mio::net::TcpStream,
        direction: Direction,
        flags: CloseFlags,
    ) -> Result<Box<Connection>, ConnectError> {
        let id = self.shared.registry.allocate_id();
        let conn = Box::new(Connection::new(
            id,
            stream,
            direction,
            flags,
            self.shared.max_message_size,
        ));
        self.shared.registry.register(&conn)?;
        Ok(conn)
    }

    fn discard(&self, conn: Box<Connection>) {
        self.shared.ctx.close(conn);
    }
}
