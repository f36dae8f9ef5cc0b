//! Outbound connections.
//!
//! The socket is connected without blocking and the wait for completion
//! is bounded by a readiness poll; the resulting stream is wrapped in an
//! ordinary `Connection` by the caller.

use crate::error::ConnectError;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host name resolution used by the connector.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Connect to `host:port`, waiting at most `timeout`.
///
/// On failure the socket is dropped before returning.
pub fn connect(
    resolver: &dyn Resolver,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let target = format!("{host}:{port}");
    let addr = resolver
        .resolve(host, port)
        .map_err(|source| ConnectError::Resolve {
            host: host.to_string(),
            source,
        })?
        .into_iter()
        .next()
        .ok_or_else(|| ConnectError::NoAddress(host.to_string()))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ConnectError::Socket)?;
    socket.set_nonblocking(true).map_err(ConnectError::Socket)?;
    socket.set_nodelay(true).map_err(ConnectError::Socket)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {}
        Err(source) => return Err(ConnectError::Connect { host: target, source }),
    }

    let mut stream = TcpStream::from_std(socket.into());
    if !wait_writable(&mut stream, timeout).map_err(ConnectError::Socket)? {
        return Err(ConnectError::TimedOut(target));
    }

    if let Some(source) = stream.take_error().map_err(ConnectError::Socket)? {
        return Err(ConnectError::Connect { host: target, source });
    }
    if let Err(source) = stream.peer_addr() {
        return Err(ConnectError::Connect { host: target, source });
    }

    debug!(addr = %addr, "Connected");
    Ok(stream)
}

fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

/// Returns false if `timeout` passed before the socket became writable.
fn wait_writable(stream: &mut TcpStream, timeout: Duration) -> io::Result<bool> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(stream, Token(0), Interest::WRITABLE)?;

    let deadline = Instant::now() + timeout;
    let ready = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if !events.is_empty() {
            break true;
        }
        if remaining.is_zero() {
            break false;
        }
    };

    poll.registry().deregister(stream)?;
    Ok(ready)
}
