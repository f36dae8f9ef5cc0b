//! Connection state machine for netstring JSON-RPC peers.
//!
//! A `Connection` is owned by exactly one thread at a time: the reactor
//! while it waits for bytes, or a worker while a frame is processed or a
//! message is flushed. Ownership moves by value through event queues,
//! so there is no per-connection lock.
//!
//! Read side: `ReadingLength -> ReadingBody -> Complete`, reset once the
//! worker has fully handled the frame. Write side: `NoPendingWrite ->
//! WritePending -> NoPendingWrite`, flushed synchronously by `write()`.

use crate::rpc::peer::{CloseFlags, Peer};
use crate::rpc::queue::EventSink;
use crate::runtime::netstring::{self, FrameReader, ReadOutcome, ReadPhase};
use crate::runtime::event::OutboundMessage;
use bytes::BytesMut;
use mio::net::TcpStream;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Delay between send attempts while the socket buffer is full.
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Opaque connection identity, unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Result of flushing the pending outbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing left to send.
    Continue,
    /// The socket failed; the connection has been shut down.
    Remove,
}

/// A single peer connection.
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    direction: Direction,
    reader: FrameReader,
    /// Framed message waiting to be flushed.
    outbound: Option<BytesMut>,
    /// JSON-RPC state.
    pub peer: Peer,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("direction", &self.direction)
            .field("phase", &self.reader.phase())
            .field("write_pending", &self.outbound.is_some())
            .finish()
    }
}

impl Connection {
    /// Wrap a non-blocking stream.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        direction: Direction,
        flags: CloseFlags,
        max_message_size: usize,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer_addr,
            direction,
            reader: FrameReader::new(max_message_size),
            outbound: None,
            peer: Peer::new(flags),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn read_phase(&self) -> ReadPhase {
        self.reader.phase()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Consume readable bytes. `Dispatch` means a complete frame is
    /// buffered and the connection should go to a worker.
    pub fn on_read_event(&mut self) -> ReadOutcome {
        let outcome = self.reader.read_from(&mut self.stream);
        match &outcome {
            ReadOutcome::Continue => {}
            ReadOutcome::Dispatch => {
                debug!(conn_id = %self.id, phase = ?self.reader.phase(), "Frame complete");
            }
            ReadOutcome::Remove(reason) => {
                debug!(conn_id = %self.id, reason = %reason, "Closing connection");
                self.close();
            }
        }
        outcome
    }

    /// The complete inbound frame, if one is buffered.
    pub fn frame(&self) -> Option<&[u8]> {
        self.reader.frame()
    }

    pub fn has_frame(&self) -> bool {
        self.reader.frame().is_some()
    }

    /// The buffered frame together with the JSON-RPC state it updates.
    pub fn split_frame(&mut self) -> Option<(&[u8], &mut Peer)> {
        let frame = self.reader.frame()?;
        Some((frame, &mut self.peer))
    }

    /// Clear the read buffer and phase for the next frame.
    pub fn reset_read(&mut self) {
        self.reader.reset();
    }

    /// Frame `payload` and mark it for sending. Returns false if a
    /// message is already pending.
    pub fn set_outbound(&mut self, payload: &[u8]) -> bool {
        if self.outbound.is_some() {
            return false;
        }
        self.outbound = Some(netstring::encode(payload));
        true
    }

    pub fn write_pending(&self) -> bool {
        self.outbound.is_some()
    }

    /// Send the pending frame completely, sleeping briefly whenever the
    /// socket would block.
    pub fn write(&mut self) -> WriteOutcome {
        let Some(frame) = self.outbound.take() else {
            return WriteOutcome::Continue;
        };

        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    info!(conn_id = %self.id, "Write returned 0, closing connection");
                    self.close();
                    return WriteOutcome::Remove;
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(SEND_RETRY_DELAY);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e)
                    if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::BrokenPipe =>
                {
                    debug!(conn_id = %self.id, "Closing connection on peer hangup");
                    self.close();
                    return WriteOutcome::Remove;
                }
                Err(e) => {
                    info!(conn_id = %self.id, error = %e, "Error writing to connection");
                    self.close();
                    return WriteOutcome::Remove;
                }
            }
        }

        debug!(conn_id = %self.id, bytes = written, "Frame sent");
        WriteOutcome::Continue
    }

    /// Shut down both directions of the socket.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Post one disconnect notice to every reply sink and receiver, and to
    /// the reply sinks of `unsent` requests.
    pub fn notify_disconnect(&mut self, sink: &dyn EventSink, unsent: &[OutboundMessage]) {
        let extra = unsent
            .iter()
            .filter_map(OutboundMessage::reply_sink)
            .map(str::to_string);
        self.peer.notify_disconnect(self.id, sink, extra);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{loopback, read_until_settled};
    use super::*;
    use crate::rpc::queue::{QueueHub, RpcEvent};
    use crate::runtime::netstring::RemoveReason;
    use serde_json::Value;
    use std::io::Read;

    #[test]
    fn test_read_split_frame() {
        let (mut conn, mut remote) = loopback(1);
        assert_eq!(conn.read_phase(), ReadPhase::ReadingLength);

        remote.write_all(b"11:hello").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(conn.on_read_event(), ReadOutcome::Continue));
        assert_eq!(conn.read_phase(), ReadPhase::ReadingBody { len: 11 });

        remote.write_all(b" world,").unwrap();
        assert!(matches!(read_until_settled(&mut conn), ReadOutcome::Dispatch));
        assert_eq!(conn.frame(), Some(&b"hello world"[..]));

        conn.reset_read();
        assert!(!conn.has_frame());
        assert_eq!(conn.read_phase(), ReadPhase::ReadingLength);
    }

    #[test]
    fn test_read_eof_removes() {
        let (mut conn, remote) = loopback(2);
        drop(remote);
        assert!(matches!(
            read_until_settled(&mut conn),
            ReadOutcome::Remove(RemoveReason::Eof)
        ));
    }

    #[test]
    fn test_bad_terminator_removes() {
        let (mut conn, mut remote) = loopback(3);
        remote.write_all(b"7:{\"a\":1}x").unwrap();
        assert!(matches!(
            read_until_settled(&mut conn),
            ReadOutcome::Remove(RemoveReason::Framing(_))
        ));
    }

    #[test]
    fn test_write_frames_payload() {
        let (mut conn, mut remote) = loopback(4);
        assert!(conn.set_outbound(b"{\"x\":1}"));
        assert!(!conn.set_outbound(b"second"));
        assert!(conn.write_pending());

        assert_eq!(conn.write(), WriteOutcome::Continue);
        assert!(!conn.write_pending());

        let mut buf = [0u8; 10];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"7:{\"x\":1},");
    }

    #[test]
    fn test_write_without_pending_is_noop() {
        let (mut conn, _remote) = loopback(5);
        assert_eq!(conn.write(), WriteOutcome::Continue);
    }

    #[test]
    fn test_notify_disconnect() {
        let hub = QueueHub::new();
        let rx = hub.register("sink");
        let (mut conn, _remote) = loopback(6);
        conn.peer.expect_reply("1".into(), "sink".into(), Value::Null);

        conn.notify_disconnect(&hub, &[]);
        conn.notify_disconnect(&hub, &[]);

        assert_eq!(
            rx.try_recv().unwrap(),
            RpcEvent::Disconnect {
                connection_id: ConnectionId::from(6)
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connection_id_round_trip() {
        let id: ConnectionId = "42".parse().unwrap();
        assert_eq!(id, ConnectionId::from(42));
        assert_eq!(id.to_string(), "42");
        assert!("x".parse::<ConnectionId>().is_err());
    }
}
