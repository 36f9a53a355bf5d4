//! A connection in the event driven server.
//!
//! Connections are owned exclusively by the server's connection table;
//! stages refer to them by [`ConnId`] and resolve the id when an event
//! is popped. A stale id simply fails the lookup, so events addressed
//! to a dead connection are discarded on dequeue.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use mio::net::TcpStream;
use netbuf::Buf;

/// Process-unique connection id. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle states of a connection.
///
/// ```text
///     new                        keep-alive
///      |                         +--------+
///      v                         |        |
///   READING -> PROCESSING -> WRITING -> FINISHED -> IDLE
///      |            |            |                    |
///      +-------> PEER_CLOSED ----+-------> CLOSED <---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Processing,
    Writing,
    Finished,
    Idle,
    PeerClosed,
    Closed,
}

impl ConnState {
    /// Number of states, used to size the server's state buckets.
    pub const COUNT: usize = 7;

    pub fn bucket(&self) -> usize {
        *self as usize
    }

    fn from_u8(v: u8) -> ConnState {
        use self::ConnState::*;
        match v {
            0 => Reading,
            1 => Processing,
            2 => Writing,
            3 => Finished,
            4 => Idle,
            5 => PeerClosed,
            _ => Closed,
        }
    }
}

/// Per-client object holding the socket, lifecycle state and the
/// reader's refill buffer.
pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    created: Instant,
    state: AtomicU8,
    data_consumed: AtomicBool,
    recv: Mutex<Buf>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, stream: TcpStream, peer: SocketAddr)
        -> Connection
    {
        Connection {
            id: id,
            stream: stream,
            peer: peer,
            created: Instant::now(),
            state: AtomicU8::new(ConnState::Reading as u8),
            data_consumed: AtomicBool::new(false),
            recv: Mutex::new(Buf::new()),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Direct state write; only the server's connection table calls
    /// this, under its own lock.
    pub(crate) fn set_state_raw(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.state() != ConnState::Closed
    }

    /// True iff a non-blocking read hit EAGAIN since the last
    /// successful parse: the socket is drained and the next read
    /// readiness event is the only way more bytes can appear.
    pub fn data_consumed(&self) -> bool {
        self.data_consumed.load(Ordering::SeqCst)
    }

    pub fn set_data_consumed(&self, v: bool) {
        self.data_consumed.store(v, Ordering::SeqCst);
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Pull up to `max` bytes off the socket into the receive window.
    pub fn refill(&self, max: usize) -> io::Result<usize> {
        let mut chunk = vec![0u8; max];
        let n = (&self.stream).read(&mut chunk)?;
        if n > 0 {
            let mut buf = self.recv.lock().expect("recv buffer poisoned");
            buf.extend(&chunk[..n]);
        }
        Ok(n)
    }

    /// Run `f` over the buffered receive window and consume the number
    /// of bytes it reports as parsed.
    pub fn with_window<R>(&self, f: impl FnOnce(&[u8]) -> (usize, R)) -> R {
        let mut buf = self.recv.lock().expect("recv buffer poisoned");
        let (parsed, out) = f(&buf[..]);
        if parsed > 0 {
            buf.consume(parsed);
        }
        out
    }

    pub fn window_len(&self) -> usize {
        let buf = self.recv.lock().expect("recv buffer poisoned");
        buf.len()
    }

    /// Write part of `data` to the socket. Returns the number of bytes
    /// accepted by the kernel.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        (&self.stream).write(data)
    }

}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
