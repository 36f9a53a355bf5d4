//! An event driven server where the emphasis is on non-blocking
//! operations and events instead of blocks and waits.
//!
//! The server thread owns the listening socket and the epoll loop; it
//! never reads or writes client sockets itself. Readiness is turned
//! into events for the reader and writer stages, and the connection
//! table here is the single place lifecycle transitions happen.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::config::Config;
use crate::connection::{ConnId, ConnState, Connection};
use crate::http::reader::{ReaderEvent, ReaderStage};
use crate::http::writer::{WriterEvent, WriterStage};

const LISTENER: Token = Token(0);

type CloseListener = Box<dyn Fn(ConnId) + Send + Sync>;

struct TableInner {
    conns: HashMap<u64, Arc<Connection>>,
    buckets: [HashSet<u64>; ConnState::COUNT],
}

/// The set of all connections, partitioned by lifecycle state.
///
/// The table owns every connection; stages resolve ids through
/// [`lookup`](ConnTable::lookup) and hold the `Arc` only for the
/// duration of one event. `set_state` is the only mutator of the
/// partitioning, and a connection is freed (dropped) exclusively by
/// the CLOSED sweep on the server thread.
pub struct ConnTable {
    registry: Registry,
    next_id: AtomicU64,
    inner: Mutex<TableInner>,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl ConnTable {
    pub fn new(registry: Registry) -> ConnTable {
        ConnTable {
            registry: registry,
            next_id: AtomicU64::new(0),
            inner: Mutex::new(TableInner {
                conns: HashMap::new(),
                buckets: Default::default(),
            }),
            close_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Resolve an id. Stale ids (freed connections) return `None`.
    pub fn lookup(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.lock_inner().conns.get(&id.0).cloned()
    }

    /// Resolve an id, filtering out connections already CLOSED.
    pub fn alive(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.lookup(id).filter(|c| c.is_alive())
    }

    pub fn count(&self) -> usize {
        self.lock_inner().conns.len()
    }

    /// Register a destruction listener; called exactly once per
    /// connection, after it leaves the table.
    pub fn on_close(&self, listener: CloseListener) {
        self.close_listeners.lock()
            .expect("close listeners poisoned")
            .push(listener);
    }

    pub(crate) fn insert(&self, mut stream: TcpStream, peer: SocketAddr)
        -> io::Result<Arc<Connection>>
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.register(&mut stream, Token(id as usize + 1),
                               Interest::READABLE | Interest::WRITABLE)?;
        let conn = Arc::new(Connection::new(ConnId(id), stream, peer));
        let mut inner = self.lock_inner();
        inner.conns.insert(id, conn.clone());
        inner.buckets[ConnState::Reading.bucket()].insert(id);
        Ok(conn)
    }

    /// Atomically move a connection between state buckets.
    ///
    /// On entering CLOSED the socket is removed from the multiplexer;
    /// the memory itself is reclaimed later by the sweep, once no
    /// stage holds a reference.
    pub fn set_state(&self, conn: &Connection, new_state: ConnState) {
        let id = conn.id();
        let mut inner = self.lock_inner();
        let old_state = conn.state();
        if old_state == new_state {
            return;
        }
        if old_state == ConnState::Closed {
            // closed is terminal
            return;
        }
        if !inner.buckets[old_state.bucket()].remove(&id.0) {
            warn!("connection {} not tracked in state {:?}", id, old_state);
            return;
        }
        conn.set_state_raw(new_state);
        inner.buckets[new_state.bucket()].insert(id.0);
        if new_state == ConnState::Closed {
            let fd = conn.stream().as_raw_fd();
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                debug!("epoll deregister failed for {}: {}", id, e);
            }
        }
        trace!("connection {}: {:?} -> {:?}", id, old_state, new_state);
    }

    /// Drop everything in the CLOSED bucket and fire the destruction
    /// listeners. Returns the number of connections freed.
    pub fn sweep_closed(&self) -> usize {
        let freed: Vec<Arc<Connection>> = {
            let mut inner = self.lock_inner();
            let ids: Vec<u64> = inner.buckets[ConnState::Closed.bucket()]
                .drain().collect();
            ids.iter()
                .filter_map(|id| inner.conns.remove(id))
                .collect()
        };
        let listeners = self.close_listeners.lock()
            .expect("close listeners poisoned");
        for conn in &freed {
            debug!("destroying connection {} ({})",
                   conn.id(), conn.peer_addr());
            for listener in listeners.iter() {
                listener(conn.id());
            }
        }
        freed.len()
    }

    /// Promote FINISHED connections to IDLE. Returns the ids that
    /// still have unread bytes and need a synthesised read event.
    pub fn promote_finished(&self) -> Vec<ConnId> {
        let promoted: Vec<Arc<Connection>> = {
            let inner = self.lock_inner();
            inner.buckets[ConnState::Finished.bucket()].iter()
                .filter_map(|id| inner.conns.get(id).cloned())
                .collect()
        };
        let mut need_read = Vec::new();
        for conn in promoted {
            self.set_state(&conn, ConnState::Idle);
            if !conn.data_consumed() {
                need_read.push(conn.id());
            }
        }
        need_read
    }

    /// Close and free every connection, marked or not.
    pub fn close_all(&self) {
        let all: Vec<Arc<Connection>> = {
            let inner = self.lock_inner();
            inner.conns.values().cloned().collect()
        };
        for conn in all {
            self.set_state(&conn, ConnState::Closed);
        }
        self.sweep_closed();
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<TableInner> {
        self.inner.lock().expect("connection table poisoned")
    }
}

/// Owns the listening socket and runs the edge-triggered accept loop.
pub struct Server {
    config: Config,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    conns: Arc<ConnTable>,
    reader: Arc<ReaderStage>,
    writer: Arc<WriterStage>,
    stopped: Arc<AtomicBool>,
}

impl Server {
    /// Create the poll instance and bind the listening socket; the
    /// returned table must be handed to the stages before `new`.
    pub fn bind(config: &Config)
        -> io::Result<(Poll, TcpListener, SocketAddr, Arc<ConnTable>)>
    {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let listener = bind_listener(config.port)?;
        let local_addr = listener.local_addr()?;
        let conns = Arc::new(ConnTable::new(registry));
        Ok((poll, listener, local_addr, conns))
    }

    pub fn new(config: Config, poll: Poll, listener: TcpListener,
               local_addr: SocketAddr, conns: Arc<ConnTable>,
               reader: Arc<ReaderStage>, writer: Arc<WriterStage>)
        -> Server
    {
        Server {
            config: config,
            poll: poll,
            listener: listener,
            local_addr: local_addr,
            conns: conns,
            reader: reader,
            writer: writer,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conns(&self) -> &Arc<ConnTable> {
        &self.conns
    }

    /// Flag shared with whoever needs to stop the loop; the loop
    /// notices within one poll timeout.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    /// Run the accept/readiness loop until stopped.
    pub fn run(&mut self) -> io::Result<()> {
        raise_nofile_limit(self.config.max_connections);
        ignore_sigpipe();
        self.poll.registry()
            .register(&mut self.listener, LISTENER, Interest::READABLE)?;
        info!("listening on {}", self.local_addr);

        let mut events = Events::with_capacity(self.config.max_events);
        while !self.stopped.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events,
                                 Some(self.config.poll_timeout))
            {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted =>
                    continue,
                Err(e) => {
                    error!("epoll wait failed: {}", e);
                    break;
                }
            }

            // deferred frees, then keep-alive promotion
            self.conns.sweep_closed();
            for id in self.conns.promote_finished() {
                self.reader.queue_event(ReaderEvent::ReadRequest(id));
            }

            for event in events.iter() {
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if event.token() == LISTENER {
                    self.accept_pending();
                } else {
                    self.dispatch(event);
                }
            }
        }

        info!("server loop exiting, closing {} connections",
              self.conns.count());
        self.conns.close_all();
        Ok(())
    }

    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = prepare_client_socket(&stream) {
                        warn!("client socket setup failed: {}", e);
                    }
                    match self.conns.insert(stream, peer) {
                        Ok(conn) => {
                            debug!("accepted {} from {}", conn.id(), peer);
                        }
                        Err(e) => {
                            error!("cannot register connection: {}", e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock =>
                    return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted =>
                    continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, event: &mio::event::Event) {
        let id = ConnId(event.token().0 as u64 - 1);
        let conn = match self.conns.lookup(id) {
            Some(conn) => conn,
            None => return,
        };
        let readable = event.is_readable();
        let writable = event.is_writable();
        let broken = event.is_error() ||
            (event.is_read_closed() && event.is_write_closed());
        if broken && !readable && !writable {
            // hangup or error with nothing left to move
            debug!("hangup on connection {}", id);
            self.conns.set_state(&conn, ConnState::Closed);
            return;
        }
        if !conn.is_alive() {
            return;
        }
        if readable {
            self.reader.queue_event(ReaderEvent::ReadRequest(id));
        }
        if writable {
            self.writer.queue_event(WriterEvent::WriteData { conn: id });
        }
    }
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM,
                             Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    apply_socket_options(&socket)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

fn prepare_client_socket(stream: &TcpStream) -> io::Result<()> {
    // mio streams come out of accept already non-blocking
    apply_socket_options(stream)
}

/// The option set carried by the listening socket and by every
/// accepted socket alike: SO_REUSEADDR, TCP_NODELAY, an abortive
/// SO_LINGER, TCP_DEFER_ACCEPT disabled.
fn apply_socket_options<S: AsRawFd>(socket: &S) -> io::Result<()> {
    use std::time::Duration;

    let sock = socket2::SockRef::from(socket);
    sock.set_reuse_address(true)?;
    sock.set_nodelay(true)?;
    sock.set_linger(Some(Duration::from_secs(0)))?;
    set_defer_accept(socket.as_raw_fd(), 0);
    Ok(())
}

fn set_defer_accept(fd: i32, seconds: libc::c_int) {
    let rc = unsafe {
        libc::setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT,
                         &seconds as *const _ as *const libc::c_void,
                         std::mem::size_of::<libc::c_int>() as
                             libc::socklen_t)
    };
    if rc != 0 {
        debug!("TCP_DEFER_ACCEPT not applied: {}",
               io::Error::last_os_error());
    }
}

fn raise_nofile_limit(limit: u64) {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if rc != 0 {
        // best effort, the previous limit stays
        debug!("setrlimit(RLIMIT_NOFILE, {}) failed: {}",
               limit, io::Error::last_os_error());
    }
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
