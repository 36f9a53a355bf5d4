//! A stage that writes responses to the socket. Modules don't care
//! about this: when a chain runs out of modules, the terminal
//! [`WriterModule`] hands the ordered parts over to this stage.
//!
//! Writes are fully asynchronous: a partial write leaves the rest in
//! the pending buffer and the stage resumes at the exact offset on the
//! next write-readiness event.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

use netbuf::Buf;

use crate::connection::{ConnId, ConnState, Connection};
use crate::event::StageEvent;
use crate::http::body::{BodyKind, BodyPart, BodyPartQueue};
use crate::http::headers::is_chunked;
use crate::http::module::{next_module_id, HttpModule, ModuleCtx};
use crate::http::request::Request;
use crate::server::ConnTable;
use crate::stage::{Stage, StageHandler};

const FILE_SLICE: usize = 32 * 1024;

pub enum WriterEvent {
    /// An ordered body part for the connection's current response.
    WriteBodyPart { conn: ConnId, request: Arc<Request>,
                    part: BodyPart },
    /// The socket became writable again.
    WriteData { conn: ConnId },
}

impl StageEvent for WriterEvent {}

pub type WriterStage = Stage<WriterCore>;

struct FileStream {
    file: fs::File,
    remaining: u64,
}

struct WriterState {
    request: Option<Arc<Request>>,
    next_expected: u64,
    queue: BodyPartQueue,
    pending: Buf,
    file: Option<FileStream>,
    headers_written: bool,
}

impl Default for WriterState {
    fn default() -> WriterState {
        WriterState {
            request: None,
            next_expected: 0,
            queue: BodyPartQueue::new(),
            pending: Buf::new(),
            file: None,
            headers_written: false,
        }
    }
}

enum Flush {
    Done,
    WouldBlock,
    Broken,
}

/// Shared logic of the writer stage's workers.
pub struct WriterCore {
    conns: Arc<ConnTable>,
    states: Arc<Mutex<HashMap<ConnId, Arc<Mutex<WriterState>>>>>,
}

impl WriterCore {
    pub fn new(conns: Arc<ConnTable>) -> WriterCore {
        let states: Arc<Mutex<HashMap<ConnId, Arc<Mutex<WriterState>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let cleanup = states.clone();
        conns.on_close(Box::new(move |id| {
            cleanup.lock().expect("writer states poisoned").remove(&id);
        }));
        WriterCore {
            conns: conns,
            states: states,
        }
    }

    fn state_for(&self, conn: ConnId) -> Arc<Mutex<WriterState>> {
        self.states.lock()
            .expect("writer states poisoned")
            .entry(conn)
            .or_default()
            .clone()
    }

    fn existing_state(&self, conn: ConnId)
        -> Option<Arc<Mutex<WriterState>>>
    {
        self.states.lock()
            .expect("writer states poisoned")
            .get(&conn)
            .cloned()
    }

    fn on_body_part(&self, conn: ConnId, request: Arc<Request>,
                    part: BodyPart)
    {
        let conn = match self.conns.alive(conn) {
            Some(conn) => conn,
            None => return,
        };
        let shared = self.state_for(conn.id());
        let mut state = shared.lock().expect("writer state poisoned");
        if state.request.is_none() {
            state.request = Some(request);
        }
        state.queue.push(part);
        self.resume(&conn, &mut state);
    }

    fn on_writable(&self, conn: ConnId) {
        let conn = match self.conns.alive(conn) {
            Some(conn) => conn,
            None => return,
        };
        let shared = match self.existing_state(conn.id()) {
            Some(shared) => shared,
            None => return,
        };
        let mut state = shared.lock().expect("writer state poisoned");
        self.resume(&conn, &mut state);
    }

    /// Drive the state machine: flush pending bytes, refill from an
    /// in-flight file, then take the next in-sequence part.
    fn resume(&self, conn: &Arc<Connection>, state: &mut WriterState) {
        loop {
            match self.flush_pending(conn, state) {
                Flush::Done => {}
                Flush::WouldBlock => return,
                Flush::Broken => {
                    self.conns.set_state(conn, ConnState::Closed);
                    return;
                }
            }

            if let Some(ref mut stream) = state.file {
                if stream.remaining > 0 {
                    let want = (stream.remaining as usize).min(FILE_SLICE);
                    let mut slice = vec![0u8; want];
                    match stream.file.read(&mut slice) {
                        Ok(0) => {
                            warn!("file shrank while streaming to {}",
                                  conn.id());
                            stream.remaining = 0;
                        }
                        Ok(n) => {
                            stream.remaining -= n as u64;
                            state.pending.extend(&slice[..n]);
                        }
                        Err(ref e)
                            if e.kind() == io::ErrorKind::Interrupted =>
                        {}
                        Err(e) => {
                            warn!("file read failed for {}: {}",
                                  conn.id(), e);
                            self.conns.set_state(conn, ConnState::Closed);
                            return;
                        }
                    }
                }
                if state.file.as_ref()
                    .map(|s| s.remaining == 0)
                    .unwrap_or(false)
                {
                    state.file = None;
                }
                continue;
            }

            let part = match state.queue.pop_if(state.next_expected) {
                Some(part) => {
                    state.next_expected += 1;
                    part
                }
                None => return,
            };

            if !state.headers_written {
                self.write_head(state);
            }

            match part.kind {
                BodyKind::Raw(data) => {
                    state.pending.extend(&data);
                }
                BodyKind::Lazy(producer) => {
                    let data = producer();
                    state.pending.extend(&data);
                }
                BodyKind::File { path, size } => {
                    match fs::File::open(&path) {
                        Ok(file) => {
                            state.file = Some(FileStream {
                                file: file,
                                remaining: size,
                            });
                        }
                        Err(e) => {
                            warn!("cannot open {:?} for {}: {}",
                                  path, conn.id(), e);
                            self.conns.set_state(conn, ConnState::Closed);
                            return;
                        }
                    }
                }
                BodyKind::ContentFinished => {
                    if self.finish_request(conn, state) {
                        return;
                    }
                }
                BodyKind::CloseConnection => {
                    state.request = None;
                    state.next_expected = 0;
                    state.headers_written = false;
                    self.conns.set_state(conn, ConnState::Closed);
                    return;
                }
                BodyKind::OpenSubMessage(..) |
                BodyKind::CloseSubMessage => {
                    warn!("framing control part reached the writer \
                           for {}", conn.id());
                }
            }
        }
    }

    fn flush_pending(&self, conn: &Arc<Connection>,
                     state: &mut WriterState)
        -> Flush
    {
        while state.pending.len() > 0 {
            if !conn.is_alive() {
                return Flush::Broken;
            }
            match conn.send(&state.pending[..]) {
                Ok(0) => return Flush::Broken,
                Ok(n) => state.pending.consume(n),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock =>
                        return Flush::WouldBlock,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e)
                    if e.kind() == io::ErrorKind::BrokenPipe ||
                       e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    debug!("peer dropped {} mid-write", conn.id());
                    return Flush::Broken;
                }
                Err(e) => {
                    warn!("send failed on {}: {}", conn.id(), e);
                    return Flush::Broken;
                }
            }
        }
        Flush::Done
    }

    /// Serialise status line and headers; the header table locks as
    /// the first byte is produced.
    fn write_head(&self, state: &mut WriterState) {
        let request = match state.request {
            Some(ref request) => request.clone(),
            None => return,
        };
        let response = &request.response;
        let chunked = response.header("Transfer-Encoding")
            .map(|value| is_chunked(value.as_bytes()))
            .unwrap_or(false);
        if chunked {
            response.with_headers(|h| {
                h.remove("Content-Length");
            });
        }
        response.lock_headers();
        if let Some(conn) = self.conns.alive(request.conn) {
            if conn.state() == ConnState::Processing {
                self.conns.set_state(&conn, ConnState::Writing);
            }
        }
        let mut head = Vec::new();
        response.serialize_head(&mut head);
        state.pending.extend(&head);
        state.headers_written = true;
    }

    /// Returns true when the connection was closed outright.
    fn finish_request(&self, conn: &Arc<Connection>,
                      state: &mut WriterState)
        -> bool
    {
        let request = state.request.take();
        state.next_expected = 0;
        state.headers_written = false;
        let close = request
            .map(|r| r.headers.close_connection())
            .unwrap_or(true);
        let peer_gone = matches!(conn.state(),
                                 ConnState::PeerClosed |
                                 ConnState::Closed);
        if close || peer_gone {
            debug!("closing {} after response", conn.id());
            self.conns.set_state(conn, ConnState::Closed);
            true
        } else {
            // the server promotes FINISHED connections back to IDLE
            self.conns.set_state(conn, ConnState::Finished);
            false
        }
    }
}

impl StageHandler for WriterCore {
    type Event = WriterEvent;

    fn handle(&self, event: WriterEvent) {
        match event {
            WriterEvent::WriteBodyPart { conn, request, part } => {
                self.on_body_part(conn, request, part);
            }
            WriterEvent::WriteData { conn } => {
                self.on_writable(conn);
            }
        }
    }
}

/// Terminal chain module: re-stamps parts densely and forwards them to
/// the writer stage. This MUST be the last module in a chain.
pub struct WriterModule {
    id: usize,
}

impl WriterModule {
    pub fn new() -> WriterModule {
        WriterModule { id: next_module_id() }
    }
}

impl HttpModule for WriterModule {
    fn module_id(&self) -> usize {
        self.id
    }

    fn process_output(&self, ctx: &ModuleCtx, body: Option<BodyPart>) {
        let part = match body {
            Some(part) => part,
            // nothing to write yet
            None => return,
        };
        ctx.drain_in_order(self.id, Some(part), |mut part| {
            if let Some(request) = ctx.request() {
                ctx.stamp(self.id, &mut part);
                ctx.write_part(&request, part);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::connection::{ConnState, Connection};
    use crate::http::body::{BodyKind, BodyPart};
    use crate::http::request::Request;
    use crate::server::ConnTable;
    use super::WriterCore;

    fn socket_pair(conns: &ConnTable)
        -> (std::net::TcpStream, Arc<Connection>)
    {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client =
            std::net::TcpStream::connect(listener.local_addr().unwrap())
                .unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(accepted);
        let conn = conns.insert(stream, peer).unwrap();
        (client, conn)
    }

    #[test]
    fn partial_writes_resume_at_the_exact_offset() {
        let poll = mio::Poll::new().unwrap();
        let conns = Arc::new(
            ConnTable::new(poll.registry().try_clone().unwrap()));
        let core = WriterCore::new(conns.clone());
        let (mut client, conn) = socket_pair(&conns);
        client.set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        // a body far bigger than the socket buffers, so the first
        // flush is guaranteed to hit EAGAIN part way through
        let payload: Vec<u8> = (0..8 * 1024 * 1024u32)
            .map(|i| (i % 251) as u8)
            .collect();
        let request = Arc::new(
            Request::from_first_line(conn.id(), "GET /big HTTP/1.1")
                .unwrap());
        request.response.with_headers(|h| {
            h.set_uint("Content-Length", payload.len() as u64);
        });

        let mut body = BodyPart::raw(payload.clone());
        body.index = 0;
        core.on_body_part(conn.id(), request.clone(), body);
        let mut fin = BodyPart::control(BodyKind::ContentFinished);
        fin.index = 1;
        core.on_body_part(conn.id(), request.clone(), fin);

        // headers were locked on the first byte, so this reproduces
        // the exact head the writer emitted
        let mut expected = Vec::new();
        request.response.serialize_head(&mut expected);
        expected.extend_from_slice(&payload);

        let mut received = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        while received.len() < expected.len() {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "socket closed early");
            received.extend_from_slice(&chunk[..n]);
            // the socket drained; pretend EPOLLOUT fired
            core.on_writable(conn.id());
        }
        assert_eq!(received.len(), expected.len());
        assert!(received == expected, "byte streams diverge");
        assert_eq!(conn.state(), ConnState::Finished);
    }

    #[test]
    fn close_header_tears_the_connection_down() {
        let poll = mio::Poll::new().unwrap();
        let conns = Arc::new(
            ConnTable::new(poll.registry().try_clone().unwrap()));
        let core = WriterCore::new(conns.clone());
        let (mut client, conn) = socket_pair(&conns);
        client.set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        let mut request =
            Request::from_first_line(conn.id(), "GET /bye HTTP/1.1")
                .unwrap();
        request.headers.parse_line("Connection: close").unwrap();
        let request = Arc::new(request);
        request.response.with_headers(|h| {
            h.set_uint("Content-Length", 2);
        });

        let mut body = BodyPart::raw(b"ok".to_vec());
        body.index = 0;
        core.on_body_part(conn.id(), request.clone(), body);
        let mut fin = BodyPart::control(BodyKind::ContentFinished);
        fin.index = 1;
        core.on_body_part(conn.id(), request, fin);

        assert_eq!(conn.state(), ConnState::Closed);
        // the sweep drops the connection, closing the socket
        conns.sweep_closed();
        let mut buf = Vec::new();
        // response fully flushed before the close
        client.read_to_end(&mut buf).ok();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.ends_with("ok"));
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}
