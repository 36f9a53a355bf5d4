//! The stage that asynchronously reads http requests off the socket.
//!
//! The assembler advances one character class at a time so a request
//! split across arbitrary read boundaries (down to one byte per read)
//! parses identically to one delivered whole.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use httparse;

use crate::connection::{ConnId, ConnState};
use crate::error::Error;
use crate::event::StageEvent;
use crate::http::body::BodyPart;
use crate::http::handler::{HandlerEvent, HandlerStage};
use crate::http::headers::is_chunked;
use crate::http::request::Request;
use crate::server::ConnTable;
use crate::stage::{Stage, StageHandler};

pub enum ReaderEvent {
    ReadRequest(ConnId),
}

impl StageEvent for ReaderEvent {}

pub type ReaderStage = Stage<ReaderCore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    FirstLine,
    Headers,
    Body,
    ChunkSize,
    ChunkBody,
    Trailers,
}

/// Incremental four-state request parser.
pub struct Assembler {
    conn: ConnId,
    state: ParseState,
    current_line: Vec<u8>,
    /// RFC 2616 line folding: a header accumulates here until a
    /// non-continuation line flushes it.
    pending_header: String,
    request: Option<Request>,
    body: Option<BodyPart>,
    body_size: u64,
    body_read: u64,
}

impl Assembler {
    pub fn new(conn: ConnId) -> Assembler {
        Assembler {
            conn: conn,
            state: ParseState::FirstLine,
            current_line: Vec::new(),
            pending_header: String::new(),
            request: None,
            body: None,
            body_size: 0,
            body_read: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = ParseState::FirstLine;
        self.current_line.clear();
        self.pending_header.clear();
        self.request = None;
        self.body = None;
        self.body_size = 0;
        self.body_read = 0;
    }

    /// Feed a window of bytes. Returns how many bytes were consumed
    /// and, possibly, a completed request. Parsing stops right after a
    /// request completes; pipelined bytes stay in the window.
    pub fn feed(&mut self, window: &[u8])
        -> (usize, Result<Option<Request>, Error>)
    {
        let mut pos = 0;
        loop {
            match self.state {
                ParseState::FirstLine | ParseState::Headers |
                ParseState::ChunkSize | ParseState::Trailers => {
                    let lf = window[pos..].iter()
                        .position(|&b| b == b'\n');
                    match lf {
                        Some(rel) => {
                            self.current_line
                                .extend_from_slice(&window[pos..pos + rel]);
                            pos += rel + 1;
                            if self.current_line.last() == Some(&b'\r') {
                                self.current_line.pop();
                            }
                            let line = String::from_utf8_lossy(
                                &self.current_line).into_owned();
                            self.current_line.clear();
                            match self.process_line(&line) {
                                Ok(None) => continue,
                                done => return (pos, done),
                            }
                        }
                        None => {
                            // no terminator yet; keep the partial line
                            self.current_line
                                .extend_from_slice(&window[pos..]);
                            return (window.len(), Ok(None));
                        }
                    }
                }
                ParseState::Body | ParseState::ChunkBody => {
                    let want = self.body_size - self.body_read;
                    let have = (window.len() - pos) as u64;
                    let take = want.min(have) as usize;
                    if take > 0 {
                        let body = self.body
                            .get_or_insert_with(|| BodyPart::raw(Vec::new()));
                        body.append(&window[pos..pos + take]);
                        pos += take;
                        self.body_read += take as u64;
                    }
                    if self.body_read < self.body_size {
                        // body consumes at most what was declared
                        return (pos, Ok(None));
                    }
                    if self.state == ParseState::Body {
                        return (pos, Ok(Some(self.complete())));
                    }
                    self.state = ParseState::ChunkSize;
                }
            }
        }
    }

    fn process_line(&mut self, line: &str)
        -> Result<Option<Request>, Error>
    {
        match self.state {
            ParseState::FirstLine => {
                if line.is_empty() {
                    // tolerate blank lines between pipelined requests
                    return Ok(None);
                }
                self.request =
                    Some(Request::from_first_line(self.conn, line)?);
                self.pending_header.clear();
                self.state = ParseState::Headers;
                Ok(None)
            }
            ParseState::Headers => {
                if !line.is_empty() &&
                    line.starts_with(|c| c == ' ' || c == '\t')
                {
                    // folded continuation, joined after a space
                    self.pending_header.push(' ');
                    self.pending_header.push_str(line.trim());
                    return Ok(None);
                }
                if !self.pending_header.is_empty() {
                    let header = std::mem::take(&mut self.pending_header);
                    self.request.as_mut()
                        .expect("headers without a request")
                        .headers.parse_line(&header)?;
                }
                if line.is_empty() {
                    self.end_of_headers()
                } else {
                    self.pending_header = line.to_string();
                    Ok(None)
                }
            }
            ParseState::ChunkSize => {
                if line.is_empty() {
                    // CRLF trailing the previous chunk's data
                    return Ok(None);
                }
                let mut sized = line.as_bytes().to_vec();
                sized.extend_from_slice(b"\r\n");
                match httparse::parse_chunk_size(&sized) {
                    Ok(httparse::Status::Complete((_, 0))) => {
                        self.state = ParseState::Trailers;
                        Ok(None)
                    }
                    Ok(httparse::Status::Complete((_, size))) => {
                        self.body_size = size;
                        self.body_read = 0;
                        self.state = ParseState::ChunkBody;
                        Ok(None)
                    }
                    Ok(httparse::Status::Partial) |
                    Err(_) => Err(Error::ChunkParseError(
                        httparse::InvalidChunkSize)),
                }
            }
            ParseState::Trailers => {
                if line.is_empty() {
                    Ok(Some(self.complete()))
                } else {
                    // trailer headers are consumed and discarded
                    Ok(None)
                }
            }
            ParseState::Body | ParseState::ChunkBody => {
                unreachable!("body states are handled bytewise")
            }
        }
    }

    fn end_of_headers(&mut self) -> Result<Option<Request>, Error> {
        self.body_size = 0;
        self.body_read = 0;
        let transfer_encoding = {
            let request = self.request.as_mut()
                .expect("end of headers without a request");
            request.take_host_header();
            request.headers.get("Transfer-Encoding")
                .map(|v| v.to_string())
        };
        if let Some(encoding) = transfer_encoding {
            if is_chunked(encoding.as_bytes()) {
                self.state = ParseState::ChunkSize;
                return Ok(None);
            }
            return Err(Error::UnsupportedTransferEncoding(encoding));
        }
        let length = self.request.as_ref()
            .expect("end of headers without a request")
            .content_length()?;
        if length == 0 {
            return Ok(Some(self.complete()));
        }
        self.body_size = length;
        self.state = ParseState::Body;
        Ok(None)
    }

    fn complete(&mut self) -> Request {
        let mut request = self.request.take()
            .expect("completing without a request");
        request.content = self.body.take();
        self.reset();
        request
    }
}

/// Shared logic of the reader stage's workers.
pub struct ReaderCore {
    conns: Arc<ConnTable>,
    handler: Arc<HandlerStage>,
    read_chunk: usize,
    states: Arc<Mutex<HashMap<ConnId, Arc<Mutex<Assembler>>>>>,
}

impl ReaderCore {
    pub fn new(conns: Arc<ConnTable>, handler: Arc<HandlerStage>,
               read_chunk: usize)
        -> ReaderCore
    {
        let states: Arc<Mutex<HashMap<ConnId, Arc<Mutex<Assembler>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let cleanup = states.clone();
        conns.on_close(Box::new(move |id| {
            cleanup.lock().expect("reader states poisoned").remove(&id);
        }));
        ReaderCore {
            conns: conns,
            handler: handler,
            read_chunk: read_chunk,
            states: states,
        }
    }

    fn assembler_for(&self, conn: ConnId) -> Arc<Mutex<Assembler>> {
        self.states.lock()
            .expect("reader states poisoned")
            .entry(conn)
            .or_insert_with(|| Arc::new(Mutex::new(Assembler::new(conn))))
            .clone()
    }

    fn on_read_request(&self, id: ConnId) {
        let conn = match self.conns.lookup(id) {
            Some(conn) => conn,
            None => return,
        };
        match conn.state() {
            ConnState::Idle => {
                self.conns.set_state(&conn, ConnState::Reading);
                self.assembler_for(id).lock()
                    .expect("assembler poisoned").reset();
            }
            ConnState::Reading => {}
            ConnState::Processing | ConnState::Writing |
            ConnState::Finished => {
                // the edge is consumed here; note the unread bytes so
                // the promotion sweep synthesises a fresh read event
                conn.set_data_consumed(false);
                return;
            }
            ConnState::PeerClosed | ConnState::Closed => return,
        }

        let shared = self.assembler_for(id);
        let mut assembler = shared.lock().expect("assembler poisoned");
        loop {
            let parsed = conn.with_window(|window| {
                assembler.feed(window)
            });
            match parsed {
                Err(e) => {
                    info!("request error on {}: {}", id, e);
                    self.conns.set_state(&conn, ConnState::Closed);
                    return;
                }
                Ok(Some(request)) => {
                    debug!("{} {} {} {}", id, request.method,
                           request.resource, request.version);
                    conn.set_data_consumed(false);
                    self.conns.set_state(&conn, ConnState::Processing);
                    // subsequent pipelined requests stay buffered
                    // until this one's response is finished
                    self.handler.queue_event(
                        HandlerEvent::RequestArrived {
                            conn: id,
                            request: Arc::new(request),
                        });
                    return;
                }
                Ok(None) => {}
            }
            match conn.refill(self.read_chunk) {
                Ok(0) => {
                    debug!("peer closed {}", id);
                    self.conns.set_state(&conn, ConnState::PeerClosed);
                    return;
                }
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    conn.set_data_consumed(true);
                    return;
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted =>
                        continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    debug!("connection reset on {}", id);
                    self.conns.set_state(&conn, ConnState::Closed);
                    return;
                }
                Err(e) => {
                    warn!("read failed on {}: {}", id, e);
                    return;
                }
            }
        }
    }
}

impl StageHandler for ReaderCore {
    type Event = ReaderEvent;

    fn handle(&self, event: ReaderEvent) {
        match event {
            ReaderEvent::ReadRequest(id) => self.on_read_request(id),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::connection::ConnId;
    use crate::error::Error;
    use crate::http::body::BodyKind;
    use crate::http::request::Request;
    use super::Assembler;

    fn feed_all(assembler: &mut Assembler, bytes: &[u8])
        -> Result<Option<Request>, Error>
    {
        let mut pos = 0;
        while pos < bytes.len() {
            let (consumed, result) = assembler.feed(&bytes[pos..]);
            pos += consumed;
            match result {
                Ok(None) => {
                    if consumed == 0 {
                        return Ok(None);
                    }
                }
                done => return done,
            }
        }
        Ok(None)
    }

    fn assembler() -> Assembler {
        Assembler::new(ConnId(1))
    }

    #[test]
    fn simple_request() {
        let mut a = assembler();
        let req = feed_all(&mut a,
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.resource, "/hello");
        assert_eq!(req.host, "x");
        assert!(req.content.is_none());
    }

    #[test]
    fn bare_lf_lines() {
        let mut a = assembler();
        let req = feed_all(&mut a, b"GET / HTTP/1.1\nHost: x\n\n")
            .unwrap().unwrap();
        assert_eq!(req.resource, "/");
        assert_eq!(req.headers.get("Host"), Some("x"));
    }

    #[test]
    fn byte_at_a_time_equals_single_read() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: a.example\r\n\
                    Content-Length: 5\r\n\r\nhello";
        let mut whole = assembler();
        let expected = feed_all(&mut whole, raw).unwrap().unwrap();

        let mut trickle = assembler();
        let mut got = None;
        for &byte in raw.iter() {
            let (consumed, result) = trickle.feed(&[byte]);
            assert_eq!(consumed, 1);
            if let Some(req) = result.unwrap() {
                got = Some(req);
            }
        }
        let got = got.expect("request did not complete bytewise");
        assert_eq!(got.method, expected.method);
        assert_eq!(got.resource, expected.resource);
        assert_eq!(got.content_bytes(), expected.content_bytes());
        assert_eq!(got.content_bytes(), Some(&b"hello"[..]));
    }

    #[test]
    fn folded_header_concatenates_after_space() {
        let mut a = assembler();
        let req = feed_all(&mut a,
            b"GET / HTTP/1.1\r\nX-Long: one\r\n two\r\n\tthree\r\n\
              Host: x\r\n\r\n")
            .unwrap().unwrap();
        assert_eq!(req.headers.get("X-Long"), Some("one two three"));
        assert_eq!(req.headers.get("Host"), Some("x"));
    }

    #[test]
    fn body_stops_at_declared_length() {
        let mut a = assembler();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET";
        let (consumed, result) = a.feed(raw);
        let req = result.unwrap().unwrap();
        assert_eq!(req.content_bytes(), Some(&b"body"[..]));
        // the trailing pipelined bytes were not consumed
        assert_eq!(consumed, raw.len() - 3);
    }

    #[test]
    fn pipelined_requests_parse_in_turn() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
                    GET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        let mut a = assembler();
        let (consumed, first) = a.feed(raw);
        let first = first.unwrap().unwrap();
        assert_eq!(first.resource, "/a");
        let (_, second) = a.feed(&raw[consumed..]);
        let second = second.unwrap().unwrap();
        assert_eq!(second.resource, "/b");
        assert!(second.headers.close_connection());
    }

    #[test]
    fn chunked_body_reassembles() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\n\
                    Transfer-Encoding: chunked\r\n\r\n\
                    4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut a = assembler();
        let req = feed_all(&mut a, raw).unwrap().unwrap();
        assert_eq!(req.content_bytes(), Some(&b"Wikipedia"[..]));
    }

    #[test]
    fn chunk_size_accepts_extensions() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5;ext=1\r\nhello\r\n0\r\n\r\n";
        let mut a = assembler();
        let req = feed_all(&mut a, raw).unwrap().unwrap();
        assert_eq!(req.content_bytes(), Some(&b"hello"[..]));
    }

    #[test]
    fn unknown_transfer_encoding_is_an_error() {
        let mut a = assembler();
        let result = feed_all(&mut a,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n");
        assert_matches!(result,
                        Err(Error::UnsupportedTransferEncoding(..)));
    }

    #[test]
    fn malformed_header_is_an_error() {
        let mut a = assembler();
        let result = feed_all(&mut a,
            b"GET / HTTP/1.1\r\nBad-Header no-colon\r\n\r\n");
        assert_matches!(result, Err(Error::BadHeader));
    }

    #[test]
    fn malformed_request_line_is_an_error() {
        let mut a = assembler();
        let result = feed_all(&mut a, b"NOT-HTTP\r\n");
        assert_matches!(result, Err(Error::BadRequestLine));
    }

    #[test]
    fn content_body_is_a_raw_part() {
        let mut a = assembler();
        let req = feed_all(&mut a,
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nok")
            .unwrap().unwrap();
        match req.content {
            Some(ref part) => assert_matches!(part.kind,
                                              BodyKind::Raw(..)),
            None => panic!("missing content body"),
        }
    }
}
