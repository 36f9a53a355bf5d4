//! Module for content framing of all output.
//!
//! In single-part mode this sets (or corrects) the Content-Length
//! header to match the body part. In multipart mode it maintains the
//! stack of open boundaries, prefixes every part with its boundary
//! fragment and emits the terminators when sub-messages close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::ConnId;
use crate::http::body::{BodyKind, BodyPart};
use crate::http::module::{next_module_id, HttpModule, ModuleCtx};

pub struct ContentModule {
    id: usize,
    next: Arc<dyn HttpModule>,
    /// Open multipart boundaries per connection; the top of the stack
    /// frames the next part. Survives across events so a retained
    /// Comet response keeps its boundary until the connection dies.
    boundaries: Mutex<HashMap<ConnId, Vec<String>>>,
}

impl ContentModule {
    pub fn new(next: Arc<dyn HttpModule>) -> ContentModule {
        ContentModule {
            id: next_module_id(),
            next: next,
            boundaries: Mutex::new(HashMap::new()),
        }
    }

    fn push_boundary(&self, conn: ConnId, boundary: String) {
        self.lock_boundaries()
            .entry(conn)
            .or_default()
            .push(boundary);
    }

    fn pop_boundary(&self, conn: ConnId) -> Option<String> {
        self.lock_boundaries()
            .get_mut(&conn)
            .and_then(|stack| stack.pop())
    }

    fn current_boundary(&self, conn: ConnId) -> Option<String> {
        self.lock_boundaries()
            .get(&conn)
            .and_then(|stack| stack.last().cloned())
    }

    fn drain_boundaries(&self, conn: ConnId) -> Vec<String> {
        self.lock_boundaries()
            .get_mut(&conn)
            .map(|stack| stack.split_off(0))
            .unwrap_or_default()
    }

    fn lock_boundaries(&self)
        -> std::sync::MutexGuard<HashMap<ConnId, Vec<String>>>
    {
        self.boundaries.lock().expect("boundary stack poisoned")
    }

    fn handle_part(&self, ctx: &ModuleCtx, part: BodyPart) {
        let request = match ctx.request() {
            Some(request) => request,
            None => return,
        };
        let response = &request.response;
        match part.kind {
            BodyKind::OpenSubMessage(boundary) => {
                if !response.is_multipart() {
                    warn!("sub-message opened on a single-part \
                           response {}", ctx.conn);
                }
                self.push_boundary(ctx.conn, boundary);
                // the control part is consumed here
            }
            BodyKind::CloseSubMessage => {
                match self.pop_boundary(ctx.conn) {
                    Some(boundary) => {
                        let closer = format!("\r\n--{}--", boundary);
                        ctx.send_output(self.id, &self.next,
                                        Some(BodyPart::raw(closer)));
                    }
                    // no open boundary, nothing to close
                    None => {}
                }
            }
            BodyKind::ContentFinished | BodyKind::CloseConnection => {
                let open = self.drain_boundaries(ctx.conn);
                if !open.is_empty() {
                    let mut closer = Vec::new();
                    // innermost sub-message terminates first
                    for boundary in open.iter().rev() {
                        closer.extend_from_slice(
                            format!("\r\n--{}--", boundary).as_bytes());
                    }
                    ctx.send_output(self.id, &self.next,
                                    Some(BodyPart::raw(closer)));
                }
                ctx.send_output(self.id, &self.next,
                                Some(BodyPart::control(part.kind)));
            }
            kind => {
                let mut part = BodyPart { index: part.index, kind: kind };
                if response.is_multipart() {
                    match self.current_boundary(ctx.conn) {
                        Some(boundary) => {
                            let head = format!(
                                "\r\n--{}\r\nContent-Length: {}\r\n\r\n",
                                boundary, part.size());
                            match part.kind {
                                BodyKind::Raw(..) =>
                                    part.prepend(head.as_bytes()),
                                _ => {
                                    // only raw parts can be framed
                                    // inside a sub-message
                                    warn!("non-raw part in multipart \
                                           response {}", ctx.conn);
                                }
                            }
                        }
                        None => {
                            warn!("multipart response {} without an \
                                   open boundary", ctx.conn);
                        }
                    }
                } else {
                    let size = part.size();
                    if size > 0 {
                        let declared = response.header("Content-Length")
                            .and_then(|v| v.parse::<u64>().ok());
                        if declared != Some(size) {
                            response.with_headers(
                                |h| h.set_uint("Content-Length", size));
                        }
                    }
                }
                ctx.send_output(self.id, &self.next, Some(part));
            }
        }
    }
}

impl HttpModule for ContentModule {
    fn module_id(&self) -> usize {
        self.id
    }

    fn next_module(&self) -> Option<&Arc<dyn HttpModule>> {
        Some(&self.next)
    }

    fn process_output(&self, ctx: &ModuleCtx, body: Option<BodyPart>) {
        match body {
            Some(part) => {
                ctx.drain_in_order(self.id, Some(part),
                                   |part| self.handle_part(ctx, part));
            }
            // can't ignore a request to process output
            None => ctx.send_output(self.id, &self.next, None),
        }
    }

    fn connection_closed(&self, conn: ConnId) {
        self.lock_boundaries().remove(&conn);
    }
}
