//! Module for transfer coding all output.
//!
//! Affects transfer-* framing but not content headers: when the
//! response says `Transfer-Encoding: chunked` each normal body part
//! becomes one chunk, and the terminating zero chunk goes out just
//! before the content-finished marker.

use std::sync::Arc;

use crate::http::body::{BodyKind, BodyPart};
use crate::http::headers::is_chunked;
use crate::http::module::{next_module_id, HttpModule, ModuleCtx};

pub struct TransferModule {
    id: usize,
    next: Arc<dyn HttpModule>,
}

impl TransferModule {
    pub fn new(next: Arc<dyn HttpModule>) -> TransferModule {
        TransferModule {
            id: next_module_id(),
            next: next,
        }
    }

    fn handle_part(&self, ctx: &ModuleCtx, part: BodyPart) {
        let chunked = ctx.request()
            .and_then(|request| {
                request.response.header("Transfer-Encoding")
            })
            .map(|value| is_chunked(value.as_bytes()))
            .unwrap_or(false);
        if !chunked {
            ctx.send_output(self.id, &self.next, Some(part));
            return;
        }
        match part.kind {
            BodyKind::ContentFinished | BodyKind::CloseConnection => {
                ctx.send_output(self.id, &self.next,
                                Some(BodyPart::raw(&b"0\r\n\r\n"[..])));
                ctx.send_output(self.id, &self.next, Some(part));
            }
            BodyKind::OpenSubMessage(..) | BodyKind::CloseSubMessage => {
                // control parts pass through unchanged
                ctx.send_output(self.id, &self.next, Some(part));
            }
            BodyKind::Raw(data) => {
                ctx.send_output(self.id, &self.next,
                                Some(chunk_wrap(data)));
            }
            BodyKind::Lazy(producer) => {
                // the chunk header needs the size up front
                ctx.send_output(self.id, &self.next,
                                Some(chunk_wrap(producer())));
            }
            BodyKind::File { path, size } => {
                // frame the file between a size line and a chunk end
                // so the writer can still stream it
                let head = format!("{:x}\r\n", size).into_bytes();
                ctx.send_output(self.id, &self.next,
                                Some(BodyPart::raw(head)));
                ctx.send_output(self.id, &self.next, Some(BodyPart {
                    index: 0,
                    kind: BodyKind::File { path: path, size: size },
                }));
                ctx.send_output(self.id, &self.next,
                                Some(BodyPart::raw(&b"\r\n"[..])));
            }
        }
    }
}

fn chunk_wrap(data: Vec<u8>) -> BodyPart {
    let mut part = BodyPart::raw(data);
    let head = format!("{:x}\r\n", part.size());
    part.prepend(head.as_bytes());
    part.append(b"\r\n");
    part
}

impl HttpModule for TransferModule {
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
            None => ctx.send_output(self.id, &self.next, None),
        }
    }
}
