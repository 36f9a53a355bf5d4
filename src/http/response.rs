//! A http response object.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::enums::{Status, Version};
use crate::http::body::{BodyKind, BodyPart};
use crate::http::headers::HeaderTable;

struct Inner {
    version: Version,
    code: u16,
    message: String,
    headers: HeaderTable,
}

/// The response owned by a [`Request`](crate::http::Request).
///
/// Responses are mutated by modules on handler workers while the
/// writer serialises earlier parts, so status and headers live behind
/// one mutex. Header mutation after the writer locks the table is
/// silently dropped.
pub struct Response {
    inner: Mutex<Inner>,
    next_index: AtomicU64,
}

impl Response {
    pub fn new() -> Response {
        Response {
            inner: Mutex::new(Inner {
                version: Version::Http11,
                code: 200,
                message: "OK".to_string(),
                headers: HeaderTable::new(),
            }),
            next_index: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> Version {
        self.lock_inner().version
    }

    pub fn status(&self) -> (u16, String) {
        let inner = self.lock_inner();
        (inner.code, inner.message.clone())
    }

    /// Set status code and message; dropped once headers are locked.
    pub fn set_status(&self, code: u16, message: &str) {
        let mut inner = self.lock_inner();
        if inner.headers.is_locked() {
            return;
        }
        inner.code = code;
        inner.message = message.to_string();
    }

    pub fn set_status_std(&self, status: Status) {
        self.set_status(status.code(), status.reason());
    }

    /// Run `f` against the header table.
    pub fn with_headers<R>(&self, f: impl FnOnce(&mut HeaderTable) -> R)
        -> R
    {
        f(&mut self.lock_inner().headers)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.lock_inner().headers.get(name).map(|v| v.to_string())
    }

    pub fn lock_headers(&self) {
        self.lock_inner().headers.lock();
    }

    pub fn headers_locked(&self) -> bool {
        self.lock_inner().headers.is_locked()
    }

    /// Derived from Content-Type.
    pub fn is_multipart(&self) -> bool {
        self.header("Content-Type")
            .map(|v| v.to_ascii_lowercase().contains("multipart"))
            .unwrap_or(false)
    }

    /// Make a body part stamped with the response's monotonic index.
    ///
    /// Modules re-stamp parts with their own counter as they forward
    /// them, so gaps never appear downstream even when modules are
    /// merged or elided.
    pub fn new_part(&self, kind: BodyKind) -> BodyPart {
        BodyPart {
            index: self.next_index.fetch_add(1, Ordering::SeqCst),
            kind: kind,
        }
    }

    pub fn parts_created(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Serialise the status line and headers (with the blank line).
    pub fn serialize_head(&self, out: &mut Vec<u8>) {
        let inner = self.lock_inner();
        out.extend_from_slice(
            format!("{} {} {}\r\n",
                    inner.version, inner.code, inner.message).as_bytes());
        inner.headers.write_to(out);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<Inner> {
        self.inner.lock().expect("response poisoned")
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("Response")
            .field("code", &inner.code)
            .field("message", &inner.message)
            .field("headers", &inner.headers)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use crate::enums::{Status, Version};
    use crate::http::body::BodyKind;
    use crate::http::headers::HeaderTable;
    use super::Response;

    #[test]
    fn defaults_to_200_ok() {
        let r = Response::new();
        assert_eq!(r.status(), (200, "OK".to_string()));
        assert_eq!(r.version(), Version::Http11);
    }

    #[test]
    fn status_frozen_after_lock() {
        let r = Response::new();
        r.set_status_std(Status::NotFound);
        assert_eq!(r.status().0, 404);
        r.lock_headers();
        r.set_status(500, "Broken");
        assert_eq!(r.status(), (404, "Not Found".to_string()));
        assert!(r.headers_locked());
    }

    #[test]
    fn multipart_flag_follows_content_type() {
        let r = Response::new();
        assert!(!r.is_multipart());
        r.with_headers(|h| h.set("Content-Type", "text/html"));
        assert!(!r.is_multipart());
        r.with_headers(|h| {
            h.set("Content-Type",
                  "multipart/x-mixed-replace;boundary=\"b\"")
        });
        assert!(r.is_multipart());
    }

    #[test]
    fn parts_get_monotonic_indices() {
        let r = Response::new();
        let a = r.new_part(BodyKind::Raw(Vec::new()));
        let b = r.new_part(BodyKind::ContentFinished);
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(r.parts_created(), 2);
    }

    // round-trip: parse(serialize(response)) == response
    fn parse_head(bytes: &[u8]) -> (u16, String, HeaderTable) {
        let text = std::str::from_utf8(bytes).unwrap();
        let mut lines = text.split("\r\n");
        let status = lines.next().unwrap();
        let mut words = status.splitn(3, ' ');
        assert_eq!(words.next().unwrap(), "HTTP/1.1");
        let code = words.next().unwrap().parse().unwrap();
        let message = words.next().unwrap().to_string();
        let mut headers = HeaderTable::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            headers.parse_line(line).unwrap();
        }
        (code, message, headers)
    }

    #[test]
    fn head_round_trips() {
        let r = Response::new();
        r.set_status(404, "Not Found");
        r.with_headers(|h| {
            h.set("Content-Type", "text/text");
            h.set_uint("Content-Length", 11);
        });
        let mut out = Vec::new();
        r.serialize_head(&mut out);
        let (code, message, headers) = parse_head(&out);
        assert_eq!(code, 404);
        assert_eq!(message, "Not Found");
        assert_eq!(headers.get("Content-Type"), Some("text/text"));
        assert_eq!(headers.get("Content-Length"), Some("11"));
    }
}
