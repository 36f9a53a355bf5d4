//! All things http headers.

use crate::error::Error;

/// Mapping from case-insensitive header name to value, preserving
/// insertion order.
///
/// Once `lock()`ed, every mutation is silently dropped; headers of a
/// response lock when the first byte of the status line hits the
/// socket. The table notes `Connection: close` as values are inserted.
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    headers: Vec<(String, String)>,
    locked: bool,
    close_connection: bool,
}

impl HeaderTable {
    pub fn new() -> HeaderTable {
        HeaderTable {
            headers: Vec::new(),
            locked: false,
            close_connection: false,
        }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|&(ref n, ref v)| (&n[..], &v[..]))
    }

    pub fn has(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| &self.headers[i].1[..])
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers.iter()
            .position(|&(ref n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Set a header, replacing any previous value.
    pub fn set(&mut self, name: &str, value: &str) {
        if self.locked {
            return;
        }
        self.note(name, value);
        match self.position(name) {
            Some(i) => self.headers[i].1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Set a header; a repeated name gets the value comma-joined onto
    /// the existing one.
    pub fn add(&mut self, name: &str, value: &str) {
        if self.locked {
            return;
        }
        self.note(name, value);
        match self.position(name) {
            Some(i) => {
                let joined = format!("{},{}", self.headers[i].1, value);
                self.headers[i].1 = joined;
            }
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.set(name, if value { "true" } else { "false" });
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.set(name, &value.to_string());
    }

    pub fn set_uint(&mut self, name: &str, value: u64) {
        self.set(name, &value.to_string());
    }

    pub fn set_double(&mut self, name: &str, value: f64) {
        self.set(name, &value.to_string());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        if self.locked {
            return None;
        }
        self.position(name).map(|i| self.headers.remove(i).1)
    }

    /// Freeze the table; all further mutations are dropped.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// True once a `Connection: close` value has been inserted.
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    fn note(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("Connection") &&
            is_close(value.as_bytes())
        {
            self.close_connection = true;
        }
    }

    /// Parse a `Name: value` line and insert it (repeats comma-join).
    pub fn parse_line(&mut self, line: &str) -> Result<(), Error> {
        let colon = line.find(':').ok_or(Error::BadHeader)?;
        let name = line[..colon].trim();
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(Error::BadHeader);
        }
        let value = line[colon + 1..].trim();
        self.add(name, value);
        Ok(())
    }

    /// Serialise every header line plus the terminating blank line.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for &(ref name, ref value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

fn is_token_char(c: u8) -> bool {
    match c {
        0..=31 | 127 => false,
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' |
        b'"' | b'/' | b'[' | b']' | b'?' | b'=' | b'{' | b'}' | b' ' |
        b'\t' => false,
        _ => true,
    }
}

// header value is a byte sequence: case insensitive comparison with
// surrounding whitespace stripped
pub fn is_close(val: &[u8]) -> bool {
    token_matches(val, b"close")
}

pub fn is_chunked(val: &[u8]) -> bool {
    token_matches(val, b"chunked")
}

fn is_lws(c: u8) -> bool {
    matches!(c, b'\r' | b'\n' | b' ' | b'\t')
}

fn token_matches(val: &[u8], token: &[u8]) -> bool {
    let start = val.iter().position(|&c| !is_lws(c)).unwrap_or(val.len());
    let rest = &val[start..];
    let end = rest.iter().position(|&c| is_lws(c)).unwrap_or(rest.len());
    rest[end..].iter().all(|&c| is_lws(c)) &&
        rest[..end].eq_ignore_ascii_case(token)
}
