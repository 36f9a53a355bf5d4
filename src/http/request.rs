//! A http request object.

use url::percent_encoding::{percent_decode, percent_encode,
                            DEFAULT_ENCODE_SET, QUERY_ENCODE_SET};

use crate::connection::ConnId;
use crate::error::Error;
use crate::http::body::{BodyKind, BodyPart};
use crate::http::headers::HeaderTable;
use crate::http::response::Response;
use crate::http::target::{split_authority, RequestTarget};

/// A fully assembled request.
///
/// Fields are immutable once the reader hands the request to the
/// handler stage; the owned [`Response`] is created with the request
/// and carries its own interior mutability.
#[derive(Debug)]
pub struct Request {
    pub conn: ConnId,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Percent-decoded resource path; `.` and `..` segments were
    /// rejected by the parser.
    pub resource: String,
    /// Ordered, possibly repeating `(key, value)` pairs.
    pub query: Vec<(String, String)>,
    pub version: String,
    pub headers: HeaderTable,
    pub content: Option<BodyPart>,
    pub response: Response,
}

impl Request {
    /// Parse the request line `METHOD SP URI SP VERSION`.
    pub fn from_first_line(conn: ConnId, line: &str)
        -> Result<Request, Error>
    {
        let mut words = line.split_whitespace();
        let method = words.next().ok_or(Error::BadRequestLine)?;
        let target = words.next().ok_or(Error::BadRequestLine)?;
        let version = words.next().ok_or(Error::BadRequestLine)?;
        if words.next().is_some() || !version.starts_with("HTTP/") {
            return Err(Error::BadRequestLine);
        }

        let mut req = Request {
            conn: conn,
            method: method.to_string(),
            scheme: "http".to_string(),
            host: String::new(),
            port: 80,
            resource: "/".to_string(),
            query: Vec::new(),
            version: version.to_string(),
            headers: HeaderTable::new(),
            content: None,
            response: Response::new(),
        };

        match RequestTarget::parse(target)
            .ok_or(Error::BadRequestTarget)?
        {
            RequestTarget::Origin(path) => {
                req.set_path(path)?;
            }
            RequestTarget::Absolute { scheme, authority, path } => {
                let default_port = if scheme == "https" { 443 } else { 80 };
                let (host, port) = split_authority(authority, default_port);
                req.scheme = scheme.to_string();
                req.host = host.to_string();
                req.port = port;
                req.set_path(if path.is_empty() { "/" } else { path })?;
            }
            RequestTarget::Authority(authority) => {
                let (host, port) = split_authority(authority, 80);
                req.host = host.to_string();
                req.port = port;
            }
            RequestTarget::Asterisk => {
                req.resource = "*".to_string();
            }
        }
        Ok(req)
    }

    fn set_path(&mut self, path: &str) -> Result<(), Error> {
        let (resource, query) = match path.find('?') {
            Some(pos) => (&path[..pos], Some(&path[pos + 1..])),
            None => (path, None),
        };
        let decoded = decode(resource)?;
        // catches literal and percent-encoded traversal alike
        if decoded.split('/').any(|seg| seg == "." || seg == "..") {
            return Err(Error::PathTraversal);
        }
        self.resource = decoded;
        if let Some(query) = query {
            self.query = parse_query(query)?;
        }
        Ok(())
    }

    /// Fill host and port from the `Host` header unless the request
    /// target already carried an authority.
    pub fn take_host_header(&mut self) {
        if self.host.is_empty() {
            if let Some(value) = self.headers.get("Host") {
                let (host, port) = split_authority(value, 80);
                self.host = host.to_string();
                self.port = port;
            }
        }
    }

    /// First value of a query parameter, if present.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter()
            .find(|&&(ref k, _)| k == key)
            .map(|&(_, ref v)| &v[..])
    }

    pub fn content_length(&self) -> Result<u64, Error> {
        match self.headers.get("Content-Length") {
            Some(v) => v.trim().parse()
                .map_err(|_| Error::ContentLengthInvalid),
            None => Ok(0),
        }
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match self.content {
            Some(BodyPart { kind: BodyKind::Raw(ref data), .. }) =>
                Some(&data[..]),
            _ => None,
        }
    }

    /// Serialise the request head (and any raw content body) back to
    /// wire format.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        let path = percent_encode(self.resource.as_bytes(),
                                  DEFAULT_ENCODE_SET).to_string();
        out.extend_from_slice(path.as_bytes());
        for (n, &(ref k, ref v)) in self.query.iter().enumerate() {
            out.push(if n == 0 { b'?' } else { b'&' });
            out.extend_from_slice(
                percent_encode(k.as_bytes(), QUERY_ENCODE_SET)
                    .to_string().as_bytes());
            out.push(b'=');
            out.extend_from_slice(
                percent_encode(v.as_bytes(), QUERY_ENCODE_SET)
                    .to_string().as_bytes());
        }
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(out);
        if let Some(bytes) = self.content_bytes() {
            out.extend_from_slice(bytes);
        }
    }
}

fn decode(raw: &str) -> Result<String, Error> {
    percent_decode(raw.as_bytes())
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| Error::BadRequestTarget)
}

fn parse_query(raw: &str) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    for piece in raw.split('&') {
        if piece.is_empty() {
            continue;
        }
        let (key, value) = match piece.find('=') {
            Some(pos) => (&piece[..pos], &piece[pos + 1..]),
            None => (piece, ""),
        };
        pairs.push((decode(key)?, decode(value)?));
    }
    Ok(pairs)
}

#[cfg(test)]
mod test {
    use crate::connection::ConnId;
    use crate::error::Error;
    use super::Request;

    fn parse(line: &str) -> Result<Request, Error> {
        Request::from_first_line(ConnId(1), line)
    }

    #[test]
    fn plain_get() {
        let req = parse("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.resource, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert!(req.query.is_empty());
    }

    #[test]
    fn query_pairs_keep_order() {
        let req = parse("GET /s?b=2&a=1&a=3 HTTP/1.1").unwrap();
        assert_eq!(req.query, vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            ("a".to_string(), "3".to_string()),
        ]);
        assert_eq!(req.query_value("a"), Some("1"));
        assert_eq!(req.query_value("missing"), None);
    }

    #[test]
    fn percent_decoding() {
        let req = parse("GET /with%20space?q=a%26b HTTP/1.1").unwrap();
        assert_eq!(req.resource, "/with space");
        assert_eq!(req.query_value("q"), Some("a&b"));
    }

    #[test]
    fn absolute_target() {
        let req = parse("GET http://example.com:8080/x?y=1 HTTP/1.1")
            .unwrap();
        assert_eq!(req.scheme, "http");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 8080);
        assert_eq!(req.resource, "/x");
        assert_eq!(req.query_value("y"), Some("1"));
    }

    #[test]
    fn traversal_is_rejected() {
        assert_matches!(parse("GET /../etc/passwd HTTP/1.1"),
                        Err(Error::PathTraversal));
        assert_matches!(parse("GET /a/./b HTTP/1.1"),
                        Err(Error::PathTraversal));
        assert_matches!(parse("GET /a/%2e%2e/b HTTP/1.1"),
                        Err(Error::PathTraversal));
    }

    #[test]
    fn malformed_lines() {
        assert_matches!(parse("GET /x"), Err(Error::BadRequestLine));
        assert_matches!(parse("GET /x HTTP/1.1 extra"),
                        Err(Error::BadRequestLine));
        assert_matches!(parse("GET /x FTP/1.1"),
                        Err(Error::BadRequestLine));
    }

    #[test]
    fn host_header_fallback() {
        let mut req = parse("GET / HTTP/1.1").unwrap();
        req.headers.parse_line("Host: example.org:81").unwrap();
        req.take_host_header();
        assert_eq!(req.host, "example.org");
        assert_eq!(req.port, 81);

        let mut abs = parse("GET http://real/ HTTP/1.1").unwrap();
        abs.headers.parse_line("Host: ignored").unwrap();
        abs.take_host_header();
        assert_eq!(abs.host, "real");
    }

    #[test]
    fn serialization_round_trips() {
        let req = parse("GET /files/report?page=2&sort=name HTTP/1.1")
            .unwrap();
        let mut out = Vec::new();
        req.serialize(&mut out);
        let text = String::from_utf8(out).unwrap();
        let first_line = text.split("\r\n").next().unwrap();
        let again = parse(first_line).unwrap();
        assert_eq!(again.resource, req.resource);
        assert_eq!(again.query, req.query);
        assert_eq!(again.method, req.method);
    }
}
