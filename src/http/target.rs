//! Classification of the URI part of the request line.
//!
//! HTTP/1.1 allows four shapes of request target. Routing only ever
//! sees the origin form; proxies send the absolute form, `CONNECT`
//! sends a bare authority and a server-wide `OPTIONS` sends `*`.

#[derive(Debug, PartialEq)]
pub enum RequestTarget<'a> {
    /// `/path?query` — the common case
    Origin(&'a str),
    /// `http://host:port/path?query` as sent to proxies. The path
    /// component may be empty here, unlike in the origin form.
    Absolute { scheme: &'a str, authority: &'a str, path: &'a str },
    /// Bare `host:port`, only meaningful for `CONNECT`
    Authority(&'a str),
    /// `*`
    Asterisk,
}

/// Schemes a request target may carry.
const SCHEMES: &'static [&'static str] = &["http", "https"];

// An authority runs until a path, query or fragment delimiter.
// Userinfo is not part of an HTTP target, so `@` disqualifies too.
fn ends_authority(c: u8) -> bool {
    matches!(c, b'/' | b'?' | b'#' | b'@')
}

fn strip_scheme(target: &str) -> Option<(&'static str, &str)> {
    for &scheme in SCHEMES {
        if target.len() > scheme.len() + 3 &&
            target.starts_with(scheme) &&
            target[scheme.len()..].starts_with("://")
        {
            return Some((scheme, &target[scheme.len() + 3..]));
        }
    }
    None
}

impl<'a> RequestTarget<'a> {
    pub fn parse(target: &'a str) -> Option<RequestTarget<'a>> {
        if target.is_empty() {
            return None;
        }
        if target.as_bytes()[0] == b'/' {
            return Some(RequestTarget::Origin(target));
        }
        if target == "*" {
            return Some(RequestTarget::Asterisk);
        }
        if let Some((scheme, rest)) = strip_scheme(target) {
            let split = rest.bytes().position(ends_authority)
                .unwrap_or(rest.len());
            return Some(RequestTarget::Absolute {
                scheme: scheme,
                authority: &rest[..split],
                path: &rest[split..],
            });
        }
        if target.bytes().any(ends_authority) {
            return None;
        }
        Some(RequestTarget::Authority(target))
    }
}

/// Split `host[:port]`; a missing or unparsable port yields `default`.
pub fn split_authority(authority: &str, default_port: u16)
    -> (&str, u16)
{
    match authority.rfind(':') {
        Some(pos) => {
            match authority[pos + 1..].parse() {
                Ok(port) => (&authority[..pos], port),
                Err(_) => (authority, default_port),
            }
        }
        None => (authority, default_port),
    }
}

#[cfg(test)]
mod test {
    use super::{split_authority, RequestTarget};
    use super::RequestTarget::*;

    #[test]
    fn origin_form() {
        assert_eq!(RequestTarget::parse("/"), Some(Origin("/")));
        assert_eq!(RequestTarget::parse("/files/a?page=2"),
                   Some(Origin("/files/a?page=2")));
        // a path that merely embeds a scheme is still origin form
        assert_eq!(RequestTarget::parse("/http://odd"),
                   Some(Origin("/http://odd")));
    }

    #[test]
    fn absolute_form() {
        assert_eq!(RequestTarget::parse("http://example.com"),
                   Some(Absolute { scheme: "http",
                                   authority: "example.com",
                                   path: "" }));
        assert_eq!(RequestTarget::parse("http://example.com/"),
                   Some(Absolute { scheme: "http",
                                   authority: "example.com",
                                   path: "/" }));
        assert_eq!(
            RequestTarget::parse("https://example.com:8443/a?b=1"),
            Some(Absolute { scheme: "https",
                            authority: "example.com:8443",
                            path: "/a?b=1" }));
    }

    #[test]
    fn authority_form() {
        assert_eq!(RequestTarget::parse("example.com:443"),
                   Some(Authority("example.com:443")));
        // userinfo is not a thing in HTTP targets
        assert_eq!(RequestTarget::parse("user@example.com"), None);
    }

    #[test]
    fn asterisk_and_empty() {
        assert_eq!(RequestTarget::parse("*"), Some(Asterisk));
        assert_eq!(RequestTarget::parse(""), None);
    }

    #[test]
    fn unknown_scheme_is_an_authority() {
        // no scheme table hit and no delimiter: plain authority
        assert_eq!(RequestTarget::parse("ftp.example.com"),
                   Some(Authority("ftp.example.com")));
        // with a delimiter it is nothing we recognise
        assert_eq!(RequestTarget::parse("ftp://example.com"), None);
    }

    #[test]
    fn authority_split() {
        assert_eq!(split_authority("example.com:8080", 80),
                   ("example.com", 8080));
        assert_eq!(split_authority("example.com", 80),
                   ("example.com", 80));
        assert_eq!(split_authority("bad:port", 80), ("bad:port", 80));
    }
}
