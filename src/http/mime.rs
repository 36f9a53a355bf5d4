//! Content-type lookup by file extension.
//!
//! The table is loaded from `/etc/mime.types` syntax (lines of
//! `type ext1 ext2 ...`, `#` comments); hosts without the file get a
//! small compiled-in table so behaviour stays deterministic.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_MIME_TYPE: &'static str = "application/binary";

const BUILTIN: &'static [(&'static str, &'static str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("txt", "text/plain"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("pdf", "application/pdf"),
];

pub struct MimeTypes {
    by_extension: HashMap<String, String>,
}

impl MimeTypes {
    /// Load from `/etc/mime.types`, falling back to the builtin table.
    pub fn system() -> MimeTypes {
        match MimeTypes::from_file("/etc/mime.types") {
            Ok(table) => table,
            Err(_) => MimeTypes::builtin(),
        }
    }

    pub fn builtin() -> MimeTypes {
        let mut by_extension = HashMap::new();
        for &(ext, mime) in BUILTIN {
            by_extension.insert(ext.to_string(), mime.to_string());
        }
        MimeTypes { by_extension: by_extension }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<MimeTypes> {
        let text = fs::read_to_string(path)?;
        Ok(MimeTypes::parse(&text))
    }

    pub fn parse(text: &str) -> MimeTypes {
        let mut by_extension = HashMap::new();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let mut words = line.split_whitespace();
            let mime = match words.next() {
                Some(mime) => mime,
                None => continue,
            };
            for ext in words {
                by_extension.insert(ext.to_ascii_lowercase(),
                                    mime.to_string());
            }
        }
        MimeTypes { by_extension: by_extension }
    }

    /// Content type for a path, by extension.
    pub fn mime_type<P: AsRef<Path>>(&self, path: P) -> &str {
        path.as_ref().extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| {
                self.by_extension.get(&ext.to_ascii_lowercase())
            })
            .map(|mime| &mime[..])
            .unwrap_or(DEFAULT_MIME_TYPE)
    }

    pub fn len(&self) -> usize {
        self.by_extension.len()
    }
}

#[cfg(test)]
mod test {
    use super::{MimeTypes, DEFAULT_MIME_TYPE};

    #[test]
    fn parses_mime_types_format() {
        let table = MimeTypes::parse("\
            # comment line\n\
            text/html\t\t\thtml htm\n\
            image/png\t\t\tpng\n\
            application/x-empty\n\
            video/mp4 mp4 # trailing comment\n");
        assert_eq!(table.mime_type("index.html"), "text/html");
        assert_eq!(table.mime_type("logo.PNG"), "image/png");
        assert_eq!(table.mime_type("clip.mp4"), "video/mp4");
    }

    #[test]
    fn unknown_extension_defaults() {
        let table = MimeTypes::builtin();
        assert_eq!(table.mime_type("data.weird"), DEFAULT_MIME_TYPE);
        assert_eq!(table.mime_type("no_extension"), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn builtin_covers_the_basics() {
        let table = MimeTypes::builtin();
        assert_eq!(table.mime_type("a.html"), "text/html");
        assert_eq!(table.mime_type("a.json"), "application/json");
    }
}
