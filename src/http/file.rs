//! Module serving files and directory listings from docroot mappings.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::enums::Status;
use crate::http::body::{BodyKind, BodyPart};
use crate::http::mime::MimeTypes;
use crate::http::module::{next_module_id, HttpModule, ModuleCtx};
use crate::http::request::Request;

/// Serves a matched resource by splitting it against a table of
/// `(prefix, docroot)` pairs.
pub struct FileModule {
    id: usize,
    roots: Vec<(String, PathBuf)>,
    mime: Arc<MimeTypes>,
    next: Arc<dyn HttpModule>,
}

impl FileModule {
    pub fn new(next: Arc<dyn HttpModule>, mime: Arc<MimeTypes>)
        -> FileModule
    {
        FileModule {
            id: next_module_id(),
            roots: Vec::new(),
            mime: mime,
            next: next,
        }
    }

    /// Map resources under `prefix` to files under `docroot`.
    pub fn docroot(mut self, prefix: &str, docroot: PathBuf)
        -> FileModule
    {
        self.roots.push((prefix.to_string(), docroot));
        self
    }

    /// First docroot whose prefix starts the path wins.
    fn parse_path<'a>(&'a self, resource: &'a str)
        -> Option<(&'a str, &'a PathBuf, &'a str)>
    {
        for &(ref prefix, ref docroot) in &self.roots {
            if resource.starts_with(&prefix[..]) {
                return Some((prefix, docroot, &resource[prefix.len()..]));
            }
        }
        None
    }

    fn serve(&self, ctx: &ModuleCtx, request: &Arc<Request>) {
        let response = &request.response;
        let part = match self.parse_path(&request.resource) {
            None => {
                response.set_status_std(Status::NotFound);
                response.with_headers(|h| {
                    h.set_uint("Content-Length", 0);
                    h.set("Content-Type", "text/text");
                });
                None
            }
            Some((prefix, docroot, child)) => {
                let full = docroot.join(child.trim_start_matches('/'));
                match fs::metadata(&full) {
                    Err(e) => {
                        let message = stat_error_message(&e);
                        info!("cannot stat {:?}: {}", full, e);
                        response.set_status(
                            Status::NotFound.code(), "Cannot read file");
                        response.with_headers(|h| {
                            h.set_uint("Content-Length",
                                       message.len() as u64);
                            h.set("Content-Type", "text/text");
                        });
                        Some(BodyPart::raw(message.into_bytes()))
                    }
                    Ok(ref meta) if meta.is_dir() => {
                        let raw = request.query_value("format")
                            .map(|f| f.eq_ignore_ascii_case("raw"))
                            .unwrap_or(false);
                        let listing = match list_directory(&full, raw,
                                                           prefix, child)
                        {
                            Ok(body) => body,
                            Err(e) => format!(
                                "Error: Cannot open directory: {}", e)
                                .into_bytes(),
                        };
                        response.with_headers(|h| {
                            h.set_uint("Content-Length",
                                       listing.len() as u64);
                            h.set("Content-Type",
                                  if raw { "text/text" }
                                  else { "text/html" });
                            h.set("Cache-Control", "no-cache");
                        });
                        Some(BodyPart::raw(listing))
                    }
                    Ok(meta) => {
                        response.with_headers(|h| {
                            h.set("Content-Type",
                                  self.mime.mime_type(&full));
                        });
                        // Content-Length is stamped on by the content
                        // module from the stat size
                        Some(BodyPart::file(full, &meta))
                    }
                }
            }
        };
        if let Some(part) = part {
            ctx.send_output(self.id, &self.next, Some(part));
        }
        ctx.send_output(self.id, &self.next,
                        Some(BodyPart::control(BodyKind::ContentFinished)));
    }
}

impl HttpModule for FileModule {
    fn module_id(&self) -> usize {
        self.id
    }

    fn next_module(&self) -> Option<&Arc<dyn HttpModule>> {
        Some(&self.next)
    }

    fn process_input(&self, ctx: &ModuleCtx, _body: Option<BodyPart>) {
        if let Some(request) = ctx.request() {
            self.serve(ctx, &request);
        }
    }
}

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
}

fn read_entries(dir: &PathBuf) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    // directories first, then by name
    entries.sort_by(|a, b| {
        b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name))
    });
    Ok(entries)
}

fn list_directory(dir: &PathBuf, raw: bool, prefix: &str, child: &str)
    -> io::Result<Vec<u8>>
{
    let entries = read_entries(dir)?;
    if raw {
        let mut out = String::from("[\n");
        for entry in &entries {
            out.push_str(&format!(
                "{{'name': '{}', 'isdir': {}, 'size': {}}}\n",
                entry.name,
                if entry.is_dir { 1 } else { 0 },
                entry.size));
        }
        out.push_str("]\n");
        Ok(out.into_bytes())
    } else {
        Ok(html_listing(&entries, prefix, child).into_bytes())
    }
}

fn html_listing(entries: &[Entry], prefix: &str, child: &str) -> String {
    let mut out = String::new();
    out.push_str("<html><head></head><body>");
    out.push_str("<p><center><h2>Contents of: ");
    out.push_str(&breadcrumbs(prefix, child));
    out.push_str("</h2></center><hr>");
    out.push_str("<table width=\"100%\"><thead><tr>\
                  <td><strong>File Name</strong></td>\
                  <td><strong>Size</strong></td>\
                  </tr></thead>");
    let base = format!("{}{}", prefix, child.trim_start_matches('/'));
    let base = if base.ends_with('/') { base } else { base + "/" };
    for entry in entries {
        out.push_str("<tr><td><a href=\"");
        out.push_str(&base);
        out.push_str(&entry.name);
        out.push_str("\">");
        if entry.is_dir {
            out.push_str(&format!("[{}]</a></td><td>---</td>",
                                  entry.name));
        } else {
            out.push_str(&format!("{}</a></td><td>{}</td>",
                                  entry.name, entry.size));
        }
        out.push_str("</tr>");
    }
    out.push_str("</table><hr></body></html>");
    out
}

fn breadcrumbs(prefix: &str, child: &str) -> String {
    let full = format!("{}{}", prefix, child);
    let mut out = String::from("<a href='/'>[Home]</a> / ");
    let mut last = String::from("/");
    for segment in full.split('/').filter(|s| !s.is_empty()) {
        out.push_str(&format!("<a href='{}{}/'>{}</a> / ",
                              last, segment, segment));
        last = format!("{}{}/", last, segment);
    }
    out
}

/// Human-readable description of a `stat`/`open` failure.
fn stat_error_message(err: &io::Error) -> String {
    let text = match err.raw_os_error() {
        Some(libc::EEXIST) => "File already exists.",
        Some(libc::EISDIR) => "Path refers to a directory.",
        Some(libc::EACCES) =>
            "Search permission is denied for one of the directories \
             in the path prefix of the path.",
        Some(libc::ELOOP) =>
            "Too many symbolic links encountered while traversing \
             the path.",
        Some(libc::ENAMETOOLONG) => "File name too long.",
        Some(libc::ENOENT) =>
            "A component of the path does not exist, or the path is \
             an empty string.",
        Some(libc::ENOTDIR) =>
            "A component of the path is not a directory.",
        Some(libc::ENXIO) => "No such device or address.",
        Some(libc::ENODEV) => "No such device.",
        Some(libc::EROFS) => "Read-only file system.",
        Some(libc::ETXTBSY) => "Text file busy.",
        Some(libc::EFAULT) => "Bad address.",
        Some(libc::ENOSPC) => "No space left on device.",
        Some(libc::ENOMEM) => "Out of memory (i.e. kernel memory).",
        Some(libc::EMFILE) => "Too many open files.",
        Some(libc::ENFILE) => "Too many open files in system.",
        _ => return err.to_string(),
    };
    text.to_string()
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::path::PathBuf;
    use std::sync::Arc;

    use crate::http::mime::MimeTypes;
    use crate::http::module::{next_module_id, HttpModule};
    use super::{list_directory, stat_error_message, FileModule};

    struct NullModule(usize);

    impl HttpModule for NullModule {
        fn module_id(&self) -> usize {
            self.0
        }
    }

    fn module() -> FileModule {
        FileModule::new(Arc::new(NullModule(next_module_id())),
                        Arc::new(MimeTypes::builtin()))
            .docroot("/static/", PathBuf::from("/srv/www"))
            .docroot("/", PathBuf::from("/srv/fallback"))
    }

    #[test]
    fn path_table_first_match_wins() {
        let m = module();
        let (prefix, docroot, child) =
            m.parse_path("/static/css/site.css").unwrap();
        assert_eq!(prefix, "/static/");
        assert_eq!(docroot, &PathBuf::from("/srv/www"));
        assert_eq!(child, "css/site.css");

        let (prefix, _, child) = m.parse_path("/other.txt").unwrap();
        assert_eq!(prefix, "/");
        assert_eq!(child, "other.txt");
    }

    #[test]
    fn unmapped_resource_misses() {
        let m = FileModule::new(
            Arc::new(NullModule(next_module_id())),
            Arc::new(MimeTypes::builtin()))
            .docroot("/files/", PathBuf::from("/srv"));
        assert!(m.parse_path("/elsewhere").is_none());
    }

    #[test]
    fn enoent_message() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(stat_error_message(&err).contains("does not exist"));
        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert!(stat_error_message(&err).contains("permission"));
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("seda-http-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn raw_listing_sorts_dirs_first() {
        let dir = scratch_dir("listing");
        fs::write(dir.join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(dir.join("b")).unwrap();
        fs::write(dir.join("c.txt"), b"").unwrap();

        let body = list_directory(&dir, true, "/static/", "dir/")
            .unwrap();
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[");
        assert!(lines[1].starts_with("{'name': 'b', 'isdir': 1"));
        assert_eq!(lines[2],
                   "{'name': 'a.txt', 'isdir': 0, 'size': 10}");
        assert_eq!(lines[3],
                   "{'name': 'c.txt', 'isdir': 0, 'size': 0}");
        assert_eq!(lines[4], "]");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn html_listing_links_entries() {
        let dir = scratch_dir("html");
        fs::write(dir.join("page.html"), b"x").unwrap();
        let body = list_directory(&dir, false, "/static/", "sub")
            .unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("href=\"/static/sub/page.html\""));
        assert!(text.contains("[Home]"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
