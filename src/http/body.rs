//! Body parts: the unit of content flowing through the module chain.
//!
//! Lower level modules generate body parts at will, but the ordering
//! of those parts must not be ignored: a later module may receive
//! parts out of order when upstream stages run on several workers, so
//! every part carries a monotonic index stamped by its producer and
//! consumers drain a min-heap keyed on that index.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

pub type LazyProducer = Box<dyn FnOnce() -> Vec<u8> + Send + Sync>;

/// Content or control marker carried by a [`BodyPart`].
pub enum BodyKind {
    /// Plain bytes.
    Raw(Vec<u8>),
    /// A file to be streamed out by the writer. The size is captured
    /// from `stat` when the part is made.
    File { path: PathBuf, size: u64 },
    /// Bytes produced on demand when the writer reaches the part.
    Lazy(LazyProducer),
    /// Open a multipart sub-message with the carried boundary.
    OpenSubMessage(String),
    /// Close the most recently opened sub-message.
    CloseSubMessage,
    /// Content for the current response is finished; the connection
    /// may be kept for the next request.
    ContentFinished,
    /// Tear the connection down once everything before it is written.
    CloseConnection,
}

impl fmt::Debug for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BodyKind::Raw(data) => f.debug_tuple("Raw").field(data).finish(),
            BodyKind::File { path, size } => {
                f.debug_struct("File").field("path", path).field("size", size).finish()
            }
            BodyKind::Lazy(_) => f.debug_tuple("Lazy").field(&"..").finish(),
            BodyKind::OpenSubMessage(boundary) => {
                f.debug_tuple("OpenSubMessage").field(boundary).finish()
            }
            BodyKind::CloseSubMessage => write!(f, "CloseSubMessage"),
            BodyKind::ContentFinished => write!(f, "ContentFinished"),
            BodyKind::CloseConnection => write!(f, "CloseConnection"),
        }
    }
}

pub struct BodyPart {
    /// Ordering index, stamped by the producing module.
    pub index: u64,
    pub kind: BodyKind,
}

impl BodyPart {
    pub fn raw<T: Into<Vec<u8>>>(data: T) -> BodyPart {
        BodyPart { index: 0, kind: BodyKind::Raw(data.into()) }
    }

    pub fn file(path: PathBuf, meta: &fs::Metadata) -> BodyPart {
        BodyPart {
            index: 0,
            kind: BodyKind::File { path: path, size: meta.len() },
        }
    }

    pub fn lazy(producer: LazyProducer) -> BodyPart {
        BodyPart { index: 0, kind: BodyKind::Lazy(producer) }
    }

    pub fn control(kind: BodyKind) -> BodyPart {
        BodyPart { index: 0, kind: kind }
    }

    pub fn is_control(&self) -> bool {
        matches!(self.kind,
                 BodyKind::OpenSubMessage(..) | BodyKind::CloseSubMessage |
                 BodyKind::ContentFinished | BodyKind::CloseConnection)
    }

    /// Payload size for content parts; control markers are empty.
    pub fn size(&self) -> u64 {
        match self.kind {
            BodyKind::Raw(ref data) => data.len() as u64,
            BodyKind::File { size, .. } => size,
            _ => 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        match self.kind {
            BodyKind::Raw(ref mut data) => data.extend_from_slice(bytes),
            _ => panic!("append on a non-raw body part"),
        }
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        match self.kind {
            BodyKind::Raw(ref mut data) => {
                data.splice(0..0, bytes.iter().cloned());
            }
            _ => panic!("prepend on a non-raw body part"),
        }
    }
}

impl fmt::Debug for BodyPart {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            BodyKind::Raw(ref d) => format!("Raw({} bytes)", d.len()),
            BodyKind::File { ref path, size } =>
                format!("File({:?}, {} bytes)", path, size),
            BodyKind::Lazy(..) => "Lazy".to_string(),
            BodyKind::OpenSubMessage(ref b) =>
                format!("OpenSubMessage({:?})", b),
            BodyKind::CloseSubMessage => "CloseSubMessage".to_string(),
            BodyKind::ContentFinished => "ContentFinished".to_string(),
            BodyKind::CloseConnection => "CloseConnection".to_string(),
        };
        write!(f, "BodyPart[{}] {}", self.index, kind)
    }
}

struct Queued(BodyPart);

impl PartialEq for Queued {
    fn eq(&self, other: &Queued) -> bool {
        self.0.index == other.0.index
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Queued) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Queued) -> Ordering {
        // min-heap on index
        other.0.index.cmp(&self.0.index)
    }
}

/// Min-heap of body parts keyed on index.
///
/// A consumer drains parts only while the minimum equals its
/// `next_expected` counter, which guarantees strictly increasing index
/// order no matter how parts arrived.
#[derive(Default)]
pub struct BodyPartQueue {
    heap: BinaryHeap<Queued>,
}

impl BodyPartQueue {
    pub fn new() -> BodyPartQueue {
        BodyPartQueue { heap: BinaryHeap::new() }
    }

    pub fn push(&mut self, part: BodyPart) {
        self.heap.push(Queued(part));
    }

    /// Pop the minimum part if its index equals `expected`.
    pub fn pop_if(&mut self, expected: u64) -> Option<BodyPart> {
        match self.heap.peek() {
            Some(q) if q.0.index == expected => {}
            _ => return None,
        }
        self.heap.pop().map(|q| q.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{BodyKind, BodyPart, BodyPartQueue};

    fn part(index: u64) -> BodyPart {
        let mut p = BodyPart::raw(format!("part-{}", index).into_bytes());
        p.index = index;
        p
    }

    #[test]
    fn drains_in_index_order() {
        let mut q = BodyPartQueue::new();
        q.push(part(2));
        q.push(part(0));
        q.push(part(1));
        assert_eq!(q.pop_if(0).unwrap().index, 0);
        assert_eq!(q.pop_if(1).unwrap().index, 1);
        assert_eq!(q.pop_if(2).unwrap().index, 2);
        assert!(q.pop_if(3).is_none());
    }

    #[test]
    fn holds_until_expected_arrives() {
        let mut q = BodyPartQueue::new();
        q.push(part(1));
        assert!(q.pop_if(0).is_none());
        q.push(part(0));
        assert_eq!(q.pop_if(0).unwrap().index, 0);
        assert_eq!(q.pop_if(1).unwrap().index, 1);
    }

    #[test]
    fn append_and_prepend() {
        let mut p = BodyPart::raw(b"body".to_vec());
        p.prepend(b"<<");
        p.append(b">>");
        match p.kind {
            BodyKind::Raw(ref d) => assert_eq!(&d[..], b"<<body>>"),
            _ => panic!("expected raw part"),
        }
    }

    #[test]
    fn lazy_produces_on_demand() {
        let p = BodyPart::lazy(Box::new(|| b"deferred".to_vec()));
        assert_eq!(p.size(), 0);
        match p.kind {
            BodyKind::Lazy(producer) => {
                assert_eq!(producer(), b"deferred".to_vec());
            }
            _ => panic!("expected lazy part"),
        }
    }

    #[test]
    fn control_markers() {
        assert!(BodyPart::control(BodyKind::ContentFinished).is_control());
        assert!(BodyPart::control(BodyKind::CloseConnection).is_control());
        assert!(!part(0).is_control());
    }
}
