//! HTTP/1.1 protocol implementation: data model, the reader, handler
//! and writer stages, and the built-in module chain.

pub mod body;
pub mod content;
pub mod error_page;
pub mod file;
pub mod handler;
pub mod headers;
pub mod mime;
pub mod module;
pub mod reader;
pub mod request;
pub mod response;
pub mod router;
pub mod target;
pub mod transfer;
pub mod writer;

pub use self::body::{BodyKind, BodyPart, BodyPartQueue};
pub use self::headers::HeaderTable;
pub use self::module::HttpModule;
pub use self::request::Request;
pub use self::response::Response;
