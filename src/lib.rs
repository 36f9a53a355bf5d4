//! Staged event-driven HTTP service with Bayeux (Comet) support
//!
//! The runtime is split into *stages*: the server thread drives an
//! edge-triggered epoll loop and turns readiness into events, while
//! bounded worker pools run the reader, handler and writer stages.
//! Requests flow through a chain of [`HttpModule`]s which emit ordered
//! body parts back towards the writer.

#[macro_use(quick_error)] extern crate quick_error;
#[macro_use] extern crate matches;
#[macro_use] extern crate log;

pub mod bayeux;
pub mod helpers;
pub mod http;
pub mod server;
mod builder;
mod config;
mod connection;
mod enums;
mod error;
mod event;
mod stage;

pub use crate::builder::{ServerBuilder, HttpServer};
pub use crate::config::Config;
pub use crate::connection::{ConnId, ConnState, Connection};
pub use crate::enums::{Status, Version};
pub use crate::error::Error;
pub use crate::event::StageEvent;
pub use crate::http::module::HttpModule;
pub use crate::stage::{Stage, StageHandler};
