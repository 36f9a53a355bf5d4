//! Helper stages that take blocking work off the HTTP stages and
//! report back with completion events.

pub mod db;
pub mod fileio;

pub use self::db::{DbDriver, DbHelperCore, DbHelperStage, DbOutcome,
                   DbRequest};
pub use self::fileio::{FileIoCore, FileIoResult, FileIoStage,
                       FileMode};
