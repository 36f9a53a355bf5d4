//! The stage that does asynchronous DB connections and queries.
//!
//! Only the public surface is provided here: the stage runs a
//! caller-supplied [`DbDriver`] on its own workers and posts
//! completion events back through the sink, so no HTTP stage ever
//! waits on a database.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::ConnId;
use crate::event::StageEvent;
use crate::stage::{Stage, StageHandler};

/// A database binding supplied by the application.
pub trait DbDriver: Send + Sync + 'static {
    fn connect(&self, uri: &str, params: &HashMap<String, String>)
        -> Result<u64, String>;
    fn run_query(&self, conn: u64, query: &str)
        -> Result<Vec<Vec<String>>, String>;
    fn disconnect(&self, conn: u64) -> Result<(), String>;
}

pub enum DbRequest {
    Connect { source: ConnId, uri: String,
              params: HashMap<String, String> },
    RunQuery { source: ConnId, conn: u64, query: String },
    Disconnect { source: ConnId, conn: u64 },
}

impl StageEvent for DbRequest {}

pub enum DbOutcome {
    Connected { source: ConnId, conn: Result<u64, String> },
    QueryDone { source: ConnId,
                rows: Result<Vec<Vec<String>>, String> },
    Disconnected { source: ConnId, result: Result<(), String> },
}

pub type DbHelperStage = Stage<DbHelperCore>;

pub struct DbHelperCore {
    driver: Arc<dyn DbDriver>,
    sink: Box<dyn Fn(DbOutcome) + Send + Sync>,
}

impl DbHelperCore {
    pub fn new<F>(driver: Arc<dyn DbDriver>, sink: F) -> DbHelperCore
        where F: Fn(DbOutcome) + Send + Sync + 'static
    {
        DbHelperCore {
            driver: driver,
            sink: Box::new(sink),
        }
    }
}

impl StageHandler for DbHelperCore {
    type Event = DbRequest;

    fn handle(&self, event: DbRequest) {
        let outcome = match event {
            DbRequest::Connect { source, uri, params } => {
                DbOutcome::Connected {
                    source: source,
                    conn: self.driver.connect(&uri, &params),
                }
            }
            DbRequest::RunQuery { source, conn, query } => {
                DbOutcome::QueryDone {
                    source: source,
                    rows: self.driver.run_query(conn, &query),
                }
            }
            DbRequest::Disconnect { source, conn } => {
                DbOutcome::Disconnected {
                    source: source,
                    result: self.driver.disconnect(conn),
                }
            }
        };
        (self.sink)(outcome);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};

    use crate::connection::ConnId;
    use crate::stage::Stage;
    use super::{DbDriver, DbHelperCore, DbOutcome, DbRequest};

    struct FakeDriver;

    impl DbDriver for FakeDriver {
        fn connect(&self, uri: &str, _params: &HashMap<String, String>)
            -> Result<u64, String>
        {
            if uri.starts_with("fake://") {
                Ok(42)
            } else {
                Err("unknown scheme".to_string())
            }
        }

        fn run_query(&self, conn: u64, query: &str)
            -> Result<Vec<Vec<String>>, String>
        {
            assert_eq!(conn, 42);
            Ok(vec![vec![query.to_string()]])
        }

        fn disconnect(&self, _conn: u64) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn driver_round_trip() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let stage = Stage::new("db-helper",
            DbHelperCore::new(Arc::new(FakeDriver), move |o| {
                tx.lock().unwrap().send(o).unwrap();
            }), 0);

        stage.queue_event(DbRequest::Connect {
            source: ConnId(1),
            uri: "fake://db".to_string(),
            params: HashMap::new(),
        });
        let conn = match rx.try_recv().unwrap() {
            DbOutcome::Connected { conn, .. } => conn.unwrap(),
            _ => panic!("expected connect completion"),
        };
        stage.queue_event(DbRequest::RunQuery {
            source: ConnId(1),
            conn: conn,
            query: "select 1".to_string(),
        });
        match rx.try_recv().unwrap() {
            DbOutcome::QueryDone { rows, .. } => {
                assert_eq!(rows.unwrap(),
                           vec![vec!["select 1".to_string()]]);
            }
            _ => panic!("expected query completion"),
        }
        stage.queue_event(DbRequest::Disconnect {
            source: ConnId(1),
            conn: conn,
        });
        match rx.try_recv().unwrap() {
            DbOutcome::Disconnected { result, .. } => result.unwrap(),
            _ => panic!("expected disconnect completion"),
        }
    }
}
