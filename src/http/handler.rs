//! The stage that runs the module chain over parsed requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::connection::{ConnId, ConnState};
use crate::event::StageEvent;
use crate::http::body::BodyPart;
use crate::http::module::{HandlerData, HttpModule, ModuleCtx};
use crate::http::request::Request;
use crate::http::writer::{WriterEvent, WriterStage};
use crate::server::ConnTable;
use crate::stage::{Stage, StageHandler};

pub enum HandlerEvent {
    /// A freshly assembled request; resets per-module state.
    RequestArrived { conn: ConnId, request: Arc<Request> },
    NextInputModule { conn: ConnId, module: Arc<dyn HttpModule> },
    InputBody { conn: ConnId, module: Arc<dyn HttpModule>,
                part: BodyPart },
    NextOutputModule { conn: ConnId, module: Arc<dyn HttpModule> },
    OutputBody { conn: ConnId, module: Arc<dyn HttpModule>,
                 part: BodyPart },
    /// Fan-out payload for a retained connection; stamped on the
    /// handler thread against the producing module's counter.
    Deliver { conn: ConnId, from: usize, module: Arc<dyn HttpModule>,
              payload: Vec<u8> },
    CloseConnection { conn: ConnId },
}

impl StageEvent for HandlerEvent {}

pub type HandlerStage = Stage<HandlerCore>;

/// Shared logic of the handler stage's workers.
pub struct HandlerCore {
    conns: Arc<ConnTable>,
    writer: Arc<WriterStage>,
    root: Arc<dyn HttpModule>,
    me: Mutex<Weak<HandlerStage>>,
    table: Arc<Mutex<HashMap<ConnId, Arc<Mutex<HandlerData>>>>>,
}

impl HandlerCore {
    pub fn new(conns: Arc<ConnTable>, writer: Arc<WriterStage>,
               root: Arc<dyn HttpModule>)
        -> HandlerCore
    {
        let table: Arc<Mutex<HashMap<ConnId, Arc<Mutex<HandlerData>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let cleanup = table.clone();
        conns.on_close(Box::new(move |id| {
            cleanup.lock().expect("handler table poisoned").remove(&id);
        }));
        HandlerCore {
            conns: conns,
            writer: writer,
            root: root,
            me: Mutex::new(Weak::new()),
            table: table,
        }
    }

    /// Give the core a handle to its own stage so modules can queue
    /// follow-up events.
    pub fn bind(&self, stage: &Arc<HandlerStage>) {
        *self.me.lock().expect("handler self-ref poisoned") =
            Arc::downgrade(stage);
    }

    pub fn root_module(&self) -> &Arc<dyn HttpModule> {
        &self.root
    }

    fn queue(&self, event: HandlerEvent) -> bool {
        let stage = self.me.lock()
            .expect("handler self-ref poisoned")
            .upgrade();
        match stage {
            Some(stage) => stage.queue_event(event),
            None => false,
        }
    }

    pub fn input_to_module(&self, conn: ConnId,
                           module: Arc<dyn HttpModule>,
                           body: Option<BodyPart>)
        -> bool
    {
        match body {
            Some(part) => self.queue(HandlerEvent::InputBody {
                conn: conn, module: module, part: part,
            }),
            None => self.queue(HandlerEvent::NextInputModule {
                conn: conn, module: module,
            }),
        }
    }

    pub fn output_to_module(&self, conn: ConnId,
                            module: Arc<dyn HttpModule>,
                            body: Option<BodyPart>)
        -> bool
    {
        match body {
            Some(part) => self.queue(HandlerEvent::OutputBody {
                conn: conn, module: module, part: part,
            }),
            None => self.queue(HandlerEvent::NextOutputModule {
                conn: conn, module: module,
            }),
        }
    }

    pub fn write_body_part(&self, conn: ConnId, request: Arc<Request>,
                           part: BodyPart)
        -> bool
    {
        self.writer.queue_event(WriterEvent::WriteBodyPart {
            conn: conn, request: request, part: part,
        })
    }

    pub fn request_close(&self, conn: ConnId) -> bool {
        self.queue(HandlerEvent::CloseConnection { conn: conn })
    }

    /// Queue a fan-out payload (used by the Bayeux module).
    pub fn deliver(&self, conn: ConnId, from: usize,
                   module: Arc<dyn HttpModule>, payload: Vec<u8>)
        -> bool
    {
        self.queue(HandlerEvent::Deliver {
            conn: conn, from: from, module: module, payload: payload,
        })
    }

    pub fn data_for(&self, conn: ConnId) -> Arc<Mutex<HandlerData>> {
        self.table.lock()
            .expect("handler table poisoned")
            .entry(conn)
            .or_default()
            .clone()
    }

    fn ctx<'a>(&'a self, conn: ConnId,
               data: &'a Arc<Mutex<HandlerData>>)
        -> ModuleCtx<'a>
    {
        ModuleCtx { conn: conn, core: self, data: data }
    }
}

impl StageHandler for HandlerCore {
    type Event = HandlerEvent;

    fn handle(&self, event: HandlerEvent) {
        let conn_id = match &event {
            HandlerEvent::RequestArrived { conn, .. } |
            HandlerEvent::NextInputModule { conn, .. } |
            HandlerEvent::InputBody { conn, .. } |
            HandlerEvent::NextOutputModule { conn, .. } |
            HandlerEvent::OutputBody { conn, .. } |
            HandlerEvent::Deliver { conn, .. } |
            HandlerEvent::CloseConnection { conn } => *conn,
        };

        if let HandlerEvent::CloseConnection { .. } = event {
            if let Some(conn) = self.conns.lookup(conn_id) {
                self.conns.set_state(&conn, ConnState::Closed);
            }
            return;
        }
        // events addressed to a dead connection are dropped here
        if self.conns.alive(conn_id).is_none() {
            trace!("dropping handler event for dead connection {}",
                   conn_id);
            return;
        }
        let data = self.data_for(conn_id);

        match event {
            HandlerEvent::RequestArrived { request, .. } => {
                {
                    let mut guard = data.lock()
                        .expect("handler data poisoned");
                    guard.reset_modules();
                    guard.request = Some(request);
                }
                self.root.process_input(&self.ctx(conn_id, &data), None);
            }
            HandlerEvent::NextInputModule { module, .. } => {
                module.process_input(&self.ctx(conn_id, &data), None);
            }
            HandlerEvent::InputBody { module, part, .. } => {
                module.process_input(&self.ctx(conn_id, &data),
                                     Some(part));
            }
            HandlerEvent::NextOutputModule { module, .. } => {
                module.process_output(&self.ctx(conn_id, &data), None);
            }
            HandlerEvent::OutputBody { module, part, .. } => {
                module.process_output(&self.ctx(conn_id, &data),
                                      Some(part));
            }
            HandlerEvent::Deliver { from, module, payload, .. } => {
                {
                    let guard = data.lock()
                        .expect("handler data poisoned");
                    if guard.request.is_none() {
                        // the retained request is gone; nothing to
                        // deliver into
                        return;
                    }
                }
                let ctx = self.ctx(conn_id, &data);
                let mut part = BodyPart::raw(payload);
                ctx.stamp(from, &mut part);
                module.process_output(&ctx, Some(part));
            }
            HandlerEvent::CloseConnection { .. } => unreachable!(),
        }
    }
}
