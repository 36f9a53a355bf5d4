//! Everything required to write a handler module.
//!
//! A module does some processing and sends data on to the next module
//! in the chain; the nature of the data is body parts. Ordering of
//! body parts must not be ignored: each module stamps the parts it
//! emits from its own `next_to_send` counter (so consuming or merging
//! modules never create holes downstream), and each module drains its
//! inbox heap only while the minimum index equals `next_expected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::ConnId;
use crate::http::body::{BodyPart, BodyPartQueue};
use crate::http::handler::HandlerCore;
use crate::http::request::Request;

static MODULE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Allocate a process-unique module id; the id indexes the module's
/// per-request state slot.
pub fn next_module_id() -> usize {
    MODULE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// An HTTP processor chained for the input (request) and output
/// (response) directions.
pub trait HttpModule: Send + Sync + 'static {
    fn module_id(&self) -> usize;

    fn next_module(&self) -> Option<&Arc<dyn HttpModule>> {
        None
    }

    /// Handle data flowing from the reader side. Defaults to
    /// pass-through.
    fn process_input(&self, ctx: &ModuleCtx, body: Option<BodyPart>) {
        if let Some(next) = self.next_module() {
            ctx.send_input(self.module_id(), next, body);
        }
    }

    /// Handle data flowing toward the writer side. Defaults to
    /// pass-through in arrival order.
    fn process_output(&self, ctx: &ModuleCtx, body: Option<BodyPart>) {
        if let Some(next) = self.next_module() {
            ctx.send_output(self.module_id(), next, body);
        }
    }

    /// The server dropped the connection; forget anything keyed by it.
    fn connection_closed(&self, _conn: ConnId) {}
}

/// Per-request per-module ordering state.
#[derive(Default)]
pub struct ModuleSlot {
    /// Index of the next body part this module will process.
    pub next_expected: u64,
    /// Counter used to stamp the parts this module emits.
    pub next_to_send: u64,
    /// Re-entrancy guard: only one worker drains the queue at a time.
    pub processing: bool,
    pub parts: BodyPartQueue,
}

impl ModuleSlot {
    fn reset(&mut self) {
        self.next_expected = 0;
        self.next_to_send = 0;
        self.processing = false;
        self.parts.clear();
    }
}

/// Handler-stage state for one connection: the request in flight and
/// the state slots of every module that touched it.
#[derive(Default)]
pub struct HandlerData {
    pub request: Option<Arc<Request>>,
    slots: HashMap<usize, ModuleSlot>,
}

impl HandlerData {
    pub fn slot_mut(&mut self, module_id: usize) -> &mut ModuleSlot {
        self.slots.entry(module_id).or_default()
    }

    /// Reset every slot when a new request begins.
    pub fn reset_modules(&mut self) {
        for slot in self.slots.values_mut() {
            slot.reset();
        }
    }
}

/// Context handed to module callbacks: the connection id, the shared
/// handler data, and the handler stage to route further events
/// through.
pub struct ModuleCtx<'a> {
    pub conn: ConnId,
    pub core: &'a HandlerCore,
    pub data: &'a Arc<Mutex<HandlerData>>,
}

impl<'a> ModuleCtx<'a> {
    pub fn request(&self) -> Option<Arc<Request>> {
        self.lock_data().request.clone()
    }

    /// Stamp `part` with the sending module's counter.
    pub fn stamp(&self, from: usize, part: &mut BodyPart) {
        let mut data = self.lock_data();
        let slot = data.slot_mut(from);
        part.index = slot.next_to_send;
        slot.next_to_send += 1;
    }

    /// Forward input to `to`, stamping any body part with the sender's
    /// counter.
    pub fn send_input(&self, from: usize, to: &Arc<dyn HttpModule>,
                      body: Option<BodyPart>)
    {
        let body = body.map(|mut part| {
            self.stamp(from, &mut part);
            part
        });
        self.core.input_to_module(self.conn, to.clone(), body);
    }

    /// Forward output to `to`, stamping any body part with the
    /// sender's counter.
    pub fn send_output(&self, from: usize, to: &Arc<dyn HttpModule>,
                       body: Option<BodyPart>)
    {
        let body = body.map(|mut part| {
            self.stamp(from, &mut part);
            part
        });
        self.core.output_to_module(self.conn, to.clone(), body);
    }

    /// Hand a stamped part to the writer stage.
    pub fn write_part(&self, request: &Arc<Request>, part: BodyPart) {
        self.core.write_body_part(self.conn, request.clone(), part);
    }

    /// Ask the server to tear the connection down.
    pub fn close_connection(&self) {
        self.core.request_close(self.conn);
    }

    /// Push `incoming` onto the module's heap and drain every part
    /// whose index is in sequence, calling `f` for each with the data
    /// lock released.
    ///
    /// If another worker holds the `processing` flag this returns at
    /// once; the in-flight worker picks the new part up because the
    /// heap is re-checked after every pop.
    pub fn drain_in_order<F>(&self, module_id: usize,
                             incoming: Option<BodyPart>, mut f: F)
        where F: FnMut(BodyPart)
    {
        let mut data = self.lock_data();
        {
            let slot = data.slot_mut(module_id);
            if let Some(part) = incoming {
                slot.parts.push(part);
            }
            if slot.processing {
                return;
            }
            slot.processing = true;
        }
        loop {
            let next = {
                let slot = data.slot_mut(module_id);
                match slot.parts.pop_if(slot.next_expected) {
                    Some(part) => {
                        slot.next_expected += 1;
                        Some(part)
                    }
                    None => {
                        slot.processing = false;
                        None
                    }
                }
            };
            match next {
                Some(part) => {
                    drop(data);
                    f(part);
                    data = self.lock_data();
                }
                None => return,
            }
        }
    }

    fn lock_data(&self) -> std::sync::MutexGuard<HandlerData> {
        self.data.lock().expect("handler data poisoned")
    }
}
