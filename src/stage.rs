//! A stage stores events in a queue and palms them off to a bounded
//! pool of worker threads. A stage with zero workers is degenerate:
//! `queue_event` dispatches inline on the caller, which keeps the code
//! paths identical for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::event::{EventQueue, StageEvent};

static STAGE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// The logic driven by a stage's workers.
///
/// Handlers are shared between workers, so they synchronise their own
/// per-connection state internally.
pub trait StageHandler: Send + Sync + 'static {
    type Event: StageEvent;

    fn handle(&self, event: Self::Event);
}

struct Shared<H: StageHandler> {
    queue: Mutex<EventQueue<H::Event>>,
    wakeup: Condvar,
    stopped: AtomicBool,
    handler: H,
}

/// A named unit with an event queue and a pool of worker threads.
pub struct Stage<H: StageHandler> {
    id: usize,
    name: String,
    workers: usize,
    shared: Arc<Shared<H>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: StageHandler> Stage<H> {
    pub fn new(name: &str, handler: H, workers: usize) -> Arc<Stage<H>> {
        Arc::new(Stage {
            id: STAGE_COUNTER.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            workers: workers,
            shared: Arc::new(Shared {
                queue: Mutex::new(EventQueue::new()),
                wakeup: Condvar::new(),
                stopped: AtomicBool::new(false),
                handler: handler,
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Process-wide stage id, assigned from a monotonic counter.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Queue an event to be handled later.
    ///
    /// Returns `false` once the stage has been stopped. With an empty
    /// worker pool the event is handled right here on the caller.
    pub fn queue_event(&self, event: H::Event) -> bool {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if self.workers == 0 {
            self.shared.handler.handle(event);
            return true;
        }
        let mut queue = self.shared.queue.lock()
            .expect("stage queue poisoned");
        queue.push(event);
        self.shared.wakeup.notify_one();
        true
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        let mut threads = self.threads.lock()
            .expect("stage thread list poisoned");
        if !threads.is_empty() {
            return;
        }
        for n in 0..self.workers {
            let shared = self.shared.clone();
            let thread_name = format!("{}-{}", self.name, n);
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(shared))
                .expect("spawning stage worker");
            threads.push(handle);
        }
        debug!("stage {:?} (id {}) started {} workers",
               self.name, self.id, self.workers);
    }

    /// Signal all workers to exit after their current event and join
    /// them. Idempotent; MUST precede destruction.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        let mut threads = self.threads.lock()
            .expect("stage thread list poisoned");
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                error!("stage {:?} worker panicked", self.name);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }
}

fn worker_loop<H: StageHandler>(shared: Arc<Shared<H>>) {
    loop {
        let event = {
            let mut queue = shared.queue.lock()
                .expect("stage queue poisoned");
            loop {
                if shared.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(event) = queue.pop() {
                    break event;
                }
                queue = shared.wakeup.wait(queue)
                    .expect("stage queue poisoned");
            }
        };
        shared.handler.handle(event);
    }
}
