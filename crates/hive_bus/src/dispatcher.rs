//! Dispatcher — hands work between a background worker and the main context.
//!
//! Two FIFO queues:
//!
//! - **main**: drained by whoever owns the main context, calling
//!   [`Dispatcher::drain_main`] once per tick. At most `batch_size` items run
//!   per drain; the rest wait for the next tick.
//! - **background**: drained by a single worker started on demand. The worker
//!   runs until the queue is empty and then exits, so nothing idles while
//!   there is no work.
//!
//! Delayed variants enqueue after a timer fires. A panicking work item is
//! logged and draining continues with the next one.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::{BusConfig, DEFAULT_MAIN_BATCH};

/// A deferred, zero-argument action.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Main,
    Background,
}

/// Cross-context work queues. Cheap to clone; clones share the queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    main: Mutex<VecDeque<WorkItem>>,
    background: Mutex<VecDeque<WorkItem>>,
    worker_active: AtomicBool,
    closed: AtomicBool,
    batch_size: usize,
    /// Runtime for timers and the blocking pool; plain threads without one.
    runtime: Option<Handle>,
}

impl Dispatcher {
    /// Create a dispatcher running at most `batch_size` main items per drain.
    ///
    /// Picks up the current tokio runtime if there is one.
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                main: Mutex::new(VecDeque::new()),
                background: Mutex::new(VecDeque::new()),
                worker_active: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                batch_size: batch_size.max(1),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.main_batch_size)
    }

    /// Queue `action` for the main context.
    pub fn invoke_main<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.push(Target::Main, Box::new(action))
    }

    /// Queue `action` for the background worker.
    pub fn invoke_async<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.push(Target::Background, Box::new(action))
    }

    /// Queue `action` for the main context once `delay` has elapsed.
    pub fn invoke_main_after<F>(&self, action: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Target::Main, Box::new(action), delay)
    }

    /// Queue `action` for the background worker once `delay` has elapsed.
    pub fn invoke_async_after<F>(&self, action: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Target::Background, Box::new(action), delay)
    }

    /// Run up to `batch_size` main-context items in FIFO order. Call from the
    /// main context once per tick. Returns how many ran.
    pub fn drain_main(&self) -> usize {
        let mut ran = 0;
        while ran < self.inner.batch_size {
            let next = self.inner.main.lock().pop_front();
            let Some(item) = next else {
                break;
            };
            run_item(item, Target::Main);
            ran += 1;
        }
        ran
    }

    pub fn pending_main(&self) -> usize {
        self.inner.main.lock().len()
    }

    pub fn pending_background(&self) -> usize {
        self.inner.background.lock().len()
    }

    /// Whether a background worker is currently draining.
    pub fn is_worker_active(&self) -> bool {
        self.inner.worker_active.load(Ordering::SeqCst)
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// Drop queued work and reject anything enqueued later. An item already
    /// running is not interrupted.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let main = std::mem::take(&mut *self.inner.main.lock());
        let background = std::mem::take(&mut *self.inner.background.lock());
        debug!(
            "Dispatcher closed, discarded {} main and {} background items",
            main.len(),
            background.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn schedule(&self, target: Target, item: WorkItem, delay: Duration) -> bool {
        if self.is_closed() {
            debug!("Dispatcher closed, dropping delayed {target:?} item");
            return false;
        }
        let inner = Arc::clone(&self.inner);
        match &self.inner.runtime {
            Some(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.push(target, item);
                });
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name("hive-bus-timer".to_string())
                    .spawn(move || {
                        std::thread::sleep(delay);
                        inner.push(target, item);
                    });
                if let Err(e) = spawned {
                    warn!("Failed to start dispatcher timer: {e}");
                    return false;
                }
            }
        }
        true
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAIN_BATCH)
    }
}

impl DispatcherInner {
    fn push(self: &Arc<Self>, target: Target, item: WorkItem) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Dispatcher closed, dropping {target:?} item");
            return false;
        }
        match target {
            Target::Main => self.main.lock().push_back(item),
            Target::Background => {
                self.background.lock().push_back(item);
                self.ensure_worker();
            }
        }
        true
    }

    /// Start a worker unless one is already draining.
    fn ensure_worker(self: &Arc<Self>) {
        if self.worker_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(self);
        let job = move || worker.drain_background();
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(job);
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name("hive-bus-worker".to_string())
                    .spawn(job);
                if let Err(e) = spawned {
                    warn!("Failed to start dispatcher worker: {e}");
                    self.worker_active.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    fn drain_background(&self) {
        loop {
            let next = self.background.lock().pop_front();
            match next {
                Some(item) => run_item(item, Target::Background),
                None => {
                    self.worker_active.store(false, Ordering::SeqCst);
                    // An item may have landed between the pop and the store;
                    // whoever flips the flag back owns the drain.
                    if self.background.lock().is_empty()
                        || self.worker_active.swap(true, Ordering::SeqCst)
                    {
                        break;
                    }
                }
            }
        }
    }
}

fn run_item(item: WorkItem, target: Target) {
    if catch_unwind(AssertUnwindSafe(item)).is_err() {
        warn!("Dispatcher {target:?} work item panicked");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
