//! Reactor pool and per-object timers.
//!
//! A reactor is a single-threaded event loop executing posted work items
//! in FIFO order. Every stateful object in this crate (SRT session, media
//! source, HTTP client) is pinned to one reactor at creation and mutated
//! only from that reactor's thread, so no object needs its own lock
//! discipline beyond interior mutability.
//!
//! ```text
//! ReactorPool ── allocate() ──> Arc<Reactor>   (round-robin)
//!                                  │
//!                     post / post_delayed / register_tick
//!                                  │
//!                      dedicated thread, serial FIFO
//! ```
//!
//! Each reactor also drives a periodic tick (~100 ms). Objects implement
//! [`Manage`] and register a weak handle; the tick upgrades the handle and
//! calls `on_manager()`, which is where timeout enforcement lives. A
//! destroyed object is simply never upgraded, so a timeout can never fire
//! on a dead object.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Interval between periodic ticks on every reactor.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of work executed on a reactor thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Periodic maintenance hook, driven from the owning reactor's tick.
pub trait Manage: Send + Sync {
    fn on_manager(&self);
}

struct DelayedTask {
    due: Instant,
    task: Task,
}

/// A single-threaded event loop. Obtained from [`ReactorPool::allocate`];
/// cheap to share via `Arc`.
pub struct Reactor {
    id: usize,
    tx: mpsc::Sender<Task>,
    running: Arc<AtomicBool>,
    ticks: Arc<Mutex<Vec<Weak<dyn Manage>>>>,
    delayed: Arc<Mutex<Vec<DelayedTask>>>,
}

impl Reactor {
    /// Enqueue a work item for serial execution on this reactor.
    ///
    /// Posting after shutdown is a silently dropped no-op.
    pub fn post(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::trace!(reactor = self.id, "post on stopped reactor dropped");
        }
    }

    /// Run `task` after at least `delay`, at tick granularity.
    pub fn post_delayed(&self, delay: Duration, task: Task) {
        self.delayed.lock().push(DelayedTask {
            due: Instant::now() + delay,
            task,
        });
    }

    /// Register an object for the periodic tick. The handle is weak: once
    /// the object is dropped, its slot is pruned and no tick is delivered.
    pub fn register_tick(&self, target: Weak<dyn Manage>) {
        self.ticks.lock().push(target);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn fire_ticks(&self) {
        // Snapshot under the lock, upgrade + call outside it: on_manager
        // may post work or register further ticks.
        let snapshot: Vec<Weak<dyn Manage>> = {
            let mut ticks = self.ticks.lock();
            ticks.retain(|w| w.strong_count() > 0);
            ticks.clone()
        };
        for weak in snapshot {
            if let Some(target) = weak.upgrade() {
                target.on_manager();
            }
        }
    }

    fn run_due_delayed(&self) {
        let now = Instant::now();
        let due: Vec<Task> = {
            let mut delayed = self.delayed.lock();
            let mut fired = Vec::new();
            let mut i = 0;
            while i < delayed.len() {
                if delayed[i].due <= now {
                    fired.push(delayed.swap_remove(i).task);
                } else {
                    i += 1;
                }
            }
            fired
        };
        for task in due {
            task();
        }
    }
}

/// A fixed pool of reactors with round-robin pinning.
///
/// Dropping the pool stops and joins every loop; work posted afterwards
/// is discarded.
pub struct ReactorPool {
    reactors: Vec<Arc<Reactor>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl ReactorPool {
    /// Spawn `threads` reactor loops (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let mut reactors = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let (tx, rx) = mpsc::channel::<Task>();
            let running = Arc::new(AtomicBool::new(true));
            let ticks: Arc<Mutex<Vec<Weak<dyn Manage>>>> = Arc::new(Mutex::new(Vec::new()));
            let delayed = Arc::new(Mutex::new(Vec::new()));

            let reactor = Arc::new(Reactor {
                id,
                tx,
                running: running.clone(),
                ticks,
                delayed,
            });

            let loop_reactor = reactor.clone();
            let handle = thread::Builder::new()
                .name(format!("reactor-{id}"))
                .spawn(move || reactor_loop(loop_reactor, rx))
                .expect("spawn reactor thread");

            reactors.push(reactor);
            handles.push(handle);
        }

        tracing::debug!(threads, "reactor pool started");
        ReactorPool {
            reactors,
            handles: Mutex::new(handles),
            next: AtomicUsize::new(0),
        }
    }

    /// Pick a reactor for a new session/source/client (round-robin).
    pub fn allocate(&self) -> Arc<Reactor> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[i].clone()
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        for reactor in &self.reactors {
            reactor.running.store(false, Ordering::SeqCst);
            // Wake the loop in case it is parked in recv_timeout.
            let _ = reactor.tx.send(Box::new(|| {}));
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("reactor pool stopped");
    }
}

fn reactor_loop(reactor: Arc<Reactor>, rx: mpsc::Receiver<Task>) {
    let mut next_tick = Instant::now() + TICK_INTERVAL;
    let mut backlog: VecDeque<Task> = VecDeque::new();

    while reactor.running.load(Ordering::SeqCst) {
        while let Some(task) = backlog.pop_front() {
            task();
        }

        let timeout = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                // Drain whatever queued up behind it without re-parking.
                while let Ok(task) = rx.try_recv() {
                    backlog.push_back(task);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_tick {
            reactor.fire_ticks();
            reactor.run_due_delayed();
            next_tick = Instant::now() + TICK_INTERVAL;
        }
    }
    tracing::trace!(reactor = reactor.id, "reactor loop exited");
}

/// Elapsed-time stopwatch used for timeout enforcement and session
/// duration reporting.
#[derive(Debug)]
pub struct Ticker {
    created: Instant,
    last: Mutex<Instant>,
}

impl Ticker {
    pub fn new() -> Self {
        let now = Instant::now();
        Ticker {
            created: now,
            last: Mutex::new(now),
        }
    }

    /// Time since the last [`reset`](Self::reset) (or construction).
    pub fn elapsed(&self) -> Duration {
        self.last.lock().elapsed()
    }

    pub fn reset(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since construction, unaffected by resets.
    pub fn created_elapsed(&self) -> Duration {
        self.created.elapsed()
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
