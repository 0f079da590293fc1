//! Bounded multi-reader fan-out ring with keyframe-aligned replay.
//!
//! One writer, `R` readers. Every reader observes batches in write order
//! (never reordered, never duplicated). Each reader owns a bounded queue:
//! a slow reader drops *its own* oldest batches and nobody else's. The
//! writer is never blocked, because this is live streaming.
//!
//! The ring additionally keeps a cached-GOP tail: the batches written
//! since the last `key_pos` write. A newly attached reader is seeded with
//! this tail, so video playback starts at the most recent keyframe
//! instead of waiting for the next one.
//!
//! Delivery is asynchronous: batches are handed to the reader's reactor
//! and dispatched to its read callback there, keeping all reader-side
//! state on a single thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::reactor::Reactor;

/// Fired with the new reader count after every attach/detach.
pub type ReaderCountCallback = Box<dyn Fn(usize) + Send + Sync>;

/// Fixed-capacity fan-out queue of GOP batches.
pub struct RingBuffer<T: Clone + Send + 'static> {
    capacity: usize,
    inner: Mutex<RingInner<T>>,
    on_reader_change: ReaderCountCallback,
}

struct RingInner<T: Clone + Send + 'static> {
    /// Replay tip: everything written since the last `key_pos` batch.
    cache: VecDeque<T>,
    readers: Vec<(u64, Weak<RingReader<T>>)>,
    next_id: u64,
}

impl<T: Clone + Send + 'static> RingBuffer<T> {
    pub fn new(capacity: usize, on_reader_change: ReaderCountCallback) -> Arc<Self> {
        Arc::new(RingBuffer {
            capacity: capacity.max(1),
            inner: Mutex::new(RingInner {
                cache: VecDeque::new(),
                readers: Vec::new(),
                next_id: 0,
            }),
            on_reader_change,
        })
    }

    /// Append a batch. `key_pos` marks the start of a new GOP and rotates
    /// the cached replay tip.
    pub fn write(&self, item: T, key_pos: bool) {
        let readers: Vec<Arc<RingReader<T>>> = {
            let mut inner = self.inner.lock();
            if key_pos {
                inner.cache.clear();
            }
            inner.cache.push_back(item.clone());
            if inner.cache.len() > self.capacity {
                // A GOP larger than the ring cannot be replayed; drop the tip.
                inner.cache.clear();
            }
            inner.readers.retain(|(_, w)| w.strong_count() > 0);
            inner.readers.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for reader in readers {
            reader.push(item.clone());
        }
    }

    /// Attach a new reader pinned to `reactor`. The reader is seeded with
    /// the cached GOP and then receives subsequent writes in order.
    pub fn attach(self: &Arc<Self>, reactor: Arc<Reactor>) -> Arc<RingReader<T>> {
        let (reader, count) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            let reader = Arc::new(RingReader {
                id,
                reactor,
                ring: Arc::downgrade(self),
                capacity: self.capacity,
                queue: Mutex::new(inner.cache.iter().cloned().collect()),
                draining: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                read_cb: Mutex::new(None),
                detach_cb: Mutex::new(None),
                info: Mutex::new(String::new()),
            });
            inner.readers.push((id, Arc::downgrade(&reader)));
            (reader, inner.readers.len())
        };
        tracing::debug!(reader_id = reader.id, count, "ring reader attached");
        (self.on_reader_change)(count);
        reader
    }

    /// Empty the cached-GOP tail without touching attached readers.
    pub fn clear_cache(&self) {
        self.inner.lock().cache.clear();
    }

    pub fn reader_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.readers.retain(|(_, w)| w.strong_count() > 0);
        inner.readers.len()
    }

    /// Snapshot of per-reader info strings, through `transform`.
    pub fn get_info_list<R>(&self, transform: impl Fn(&str) -> R) -> Vec<R> {
        let readers: Vec<Arc<RingReader<T>>> = {
            let inner = self.inner.lock();
            inner.readers.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        readers.iter().map(|r| transform(&r.info.lock())).collect()
    }

    fn remove_reader(&self, id: u64) {
        let count = {
            let mut inner = self.inner.lock();
            let before = inner.readers.len();
            inner.readers.retain(|(rid, w)| *rid != id && w.strong_count() > 0);
            if inner.readers.len() == before {
                return;
            }
            inner.readers.len()
        };
        tracing::debug!(reader_id = id, count, "ring reader detached");
        (self.on_reader_change)(count);
    }
}

impl<T: Clone + Send + 'static> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // Writer gone: notify every surviving reader on its own reactor.
        let readers: Vec<Arc<RingReader<T>>> = {
            let mut inner = self.inner.lock();
            inner.readers.drain(..).filter_map(|(_, w)| w.upgrade()).collect()
        };
        for reader in readers {
            let target = reader.clone();
            reader.reactor.post(Box::new(move || target.fire_detach()));
        }
    }
}

/// One reader's view of a ring. Obtained from [`RingBuffer::attach`];
/// dropping the handle detaches.
pub struct RingReader<T: Clone + Send + 'static> {
    id: u64,
    reactor: Arc<Reactor>,
    ring: Weak<RingBuffer<T>>,
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    draining: AtomicBool,
    detached: AtomicBool,
    dropped: AtomicU64,
    read_cb: Mutex<Option<Box<dyn FnMut(T) + Send>>>,
    detach_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    info: Mutex<String>,
}

impl<T: Clone + Send + 'static> RingReader<T> {
    /// Install the delivery callback. Runs on this reader's reactor, one
    /// batch at a time, in write order. Queued batches (including the
    /// seeded GOP) are delivered once the callback is in place.
    pub fn set_read_cb(self: &Arc<Self>, cb: impl FnMut(T) + Send + 'static) {
        *self.read_cb.lock() = Some(Box::new(cb));
        self.schedule_drain();
    }

    /// Install the writer-gone callback, fired on this reader's reactor
    /// when the ring is destroyed (not when this reader detaches itself).
    pub fn set_detach_cb(&self, cb: impl FnOnce() + Send + 'static) {
        *self.detach_cb.lock() = Some(Box::new(cb));
    }

    /// Opaque observability string reported via
    /// [`RingBuffer::get_info_list`].
    pub fn set_info(&self, info: impl Into<String>) {
        *self.info.lock() = info.into();
    }

    /// Batches this reader has discarded for falling behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Detach from the ring. Idempotent; also performed on drop.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ring) = self.ring.upgrade() {
            ring.remove_reader(self.id);
        }
    }

    fn push(self: &Arc<Self>, item: T) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(reader_id = self.id, total, "slow reader dropped oldest batch");
            }
            queue.push_back(item);
        }
        self.schedule_drain();
    }

    fn schedule_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let target = self.clone();
        self.reactor.post(Box::new(move || target.drain()));
    }

    fn drain(self: Arc<Self>) {
        loop {
            {
                let mut cb_guard = self.read_cb.lock();
                let Some(cb) = cb_guard.as_mut() else {
                    // No consumer yet: keep batches queued, retry on set_read_cb.
                    self.draining.store(false, Ordering::SeqCst);
                    return;
                };
                loop {
                    let item = self.queue.lock().pop_front();
                    match item {
                        Some(item) => cb(item),
                        None => break,
                    }
                }
            }
            self.draining.store(false, Ordering::SeqCst);
            // A push may have raced the flag reset.
            if self.queue.lock().is_empty() || self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    fn fire_detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        if let Some(cb) = self.detach_cb.lock().take() {
            cb();
        }
    }
}

impl<T: Clone + Send + 'static> Drop for RingReader<T> {
    fn drop(&mut self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            if let Some(ring) = self.ring.upgrade() {
                ring.remove_reader(self.id);
            }
        }
    }
}
