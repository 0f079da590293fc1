//! Process-wide media source registry.
//!
//! Maps a [`MediaIdentity`] to a live [`TsMediaSource`]. Entries are weak:
//! the registry never keeps a source alive, it only makes it findable.
//! Mutation takes one exclusive lock; lookups are cheap.
//!
//! [`find_async`](MediaRegistry::find_async) is the play-before-publish
//! path: a player asking for a stream that is not live yet parks a waiter
//! that fires the moment a publisher registers the identity, or with
//! `None` once the bounded wait expires. Callbacks are always delivered
//! on the requester's reactor, so sessions never see cross-thread calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::media::{MediaIdentity, TsMediaSource};
use crate::reactor::Reactor;

/// One-shot result callback for [`MediaRegistry::find_async`].
pub type FindCallback = Box<dyn FnOnce(Option<Arc<TsMediaSource>>) + Send>;

struct Waiter {
    id: u64,
    identity: MediaIdentity,
    reactor: Arc<Reactor>,
    cb: FindCallback,
}

#[derive(Default)]
struct RegistryInner {
    sources: HashMap<MediaIdentity, Weak<TsMediaSource>>,
    waiters: Vec<Waiter>,
}

pub struct MediaRegistry {
    inner: Mutex<RegistryInner>,
    next_waiter: AtomicU64,
}

impl MediaRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(MediaRegistry {
            inner: Mutex::new(RegistryInner::default()),
            next_waiter: AtomicU64::new(0),
        })
    }

    /// Register a source under its identity and wake matching waiters.
    ///
    /// Returns [`Error::Conflict`] when a *live* source already owns the
    /// identity; a dead entry (publisher gone, teardown not yet run) is
    /// silently replaced.
    pub fn register(&self, source: &Arc<TsMediaSource>) -> Result<()> {
        let identity = source.info().identity();
        let ready: Vec<Waiter> = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.sources.get(&identity) {
                if existing.strong_count() > 0 {
                    tracing::warn!(identity = %identity, "publish conflict: identity already live");
                    return Err(Error::Conflict);
                }
            }
            inner.sources.insert(identity.clone(), Arc::downgrade(source));

            let mut ready = Vec::new();
            let mut i = 0;
            while i < inner.waiters.len() {
                if inner.waiters[i].identity == identity {
                    ready.push(inner.waiters.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };

        tracing::info!(identity = %identity, waiters = ready.len(), "media source registered");
        for waiter in ready {
            let src = source.clone();
            let cb = waiter.cb;
            waiter.reactor.post(Box::new(move || cb(Some(src))));
        }
        Ok(())
    }

    /// Remove `identity`, but only if it is still owned by `owner` (or the
    /// entry is already dead). A reconnected publisher that re-registered
    /// the identity keeps its fresh entry.
    pub fn unregister(&self, identity: &MediaIdentity, owner: &Weak<TsMediaSource>) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.sources.get(identity) {
                Some(existing) if Weak::ptr_eq(existing, owner) || existing.strong_count() == 0 => {
                    inner.sources.remove(identity);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!(identity = %identity, "media source unregistered");
        }
    }

    /// Synchronous lookup.
    pub fn find(&self, identity: &MediaIdentity) -> Option<Arc<TsMediaSource>> {
        self.inner.lock().sources.get(identity).and_then(Weak::upgrade)
    }

    /// Asynchronous lookup with a bounded wait for the publisher to show
    /// up. `cb` runs exactly once, on `reactor`.
    pub fn find_async(
        self: &Arc<Self>,
        identity: MediaIdentity,
        reactor: Arc<Reactor>,
        timeout: Duration,
        cb: FindCallback,
    ) {
        if let Some(source) = self.find(&identity) {
            reactor.post(Box::new(move || cb(Some(source))));
            return;
        }

        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(identity = %identity, waiter = id, ?timeout, "stream not live yet, waiting");
        self.inner.lock().waiters.push(Waiter {
            id,
            identity,
            reactor: reactor.clone(),
            cb,
        });

        let registry = Arc::downgrade(self);
        reactor.post_delayed(
            timeout,
            Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.expire_waiter(id);
                }
            }),
        );
    }

    /// Number of live registered sources.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .sources
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire_waiter(&self, id: u64) {
        let waiter = {
            let mut inner = self.inner.lock();
            let pos = inner.waiters.iter().position(|w| w.id == id);
            pos.map(|p| inner.waiters.swap_remove(p))
        };
        // Runs on the waiter's own reactor (the delayed task was posted
        // there), so the callback fires in-place.
        if let Some(waiter) = waiter {
            tracing::debug!(identity = %waiter.identity, waiter = id, "find wait expired");
            (waiter.cb)(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::media::{MediaInfo, TS_SCHEMA, TsPacket};
    use crate::reactor::ReactorPool;
    use std::sync::mpsc::channel;
    use std::time::Instant;

    fn live_source(registry: &Arc<MediaRegistry>, url: &str) -> Arc<TsMediaSource> {
        let info = MediaInfo::parse(url).unwrap();
        let source = TsMediaSource::new(&info, registry.clone(), &Config::default());
        source
            .on_write(TsPacket::new(vec![0x47; 188], 0, true), true)
            .unwrap();
        source
    }

    #[test]
    fn find_async_immediate_when_live() {
        let pool = ReactorPool::new(1);
        let registry = MediaRegistry::new();
        let source = live_source(&registry, "srt://v1/live/cam");

        let (tx, rx) = channel();
        registry.find_async(
            source.info().identity(),
            pool.allocate(),
            Duration::from_secs(1),
            Box::new(move |src| tx.send(src.is_some()).unwrap()),
        );
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn find_async_fires_on_later_registration() {
        let pool = ReactorPool::new(1);
        let registry = MediaRegistry::new();
        let identity = MediaInfo::parse("srt://v1/live/cam")
            .unwrap()
            .identity_in(TS_SCHEMA);

        let (tx, rx) = channel();
        registry.find_async(
            identity,
            pool.allocate(),
            Duration::from_secs(5),
            Box::new(move |src| tx.send(src.is_some()).unwrap()),
        );

        let _source = live_source(&registry, "srt://v1/live/cam");
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn find_async_times_out_with_none() {
        let pool = ReactorPool::new(1);
        let registry = MediaRegistry::new();
        let identity = MediaInfo::parse("srt://v1/live/missing")
            .unwrap()
            .identity_in(TS_SCHEMA);

        let (tx, rx) = channel();
        let start = Instant::now();
        registry.find_async(
            identity,
            pool.allocate(),
            Duration::from_millis(200),
            Box::new(move |src| tx.send(src.is_none()).unwrap()),
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn dead_entry_is_replaced_without_conflict() {
        let registry = MediaRegistry::new();
        let first = live_source(&registry, "srt://v1/live/cam");
        let identity = first.info().identity();
        drop(first);

        assert!(registry.find(&identity).is_none());
        let _second = live_source(&registry, "srt://v1/live/cam");
        assert!(registry.find(&identity).is_some());
    }

    #[test]
    fn unregister_ignores_foreign_owner() {
        let registry = MediaRegistry::new();
        let source = live_source(&registry, "srt://v1/live/cam");
        let identity = source.info().identity();

        // A stale owner handle must not evict the live entry.
        registry.unregister(&identity, &Weak::new());
        assert!(registry.find(&identity).is_some());
    }
}
