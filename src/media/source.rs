//! TS live media source: one publisher fanned out to many readers.
//!
//! A `TsMediaSource` binds a [`RingBuffer`] and a [`PacketCache`] to a
//! `(ts, vhost, app, stream)` identity. It is created by the publish path
//! but stays unregistered until the first packet is written; registration
//! is what makes the stream discoverable (and is where a second publisher
//! on the same identity is rejected with `Conflict`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::media::cache::{Batch, PacketCache};
use crate::media::info::{MediaInfo, TS_SCHEMA};
use crate::media::packet::TsPacket;
use crate::media::ring::{RingBuffer, RingReader};
use crate::reactor::Reactor;
use crate::registry::MediaRegistry;

/// Receives reader-count edges from the source's ring. Implemented by the
/// owning publisher session; held weakly so a stale edge is a no-op.
pub trait SourceDelegate: Send + Sync {
    fn on_reader_changed(&self, count: usize);
}

pub struct TsMediaSource {
    info: MediaInfo,
    registry: Arc<MediaRegistry>,
    ring_capacity: usize,
    ring: Mutex<Option<Arc<RingBuffer<Batch>>>>,
    cache: Mutex<PacketCache>,
    have_video: AtomicBool,
    bytes_in: AtomicU64,
    delegate: Mutex<Weak<dyn SourceDelegate>>,
    /// The weak handle stored in the registry, kept so teardown removes
    /// only its own entry (a reconnected publisher may have re-registered
    /// the identity in the meantime).
    self_weak: Mutex<Weak<TsMediaSource>>,
    registered: AtomicBool,
}

impl TsMediaSource {
    /// Build a source for `info`, re-keyed under the TS schema. The ring
    /// is created (and the source registered) lazily on first write.
    pub fn new(info: &MediaInfo, registry: Arc<MediaRegistry>, config: &Config) -> Arc<Self> {
        let mut info = info.clone();
        info.schema = TS_SCHEMA.to_string();
        Arc::new(TsMediaSource {
            info,
            registry,
            ring_capacity: config.ring_capacity,
            ring: Mutex::new(None),
            cache: Mutex::new(PacketCache::new(config.merge_write_bytes)),
            have_video: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            delegate: Mutex::new(Weak::<NoDelegate>::new()),
            self_weak: Mutex::new(Weak::new()),
            registered: AtomicBool::new(false),
        })
    }

    /// Ingest one TS packet. `key` marks the first packet of a GOP.
    ///
    /// The first write creates the ring and registers the source; a
    /// conflicting live publisher surfaces here as `Err(Conflict)`.
    pub fn on_write(self: &Arc<Self>, packet: TsPacket, key: bool) -> Result<()> {
        self.bytes_in.fetch_add(packet.size() as u64, Ordering::Relaxed);
        let ring = self.ensure_ring()?;
        if key {
            self.have_video.store(true, Ordering::Relaxed);
        }

        let flushed = self.cache.lock().input(packet, key);
        // Without video there is no GOP to wait for: flag every batch as
        // a join point so late readers start immediately.
        let have_video = self.have_video.load(Ordering::Relaxed);
        for (batch, key_pos) in flushed {
            ring.write(batch, if have_video { key_pos } else { true });
        }
        Ok(())
    }

    /// Attach a reader pinned to `reactor`. `None` until the first write
    /// has created the ring.
    pub fn attach(&self, reactor: Arc<Reactor>) -> Option<Arc<RingReader<Batch>>> {
        self.ring.lock().as_ref().map(|ring| ring.attach(reactor))
    }

    pub fn reader_count(&self) -> usize {
        self.ring.lock().as_ref().map_or(0, |r| r.reader_count())
    }

    /// Drop both the merge-write accumulator and the ring's cached GOP.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        if let Some(ring) = self.ring.lock().as_ref() {
            ring.clear_cache();
        }
    }

    /// Per-reader observability snapshot.
    pub fn get_info_list<R>(&self, transform: impl Fn(&str) -> R) -> Vec<R> {
        self.ring
            .lock()
            .as_ref()
            .map_or_else(Vec::new, |r| r.get_info_list(transform))
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn have_video(&self) -> bool {
        self.have_video.load(Ordering::Relaxed)
    }

    pub fn set_delegate(&self, delegate: Weak<dyn SourceDelegate>) {
        *self.delegate.lock() = delegate;
    }

    fn ensure_ring(self: &Arc<Self>) -> Result<Arc<RingBuffer<Batch>>> {
        let mut guard = self.ring.lock();
        if let Some(ring) = guard.as_ref() {
            return Ok(ring.clone());
        }

        let weak = Arc::downgrade(self);
        let ring = RingBuffer::new(
            self.ring_capacity,
            Box::new(move |count| {
                if let Some(source) = weak.upgrade() {
                    source.on_reader_changed(count);
                }
            }),
        );

        self.registry.register(self)?;
        *self.self_weak.lock() = Arc::downgrade(self);
        self.registered.store(true, Ordering::SeqCst);
        *guard = Some(ring.clone());
        Ok(ring)
    }

    fn on_reader_changed(&self, count: usize) {
        tracing::debug!(stream = %self.info.tuple(), count, "source reader count changed");
        if let Some(delegate) = self.delegate.lock().upgrade() {
            delegate.on_reader_changed(count);
        }
    }
}

impl Drop for TsMediaSource {
    fn drop(&mut self) {
        // Hand any buffered tail to surviving readers before the ring goes.
        if let Some(ring) = self.ring.lock().as_ref() {
            if let Some((batch, key_pos)) = self.cache.lock().flush() {
                let have_video = self.have_video.load(Ordering::Relaxed);
                ring.write(batch, if have_video { key_pos } else { true });
            }
        }
        if self.registered.load(Ordering::SeqCst) {
            self.registry
                .unregister(&self.info.identity(), &self.self_weak.lock());
        }
        tracing::debug!(stream = %self.info.tuple(), bytes = self.bytes_in(), "media source released");
    }
}

/// Placeholder so the delegate slot can start out dangling.
struct NoDelegate;
impl SourceDelegate for NoDelegate {
    fn on_reader_changed(&self, _count: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorPool;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn config(merge: usize) -> Config {
        Config {
            merge_write_bytes: merge,
            ring_capacity: 16,
            ..Config::default()
        }
    }

    fn info() -> MediaInfo {
        MediaInfo::parse("srt://v1/live/cam").unwrap()
    }

    fn pkt(stamp: u64, key: bool) -> TsPacket {
        TsPacket::new(vec![0x47u8; 188], stamp, key)
    }

    #[test]
    fn first_write_registers_under_ts_schema() {
        let registry = MediaRegistry::new();
        let source = TsMediaSource::new(&info(), registry.clone(), &config(188));

        let id = info().identity_in(TS_SCHEMA);
        assert!(registry.find(&id).is_none());
        source.on_write(pkt(0, true), true).unwrap();
        assert!(registry.find(&id).is_some());
    }

    #[test]
    fn drop_unregisters() {
        let registry = MediaRegistry::new();
        let source = TsMediaSource::new(&info(), registry.clone(), &config(188));
        source.on_write(pkt(0, true), true).unwrap();

        let id = info().identity_in(TS_SCHEMA);
        assert!(registry.find(&id).is_some());
        drop(source);
        assert!(registry.find(&id).is_none());
    }

    #[test]
    fn audio_only_batches_are_join_points() {
        let pool = ReactorPool::new(1);
        let registry = MediaRegistry::new();
        let source = TsMediaSource::new(&info(), registry, &config(188));

        // No keyframes at all: every flush must still seed late joiners.
        for i in 0..5 {
            source.on_write(pkt(i, false), false).unwrap();
        }
        let reader = source.attach(pool.allocate()).unwrap();
        let (tx, rx) = channel();
        reader.set_read_cb(move |batch: Batch| tx.send(batch[0].timestamp).unwrap());

        // key_pos=true on every batch keeps the replay tip at the newest
        // batch only.
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 4);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn second_source_conflicts_while_first_is_live() {
        let registry = MediaRegistry::new();
        let first = TsMediaSource::new(&info(), registry.clone(), &config(188));
        first.on_write(pkt(0, true), true).unwrap();

        let second = TsMediaSource::new(&info(), registry.clone(), &config(188));
        assert!(matches!(
            second.on_write(pkt(0, true), true),
            Err(crate::error::Error::Conflict)
        ));

        // Once the first publisher is gone the identity is free again.
        drop(first);
        second.on_write(pkt(1, true), true).unwrap();
    }
}
