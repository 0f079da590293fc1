//! Merge-write accumulator: groups TS packets into GOP-aligned batches.
//!
//! Writing every 188-byte packet straight into the ring would wake every
//! reader per packet. The cache batches packets and flushes when:
//!
//! - the accumulator reaches the merge-write byte threshold,
//! - a new keyframe arrives while a previous non-empty GOP is buffered,
//! - the owner flushes explicitly (teardown), or
//! - [`clear`](PacketCache::clear) discards without flushing.
//!
//! Each flushed batch carries `key_pos`: whether the batch begins a new
//! GOP. The media source forces `key_pos = true` on every batch while the
//! stream has no video, so late joiners never wait for a keyframe.

use std::sync::Arc;

use super::packet::TsPacket;

/// A flushed group of packets. `key_pos` = the batch starts a GOP.
pub type Batch = Arc<Vec<TsPacket>>;

pub struct PacketCache {
    buf: Vec<TsPacket>,
    bytes: usize,
    /// Whether the first packet of the current accumulator is a keyframe.
    key_pos: bool,
    merge_bytes: usize,
}

impl PacketCache {
    pub fn new(merge_bytes: usize) -> Self {
        PacketCache {
            buf: Vec::new(),
            bytes: 0,
            key_pos: false,
            merge_bytes: merge_bytes.max(1),
        }
    }

    /// Append one packet. Returns the batches this input flushed, oldest
    /// first (at most two: the previous GOP closed by a keyframe, then a
    /// threshold flush of the new accumulator).
    pub fn input(&mut self, packet: TsPacket, key: bool) -> Vec<(Batch, bool)> {
        let mut flushed = Vec::new();

        if key && !self.buf.is_empty() {
            if let Some(batch) = self.take() {
                flushed.push(batch);
            }
        }
        if self.buf.is_empty() {
            self.key_pos = key;
        }
        self.bytes += packet.size();
        self.buf.push(packet);

        if self.bytes >= self.merge_bytes {
            if let Some(batch) = self.take() {
                flushed.push(batch);
            }
        }
        flushed
    }

    /// Flush whatever is buffered, if anything.
    pub fn flush(&mut self) -> Option<(Batch, bool)> {
        self.take()
    }

    /// Discard the accumulator without flushing.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.bytes = 0;
        self.key_pos = false;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self) -> Option<(Batch, bool)> {
        if self.buf.is_empty() {
            return None;
        }
        self.bytes = 0;
        let key_pos = std::mem::take(&mut self.key_pos);
        Some((Arc::new(std::mem::take(&mut self.buf)), key_pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(stamp: u64, key: bool) -> TsPacket {
        TsPacket::new(vec![0u8; 188], stamp, key)
    }

    #[test]
    fn threshold_flush() {
        let mut cache = PacketCache::new(188 * 3);
        assert!(cache.input(pkt(0, false), false).is_empty());
        assert!(cache.input(pkt(1, false), false).is_empty());
        let flushed = cache.input(pkt(2, false), false);
        assert_eq!(flushed.len(), 1);
        let (batch, key_pos) = &flushed[0];
        assert_eq!(batch.len(), 3);
        assert!(!key_pos);
        assert!(cache.is_empty());
    }

    #[test]
    fn keyframe_closes_previous_gop() {
        let mut cache = PacketCache::new(usize::MAX);
        cache.input(pkt(0, true), true);
        cache.input(pkt(1, false), false);
        let flushed = cache.input(pkt(2, true), true);
        assert_eq!(flushed.len(), 1);
        let (batch, key_pos) = &flushed[0];
        assert_eq!(batch.len(), 2);
        assert!(*key_pos, "flushed batch started with a keyframe");

        // The new accumulator holds the arriving keyframe.
        let (batch, key_pos) = cache.flush().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].key);
        assert!(key_pos);
    }

    #[test]
    fn key_pos_false_for_mid_gop_batch() {
        let mut cache = PacketCache::new(usize::MAX);
        cache.input(pkt(0, true), true);
        cache.flush().unwrap();
        cache.input(pkt(1, false), false);
        let (_, key_pos) = cache.flush().unwrap();
        assert!(!key_pos);
    }

    #[test]
    fn clear_discards() {
        let mut cache = PacketCache::new(usize::MAX);
        cache.input(pkt(0, true), true);
        cache.clear();
        assert!(cache.flush().is_none());
    }

    #[test]
    fn flush_empty_is_none() {
        let mut cache = PacketCache::new(188);
        assert!(cache.flush().is_none());
    }
}
