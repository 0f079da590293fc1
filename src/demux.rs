//! Packet-level MPEG-TS demuxer for the SRT ingest path.
//!
//! SRT delivers opaque datagrams of MPEG-TS bytes. This demuxer restores
//! 188-byte packet alignment (resynchronizing on the 0x47 sync byte when
//! the peer misbehaves), derives a keyframe flag and timestamp per
//! packet, and emits passthrough [`Frame`]s for the muxer.
//!
//! ```text
//!  0      1      2      3      4
//! +------+------+------+------+----------------+---------+
//! | 0x47 | TEI/PUSI/PID | AFC/CC | adaptation? | payload |
//! +------+------+------+------+----------------+---------+
//!                                 │
//!                  flags: RAI (keyframe), PCR present
//! ```
//!
//! - **Keyframe**: the adaptation field's random access indicator.
//! - **Timestamp**: PCR base when present (90 kHz → ms), otherwise the
//!   last seen value carries forward.
//!
//! The first well-formed packet announces a single passthrough track
//! (`AddTrack` + `TrackComplete`); frames follow.

use crate::error::{Error, Result};
use crate::media::{Frame, Track};

/// MPEG-TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

const TS_SYNC_BYTE: u8 = 0x47;

/// Demuxer output, in stream order.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    AddTrack(Track),
    TrackComplete,
    Frame(Frame),
}

pub struct TsDemuxer {
    partial: Vec<u8>,
    announced: bool,
    stamp_ms: u64,
    skipped_bytes: u64,
}

impl TsDemuxer {
    pub fn new() -> Self {
        TsDemuxer {
            partial: Vec::new(),
            announced: false,
            stamp_ms: 0,
            skipped_bytes: 0,
        }
    }

    /// Feed one SRT payload. Returns the demuxed events; a buffer with no
    /// recoverable sync byte at all is rejected with
    /// [`Error::Protocol`] (the caller discards it and keeps the session).
    pub fn input(&mut self, data: &[u8]) -> Result<Vec<DemuxEvent>> {
        self.partial.extend_from_slice(data);

        let mut events = Vec::new();
        let mut offset = 0;

        while self.partial.len() - offset >= TS_PACKET_SIZE {
            if self.partial[offset] != TS_SYNC_BYTE {
                match self.partial[offset..].iter().position(|&b| b == TS_SYNC_BYTE) {
                    Some(skip) => {
                        self.skipped_bytes += skip as u64;
                        tracing::warn!(skip, total = self.skipped_bytes, "TS resync, bytes skipped");
                        offset += skip;
                        continue;
                    }
                    None => {
                        let junk = self.partial.len() - offset;
                        self.partial.clear();
                        return Err(Error::Protocol(format!(
                            "no TS sync byte in {junk} bytes"
                        )));
                    }
                }
            }

            let packet = self.partial[offset..offset + TS_PACKET_SIZE].to_vec();
            offset += TS_PACKET_SIZE;

            match self.parse_packet(&packet) {
                Some((stamp, key)) => {
                    if !self.announced {
                        self.announced = true;
                        events.push(DemuxEvent::AddTrack(Track::mpeg_ts()));
                        events.push(DemuxEvent::TrackComplete);
                    }
                    events.push(DemuxEvent::Frame(Frame::new(packet, stamp, key)));
                }
                None => {
                    // Transport-error packets are dropped individually.
                    self.skipped_bytes += TS_PACKET_SIZE as u64;
                }
            }
        }

        self.partial.drain(..offset);
        Ok(events)
    }

    /// Bytes discarded so far to resynchronization and error packets.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Returns `(timestamp_ms, keyframe)`, or `None` for a packet that
    /// must be dropped.
    fn parse_packet(&mut self, packet: &[u8]) -> Option<(u64, bool)> {
        let transport_error = packet[1] & 0x80 != 0;
        if transport_error {
            tracing::debug!("TS packet with transport error indicator dropped");
            return None;
        }

        let adaptation_control = (packet[3] >> 4) & 0x3;
        let mut key = false;

        if adaptation_control & 0x2 != 0 {
            let af_len = packet[4] as usize;
            if af_len > TS_PACKET_SIZE - 5 {
                tracing::debug!(af_len, "TS adaptation field overruns packet, dropped");
                return None;
            }
            if af_len >= 1 {
                let flags = packet[5];
                key = flags & 0x40 != 0; // random access indicator

                let pcr_present = flags & 0x10 != 0;
                if pcr_present && af_len >= 7 {
                    let pcr_base = ((packet[6] as u64) << 25)
                        | ((packet[7] as u64) << 17)
                        | ((packet[8] as u64) << 9)
                        | ((packet[9] as u64) << 1)
                        | ((packet[10] as u64) >> 7);
                    self.stamp_ms = pcr_base / 90;
                }
            }
        }

        Some((self.stamp_ms, key))
    }
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one TS packet; `key` adds an adaptation field with the RAI
    /// bit, `pcr` additionally encodes a PCR base.
    fn ts_packet(key: bool, pcr: Option<u64>) -> Vec<u8> {
        let mut p = vec![0u8; TS_PACKET_SIZE];
        p[0] = TS_SYNC_BYTE;
        p[1] = 0x40; // PUSI
        p[2] = 0x11; // PID 0x11
        if key || pcr.is_some() {
            p[3] = 0x30; // adaptation + payload
            let mut flags = 0u8;
            if key {
                flags |= 0x40;
            }
            if let Some(base) = pcr {
                flags |= 0x10;
                p[4] = 7;
                p[6] = (base >> 25) as u8;
                p[7] = (base >> 17) as u8;
                p[8] = (base >> 9) as u8;
                p[9] = (base >> 1) as u8;
                p[10] = ((base & 1) as u8) << 7;
            } else {
                p[4] = 1;
            }
            p[5] = flags;
        } else {
            p[3] = 0x10; // payload only
        }
        p
    }

    fn frames(events: &[DemuxEvent]) -> Vec<&Frame> {
        events
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_packet_announces_track() {
        let mut demux = TsDemuxer::new();
        let events = demux.input(&ts_packet(true, None)).unwrap();
        assert!(matches!(events[0], DemuxEvent::AddTrack(_)));
        assert!(matches!(events[1], DemuxEvent::TrackComplete));
        assert!(matches!(events[2], DemuxEvent::Frame(_)));

        // Announced once only.
        let events = demux.input(&ts_packet(false, None)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DemuxEvent::Frame(_)));
    }

    #[test]
    fn keyframe_flag_from_rai() {
        let mut demux = TsDemuxer::new();
        let mut input = ts_packet(true, None);
        input.extend(ts_packet(false, None));
        let events = demux.input(&input).unwrap();
        let frames = frames(&events);
        assert!(frames[0].keyframe);
        assert!(!frames[1].keyframe);
    }

    #[test]
    fn pcr_drives_timestamps() {
        let mut demux = TsDemuxer::new();
        let mut input = ts_packet(true, Some(90_000)); // 1000 ms
        input.extend(ts_packet(false, None));
        input.extend(ts_packet(false, Some(180_000))); // 2000 ms
        let events = demux.input(&input).unwrap();
        let frames = frames(&events);
        assert_eq!(frames[0].dts, 1000);
        assert_eq!(frames[1].dts, 1000); // carries forward
        assert_eq!(frames[2].dts, 2000);
    }

    #[test]
    fn partial_packet_carries_over() {
        let mut demux = TsDemuxer::new();
        let packet = ts_packet(false, None);
        assert!(demux.input(&packet[..100]).unwrap().is_empty());
        let events = demux.input(&packet[100..]).unwrap();
        assert_eq!(frames(&events).len(), 1);
    }

    #[test]
    fn resync_skips_leading_junk() {
        let mut demux = TsDemuxer::new();
        let mut input = vec![0x00, 0x01, 0x02];
        input.extend(ts_packet(false, None));
        let events = demux.input(&input).unwrap();
        assert_eq!(frames(&events).len(), 1);
        assert_eq!(demux.skipped_bytes(), 3);
    }

    #[test]
    fn unsyncable_buffer_is_protocol_error() {
        let mut demux = TsDemuxer::new();
        let junk = vec![0xAAu8; TS_PACKET_SIZE * 2];
        assert!(matches!(demux.input(&junk), Err(Error::Protocol(_))));
        // The session survives: the next clean packet demuxes.
        let events = demux.input(&ts_packet(true, None)).unwrap();
        assert_eq!(frames(&events).len(), 1);
    }

    #[test]
    fn transport_error_packet_dropped() {
        let mut demux = TsDemuxer::new();
        let mut bad = ts_packet(false, None);
        bad[1] |= 0x80;
        let mut input = bad;
        input.extend(ts_packet(false, None));
        let events = demux.input(&input).unwrap();
        assert_eq!(frames(&events).len(), 1);
    }
}
