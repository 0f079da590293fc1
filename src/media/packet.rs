//! Boundary types carried between the demuxer, muxer, and media source.

use std::sync::Arc;

/// An immutable, reference-counted slice of MPEG-TS payload
/// (188 × N bytes), tagged with its source timestamp and keyframe flag.
///
/// Packets with the same timestamp belong to the same access unit; GOP
/// boundaries appear only where `key` is set.
#[derive(Debug, Clone)]
pub struct TsPacket {
    pub data: Arc<[u8]>,
    /// Monotonic source-supplied timestamp, in milliseconds.
    pub timestamp: u64,
    /// First packet of a GOP.
    pub key: bool,
}

impl TsPacket {
    pub fn new(data: impl Into<Arc<[u8]>>, timestamp: u64, key: bool) -> Self {
        TsPacket {
            data: data.into(),
            timestamp,
            key,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A demuxed media frame handed to the muxer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    /// Decode timestamp in milliseconds.
    pub dts: u64,
    pub keyframe: bool,
}

impl Frame {
    pub fn new(data: impl Into<Arc<[u8]>>, dts: u64, keyframe: bool) -> Self {
        Frame {
            data: data.into(),
            dts,
            keyframe,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Track description announced by the demuxer before frames flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub codec: String,
}

impl Track {
    /// The passthrough MPEG-TS track produced by the SRT ingest path.
    pub fn mpeg_ts() -> Self {
        Track {
            codec: "mpegts".to_string(),
        }
    }
}
