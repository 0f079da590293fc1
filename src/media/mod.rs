//! Media identity, packet types, and the live fan-out pipeline.
//!
//! Publish path, left to right:
//!
//! ```text
//! SRT payloads ─> demux ─> Frame ─> muxer ─> TsMediaSource::on_write
//!                                                │
//!                                     PacketCache (GOP grouping)
//!                                                │  flush
//!                                                ▼
//!                                           RingBuffer ─> RingReader per player
//! ```
//!
//! - [`info`] — [`MediaInfo`] / [`MediaIdentity`]: who a stream is.
//! - [`packet`] — [`TsPacket`], [`Frame`], [`Track`] boundary types.
//! - [`cache`] — [`PacketCache`]: merge-write accumulator with GOP alignment.
//! - [`ring`] — [`RingBuffer`] / [`RingReader`]: bounded multi-reader fan-out.
//! - [`source`] — [`TsMediaSource`]: one identity, one ring, one publisher.

pub mod cache;
pub mod info;
pub mod packet;
pub mod ring;
pub mod source;

pub use cache::{Batch, PacketCache};
pub use info::{MediaIdentity, MediaInfo, TS_SCHEMA};
pub use packet::{Frame, Track, TsPacket};
pub use ring::{RingBuffer, RingReader};
pub use source::{SourceDelegate, TsMediaSource};
