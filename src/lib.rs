//! # srtcast — SRT live media fan-out library
//!
//! A library core for live streaming servers: SRT sessions ingest an
//! MPEG-TS stream once and fan it out to many players with GOP-aligned
//! replay, plus an outbound HTTP/1.1 client for signalling and pulling.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Transport adapters (SRT sockets, admin API)  │
//! ├───────────────────────────────────────────────┤
//! │  SrtSession   — per-connection state machine  │
//! │  EventBus     — auth + flow-report broadcast  │
//! ├───────────────────────────────────────────────┤
//! │  TsDemuxer / Muxer / TsMediaSource            │
//! │  MediaRegistry — identity → source, async find│
//! │  RingBuffer   — multi-reader GOP fan-out      │
//! ├───────────────────────────────────────────────┤
//! │  ReactorPool  — pinned single-thread loops    │
//! │  HttpClient   — outbound HTTP/1.1 + proxy     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use srtcast::{Config, EventBus, MediaRegistry, ReactorPool, SrtSession};
//! # use srtcast::{SessionSink, TsPacket, Error};
//! # struct MySink;
//! # impl SessionSink for MySink {
//! #     fn send_ts(&self, _packet: &TsPacket, _flush: bool) {}
//! #     fn on_shutdown(&self, _err: &Error) {}
//! # }
//!
//! let config = Config::default();
//! let pool = ReactorPool::new(config.reactor_threads);
//! let registry = MediaRegistry::new();
//! let bus = Arc::new(EventBus::new());
//!
//! // One session per accepted SRT connection; the transport layer feeds
//! // it the handshake and data packets.
//! let session = SrtSession::new(
//!     pool.allocate(),
//!     registry.clone(),
//!     bus.clone(),
//!     &config,
//!     Box::new(MySink),
//! );
//! session.on_handshake_finished(
//!     "v1/live/cam?type=push".into(),
//!     "203.0.113.7:9000".parse().unwrap(),
//! );
//! ```
//!
//! ## Crate layout
//!
//! - [`reactor`] — [`ReactorPool`]/[`Reactor`] pinned event loops, [`Ticker`].
//! - [`session`] — [`SrtSession`] publish/play state machine.
//! - [`media`] — identity, TS packets, GOP cache, ring fan-out, source.
//! - [`registry`] — [`MediaRegistry`] with asynchronous find.
//! - [`mux`] / [`demux`] — muxer boundary and packet-level TS demuxer.
//! - [`event`] — [`EventBus`] lifecycle broadcast with one-shot invokers.
//! - [`http`] — [`HttpClient`] outbound HTTP/1.1 transactions.
//! - [`config`] — [`Config`] defaults + TOML loading.
//! - [`error`] — [`Error`] enum and [`Result`] alias.

pub mod config;
pub mod demux;
pub mod error;
pub mod event;
pub mod http;
pub mod media;
pub mod mux;
pub mod reactor;
pub mod registry;
pub mod session;
pub mod url;

pub use config::{Config, HttpConfig};
pub use demux::{DemuxEvent, TsDemuxer};
pub use error::{Error, Result, TimeoutKind};
pub use event::{AuthInvoker, Event, EventBus, OriginType, SockInfo};
pub use http::{BufferBody, CookieJar, Headers, HttpBody, HttpClient, HttpHandler};
pub use media::{
    Batch, Frame, MediaIdentity, MediaInfo, PacketCache, RingBuffer, RingReader, SourceDelegate,
    TS_SCHEMA, Track, TsMediaSource, TsPacket,
};
pub use mux::{Muxer, TsMuxer};
pub use reactor::{Manage, Reactor, ReactorPool, Ticker};
pub use registry::MediaRegistry;
pub use session::{DataPacket, SessionSink, SrtSession};
