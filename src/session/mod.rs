//! SRT session state machine.
//!
//! One `SrtSession` per SRT connection, pinned to a reactor. The
//! transport layer drives it with three calls: `on_handshake_finished`,
//! `on_srt_data`, and `shutdown`; everything else happens internally.
//!
//! ## Lifecycle
//!
//! ```text
//! Handshaking
//!     │ on_handshake_finished(stream_id, peer)
//!     │   empty/malformed id → BadStreamId shutdown
//!     ▼
//! Authorizing(role)            role = stream_id "type=push" ? publisher : player
//!     │ media_publish / media_played event (no subscriber → allow)
//!     ├─ publisher allow ──> Publishing { muxer, pending }
//!     │      frames arriving before the muxer exists are cached in
//!     │      order (cap 200) and replayed once authorization lands
//!     └─ player allow ─────> find_async(ts identity) ──> Playing { reader }
//!                                 │ not found in time
//!                                 ▼
//!                          ShuttingDown ──> Closed
//! ```
//!
//! Teardown detaches the reader / releases the muxer (optionally after a
//! linger window so brief publisher reconnects keep the identity), emits
//! a `flow_report` when the session moved enough bytes, and fires the
//! sink's `on_shutdown` exactly once.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::demux::{DemuxEvent, TsDemuxer};
use crate::error::Error;
use crate::event::{AuthInvoker, Event, EventBus, OriginType, SockInfo};
use crate::media::{Batch, MediaInfo, RingReader, SourceDelegate, TS_SCHEMA, TsMediaSource, TsPacket};
use crate::mux::{Muxer, TsMuxer};
use crate::reactor::{Manage, Reactor, Ticker};
use crate::registry::MediaRegistry;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One SRT datagram as delivered by the transport layer: a contiguous
/// payload of MPEG-TS bytes.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        DataPacket {
            payload: payload.into(),
        }
    }
}

/// Outbound seam to the SRT transport layer.
///
/// `send_ts` carries media to the peer (play path); `flush_hint` is set
/// on the last packet of each batch so the transport can coalesce
/// datagrams. `on_shutdown` fires at most once, after which no further
/// callbacks are delivered for the session.
pub trait SessionSink: Send + Sync {
    fn send_ts(&self, packet: &TsPacket, flush_hint: bool);
    fn on_shutdown(&self, err: &Error);
}

enum SessionState {
    Handshaking,
    Authorizing(Role),
    Publishing(Publisher),
    Playing(Player),
    ShuttingDown,
    Closed,
}

enum Role {
    Publish(Publisher),
    Play,
}

struct Publisher {
    demuxer: TsDemuxer,
    muxer: Option<Box<dyn Muxer>>,
    /// Muxer calls deferred until authorization completes, replayed in
    /// arrival order.
    pending: VecDeque<MuxerOp>,
    dropped_ops: u64,
}

enum MuxerOp {
    AddTrack(crate::media::Track),
    AddTrackCompleted,
    InputFrame(crate::media::Frame),
}

struct Player {
    reader: Arc<RingReader<Batch>>,
}

pub struct SrtSession {
    id: u64,
    reactor: Arc<Reactor>,
    registry: Arc<MediaRegistry>,
    bus: Arc<EventBus>,
    config: Config,
    sink: Box<dyn SessionSink>,
    state: Mutex<SessionState>,
    media: Mutex<Option<MediaInfo>>,
    peer: Mutex<Option<SocketAddr>>,
    total_bytes: AtomicU64,
    alive: Ticker,
    auth_wait: Ticker,
    shutdown_done: AtomicBool,
}

impl SrtSession {
    pub fn new(
        reactor: Arc<Reactor>,
        registry: Arc<MediaRegistry>,
        bus: Arc<EventBus>,
        config: &Config,
        sink: Box<dyn SessionSink>,
    ) -> Arc<Self> {
        let session = Arc::new(SrtSession {
            id: SESSION_COUNTER.fetch_add(1, Ordering::SeqCst),
            reactor: reactor.clone(),
            registry,
            bus,
            config: config.clone(),
            sink,
            state: Mutex::new(SessionState::Handshaking),
            media: Mutex::new(None),
            peer: Mutex::new(None),
            total_bytes: AtomicU64::new(0),
            alive: Ticker::new(),
            auth_wait: Ticker::new(),
            shutdown_done: AtomicBool::new(false),
        });
        reactor.register_tick(Arc::downgrade(&session) as Weak<dyn Manage>);
        tracing::debug!(session_id = session.id, "srt session created");
        session
    }

    /// The transport layer finished the SRT handshake and negotiated a
    /// `stream_id`. Runs on the session's reactor.
    pub fn on_handshake_finished(self: &Arc<Self>, stream_id: String, peer: SocketAddr) {
        let weak = Arc::downgrade(self);
        self.reactor.post(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                session.handle_handshake(stream_id, peer);
            }
        }));
    }

    /// One inbound SRT data packet. Runs on the session's reactor.
    pub fn on_srt_data(self: &Arc<Self>, packet: DataPacket) {
        let weak = Arc::downgrade(self);
        self.reactor.post(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                session.handle_data(packet);
            }
        }));
    }

    /// Terminate the session with `err`. Safe from any thread; the actual
    /// teardown runs on the session's reactor.
    pub fn shutdown(self: &Arc<Self>, err: Error) {
        let weak = Arc::downgrade(self);
        self.reactor.post(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                session.do_shutdown(err, false);
            }
        }));
    }

    /// Admin-initiated close. Refuses when `!force` and readers are still
    /// attached; otherwise posts the shutdown and reports `true`.
    pub fn close(self: &Arc<Self>, force: bool) -> bool {
        if !force && self.total_reader_count() > 0 {
            tracing::debug!(session_id = self.id, "close refused, readers attached");
            return false;
        }
        let weak = Arc::downgrade(self);
        self.reactor.post(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                // Admin close releases the muxer without linger.
                session.do_shutdown(Error::Refused("closed by admin".into()), true);
            }
        }));
        true
    }

    /// Readers attached to this publisher's outputs (0 for players).
    pub fn total_reader_count(&self) -> usize {
        match &*self.state.lock() {
            SessionState::Publishing(p) => p.muxer.as_ref().map_or(0, |m| m.total_reader_count()),
            _ => 0,
        }
    }

    /// Latency budget multiplier for the SRT transport layer's congestion
    /// control negotiation.
    pub fn latency_multiplier(&self) -> i32 {
        self.config.latency_multiplier
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.media.lock().clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Closed)
    }

    /// Current state, for observability.
    pub fn state_name(&self) -> &'static str {
        match &*self.state.lock() {
            SessionState::Handshaking => "handshaking",
            SessionState::Authorizing(Role::Publish(_)) => "authorizing_publish",
            SessionState::Authorizing(Role::Play) => "authorizing_play",
            SessionState::Publishing(_) => "publishing",
            SessionState::Playing(_) => "playing",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Closed => "closed",
        }
    }

    fn handle_handshake(self: &Arc<Self>, stream_id: String, peer: SocketAddr) {
        *self.peer.lock() = Some(peer);
        if !matches!(*self.state.lock(), SessionState::Handshaking) {
            tracing::warn!(session_id = self.id, "duplicate handshake ignored");
            return;
        }
        tracing::debug!(session_id = self.id, %peer, %stream_id, "handshake finished");

        if stream_id.is_empty() {
            self.do_shutdown(Error::BadStreamId, false);
            return;
        }
        let info = match MediaInfo::parse(&format!("srt://{stream_id}")) {
            Ok(info) => info,
            Err(_) => {
                tracing::warn!(session_id = self.id, %stream_id, "malformed stream id");
                self.do_shutdown(Error::BadStreamId, false);
                return;
            }
        };
        *self.media.lock() = Some(info.clone());

        if info.param("type") == Some("push") {
            *self.state.lock() = SessionState::Authorizing(Role::Publish(Publisher {
                demuxer: TsDemuxer::new(),
                muxer: None,
                pending: VecDeque::new(),
                dropped_ops: 0,
            }));
            self.auth_wait.reset();
            self.emit_publish(info);
        } else {
            *self.state.lock() = SessionState::Authorizing(Role::Play);
            self.auth_wait.reset();
            self.emit_play(info);
        }
    }

    fn emit_publish(self: &Arc<Self>, info: MediaInfo) {
        let weak = Arc::downgrade(self);
        let invoker = AuthInvoker::new(move |result| {
            // Continuations check liveness before touching the session.
            let Some(session) = weak.upgrade() else { return };
            let weak = Arc::downgrade(&session);
            session.reactor.post(Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    session.handle_publish_decision(result);
                }
            }));
        });

        let delivered = self.bus.emit(&Event::MediaPublish {
            origin: OriginType::SrtPush,
            media: info,
            invoker: invoker.clone(),
            sock: self.sock_info(),
        });
        if !delivered {
            tracing::debug!(session_id = self.id, "no publish auth subscriber, allowed by default");
            invoker.allow();
        }
    }

    fn emit_play(self: &Arc<Self>, info: MediaInfo) {
        let weak = Arc::downgrade(self);
        let invoker = AuthInvoker::new(move |result| {
            let Some(session) = weak.upgrade() else { return };
            let weak = Arc::downgrade(&session);
            session.reactor.post(Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    session.handle_play_decision(result);
                }
            }));
        });

        let delivered = self.bus.emit(&Event::MediaPlayed {
            media: info,
            invoker: invoker.clone(),
            sock: self.sock_info(),
        });
        if !delivered {
            tracing::debug!(session_id = self.id, "no play auth subscriber, allowed by default");
            invoker.allow();
        }
    }

    fn handle_publish_decision(self: &Arc<Self>, result: Result<(), String>) {
        let mut fail: Option<Error> = None;
        {
            let mut guard = self.state.lock();
            if !matches!(&*guard, SessionState::Authorizing(Role::Publish(_))) {
                return;
            }
            let taken = std::mem::replace(&mut *guard, SessionState::Handshaking);
            let SessionState::Authorizing(Role::Publish(mut publisher)) = taken else {
                unreachable!()
            };

            match result {
                Err(reason) => {
                    tracing::warn!(session_id = self.id, %reason, "srt publish denied");
                    fail = Some(Error::Refused(reason));
                }
                Ok(()) => {
                    let Some(media) = self.media.lock().clone() else {
                        return;
                    };
                    let mut muxer: Box<dyn Muxer> =
                        Box::new(TsMuxer::new(&media, self.registry.clone(), &self.config));
                    muxer.set_media_listener(
                        Arc::downgrade(self) as Weak<dyn SourceDelegate>
                    );
                    tracing::info!(session_id = self.id, stream = %media.tuple(), "srt publish allowed");

                    let mut pending = std::mem::take(&mut publisher.pending);
                    for op in pending.drain(..) {
                        if let Err(e) = apply_muxer_op(muxer.as_mut(), op) {
                            fail = Some(e);
                            break;
                        }
                    }
                    if fail.is_none() {
                        publisher.muxer = Some(muxer);
                        *guard = SessionState::Publishing(publisher);
                    }
                }
            }
        }
        if let Some(err) = fail {
            self.do_shutdown(err, false);
        }
    }

    fn handle_play_decision(self: &Arc<Self>, result: Result<(), String>) {
        {
            let guard = self.state.lock();
            if !matches!(&*guard, SessionState::Authorizing(Role::Play)) {
                return;
            }
        }
        match result {
            Err(reason) => {
                tracing::warn!(session_id = self.id, %reason, "srt play denied");
                self.do_shutdown(Error::Refused(reason), false);
            }
            Ok(()) => {
                let Some(media) = self.media.lock().clone() else {
                    return;
                };
                // Give the lookup its own window before the auth timer
                // would have fired.
                self.auth_wait.reset();
                let identity = media.identity_in(TS_SCHEMA);
                tracing::debug!(session_id = self.id, %identity, "srt play allowed, locating stream");

                let weak = Arc::downgrade(self);
                self.registry.find_async(
                    identity,
                    self.reactor.clone(),
                    Duration::from_millis(self.config.find_timeout_ms),
                    Box::new(move |source| {
                        let Some(session) = weak.upgrade() else {
                            tracing::trace!("session gone before stream lookup completed");
                            return;
                        };
                        match source {
                            Some(source) => session.start_play(&source),
                            None => session.do_shutdown(Error::Shutdown("stream not found".into()), false),
                        }
                    }),
                );
            }
        }
    }

    /// Attach to the found source. Runs on the session's reactor.
    fn start_play(self: &Arc<Self>, source: &Arc<TsMediaSource>) {
        {
            let guard = self.state.lock();
            match &*guard {
                SessionState::Authorizing(Role::Play) => {}
                _ => return,
            }
        }
        let Some(reader) = source.attach(self.reactor.clone()) else {
            self.do_shutdown(Error::Shutdown("stream not ready".into()), false);
            return;
        };

        let peer = self.peer_addr().map(|p| p.to_string()).unwrap_or_default();
        reader.set_info(format!("srt-{}@{peer}", self.id));

        let weak = Arc::downgrade(self);
        reader.set_detach_cb(move || {
            if let Some(session) = weak.upgrade() {
                session.do_shutdown(Error::Shutdown("source released".into()), false);
            }
        });
        let weak = Arc::downgrade(self);
        reader.set_read_cb(move |batch: Batch| {
            if let Some(session) = weak.upgrade() {
                session.forward_batch(&batch);
            }
        });

        tracing::info!(session_id = self.id, stream = %source.info().tuple(), "srt play attached");
        *self.state.lock() = SessionState::Playing(Player { reader });
    }

    /// Push one batch to the SRT send path, flagging the batch tail so
    /// the transport can flush coalesced datagrams.
    fn forward_batch(&self, batch: &[TsPacket]) {
        // A drain already queued on the reactor may land after teardown;
        // nothing may reach the sink past on_shutdown.
        if self.shutdown_done.load(Ordering::SeqCst) {
            return;
        }
        let last = batch.len().saturating_sub(1);
        for (i, packet) in batch.iter().enumerate() {
            self.total_bytes.fetch_add(packet.size() as u64, Ordering::Relaxed);
            self.sink.send_ts(packet, i == last);
        }
    }

    fn handle_data(self: &Arc<Self>, packet: DataPacket) {
        let mut fail: Option<Error> = None;
        {
            let mut guard = self.state.lock();
            match &mut *guard {
                SessionState::Authorizing(Role::Publish(p)) | SessionState::Publishing(p) => {
                    self.total_bytes
                        .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                    match p.demuxer.input(&packet.payload) {
                        Ok(events) => {
                            for event in events {
                                if let Err(e) = feed_publisher(p, event, &self.config) {
                                    fail = Some(e);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            // Bad payload: discard it, keep the session.
                            tracing::warn!(session_id = self.id, error = %e, "srt payload rejected by demuxer");
                        }
                    }
                }
                SessionState::Authorizing(Role::Play) | SessionState::Playing(_) => {
                    tracing::warn!(session_id = self.id, "data from a player peer ignored");
                }
                SessionState::Handshaking => {
                    tracing::warn!(session_id = self.id, "data before handshake ignored");
                }
                SessionState::ShuttingDown | SessionState::Closed => {}
            }
        }
        if let Some(err) = fail {
            self.do_shutdown(err, false);
        }
    }

    /// Single teardown path. `immediate` skips the muxer linger window.
    fn do_shutdown(&self, err: Error, immediate: bool) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }

        let taken = std::mem::replace(&mut *self.state.lock(), SessionState::ShuttingDown);
        let is_player = matches!(
            taken,
            SessionState::Authorizing(Role::Play) | SessionState::Playing(_)
        );
        match taken {
            SessionState::Publishing(p) | SessionState::Authorizing(Role::Publish(p)) => {
                if let Some(muxer) = p.muxer {
                    let linger = self.config.source_linger_ms;
                    if !immediate && linger > 0 {
                        tracing::debug!(session_id = self.id, linger, "muxer release deferred");
                        self.reactor
                            .post_delayed(Duration::from_millis(linger), Box::new(move || drop(muxer)));
                    } else {
                        drop(muxer);
                    }
                }
            }
            SessionState::Playing(player) => {
                player.reader.detach();
            }
            _ => {}
        }

        let bytes = self.total_bytes();
        let duration = self.alive.created_elapsed();
        let media = self.media.lock().clone();
        let role = if is_player { "player" } else { "pusher" };
        if let Some(media) = &media {
            tracing::info!(
                session_id = self.id,
                role,
                stream = %media.tuple(),
                duration_s = duration.as_secs(),
                error = %err,
                "srt session disconnected"
            );
            if bytes >= u64::from(self.config.flow_threshold_kb) * 1024 {
                self.bus.emit(&Event::FlowReport {
                    media: media.clone(),
                    bytes,
                    duration,
                    is_player,
                    sock: self.sock_info(),
                });
            }
        } else {
            tracing::info!(session_id = self.id, error = %err, "srt session disconnected before stream id");
        }

        *self.state.lock() = SessionState::Closed;
        self.sink.on_shutdown(&err);
    }

    fn sock_info(&self) -> SockInfo {
        SockInfo {
            peer_addr: self
                .peer_addr()
                .unwrap_or_else(|| "0.0.0.0:0".parse().expect("literal addr")),
            identifier: format!("srt-{}", self.id),
        }
    }
}

impl SourceDelegate for SrtSession {
    fn on_reader_changed(&self, count: usize) {
        tracing::debug!(session_id = self.id, count, "publisher reader count changed");
    }
}

impl Manage for SrtSession {
    fn on_manager(&self) {
        if self.shutdown_done.load(Ordering::SeqCst) {
            return;
        }
        let authorizing = matches!(*self.state.lock(), SessionState::Authorizing(_));
        if authorizing
            && self.auth_wait.elapsed() > Duration::from_millis(self.config.auth_timeout_ms)
        {
            tracing::warn!(session_id = self.id, "authorization window expired");
            self.do_shutdown(Error::Shutdown("authorization timed out".into()), false);
        }
    }
}

impl Drop for SrtSession {
    fn drop(&mut self) {
        tracing::debug!(session_id = self.id, "srt session dropped");
    }
}

fn apply_muxer_op(muxer: &mut dyn Muxer, op: MuxerOp) -> crate::error::Result<()> {
    match op {
        MuxerOp::AddTrack(track) => {
            muxer.add_track(track);
        }
        MuxerOp::AddTrackCompleted => muxer.add_track_completed(),
        MuxerOp::InputFrame(frame) => {
            muxer.input_frame(frame)?;
        }
    }
    Ok(())
}

/// Route one demux event into the muxer, or the pending queue while
/// authorization is still outstanding.
fn feed_publisher(p: &mut Publisher, event: DemuxEvent, config: &Config) -> crate::error::Result<()> {
    let op = match event {
        DemuxEvent::AddTrack(track) => MuxerOp::AddTrack(track),
        DemuxEvent::TrackComplete => MuxerOp::AddTrackCompleted,
        DemuxEvent::Frame(frame) => MuxerOp::InputFrame(frame),
    };
    match &mut p.muxer {
        Some(muxer) => apply_muxer_op(muxer.as_mut(), op),
        None => {
            if p.pending.len() >= config.max_pending_ops {
                p.dropped_ops += 1;
                tracing::warn!(
                    dropped = p.dropped_ops,
                    "cached muxer ops full, incoming frame dropped"
                );
            } else {
                p.pending.push_back(op);
            }
            Ok(())
        }
    }
}
