//! End-to-end publish/play scenarios over real reactors.
//!
//! A publisher session ingests hand-built MPEG-TS packets; player
//! sessions attach through the registry and receive fan-out batches via
//! their sinks. Each TS packet embeds a sequence index in its payload so
//! ordering and replay points can be asserted exactly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use srtcast::event::{TOPIC_FLOW_REPORT, TOPIC_MEDIA_PUBLISH};
use srtcast::{
    Config, DataPacket, Error, Event, EventBus, MediaRegistry, ReactorPool, SessionSink,
    SrtSession, TsPacket,
};

const TS_PACKET_SIZE: usize = 188;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShutdownKind {
    Refused,
    Shutdown,
    BadStreamId,
    Conflict,
    Other,
}

#[derive(Debug)]
enum SinkEvent {
    Packet(Vec<u8>, bool),
    Shutdown(ShutdownKind),
}

struct TestSink {
    tx: Sender<SinkEvent>,
}

impl SessionSink for TestSink {
    fn send_ts(&self, packet: &TsPacket, flush_hint: bool) {
        let _ = self
            .tx
            .send(SinkEvent::Packet(packet.data.to_vec(), flush_hint));
    }

    fn on_shutdown(&self, err: &Error) {
        let kind = match err {
            Error::Refused(_) => ShutdownKind::Refused,
            Error::Shutdown(_) => ShutdownKind::Shutdown,
            Error::BadStreamId => ShutdownKind::BadStreamId,
            Error::Conflict => ShutdownKind::Conflict,
            _ => ShutdownKind::Other,
        };
        let _ = self.tx.send(SinkEvent::Shutdown(kind));
    }
}

struct Ctx {
    pool: ReactorPool,
    registry: Arc<MediaRegistry>,
    bus: Arc<EventBus>,
    config: Config,
}

fn ctx(config: Config) -> Ctx {
    Ctx {
        pool: ReactorPool::new(2),
        registry: MediaRegistry::new(),
        bus: Arc::new(EventBus::new()),
        config,
    }
}

fn test_config() -> Config {
    Config {
        // One batch per packet keeps replay points easy to assert.
        merge_write_bytes: TS_PACKET_SIZE,
        find_timeout_ms: 2_000,
        ..Config::default()
    }
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn session(ctx: &Ctx) -> (Arc<SrtSession>, Receiver<SinkEvent>, Arc<srtcast::Reactor>) {
    let (tx, rx) = channel();
    let reactor = ctx.pool.allocate();
    let session = SrtSession::new(
        reactor.clone(),
        ctx.registry.clone(),
        ctx.bus.clone(),
        &ctx.config,
        Box::new(TestSink { tx }),
    );
    (session, rx, reactor)
}

/// One TS packet with `index` embedded in the payload tail. `key` sets
/// the adaptation field's random access indicator.
fn ts_packet(index: u16, key: bool) -> Vec<u8> {
    let mut p = vec![0u8; TS_PACKET_SIZE];
    p[0] = 0x47;
    p[1] = 0x40;
    p[2] = 0x21;
    if key {
        p[3] = 0x30;
        p[4] = 1;
        p[5] = 0x40;
    } else {
        p[3] = 0x10;
    }
    p[TS_PACKET_SIZE - 2..].copy_from_slice(&index.to_be_bytes());
    p
}

fn index_of(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[TS_PACKET_SIZE - 2], packet[TS_PACKET_SIZE - 1]])
}

/// Wait until everything already posted to `reactor` has run.
fn barrier(reactor: &srtcast::Reactor) {
    let (tx, rx) = channel();
    reactor.post(Box::new(move || tx.send(()).unwrap()));
    rx.recv_timeout(Duration::from_secs(2)).expect("reactor barrier");
}

/// Like [`barrier`], but also covers the short task chains sessions post
/// to themselves (auth decisions, find callbacks).
fn settle(reactor: &srtcast::Reactor) {
    for _ in 0..3 {
        barrier(reactor);
    }
}

fn recv_packet(rx: &Receiver<SinkEvent>) -> Vec<u8> {
    loop {
        match rx.recv_timeout(Duration::from_secs(2)).expect("sink event") {
            SinkEvent::Packet(data, _) => return data,
            SinkEvent::Shutdown(kind) => panic!("unexpected shutdown: {kind:?}"),
        }
    }
}

fn recv_shutdown(rx: &Receiver<SinkEvent>) -> ShutdownKind {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left).expect("expected shutdown") {
            SinkEvent::Shutdown(kind) => return kind,
            SinkEvent::Packet(..) => {}
        }
    }
}

#[test]
fn publish_then_play_starts_at_cached_gop() {
    let ctx = ctx(test_config());
    let (publisher, pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9001));

    // Three keyframe-led GOPs: G1 = 0..10, G2 = 10..18, G3 = 18..30.
    let mut sent = Vec::new();
    for (start, len) in [(0u16, 10u16), (10, 8), (18, 12)] {
        for i in 0..len {
            let index = start + i;
            let packet = ts_packet(index, i == 0);
            sent.push(packet.clone());
            publisher.on_srt_data(DataPacket::new(packet));
        }
    }
    settle(&pub_reactor);
    assert_eq!(publisher.state_name(), "publishing");

    let (player, play_rx, play_reactor) = session(&ctx);
    player.on_handshake_finished("v1/live/cam".into(), addr(9002));

    // The player starts at G3: indexes 18..30, byte-identical to input.
    for expect in 18u16..30 {
        let data = recv_packet(&play_rx);
        assert_eq!(index_of(&data), expect);
        assert_eq!(data, sent[expect as usize]);
    }

    // Subsequent writes arrive in order behind the replay.
    for index in 30u16..34 {
        publisher.on_srt_data(DataPacket::new(ts_packet(index, false)));
    }
    for expect in 30u16..34 {
        assert_eq!(index_of(&recv_packet(&play_rx)), expect);
    }

    settle(&play_reactor);
    assert_eq!(player.state_name(), "playing");
    assert!(pub_rx.try_recv().is_err(), "publisher saw no events");
}

#[test]
fn audio_only_late_join_needs_no_keyframe() {
    let ctx = ctx(test_config());
    let (publisher, _pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/radio?type=push".into(), addr(9011));

    // 30 audio-only packets: no keyframe anywhere.
    for index in 0u16..30 {
        publisher.on_srt_data(DataPacket::new(ts_packet(index, false)));
    }
    settle(&pub_reactor);

    let (player, play_rx, _) = session(&ctx);
    player.on_handshake_finished("v1/live/radio".into(), addr(9012));

    // Joins at the latest flush boundary, not at some never-coming GOP.
    let first = index_of(&recv_packet(&play_rx));
    assert!(first >= 29, "joined too far back: {first}");

    for index in 30u16..40 {
        publisher.on_srt_data(DataPacket::new(ts_packet(index, false)));
    }
    for expect in 30u16..40 {
        assert_eq!(index_of(&recv_packet(&play_rx)), expect);
    }
}

#[test]
fn empty_stream_id_is_rejected() {
    let ctx = ctx(test_config());
    let (session, rx, _) = session(&ctx);
    session.on_handshake_finished(String::new(), addr(9021));
    assert_eq!(recv_shutdown(&rx), ShutdownKind::BadStreamId);
    assert!(session.is_closed());
}

#[test]
fn malformed_stream_id_is_rejected() {
    let ctx = ctx(test_config());
    let (session, rx, _) = session(&ctx);
    session.on_handshake_finished("justonesegment".into(), addr(9022));
    assert_eq!(recv_shutdown(&rx), ShutdownKind::BadStreamId);
}

#[test]
fn play_of_unknown_stream_times_out() {
    let mut config = test_config();
    config.find_timeout_ms = 200;
    let ctx = ctx(config);

    let (player, rx, _) = session(&ctx);
    let start = Instant::now();
    player.on_handshake_finished("v1/live/nothing".into(), addr(9031));
    assert_eq!(recv_shutdown(&rx), ShutdownKind::Shutdown);
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[test]
fn second_publisher_conflicts() {
    let ctx = ctx(test_config());
    let (first, first_rx, first_reactor) = session(&ctx);
    first.on_handshake_finished("v1/live/cam?type=push".into(), addr(9041));
    first.on_srt_data(DataPacket::new(ts_packet(0, true)));
    settle(&first_reactor);

    let (second, second_rx, _) = session(&ctx);
    second.on_handshake_finished("v1/live/cam?type=push".into(), addr(9042));
    second.on_srt_data(DataPacket::new(ts_packet(0, true)));

    assert_eq!(recv_shutdown(&second_rx), ShutdownKind::Conflict);

    // The original publisher is untouched.
    first.on_srt_data(DataPacket::new(ts_packet(1, false)));
    settle(&first_reactor);
    assert_eq!(first.state_name(), "publishing");
    assert!(first_rx.try_recv().is_err());
}

#[test]
fn publish_denied_by_subscriber() {
    let ctx = ctx(test_config());
    let (publish_count_tx, publish_count_rx) = channel();
    ctx.bus.subscribe(TOPIC_MEDIA_PUBLISH, move |event| {
        if let Event::MediaPublish { invoker, media, .. } = event {
            publish_count_tx.send(media.tuple()).unwrap();
            invoker.deny("no license");
        }
    });

    let (publisher, rx, _) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9051));

    assert_eq!(recv_shutdown(&rx), ShutdownKind::Refused);
    // Exactly one auth event per publish attempt.
    assert_eq!(
        publish_count_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        "v1/live/cam"
    );
    assert!(publish_count_rx.try_recv().is_err());
}

#[test]
fn close_refuses_while_readers_attached_then_forces() {
    let ctx = ctx(test_config());
    let (publisher, _pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9061));
    publisher.on_srt_data(DataPacket::new(ts_packet(0, true)));
    settle(&pub_reactor);

    let (player, play_rx, _) = session(&ctx);
    player.on_handshake_finished("v1/live/cam".into(), addr(9062));
    recv_packet(&play_rx); // attached and replaying

    assert!(!publisher.close(false), "close must refuse with a reader attached");
    assert!(publisher.close(true));

    // Forced close releases the muxer immediately: the source vanishes
    // and the player is detached.
    assert_eq!(recv_shutdown(&play_rx), ShutdownKind::Shutdown);
    let deadline = Instant::now() + Duration::from_secs(2);
    while !ctx.registry.is_empty() {
        assert!(Instant::now() < deadline, "source still registered");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn publisher_linger_keeps_source_briefly() {
    let mut config = test_config();
    config.source_linger_ms = 300;
    let ctx = ctx(config);

    let (publisher, _pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9071));
    publisher.on_srt_data(DataPacket::new(ts_packet(0, true)));
    settle(&pub_reactor);

    let start = Instant::now();
    publisher.shutdown(Error::Shutdown("peer gone".into()));
    settle(&pub_reactor);

    // Still registered inside the grace window.
    assert!(!ctx.registry.is_empty());

    let deadline = Instant::now() + Duration::from_secs(3);
    while !ctx.registry.is_empty() {
        assert!(Instant::now() < deadline, "linger window never ended");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[test]
fn flow_report_emitted_over_threshold() {
    let mut config = test_config();
    config.flow_threshold_kb = 0;
    let ctx = ctx(config);

    let (flow_tx, flow_rx) = channel();
    ctx.bus.subscribe(TOPIC_FLOW_REPORT, move |event| {
        if let Event::FlowReport {
            bytes, is_player, ..
        } = event
        {
            flow_tx.send((*bytes, *is_player)).unwrap();
        }
    });

    let (publisher, pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9081));
    for index in 0u16..10 {
        publisher.on_srt_data(DataPacket::new(ts_packet(index, index == 0)));
    }
    settle(&pub_reactor);
    publisher.shutdown(Error::Shutdown("done".into()));

    assert_eq!(recv_shutdown(&pub_rx), ShutdownKind::Shutdown);
    let (bytes, is_player) = flow_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(bytes, 10 * TS_PACKET_SIZE as u64);
    assert!(!is_player);
}

#[test]
fn shutdown_fires_sink_exactly_once() {
    let ctx = ctx(test_config());
    let (session, rx, reactor) = session(&ctx);
    session.on_handshake_finished("v1/live/cam?type=push".into(), addr(9091));

    session.shutdown(Error::Shutdown("first".into()));
    session.shutdown(Error::Shutdown("second".into()));
    settle(&reactor);

    assert_eq!(recv_shutdown(&rx), ShutdownKind::Shutdown);
    assert!(rx.try_recv().is_err(), "on_shutdown fired more than once");
    assert!(session.is_closed());
}

#[test]
fn garbage_payload_keeps_publisher_alive() {
    let ctx = ctx(test_config());
    let (publisher, pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9101));

    publisher.on_srt_data(DataPacket::new(vec![0xAA; TS_PACKET_SIZE * 2]));
    publisher.on_srt_data(DataPacket::new(ts_packet(0, true)));
    settle(&pub_reactor);

    assert_eq!(publisher.state_name(), "publishing");
    assert!(pub_rx.try_recv().is_err());

    // The clean packet after the junk made it into a live source.
    let (player, play_rx, _) = session(&ctx);
    player.on_handshake_finished("v1/live/cam".into(), addr(9102));
    assert_eq!(index_of(&recv_packet(&play_rx)), 0);
}

#[test]
fn player_data_is_ignored() {
    let ctx = ctx(test_config());
    let (publisher, _pub_rx, pub_reactor) = session(&ctx);
    publisher.on_handshake_finished("v1/live/cam?type=push".into(), addr(9111));
    publisher.on_srt_data(DataPacket::new(ts_packet(0, true)));
    settle(&pub_reactor);

    let (player, play_rx, play_reactor) = session(&ctx);
    player.on_handshake_finished("v1/live/cam".into(), addr(9112));
    recv_packet(&play_rx);

    // A player pushing data must not disturb its session.
    player.on_srt_data(DataPacket::new(ts_packet(99, false)));
    settle(&play_reactor);
    assert_eq!(player.state_name(), "playing");
}
