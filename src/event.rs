//! Process-wide event bus.
//!
//! Fire-and-forget broadcast of lifecycle events on stable string topics.
//! Emission is synchronous on the emitter's thread; subscribers must not
//! block. [`EventBus::emit`] returns whether anyone was listening, which
//! lets emitters apply a default policy (publish/play authorization is
//! *allowed* when no subscriber exists).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::media::MediaInfo;

/// Topic: a publisher asks to ingest a stream. Carries an [`AuthInvoker`].
pub const TOPIC_MEDIA_PUBLISH: &str = "media_publish";
/// Topic: a player asks to consume a stream. Carries an [`AuthInvoker`].
pub const TOPIC_MEDIA_PLAYED: &str = "media_played";
/// Topic: per-session traffic report emitted at teardown.
pub const TOPIC_FLOW_REPORT: &str = "flow_report";

/// Peer endpoint info attached to auth and flow events.
#[derive(Debug, Clone)]
pub struct SockInfo {
    pub peer_addr: SocketAddr,
    /// Stable identifier of the emitting session.
    pub identifier: String,
}

/// How a stream entered the process. Carried on publish-auth events so
/// policy hooks can treat ingest protocols differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OriginType {
    SrtPush,
    Pull,
}

/// One-shot authorization continuation.
///
/// Exactly one decision terminates an authorization: the first call to
/// [`allow`](Self::allow) or [`deny`](Self::deny) wins, later calls are
/// no-ops. The wrapped continuation holds only a weak back-reference to
/// its session, so a decision arriving after teardown does nothing.
pub struct AuthInvoker {
    decision: Mutex<Option<Box<dyn FnOnce(Result<(), String>) + Send>>>,
}

impl AuthInvoker {
    pub fn new(f: impl FnOnce(Result<(), String>) + Send + 'static) -> Arc<Self> {
        Arc::new(AuthInvoker {
            decision: Mutex::new(Some(Box::new(f))),
        })
    }

    pub fn allow(&self) {
        self.decide(Ok(()));
    }

    pub fn deny(&self, reason: impl Into<String>) {
        self.decide(Err(reason.into()));
    }

    pub fn decide(&self, result: Result<(), String>) {
        match self.decision.lock().take() {
            Some(f) => f(result),
            None => tracing::trace!("duplicate auth decision ignored"),
        }
    }
}

impl std::fmt::Debug for AuthInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInvoker")
            .field("decided", &self.decision.lock().is_none())
            .finish()
    }
}

/// A broadcast event. The topic string is derived from the variant.
#[derive(Debug, Clone)]
pub enum Event {
    MediaPublish {
        origin: OriginType,
        media: MediaInfo,
        invoker: Arc<AuthInvoker>,
        sock: SockInfo,
    },
    MediaPlayed {
        media: MediaInfo,
        invoker: Arc<AuthInvoker>,
        sock: SockInfo,
    },
    FlowReport {
        media: MediaInfo,
        bytes: u64,
        duration: Duration,
        is_player: bool,
        sock: SockInfo,
    },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::MediaPublish { .. } => TOPIC_MEDIA_PUBLISH,
            Event::MediaPlayed { .. } => TOPIC_MEDIA_PLAYED,
            Event::FlowReport { .. } => TOPIC_FLOW_REPORT,
        }
    }
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Topic-keyed subscriber table.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<&'static str, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic. Subscribers run synchronously on the
    /// emitter's thread and must not block.
    pub fn subscribe(&self, topic: &'static str, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .entry(topic)
            .or_default()
            .push(Arc::new(f));
    }

    /// Deliver `event` to every subscriber of its topic. Returns `false`
    /// when nobody is listening.
    pub fn emit(&self, event: &Event) -> bool {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .get(event.topic())
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for subscriber in &subscribers {
            subscriber(event);
        }
        !subscribers.is_empty()
    }
}
