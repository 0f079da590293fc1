//! Stateful outbound HTTP/1.1 transaction.
//!
//! One [`HttpClient`] runs one transaction at a time, pinned to a
//! reactor. A background pump thread owns the socket (connect, optional
//! proxy CONNECT tunnel, optional TLS, request write, response reads) and
//! posts everything back to the client's reactor, where the protocol
//! state machine lives:
//!
//! ```text
//! Idle → Connecting → ProxyHandshaking? → SendingRequest
//!      → AwaitingHeader → AwaitingBody{length|chunked|until-close}
//!      → Completed | Failed
//! ```
//!
//! Timeouts are enforced from the reactor's periodic tick against three
//! tickers: header (connect → end of header), body (reset per received
//! body byte), and whole-transaction (supersedes both when non-zero).
//!
//! After a completed transaction on a persistent connection the socket is
//! kept and reused for the next same-origin request; if that reuse fails
//! before any response byte and resend is allowed, the request is
//! transparently resent once on a fresh connection.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use parking_lot::Mutex;

use super::body::HttpBody;
use super::chunked::ChunkedDecoder;
use super::cookie::{Cookie, CookieJar};
use super::headers::Headers;
use crate::config::HttpConfig;
use crate::error::{Error, Result, TimeoutKind};
use crate::reactor::{Manage, Reactor, Ticker};
use crate::url::Url;

/// Redirect hop limit; the sixth redirect in a chain fails the
/// transaction with [`Error::TooManyRedirects`].
pub const MAX_REDIRECTS: u32 = 5;

/// Transaction callbacks. `on_response_header` and `on_response_body`
/// may fire before `on_response_completed`, never after; completion
/// fires exactly once per `send_request`.
pub trait HttpHandler: Send {
    fn on_response_header(&mut self, status: u16, reason: &str, headers: &Headers) {
        let _ = (status, reason, headers);
    }

    fn on_response_body(&mut self, data: &[u8]) {
        let _ = data;
    }

    /// A 3xx response with a `Location` arrived. Return `true` to follow
    /// (`temporary` = status 302/303/307).
    fn on_redirect(&mut self, url: &str, temporary: bool) -> bool {
        let _ = (url, temporary);
        true
    }

    fn on_response_completed(&mut self, result: Result<()>);
}

/// Transaction phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    Idle,
    Connecting,
    ProxyHandshaking,
    SendingRequest,
    AwaitingHeader,
    AwaitingBody,
    Completed,
    Failed,
}

/// Parsed response head, available once the header completes.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

enum BodyFraming {
    ContentLength { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilClose,
}

enum BodyKind {
    /// Replayable (resend, redirect-preserve); `Content-Length` framing.
    Buffer(Vec<u8>),
    /// Pulled once; chunked framing when the size is unknown.
    Stream(Box<dyn HttpBody>),
}

struct ProxyConfig {
    host: String,
    port: u16,
    /// Pre-encoded Basic credentials, when the proxy URL carried userinfo.
    auth: Option<String>,
}

type Origin = (String, u16, bool);

enum Conn {
    Plain(TcpStream),
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Conn {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Conn::Plain(s) => s.set_read_timeout(timeout),
            Conn::Tls(s) => s.get_ref().set_read_timeout(timeout),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Conn::Plain(s) => s.read(buf),
            Conn::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Conn::Plain(s) => s.write(buf),
            Conn::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Conn::Plain(s) => s.flush(),
            Conn::Tls(s) => s.flush(),
        }
    }
}

enum PumpEvent {
    Phase(HttpState),
    Data(Vec<u8>),
    Eof,
    Error(std::io::Error),
}

enum PumpBody {
    None,
    /// Raw bytes, `Content-Length` already in the head.
    Raw(Vec<u8>),
    /// Pull source: raw when sized, chunk-encoded when not.
    Stream { body: Box<dyn HttpBody>, sized: bool },
}

struct ProxyConnect {
    target_host: String,
    target_port: u16,
    auth: Option<String>,
}

struct PumpTarget {
    reuse: Option<Conn>,
    connect_host: String,
    connect_port: u16,
    proxy: Option<ProxyConnect>,
    /// TLS server name, when the target is https.
    tls: Option<String>,
    head: Vec<u8>,
    body: PumpBody,
    handshake_timeout: Duration,
}

struct Inner {
    // Request configuration.
    method: String,
    user_headers: Headers,
    body: Option<BodyKind>,
    proxy: Option<ProxyConfig>,
    allow_resend: bool,
    header_timeout: Duration,
    body_timeout: Duration,
    complete_timeout: Duration,

    // Live transaction.
    url: Option<Url>,
    state: HttpState,
    framing: Option<BodyFraming>,
    generation: u64,
    response: Option<Response>,
    header_buf: Vec<u8>,
    deferred_body: Vec<u8>,
    recved_body: u64,
    total_body: Option<u64>,
    persistent: bool,
    reused_conn: bool,
    resent: bool,
    any_response_bytes: bool,
    redirects: u32,
    idle: Option<(Origin, Conn)>,
    stop: Option<Arc<AtomicBool>>,
    completed_notified: bool,
    wait_header: Ticker,
    wait_body: Ticker,
    wait_complete: Ticker,
}

impl Inner {
    fn active(&self) -> bool {
        matches!(
            self.state,
            HttpState::Connecting
                | HttpState::ProxyHandshaking
                | HttpState::SendingRequest
                | HttpState::AwaitingHeader
                | HttpState::AwaitingBody
        )
    }
}

pub struct HttpClient {
    reactor: Arc<Reactor>,
    jar: Arc<CookieJar>,
    inner: Mutex<Inner>,
    handler: Mutex<Box<dyn HttpHandler>>,
}

impl HttpClient {
    pub fn new(
        reactor: Arc<Reactor>,
        config: &HttpConfig,
        handler: Box<dyn HttpHandler>,
    ) -> Arc<Self> {
        Self::with_jar(reactor, config, handler, Arc::new(CookieJar::new()))
    }

    /// Build with a shared cookie jar (cookies then span clients).
    pub fn with_jar(
        reactor: Arc<Reactor>,
        config: &HttpConfig,
        handler: Box<dyn HttpHandler>,
        jar: Arc<CookieJar>,
    ) -> Arc<Self> {
        let client = Arc::new(HttpClient {
            reactor: reactor.clone(),
            jar,
            inner: Mutex::new(Inner {
                method: "GET".to_string(),
                user_headers: Headers::new(),
                body: None,
                proxy: None,
                allow_resend: false,
                header_timeout: Duration::from_millis(config.header_timeout_ms.max(1)),
                body_timeout: Duration::from_millis(config.body_timeout_ms),
                complete_timeout: Duration::from_millis(config.complete_timeout_ms),
                url: None,
                state: HttpState::Idle,
                framing: None,
                generation: 0,
                response: None,
                header_buf: Vec::new(),
                deferred_body: Vec::new(),
                recved_body: 0,
                total_body: None,
                persistent: false,
                reused_conn: false,
                resent: false,
                any_response_bytes: false,
                redirects: 0,
                idle: None,
                stop: None,
                completed_notified: true,
                wait_header: Ticker::new(),
                wait_body: Ticker::new(),
                wait_complete: Ticker::new(),
            }),
            handler: Mutex::new(handler),
        });
        reactor.register_tick(Arc::downgrade(&client) as Weak<dyn Manage>);
        client
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_method(&self, method: &str) {
        self.inner.lock().method = method.to_ascii_uppercase();
    }

    /// Replace the user header set wholesale.
    pub fn set_header(&self, headers: Headers) {
        self.inner.lock().user_headers = headers;
    }

    /// Add one header; `force` overwrites an existing value.
    pub fn add_header(&self, name: &str, value: &str, force: bool) {
        self.inner.lock().user_headers.add(name, value, force);
    }

    /// Fully buffered body (replayable on resend and redirect-preserve).
    pub fn set_body(&self, body: impl Into<Vec<u8>>) {
        self.inner.lock().body = Some(BodyKind::Buffer(body.into()));
    }

    /// Streamed body source, consumed once.
    pub fn set_body_source(&self, body: Box<dyn HttpBody>) {
        self.inner.lock().body = Some(BodyKind::Stream(body));
    }

    /// Route the transaction through `http://[user:pw@]host:port` using
    /// an HTTP CONNECT tunnel. `None` clears.
    pub fn set_proxy_url(&self, proxy: Option<&str>) -> Result<()> {
        let parsed = match proxy {
            None => None,
            Some(text) => {
                let url = Url::parse(text)?;
                let auth = url.username.as_ref().map(|user| {
                    let pw = url.password.as_deref().unwrap_or("");
                    BASE64_STANDARD.encode(format!("{user}:{pw}"))
                });
                Some(ProxyConfig {
                    host: url.host.clone(),
                    port: url.port_or_default(),
                    auth,
                })
            }
        };
        self.inner.lock().proxy = parsed;
        Ok(())
    }

    /// Allow one transparent resend when a reused connection dies before
    /// any response byte.
    pub fn set_allow_resend_request(&self, allow: bool) {
        self.inner.lock().allow_resend = allow;
    }

    /// Connect → end-of-header bound. Must be greater than zero.
    pub fn set_header_timeout(&self, timeout: Duration) {
        self.inner.lock().header_timeout = timeout.max(Duration::from_millis(1));
    }

    /// Per-received-body-byte bound. Zero disables.
    pub fn set_body_timeout(&self, timeout: Duration) {
        self.inner.lock().body_timeout = timeout;
    }

    /// Whole-transaction bound; non-zero supersedes the other two.
    pub fn set_complete_timeout(&self, timeout: Duration) {
        self.inner.lock().complete_timeout = timeout;
    }

    /// Reset method, headers, body, and response state for a fresh,
    /// byte-identical re-issue. Timeouts, proxy, and the kept-alive
    /// connection survive.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if let Some(stop) = &inner.stop {
            stop.store(true, Ordering::SeqCst);
        }
        inner.generation += 1;
        inner.method = "GET".to_string();
        inner.user_headers.clear();
        inner.body = None;
        inner.url = None;
        inner.state = HttpState::Idle;
        inner.framing = None;
        inner.response = None;
        inner.header_buf.clear();
        inner.deferred_body.clear();
        inner.recved_body = 0;
        inner.total_body = None;
        inner.reused_conn = false;
        inner.resent = false;
        inner.any_response_bytes = false;
        inner.redirects = 0;
        inner.completed_notified = true;
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// The response head, once it has arrived.
    pub fn response(&self) -> Option<Response> {
        self.inner.lock().response.clone()
    }

    /// Body size declared by the response header; `None` for chunked or
    /// read-until-close framing.
    pub fn response_body_total_size(&self) -> Option<u64> {
        self.inner.lock().total_body
    }

    /// Body bytes received so far.
    pub fn response_body_size(&self) -> u64 {
        self.inner.lock().recved_body
    }

    pub fn url(&self) -> Option<String> {
        self.inner.lock().url.as_ref().map(|u| {
            format!("{}://{}{}", u.scheme, u.host_header(), u.request_target())
        })
    }

    /// Whether a transaction is in flight.
    pub fn wait_response(&self) -> bool {
        self.inner.lock().active()
    }

    pub fn is_https(&self) -> bool {
        self.inner
            .lock()
            .url
            .as_ref()
            .is_some_and(|u| u.scheme == "https")
    }

    pub fn state(&self) -> HttpState {
        self.inner.lock().state
    }

    // ------------------------------------------------------------------
    // Transaction
    // ------------------------------------------------------------------

    /// Start a transaction. The outcome arrives exclusively through the
    /// handler callbacks, on this client's reactor.
    pub fn send_request(self: &Arc<Self>, url: &str) {
        let url = url.to_string();
        let weak = Arc::downgrade(self);
        self.reactor.post(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.start_request(&url);
            }
        }));
    }

    fn start_request(self: &Arc<Self>, url: &str) {
        {
            let mut inner = self.inner.lock();
            inner.redirects = 0;
            inner.resent = false;
            inner.completed_notified = false;
            inner.wait_complete.reset();
        }
        match Url::parse(url) {
            Ok(parsed) if parsed.scheme == "http" || parsed.scheme == "https" => {
                self.start_transaction(parsed);
            }
            Ok(parsed) => {
                self.finish(Err(Error::Protocol(format!(
                    "unsupported scheme: {}",
                    parsed.scheme
                ))));
            }
            Err(e) => self.finish(Err(e)),
        }
    }

    /// Open (or reuse) a connection and dispatch the request. Used by
    /// `send_request`, redirect follow-ups, and the one-shot resend.
    fn start_transaction(self: &Arc<Self>, url: Url) {
        let (target, stop, generation) = {
            let mut inner = self.inner.lock();
            if let Some(stop) = &inner.stop {
                stop.store(true, Ordering::SeqCst);
            }
            inner.generation += 1;
            let generation = inner.generation;

            inner.state = HttpState::Connecting;
            inner.framing = None;
            inner.response = None;
            inner.header_buf.clear();
            inner.deferred_body.clear();
            inner.recved_body = 0;
            inner.total_body = None;
            inner.any_response_bytes = false;
            inner.wait_header.reset();
            inner.wait_body.reset();

            let is_https = url.scheme == "https";
            let origin: Origin = (url.host.clone(), url.port_or_default(), is_https);
            let reuse = match inner.idle.take() {
                Some((idle_origin, conn)) if idle_origin == origin && inner.persistent => {
                    Some(conn)
                }
                _ => None,
            };
            inner.reused_conn = reuse.is_some();
            if inner.reused_conn {
                tracing::debug!(host = %url.host, port = origin.1, "reusing persistent connection");
            }

            let (body, body_len, body_chunked) = match inner.body.take() {
                None => (PumpBody::None, None, false),
                Some(BodyKind::Buffer(bytes)) => {
                    let len = bytes.len() as u64;
                    // Buffered bodies stay replayable.
                    inner.body = Some(BodyKind::Buffer(bytes.clone()));
                    (PumpBody::Raw(bytes), Some(len), false)
                }
                Some(BodyKind::Stream(stream)) => match stream.total_size() {
                    Some(len) => (
                        PumpBody::Stream {
                            body: stream,
                            sized: true,
                        },
                        Some(len),
                        false,
                    ),
                    None => (
                        PumpBody::Stream {
                            body: stream,
                            sized: false,
                        },
                        None,
                        true,
                    ),
                },
            };

            let head = build_request_head(
                &inner.method,
                &url,
                &inner.user_headers,
                body_len,
                body_chunked,
                &self.jar,
            );

            let (connect_host, connect_port, proxy) = match (&inner.proxy, inner.reused_conn) {
                (Some(p), false) => (
                    p.host.clone(),
                    p.port,
                    Some(ProxyConnect {
                        target_host: url.host.clone(),
                        target_port: url.port_or_default(),
                        auth: p.auth.clone(),
                    }),
                ),
                // A reused connection is already tunneled.
                _ => (url.host.clone(), url.port_or_default(), None),
            };

            let stop = Arc::new(AtomicBool::new(false));
            inner.stop = Some(stop.clone());
            inner.url = Some(url.clone());

            let target = PumpTarget {
                reuse,
                connect_host,
                connect_port,
                proxy,
                tls: is_https.then(|| url.host.clone()),
                head,
                body,
                handshake_timeout: inner.header_timeout,
            };
            (target, stop, generation)
        };

        spawn_pump(
            Arc::downgrade(self),
            self.reactor.clone(),
            generation,
            stop,
            target,
        );
    }

    fn pump_event(self: &Arc<Self>, generation: u64, event: PumpEvent) {
        if self.inner.lock().generation != generation {
            return;
        }
        match event {
            PumpEvent::Phase(state) => {
                let mut inner = self.inner.lock();
                if matches!(
                    inner.state,
                    HttpState::Connecting | HttpState::ProxyHandshaking | HttpState::SendingRequest
                ) {
                    inner.state = state;
                }
            }
            PumpEvent::Data(bytes) => self.on_data(&bytes),
            PumpEvent::Eof => self.on_eof(),
            PumpEvent::Error(e) => self.on_transport_error(e),
        }
    }

    /// The pump hands its connection back after a completed persistent
    /// transaction.
    fn store_idle(&self, generation: u64, conn: Conn) {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || inner.state != HttpState::Completed
            || !inner.persistent
        {
            return;
        }
        let origin = inner
            .url
            .as_ref()
            .map(|url| (url.host.clone(), url.port_or_default(), url.scheme == "https"));
        if let Some(origin) = origin {
            tracing::debug!(host = %origin.0, "connection kept for reuse");
            inner.idle = Some((origin, conn));
        }
    }

    fn on_data(self: &Arc<Self>, data: &[u8]) {
        let mut header_call: Option<Response> = None;
        let mut body_calls: Vec<Vec<u8>> = Vec::new();
        let mut redirect: Option<(Url, u16)> = None;
        let mut complete: Option<Result<()>> = None;

        {
            let mut inner = self.inner.lock();
            if !inner.active() {
                return;
            }
            inner.any_response_bytes = true;

            let mut rest: Vec<u8> = data.to_vec();
            if inner.framing.is_none() {
                inner.state = HttpState::AwaitingHeader;
                inner.header_buf.extend_from_slice(&rest);
                rest.clear();

                if let Some(split) = find_header_end(&inner.header_buf) {
                    let body_start = inner.header_buf.split_off(split + 4);
                    let head_bytes = std::mem::take(&mut inner.header_buf);

                    match parse_response_head(&head_bytes) {
                        Err(e) => complete = Some(Err(e)),
                        Ok((response, http11)) => {
                            self.absorb_cookies(&inner, &response);
                            inner.persistent = http11
                                && !response
                                    .headers
                                    .get("connection")
                                    .is_some_and(|v| v.eq_ignore_ascii_case("close"));

                            let location = if (300..400).contains(&response.status)
                                && response.status != 304
                            {
                                response.headers.get("location").map(str::to_string)
                            } else {
                                None
                            };
                            if let (Some(location), Some(url)) = (location, &inner.url) {
                                match url.join(&location) {
                                    Ok(next) => {
                                        let status = response.status;
                                        inner.deferred_body = body_start;
                                        inner.response = Some(response);
                                        redirect = Some((next, status));
                                    }
                                    Err(e) => complete = Some(Err(e)),
                                }
                            } else {
                                install_framing(&mut inner, &response);
                                header_call = Some(response.clone());
                                inner.response = Some(response);
                                inner.wait_body.reset();
                                rest = body_start;
                                if body_finished(&inner) {
                                    complete = Some(Ok(()));
                                } else {
                                    inner.state = HttpState::AwaitingBody;
                                }
                            }
                        }
                    }
                }
            }

            if complete.is_none() && redirect.is_none() && !rest.is_empty() {
                complete = process_body(&mut inner, &rest, &mut body_calls);
            }
        }

        if let Some(response) = header_call {
            self.handler
                .lock()
                .on_response_header(response.status, &response.reason, &response.headers);
        }
        for chunk in body_calls {
            self.handler.lock().on_response_body(&chunk);
        }
        if let Some((url, status)) = redirect {
            self.handle_redirect(url, status);
            return;
        }
        if let Some(result) = complete {
            self.finish(result);
        }
    }

    fn absorb_cookies(&self, inner: &Inner, response: &Response) {
        let Some(url) = &inner.url else { return };
        for value in response.headers.get_all("set-cookie") {
            if let Some(cookie) = Cookie::parse(value) {
                self.jar.store(&url.host, cookie);
            }
        }
    }

    fn handle_redirect(self: &Arc<Self>, next: Url, status: u16) {
        let next_str = format!(
            "{}://{}{}",
            next.scheme,
            next.host_header(),
            next.request_target()
        );
        let temporary = matches!(status, 302 | 303 | 307);
        let follow = self.handler.lock().on_redirect(&next_str, temporary);

        if !follow {
            // Treat the 3xx as the final response.
            let mut header_call: Option<Response> = None;
            let mut body_calls: Vec<Vec<u8>> = Vec::new();
            let mut complete: Option<Result<()>> = None;
            {
                let mut inner = self.inner.lock();
                if !inner.active() {
                    return;
                }
                let Some(response) = inner.response.clone() else {
                    return;
                };
                install_framing(&mut inner, &response);
                header_call = Some(response);
                inner.wait_body.reset();
                let deferred = std::mem::take(&mut inner.deferred_body);
                if body_finished(&inner) {
                    complete = Some(Ok(()));
                } else {
                    inner.state = HttpState::AwaitingBody;
                }
                if complete.is_none() && !deferred.is_empty() {
                    complete = process_body(&mut inner, &deferred, &mut body_calls);
                }
            }
            if let Some(response) = header_call {
                self.handler.lock().on_response_header(
                    response.status,
                    &response.reason,
                    &response.headers,
                );
            }
            for chunk in body_calls {
                self.handler.lock().on_response_body(&chunk);
            }
            if let Some(result) = complete {
                self.finish(result);
            }
            return;
        }

        let next_url = {
            let mut inner = self.inner.lock();
            if !inner.active() {
                return;
            }
            inner.redirects += 1;
            if inner.redirects > MAX_REDIRECTS {
                None
            } else {
                if rewrites_to_get(status) {
                    inner.method = "GET".to_string();
                    inner.body = None;
                }
                tracing::debug!(
                    hop = inner.redirects,
                    status,
                    url = %next_str,
                    method = %inner.method,
                    "following redirect"
                );
                Some(next)
            }
        };
        match next_url {
            Some(url) => self.start_transaction(url),
            None => self.finish(Err(Error::TooManyRedirects)),
        }
    }

    fn on_eof(self: &Arc<Self>) {
        enum Action {
            Ignore,
            Complete,
            Resend,
            Fail(Error),
        }
        let action = {
            let mut inner = self.inner.lock();
            if !inner.active() {
                Action::Ignore
            } else if matches!(inner.framing, Some(BodyFraming::UntilClose)) {
                inner.persistent = false;
                Action::Complete
            } else if inner.reused_conn
                && !inner.any_response_bytes
                && inner.allow_resend
                && !inner.resent
            {
                inner.resent = true;
                Action::Resend
            } else {
                Action::Fail(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before response completed",
                )))
            }
        };
        match action {
            Action::Ignore => {}
            Action::Complete => self.finish(Ok(())),
            Action::Resend => self.resend(),
            Action::Fail(e) => self.finish(Err(e)),
        }
    }

    fn on_transport_error(self: &Arc<Self>, error: std::io::Error) {
        let resend = {
            let mut inner = self.inner.lock();
            if !inner.active() {
                return;
            }
            let resend = inner.reused_conn
                && !inner.any_response_bytes
                && inner.allow_resend
                && !inner.resent;
            if resend {
                inner.resent = true;
            }
            resend
        };
        if resend {
            self.resend();
        } else {
            self.finish(Err(Error::Io(error)));
        }
    }

    /// One-shot transparent retry after a dead reused connection.
    fn resend(self: &Arc<Self>) {
        let url = self.inner.lock().url.clone();
        let Some(url) = url else {
            self.finish(Err(Error::Protocol("resend without url".into())));
            return;
        };
        tracing::debug!(host = %url.host, "reused connection failed, resending once");
        // The idle slot is already consumed, so this opens fresh.
        self.start_transaction(url);
    }

    /// Terminal transition; fires `on_response_completed` exactly once.
    fn finish(&self, result: Result<()>) {
        {
            let mut inner = self.inner.lock();
            if inner.completed_notified {
                return;
            }
            inner.completed_notified = true;
            inner.state = if result.is_ok() {
                HttpState::Completed
            } else {
                HttpState::Failed
            };
            if let Some(stop) = &inner.stop {
                stop.store(true, Ordering::SeqCst);
            }
        }
        if let Err(e) = &result {
            tracing::debug!(error = %e, "http transaction failed");
        }
        self.handler.lock().on_response_completed(result);
    }
}

impl Manage for HttpClient {
    fn on_manager(&self) {
        let expired = {
            let inner = self.inner.lock();
            if !inner.active() {
                return;
            }
            if !inner.complete_timeout.is_zero() {
                (inner.wait_complete.elapsed() > inner.complete_timeout)
                    .then_some(TimeoutKind::Complete)
            } else if inner.state == HttpState::AwaitingBody {
                (!inner.body_timeout.is_zero() && inner.wait_body.elapsed() > inner.body_timeout)
                    .then_some(TimeoutKind::Body)
            } else {
                (inner.wait_header.elapsed() > inner.header_timeout).then_some(TimeoutKind::Header)
            }
        };
        if let Some(kind) = expired {
            tracing::debug!(%kind, "http timer expired");
            self.finish(Err(Error::Timeout(kind)));
        }
    }
}

// ----------------------------------------------------------------------
// Pure helpers (unit-tested below)
// ----------------------------------------------------------------------

/// 301/302/303 rewrite the follow-up to a bodyless GET; 307/308 preserve.
fn rewrites_to_get(status: u16) -> bool {
    matches!(status, 301 | 302 | 303)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse status line + headers. Returns the response and whether the
/// version was HTTP/1.1 (keep-alive capable).
fn parse_response_head(bytes: &[u8]) -> Result<(Response, bool)> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::Protocol("non-UTF8 response header".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty response header".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::Protocol("missing HTTP version".into()))?;
    if !version.starts_with("HTTP/") {
        return Err(Error::Protocol(format!("bad status line: {status_line}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad status code in: {status_line}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("bad header line: {line}")))?;
        headers.insert(name.trim(), value.trim());
    }

    Ok((
        Response {
            status,
            reason,
            headers,
        },
        version.eq_ignore_ascii_case("HTTP/1.1"),
    ))
}

/// Pick body framing: chunked > Content-Length > read-until-close.
fn install_framing(inner: &mut Inner, response: &Response) {
    if response.status == 204 || response.status == 304 {
        inner.framing = Some(BodyFraming::ContentLength { remaining: 0 });
        inner.total_body = Some(0);
        return;
    }
    let chunked = response
        .headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        inner.framing = Some(BodyFraming::Chunked(ChunkedDecoder::new()));
        inner.total_body = None;
        return;
    }
    if let Some(len) = response
        .headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        inner.framing = Some(BodyFraming::ContentLength { remaining: len });
        inner.total_body = Some(len);
        return;
    }
    let close = response
        .headers
        .get("connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("close"));
    if close {
        inner.framing = Some(BodyFraming::UntilClose);
        inner.total_body = None;
    } else {
        // No framing info on a keep-alive response: bodyless.
        inner.framing = Some(BodyFraming::ContentLength { remaining: 0 });
        inner.total_body = Some(0);
    }
}

fn body_finished(inner: &Inner) -> bool {
    matches!(
        inner.framing,
        Some(BodyFraming::ContentLength { remaining: 0 })
    )
}

/// Feed body bytes through the installed framing. Returns the completion
/// outcome, if this input finished the body.
fn process_body(
    inner: &mut Inner,
    data: &[u8],
    body_calls: &mut Vec<Vec<u8>>,
) -> Option<Result<()>> {
    inner.wait_body.reset();
    match &mut inner.framing {
        Some(BodyFraming::ContentLength { remaining }) => {
            let take = (*remaining).min(data.len() as u64) as usize;
            if take > 0 {
                body_calls.push(data[..take].to_vec());
                inner.recved_body += take as u64;
                *remaining -= take as u64;
            }
            if data.len() > take {
                tracing::debug!(extra = data.len() - take, "bytes past declared body ignored");
            }
            (*remaining == 0).then_some(Ok(()))
        }
        Some(BodyFraming::Chunked(decoder)) => {
            let mut out: Vec<Vec<u8>> = Vec::new();
            match decoder.input(data, &mut |chunk| out.push(chunk.to_vec())) {
                Ok(done) => {
                    for chunk in out {
                        inner.recved_body += chunk.len() as u64;
                        body_calls.push(chunk);
                    }
                    done.then_some(Ok(()))
                }
                Err(e) => Some(Err(e)),
            }
        }
        Some(BodyFraming::UntilClose) => {
            inner.recved_body += data.len() as u64;
            body_calls.push(data.to_vec());
            None
        }
        None => None,
    }
}

/// Encode the request head: request line, user headers, generated
/// defaults, body framing, cookies.
fn build_request_head(
    method: &str,
    url: &Url,
    user_headers: &Headers,
    body_len: Option<u64>,
    body_chunked: bool,
    jar: &CookieJar,
) -> Vec<u8> {
    let mut headers = user_headers.clone();
    headers.add("Host", &url.host_header(), false);
    headers.add("Accept", "*/*", false);
    headers.add("User-Agent", concat!("srtcast/", env!("CARGO_PKG_VERSION")), false);
    headers.add("Connection", "keep-alive", false);
    if let Some(len) = body_len {
        headers.add("Content-Length", &len.to_string(), true);
    } else if body_chunked {
        headers.add("Transfer-Encoding", "chunked", true);
    }
    if !headers.contains("cookie") {
        if let Some(value) = jar.header_value(&url.host, &url.path) {
            headers.add("Cookie", &value, false);
        }
    }

    let mut head = format!("{method} {} HTTP/1.1\r\n", url.request_target());
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

// ----------------------------------------------------------------------
// Socket pump
// ----------------------------------------------------------------------

fn spawn_pump(
    client: Weak<HttpClient>,
    reactor: Arc<Reactor>,
    generation: u64,
    stop: Arc<AtomicBool>,
    target: PumpTarget,
) {
    let spawn = std::thread::Builder::new()
        .name("http-pump".to_string())
        .spawn(move || {
            let post = |event: PumpEvent| {
                let client = client.clone();
                reactor.post(Box::new(move || {
                    if let Some(client) = client.upgrade() {
                        client.pump_event(generation, event);
                    }
                }));
            };
            match run_pump(&post, &stop, target) {
                PumpExit::Stopped(conn) => {
                    let client = client.clone();
                    reactor.post(Box::new(move || {
                        if let Some(client) = client.upgrade() {
                            client.store_idle(generation, conn);
                        }
                    }));
                }
                PumpExit::Eof => post(PumpEvent::Eof),
                PumpExit::Error(e) => post(PumpEvent::Error(e)),
            }
        });
    if spawn.is_err() {
        tracing::warn!("failed to spawn http pump thread");
    }
}

enum PumpExit {
    /// Client asked us to stop; connection intact and returnable.
    Stopped(Conn),
    Eof,
    Error(std::io::Error),
}

fn run_pump(
    post: &dyn Fn(PumpEvent),
    stop: &AtomicBool,
    target: PumpTarget,
) -> PumpExit {
    let mut conn = match target.reuse {
        Some(conn) => conn,
        None => {
            let mut last_err =
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved");
            let addrs = match (target.connect_host.as_str(), target.connect_port).to_socket_addrs()
            {
                Ok(addrs) => addrs,
                Err(e) => return PumpExit::Error(e),
            };
            let mut stream = None;
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, target.handshake_timeout) {
                    Ok(s) => {
                        stream = Some(s);
                        break;
                    }
                    Err(e) => last_err = e,
                }
            }
            let Some(stream) = stream else {
                return PumpExit::Error(last_err);
            };
            let _ = stream.set_nodelay(true);
            let mut conn = Conn::Plain(stream);

            // Handshake phases run with blocking reads bounded by the
            // header window; the client tick is the hard backstop.
            let _ = conn.set_read_timeout(Some(target.handshake_timeout));

            if let Some(proxy) = &target.proxy {
                post(PumpEvent::Phase(HttpState::ProxyHandshaking));
                if let Err(e) = proxy_connect(&mut conn, proxy) {
                    return PumpExit::Error(e);
                }
            }

            if let Some(server_name) = &target.tls {
                conn = match tls_wrap(conn, server_name) {
                    Ok(conn) => conn,
                    Err(e) => return PumpExit::Error(e),
                };
            }
            conn
        }
    };

    post(PumpEvent::Phase(HttpState::SendingRequest));
    if let Err(e) = write_request(&mut conn, &target.head, target.body) {
        return PumpExit::Error(e);
    }
    post(PumpEvent::Phase(HttpState::AwaitingHeader));

    let _ = conn.set_read_timeout(Some(Duration::from_millis(100)));
    let mut buf = [0u8; 16 * 1024];
    loop {
        if stop.load(Ordering::SeqCst) {
            let _ = conn.set_read_timeout(None);
            return PumpExit::Stopped(conn);
        }
        match conn.read(&mut buf) {
            Ok(0) => return PumpExit::Eof,
            Ok(n) => post(PumpEvent::Data(buf[..n].to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return PumpExit::Error(e),
        }
    }
}

/// Establish an HTTP CONNECT tunnel through the proxy.
fn proxy_connect(conn: &mut Conn, proxy: &ProxyConnect) -> std::io::Result<()> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = proxy.target_host,
        port = proxy.target_port
    );
    if let Some(auth) = &proxy.auth {
        request.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
    }
    request.push_str("\r\n");
    conn.write_all(request.as_bytes())?;
    conn.flush()?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8 * 1024 {
            return Err(std::io::Error::other("oversized proxy response"));
        }
        match conn.read(&mut byte)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "proxy closed during CONNECT",
                ));
            }
            _ => response.push(byte[0]),
        }
    }
    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let ok = std::str::from_utf8(status_line)
        .ok()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|code| code == "200");
    if ok {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "proxy CONNECT refused: {}",
            String::from_utf8_lossy(status_line)
        )))
    }
}

fn tls_wrap(conn: Conn, server_name: &str) -> std::io::Result<Conn> {
    let Conn::Plain(stream) = conn else {
        return Err(std::io::Error::other("TLS over TLS not supported"));
    };
    let connector = native_tls::TlsConnector::new().map_err(std::io::Error::other)?;
    let tls = connector
        .connect(server_name, stream)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(Conn::Tls(Box::new(tls)))
}

fn write_request(conn: &mut Conn, head: &[u8], body: PumpBody) -> std::io::Result<()> {
    conn.write_all(head)?;
    match body {
        PumpBody::None => {}
        PumpBody::Raw(bytes) => conn.write_all(&bytes)?,
        PumpBody::Stream { mut body, sized } => {
            while let Some(chunk) = body.read_chunk() {
                if chunk.is_empty() {
                    continue;
                }
                if sized {
                    conn.write_all(&chunk)?;
                } else {
                    conn.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())?;
                    conn.write_all(&chunk)?;
                    conn.write_all(b"\r\n")?;
                }
            }
            if !sized {
                conn.write_all(b"0\r\n\r\n")?;
            }
        }
    }
    conn.flush()
}
