//! Error types for the live media fan-out library.

use std::fmt;

/// Errors that can occur across the fan-out pipeline.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Session**: [`Refused`](Self::Refused), [`Shutdown`](Self::Shutdown),
///   [`BadStreamId`](Self::BadStreamId), [`Conflict`](Self::Conflict).
/// - **Transport**: [`Io`](Self::Io) — socket/network failures.
/// - **HTTP client**: [`Timeout`](Self::Timeout),
///   [`TooManyRedirects`](Self::TooManyRedirects).
/// - **Framing**: [`Protocol`](Self::Protocol) — malformed HTTP framing,
///   chunk sizes, or TS payloads rejected by the demuxer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Authorization denied or an admin-initiated close.
    #[error("refused: {0}")]
    Refused(String),

    /// Normal peer or local termination.
    #[error("shutdown: {0}")]
    Shutdown(String),

    /// An HTTP transaction timer expired.
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// Empty or malformed SRT stream identity.
    #[error("bad stream id")]
    BadStreamId,

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed HTTP framing, chunk size line, or TS payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Redirect chain exceeded the hop limit.
    #[error("too many redirects")]
    TooManyRedirects,

    /// A second publisher attempted to register an identity that already
    /// has a live publisher.
    #[error("a live publisher already owns this identity")]
    Conflict,

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

/// Which HTTP transaction timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// From connect until the end of the response header.
    Header,
    /// Between received body bytes.
    Body,
    /// Whole transaction, from `send_request` to completion.
    Complete,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => write!(f, "header"),
            Self::Body => write!(f, "body"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
