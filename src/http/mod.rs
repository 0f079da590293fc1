//! Outbound HTTP/1.1 client used for signalling, pulling, and proxy
//! traversal.
//!
//! - [`client`] — [`HttpClient`]: the transaction state machine.
//! - [`headers`] — [`Headers`]: case-insensitive multimap.
//! - [`chunked`] — [`ChunkedDecoder`]: transfer-encoding decoder.
//! - [`body`] — [`HttpBody`] pull sources for request bodies.
//! - [`cookie`] — [`CookieJar`] keyed by effective host and path.

pub mod body;
pub mod chunked;
pub mod client;
pub mod cookie;
pub mod headers;

pub use body::{BufferBody, HttpBody};
pub use chunked::ChunkedDecoder;
pub use client::{HttpClient, HttpHandler, HttpState, MAX_REDIRECTS, Response};
pub use cookie::{Cookie, CookieJar};
pub use headers::Headers;
