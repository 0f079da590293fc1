//! Library configuration.
//!
//! All knobs live in one [`Config`] struct with sensible defaults; servers
//! embedding this crate can load overrides from a TOML file via
//! [`Config::load`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration consumed by sessions, sources, and the HTTP
/// client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum session byte count required to emit a `flow_report` event.
    pub flow_threshold_kb: u32,
    /// Latency budget multiplier handed to the SRT transport layer for
    /// congestion control negotiation.
    pub latency_multiplier: i32,
    /// Capacity of each media source ring, in GOP batches.
    pub ring_capacity: usize,
    /// Merge-write accumulator threshold: a batch is flushed to the ring
    /// once this many bytes have been buffered.
    pub merge_write_bytes: usize,
    /// Cap on muxer operations cached while publish authorization is
    /// pending. Overflow drops the incoming frame with a warning.
    pub max_pending_ops: usize,
    /// How long an asynchronous registry lookup waits for a publisher to
    /// appear before reporting "not found".
    pub find_timeout_ms: u64,
    /// Grace window keeping a publisher's media source registered after
    /// shutdown, to survive brief reconnects. 0 = unregister immediately.
    pub source_linger_ms: u64,
    /// Bound on the authorization window: a session stuck waiting for an
    /// auth decision longer than this is shut down.
    pub auth_timeout_ms: u64,
    /// Number of reactor threads in the pool.
    pub reactor_threads: usize,
    /// HTTP client defaults.
    pub http: HttpConfig,
}

/// HTTP client timeout defaults, overridable per client instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// From connect until the response header completes. Must be > 0.
    pub header_timeout_ms: u64,
    /// Between received body bytes. 0 disables the body timer.
    pub body_timeout_ms: u64,
    /// Whole-transaction bound. Non-zero supersedes the other two.
    pub complete_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow_threshold_kb: 16,
            latency_multiplier: 4,
            ring_capacity: 512,
            merge_write_bytes: 8 * 1024,
            max_pending_ops: 200,
            find_timeout_ms: 5_000,
            source_linger_ms: 0,
            auth_timeout_ms: 10_000,
            reactor_threads: default_reactor_threads(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            header_timeout_ms: 10_000,
            body_timeout_ms: 5_000,
            complete_timeout_ms: 0,
        }
    }
}

fn default_reactor_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(1)
}

impl Config {
    /// Parse a TOML document. Unknown keys are ignored; missing keys take
    /// their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.ring_capacity, 512);
        assert_eq!(cfg.max_pending_ops, 200);
        assert_eq!(cfg.http.header_timeout_ms, 10_000);
        assert_eq!(cfg.http.body_timeout_ms, 5_000);
        assert_eq!(cfg.http.complete_timeout_ms, 0);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = Config::from_toml("flow_threshold_kb = 64\n[http]\nbody_timeout_ms = 0\n").unwrap();
        assert_eq!(cfg.flow_threshold_kb, 64);
        assert_eq!(cfg.http.body_timeout_ms, 0);
        assert_eq!(cfg.http.header_timeout_ms, 10_000);
        assert_eq!(cfg.ring_capacity, 512);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml("flow_threshold_kb = \"lots\""),
            Err(Error::Config(_))
        ));
    }
}
