//! Stream identity.

use crate::error::{Error, Result};
use crate::url::{self, Url};

/// Schema under which TS media sources register.
pub const TS_SCHEMA: &str = "ts";

/// Registry key: `(schema, vhost, app, stream)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaIdentity {
    pub schema: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl std::fmt::Display for MediaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.schema, self.vhost, self.app, self.stream)
    }
}

/// Parsed media identity plus opaque parameters.
///
/// Built from a URL-like string of the form
/// `scheme://vhost/app/stream?k1=v1&k2=v2`. The identity quadruple keys
/// the media registry; parameters are carried through to authorization
/// events untouched (only `type=push` is interpreted, by the session).
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub schema: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    /// Query parameters in original order.
    pub params: Vec<(String, String)>,
    /// The string this identity was parsed from.
    pub full_url: String,
}

impl MediaInfo {
    /// Parse `scheme://vhost/app/stream?params`.
    ///
    /// The stream segment may itself contain slashes
    /// (`srt://v1/live/cam/low` → app `live`, stream `cam/low`). A
    /// missing vhost, app, or stream segment is a [`Error::BadStreamId`].
    pub fn parse(full_url: &str) -> Result<Self> {
        let url = Url::parse(full_url).map_err(|_| Error::BadStreamId)?;

        let path = url.path.trim_matches('/');
        let (app, stream) = path.split_once('/').ok_or(Error::BadStreamId)?;
        if app.is_empty() || stream.is_empty() {
            return Err(Error::BadStreamId);
        }

        Ok(MediaInfo {
            schema: url.scheme.clone(),
            vhost: url.host.clone(),
            app: app.to_string(),
            stream: stream.to_string(),
            params: url.query.as_deref().map(url::parse_args).unwrap_or_default(),
            full_url: full_url.to_string(),
        })
    }

    /// Look up a query parameter by key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The registry key for this identity under its current schema.
    pub fn identity(&self) -> MediaIdentity {
        MediaIdentity {
            schema: self.schema.clone(),
            vhost: self.vhost.clone(),
            app: self.app.clone(),
            stream: self.stream.clone(),
        }
    }

    /// The same identity re-keyed under another schema (players look up
    /// the TS schema regardless of the ingest protocol).
    pub fn identity_in(&self, schema: &str) -> MediaIdentity {
        MediaIdentity {
            schema: schema.to_string(),
            ..self.identity()
        }
    }

    /// `vhost/app/stream`, the human-readable short form used in logs.
    pub fn tuple(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let info = MediaInfo::parse("srt://v1/live/cam?type=push&token=abc").unwrap();
        assert_eq!(info.schema, "srt");
        assert_eq!(info.vhost, "v1");
        assert_eq!(info.app, "live");
        assert_eq!(info.stream, "cam");
        assert_eq!(info.param("type"), Some("push"));
        assert_eq!(info.param("token"), Some("abc"));
        assert_eq!(info.param("missing"), None);
    }

    #[test]
    fn parse_stream_with_slash() {
        let info = MediaInfo::parse("srt://v1/live/cam/low").unwrap();
        assert_eq!(info.app, "live");
        assert_eq!(info.stream, "cam/low");
    }

    #[test]
    fn parse_missing_segments() {
        assert!(matches!(MediaInfo::parse("srt://v1"), Err(Error::BadStreamId)));
        assert!(matches!(MediaInfo::parse("srt://v1/live"), Err(Error::BadStreamId)));
        assert!(matches!(MediaInfo::parse("srt://v1/live/"), Err(Error::BadStreamId)));
        assert!(matches!(MediaInfo::parse("garbage"), Err(Error::BadStreamId)));
    }

    #[test]
    fn identity_in_other_schema() {
        let info = MediaInfo::parse("srt://v1/live/cam").unwrap();
        let id = info.identity_in(TS_SCHEMA);
        assert_eq!(id.schema, "ts");
        assert_eq!(id.to_string(), "ts/v1/live/cam");
    }
}
