//! URL splitting and query-string parsing.
//!
//! Shared by [`MediaInfo`](crate::media::MediaInfo) (stream identities of
//! the form `srt://vhost/app/stream?k=v`) and the HTTP client (request
//! targets and proxy URLs). Deliberately small: scheme, optional
//! userinfo, host, optional port, path, query, and nothing more.

use crate::error::{Error, Result};

/// A split URL. `path` always begins with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
}

impl Url {
    /// Split `scheme://[user[:pw]@]host[:port][/path][?query]`.
    ///
    /// `example.com` and `example.com:8080/x` (no scheme) are rejected;
    /// callers always have a scheme in hand.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Protocol(format!("url missing scheme: {url}")))?;
        if scheme.is_empty() {
            return Err(Error::Protocol(format!("url missing scheme: {url}")));
        }

        let (authority, path_and_query) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };

        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, authority),
        };
        let (username, password) = match userinfo {
            Some(u) => match u.split_once(':') {
                Some((name, pw)) => (Some(name.to_string()), Some(pw.to_string())),
                None => (Some(u.to_string()), None),
            },
            None => (None, None),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| Error::Protocol(format!("bad port in url: {url}")))?;
                (h, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(Error::Protocol(format!("url missing host: {url}")));
        }

        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };

        Ok(Url {
            scheme: scheme.to_ascii_lowercase(),
            username,
            password,
            host: host.to_string(),
            port,
            path,
            query,
        })
    }

    /// The explicit port, or the scheme default (80/443).
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme.as_str() {
            "https" => 443,
            _ => 80,
        })
    }

    /// Path plus query string, as sent on an HTTP request line.
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// `host` or `host:port` when the port differs from the scheme default.
    pub fn host_header(&self) -> String {
        match self.port {
            Some(p) if p != default_port(&self.scheme) => format!("{}:{}", self.host, p),
            _ => self.host.clone(),
        }
    }

    /// Resolve a `Location` header value against this URL: absolute URLs
    /// pass through, `/path` targets keep the origin.
    pub fn join(&self, location: &str) -> Result<Url> {
        if location.contains("://") {
            return Url::parse(location);
        }
        let mut url = self.clone();
        let target = if location.starts_with('/') {
            location.to_string()
        } else {
            // Relative reference: replace the last path segment.
            match self.path.rfind('/') {
                Some(pos) => format!("{}/{}", &self.path[..pos], location),
                None => format!("/{location}"),
            }
        };
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target, None),
        };
        url.path = path;
        url.query = query;
        Ok(url)
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        _ => 80,
    }
}

/// Parse `k1=v1&k2=v2` into ordered pairs. Keys without `=` map to an
/// empty value; empty segments are skipped.
pub fn parse_args(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_http() {
        let u = Url::parse("http://example.com/a/b?x=1").unwrap();
        assert_eq!(u.scheme, "http");
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, None);
        assert_eq!(u.port_or_default(), 80);
        assert_eq!(u.path, "/a/b");
        assert_eq!(u.query.as_deref(), Some("x=1"));
        assert_eq!(u.request_target(), "/a/b?x=1");
    }

    #[test]
    fn parse_https_default_port() {
        let u = Url::parse("https://example.com").unwrap();
        assert_eq!(u.port_or_default(), 443);
        assert_eq!(u.path, "/");
        assert_eq!(u.host_header(), "example.com");
    }

    #[test]
    fn parse_userinfo_and_port() {
        let u = Url::parse("http://user:pw@proxy.local:3128").unwrap();
        assert_eq!(u.username.as_deref(), Some("user"));
        assert_eq!(u.password.as_deref(), Some("pw"));
        assert_eq!(u.host, "proxy.local");
        assert_eq!(u.port, Some(3128));
        assert_eq!(u.host_header(), "proxy.local:3128");
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(Url::parse("example.com/a").is_err());
        assert!(Url::parse("://example.com").is_err());
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(Url::parse("http://example.com:notaport/").is_err());
    }

    #[test]
    fn join_absolute_and_origin_relative() {
        let base = Url::parse("http://example.com:8080/a/b?x=1").unwrap();

        let abs = base.join("http://other.net/c").unwrap();
        assert_eq!(abs.host, "other.net");
        assert_eq!(abs.path, "/c");

        let rel = base.join("/c?y=2").unwrap();
        assert_eq!(rel.host, "example.com");
        assert_eq!(rel.port, Some(8080));
        assert_eq!(rel.path, "/c");
        assert_eq!(rel.query.as_deref(), Some("y=2"));
    }

    #[test]
    fn join_segment_relative() {
        let base = Url::parse("http://example.com/a/b").unwrap();
        let rel = base.join("c").unwrap();
        assert_eq!(rel.path, "/a/c");
    }

    #[test]
    fn args_basic() {
        let args = parse_args("type=push&token=abc&flag");
        assert_eq!(
            args,
            vec![
                ("type".into(), "push".into()),
                ("token".into(), "abc".into()),
                ("flag".into(), String::new()),
            ]
        );
    }

    #[test]
    fn args_empty() {
        assert!(parse_args("").is_empty());
    }
}
