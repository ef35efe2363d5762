//! parsing of `ws://`/`wss://` URLs into connection parameters.
//!
//! grounded on the teacher's `check_uri` helper in `lib.rs`, which leaned on
//! the `http` crate's `Uri` parser for scheme/host/port extraction. That
//! parser strips brackets off IPv6 literals and has no way to hand them
//! back, and the handshake's `Host` header needs them back, so this crate
//! parses the authority itself instead of carrying the dependency forward
//! for one call site.

use tracing::debug;

use crate::error::UrlError;

/// the parsed form of a `ws`/`wss` URL: host, port, request path (with query
/// string, if any), and whether the connection should run over TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
}

impl WsUrl {
    /// `host[:port]`, with the port omitted when it's the scheme default,
    /// and an IPv6 literal wrapped back in brackets — the form the `Host`
    /// header and the synthesized `Origin` header both need.
    pub fn host_port(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// parse a `ws://` or `wss://` URL into (host, port, path, secure).
///
/// fragments are stripped; the path defaults to `/`; the query string, if
/// present, is appended to the path.
pub fn parse(url: &str) -> Result<WsUrl, UrlError> {
    let url = url.split('#').next().unwrap_or(url);

    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| UrlError::Malformed(url.to_string()))?;
    let secure = match scheme {
        "ws" => false,
        "wss" => true,
        other => return Err(UrlError::UnsupportedScheme(other.to_string())),
    };

    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(UrlError::MissingHost(url.to_string()));
    }

    let (host, port) = parse_authority(authority, secure)?;

    let path = if path_and_query.is_empty() {
        "/".to_string()
    } else {
        path_and_query.to_string()
    };

    debug!(%host, port, %path, secure, "parsed websocket url");
    Ok(WsUrl {
        host,
        port,
        path,
        secure,
    })
}

fn parse_authority(authority: &str, secure: bool) -> Result<(String, u16), UrlError> {
    let default_port = if secure { 443 } else { 80 };

    if let Some(rest) = authority.strip_prefix('[') {
        // bracketed IPv6 literal, optionally followed by `:port`
        let close = rest
            .find(']')
            .ok_or_else(|| UrlError::MalformedIpv6(authority.to_string()))?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(UrlError::MalformedIpv6(authority.to_string()));
        }
        let after = &rest[close + 1..];
        let port = if let Some(port_str) = after.strip_prefix(':') {
            port_str
                .parse()
                .map_err(|_| UrlError::MalformedIpv6(authority.to_string()))?
        } else if after.is_empty() {
            default_port
        } else {
            return Err(UrlError::MalformedIpv6(authority.to_string()));
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse()
                .map_err(|_| UrlError::Malformed(authority.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => {
            if authority.is_empty() {
                Err(UrlError::MissingHost(authority.to_string()))
            } else {
                Ok((authority.to_string(), default_port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_ipv6_literal_with_port_path_and_query() {
        let parsed = parse("wss://[2a03:4000:123:83::3]:8080/r?k=v").unwrap();
        assert_eq!(parsed.host, "2a03:4000:123:83::3");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.path, "/r?k=v");
        assert!(parsed.secure);
    }

    #[test]
    fn default_ports() {
        assert_eq!(parse("ws://example.com").unwrap().port, 80);
        assert_eq!(parse("wss://example.com").unwrap().port, 443);
    }

    #[test]
    fn default_path_is_root() {
        assert_eq!(parse("ws://example.com").unwrap().path, "/");
        assert_eq!(parse("ws://example.com:81").unwrap().path, "/");
    }

    #[test]
    fn fragment_is_stripped() {
        let parsed = parse("ws://example.com/a#frag").unwrap();
        assert_eq!(parsed.path, "/a");
    }

    #[test]
    fn rejects_bad_scheme() {
        assert_eq!(
            parse("http://example.com"),
            Err(UrlError::UnsupportedScheme("http".to_string()))
        );
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(parse("ws:///a"), Err(UrlError::MissingHost(_))));
    }

    #[test]
    fn rejects_malformed_ipv6() {
        assert!(matches!(
            parse("ws://[::1/a"),
            Err(UrlError::MalformedIpv6(_))
        ));
    }

    #[test]
    fn host_port_reattaches_brackets_for_non_default_port() {
        let parsed = parse("wss://[::1]:9000/").unwrap();
        assert_eq!(parsed.host_port(), "[::1]:9000");
    }

    #[test]
    fn host_port_omits_default_port() {
        let parsed = parse("ws://example.com/").unwrap();
        assert_eq!(parsed.host_port(), "example.com");
    }
}
