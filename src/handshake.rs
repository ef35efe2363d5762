//! the HTTP/1.1 upgrade handshake: request construction and response
//! validation.
//!
//! grounded on the teacher's `perform_handshake`/`gen_key`/`cal_accept_key`
//! in `protocol.rs`, and on the Python original's `_get_handshake_headers`/
//! `_validate` in `_handshake.py` for the exact header set and validation
//! order (status line, then Upgrade, then Connection, then Accept, then
//! subprotocol).

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::HandshakeError;
use crate::url::WsUrl;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// per-connection handshake parameters the caller supplies beyond the bare
/// URL: offered subprotocols, extra headers, and a pre-negotiated
/// `Sec-WebSocket-Extensions` offer (built by [`crate::compression`]).
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    pub protocols: Vec<String>,
    pub extra_headers: Vec<(String, String)>,
    pub extensions_offer: Option<String>,
    pub origin: Option<String>,
    pub cookie: Option<String>,
}

/// a generated `Sec-WebSocket-Key` together with the request text it's
/// embedded in, so the caller can hold onto the key for response
/// validation without re-parsing the request.
pub struct Request {
    pub key: String,
    pub text: String,
}

/// 16 random bytes, base64-encoded, per RFC 6455 §4.1.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// `base64(sha1(key + GUID))`, the value a compliant server must echo back
/// in `Sec-WebSocket-Accept`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// build the literal bytes of the GET request that opens the connection.
pub fn build_request(url: &WsUrl, options: &HandshakeOptions) -> Request {
    let key = generate_key();
    let mut lines = Vec::new();
    lines.push(format!("GET {} HTTP/1.1", url.path));
    lines.push(format!("Host: {}", url.host_port()));
    lines.push("Upgrade: websocket".to_string());
    lines.push("Connection: Upgrade".to_string());
    lines.push(format!("Sec-WebSocket-Key: {key}"));
    lines.push("Sec-WebSocket-Version: 13".to_string());

    let origin = options.origin.clone().unwrap_or_else(|| {
        format!(
            "{}://{}",
            if url.secure { "https" } else { "http" },
            url.host_port()
        )
    });
    lines.push(format!("Origin: {origin}"));
    if !options.protocols.is_empty() {
        lines.push(format!(
            "Sec-WebSocket-Protocol: {}",
            options.protocols.join(", ")
        ));
    }
    if let Some(extensions) = &options.extensions_offer {
        lines.push(format!("Sec-WebSocket-Extensions: {extensions}"));
    }
    if let Some(cookie) = &options.cookie {
        lines.push(format!("Cookie: {cookie}"));
    }
    for (name, value) in &options.extra_headers {
        lines.push(format!("{name}: {value}"));
    }

    lines.push(String::new());
    lines.push(String::new());
    debug!(path = %url.path, host = %url.host_port(), "sending handshake request");
    Request {
        key,
        text: lines.join("\r\n"),
    }
}

/// the parts of the server's handshake response this crate cares about,
/// already pulled out of the raw `httparse::Response`.
pub struct ParsedResponse<'a> {
    pub status: u16,
    pub headers: Vec<(&'a str, &'a [u8])>,
}

fn header<'a>(headers: &'a [(&'a str, &'a [u8])], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}

fn header_str<'a>(headers: &'a [(&'a str, &'a [u8])], name: &str) -> Option<&'a str> {
    header(headers, name).and_then(|v| std::str::from_utf8(v).ok())
}

/// validate a parsed handshake response against the key this connection
/// sent and the subprotocols it offered. Returns the single subprotocol
/// the server picked, if any, and the raw `Sec-WebSocket-Extensions`
/// value for [`crate::compression`] to parse.
pub fn validate_response<'a>(
    response: &ParsedResponse<'a>,
    sent_key: &str,
    offered_protocols: &[String],
) -> Result<(Option<String>, Option<String>), HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::UnexpectedStatus(response.status));
    }

    let upgrade = header_str(&response.headers, "Upgrade")
        .ok_or(HandshakeError::InvalidUpgrade)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidUpgrade);
    }

    let connection = header_str(&response.headers, "Connection")
        .ok_or(HandshakeError::InvalidConnection)?;
    if !connection
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::InvalidConnection);
    }

    let accept = header_str(&response.headers, "Sec-WebSocket-Accept")
        .ok_or(HandshakeError::AcceptMismatch)?;
    if accept != accept_key(sent_key) {
        return Err(HandshakeError::AcceptMismatch);
    }

    let picked_protocol = match header_str(&response.headers, "Sec-WebSocket-Protocol") {
        Some(picked) => {
            if offered_protocols.iter().any(|p| p == picked) {
                Some(picked.to_string())
            } else {
                return Err(HandshakeError::SubprotocolMismatch);
            }
        }
        None => None,
    };

    let extensions = header_str(&response.headers, "Sec-WebSocket-Extensions")
        .map(|s| s.to_string());

    debug!(?picked_protocol, ?extensions, "handshake accepted");
    Ok((picked_protocol, extensions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::parse;

    #[test]
    fn s2_accept_key_matches_known_vector() {
        // the RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn s2_accept_key_second_vector() {
        assert_eq!(
            accept_key("c6b8hTg4EeGb2gQMztV1/g=="),
            "Kxep+hNu9n51529fGidYu7a3wO0="
        );
    }

    #[test]
    fn build_request_contains_required_headers() {
        let url = parse("ws://example.com/chat").unwrap();
        let options = HandshakeOptions {
            protocols: vec!["chat".to_string()],
            ..Default::default()
        };
        let req = build_request(&url, &options);
        assert!(req.text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(req.text.contains("Host: example.com\r\n"));
        assert!(req.text.contains("Upgrade: websocket\r\n"));
        assert!(req.text.contains(&format!("Sec-WebSocket-Key: {}\r\n", req.key)));
        assert!(req.text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(req.text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn validate_response_accepts_matching_handshake() {
        let key = "c6b8hTg4EeGb2gQMztV1/g==";
        let response = ParsedResponse {
            status: 101,
            headers: vec![
                ("Upgrade", b"websocket"),
                ("Connection", b"Upgrade"),
                ("Sec-WebSocket-Accept", b"Kxep+hNu9n51529fGidYu7a3wO0="),
            ],
        };
        let (protocol, extensions) = validate_response(&response, key, &[]).unwrap();
        assert_eq!(protocol, None);
        assert_eq!(extensions, None);
    }

    #[test]
    fn validate_response_rejects_wrong_status() {
        let response = ParsedResponse {
            status: 200,
            headers: vec![],
        };
        assert_eq!(
            validate_response(&response, "x", &[]),
            Err(HandshakeError::UnexpectedStatus(200))
        );
    }

    #[test]
    fn validate_response_rejects_mismatched_accept() {
        let response = ParsedResponse {
            status: 101,
            headers: vec![
                ("Upgrade", b"websocket"),
                ("Connection", b"Upgrade"),
                ("Sec-WebSocket-Accept", b"not-the-right-value"),
            ],
        };
        assert_eq!(
            validate_response(&response, "c6b8hTg4EeGb2gQMztV1/g==", &[]),
            Err(HandshakeError::AcceptMismatch)
        );
    }

    #[test]
    fn validate_response_rejects_unoffered_subprotocol() {
        let response = ParsedResponse {
            status: 101,
            headers: vec![
                ("Upgrade", b"websocket"),
                ("Connection", b"Upgrade"),
                ("Sec-WebSocket-Accept", b"Kxep+hNu9n51529fGidYu7a3wO0="),
                ("Sec-WebSocket-Protocol", b"unoffered"),
            ],
        };
        assert_eq!(
            validate_response(&response, "c6b8hTg4EeGb2gQMztV1/g==", &["chat".to_string()]),
            Err(HandshakeError::SubprotocolMismatch)
        );
    }

    #[test]
    fn validate_response_accepts_connection_header_with_keep_alive() {
        // some servers send `Connection: keep-alive, Upgrade`.
        let response = ParsedResponse {
            status: 101,
            headers: vec![
                ("Upgrade", b"websocket"),
                ("Connection", b"keep-alive, Upgrade"),
                ("Sec-WebSocket-Accept", b"Kxep+hNu9n51529fGidYu7a3wO0="),
            ],
        };
        assert!(validate_response(&response, "c6b8hTg4EeGb2gQMztV1/g==", &[]).is_ok());
    }
}
