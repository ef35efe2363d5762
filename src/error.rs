//! error taxonomy
//!
//! every fallible boundary in this crate returns one of the narrow
//! `*Error` enums below; [`WsError`] is the umbrella type the public API
//! surfaces so a caller can match once and still `From`-convert into the
//! specific cause when it matters.

use thiserror::Error;

/// malformed or unsupported `ws`/`wss` URL.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("unsupported scheme `{0}`, expected `ws` or `wss`")]
    UnsupportedScheme(String),
    #[error("missing host in url `{0}`")]
    MissingHost(String),
    #[error("malformed ipv6 literal in url `{0}`")]
    MalformedIpv6(String),
    #[error("malformed url `{0}`")]
    Malformed(String),
}

/// the HTTP/1.1 upgrade handshake did not validate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("expected status 101, got {0}")]
    UnexpectedStatus(u16),
    #[error("missing or invalid Upgrade header")]
    InvalidUpgrade,
    #[error("missing or invalid Connection header")]
    InvalidConnection,
    #[error("Sec-WebSocket-Accept did not match the derived value")]
    AcceptMismatch,
    #[error("server did not echo exactly one offered subprotocol")]
    SubprotocolMismatch,
    #[error("incompatible permessage-deflate parameters: {0}")]
    ExtensionMismatch(String),
    #[error("malformed http response: {0}")]
    MalformedResponse(String),
}

/// a decoded or to-be-encoded frame violates RFC 6455.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bit rsv{0} set without a compatible extension")]
    ReservedBitSet(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("control frame is fragmented")]
    FragmentedControlFrame,
    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooLarge(usize),
    #[error("compressed control frame")]
    CompressedControlFrame,
    #[error("continuation frame without an in-flight message")]
    UnexpectedContinuation,
    #[error("new data frame while a message is already in flight")]
    InterleavedDataFrame,
    #[error("close frame payload length 1 is invalid")]
    InvalidCloseLength,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("payload length {0} exceeds the 63-bit limit")]
    PayloadTooLarge(u64),
    #[error("deflate stream error: {0}")]
    Deflate(String),
}

/// a well-formed frame carried an invalid payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("invalid utf-8 in text payload")]
    InvalidUtf8,
    #[error("decompressed payload exceeds {0} bytes")]
    DecompressedTooLarge(usize),
}

/// a read, write or ping deadline elapsed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("timed out waiting for {0}")]
pub struct TimeoutError(pub &'static str);

/// the umbrella error type returned by the public API.
#[derive(Debug, Error)]
pub enum WsError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("operation aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// the close code a well-behaved peer should send back for this error,
    /// per §7 of the protocol specification. `None` for errors that never
    /// attempt a close exchange (the peer is already gone, or we were the
    /// one who tore things down locally).
    pub fn close_code(&self) -> Option<u16> {
        match self {
            WsError::Protocol(_) | WsError::Url(_) | WsError::Handshake(_) => Some(1002),
            WsError::Payload(_) => Some(1007),
            WsError::Timeout(_) => Some(1011),
            WsError::ConnectionClosed | WsError::Aborted | WsError::Io(_) => None,
        }
    }
}

/// shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, WsError>;
