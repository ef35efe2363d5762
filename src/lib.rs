//! a client-side implementation of the WebSocket protocol, RFC 6455
//! ("hybi-13").
//!
//! [`ClientBuilder`] configures and opens a single [`connection::Connection`];
//! [`app::WebSocketAppBuilder`] wraps a builder in a reconnecting event loop
//! with ping scheduling and callback dispatch, for long-lived clients that
//! don't want to manage their own read loop.
//!
//! ```no_run
//! use ws_client::ClientBuilder;
//!
//! let mut conn = ClientBuilder::new("wss://example.com/socket")
//!     .protocol("chat")
//!     .connect()
//!     .expect("handshake failed");
//! conn.send_text("hello").unwrap();
//! ```

pub mod app;
pub mod compression;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod stream;
pub mod url;

pub use app::{AppConfig, StopHandle, WebSocketApp, WebSocketAppBuilder};
pub use compression::CompressionOptions;
pub use connection::{ClientConfig, Connection, ConnectionState, Event};
pub use error::{HandshakeError, PayloadError, ProtocolError, TimeoutError, UrlError, WsError};
pub use frame::OpCode;
pub use stream::SockOpt;
pub use url::WsUrl;

use std::time::Duration;

/// fluent configuration for a single connection, mirroring the
/// consuming-`self` chain the teacher's own `ClientBuilder` exposed
/// (`.header(..).protocol(..).connect()`).
pub struct ClientBuilder {
    url: String,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: ClientConfig::default(),
        }
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.protocols.push(protocol.into());
        self
    }

    pub fn protocols(mut self, protocols: impl IntoIterator<Item = String>) -> Self {
        self.config.protocols.extend(protocols);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.config.extra_headers.extend(headers);
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = Some(origin.into());
        self
    }

    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        self.config.cookie = Some(cookie.into());
        self
    }

    pub fn sockopt(mut self, opt: SockOpt) -> Self {
        self.config.sockopt.push(opt);
        self
    }

    pub fn skip_utf8_validation(mut self, skip: bool) -> Self {
        self.config.skip_utf8_validation = skip;
        self
    }

    /// deliver each fragment of a fragmented message as [`Event::Cont`]
    /// instead of only the fully reassembled message.
    pub fn fire_cont_frame(mut self, fire: bool) -> Self {
        self.config.fire_cont_frame = fire;
        self
    }

    pub fn enable_multithread(mut self, enable: bool) -> Self {
        self.config.enable_multithread = enable;
        self
    }

    /// offer permessage-deflate (RFC 7692) with the given parameters.
    pub fn compression(mut self, options: CompressionOptions) -> Self {
        self.config.compression = Some(options);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// run the handshake and return an open [`Connection`].
    pub fn connect(self) -> Result<Connection, WsError> {
        Connection::connect(&self.url, &self.config)
    }

    /// hand this builder's configuration to a [`app::WebSocketAppBuilder`],
    /// for callers who want the reconnecting loop instead of driving
    /// `recv()` themselves.
    pub fn into_app(self) -> app::WebSocketAppBuilder {
        let mut builder = app::WebSocketAppBuilder::new(self.url);
        builder = builder.protocols(self.config.protocols);
        for (name, value) in self.config.extra_headers {
            builder = builder.header(name, value);
        }
        if let Some(origin) = self.config.origin {
            builder = builder.origin(origin);
        }
        if let Some(cookie) = self.config.cookie {
            builder = builder.cookie(cookie);
        }
        if let Some(compression) = self.config.compression {
            builder = builder.compression(compression);
        }
        if let Some(timeout) = self.config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.config.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        for opt in self.config.sockopt {
            builder = builder.sockopt(opt);
        }
        builder = builder
            .skip_utf8_validation(self.config.skip_utf8_validation)
            .fire_cont_frame(self.config.fire_cont_frame)
            .enable_multithread(self.config.enable_multithread);
        builder
    }
}
