//! the transport byte-stream: a plain `TcpStream` or, with the `tls`
//! feature, a `rustls_connector`-wrapped one, behind a single `Read + Write`
//! surface the rest of the crate never needs to branch on.
//!
//! grounded on the teacher's `WsStream<S>` in `stream.rs`, which drew the
//! same Plain/Tls split for its blocking feature; this crate keeps only the
//! blocking half since SPEC_FULL.md standardizes on a blocking connection
//! model (§4.4, §9).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tracing::debug;

use crate::error::WsError;
use crate::url::WsUrl;

#[cfg(feature = "tls")]
use rustls_connector::{RustlsConnector, TlsStream};

/// a raw pre-connect socket option, the Rust-typed replacement for the
/// Python original's `sockopt` list of `(level, optname, value)` tuples
/// passed straight to `setsockopt`.
#[derive(Debug, Clone, Copy)]
pub enum SockOpt {
    NoDelay(bool),
    RecvBufferSize(usize),
    SendBufferSize(usize),
}

/// the byte stream underlying a connection: plain TCP, or (with the `tls`
/// feature) TLS over TCP. TLS is treated as an opaque `Read + Write`
/// collaborator; certificate policy and cipher selection are left to
/// `rustls-connector`'s defaults, which is as far as this crate goes (§6).
pub enum WsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl WsStream {
    /// open the TCP connection (and TLS handshake, if `url.secure`) named
    /// by `url`, applying the keepalive/nodelay socket options the
    /// teacher's connect path set before any application data crosses the
    /// wire.
    pub fn connect(url: &WsUrl, connect_timeout: Option<Duration>, sockopt: &[SockOpt]) -> Result<Self, WsError> {
        let addr = format!("{}:{}", url.host, url.port);
        let tcp = match connect_timeout {
            Some(timeout) => {
                let mut last_err = None;
                let mut stream = None;
                use std::net::ToSocketAddrs;
                for addr in addr.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                stream.ok_or_else(|| last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
                }))?
            }
            None => TcpStream::connect(&addr)?,
        };
        debug!(host = %url.host, port = url.port, "tcp connected");
        apply_socket_options(&tcp)?;
        apply_user_sockopts(&tcp, sockopt)?;

        if url.secure {
            #[cfg(feature = "tls")]
            {
                let connector = RustlsConnector::new_with_webpki_roots_certs();
                let tls = connector
                    .connect(&url.host, tcp)
                    .map_err(|e| WsError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
                debug!("tls handshake complete");
                return Ok(WsStream::Tls(Box::new(tls)));
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(WsError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "wss:// requires the `tls` feature",
                )));
            }
        }

        Ok(WsStream::Plain(tcp))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            WsStream::Plain(s) => s.set_read_timeout(timeout),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.get_ref().0.set_read_timeout(timeout),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            WsStream::Plain(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.get_ref().0.shutdown(std::net::Shutdown::Both),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            WsStream::Plain(s) => Ok(WsStream::Plain(s.try_clone()?)),
            #[cfg(feature = "tls")]
            WsStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "tls streams cannot be cloned; use the abort handle instead",
            )),
        }
    }
}

fn apply_socket_options(tcp: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(tcp);
    sock.set_tcp_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// apply caller-supplied socket options after the connection-level
/// defaults above, so a caller can override `NoDelay` or size the
/// kernel buffers without this crate needing an opinion on every knob
/// `socket2` exposes.
fn apply_user_sockopts(tcp: &TcpStream, opts: &[SockOpt]) -> io::Result<()> {
    let sock = SockRef::from(tcp);
    for opt in opts {
        match *opt {
            SockOpt::NoDelay(v) => sock.set_tcp_nodelay(v)?,
            SockOpt::RecvBufferSize(n) => sock.set_recv_buffer_size(n)?,
            SockOpt::SendBufferSize(n) => sock.set_send_buffer_size(n)?,
        }
    }
    Ok(())
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WsStream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.flush(),
        }
    }
}
