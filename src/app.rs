//! the reconnecting application loop: `WebSocketApp`/`WebSocketAppBuilder`.
//!
//! grounded directly on the Python original's `_app.py` `WebSocketApp`:
//! `run_forever`'s `select.select` readiness poll becomes a blocking
//! `recv` against a read-timeout stream (§4.5, §9); `_send_ping`'s daemon
//! thread becomes a `std::thread::spawn`'d ping scheduler that shares the
//! connection (and a last-ping timestamp, set when the PING is sent, not
//! when a PONG lands back — matching `_send_ping`'s `last_ping_tm`) behind
//! a `Mutex`; `_callback`'s try/except-and-log wrapper becomes a
//! `catch_unwind` plus `tracing::warn!` around each callback invocation so
//! a panicking or merely sloppy callback can't take the loop down with it —
//! matched against the teacher's own habit (`protocol.rs`) of logging
//! recoverable errors rather than propagating them out of a background
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::{ClientConfig, Connection, Event};
use crate::error::WsError;
use crate::stream::SockOpt;

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// the user-supplied callback set; each is optional, matching the
/// original's `on_open`/`on_message`/`on_error`/`on_close`/`on_ping`/
/// `on_pong`/`on_cont_message` attributes that default to `None`.
#[derive(Default)]
struct Callbacks {
    on_open: Option<Callback<()>>,
    on_text: Option<Callback<String>>,
    on_binary: Option<Callback<Vec<u8>>>,
    on_ping: Option<Callback<Vec<u8>>>,
    on_pong: Option<Callback<Vec<u8>>>,
    on_cont_message: Option<Callback<(Vec<u8>, bool)>>,
    on_error: Option<Callback<WsError>>,
    on_close: Option<Callback<(Option<u16>, String)>>,
}

/// configuration for the reconnecting loop itself, layered on top of
/// [`ClientConfig`]'s per-connection settings.
#[derive(Clone)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            ping_interval: None,
            ping_timeout: Duration::from_secs(10),
            reconnect: false,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// builds a [`WebSocketApp`], fluently registering callbacks before the
/// loop starts — the same consuming-`self` shape as the teacher's
/// `ClientBuilder::header`/`protocol` chain.
pub struct WebSocketAppBuilder {
    url: String,
    config: AppConfig,
    callbacks: Callbacks,
}

impl WebSocketAppBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: AppConfig::default(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.client.protocols.push(protocol.into());
        self
    }

    pub fn protocols(mut self, protocols: impl IntoIterator<Item = String>) -> Self {
        self.config.client.protocols.extend(protocols);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.client.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.client.origin = Some(origin.into());
        self
    }

    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        self.config.client.cookie = Some(cookie.into());
        self
    }

    /// offer permessage-deflate (RFC 7692) with the given parameters.
    pub fn compression(mut self, options: crate::compression::CompressionOptions) -> Self {
        self.config.client.compression = Some(options);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.read_timeout = Some(timeout);
        self
    }

    pub fn sockopt(mut self, opt: SockOpt) -> Self {
        self.config.client.sockopt.push(opt);
        self
    }

    pub fn skip_utf8_validation(mut self, skip: bool) -> Self {
        self.config.client.skip_utf8_validation = skip;
        self
    }

    /// deliver each fragment of a fragmented message via [`Self::on_cont_message`]
    /// as it arrives, instead of only the fully reassembled message.
    pub fn fire_cont_frame(mut self, fire: bool) -> Self {
        self.config.client.fire_cont_frame = fire;
        self
    }

    pub fn enable_multithread(mut self, enable: bool) -> Self {
        self.config.client.enable_multithread = enable;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, delay: Duration) -> Self {
        self.config.reconnect = true;
        self.config.reconnect_delay = delay;
        self
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_open = Some(Box::new(move |_: ()| f()));
        self
    }

    pub fn on_text(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.callbacks.on_text = Some(Box::new(f));
        self
    }

    pub fn on_binary(mut self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_binary = Some(Box::new(f));
        self
    }

    pub fn on_ping(mut self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_ping = Some(Box::new(f));
        self
    }

    pub fn on_pong(mut self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_pong = Some(Box::new(f));
        self
    }

    /// called with (fragment bytes, is-final) for each piece of a
    /// fragmented message, as it arrives; only fires when
    /// [`WebSocketAppBuilder::fire_cont_frame`] is set.
    pub fn on_cont_message(mut self, f: impl Fn(Vec<u8>, bool) + Send + Sync + 'static) -> Self {
        self.callbacks.on_cont_message = Some(Box::new(move |(data, fin)| f(data, fin)));
        self
    }

    pub fn on_error(mut self, f: impl Fn(WsError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn((Option<u16>, String)) + Send + Sync + 'static) -> Self {
        self.callbacks.on_close = Some(Box::new(f));
        self
    }

    pub fn build(self) -> WebSocketApp {
        WebSocketApp {
            url: self.url,
            config: self.config,
            callbacks: Arc::new(self.callbacks),
            keep_running: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// a reconnecting client loop that owns the connection and dispatches
/// inbound events to registered callbacks, plus a background ping
/// scheduler when `ping_interval` is set.
pub struct WebSocketApp {
    url: String,
    config: AppConfig,
    callbacks: Arc<Callbacks>,
    keep_running: Arc<AtomicBool>,
}

/// lets a caller on another thread stop [`WebSocketApp::run_forever`].
/// Owning this handle and dropping the app itself is the idiomatic
/// replacement for the original's `keep_running = False` attribute flip.
#[derive(Clone)]
pub struct StopHandle {
    keep_running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }
}

impl WebSocketApp {
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            keep_running: self.keep_running.clone(),
        }
    }

    /// connect and dispatch events until [`StopHandle::stop`] is called or
    /// an unrecoverable error occurs; if `reconnect` is configured, a
    /// dropped connection restarts the loop after `reconnect_delay`
    /// instead of returning.
    pub fn run_forever(&self) -> Result<(), WsError> {
        loop {
            if !self.keep_running.load(Ordering::SeqCst) {
                return Ok(());
            }

            match self.run_once() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if let Some(cb) = &self.callbacks.on_error {
                        invoke(|| cb(clone_ws_error(&e)));
                    }
                    if !self.config.reconnect || !self.keep_running.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                    warn!(error = %e, "connection lost, reconnecting");
                    std::thread::sleep(self.config.reconnect_delay);
                }
            }
        }
    }

    fn run_once(&self) -> Result<(), WsError> {
        let conn = Connection::connect(&self.url, &self.config.client)?;
        let conn = Arc::new(Mutex::new(conn));
        let last_ping = Arc::new(Mutex::new(None::<Instant>));

        if let Some(cb) = &self.callbacks.on_open {
            invoke(|| cb(()));
        }

        let ping_thread = self.config.ping_interval.map(|interval| {
            spawn_ping_thread(
                conn.clone(),
                last_ping.clone(),
                interval,
                self.config.ping_timeout,
                self.keep_running.clone(),
            )
        });

        let result = self.dispatch_loop(&conn);

        if let Some(handle) = ping_thread {
            let _ = handle.join();
        }

        result
    }

    fn dispatch_loop(&self, conn: &Arc<Mutex<Connection>>) -> Result<(), WsError> {
        loop {
            if !self.keep_running.load(Ordering::SeqCst) {
                let mut guard = conn.lock().unwrap();
                let _ = guard.close(1000, "client stopping");
                return Ok(());
            }

            let event = {
                let mut guard = conn.lock().unwrap();
                guard.recv()
            };

            match event {
                Ok(Event::Text(text)) => {
                    if let Some(cb) = &self.callbacks.on_text {
                        invoke(|| cb(text.clone()));
                    }
                }
                Ok(Event::Binary(data)) => {
                    if let Some(cb) = &self.callbacks.on_binary {
                        invoke(|| cb(data.clone()));
                    }
                }
                Ok(Event::Ping(payload)) => {
                    if let Some(cb) = &self.callbacks.on_ping {
                        invoke(|| cb(payload.clone()));
                    }
                }
                Ok(Event::Pong(payload)) => {
                    if let Some(cb) = &self.callbacks.on_pong {
                        invoke(|| cb(payload.clone()));
                    }
                }
                Ok(Event::Cont(data, fin)) => {
                    if let Some(cb) = &self.callbacks.on_cont_message {
                        invoke(|| cb((data.clone(), fin)));
                    }
                }
                Ok(Event::Closed { code, reason }) => {
                    if let Some(cb) = &self.callbacks.on_close {
                        invoke(|| cb((code, reason.clone())));
                    }
                    return Ok(());
                }
                Err(WsError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// periodically sends a PING, recording the send time in `last_ping`
/// (never updated on PONG receipt, matching the original's `last_ping_tm`),
/// and closes the connection with code 1011 if `timeout` elapses with no
/// PONG having reset it.
fn spawn_ping_thread(
    conn: Arc<Mutex<Connection>>,
    last_ping: Arc<Mutex<Option<Instant>>>,
    interval: Duration,
    timeout: Duration,
    keep_running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        if !keep_running.load(Ordering::SeqCst) {
            return;
        }

        if let Some(sent_at) = *last_ping.lock().unwrap() {
            if sent_at.elapsed() > timeout {
                warn!("ping timeout exceeded, closing connection");
                let _ = conn.lock().unwrap().close(1011, "ping timeout");
                return;
            }
        }

        let sent = conn.lock().unwrap().send_ping(Vec::new());
        if sent.is_err() {
            debug!("ping send failed, stopping keep-alive thread");
            return;
        }
        *last_ping.lock().unwrap() = Some(Instant::now());
    })
}

/// a callback running arbitrary user code shouldn't be able to unwind the
/// loop out from under the connection; log and move on, matching the
/// original's `_callback` try/except.
fn invoke(f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(panic = %message, "callback panicked");
    }
}

fn clone_ws_error(e: &WsError) -> WsError {
    // `WsError` wraps `std::io::Error`, which isn't `Clone`; callbacks get
    // a reconstructed equivalent carrying the same message instead.
    match e {
        WsError::Io(io_err) => WsError::Io(std::io::Error::new(io_err.kind(), io_err.to_string())),
        WsError::ConnectionClosed => WsError::ConnectionClosed,
        WsError::Aborted => WsError::Aborted,
        WsError::Url(e) => WsError::Url(e.clone()),
        WsError::Handshake(e) => WsError::Handshake(e.clone()),
        WsError::Protocol(e) => WsError::Protocol(e.clone()),
        WsError::Payload(e) => WsError::Payload(e.clone()),
        WsError::Timeout(e) => WsError::Timeout(*e),
    }
}
