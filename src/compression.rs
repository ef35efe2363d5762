//! the permessage-deflate extension (RFC 7692): header negotiation and the
//! raw-deflate compress/decompress transform applied to message payloads.
//!
//! grounded on the teacher's `codec/deflate.rs` (`DeflateConfig`,
//! `WebSocketDeflateEncoder`/`Decoder` built on `flate2::{Compress,
//! Decompress}`) for the raw-deflate framing, and on the Python original's
//! `_permessage_deflate.py` (`CompressionOptions`/`CompressionExtension`)
//! for the exact negotiation rules — in particular that a server may set
//! `client_no_context_takeover` unilaterally but must not set
//! `server_no_context_takeover` unless the client asked for it, and that
//! `server_max_window_bits` in the response must not exceed what the
//! client offered.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tracing::{debug, trace};

use crate::error::{HandshakeError, PayloadError, ProtocolError};

/// the 4-byte raw-deflate trailer `permessage-deflate` strips from
/// compressed output and re-appends before decompressing, per RFC 7692 §7.2.1.
const EMPTY_DEFLATE_BLOCK: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// default cap on a single decompressed message, guarding against a
/// malicious or buggy peer sending a small compressed frame that expands
/// to an unbounded size.
const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// this connection's permessage-deflate parameters, as negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
    /// upper bound on a single decompressed message, in bytes.
    pub max_size: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            max_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl CompressionOptions {
    /// the `Sec-WebSocket-Extensions` value this client offers when it
    /// wants permessage-deflate.
    pub fn to_offer_header(&self) -> String {
        let mut params = vec!["permessage-deflate".to_string()];
        if self.server_no_context_takeover {
            params.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            params.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits != 15 {
            params.push(format!("server_max_window_bits={}", self.server_max_window_bits));
        }
        // RFC 7692 allows offering client_max_window_bits with no value,
        // letting the server pick; we always state our own cap explicitly.
        params.push(format!("client_max_window_bits={}", self.client_max_window_bits));
        params.join("; ")
    }

    /// parse the server's `Sec-WebSocket-Extensions` response and validate
    /// it against what this client offered. Returns `None` if the server
    /// declined the extension (no matching token in the header at all);
    /// an absent header is also `None`.
    pub fn negotiate(offered: &CompressionOptions, response_header: Option<&str>) -> Result<Option<CompressionOptions>, HandshakeError> {
        let header = match response_header {
            Some(h) => h,
            None => return Ok(None),
        };

        let offer_token = header
            .split(',')
            .map(str::trim)
            .find(|tok| tok.split(';').next().map(str::trim) == Some("permessage-deflate"));
        let token = match offer_token {
            Some(t) => t,
            None => return Ok(None),
        };

        let mut result = CompressionOptions {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: offered.server_max_window_bits,
            client_max_window_bits: offered.client_max_window_bits,
            max_size: offered.max_size,
        };

        for param in token.split(';').skip(1) {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (param, None),
            };
            match name {
                "server_no_context_takeover" => {
                    result.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    result.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let bits: u8 = value
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| HandshakeError::ExtensionMismatch(
                            "malformed server_max_window_bits".to_string(),
                        ))?;
                    if bits > offered.server_max_window_bits || !(8..=15).contains(&bits) {
                        return Err(HandshakeError::ExtensionMismatch(format!(
                            "server_max_window_bits={bits} exceeds offered {}",
                            offered.server_max_window_bits
                        )));
                    }
                    result.server_max_window_bits = bits;
                }
                "client_max_window_bits" => {
                    let bits: u8 = match value {
                        Some(v) => v.parse().map_err(|_| {
                            HandshakeError::ExtensionMismatch(
                                "malformed client_max_window_bits".to_string(),
                            )
                        })?,
                        // server may omit the value to mean "use whatever I offered"
                        None => offered.client_max_window_bits,
                    };
                    if bits > offered.client_max_window_bits || !(8..=15).contains(&bits) {
                        return Err(HandshakeError::ExtensionMismatch(format!(
                            "client_max_window_bits={bits} exceeds offered {}",
                            offered.client_max_window_bits
                        )));
                    }
                    result.client_max_window_bits = bits;
                }
                other => {
                    return Err(HandshakeError::ExtensionMismatch(format!(
                        "unknown parameter `{other}`"
                    )))
                }
            }
        }

        if offered.server_no_context_takeover && !result.server_no_context_takeover {
            return Err(HandshakeError::ExtensionMismatch(
                "server dropped the demanded server_no_context_takeover".to_string(),
            ));
        }

        debug!(?result, "permessage-deflate negotiated");
        Ok(Some(result))
    }
}

/// stateful per-connection compressor/decompressor pair. `flate2`'s raw
/// (no zlib header/trailer) mode matches RFC 7692's wire format directly.
pub struct CompressionExtension {
    options: CompressionOptions,
    compress: Compress,
    decompress: Decompress,
}

impl CompressionExtension {
    pub fn new(options: CompressionOptions) -> Self {
        Self {
            options,
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
        }
    }

    /// compress one message payload. Appends `SYNC_FLUSH` output and then
    /// strips the trailing empty-deflate-block marker, per RFC 7692 §7.2.1.
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(data.len());
        self.compress
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .map_err(|e| ProtocolError::Deflate(e.to_string()))?;
        if out.ends_with(&EMPTY_DEFLATE_BLOCK) {
            out.truncate(out.len() - 4);
        }
        if self.options.client_no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }

    /// decompress one message payload. The caller re-appends the
    /// empty-deflate-block marker that compression stripped, since
    /// `flate2`'s raw inflate needs it to recognize the end of the block.
    /// Output is capped at `options.max_size`, per spec: a peer sending a
    /// small compressed frame that would expand past that bound gets
    /// `PayloadError::DecompressedTooLarge` instead of an unbounded buffer.
    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, crate::error::WsError> {
        let mut input = Vec::with_capacity(data.len() + 4);
        input.extend_from_slice(data);
        input.extend_from_slice(&EMPTY_DEFLATE_BLOCK);

        let mut out = Vec::with_capacity(data.len() * 3 + 16);
        loop {
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            self.decompress
                .decompress_vec(&input[in_before as usize..], &mut out, FlushDecompress::Sync)
                .map_err(|e| ProtocolError::Deflate(e.to_string()))?;
            if out.len() > self.options.max_size {
                return Err(PayloadError::DecompressedTooLarge(self.options.max_size).into());
            }
            let made_progress = self.decompress.total_in() > in_before || self.decompress.total_out() > out_before;
            if !made_progress || self.decompress.total_in() as usize >= input.len() {
                break;
            }
        }

        trace!(compressed = data.len(), decompressed = out.len(), "decompressed message");
        if self.options.server_no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s7_round_trip_preserves_payload() {
        let options = CompressionOptions::default();
        let mut tx = CompressionExtension::new(options);
        let mut rx = CompressionExtension::new(options);

        let message = b"the quick brown fox jumps over the lazy dog, repeatedly, for a while";
        let compressed = tx.compress(message).unwrap();
        assert!(compressed.len() < message.len());
        let decompressed = rx.decompress(&compressed).unwrap();
        assert_eq!(decompressed, message);
    }

    #[test]
    fn to_offer_header_names_the_extension() {
        let options = CompressionOptions::default();
        let header = options.to_offer_header();
        assert!(header.starts_with("permessage-deflate"));
        assert!(header.contains("client_max_window_bits=15"));
    }

    #[test]
    fn negotiate_returns_none_when_server_declines() {
        let offered = CompressionOptions::default();
        let result = CompressionOptions::negotiate(&offered, None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn negotiate_accepts_no_context_takeover_from_server() {
        let offered = CompressionOptions::default();
        let header = "permessage-deflate; client_no_context_takeover";
        let result = CompressionOptions::negotiate(&offered, Some(header))
            .unwrap()
            .unwrap();
        assert!(result.client_no_context_takeover);
        assert!(!result.server_no_context_takeover);
    }

    #[test]
    fn negotiate_rejects_server_max_window_bits_above_offer() {
        let mut offered = CompressionOptions::default();
        offered.server_max_window_bits = 10;
        let header = "permessage-deflate; server_max_window_bits=12";
        assert!(CompressionOptions::negotiate(&offered, Some(header)).is_err());
    }

    #[test]
    fn negotiate_ignores_other_extensions_in_header() {
        let offered = CompressionOptions::default();
        let header = "foo-bar, permessage-deflate; client_no_context_takeover";
        let result = CompressionOptions::negotiate(&offered, Some(header))
            .unwrap()
            .unwrap();
        assert!(result.client_no_context_takeover);
    }
}
