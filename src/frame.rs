//! the RFC 6455 frame codec: binary layout, masking, and the resumable
//! decoder that drives frame assembly off a possibly-partial stream.
//!
//! grounded on the teacher's `frame.rs` (`Header`/`OwnedFrame` bit-twiddling)
//! and `codec.rs` (`FrameDecoder`'s buffered partial-read handling), reworked
//! into the four explicit phases §4.2 calls for (header, extended length,
//! mask key, payload) so a caller reading off a non-blocking or timeout-
//! bearing stream can resume cleanly after a short read.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Read};
use tracing::{debug, trace};

use crate::error::ProtocolError;

/// 4-bit RFC 6455 opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn from_u8(val: u8) -> Result<Self, ProtocolError> {
        match val {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }

    /// control frames (`>= 0x8`) carry protocol signalling rather than
    /// application payload and may interleave with a fragmented message.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// valid RFC 6455 close status codes, plus the private-use range.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(
        code,
        1000..=1003 | 1007..=1011
    ) || (3000..5000).contains(&code)
}

/// a fully decoded (or about-to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload,
        }
    }

    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Text, payload.into())
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Binary, payload.into())
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// build a CLOSE frame payload: 2-byte big-endian code followed by a
    /// UTF-8 reason, truncated so the whole payload stays within the
    /// control-frame limit of 125 bytes (§4.4).
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.put_u16(code);
        let mut reason_bytes = reason.as_bytes();
        if reason_bytes.len() > 123 {
            reason_bytes = &reason_bytes[..123];
        }
        payload.extend_from_slice(reason_bytes);
        Self::new(OpCode::Close, payload)
    }

    /// validate an already-assembled frame against §4.2's per-frame rules.
    /// fragmentation/interleaving rules live in `connection::Connection`
    /// since they need cross-frame state; this only checks what a single
    /// frame can tell you about itself.
    pub fn validate(&self, compression_active: bool) -> Result<(), ProtocolError> {
        if self.rsv2 {
            return Err(ProtocolError::ReservedBitSet(2));
        }
        if self.rsv3 {
            return Err(ProtocolError::ReservedBitSet(3));
        }
        if self.rsv1 && !(compression_active && self.opcode.is_data()) {
            return Err(ProtocolError::ReservedBitSet(1));
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if self.payload.len() > 125 {
                return Err(ProtocolError::ControlFrameTooLarge(self.payload.len()));
            }
            if self.rsv1 {
                return Err(ProtocolError::CompressedControlFrame);
            }
        }
        if self.opcode == OpCode::Close {
            validate_close_payload(&self.payload)?;
        }
        Ok(())
    }

    /// serialize this frame to wire bytes. `mask` is the 4-byte key to
    /// apply; client frames are always masked (§3), so callers always pass
    /// `Some`, but the type also accommodates server-role reuse of the
    /// codec (out of scope for this crate, but kept generic since nothing
    /// about encoding itself is client-specific).
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len() as u64;
        if len >= (1u64 << 63) {
            return Err(ProtocolError::PayloadTooLarge(len));
        }

        let mut out = BytesMut::with_capacity(self.payload.len() + 14);
        let byte0 = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | self.opcode.as_u8();
        out.put_u8(byte0);

        let mask_bit = (mask.is_some() as u8) << 7;
        if len < 126 {
            out.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as u64 {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len);
        }

        if let Some(key) = mask {
            out.put_slice(&key);
            let mut payload = self.payload.clone();
            apply_mask(key, &mut payload);
            out.put_slice(&payload);
        } else {
            out.put_slice(&self.payload);
        }

        Ok(out)
    }
}

fn validate_close_payload(payload: &[u8]) -> Result<(), ProtocolError> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(ProtocolError::InvalidCloseLength),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            if std::str::from_utf8(&payload[2..]).is_err() {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            Ok(())
        }
    }
}

/// XOR-mask (or unmask — the operation is its own inverse, P1) `data` in
/// place with the repeating 4-byte `key`.
pub fn apply_mask(key: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// produces the 4-byte client mask key for an outgoing frame. the default
/// implementation draws from `rand`; tests inject a deterministic
/// generator (see `s3_small_send_with_fixed_mask` below) to pin exact wire
/// bytes, per §4.2's "tests may inject a deterministic generator".
pub trait MaskKeyGen: Send {
    fn next_key(&mut self) -> [u8; 4];
}

/// cryptographically-random mask keys, the default for real connections.
#[derive(Debug, Default)]
pub struct RandomMaskKeyGen;

impl MaskKeyGen for RandomMaskKeyGen {
    fn next_key(&mut self) -> [u8; 4] {
        rand::random()
    }
}

/// always returns the same key; only meant for tests and the `raw` demo.
pub struct FixedMaskKeyGen(pub [u8; 4]);

impl MaskKeyGen for FixedMaskKeyGen {
    fn next_key(&mut self) -> [u8; 4] {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodePhase {
    Header,
    ExtendedLength,
    MaskKey,
    Payload,
}

struct PartialHeader {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode_byte: u8,
    masked: bool,
    len7: u8,
}

/// a resumable frame decoder: each call to [`FrameDecoder::decode`] reads as
/// far as the underlying stream allows and, on a short read, remembers its
/// place so the next call picks up where it left off rather than
/// re-reading from the start (§4.2).
pub struct FrameDecoder {
    phase: DecodePhase,
    header: Option<PartialHeader>,
    payload_len: u64,
    mask: Option<[u8; 4]>,
    scratch: BytesMut,
    needed: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            phase: DecodePhase::Header,
            header: None,
            payload_len: 0,
            mask: None,
            scratch: BytesMut::new(),
            needed: 2,
        }
    }

    fn reset(&mut self) {
        self.phase = DecodePhase::Header;
        self.header = None;
        self.payload_len = 0;
        self.mask = None;
        self.scratch.clear();
        self.needed = 2;
    }

    /// read exactly as many bytes as the current phase still needs, then
    /// advance; returns `Ok(None)` (never — `read` is blocking) or the
    /// completed frame once the payload phase finishes. A `WouldBlock`/
    /// `Interrupted` error surfaces to the caller with the decoder's
    /// progress preserved for the next call.
    pub fn decode<R: Read>(&mut self, stream: &mut R) -> Result<Frame, DecodeError> {
        loop {
            let remaining = self.needed - self.scratch.len();
            if remaining > 0 {
                let mut buf = vec![0u8; remaining];
                let n = stream.read(&mut buf).map_err(DecodeError::Io)?;
                if n == 0 {
                    return Err(DecodeError::Eof);
                }
                self.scratch.extend_from_slice(&buf[..n]);
                if self.scratch.len() < self.needed {
                    continue;
                }
            }

            match self.phase {
                DecodePhase::Header => {
                    let b0 = self.scratch[0];
                    let b1 = self.scratch[1];
                    let header = PartialHeader {
                        fin: b0 & 0x80 != 0,
                        rsv1: b0 & 0x40 != 0,
                        rsv2: b0 & 0x20 != 0,
                        rsv3: b0 & 0x10 != 0,
                        opcode_byte: b0 & 0x0F,
                        masked: b1 & 0x80 != 0,
                        len7: b1 & 0x7F,
                    };
                    self.header = Some(header);
                    self.scratch.clear();
                    self.phase = DecodePhase::ExtendedLength;
                    self.needed = match self.header.as_ref().unwrap().len7 {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    if self.needed == 0 {
                        self.payload_len = self.header.as_ref().unwrap().len7 as u64;
                        self.phase = DecodePhase::MaskKey;
                        self.needed = if self.header.as_ref().unwrap().masked { 4 } else { 0 };
                        if self.needed == 0 {
                            self.enter_payload_phase();
                        }
                    }
                }
                DecodePhase::ExtendedLength => {
                    self.payload_len = match self.scratch.len() {
                        2 => self.scratch.get_u16() as u64,
                        8 => self.scratch.get_u64(),
                        _ => unreachable!(),
                    };
                    self.scratch.clear();
                    self.phase = DecodePhase::MaskKey;
                    self.needed = if self.header.as_ref().unwrap().masked { 4 } else { 0 };
                    if self.needed == 0 {
                        self.enter_payload_phase();
                    }
                }
                DecodePhase::MaskKey => {
                    let mut key = [0u8; 4];
                    key.copy_from_slice(&self.scratch[..4]);
                    self.mask = Some(key);
                    self.scratch.clear();
                    self.enter_payload_phase();
                }
                DecodePhase::Payload => {
                    let mut payload = self.scratch.split_to(self.payload_len as usize).to_vec();
                    if let Some(key) = self.mask {
                        apply_mask(key, &mut payload);
                    }
                    let header = self.header.take().unwrap();
                    let opcode = OpCode::from_u8(header.opcode_byte).map_err(|e| {
                        debug!(opcode_byte = header.opcode_byte, "invalid opcode on wire");
                        DecodeError::Protocol(e)
                    })?;
                    let frame = Frame {
                        fin: header.fin,
                        rsv1: header.rsv1,
                        rsv2: header.rsv2,
                        rsv3: header.rsv3,
                        opcode,
                        mask: self.mask,
                        payload,
                    };
                    self.reset();
                    trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame assembled");
                    return Ok(frame);
                }
            }
        }
    }

    fn enter_payload_phase(&mut self) {
        self.phase = DecodePhase::Payload;
        self.needed = self.payload_len as usize;
    }
}

/// error surfaced by [`FrameDecoder::decode`].
#[derive(Debug)]
pub enum DecodeError {
    Io(io::Error),
    Eof,
    Protocol(ProtocolError),
}

impl From<DecodeError> for crate::error::WsError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Io(e) => crate::error::WsError::Io(e),
            DecodeError::Eof => crate::error::WsError::ConnectionClosed,
            DecodeError::Protocol(e) => crate::error::WsError::Protocol(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::io::Cursor;

    #[quickcheck]
    fn p1_masking_is_involutive(key: (u8, u8, u8, u8), data: Vec<u8>) -> bool {
        let key = [key.0, key.1, key.2, key.3];
        let mut buf = data.clone();
        apply_mask(key, &mut buf);
        apply_mask(key, &mut buf);
        buf == data
    }

    fn valid_opcode(n: u8) -> OpCode {
        match n % 6 {
            0 => OpCode::Continuation,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            3 => OpCode::Close,
            4 => OpCode::Ping,
            _ => OpCode::Pong,
        }
    }

    #[quickcheck]
    fn p2_encode_decode_round_trip(opcode_sel: u8, key: (u8, u8, u8, u8), mut payload: Vec<u8>) -> bool {
        let opcode = valid_opcode(opcode_sel);
        if opcode.is_control() {
            payload.truncate(125);
            // avoid generating an invalid close payload (len 1, or bad code)
            if opcode == OpCode::Close {
                payload.clear();
            }
        }
        let key = [key.0, key.1, key.2, key.3];
        let frame = Frame::new(opcode, payload.clone());
        let encoded = frame.encode(Some(key)).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut cursor = Cursor::new(encoded.to_vec());
        let decoded = decoder.decode(&mut cursor).unwrap();

        decoded.opcode == opcode && decoded.payload == payload && decoded.fin
    }

    #[test]
    fn s3_small_send_with_fixed_mask() {
        let frame = Frame::text(b"Hello".to_vec());
        let encoded = frame.encode(Some(*b"abcd")).unwrap();
        assert_eq!(
            encoded.to_vec(),
            vec![0x81, 0x85, 0x61, 0x62, 0x63, 0x64, 0x29, 0x07, 0x0f, 0x08, 0x0e]
        );
    }

    #[test]
    fn s4_small_recv_utf8_text() {
        let bytes: Vec<u8> = vec![
            0x81, 0x8f, 0x61, 0x62, 0x63, 0x64, 0x82, 0xe3, 0xf0, 0x87, 0xe3, 0xf1, 0x80, 0xe5,
            0xca, 0x81, 0xe2, 0xc5, 0x82, 0xe3, 0xcc,
        ];
        let mut decoder = FrameDecoder::new();
        let mut cursor = Cursor::new(bytes);
        let frame = decoder.decode(&mut cursor).unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(
            String::from_utf8(frame.payload).unwrap(),
            "こんにちは"
        );
    }

    #[test]
    fn control_frame_too_long_is_invalid() {
        let frame = Frame::new(OpCode::Ping, vec![0u8; 126]);
        assert_eq!(
            frame.validate(false),
            Err(ProtocolError::ControlFrameTooLarge(126))
        );
    }

    #[test]
    fn p5_close_code_1005_and_1006_are_rejected_on_wire() {
        assert!(!is_valid_close_code(1005));
        assert!(!is_valid_close_code(1006));
    }

    #[test]
    fn p5_close_payload_length_one_is_rejected() {
        let frame = Frame::new(OpCode::Close, vec![0u8]);
        assert_eq!(frame.validate(false), Err(ProtocolError::InvalidCloseLength));
    }

    #[test]
    fn rsv1_without_compression_is_rejected() {
        let mut frame = Frame::text(b"hi".to_vec());
        frame.rsv1 = true;
        assert_eq!(frame.validate(false), Err(ProtocolError::ReservedBitSet(1)));
        assert!(frame.validate(true).is_ok());
    }

    #[test]
    fn fixed_mask_key_gen_is_constant() {
        let mut gen = FixedMaskKeyGen(*b"abcd");
        assert_eq!(gen.next_key(), *b"abcd");
        assert_eq!(gen.next_key(), *b"abcd");
    }
}
