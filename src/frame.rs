//! WebSocket frames as defined in [RFC 6455 section 5.2].
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! This crate only decodes client frames (always masked) and encodes
//! server frames (never masked), so a decoded [`Frame`] holds its payload
//! already unmasked and the encoder never emits a masking key. RSV1 is
//! tracked as the per-message compression flag; RSV2 and RSV3 are rejected
//! at decode time.
//!
//! [RFC 6455 section 5.2]: https://datatracker.ietf.org/doc/html/rfc6455#section-5.2

use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// Frame type identifier (4-bit opcode).
///
/// Data frames (`Text`, `Binary`, `Continuation`) carry application
/// payload; control frames (`Close`, `Ping`, `Pong`) manage the
/// connection and must be final and at most 125 bytes long. The ranges
/// 0x3-0x7 and 0xB-0xF are reserved and rejected per RFC 6455.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Largest possible server-side frame header: 2 fixed bytes plus an
/// 8-byte extended length. Outbound frames carry no masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 10;

/// A single decoded (or to-be-encoded) WebSocket frame.
///
/// Inbound frames come out of the decoder with the masking key already
/// applied. `is_compressed` mirrors the RSV1 bit of the wire header.
pub struct Frame {
    /// Final fragment flag. Messages end with a frame where this is set.
    pub fin: bool,
    /// The frame type.
    pub opcode: OpCode,
    /// RSV1: set on the first frame of a permessage-deflate message.
    pub(crate) is_compressed: bool,
    /// Unmasked payload bytes.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a final, uncompressed frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: false,
            payload: payload.into(),
        }
    }

    /// Creates a final frame with the RSV1 compression bit set. The
    /// payload must already be deflated.
    pub(crate) fn compressed(opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin: true,
            opcode,
            is_compressed: true,
            payload: payload.into(),
        }
    }

    /// Creates a pong frame answering a ping with the same payload.
    pub(crate) fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Creates a close frame with a status code and reason text.
    ///
    /// [`CloseCode::NoStatus`] yields an empty body — that sentinel
    /// represents "no code received" in the API and never goes on the
    /// wire (RFC 6455 section 7.4.1).
    pub fn close(code: CloseCode, reason: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if code != CloseCode::NoStatus {
            payload.extend_from_slice(&u16::from(code).to_be_bytes());
            payload.extend_from_slice(reason);
        }

        Self::new(true, OpCode::Close, payload)
    }

    /// The status code of a close frame body, if one is present.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// The reason text of a close frame body.
    ///
    /// Returns an error when the reason bytes are not valid UTF-8, which
    /// is itself a protocol violation.
    pub fn close_reason(&self) -> crate::Result<Option<&str>> {
        match self.payload.get(2..) {
            None | Some([]) => Ok(None),
            Some(reason) => std::str::from_utf8(reason)
                .map(Some)
                .map_err(|_| WebSocketError::InvalidUtf8),
        }
    }

    /// Formats the frame header into `head` and returns its size: 2 bytes
    /// for payloads up to 125, 4 for up to 65535, 10 otherwise. Extended
    /// lengths are big-endian and start at offset 2, after the marker
    /// byte.
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.is_compressed as u8) << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        }
    }
}
