//! # Frame
//!
//! Base framing of [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! seen from the server side of a connection.
//!
//! On the wire a frame starts with two fixed bytes:
//!
//! - byte 0: `FIN` (bit 7), `RSV1..RSV3` (bits 6 to 4) and the opcode (low nibble)
//! - byte 1: `MASK` (bit 7) and a 7-bit length
//!
//! A 7-bit length of 126 is followed by a big-endian `u16` holding the real length,
//! 127 by a big-endian `u64`. Masked frames then carry a 4-byte key, and the payload
//! comes last.
//!
//! Client frames must be masked and are described by a [`FrameHeader`] while they
//! are decoded. Server frames are [`Frame`]s: always final, never masked, no RSV bits.
use bytes::Bytes;

use crate::ProtocolError;

/// Frame type carried in the low nibble of the first header byte.
///
/// The server neither reassembles fragments nor checks text for UTF-8, so the
/// payload of every data opcode reaches the handler unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Decodes a 4-bit opcode. Reserved values (0x3-0x7, 0xB-0xF) give `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        };
        Some(opcode)
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// `Close`, `Ping` and `Pong` are control frames, handled by the connection itself.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }

    /// Data frames are forwarded to the handler.
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// Value of the 7-bit length field announcing a 16-bit extended length.
pub(crate) const LENGTH_16: u8 = 126;
/// Value of the 7-bit length field announcing a 64-bit extended length.
pub(crate) const LENGTH_64: u8 = 127;
/// Size of the masking key that follows the (extended) length of inbound frames.
pub(crate) const MASK_SIZE: usize = 4;

/// The first two bytes of a frame, as received from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag. Parsed but otherwise unused by the server.
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    /// Raw 4-bit opcode, which may not be a known [`OpCode`].
    pub opcode: u8,
    /// Whether the payload is masked. Always required for frames read by a server.
    pub masked: bool,
    /// The 7-bit length field: a literal length (0-125) or [`LENGTH_16`] / [`LENGTH_64`].
    pub length: u8,
}

impl FrameHeader {
    /// Parses the fixed part of a frame header.
    pub fn parse(head: [u8; 2]) -> Self {
        Self {
            fin: head[0] & 0b1000_0000 != 0,
            rsv1: head[0] & 0b0100_0000 != 0,
            rsv2: head[0] & 0b0010_0000 != 0,
            rsv3: head[0] & 0b0001_0000 != 0,
            opcode: head[0] & 0b0000_1111,
            masked: head[1] & 0b1000_0000 != 0,
            length: head[1] & 0x7F,
        }
    }

    /// Returns the decoded opcode, or `None` if the opcode is reserved.
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode)
    }

    /// Checks the header against the rules a server must enforce
    /// ([RFC 6455 Section 5.1](https://datatracker.ietf.org/doc/html/rfc6455#section-5.1)).
    pub fn validate(&self) -> Result<OpCode, ProtocolError> {
        if !self.masked {
            return Err(ProtocolError::Unmasked);
        }
        if self.rsv1 || self.rsv2 || self.rsv3 {
            return Err(ProtocolError::ReservedBitsNotZero);
        }
        self.opcode()
            .ok_or(ProtocolError::InvalidOpCode(self.opcode))
    }

    /// Number of bytes that follow the first two: the extended length plus the masking key.
    pub fn rest_of_header_length(&self) -> usize {
        let extended = match self.length {
            LENGTH_16 => 2,
            LENGTH_64 => 8,
            _ => 0,
        };
        extended + MASK_SIZE
    }
}

/// Maximum size of an outbound frame header: 2 bytes plus a 64-bit extended length.
pub(crate) const MAX_HEAD_SIZE: usize = 10;

/// An outbound WebSocket frame.
///
/// Frames written by the server are always final and unmasked, so the only
/// meaningful fields are the opcode and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a binary frame, the type used for all handler output.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    /// Creates a close frame with an empty payload.
    pub fn close() -> Self {
        Self::new(OpCode::Close, Bytes::new())
    }

    /// Creates a pong frame echoing `payload`.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Writes the header into `head` and returns how many bytes it takes.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = 0x80 | self.opcode.as_u8();

        match self.payload.len() {
            len @ 0..=125 => {
                head[1] = len as u8;
                2
            }
            len @ 126..=0xFFFF => {
                head[1] = LENGTH_16;
                head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
                4
            }
            len => {
                head[1] = LENGTH_64;
                head[2..MAX_HEAD_SIZE].copy_from_slice(&(len as u64).to_be_bytes());
                MAX_HEAD_SIZE
            }
        }
    }
}
