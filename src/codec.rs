//! Incremental WebSocket frame decoding and outbound frame encoding.
//!
//! The [`Decoder`] is a pure state machine: it is fed successive chunks of socket
//! input, of any size and with no relation to frame boundaries, and yields at most
//! one decoded frame per [`Decoder::feed`] call. It performs no I/O; the
//! [`InputStream`](crate::stream::InputStream) drives it over a socket.
//!
//! The [`Encoder`] plugs into [`tokio_util::codec::FramedWrite`] and serializes
//! server frames: always final, never masked.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, FrameHeader, OpCode, LENGTH_16, LENGTH_64, MAX_HEAD_SIZE},
    mask, ProtocolError, WebSocketError,
};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames announcing a larger payload are rejected before anything is allocated for them.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Which part of a frame the decoder is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Awaiting the first 2 header bytes.
    FlagsAndPayloadData,
    /// Awaiting the extended length and the 4-byte masking key.
    PayloadLengthAndMask,
    /// Awaiting `payload_length` bytes of masked body.
    Payload,
}

/// Connection-level outcome of decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Clean EOF between frames.
    Closed,
    /// Protocol violation, including a frame truncated by EOF.
    Error,
}

/// What the caller should do after a [`Decoder::feed`] call.
#[derive(Debug)]
pub enum Consumption {
    /// The whole chunk was consumed; feed the next one.
    Continue,
    /// Stop feeding. Either a frame was decoded or the decoder reached a terminal
    /// state. Holds the unconsumed rest of the chunk, which must be fed first on
    /// the next call.
    Stop(BytesMut),
}

/// Incremental decoder for client-to-server frames.
pub struct Decoder {
    state: ParseState,
    cstate: ConnectionState,
    header: Option<FrameHeader>,
    /// Partial header bytes carried across chunks (at most 2 + 8 + 4).
    buffer: BytesMut,
    payload_length: usize,
    masking_key: [u8; 4],
    /// Payload bytes already copied into `result`.
    consumed: usize,
    result: BytesMut,
    max_payload_read: usize,
    violation: Option<ProtocolError>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_READ)
    }
}

impl Decoder {
    /// Creates a new `Decoder` rejecting payloads larger than `max_payload_read` bytes.
    pub fn new(max_payload_read: usize) -> Self {
        Self {
            state: ParseState::FlagsAndPayloadData,
            cstate: ConnectionState::Connected,
            header: None,
            buffer: BytesMut::with_capacity(14),
            payload_length: 0,
            masking_key: [0; 4],
            consumed: 0,
            result: BytesMut::new(),
            max_payload_read,
            violation: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.cstate
    }

    /// Returns `true` while no terminal state has been reached.
    pub fn is_valid(&self) -> bool {
        self.cstate == ConnectionState::Connected
    }

    /// Returns `true` after a clean EOF.
    pub fn eof(&self) -> bool {
        self.cstate == ConnectionState::Closed
    }

    /// The reason the decoder entered [`ConnectionState::Error`], if it did.
    pub fn violation(&self) -> Option<ProtocolError> {
        self.violation
    }

    /// Opcode of the last parsed header, `None` before any header was parsed.
    pub fn opcode(&self) -> Option<OpCode> {
        self.header.and_then(|header| header.opcode())
    }

    /// Takes the payload of the last decoded frame, leaving an empty one behind.
    pub fn take_result(&mut self) -> BytesMut {
        std::mem::take(&mut self.result)
    }

    fn fail(&mut self, violation: ProtocolError) {
        self.cstate = ConnectionState::Error;
        self.violation = Some(violation);
    }

    /// Feeds the next chunk of input. An empty chunk signals EOF.
    pub fn feed(&mut self, mut data: BytesMut) -> Consumption {
        if self.cstate != ConnectionState::Connected {
            return Consumption::Stop(data);
        }

        if data.is_empty() {
            if self.state == ParseState::FlagsAndPayloadData && self.buffer.is_empty() {
                self.cstate = ConnectionState::Closed;
            } else {
                self.fail(ProtocolError::TruncatedFrame);
            }
            return Consumption::Stop(data);
        }

        if self.state == ParseState::FlagsAndPayloadData {
            let needed = 2 - self.buffer.len();
            if data.len() < needed {
                self.buffer.extend_from_slice(&data);
                return Consumption::Continue;
            }

            self.buffer.extend_from_slice(&data[..needed]);
            data.advance(needed);
            let header = FrameHeader::parse([self.buffer[0], self.buffer[1]]);
            self.buffer.clear();
            self.header = Some(header);

            if let Err(violation) = header.validate() {
                self.fail(violation);
                return Consumption::Stop(data);
            }
            self.state = ParseState::PayloadLengthAndMask;
        }

        if self.state == ParseState::PayloadLengthAndMask {
            let Some(header) = self.header else {
                unreachable!("header is parsed before the length and mask");
            };

            let required = header.rest_of_header_length();
            if self.buffer.len() + data.len() < required {
                self.buffer.extend_from_slice(&data);
                return Consumption::Continue;
            }

            let take = required - self.buffer.len();
            self.buffer.extend_from_slice(&data[..take]);
            data.advance(take);

            let mut input = &self.buffer[..];
            let length = match header.length {
                LENGTH_16 => u64::from(input.get_u16()),
                LENGTH_64 => input.get_u64(),
                n => u64::from(n),
            };
            self.masking_key = input.get_u32().to_be_bytes();
            self.buffer.clear();

            match usize::try_from(length) {
                Ok(length) if length <= self.max_payload_read => self.payload_length = length,
                _ => {
                    self.fail(ProtocolError::FrameTooLarge);
                    return Consumption::Stop(data);
                }
            }

            self.consumed = 0;
            self.state = ParseState::Payload;
        }

        let remaining = self.payload_length - self.consumed;
        if data.len() < remaining {
            // not enough for the whole frame: keep what we have, unmasked
            if self.consumed == 0 {
                self.result = BytesMut::with_capacity(self.payload_length);
            }
            let start = self.result.len();
            self.result.extend_from_slice(&data);
            mask::apply_mask_at(&mut self.result[start..], self.masking_key, self.consumed);
            self.consumed += data.len();
            return Consumption::Continue;
        }

        if self.consumed == 0 {
            // the chunk holds the whole payload: hand it over without copying
            let mut payload = if data.len() == remaining {
                std::mem::take(&mut data)
            } else {
                data.split_to(remaining)
            };
            mask::apply_mask(&mut payload, self.masking_key);
            self.result = payload;
        } else {
            let start = self.result.len();
            self.result.extend_from_slice(&data[..remaining]);
            data.advance(remaining);
            mask::apply_mask_at(&mut self.result[start..], self.masking_key, self.consumed);
        }

        self.consumed = 0;
        self.state = ParseState::FlagsAndPayloadData;
        Consumption::Stop(data)
    }
}

/// WebSocket frame encoder for server-to-client frames.
///
/// Writes `0x80 | opcode`, the tiered length and the raw payload. Server frames
/// are never masked, so no masking key is emitted.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
