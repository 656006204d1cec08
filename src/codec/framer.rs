//! Streaming packet framer
//!
//! Bytes arrive in arbitrary chunks. The framer keeps everything not yet
//! consumed and only advances once a whole frame is present, so a partial
//! frame is simply retried on the next chunk.
//!
//! Until a generation is pinned each frame is decoded as v5 first and, on a
//! structural failure only, once more as v3.1.1. The first success pins the
//! generation for the rest of the connection.

use std::fmt;

use bytes::{Buf, BytesMut};
use tracing::trace;

use super::{decode_packet, read_variable_int, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::protocol::{DecodeError, ErrorKind, Packet, ProtocolVersion, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A frame could not be decoded under any permitted generation
    Decode(DecodeError),
    /// The framer already failed and refuses further input
    Poisoned,
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::Decode(e) => e.kind(),
            FrameError::Poisoned => ErrorKind::ProtocolViolation,
        }
    }

    pub fn reason_code(&self) -> ReasonCode {
        match self {
            FrameError::Decode(e) => e.reason_code(),
            FrameError::Poisoned => ReasonCode::ProtocolError,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Decode(e) => write!(f, "{}", e),
            FrameError::Poisoned => write!(f, "framer poisoned by an earlier error"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<DecodeError> for FrameError {
    fn from(e: DecodeError) -> Self {
        FrameError::Decode(e)
    }
}

#[derive(Debug)]
pub struct PacketFramer {
    buf: BytesMut,
    max_packet_size: usize,
    version: Option<ProtocolVersion>,
    poisoned: bool,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketFramer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH + 5),
            version: None,
            poisoned: false,
        }
    }

    /// Generation pinned so far, if any
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn pin(&mut self, version: ProtocolVersion) {
        self.version = Some(version);
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and return every frame they complete
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Packet>, FrameError> {
        self.push(data);
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Append bytes without decoding; pair with [`Self::next_packet`]
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, or `None` if more bytes are needed
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        match self.try_frame() {
            Ok(packet) => Ok(packet),
            Err(e) => {
                self.poisoned = true;
                Err(FrameError::Decode(e))
            }
        }
    }

    fn try_frame(&mut self) -> Result<Option<Packet>, DecodeError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let (remaining, len_bytes) = match read_variable_int(&self.buf[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };

        let frame_len = 1 + len_bytes + remaining as usize;
        if frame_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge {
                size: frame_len,
                max: self.max_packet_size,
            });
        }
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let header = self.buf[0];
        self.buf.advance(1 + len_bytes);
        let body = self.buf.split_to(remaining as usize);

        let packet = match self.version {
            Some(version) => decode_packet(header, &body, version)?,
            None => self.decode_unpinned(header, &body)?,
        };
        Ok(Some(packet))
    }

    fn decode_unpinned(&mut self, header: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let first = match decode_packet(header, body, ProtocolVersion::V5) {
            Ok(packet) => {
                self.version = Some(ProtocolVersion::V5);
                return Ok(packet);
            }
            Err(e) if e.is_structural() => e,
            Err(e) => return Err(e),
        };

        trace!(error = %first, "frame not valid as v5, retrying as v3.1.1");
        match decode_packet(header, body, ProtocolVersion::V311) {
            Ok(packet) => {
                self.version = Some(ProtocolVersion::V311);
                Ok(packet)
            }
            // A level mismatch on the retry means the v5 failure was the real one
            Err(second) => Err(match first {
                DecodeError::VersionMismatch(_) => second,
                _ => first,
            }),
        }
    }
}
