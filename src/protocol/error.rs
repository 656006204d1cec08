//! Protocol error types

use std::fmt;

use super::ReasonCode;

/// Broad classes of decode failure; each one closes the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structurally invalid bytes (bad header, bad varint, truncated field)
    Malformed,
    /// Structurally valid but forbidden (reserved bits, QoS 3, ...)
    ProtocolViolation,
    /// Declared size above the negotiated maximum
    PacketTooLarge,
}

/// Errors raised while turning bytes into packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A field ran past the end of the frame body
    Truncated,
    /// Fifth continuation byte in a variable byte integer
    InvalidVarint,
    /// Packet type nibble 0
    InvalidPacketType(u8),
    /// Flags nibble does not match the packet type
    InvalidFlags,
    /// Protocol name other than "MQTT"/"MQIsdp"
    InvalidProtocolName,
    /// Protocol level is valid but belongs to the other generation
    VersionMismatch(u8),
    /// Protocol level unknown to either generation
    UnsupportedProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    DuplicateProperty(u8),
    InvalidReasonCode(u8),
    InvalidSubscriptionOptions,
    /// Frame larger than allowed
    PacketTooLarge { size: usize, max: usize },
    /// Structurally invalid content
    Malformed(&'static str),
    /// Semantically forbidden content
    Violation(&'static str),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Truncated
            | Self::InvalidVarint
            | Self::InvalidUtf8
            | Self::InvalidPropertyId(_)
            | Self::VersionMismatch(_)
            | Self::Malformed(_) => ErrorKind::Malformed,
            Self::PacketTooLarge { .. } => ErrorKind::PacketTooLarge,
            _ => ErrorKind::ProtocolViolation,
        }
    }

    /// Whether retrying the frame as the older generation could succeed.
    ///
    /// Only structural failures qualify; a semantically invalid value is
    /// invalid under either generation.
    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Malformed
    }

    /// Reason code reported to the peer before the connection is closed
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::UnsupportedProtocolVersion(_) | Self::InvalidProtocolName => {
                ReasonCode::UnsupportedProtocolVersion
            }
            _ => match self.kind() {
                ErrorKind::Malformed => ReasonCode::MalformedPacket,
                ErrorKind::ProtocolViolation => ReasonCode::ProtocolError,
                ErrorKind::PacketTooLarge => ReasonCode::PacketTooLarge,
            },
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "field truncated"),
            Self::InvalidVarint => write!(f, "malformed variable byte integer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type {}", t),
            Self::InvalidFlags => write!(f, "invalid fixed header flags"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::VersionMismatch(level) => {
                write!(f, "protocol level {} belongs to the other generation", level)
            }
            Self::UnsupportedProtocolVersion(level) => {
                write!(f, "unsupported protocol level {}", level)
            }
            Self::InvalidQoS(q) => write!(f, "invalid QoS {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property id 0x{:02x}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property 0x{:02x}", id),
            Self::InvalidReasonCode(rc) => write!(f, "invalid reason code 0x{:02x}", rc),
            Self::InvalidSubscriptionOptions => write!(f, "invalid subscription options"),
            Self::PacketTooLarge { size, max } => {
                write!(f, "packet of {} bytes exceeds maximum {}", size, max)
            }
            Self::Malformed(msg) => write!(f, "malformed packet: {}", msg),
            Self::Violation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while serialising packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length above 268,435,455
    PacketTooLarge,
    /// String or binary field above 65,535 bytes
    FieldTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large to encode"),
            Self::FieldTooLong => write!(f, "field exceeds 65535 bytes"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Failures while interpreting a well-formed packet against session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// Forbidden packet sequence or content
    Violation(&'static str),
    /// Request exceeds a negotiated capability (QoS, retain, ...)
    Unsupported(ReasonCode),
    /// Peer exceeded our receive maximum or packet id space
    QuotaExceeded,
}

impl ProtocolError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Decode(e) => e.reason_code(),
            Self::Encode(_) => ReasonCode::ImplementationError,
            Self::Violation(_) => ReasonCode::ProtocolError,
            Self::Unsupported(rc) => *rc,
            Self::QuotaExceeded => ReasonCode::ReceiveMaxExceeded,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Violation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Unsupported(rc) => write!(f, "unsupported request: {}", rc),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_allow_generation_retry() {
        assert!(DecodeError::Truncated.is_structural());
        assert!(DecodeError::VersionMismatch(4).is_structural());
        assert!(!DecodeError::InvalidQoS(3).is_structural());
        assert!(!DecodeError::UnsupportedProtocolVersion(9).is_structural());
    }

    #[test]
    fn reason_codes_follow_kind() {
        assert_eq!(
            DecodeError::InvalidVarint.reason_code(),
            ReasonCode::MalformedPacket
        );
        assert_eq!(
            DecodeError::InvalidFlags.reason_code(),
            ReasonCode::ProtocolError
        );
        assert_eq!(
            DecodeError::PacketTooLarge { size: 10, max: 5 }.reason_code(),
            ReasonCode::PacketTooLarge
        );
    }
}
