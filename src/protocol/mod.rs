//! Wire-level protocol types
//!
//! One in-memory representation serves both protocol generations: v5-only
//! fields live in [`Properties`] or carry defaults, and the generation is a
//! runtime flag threaded through the codec.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError, ErrorKind, ProtocolError};
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Protocol generation, identified by the CONNECT protocol level byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// v3.1.1 (level 4; level 3 "MQIsdp" is accepted as the same generation)
    V311 = 4,
    /// v5.0 (level 5)
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            3 | 4 => Some(Self::V311),
            5 => Some(Self::V5),
            _ => None,
        }
    }

    #[inline]
    pub fn is_v5(self) -> bool {
        self == Self::V5
    }
}

/// Delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// When retained messages are replayed for a new subscription (v5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAlways = 0,
    SendIfNew = 1,
    Never = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::SendAlways),
            1 => Some(Self::SendIfNew),
            2 => Some(Self::Never),
            _ => None,
        }
    }
}

/// Per-filter options byte of a SUBSCRIBE payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    /// Parse the v5 options byte. Bits 6-7 are reserved and must be zero.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0b1100_0000 != 0 {
            return None;
        }
        Some(Self {
            qos: QoS::from_u8(byte & 0b11)?,
            no_local: byte & 0b0100 != 0,
            retain_as_published: byte & 0b1000 != 0,
            retain_handling: RetainHandling::from_u8((byte >> 4) & 0b11)?,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.qos as u8;
        if self.no_local {
            byte |= 0b0100;
        }
        if self.retain_as_published {
            byte |= 0b1000;
        }
        byte | ((self.retain_handling as u8) << 4)
    }
}

/// Control packet type (high nibble of the fixed header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PacketType::*;
        const TABLE: [PacketType; 15] = [
            Connect,
            ConnAck,
            Publish,
            PubAck,
            PubRec,
            PubRel,
            PubComp,
            Subscribe,
            SubAck,
            Unsubscribe,
            UnsubAck,
            PingReq,
            PingResp,
            Disconnect,
            Auth,
        ];
        match v {
            1..=15 => Some(TABLE[v as usize - 1]),
            _ => None,
        }
    }

    /// Flags nibble mandated for every type except PUBLISH
    pub fn fixed_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_options_reject_reserved_bits() {
        assert!(SubscriptionOptions::from_byte(0x40).is_none());
        assert!(SubscriptionOptions::from_byte(0x03).is_none());
        assert!(SubscriptionOptions::from_byte(0x30).is_none());
    }

    #[test]
    fn subscription_options_byte_layout() {
        let opts = SubscriptionOptions {
            qos: QoS::ExactlyOnce,
            no_local: true,
            retain_as_published: false,
            retain_handling: RetainHandling::SendIfNew,
        };
        assert_eq!(opts.to_byte(), 0b0001_0110);
        assert_eq!(SubscriptionOptions::from_byte(0b0001_0110), Some(opts));
    }

    #[test]
    fn packet_type_flags() {
        assert_eq!(PacketType::from_u8(6), Some(PacketType::PubRel));
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::PubRel.fixed_flags(), Some(0x02));
        assert_eq!(PacketType::Publish.fixed_flags(), None);
        assert_eq!(PacketType::PingReq.fixed_flags(), Some(0x00));
    }

    #[test]
    fn protocol_levels() {
        assert_eq!(ProtocolVersion::from_level(3), Some(ProtocolVersion::V311));
        assert_eq!(ProtocolVersion::from_level(4), Some(ProtocolVersion::V311));
        assert_eq!(ProtocolVersion::from_level(5), Some(ProtocolVersion::V5));
        assert_eq!(ProtocolVersion::from_level(6), None);
    }
}
