//! Reason codes shared by CONNACK, acknowledgements and DISCONNECT

use std::fmt;

macro_rules! reason_codes {
    ($($(#[$meta:meta])* $name:ident = $value:literal => $text:literal,)*) => {
        /// One-byte outcome carried by acknowledgements (v5) and CONNACK
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($(#[$meta])* $name = $value,)*
        }

        impl ReasonCode {
            pub fn from_u8(v: u8) -> Option<Self> {
                match v {
                    $($value => Some(ReasonCode::$name),)*
                    _ => None,
                }
            }

            fn text(self) -> &'static str {
                match self {
                    $(ReasonCode::$name => $text,)*
                }
            }
        }
    };
}

reason_codes! {
    /// Also "normal disconnection" and "granted QoS 0"
    Success = 0x00 => "success",
    GrantedQoS1 = 0x01 => "granted QoS 1",
    GrantedQoS2 = 0x02 => "granted QoS 2",
    DisconnectWithWill = 0x04 => "disconnect with will message",
    NoMatchingSubscribers = 0x10 => "no matching subscribers",
    NoSubscriptionExisted = 0x11 => "no subscription existed",
    ContinueAuthentication = 0x18 => "continue authentication",
    ReAuthenticate = 0x19 => "re-authenticate",
    UnspecifiedError = 0x80 => "unspecified error",
    MalformedPacket = 0x81 => "malformed packet",
    ProtocolError = 0x82 => "protocol error",
    ImplementationError = 0x83 => "implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "unsupported protocol version",
    ClientIdNotValid = 0x85 => "client identifier not valid",
    BadUserNameOrPassword = 0x86 => "bad user name or password",
    NotAuthorized = 0x87 => "not authorized",
    ServerUnavailable = 0x88 => "server unavailable",
    ServerBusy = 0x89 => "server busy",
    Banned = 0x8A => "banned",
    ServerShuttingDown = 0x8B => "server shutting down",
    BadAuthenticationMethod = 0x8C => "bad authentication method",
    KeepAliveTimeout = 0x8D => "keep alive timeout",
    SessionTakenOver = 0x8E => "session taken over",
    TopicFilterInvalid = 0x8F => "topic filter invalid",
    TopicNameInvalid = 0x90 => "topic name invalid",
    PacketIdInUse = 0x91 => "packet identifier in use",
    PacketIdNotFound = 0x92 => "packet identifier not found",
    ReceiveMaxExceeded = 0x93 => "receive maximum exceeded",
    TopicAliasInvalid = 0x94 => "topic alias invalid",
    PacketTooLarge = 0x95 => "packet too large",
    MessageRateTooHigh = 0x96 => "message rate too high",
    QuotaExceeded = 0x97 => "quota exceeded",
    AdministrativeAction = 0x98 => "administrative action",
    PayloadFormatInvalid = 0x99 => "payload format invalid",
    RetainNotSupported = 0x9A => "retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    UseAnotherServer = 0x9C => "use another server",
    ServerMoved = 0x9D => "server moved",
    SharedSubsNotSupported = 0x9E => "shared subscriptions not supported",
    ConnectionRateExceeded = 0x9F => "connection rate exceeded",
    MaximumConnectTime = 0xA0 => "maximum connect time",
    SubIdNotSupported = 0xA1 => "subscription identifiers not supported",
    WildcardSubsNotSupported = 0xA2 => "wildcard subscriptions not supported",
}

impl ReasonCode {
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !self.is_success()
    }

    /// Granted-QoS code for a successful subscription
    pub fn granted(qos: super::QoS) -> Self {
        match qos {
            super::QoS::AtMostOnce => ReasonCode::Success,
            super::QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            super::QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// v3.1.1 CONNACK return code. Codes without a v3.1.1 equivalent map to
    /// "not authorized" (5), except server-side failures which map to 3.
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0,
            ReasonCode::UnsupportedProtocolVersion => 1,
            ReasonCode::ClientIdNotValid => 2,
            ReasonCode::ServerUnavailable
            | ReasonCode::ServerBusy
            | ReasonCode::ServerShuttingDown => 3,
            ReasonCode::BadUserNameOrPassword => 4,
            _ => 5,
        }
    }

    pub fn from_v3_connack_code(code: u8) -> Self {
        match code {
            0 => ReasonCode::Success,
            1 => ReasonCode::UnsupportedProtocolVersion,
            2 => ReasonCode::ClientIdNotValid,
            3 => ReasonCode::ServerUnavailable,
            4 => ReasonCode::BadUserNameOrPassword,
            5 => ReasonCode::NotAuthorized,
            _ => ReasonCode::UnspecifiedError,
        }
    }

    /// v3.1.1 SUBACK only knows granted QoS and a single failure value
    pub fn to_v3_suback_code(self) -> u8 {
        match self {
            ReasonCode::Success | ReasonCode::GrantedQoS1 | ReasonCode::GrantedQoS2 => self as u8,
            _ => 0x80,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.text(), *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_values_round_trip() {
        for byte in 0u8..=0xFF {
            if let Some(rc) = ReasonCode::from_u8(byte) {
                assert_eq!(rc as u8, byte);
            }
        }
        assert_eq!(ReasonCode::from_u8(0x03), None);
    }

    #[test]
    fn v3_codes() {
        assert_eq!(ReasonCode::BadUserNameOrPassword.to_v3_connack_code(), 4);
        assert_eq!(ReasonCode::ServerBusy.to_v3_connack_code(), 3);
        assert_eq!(ReasonCode::Banned.to_v3_connack_code(), 5);
        assert_eq!(ReasonCode::NotAuthorized.to_v3_suback_code(), 0x80);
        assert_eq!(ReasonCode::GrantedQoS2.to_v3_suback_code(), 2);
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(
            ReasonCode::SessionTakenOver.to_string(),
            "session taken over (0x8e)"
        );
    }
}
