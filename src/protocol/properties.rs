//! v5 property block
//!
//! Every v5 packet carries a length-prefixed list of `(id, value)` pairs.
//! Only the subscription identifier and user properties may repeat.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{write_binary, write_string, write_variable_int, Reader};
use crate::protocol::{DecodeError, EncodeError};

mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    /// Seconds
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// One per PUBLISH matching subscription; at most one in SUBSCRIBE
    pub subscription_identifiers: Vec<u32>,
    /// Seconds; 0xFFFFFFFF means never
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    /// Seconds
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

macro_rules! set_once {
    ($slot:expr, $id:expr, $value:expr) => {{
        if $slot.is_some() {
            return Err(DecodeError::DuplicateProperty($id));
        }
        $slot = Some($value);
    }};
}

/// Boolean-valued properties only accept 0 or 1
fn flag(r: &mut Reader<'_>) -> Result<u8, DecodeError> {
    match r.u8()? {
        v @ (0 | 1) => Ok(v),
        _ => Err(DecodeError::Violation("property flag must be 0 or 1")),
    }
}

fn non_zero_u16(r: &mut Reader<'_>, what: &'static str) -> Result<u16, DecodeError> {
    match r.u16()? {
        0 => Err(DecodeError::Violation(what)),
        v => Ok(v),
    }
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Decode a length-prefixed property block
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = r.varint()? as usize;
        let mut r = r.take(len)?;
        let mut p = Properties::new();

        while !r.is_empty() {
            let raw = r.varint()?;
            let pid = u8::try_from(raw).map_err(|_| DecodeError::InvalidPropertyId(0xFF))?;
            match pid {
                id::PAYLOAD_FORMAT_INDICATOR => {
                    set_once!(p.payload_format_indicator, pid, flag(&mut r)?)
                }
                id::MESSAGE_EXPIRY_INTERVAL => set_once!(p.message_expiry_interval, pid, r.u32()?),
                id::CONTENT_TYPE => set_once!(p.content_type, pid, r.string()?.to_owned()),
                id::RESPONSE_TOPIC => set_once!(p.response_topic, pid, r.string()?.to_owned()),
                id::CORRELATION_DATA => {
                    set_once!(p.correlation_data, pid, Bytes::copy_from_slice(r.binary()?))
                }
                id::SUBSCRIPTION_IDENTIFIER => match r.varint()? {
                    0 => return Err(DecodeError::Violation("subscription identifier of 0")),
                    v => p.subscription_identifiers.push(v),
                },
                id::SESSION_EXPIRY_INTERVAL => set_once!(p.session_expiry_interval, pid, r.u32()?),
                id::ASSIGNED_CLIENT_IDENTIFIER => {
                    set_once!(p.assigned_client_identifier, pid, r.string()?.to_owned())
                }
                id::SERVER_KEEP_ALIVE => set_once!(p.server_keep_alive, pid, r.u16()?),
                id::AUTHENTICATION_METHOD => {
                    set_once!(p.authentication_method, pid, r.string()?.to_owned())
                }
                id::AUTHENTICATION_DATA => {
                    set_once!(p.authentication_data, pid, Bytes::copy_from_slice(r.binary()?))
                }
                id::REQUEST_PROBLEM_INFORMATION => {
                    set_once!(p.request_problem_information, pid, flag(&mut r)?)
                }
                id::WILL_DELAY_INTERVAL => set_once!(p.will_delay_interval, pid, r.u32()?),
                id::REQUEST_RESPONSE_INFORMATION => {
                    set_once!(p.request_response_information, pid, flag(&mut r)?)
                }
                id::RESPONSE_INFORMATION => {
                    set_once!(p.response_information, pid, r.string()?.to_owned())
                }
                id::SERVER_REFERENCE => set_once!(p.server_reference, pid, r.string()?.to_owned()),
                id::REASON_STRING => set_once!(p.reason_string, pid, r.string()?.to_owned()),
                id::RECEIVE_MAXIMUM => set_once!(
                    p.receive_maximum,
                    pid,
                    non_zero_u16(&mut r, "receive maximum of 0")?
                ),
                id::TOPIC_ALIAS_MAXIMUM => set_once!(p.topic_alias_maximum, pid, r.u16()?),
                id::TOPIC_ALIAS => set_once!(
                    p.topic_alias,
                    pid,
                    non_zero_u16(&mut r, "topic alias of 0")?
                ),
                id::MAXIMUM_QOS => set_once!(p.maximum_qos, pid, flag(&mut r)?),
                id::RETAIN_AVAILABLE => set_once!(p.retain_available, pid, flag(&mut r)?),
                id::USER_PROPERTY => {
                    let key = r.string()?.to_owned();
                    let value = r.string()?.to_owned();
                    p.user_properties.push((key, value));
                }
                id::MAXIMUM_PACKET_SIZE => match r.u32()? {
                    0 => return Err(DecodeError::Violation("maximum packet size of 0")),
                    v => set_once!(p.maximum_packet_size, pid, v),
                },
                id::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                    set_once!(p.wildcard_subscription_available, pid, flag(&mut r)?)
                }
                id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                    set_once!(p.subscription_identifier_available, pid, flag(&mut r)?)
                }
                id::SHARED_SUBSCRIPTION_AVAILABLE => {
                    set_once!(p.shared_subscription_available, pid, flag(&mut r)?)
                }
                other => return Err(DecodeError::InvalidPropertyId(other)),
            }
        }

        Ok(p)
    }

    /// Encode as a length-prefixed property block
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn encode_body(&self, b: &mut BytesMut) -> Result<(), EncodeError> {
        fn byte(b: &mut BytesMut, pid: u8, v: Option<u8>) {
            if let Some(v) = v {
                b.put_u8(pid);
                b.put_u8(v);
            }
        }
        fn two(b: &mut BytesMut, pid: u8, v: Option<u16>) {
            if let Some(v) = v {
                b.put_u8(pid);
                b.put_u16(v);
            }
        }
        fn four(b: &mut BytesMut, pid: u8, v: Option<u32>) {
            if let Some(v) = v {
                b.put_u8(pid);
                b.put_u32(v);
            }
        }
        fn text(b: &mut BytesMut, pid: u8, v: &Option<String>) -> Result<(), EncodeError> {
            if let Some(v) = v {
                b.put_u8(pid);
                write_string(b, v)?;
            }
            Ok(())
        }
        fn data(b: &mut BytesMut, pid: u8, v: &Option<Bytes>) -> Result<(), EncodeError> {
            if let Some(v) = v {
                b.put_u8(pid);
                write_binary(b, v)?;
            }
            Ok(())
        }

        byte(b, id::PAYLOAD_FORMAT_INDICATOR, self.payload_format_indicator);
        four(b, id::MESSAGE_EXPIRY_INTERVAL, self.message_expiry_interval);
        text(b, id::CONTENT_TYPE, &self.content_type)?;
        text(b, id::RESPONSE_TOPIC, &self.response_topic)?;
        data(b, id::CORRELATION_DATA, &self.correlation_data)?;
        for sid in &self.subscription_identifiers {
            b.put_u8(id::SUBSCRIPTION_IDENTIFIER);
            write_variable_int(b, *sid)?;
        }
        four(b, id::SESSION_EXPIRY_INTERVAL, self.session_expiry_interval);
        text(b, id::ASSIGNED_CLIENT_IDENTIFIER, &self.assigned_client_identifier)?;
        two(b, id::SERVER_KEEP_ALIVE, self.server_keep_alive);
        text(b, id::AUTHENTICATION_METHOD, &self.authentication_method)?;
        data(b, id::AUTHENTICATION_DATA, &self.authentication_data)?;
        byte(b, id::REQUEST_PROBLEM_INFORMATION, self.request_problem_information);
        four(b, id::WILL_DELAY_INTERVAL, self.will_delay_interval);
        byte(b, id::REQUEST_RESPONSE_INFORMATION, self.request_response_information);
        text(b, id::RESPONSE_INFORMATION, &self.response_information)?;
        text(b, id::SERVER_REFERENCE, &self.server_reference)?;
        text(b, id::REASON_STRING, &self.reason_string)?;
        two(b, id::RECEIVE_MAXIMUM, self.receive_maximum);
        two(b, id::TOPIC_ALIAS_MAXIMUM, self.topic_alias_maximum);
        two(b, id::TOPIC_ALIAS, self.topic_alias);
        byte(b, id::MAXIMUM_QOS, self.maximum_qos);
        byte(b, id::RETAIN_AVAILABLE, self.retain_available);
        for (k, v) in &self.user_properties {
            b.put_u8(id::USER_PROPERTY);
            write_string(b, k)?;
            write_string(b, v)?;
        }
        four(b, id::MAXIMUM_PACKET_SIZE, self.maximum_packet_size);
        byte(
            b,
            id::WILDCARD_SUBSCRIPTION_AVAILABLE,
            self.wildcard_subscription_available,
        );
        byte(
            b,
            id::SUBSCRIPTION_IDENTIFIER_AVAILABLE,
            self.subscription_identifier_available,
        );
        byte(
            b,
            id::SHARED_SUBSCRIPTION_AVAILABLE,
            self.shared_subscription_available,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode(bytes: &[u8]) -> Result<Properties, DecodeError> {
        Properties::decode(&mut Reader::new(bytes))
    }

    #[test]
    fn empty_block() {
        assert_eq!(decode(&[0x00]).unwrap(), Properties::default());
    }

    #[test]
    fn encode_then_decode_keeps_repeated_entries() {
        let props = Properties {
            message_expiry_interval: Some(30),
            subscription_identifiers: vec![1, 300],
            user_properties: vec![("a".into(), "1".into()), ("a".into(), "2".into())],
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(decode(&buf).unwrap(), props);
    }

    #[test]
    fn duplicate_single_valued_property_rejected() {
        // two receive-maximum entries
        let bytes = [0x06, 0x21, 0x00, 0x0A, 0x21, 0x00, 0x0B];
        assert_eq!(decode(&bytes), Err(DecodeError::DuplicateProperty(0x21)));
    }

    #[test]
    fn zero_receive_maximum_is_a_violation() {
        let err = decode(&[0x03, 0x21, 0x00, 0x00]).unwrap_err();
        assert!(!err.is_structural());
    }

    #[test]
    fn unknown_property_id() {
        assert_eq!(
            decode(&[0x02, 0x7F, 0x00]),
            Err(DecodeError::InvalidPropertyId(0x7F))
        );
    }

    #[test]
    fn block_longer_than_frame_is_truncated() {
        assert_eq!(decode(&[0x05, 0x01, 0x00]), Err(DecodeError::Truncated));
    }
}
