//! Frame body decoding
//!
//! The framer has already split off a complete frame; everything here works
//! on `(header byte, body)` plus the generation being attempted.

use std::sync::Arc;

use bytes::Bytes;

use super::Reader;
use crate::protocol::{
    Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties,
    ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck,
    Subscribe, SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

/// Decode one frame body under the given generation.
///
/// A CONNECT whose protocol level belongs to the other generation yields
/// [`DecodeError::VersionMismatch`] so the framer can retry it.
pub fn decode_packet(
    header: u8,
    body: &[u8],
    version: ProtocolVersion,
) -> Result<Packet, DecodeError> {
    let type_nibble = header >> 4;
    let flags = header & 0x0F;
    let packet_type =
        PacketType::from_u8(type_nibble).ok_or(DecodeError::InvalidPacketType(type_nibble))?;

    if let Some(expected) = packet_type.fixed_flags() {
        if flags != expected {
            return Err(DecodeError::InvalidFlags);
        }
    }

    let mut r = Reader::new(body);
    let v5 = version.is_v5();
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(Box::new(connect(&mut r, version)?)),
        PacketType::ConnAck => connack(&mut r, v5)?,
        PacketType::Publish => Packet::Publish(publish(flags, &mut r, v5)?),
        PacketType::PubAck => {
            let (packet_id, reason_code, properties) = ack(&mut r, v5)?;
            Packet::PubAck(PubAck {
                packet_id,
                reason_code,
                properties,
            })
        }
        PacketType::PubRec => {
            let (packet_id, reason_code, properties) = ack(&mut r, v5)?;
            Packet::PubRec(PubRec {
                packet_id,
                reason_code,
                properties,
            })
        }
        PacketType::PubRel => {
            let (packet_id, reason_code, properties) = ack(&mut r, v5)?;
            Packet::PubRel(PubRel {
                packet_id,
                reason_code,
                properties,
            })
        }
        PacketType::PubComp => {
            let (packet_id, reason_code, properties) = ack(&mut r, v5)?;
            Packet::PubComp(PubComp {
                packet_id,
                reason_code,
                properties,
            })
        }
        PacketType::Subscribe => subscribe(&mut r, v5)?,
        PacketType::SubAck => suback(&mut r, v5)?,
        PacketType::Unsubscribe => unsubscribe(&mut r, v5)?,
        PacketType::UnsubAck => unsuback(&mut r, v5)?,
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => disconnect(&mut r, v5)?,
        PacketType::Auth if v5 => auth(&mut r)?,
        PacketType::Auth => return Err(DecodeError::InvalidPacketType(type_nibble)),
    };

    if !r.is_empty() {
        return Err(DecodeError::Malformed("trailing bytes after packet"));
    }
    Ok(packet)
}

fn read_properties(r: &mut Reader<'_>, v5: bool) -> Result<Properties, DecodeError> {
    if v5 {
        Properties::decode(r)
    } else {
        Ok(Properties::default())
    }
}

fn packet_id(r: &mut Reader<'_>) -> Result<u16, DecodeError> {
    match r.u16()? {
        0 => Err(DecodeError::Violation("packet identifier of 0")),
        id => Ok(id),
    }
}

fn reason(r: &mut Reader<'_>) -> Result<ReasonCode, DecodeError> {
    let byte = r.u8()?;
    ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))
}

fn connect(r: &mut Reader<'_>, version: ProtocolVersion) -> Result<Connect, DecodeError> {
    let name = r.string()?;
    if name != "MQTT" && name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    let level = r.u8()?;
    match ProtocolVersion::from_level(level) {
        None => return Err(DecodeError::UnsupportedProtocolVersion(level)),
        Some(v) if v != version => return Err(DecodeError::VersionMismatch(level)),
        Some(_) => {}
    }

    let flags = r.u8()?;
    if flags & 0x01 != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let clean_start = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos_bits = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let has_password = flags & 0x40 != 0;
    let has_username = flags & 0x80 != 0;

    let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;
    if !will_flag && (will_qos_bits != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }
    // v3.1.1 forbids a password without a username; v5 lifts that rule
    if !version.is_v5() && has_password && !has_username {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = r.u16()?;
    let properties = read_properties(r, version.is_v5())?;
    let client_id = r.string()?.to_owned();

    let will = if will_flag {
        let will_properties = read_properties(r, version.is_v5())?;
        let topic = r.string()?;
        if topic.is_empty() || topic.contains(&['+', '#'][..]) {
            return Err(DecodeError::Violation("invalid will topic"));
        }
        let payload = Bytes::copy_from_slice(r.binary()?);
        Some(Will {
            topic: Arc::from(topic),
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if has_username {
        Some(r.string()?.to_owned())
    } else {
        None
    };
    let password = if has_password {
        Some(Bytes::copy_from_slice(r.binary()?))
    } else {
        None
    };

    Ok(Connect {
        protocol_version: version,
        client_id,
        clean_start,
        keep_alive,
        username,
        password,
        will,
        properties,
    })
}

fn connack(r: &mut Reader<'_>, v5: bool) -> Result<Packet, DecodeError> {
    let ack_flags = r.u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let code = r.u8()?;
    let reason_code = if v5 {
        ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
    } else {
        ReasonCode::from_v3_connack_code(code)
    };
    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        reason_code,
        properties: read_properties(r, v5)?,
    }))
}

fn publish(flags: u8, r: &mut Reader<'_>, v5: bool) -> Result<Publish, DecodeError> {
    let dup = flags & 0x08 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    let retain = flags & 0x01 != 0;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::Violation("DUP set on a QoS 0 publish"));
    }

    let topic = r.string()?;
    if topic.contains(&['+', '#'][..]) {
        return Err(DecodeError::Violation("wildcard in topic name"));
    }

    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(packet_id(r)?)
    };
    let properties = read_properties(r, v5)?;

    // An empty topic is only legal in v5 and only with a topic alias
    if topic.is_empty() && properties.topic_alias.is_none() {
        return Err(DecodeError::Violation("empty topic name"));
    }

    Ok(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(r.rest()),
        properties,
    })
}

/// Shared layout of PUBACK, PUBREC, PUBREL and PUBCOMP.
///
/// v5 allows omitting the reason code (meaning success) and the properties.
fn ack(r: &mut Reader<'_>, v5: bool) -> Result<(u16, ReasonCode, Properties), DecodeError> {
    let id = packet_id(r)?;
    if !v5 || r.is_empty() {
        return Ok((id, ReasonCode::Success, Properties::default()));
    }
    let code = reason(r)?;
    let props = if r.is_empty() {
        Properties::default()
    } else {
        Properties::decode(r)?
    };
    Ok((id, code, props))
}

fn subscribe(r: &mut Reader<'_>, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = packet_id(r)?;
    let properties = read_properties(r, v5)?;
    if properties.subscription_identifiers.len() > 1 {
        return Err(DecodeError::Violation("more than one subscription identifier"));
    }

    let mut filters = Vec::new();
    while !r.is_empty() {
        let filter = r.string()?.to_owned();
        let byte = r.u8()?;
        let options = if v5 {
            SubscriptionOptions::from_byte(byte).ok_or(DecodeError::InvalidSubscriptionOptions)?
        } else {
            if byte & 0xFC != 0 {
                return Err(DecodeError::InvalidSubscriptionOptions);
            }
            let qos = QoS::from_u8(byte).ok_or(DecodeError::InvalidQoS(byte))?;
            SubscriptionOptions {
                qos,
                ..Default::default()
            }
        };
        filters.push(SubscribeFilter { filter, options });
    }
    if filters.is_empty() {
        return Err(DecodeError::Violation("SUBSCRIBE without filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        filters,
        properties,
    }))
}

fn suback(r: &mut Reader<'_>, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = packet_id(r)?;
    let properties = read_properties(r, v5)?;
    let mut reason_codes = Vec::new();
    while !r.is_empty() {
        let byte = r.u8()?;
        let rc = match (v5, byte) {
            (true, _) => ReasonCode::from_u8(byte),
            (false, 0..=2) => ReasonCode::from_u8(byte),
            (false, 0x80) => Some(ReasonCode::UnspecifiedError),
            (false, _) => None,
        };
        reason_codes.push(rc.ok_or(DecodeError::InvalidReasonCode(byte))?);
    }
    Ok(Packet::SubAck(SubAck {
        packet_id,
        reason_codes,
        properties,
    }))
}

fn unsubscribe(r: &mut Reader<'_>, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = packet_id(r)?;
    let properties = read_properties(r, v5)?;
    let mut filters = Vec::new();
    while !r.is_empty() {
        filters.push(r.string()?.to_owned());
    }
    if filters.is_empty() {
        return Err(DecodeError::Violation("UNSUBSCRIBE without filters"));
    }
    Ok(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        filters,
        properties,
    }))
}

fn unsuback(r: &mut Reader<'_>, v5: bool) -> Result<Packet, DecodeError> {
    let packet_id = packet_id(r)?;
    let properties = read_properties(r, v5)?;
    let mut reason_codes = Vec::new();
    if v5 {
        while !r.is_empty() {
            reason_codes.push(reason(r)?);
        }
    }
    Ok(Packet::UnsubAck(UnsubAck {
        packet_id,
        reason_codes,
        properties,
    }))
}

fn disconnect(r: &mut Reader<'_>, v5: bool) -> Result<Packet, DecodeError> {
    if !v5 || r.is_empty() {
        return Ok(Packet::Disconnect(Disconnect::default()));
    }
    let reason_code = reason(r)?;
    let properties = if r.is_empty() {
        Properties::default()
    } else {
        Properties::decode(r)?
    };
    Ok(Packet::Disconnect(Disconnect {
        reason_code,
        properties,
    }))
}

fn auth(r: &mut Reader<'_>) -> Result<Packet, DecodeError> {
    if r.is_empty() {
        return Ok(Packet::Auth(Auth::default()));
    }
    let reason_code = reason(r)?;
    let properties = if r.is_empty() {
        Properties::default()
    } else {
        Properties::decode(r)?
    };
    Ok(Packet::Auth(Auth {
        reason_code,
        properties,
    }))
}
