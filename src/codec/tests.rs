//! Codec tests: wire layouts for both generations and framing under
//! arbitrary fragmentation.

#![allow(clippy::field_reassign_with_default)]

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use test_case::test_case;

use crate::codec::{read_variable_int, write_variable_int, Encoder, PacketFramer};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, ErrorKind, Packet, Properties, ProtocolVersion,
    PubAck, PubRel, Publish, QoS, ReasonCode, RetainHandling, SubAck, Subscribe, SubscribeFilter,
    SubscriptionOptions, UnsubAck, Will,
};

fn encode(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new(version).encode(packet, &mut buf).unwrap();
    buf
}

fn decode(buf: &[u8], version: ProtocolVersion) -> Result<Packet, DecodeError> {
    let mut framer = PacketFramer::default();
    framer.pin(version);
    match framer.feed(buf) {
        Ok(mut packets) => {
            assert_eq!(packets.len(), 1, "expected exactly one frame");
            Ok(packets.remove(0))
        }
        Err(crate::codec::FrameError::Decode(e)) => Err(e),
        Err(other) => panic!("unexpected {:?}", other),
    }
}

fn publish(topic: &str, qos: QoS, packet_id: Option<u16>, payload: &'static [u8]) -> Publish {
    Publish {
        qos,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::from_static(payload),
        ..Default::default()
    }
}

#[test]
fn connect_v311_wire_layout() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "ab".into(),
        clean_start: true,
        keep_alive: 10,
        ..Default::default()
    }));
    let bytes = encode(&packet, ProtocolVersion::V311);
    assert_eq!(
        &bytes[..],
        &[
            0x10, 14, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x0A, 0x00, 0x02,
            b'a', b'b'
        ]
    );
    assert_eq!(decode(&bytes, ProtocolVersion::V311).unwrap(), packet);
}

#[test]
fn connect_v5_with_will_and_credentials() {
    let mut props = Properties::default();
    props.session_expiry_interval = Some(120);
    props.receive_maximum = Some(10);
    let mut will_props = Properties::default();
    will_props.will_delay_interval = Some(5);

    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "sensor-1".into(),
        clean_start: false,
        keep_alive: 30,
        username: Some("user".into()),
        password: Some(Bytes::from_static(b"secret")),
        will: Some(Will {
            topic: Arc::from("status/sensor-1"),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: will_props,
        }),
        properties: props,
    }));
    let bytes = encode(&packet, ProtocolVersion::V5);
    assert_eq!(decode(&bytes, ProtocolVersion::V5).unwrap(), packet);
}

#[test]
fn mqisdp_level_3_is_accepted_as_v311() {
    let body: &[u8] = &[
        0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x01, b'x',
    ];
    let mut frame = vec![0x10, body.len() as u8];
    frame.extend_from_slice(body);

    let mut framer = PacketFramer::default();
    let packets = framer.feed(&frame).unwrap();
    assert_eq!(framer.protocol_version(), Some(ProtocolVersion::V311));
    match &packets[0] {
        Packet::Connect(c) => assert_eq!(c.client_id, "x"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test_case(&[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'X', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00], DecodeError::InvalidProtocolName; "bad protocol name")]
#[test_case(&[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x00], DecodeError::InvalidFlags; "reserved connect flag")]
#[test_case(&[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x1A, 0x00, 0x3C, 0x00, 0x00], DecodeError::InvalidQoS(3); "will qos 3")]
#[test_case(&[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x22, 0x00, 0x3C, 0x00, 0x00], DecodeError::InvalidFlags; "will retain without will")]
#[test_case(&[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3C, 0x00, 0x00], DecodeError::InvalidFlags; "password without username")]
fn invalid_v311_connect(bytes: &[u8], expected: DecodeError) {
    assert_eq!(decode(bytes, ProtocolVersion::V311), Err(expected));
}

#[test]
fn connack_return_codes_per_generation() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: false,
        reason_code: ReasonCode::BadUserNameOrPassword,
        properties: Properties::default(),
    });
    assert_eq!(&encode(&packet, ProtocolVersion::V311)[..], &[0x20, 0x02, 0x00, 0x04]);
    assert_eq!(
        &encode(&packet, ProtocolVersion::V5)[..],
        &[0x20, 0x03, 0x00, 0x86, 0x00]
    );
}

#[test]
fn publish_qos1_layout() {
    let packet = Packet::Publish(publish("a/b", QoS::AtLeastOnce, Some(7), b"hi"));
    let bytes = encode(&packet, ProtocolVersion::V311);
    assert_eq!(
        &bytes[..],
        &[0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x07, b'h', b'i']
    );
    assert_eq!(decode(&bytes, ProtocolVersion::V311).unwrap(), packet);
}

#[test]
fn publish_v5_properties_survive() {
    let mut p = publish("metrics/cpu", QoS::ExactlyOnce, Some(65535), b"{}");
    p.retain = true;
    p.properties.message_expiry_interval = Some(60);
    p.properties.content_type = Some("application/json".into());
    p.properties.subscription_identifiers = vec![3, 9];
    let packet = Packet::Publish(p);
    let bytes = encode(&packet, ProtocolVersion::V5);
    assert_eq!(decode(&bytes, ProtocolVersion::V5).unwrap(), packet);
}

#[test_case(&[0x38, 0x03, 0x00, 0x01, b'a'], DecodeError::Violation("DUP set on a QoS 0 publish"); "dup on qos0")]
#[test_case(&[0x30, 0x03, 0x00, 0x01, b'+'], DecodeError::Violation("wildcard in topic name"); "wildcard topic")]
#[test_case(&[0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00], DecodeError::Violation("packet identifier of 0"); "zero packet id")]
#[test_case(&[0x30, 0x02, 0x00, 0x00], DecodeError::Violation("empty topic name"); "empty topic")]
#[test_case(&[0x30, 0x03, 0x00, 0x01, 0x00], DecodeError::InvalidUtf8; "null character")]
#[test_case(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28], DecodeError::InvalidUtf8; "invalid utf8")]
fn invalid_publish(bytes: &[u8], expected: DecodeError) {
    assert_eq!(decode(bytes, ProtocolVersion::V311), Err(expected));
}

#[test]
fn v5_ack_short_forms() {
    // success without reason code or properties
    assert_eq!(
        decode(&[0x40, 0x02, 0x00, 0x05], ProtocolVersion::V5).unwrap(),
        Packet::PubAck(PubAck::new(5))
    );
    // reason code present, properties omitted
    assert_eq!(
        decode(&[0x62, 0x03, 0x00, 0x05, 0x92], ProtocolVersion::V5).unwrap(),
        Packet::PubRel(PubRel::with_reason(5, ReasonCode::PacketIdNotFound))
    );
    // success acks encode in the shortest form
    assert_eq!(
        &encode(&Packet::PubAck(PubAck::new(5)), ProtocolVersion::V5)[..],
        &[0x40, 0x02, 0x00, 0x05]
    );
}

#[test]
fn pubrel_requires_flags() {
    assert_eq!(
        decode(&[0x60, 0x02, 0x00, 0x01], ProtocolVersion::V311),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn subscribe_v5_options() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 3,
        filters: vec![
            SubscribeFilter {
                filter: "a/+".into(),
                options: SubscriptionOptions {
                    qos: QoS::AtLeastOnce,
                    no_local: true,
                    retain_as_published: true,
                    retain_handling: RetainHandling::Never,
                },
            },
            SubscribeFilter {
                filter: "$share/g/b/#".into(),
                options: SubscriptionOptions::default(),
            },
        ],
        properties: Properties {
            subscription_identifiers: vec![42],
            ..Default::default()
        },
    });
    let bytes = encode(&packet, ProtocolVersion::V5);
    assert_eq!(decode(&bytes, ProtocolVersion::V5).unwrap(), packet);
}

#[test]
fn subscribe_v311_rejects_reserved_option_bits() {
    let bytes = [0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x04];
    assert_eq!(
        decode(&bytes, ProtocolVersion::V311),
        Err(DecodeError::InvalidSubscriptionOptions)
    );
}

#[test]
fn subscribe_without_filters() {
    assert_eq!(
        decode(&[0x82, 0x02, 0x00, 0x01], ProtocolVersion::V311),
        Err(DecodeError::Violation("SUBSCRIBE without filters"))
    );
}

#[test]
fn suback_failure_code_per_generation() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 1,
        reason_codes: vec![ReasonCode::GrantedQoS1, ReasonCode::NotAuthorized],
        properties: Properties::default(),
    });
    assert_eq!(
        &encode(&packet, ProtocolVersion::V311)[..],
        &[0x90, 0x04, 0x00, 0x01, 0x01, 0x80]
    );
    assert_eq!(
        &encode(&packet, ProtocolVersion::V5)[..],
        &[0x90, 0x05, 0x00, 0x01, 0x00, 0x01, 0x87]
    );
}

#[test]
fn unsuback_v311_has_no_payload() {
    let packet = Packet::UnsubAck(UnsubAck {
        packet_id: 9,
        reason_codes: vec![ReasonCode::NoSubscriptionExisted],
        properties: Properties::default(),
    });
    assert_eq!(
        &encode(&packet, ProtocolVersion::V311)[..],
        &[0xB0, 0x02, 0x00, 0x09]
    );
}

#[test]
fn disconnect_forms() {
    assert_eq!(
        decode(&[0xE0, 0x00], ProtocolVersion::V5).unwrap(),
        Packet::Disconnect(Disconnect::default())
    );
    assert_eq!(
        decode(&[0xE0, 0x01, 0x04], ProtocolVersion::V5).unwrap(),
        Packet::Disconnect(Disconnect::new(ReasonCode::DisconnectWithWill))
    );
    assert_eq!(
        decode(&[0xE0, 0x01, 0x04], ProtocolVersion::V311)
            .unwrap_err()
            .kind(),
        ErrorKind::Malformed
    );
    let taken_over = Packet::Disconnect(Disconnect::new(ReasonCode::SessionTakenOver));
    assert_eq!(
        &encode(&taken_over, ProtocolVersion::V5)[..],
        &[0xE0, 0x01, 0x8E]
    );
}

#[test]
fn auth_is_v5_only() {
    assert_eq!(
        decode(&[0xF0, 0x00], ProtocolVersion::V311),
        Err(DecodeError::InvalidPacketType(15))
    );
    assert!(decode(&[0xF0, 0x00], ProtocolVersion::V5).is_ok());
}

#[test]
fn ping_packets() {
    assert_eq!(&encode(&Packet::PingResp, ProtocolVersion::V5)[..], &[0xD0, 0x00]);
    assert_eq!(
        decode(&[0xC0, 0x00], ProtocolVersion::V311).unwrap(),
        Packet::PingReq
    );
    assert_eq!(
        decode(&[0xC1, 0x00], ProtocolVersion::V311),
        Err(DecodeError::InvalidFlags)
    );
}

#[test_case(0, &[0x00]; "zero")]
#[test_case(127, &[0x7F]; "one byte max")]
#[test_case(128, &[0x80, 0x01]; "two byte min")]
#[test_case(16_383, &[0xFF, 0x7F]; "two byte max")]
#[test_case(2_097_152, &[0x80, 0x80, 0x80, 0x01]; "four byte min")]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F]; "four byte max")]
fn variable_int_boundaries(value: u32, bytes: &[u8]) {
    let mut buf = BytesMut::new();
    write_variable_int(&mut buf, value).unwrap();
    assert_eq!(&buf[..], bytes);
    assert_eq!(read_variable_int(bytes).unwrap(), Some((value, bytes.len())));
}

#[test]
fn variable_int_limits() {
    let mut buf = BytesMut::new();
    assert!(write_variable_int(&mut buf, 268_435_456).is_err());
    assert_eq!(read_variable_int(&[0x80, 0x80]), Ok(None));
    assert_eq!(
        read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]),
        Err(DecodeError::InvalidVarint)
    );
}

fn sample_stream(version: ProtocolVersion) -> (Vec<Packet>, BytesMut) {
    let mut packets = vec![
        Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id: "split".into(),
            ..Default::default()
        })),
        Packet::Publish(publish("a/b", QoS::AtMostOnce, None, b"zero")),
        Packet::Publish(publish("a/c", QoS::ExactlyOnce, Some(2), &[0u8; 300])),
        Packet::PubRel(PubRel::new(2)),
        Packet::PingReq,
    ];
    if version.is_v5() {
        packets.push(Packet::Disconnect(Disconnect::new(
            ReasonCode::DisconnectWithWill,
        )));
    } else {
        packets.push(Packet::Disconnect(Disconnect::default()));
    }
    let mut bytes = BytesMut::new();
    for p in &packets {
        bytes.extend_from_slice(&encode(p, version));
    }
    (packets, bytes)
}

proptest! {
    #[test]
    fn any_split_yields_the_same_frames(
        cuts in proptest::collection::vec(0usize..1000, 0..12),
        v5 in any::<bool>(),
    ) {
        let version = if v5 { ProtocolVersion::V5 } else { ProtocolVersion::V311 };
        let (expected, bytes) = sample_stream(version);

        let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
        points.push(0);
        points.push(bytes.len());
        points.sort_unstable();

        let mut framer = PacketFramer::default();
        let mut got = Vec::new();
        for w in points.windows(2) {
            got.extend(framer.feed(&bytes[w[0]..w[1]]).unwrap());
        }

        prop_assert_eq!(framer.protocol_version(), Some(version));
        prop_assert_eq!(framer.buffered(), 0);
        prop_assert_eq!(got, expected);
    }
}
