//! Cluster Protocol Messages
//!
//! Wire layout of one message:
//!
//! ```text
//! type:u8 | options_length:varint | options | payload_length:varint | payload
//! ```
//!
//! `options` is a bincode-encoded header specific to the message type;
//! `payload` carries the application payload of relayed and retained
//! publishes and is empty otherwise. Varints use the same base-128
//! encoding as the MQTT remaining length.

use std::fmt;
use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{read_variable_int, write_variable_int};
use crate::protocol::{DecodeError, Properties, Publish, QoS, SubscriptionOptions};

/// Protocol version exchanged in `Hello`
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Default upper bound for one cluster frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum ClusterError {
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
    Varint(DecodeError),
    UnknownType(u8),
    /// Header field out of range (QoS, subscription options)
    InvalidField(&'static str),
    FrameTooLarge { size: usize, max: usize },
    VersionMismatch(u8),
    Io(std::io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Encode(e) => write!(f, "encode error: {}", e),
            ClusterError::Decode(e) => write!(f, "decode error: {}", e),
            ClusterError::Varint(e) => write!(f, "bad length: {}", e),
            ClusterError::UnknownType(t) => write!(f, "unknown message type {}", t),
            ClusterError::InvalidField(what) => write!(f, "invalid field: {}", what),
            ClusterError::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds limit of {}", size, max)
            }
            ClusterError::VersionMismatch(v) => write!(f, "peer speaks protocol version {}", v),
            ClusterError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClusterError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClusterError::Decode(e)
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(e)
    }
}

/// Leading type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    RetainedSet = 1,
    SubscriptionAdd = 2,
    SubscriptionRemove = 3,
    PublishRelay = 4,
    SessionAdd = 5,
    SessionUpdate = 6,
    SessionTakenOver = 7,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Hello),
            1 => Some(MessageType::RetainedSet),
            2 => Some(MessageType::SubscriptionAdd),
            3 => Some(MessageType::SubscriptionRemove),
            4 => Some(MessageType::PublishRelay),
            5 => Some(MessageType::SessionAdd),
            6 => Some(MessageType::SessionUpdate),
            7 => Some(MessageType::SessionTakenOver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct HelloHeader {
    pub node_id: String,
    pub version: u8,
}

/// Publish properties that survive a hop between nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct RelayedProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

impl From<&Properties> for RelayedProperties {
    fn from(p: &Properties) -> Self {
        Self {
            payload_format_indicator: p.payload_format_indicator,
            message_expiry_interval: p.message_expiry_interval,
            content_type: p.content_type.clone(),
            response_topic: p.response_topic.clone(),
            correlation_data: p.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: p.user_properties.clone(),
        }
    }
}

impl From<RelayedProperties> for Properties {
    fn from(p: RelayedProperties) -> Self {
        Properties {
            payload_format_indicator: p.payload_format_indicator,
            message_expiry_interval: p.message_expiry_interval,
            content_type: p.content_type,
            response_topic: p.response_topic,
            correlation_data: p.correlation_data.map(Bytes::from),
            user_properties: p.user_properties,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PublishHeader {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    /// Publishing client, for `no_local`
    pub origin_client: Option<String>,
    pub origin_node: String,
    pub properties: RelayedProperties,
}

/// A publish crossing the link: header in the options, payload raw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedPublish {
    pub header: PublishHeader,
    pub payload: Bytes,
}

impl RelayedPublish {
    pub fn new(publish: &Publish, origin_client: Option<&str>, origin_node: &str) -> Self {
        Self {
            header: PublishHeader {
                topic: publish.topic.to_string(),
                qos: publish.qos as u8,
                retain: publish.retain,
                origin_client: origin_client.map(str::to_string),
                origin_node: origin_node.to_string(),
                properties: RelayedProperties::from(&publish.properties),
            },
            payload: publish.payload.clone(),
        }
    }

    pub fn to_publish(&self) -> Result<Publish, ClusterError> {
        let qos = QoS::from_u8(self.header.qos).ok_or(ClusterError::InvalidField("qos"))?;
        Ok(Publish {
            dup: false,
            qos,
            retain: self.header.retain,
            topic: Arc::from(self.header.topic.as_str()),
            packet_id: None,
            payload: self.payload.clone(),
            properties: self.header.properties.clone().into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SubscriptionHeader {
    pub client_id: String,
    /// Filter as subscribed, share prefix included
    pub filter: String,
    /// Subscription options byte as on the MQTT wire
    pub options: u8,
    pub subscription_id: Option<u32>,
}

impl SubscriptionHeader {
    pub fn options(&self) -> Result<SubscriptionOptions, ClusterError> {
        SubscriptionOptions::from_byte(self.options)
            .ok_or(ClusterError::InvalidField("subscription options"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SessionHeader {
    pub client_id: String,
    pub node_id: String,
    pub connected: bool,
    /// Seconds; `u32::MAX` means never
    pub session_expiry: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TakeoverHeader {
    pub client_id: String,
    /// Node that now owns the client
    pub node_id: String,
    /// The client connected with clean start; any earlier state is gone
    pub clean_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    Hello(HelloHeader),
    /// Retained state for one topic; an empty payload clears it
    RetainedSet(RelayedPublish),
    SubscriptionAdd(SubscriptionHeader),
    SubscriptionRemove(SubscriptionHeader),
    PublishRelay(RelayedPublish),
    SessionAdd(SessionHeader),
    SessionUpdate(SessionHeader),
    SessionTakenOver(TakeoverHeader),
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn options<T: Encode>(header: &T) -> Result<Vec<u8>, ClusterError> {
    Ok(bincode::encode_to_vec(header, bincode_config())?)
}

fn header<T: Decode<()>>(bytes: &[u8]) -> Result<T, ClusterError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode_config())?;
    Ok(value)
}

impl ClusterMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClusterMessage::Hello(_) => MessageType::Hello,
            ClusterMessage::RetainedSet(_) => MessageType::RetainedSet,
            ClusterMessage::SubscriptionAdd(_) => MessageType::SubscriptionAdd,
            ClusterMessage::SubscriptionRemove(_) => MessageType::SubscriptionRemove,
            ClusterMessage::PublishRelay(_) => MessageType::PublishRelay,
            ClusterMessage::SessionAdd(_) => MessageType::SessionAdd,
            ClusterMessage::SessionUpdate(_) => MessageType::SessionUpdate,
            ClusterMessage::SessionTakenOver(_) => MessageType::SessionTakenOver,
        }
    }

    /// Name for logging
    pub fn type_name(&self) -> &'static str {
        match self.message_type() {
            MessageType::Hello => "Hello",
            MessageType::RetainedSet => "RetainedSet",
            MessageType::SubscriptionAdd => "SubscriptionAdd",
            MessageType::SubscriptionRemove => "SubscriptionRemove",
            MessageType::PublishRelay => "PublishRelay",
            MessageType::SessionAdd => "SessionAdd",
            MessageType::SessionUpdate => "SessionUpdate",
            MessageType::SessionTakenOver => "SessionTakenOver",
        }
    }

    /// Append the framed message to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ClusterError> {
        let (opts, payload): (Vec<u8>, &[u8]) = match self {
            ClusterMessage::Hello(h) => (options(h)?, &[]),
            ClusterMessage::RetainedSet(p) | ClusterMessage::PublishRelay(p) => {
                (options(&p.header)?, &p.payload)
            }
            ClusterMessage::SubscriptionAdd(h) | ClusterMessage::SubscriptionRemove(h) => {
                (options(h)?, &[])
            }
            ClusterMessage::SessionAdd(h) | ClusterMessage::SessionUpdate(h) => (options(h)?, &[]),
            ClusterMessage::SessionTakenOver(h) => (options(h)?, &[]),
        };

        buf.put_u8(self.message_type() as u8);
        write_variable_int(buf, opts.len() as u32)
            .map_err(|_| ClusterError::InvalidField("options too long"))?;
        buf.put_slice(&opts);
        write_variable_int(buf, payload.len() as u32)
            .map_err(|_| ClusterError::InvalidField("payload too long"))?;
        buf.put_slice(payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ClusterError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn decode(kind: MessageType, opts: &[u8], payload: Bytes) -> Result<Self, ClusterError> {
        Ok(match kind {
            MessageType::Hello => ClusterMessage::Hello(header(opts)?),
            MessageType::RetainedSet => ClusterMessage::RetainedSet(RelayedPublish {
                header: header(opts)?,
                payload,
            }),
            MessageType::SubscriptionAdd => ClusterMessage::SubscriptionAdd(header(opts)?),
            MessageType::SubscriptionRemove => ClusterMessage::SubscriptionRemove(header(opts)?),
            MessageType::PublishRelay => ClusterMessage::PublishRelay(RelayedPublish {
                header: header(opts)?,
                payload,
            }),
            MessageType::SessionAdd => ClusterMessage::SessionAdd(header(opts)?),
            MessageType::SessionUpdate => ClusterMessage::SessionUpdate(header(opts)?),
            MessageType::SessionTakenOver => ClusterMessage::SessionTakenOver(header(opts)?),
        })
    }
}

/// Splits a link's byte stream into messages. An incomplete message leaves
/// the buffer untouched until more bytes arrive.
#[derive(Debug)]
pub struct ClusterFramer {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for ClusterFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl ClusterFramer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ClusterMessage>, ClusterError> {
        self.push(data);
        let mut out = Vec::new();
        while let Some(msg) = self.next_message()? {
            out.push(msg);
        }
        Ok(out)
    }

    pub fn next_message(&mut self) -> Result<Option<ClusterMessage>, ClusterError> {
        let Some(&type_byte) = self.buf.first() else {
            return Ok(None);
        };
        let kind = MessageType::from_u8(type_byte).ok_or(ClusterError::UnknownType(type_byte))?;

        let mut pos = 1;
        let Some((opts_len, n)) = read_variable_int(&self.buf[pos..]).map_err(ClusterError::Varint)?
        else {
            return Ok(None);
        };
        pos += n;
        let opts_start = pos;
        pos += opts_len as usize;
        if pos > self.max_frame_size {
            return Err(ClusterError::FrameTooLarge {
                size: pos,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() <= pos {
            return Ok(None);
        }

        let Some((payload_len, n)) =
            read_variable_int(&self.buf[pos..]).map_err(ClusterError::Varint)?
        else {
            return Ok(None);
        };
        let payload_start = pos + n;
        let total = payload_start + payload_len as usize;
        if total > self.max_frame_size {
            return Err(ClusterError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = self.buf.split_to(total).freeze();
        let opts = frame.slice(opts_start..opts_start + opts_len as usize);
        let payload = frame.slice(payload_start..total);
        ClusterMessage::decode(kind, &opts, payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn relay() -> ClusterMessage {
        let publish = Publish {
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Arc::from("sensors/1"),
            payload: Bytes::from_static(b"21.5"),
            properties: Properties {
                message_expiry_interval: Some(30),
                user_properties: vec![("k".into(), "v".into())],
                ..Default::default()
            },
            ..Default::default()
        };
        ClusterMessage::PublishRelay(RelayedPublish::new(&publish, Some("c1"), "node-a"))
    }

    fn samples() -> Vec<ClusterMessage> {
        vec![
            ClusterMessage::Hello(HelloHeader {
                node_id: "node-a".into(),
                version: CLUSTER_PROTOCOL_VERSION,
            }),
            relay(),
            ClusterMessage::SubscriptionAdd(SubscriptionHeader {
                client_id: "c1".into(),
                filter: "$share/g/a/+".into(),
                options: 0x01,
                subscription_id: Some(4),
            }),
            ClusterMessage::SessionUpdate(SessionHeader {
                client_id: "c1".into(),
                node_id: "node-a".into(),
                connected: false,
                session_expiry: u32::MAX,
            }),
            ClusterMessage::SessionTakenOver(TakeoverHeader {
                client_id: "c1".into(),
                node_id: "node-b".into(),
                clean_start: true,
            }),
        ]
    }

    #[test]
    fn frame_layout() {
        let bytes = relay().to_bytes().unwrap();
        assert_eq!(bytes[0], MessageType::PublishRelay as u8);
        let (opts_len, n) = read_variable_int(&bytes[1..]).unwrap().unwrap();
        let payload_at = 1 + n + opts_len as usize;
        let (payload_len, m) = read_variable_int(&bytes[payload_at..]).unwrap().unwrap();
        assert_eq!(payload_len, 4);
        assert_eq!(&bytes[payload_at + m..], b"21.5");
    }

    #[test]
    fn relayed_publish_keeps_properties() {
        let ClusterMessage::PublishRelay(r) = relay() else {
            unreachable!()
        };
        let p = r.to_publish().unwrap();
        assert_eq!(p.qos, QoS::AtLeastOnce);
        assert!(p.retain);
        assert_eq!(p.properties.message_expiry_interval, Some(30));
        assert_eq!(p.properties.user_properties.len(), 1);
        assert_eq!(r.header.origin_client.as_deref(), Some("c1"));
    }

    #[test]
    fn framer_handles_byte_by_byte_input() {
        let mut stream = BytesMut::new();
        for m in samples() {
            m.encode(&mut stream).unwrap();
        }

        let mut framer = ClusterFramer::default();
        let mut out = Vec::new();
        for b in stream.iter() {
            out.extend(framer.feed(&[*b]).unwrap());
        }
        assert_eq!(out, samples());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut framer = ClusterFramer::default();
        assert!(matches!(framer.feed(&[9, 0, 0]), Err(ClusterError::UnknownType(9))));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut framer = ClusterFramer::new(64);
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::PublishRelay as u8);
        write_variable_int(&mut buf, 1000).unwrap();
        assert!(matches!(
            framer.feed(&buf),
            Err(ClusterError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn bad_qos_in_relay() {
        let ClusterMessage::PublishRelay(mut r) = relay() else {
            unreachable!()
        };
        r.header.qos = 3;
        assert!(matches!(r.to_publish(), Err(ClusterError::InvalidField("qos"))));
    }
}
