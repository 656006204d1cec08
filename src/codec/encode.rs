//! Packet encoding
//!
//! Bodies are written into a scratch buffer first so the remaining length
//! never has to be computed separately from the bytes it describes.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Connect, EncodeError, Packet, Properties, ProtocolVersion, QoS, ReasonCode,
};

#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Append one complete frame to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(64);
        let flags = self.encode_body(packet, &mut body)?;
        buf.reserve(body.len() + 5);
        buf.put_u8(((packet.packet_type() as u8) << 4) | flags);
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Size of the frame `packet` would produce
    pub fn encoded_len(&self, packet: &Packet) -> Result<usize, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.len())
    }

    fn v5(&self) -> bool {
        self.version.is_v5()
    }

    fn properties(&self, props: &Properties, b: &mut BytesMut) -> Result<(), EncodeError> {
        if self.v5() {
            props.encode(b)?;
        }
        Ok(())
    }

    /// Writes the body and returns the header flags nibble
    fn encode_body(&self, packet: &Packet, b: &mut BytesMut) -> Result<u8, EncodeError> {
        let flags = packet.packet_type().fixed_flags().unwrap_or(0);
        match packet {
            Packet::Connect(c) => self.connect(c, b)?,
            Packet::ConnAck(p) => {
                b.put_u8(p.session_present as u8);
                if self.v5() {
                    b.put_u8(p.reason_code as u8);
                    p.properties.encode(b)?;
                } else {
                    b.put_u8(p.reason_code.to_v3_connack_code());
                }
            }
            Packet::Publish(p) => {
                write_string(b, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    b.put_u16(p.packet_id.unwrap_or(0));
                }
                self.properties(&p.properties, b)?;
                b.extend_from_slice(&p.payload);
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= 0x08;
                }
                if p.retain {
                    flags |= 0x01;
                }
                return Ok(flags);
            }
            Packet::PubAck(p) => self.ack(p.packet_id, p.reason_code, &p.properties, b)?,
            Packet::PubRec(p) => self.ack(p.packet_id, p.reason_code, &p.properties, b)?,
            Packet::PubRel(p) => self.ack(p.packet_id, p.reason_code, &p.properties, b)?,
            Packet::PubComp(p) => self.ack(p.packet_id, p.reason_code, &p.properties, b)?,
            Packet::Subscribe(p) => {
                b.put_u16(p.packet_id);
                self.properties(&p.properties, b)?;
                for f in &p.filters {
                    write_string(b, &f.filter)?;
                    if self.v5() {
                        b.put_u8(f.options.to_byte());
                    } else {
                        b.put_u8(f.options.qos as u8);
                    }
                }
            }
            Packet::SubAck(p) => {
                b.put_u16(p.packet_id);
                self.properties(&p.properties, b)?;
                for rc in &p.reason_codes {
                    if self.v5() {
                        b.put_u8(*rc as u8);
                    } else {
                        b.put_u8(rc.to_v3_suback_code());
                    }
                }
            }
            Packet::Unsubscribe(p) => {
                b.put_u16(p.packet_id);
                self.properties(&p.properties, b)?;
                for f in &p.filters {
                    write_string(b, f)?;
                }
            }
            Packet::UnsubAck(p) => {
                b.put_u16(p.packet_id);
                if self.v5() {
                    p.properties.encode(b)?;
                    for rc in &p.reason_codes {
                        b.put_u8(*rc as u8);
                    }
                }
            }
            Packet::PingReq | Packet::PingResp => {}
            Packet::Disconnect(p) => {
                if self.v5() && (p.reason_code != ReasonCode::Success || !p.properties.is_empty())
                {
                    b.put_u8(p.reason_code as u8);
                    if !p.properties.is_empty() {
                        p.properties.encode(b)?;
                    }
                }
            }
            Packet::Auth(p) => {
                if p.reason_code != ReasonCode::Success || !p.properties.is_empty() {
                    b.put_u8(p.reason_code as u8);
                    p.properties.encode(b)?;
                }
            }
        }
        Ok(flags)
    }

    fn ack(
        &self,
        packet_id: u16,
        reason_code: ReasonCode,
        properties: &Properties,
        b: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        b.put_u16(packet_id);
        if !self.v5() {
            return Ok(());
        }
        // v5 shortest form: the reason code and properties are omitted on success
        if reason_code != ReasonCode::Success || !properties.is_empty() {
            b.put_u8(reason_code as u8);
            if !properties.is_empty() {
                properties.encode(b)?;
            }
        }
        Ok(())
    }

    fn connect(&self, c: &Connect, b: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(b, "MQTT")?;
        b.put_u8(c.protocol_version as u8);

        let mut flags = 0u8;
        if c.clean_start {
            flags |= 0x02;
        }
        if let Some(will) = &c.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if c.password.is_some() {
            flags |= 0x40;
        }
        if c.username.is_some() {
            flags |= 0x80;
        }
        b.put_u8(flags);
        b.put_u16(c.keep_alive);

        let v5 = c.protocol_version.is_v5();
        if v5 {
            c.properties.encode(b)?;
        }
        write_string(b, &c.client_id)?;
        if let Some(will) = &c.will {
            if v5 {
                will.properties.encode(b)?;
            }
            write_string(b, &will.topic)?;
            write_binary(b, &will.payload)?;
        }
        if let Some(username) = &c.username {
            write_string(b, username)?;
        }
        if let Some(password) = &c.password {
            write_binary(b, password)?;
        }
        Ok(())
    }
}
