//! PUBLISH packet handling

use std::time::Instant;

use tracing::{debug, trace};

use super::{ClientConnection, Flow};
use crate::broker::{Broker, BrokerEvent, BrokerState};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS, ReasonCode};
use crate::topic::validate_topic_name;

impl Broker {
    /// Handle PUBLISH packet
    pub(super) fn handle_publish(
        &self,
        st: &mut BrokerState,
        conn: &mut ClientConnection,
        mut publish: Publish,
        now: Instant,
    ) -> Result<Flow, ProtocolError> {
        let max_topic_alias = self.config.max_topic_alias;
        let Some(ctx) = conn.context_mut() else {
            return Err(ProtocolError::Violation("PUBLISH before CONNECT"));
        };
        let client_id = ctx.client_id.clone();
        let v5 = ctx.version.is_v5();

        // Topic alias (v5)
        if let Some(alias) = publish.properties.topic_alias.take() {
            if alias == 0 || alias > max_topic_alias {
                return Err(ProtocolError::Unsupported(ReasonCode::TopicAliasInvalid));
            }
            if publish.topic.is_empty() {
                match ctx.topic_aliases.get(&alias) {
                    Some(topic) => publish.topic = topic.clone(),
                    None => {
                        return Err(ProtocolError::Unsupported(ReasonCode::TopicAliasInvalid));
                    }
                }
            } else {
                ctx.topic_aliases.insert(alias, publish.topic.clone());
            }
        }

        if let Err(e) = validate_topic_name(&publish.topic, self.config.max_topic_levels) {
            debug!(client_id = %client_id, topic = %publish.topic, "invalid topic name: {}", e);
            return Err(ProtocolError::Unsupported(ReasonCode::TopicNameInvalid));
        }
        if publish.qos > self.config.max_qos {
            return Err(ProtocolError::Unsupported(ReasonCode::QoSNotSupported));
        }
        if publish.retain && !self.config.retain_available {
            return Err(ProtocolError::Unsupported(ReasonCode::RetainNotSupported));
        }

        trace!(
            client_id = %client_id,
            topic = %publish.topic,
            qos = ?publish.qos,
            "PUBLISH"
        );

        let allowed = self.hooks().authorize(
            &client_id,
            ctx.username.as_deref(),
            ctx.password.as_deref(),
            &publish.topic,
            false,
            &publish.payload,
        );
        if !allowed {
            debug!(client_id = %client_id, topic = %publish.topic, "PUBLISH denied");
            self.emit(BrokerEvent::NotAuthorized {
                client_id: client_id.clone(),
                topic: publish.topic.to_string(),
            });
            // v3.1.1 has no way to report the refusal; the ack is sent as usual
            let reason = if v5 {
                ReasonCode::NotAuthorized
            } else {
                ReasonCode::Success
            };
            if let Some(ack) = publish_ack(&publish, reason) {
                conn.send(&ack);
            }
            return Ok(Flow::Continue);
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.route(st, publish, Some(&*client_id), false, now);
            }
            QoS::AtLeastOnce => {
                let ack = publish_ack(&publish, ReasonCode::Success);
                self.route(st, publish, Some(&*client_id), false, now);
                if let Some(ack) = ack {
                    conn.send(&ack);
                }
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ProtocolError::Violation("QoS 2 PUBLISH without packet id"));
                };
                let receive_maximum = self.config.receive_maximum as usize;
                let Some(session) = st.sessions.get_mut(&client_id) else {
                    return Ok(Flow::Close);
                };
                let duplicate = session.in_flight_in.contains_key(&packet_id);
                if !duplicate && session.in_flight_in.len() >= receive_maximum {
                    return Err(ProtocolError::QuotaExceeded);
                }
                if !session.receive_qos2(publish) {
                    trace!(client_id = %client_id, packet_id, "duplicate QoS 2 PUBLISH");
                }
                conn.send(&Packet::PubRec(PubRec::new(packet_id)));
            }
        }
        Ok(Flow::Continue)
    }
}

/// The PUBACK or PUBREC answering `publish`, if its QoS calls for one
fn publish_ack(publish: &Publish, reason: ReasonCode) -> Option<Packet> {
    let packet_id = publish.packet_id?;
    match publish.qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => Some(Packet::PubAck(PubAck::with_reason(packet_id, reason))),
        QoS::ExactlyOnce => Some(Packet::PubRec(PubRec::with_reason(packet_id, reason))),
    }
}
