//! CONNECT packet handling

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::{debug, info, warn};

use super::{ClientConnection, ClientContext, Flow, Phase};
use crate::broker::state::Link;
use crate::broker::{Broker, BrokerEvent, BrokerState, DisconnectReason};
use crate::cluster::{ClusterMessage, SessionHeader, TakeoverHeader};
use crate::codec::Encoder;
use crate::protocol::{ConnAck, Connect, Packet, ProtocolError, QoS, ReasonCode};
use crate::session::{Attachment, Session, SessionExpiry};
use crate::topic::validate_topic_name;

impl Broker {
    /// Handle CONNECT packet
    pub(super) fn handle_connect(
        &self,
        st: &mut BrokerState,
        conn: &mut ClientConnection,
        mut connect: Connect,
        now: Instant,
    ) -> Result<Flow, ProtocolError> {
        let version = connect.protocol_version;
        conn.framer.pin(version);
        let v5 = version.is_v5();

        if v5 {
            if connect.properties.receive_maximum == Some(0) {
                return Err(ProtocolError::Violation("receive maximum of zero"));
            }
            if connect.properties.maximum_packet_size == Some(0) {
                return Err(ProtocolError::Violation("maximum packet size of zero"));
            }
            if connect.properties.authentication_method.is_some() {
                return self.refuse(conn, &connect, ReasonCode::BadAuthenticationMethod);
            }
        }

        // Empty client id: assigned by the server, only for a clean session
        let mut assigned = None;
        if connect.client_id.is_empty() {
            if !connect.clean_start {
                return self.refuse(conn, &connect, ReasonCode::ClientIdNotValid);
            }
            let id = st.next_assigned_id(self.node_id());
            connect.client_id = id.clone();
            assigned = Some(id);
        }

        if !self.hooks().authenticate(
            &connect.client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        ) {
            return self.refuse(conn, &connect, ReasonCode::BadUserNameOrPassword);
        }

        if let Some(will) = &connect.will {
            if validate_topic_name(&will.topic, self.config.max_topic_levels).is_err() {
                return self.refuse(conn, &connect, ReasonCode::TopicNameInvalid);
            }
            if will.qos > self.config.max_qos {
                return self.refuse(conn, &connect, ReasonCode::QoSNotSupported);
            }
            if will.retain && !self.config.retain_available {
                return self.refuse(conn, &connect, ReasonCode::RetainNotSupported);
            }
            if !self.hooks().authorize(
                &connect.client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
                &will.topic,
                false,
                &will.payload,
            ) {
                return self.refuse(conn, &connect, ReasonCode::NotAuthorized);
            }
        }

        let requested_expiry = if v5 {
            SessionExpiry::from_secs(connect.properties.session_expiry_interval.unwrap_or(0))
        } else if connect.clean_start {
            SessionExpiry::After(Duration::ZERO)
        } else {
            SessionExpiry::Never
        };
        let session_expiry = self.cap_session_expiry(requested_expiry);

        let mut keep_alive = connect.keep_alive;
        let max_keep_alive = self.config.max_keep_alive;
        if max_keep_alive > 0 && (keep_alive == 0 || keep_alive > max_keep_alive) {
            keep_alive = max_keep_alive;
        }

        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());

        // Close the connection currently holding the session. Its will is
        // discarded; the session itself is handed to the new connection.
        let taken_over = st
            .sessions
            .get(&client_id)
            .is_some_and(|s| s.connected);
        if taken_over {
            info!(client_id = %client_id, "session taken over");
            self.drop_connection(st, &client_id, DisconnectReason::TakenOver, false, now);
            if let Some(session) = st.sessions.get_mut(&client_id) {
                session.will = None;
            }
            self.emit(BrokerEvent::SessionTakenOver {
                client_id: client_id.clone(),
            });
        }

        if connect.clean_start {
            if st.remove_session(&client_id).is_some() {
                debug!(client_id = %client_id, "clean start discarded existing session");
            }
            st.replicas.remove(&client_id);
        }

        let mut session_present = st.sessions.contains_key(&client_id);
        if !session_present {
            st.sessions.insert(
                client_id.clone(),
                Session::new(client_id.clone(), self.config.max_queued_messages, now),
            );
            let replica = if connect.clean_start {
                None
            } else {
                st.replicas.take(&client_id)
            };
            if let Some(replica) = replica {
                debug!(
                    client_id = %client_id,
                    node = %replica.node_id,
                    subscriptions = replica.subscriptions.len(),
                    "adopting session from cluster peer"
                );
                for (raw, sub) in replica.subscriptions {
                    self.install_subscription(st, &client_id, Arc::from(raw), sub);
                }
                session_present = true;
            }
        }

        let max_packet_size = if v5 {
            connect.properties.maximum_packet_size
        } else {
            None
        };
        let Some(session) = st.sessions.get_mut(&client_id) else {
            return Err(ProtocolError::Violation("session vanished during CONNECT"));
        };
        session.attach(
            Attachment {
                connection: conn.id,
                protocol_version: version,
                keep_alive,
                session_expiry,
                will: connect.will.take(),
                receive_maximum: connect.properties.receive_maximum.unwrap_or(u16::MAX),
                max_packet_size,
            },
            now,
        );
        let resumed = if session_present {
            session.resume()
        } else {
            Vec::new()
        };

        let encoder = Encoder::new(version);
        st.links.insert(
            conn.id,
            Link {
                client_id: client_id.clone(),
                transport: conn.transport.clone(),
                encoder,
            },
        );
        conn.phase = Phase::Active(ClientContext {
            client_id: client_id.clone(),
            username: connect.username.take(),
            password: connect.password.take(),
            version,
            encoder,
            topic_aliases: AHashMap::new(),
            disconnect: None,
            zero_expiry_at_connect: session_expiry.is_zero(),
        });

        let mut connack = ConnAck {
            session_present,
            reason_code: ReasonCode::Success,
            ..Default::default()
        };
        if v5 {
            self.connack_properties(&mut connack, requested_expiry, session_expiry);
            connack.properties.assigned_client_identifier = assigned;
            if keep_alive != connect.keep_alive {
                connack.properties.server_keep_alive = Some(keep_alive);
            }
        }
        conn.send(&Packet::ConnAck(connack));
        for packet in resumed {
            st.send_to(&client_id, &packet);
        }

        info!(
            client_id = %client_id,
            connection = %conn.id,
            version = ?version,
            session_present,
            "client connected"
        );
        self.emit(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
            protocol_version: version,
            session_present,
        });

        self.replicate(ClusterMessage::SessionTakenOver(TakeoverHeader {
            client_id: client_id.to_string(),
            node_id: self.node_id().to_string(),
            clean_start: connect.clean_start,
        }));
        self.replicate(ClusterMessage::SessionAdd(SessionHeader {
            client_id: client_id.to_string(),
            node_id: self.node_id().to_string(),
            connected: true,
            session_expiry: session_expiry.as_secs(),
        }));
        self.persist_session(st, &client_id, now);

        Ok(Flow::Continue)
    }

    /// Refuse the connection with a CONNACK carrying `reason`
    fn refuse(
        &self,
        conn: &mut ClientConnection,
        connect: &Connect,
        reason: ReasonCode,
    ) -> Result<Flow, ProtocolError> {
        warn!(
            client_id = %connect.client_id,
            connection = %conn.id,
            %reason,
            "connection refused"
        );
        conn.send(&Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code: reason,
            ..Default::default()
        }));
        self.emit(BrokerEvent::ConnectionRefused {
            client_id: connect.client_id.clone(),
            reason,
        });
        conn.phase = Phase::Closed;
        Ok(Flow::Close)
    }

    fn cap_session_expiry(&self, requested: SessionExpiry) -> SessionExpiry {
        match (requested, self.config.max_session_expiry) {
            (_, None) => requested,
            (SessionExpiry::Never, Some(max)) => SessionExpiry::from_secs(max),
            (SessionExpiry::After(d), Some(max)) => {
                SessionExpiry::After(d.min(Duration::from_secs(max as u64)))
            }
        }
    }

    /// v5 CONNACK properties advertising the broker's limits
    fn connack_properties(
        &self,
        connack: &mut ConnAck,
        requested: SessionExpiry,
        granted: SessionExpiry,
    ) {
        let cfg = &self.config;
        let props = &mut connack.properties;
        if requested != granted {
            props.session_expiry_interval = Some(granted.as_secs());
        }
        if cfg.receive_maximum != u16::MAX {
            props.receive_maximum = Some(cfg.receive_maximum);
        }
        if cfg.max_qos != QoS::ExactlyOnce {
            props.maximum_qos = Some(cfg.max_qos as u8);
        }
        if !cfg.retain_available {
            props.retain_available = Some(0);
        }
        props.maximum_packet_size = u32::try_from(cfg.max_packet_size).ok();
        if cfg.max_topic_alias > 0 {
            props.topic_alias_maximum = Some(cfg.max_topic_alias);
        }
        if !cfg.wildcard_subscription_available {
            props.wildcard_subscription_available = Some(0);
        }
        if !cfg.subscription_identifiers_available {
            props.subscription_identifier_available = Some(0);
        }
        if !cfg.shared_subscriptions_available {
            props.shared_subscription_available = Some(0);
        }
    }
}
