//! Disconnect handling, will publication and session expiry

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::{ClientConnection, Flow};
use crate::broker::{Broker, BrokerEvent, BrokerState, DisconnectReason};
use crate::cluster::{ClusterMessage, SessionHeader};
use crate::persistence::PersistenceOp;
use crate::protocol::{Disconnect, ProtocolError, ReasonCode};
use crate::session::SessionExpiry;

impl Broker {
    /// Handle DISCONNECT from the client. The session is detached when the
    /// driver reports the closed transport.
    pub(super) fn handle_disconnect(
        &self,
        st: &mut BrokerState,
        conn: &mut ClientConnection,
        disconnect: Disconnect,
    ) -> Result<Flow, ProtocolError> {
        let max_session_expiry = self.config.max_session_expiry;
        let Some(ctx) = conn.context_mut() else {
            return Err(ProtocolError::Violation("DISCONNECT before CONNECT"));
        };

        if let Some(secs) = disconnect.properties.session_expiry_interval {
            if ctx.zero_expiry_at_connect && secs != 0 {
                return Err(ProtocolError::Violation(
                    "session expiry set on DISCONNECT after zero at CONNECT",
                ));
            }
            let secs = max_session_expiry.map_or(secs, |max| secs.min(max));
            if let Some(session) = st.sessions.get_mut(&ctx.client_id) {
                session.session_expiry = SessionExpiry::from_secs(secs);
            }
        }

        let reason = if disconnect.reason_code == ReasonCode::DisconnectWithWill {
            DisconnectReason::NormalWithWill
        } else {
            DisconnectReason::Normal
        };
        debug!(client_id = %ctx.client_id, reason = %disconnect.reason_code, "DISCONNECT");
        ctx.disconnect = Some(reason);
        Ok(Flow::Close)
    }

    /// Mark the session disconnected: publish or schedule the will, drop a
    /// zero-expiry session and mirror the change to storage and the cluster
    pub(crate) fn detach_session(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        reason: DisconnectReason,
        now: Instant,
    ) {
        let publish_will = !matches!(
            reason,
            DisconnectReason::Normal | DisconnectReason::TakenOver
        );
        let Some(session) = st.sessions.get_mut(client_id) else {
            return;
        };
        if let Some(connection) = session.connection {
            st.links.remove(&connection);
        }
        let will = session.detach(now, publish_will);
        let expiry = session.session_expiry;

        info!(client_id = %client_id, ?reason, "client disconnected");
        self.emit(BrokerEvent::ClientDisconnected {
            client_id: client_id.clone(),
            reason,
        });
        if let Some(will) = will {
            self.publish_will(st, client_id, will, now);
        }

        if expiry.is_zero() {
            self.end_session(st, client_id, now);
            return;
        }
        self.replicate(ClusterMessage::SessionUpdate(SessionHeader {
            client_id: client_id.to_string(),
            node_id: self.node_id().to_string(),
            connected: false,
            session_expiry: expiry.as_secs(),
        }));
        self.persist_session(st, client_id, now);
    }

    /// Drop a session whose expiry elapsed while disconnected
    pub(crate) fn expire_session(&self, st: &mut BrokerState, client_id: &Arc<str>, now: Instant) {
        debug!(client_id = %client_id, "session expired");
        self.emit(BrokerEvent::SessionExpired {
            client_id: client_id.clone(),
        });
        self.end_session(st, client_id, now);
    }

    /// Remove a session for good. A will still waiting on its delay is
    /// published now, since the session ends first.
    fn end_session(&self, st: &mut BrokerState, client_id: &Arc<str>, now: Instant) {
        let Some(mut session) = st.remove_session(client_id) else {
            return;
        };
        if let Some(will) = session.take_delayed_will() {
            self.publish_will(st, client_id, will, now);
        }
        self.replicate(ClusterMessage::SessionUpdate(SessionHeader {
            client_id: client_id.to_string(),
            node_id: self.node_id().to_string(),
            connected: false,
            session_expiry: 0,
        }));
        self.persist(PersistenceOp::DeleteSession {
            client_id: client_id.to_string(),
        });
    }
}
