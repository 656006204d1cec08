//! QoS acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use super::{ClientConnection, Flow};
use crate::broker::{Broker, BrokerState};
use crate::protocol::{Packet, ProtocolError, PubComp, ReasonCode};
use crate::session::Session;

impl Broker {
    pub(super) fn handle_puback(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        packet_id: u16,
    ) -> Result<Flow, ProtocolError> {
        self.with_session(st, conn, |s| s.handle_puback(packet_id))
    }

    pub(super) fn handle_pubrec(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        packet_id: u16,
        reason: ReasonCode,
    ) -> Result<Flow, ProtocolError> {
        self.with_session(st, conn, |s| s.handle_pubrec(packet_id, reason))
    }

    pub(super) fn handle_pubcomp(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        packet_id: u16,
    ) -> Result<Flow, ProtocolError> {
        self.with_session(st, conn, |s| s.handle_pubcomp(packet_id))
    }

    /// PUBREL releases a stored inbound QoS 2 message for routing. An
    /// unknown id still gets its PUBCOMP.
    pub(super) fn handle_pubrel(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        packet_id: u16,
        now: Instant,
    ) -> Result<Flow, ProtocolError> {
        let Some(client_id) = conn.client_id().cloned() else {
            return Err(ProtocolError::Violation("PUBREL before CONNECT"));
        };
        let released = st
            .sessions
            .get_mut(&client_id)
            .and_then(|s| s.handle_pubrel(packet_id));

        let pubcomp = match released {
            Some(publish) => {
                trace!(client_id = %client_id, packet_id, "QoS 2 message released");
                self.route(st, publish, Some(&*client_id), false, now);
                PubComp::new(packet_id)
            }
            None => {
                trace!(client_id = %client_id, packet_id, "PUBREL for unknown packet id");
                PubComp::with_reason(packet_id, ReasonCode::PacketIdNotFound)
            }
        };
        conn.send(&Packet::PubComp(pubcomp));
        Ok(Flow::Continue)
    }

    /// Apply `f` to the connection's session and write out whatever it
    /// returns: PUBRELs and messages released from the queue
    fn with_session(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        f: impl FnOnce(&mut Session) -> Vec<Packet>,
    ) -> Result<Flow, ProtocolError> {
        let Some(client_id): Option<Arc<str>> = conn.client_id().cloned() else {
            return Err(ProtocolError::Violation("acknowledgement before CONNECT"));
        };
        let Some(session) = st.sessions.get_mut(&client_id) else {
            return Ok(Flow::Close);
        };
        let packets = f(session);
        for packet in &packets {
            st.send_to(&client_id, packet);
        }
        Ok(Flow::Continue)
    }
}
