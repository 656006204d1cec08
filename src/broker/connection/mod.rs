//! MQTT Connection Handler
//!
//! [`ClientConnection`] is the broker's view of one transport connection:
//! its framer, the transport handle and the negotiated client context. The
//! driver feeds raw bytes into [`Broker::receive`]; each decoded frame is
//! handled under the broker lock by the per-packet modules below. When the
//! transport goes away the driver calls [`Broker::connection_lost`].

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::{Broker, BrokerState, ConnectionId, DisconnectReason, Transport};
use crate::codec::{Encoder, FrameError, PacketFramer};
use crate::protocol::{ConnAck, Disconnect, Packet, ProtocolError, ProtocolVersion, ReasonCode};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    /// Undecodable input; the reason code was sent if the generation allows
    Frame(FrameError),
    /// Well-formed input the broker refused; closed with a reason code
    Protocol(ProtocolError),
    /// No CONNECT within the connect timeout
    ConnectTimeout,
    Shutdown,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Frame(e) => write!(f, "Frame error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::ConnectTimeout => write!(f, "CONNECT timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Frame(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// What the driver should do after a call into the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush what is buffered and close
    Close,
}

/// Client context established by a successful CONNECT
#[derive(Debug)]
pub(crate) struct ClientContext {
    pub client_id: Arc<str>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub version: ProtocolVersion,
    pub encoder: Encoder,
    /// Inbound topic aliases (v5)
    pub topic_aliases: AHashMap<u16, Arc<str>>,
    /// Set when the client's DISCONNECT settled the will
    pub disconnect: Option<DisconnectReason>,
    /// Session expiry was zero at CONNECT; DISCONNECT may not raise it
    pub zero_expiry_at_connect: bool,
}

#[derive(Debug)]
pub(crate) enum Phase {
    AwaitingConnect,
    Active(ClientContext),
    Closed,
}

pub struct ClientConnection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    framer: PacketFramer,
    pub(crate) phase: Phase,
}

impl ClientConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> Option<&Arc<str>> {
        match &self.phase {
            Phase::Active(ctx) => Some(&ctx.client_id),
            _ => None,
        }
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        match &self.phase {
            Phase::Active(ctx) => Some(ctx.version),
            _ => self.framer.protocol_version(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed) || self.transport.is_closed()
    }

    /// Encode `packet` for this connection's generation and queue it
    pub(crate) fn send(&self, packet: &Packet) {
        let version = self.protocol_version().unwrap_or(ProtocolVersion::V311);
        let mut buf = BytesMut::new();
        match Encoder::new(version).encode(packet, &mut buf) {
            Ok(()) => self.transport.send(buf.freeze()),
            Err(e) => debug!(connection = %self.id, "failed to encode {:?}: {}", packet.packet_type(), e),
        }
    }

    pub(crate) fn context(&self) -> Option<&ClientContext> {
        match &self.phase {
            Phase::Active(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub(crate) fn context_mut(&mut self) -> Option<&mut ClientContext> {
        match &mut self.phase {
            Phase::Active(ctx) => Some(ctx),
            _ => None,
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("client_id", &self.client_id())
            .finish()
    }
}

impl Broker {
    /// Register a new transport connection
    pub fn accept(&self, transport: Arc<dyn Transport>) -> ClientConnection {
        let id = self.next_connection_id();
        trace!(connection = %id, "accepted");
        ClientConnection {
            id,
            transport,
            framer: PacketFramer::new(self.config.max_packet_size),
            phase: Phase::AwaitingConnect,
        }
    }

    /// Feed bytes read from the transport. Frames are handled one at a time,
    /// each under the broker lock.
    pub fn receive(
        &self,
        conn: &mut ClientConnection,
        data: &[u8],
        now: Instant,
    ) -> Result<Flow, ConnectionError> {
        if matches!(conn.phase, Phase::Closed) {
            return Ok(Flow::Close);
        }
        conn.framer.push(data);
        loop {
            let packet = match conn.framer.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(Flow::Continue),
                Err(e) => {
                    debug!(connection = %conn.id, "frame error: {}", e);
                    self.abort(conn, e.reason_code(), now);
                    return Err(e.into());
                }
            };
            match self.handle_packet(conn, packet, now) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => {
                    conn.transport.close();
                    return Ok(Flow::Close);
                }
                Err(e) => {
                    debug!(connection = %conn.id, "protocol error: {}", e);
                    self.abort(conn, e.reason_code(), now);
                    return Err(e.into());
                }
            }
        }
    }

    fn handle_packet(
        &self,
        conn: &mut ClientConnection,
        packet: Packet,
        now: Instant,
    ) -> Result<Flow, ProtocolError> {
        let mut st = self.lock();
        trace!(connection = %conn.id, packet = ?packet.packet_type(), "inbound");

        let client_id = match &conn.phase {
            Phase::Closed => return Ok(Flow::Close),
            Phase::AwaitingConnect => {
                return match packet {
                    Packet::Connect(connect) => self.handle_connect(&mut st, conn, *connect, now),
                    _ => Err(ProtocolError::Violation("first packet must be CONNECT")),
                };
            }
            Phase::Active(ctx) => ctx.client_id.clone(),
        };

        // A connection whose session was taken over only waits to be closed
        match st.sessions.get_mut(&client_id) {
            Some(session) if session.connection == Some(conn.id) => session.touch(now),
            _ => return Ok(Flow::Close),
        }

        match packet {
            Packet::Connect(_) => Err(ProtocolError::Violation("second CONNECT")),
            Packet::Publish(publish) => self.handle_publish(&mut st, conn, publish, now),
            Packet::PubAck(ack) => self.handle_puback(&mut st, conn, ack.packet_id),
            Packet::PubRec(rec) => self.handle_pubrec(&mut st, conn, rec.packet_id, rec.reason_code),
            Packet::PubRel(rel) => self.handle_pubrel(&mut st, conn, rel.packet_id, now),
            Packet::PubComp(comp) => self.handle_pubcomp(&mut st, conn, comp.packet_id),
            Packet::Subscribe(sub) => self.handle_subscribe(&mut st, conn, sub, now),
            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(&mut st, conn, unsub, now),
            Packet::PingReq => {
                conn.send(&Packet::PingResp);
                Ok(Flow::Continue)
            }
            Packet::Disconnect(d) => self.handle_disconnect(&mut st, conn, d),
            Packet::Auth(_) => Err(ProtocolError::Unsupported(ReasonCode::BadAuthenticationMethod)),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ProtocolError::Violation("server-to-client packet"))
            }
        }
    }

    /// Report `reason` to the peer where the generation allows it and close
    fn abort(&self, conn: &mut ClientConnection, reason: ReasonCode, now: Instant) {
        match &conn.phase {
            Phase::Active(ctx) if ctx.version.is_v5() => {
                conn.send(&Packet::Disconnect(Disconnect::new(reason)));
            }
            Phase::AwaitingConnect => match conn.framer.protocol_version() {
                Some(ProtocolVersion::V5) => conn.send(&Packet::ConnAck(ConnAck {
                    reason_code: reason,
                    ..Default::default()
                })),
                _ if reason == ReasonCode::UnsupportedProtocolVersion => {
                    conn.send(&Packet::ConnAck(ConnAck {
                        reason_code: reason,
                        ..Default::default()
                    }))
                }
                _ => {}
            },
            _ => {}
        }
        if let Some(ctx) = conn.context_mut() {
            ctx.disconnect.get_or_insert(DisconnectReason::ProtocolError(reason));
        }
        conn.transport.close();
        self.connection_lost(conn, now);
    }

    /// The transport closed. Marks the session disconnected, publishes or
    /// schedules the will and drops a zero-expiry session. A connection
    /// that no longer owns its session (taken over) changes nothing.
    pub fn connection_lost(&self, conn: &mut ClientConnection, now: Instant) {
        let phase = std::mem::replace(&mut conn.phase, Phase::Closed);
        let Phase::Active(ctx) = phase else {
            return;
        };
        let reason = ctx.disconnect.unwrap_or(DisconnectReason::ConnectionLost);
        let mut st = self.lock();
        st.links.remove(&conn.id);

        let owns_session = st
            .sessions
            .get(&ctx.client_id)
            .is_some_and(|s| s.connection == Some(conn.id));
        if !owns_session {
            trace!(client_id = %ctx.client_id, connection = %conn.id, "stale connection closed");
            return;
        }
        self.detach_session(&mut st, &ctx.client_id, reason, now);
    }

    /// Forcibly close the connection attached to `client_id`, as for a
    /// keep-alive timeout or a cluster takeover
    pub(crate) fn drop_connection(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        reason: DisconnectReason,
        detach: bool,
        now: Instant,
    ) {
        let connection = st.sessions.get(client_id).and_then(|s| s.connection);
        if let Some(link) = connection.and_then(|c| st.links.remove(&c)) {
            let code = match reason {
                DisconnectReason::KeepAliveTimeout => Some(ReasonCode::KeepAliveTimeout),
                DisconnectReason::TakenOver => Some(ReasonCode::SessionTakenOver),
                DisconnectReason::ServerShutdown => Some(ReasonCode::ServerShuttingDown),
                DisconnectReason::ProtocolError(rc) => Some(rc),
                _ => None,
            };
            if let Some(code) = code.filter(|_| link.encoder.version().is_v5()) {
                link.send_packet(&Packet::Disconnect(Disconnect::new(code)));
            }
            link.transport.close();
        }
        if detach {
            self.detach_session(st, client_id, reason, now);
        }
    }
}
