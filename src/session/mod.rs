//! Per-client session state
//!
//! A [`Session`] outlives the connections that attach to it. It owns the
//! client's subscriptions, the QoS 1/2 handshake records in both
//! directions, the offline queue and the last-will schedule. Nothing here
//! performs I/O: operations return the packets that should be written and
//! the broker pushes them to whichever transport currently owns the
//! session.


use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::broker::ConnectionId;
use crate::protocol::{
    Packet, ProtocolVersion, PubRel, Publish, QoS, ReasonCode, RetainHandling,
    SubscriptionOptions, Will,
};

/// Session expiry interval value meaning "never expire"
pub const NEVER_EXPIRE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExpiry {
    Never,
    /// Zero destroys the session as soon as it disconnects
    After(Duration),
}

impl SessionExpiry {
    pub fn from_secs(secs: u32) -> Self {
        if secs == NEVER_EXPIRE {
            SessionExpiry::Never
        } else {
            SessionExpiry::After(Duration::from_secs(secs as u64))
        }
    }

    pub fn as_secs(self) -> u32 {
        match self {
            SessionExpiry::Never => NEVER_EXPIRE,
            SessionExpiry::After(d) => d.as_secs().min((NEVER_EXPIRE - 1) as u64) as u32,
        }
    }

    pub fn is_zero(self) -> bool {
        matches!(self, SessionExpiry::After(d) if d.is_zero())
    }

    /// Cap a duration at the expiry interval
    pub fn cap(self, d: Duration) -> Duration {
        match self {
            SessionExpiry::Never => d,
            SessionExpiry::After(e) => d.min(e),
        }
    }
}

/// Handshake position of an in-flight record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Outbound PUBLISH written, awaiting PUBACK or PUBREC
    Sent,
    /// Inbound QoS 2 PUBLISH answered with PUBREC, awaiting PUBREL
    Acknowledged,
    /// Outbound PUBREL written, awaiting PUBCOMP
    ReleaseSent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub publish: Publish,
    pub state: DeliveryState,
    /// Send order, used to retransmit in the original sequence
    pub order: u64,
}

/// One subscription owned by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Filter indexed in the topic matcher (share prefix removed)
    pub filter: Arc<str>,
    pub shared_group: Option<Arc<str>>,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
    pub subscription_id: Option<u32>,
    /// Broker dispatch clock when this member was last picked for its
    /// share group; `None` sorts first
    pub last_shared_dispatch: Option<u64>,
    /// Broker-wide creation counter; breaks shared-dispatch ties
    pub seq: u64,
}

impl Subscription {
    pub fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            qos: self.qos,
            no_local: self.no_local,
            retain_as_published: self.retain_as_published,
            retain_handling: self.retain_handling,
        }
    }
}

/// Parameters negotiated by a CONNECT
#[derive(Debug, Clone)]
pub struct Attachment {
    pub connection: ConnectionId,
    pub protocol_version: ProtocolVersion,
    pub keep_alive: u16,
    pub session_expiry: SessionExpiry,
    pub will: Option<Will>,
    /// Client's receive maximum: outbound QoS 1/2 window
    pub receive_maximum: u16,
    /// Client's maximum packet size
    pub max_packet_size: Option<u32>,
}

#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    pub connected: bool,
    /// Connection currently attached, if any
    pub connection: Option<ConnectionId>,
    pub protocol_version: ProtocolVersion,
    pub will: Option<Will>,
    /// Seconds; zero disables the check
    pub keep_alive: u16,
    pub session_expiry: SessionExpiry,
    pub disconnected_at: Option<Instant>,
    pub last_activity: Instant,
    /// Keyed by the filter exactly as subscribed, share prefix included
    pub subscriptions: AHashMap<Arc<str>, Subscription>,
    pub in_flight_out: AHashMap<u16, InFlight>,
    pub pending_release: AHashMap<u16, InFlight>,
    pub in_flight_in: AHashMap<u16, InFlight>,
    pub receive_maximum: u16,
    pub max_packet_size: Option<u32>,
    queue: VecDeque<Publish>,
    max_queued: usize,
    dropped: u64,
    next_packet_id: u16,
    send_order: u64,
    delayed_will: Option<(Instant, Will)>,
}

impl Session {
    pub fn new(client_id: Arc<str>, max_queued: usize, now: Instant) -> Self {
        Self {
            client_id,
            connected: false,
            connection: None,
            protocol_version: ProtocolVersion::V5,
            will: None,
            keep_alive: 0,
            session_expiry: SessionExpiry::After(Duration::ZERO),
            disconnected_at: Some(now),
            last_activity: now,
            subscriptions: AHashMap::new(),
            in_flight_out: AHashMap::new(),
            pending_release: AHashMap::new(),
            in_flight_in: AHashMap::new(),
            receive_maximum: u16::MAX,
            max_packet_size: None,
            queue: VecDeque::new(),
            max_queued,
            dropped: 0,
            next_packet_id: 1,
            send_order: 0,
            delayed_will: None,
        }
    }

    /// Bind a new connection. Any delayed will from the previous connection
    /// is cancelled.
    pub fn attach(&mut self, a: Attachment, now: Instant) {
        self.connected = true;
        self.connection = Some(a.connection);
        self.protocol_version = a.protocol_version;
        self.keep_alive = a.keep_alive;
        self.session_expiry = a.session_expiry;
        self.will = a.will;
        self.receive_maximum = a.receive_maximum.max(1);
        self.max_packet_size = a.max_packet_size;
        self.disconnected_at = None;
        self.last_activity = now;
        if self.delayed_will.take().is_some() {
            debug!(client_id = %self.client_id, "delayed will cancelled by reconnect");
        }
    }

    /// Mark the session disconnected. Returns the will if it must be
    /// published immediately; a delayed will is kept for [`Self::take_due_will`].
    pub fn detach(&mut self, now: Instant, publish_will: bool) -> Option<Publish> {
        self.connected = false;
        self.connection = None;
        self.disconnected_at = Some(now);

        let will = self.will.take()?;
        if !publish_will {
            trace!(client_id = %self.client_id, "will discarded");
            return None;
        }
        let delay = Duration::from_secs(will.properties.will_delay_interval.unwrap_or(0) as u64);
        let delay = self.session_expiry.cap(delay);
        if delay.is_zero() {
            Some(will.to_publish())
        } else {
            self.delayed_will = Some((now + delay, will));
            None
        }
    }

    pub fn take_due_will(&mut self, now: Instant) -> Option<Publish> {
        match &self.delayed_will {
            Some((due, _)) if *due <= now => self.delayed_will.take().map(|(_, w)| w.to_publish()),
            _ => None,
        }
    }

    /// Pending delayed will, regardless of its due time
    pub fn take_delayed_will(&mut self) -> Option<Publish> {
        self.delayed_will.take().map(|(_, w)| w.to_publish())
    }

    pub fn has_delayed_will(&self) -> bool {
        self.delayed_will.is_some()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        if self.connected {
            return false;
        }
        match (self.session_expiry, self.disconnected_at) {
            (SessionExpiry::Never, _) => false,
            (SessionExpiry::After(d), Some(at)) => now >= at + d,
            (SessionExpiry::After(_), None) => false,
        }
    }

    /// True once 1.5x the keep-alive has passed without inbound traffic
    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        if !self.connected || self.keep_alive == 0 {
            return false;
        }
        let limit = Duration::from_millis(self.keep_alive as u64 * 1500);
        now.saturating_duration_since(self.last_activity) > limit
    }

    fn id_in_use(&self, id: u16) -> bool {
        self.in_flight_out.contains_key(&id)
            || self.pending_release.contains_key(&id)
            || self.in_flight_in.contains_key(&id)
    }

    /// Allocate an outbound packet id, skipping ids held by any record.
    /// `None` when all 65535 are in use.
    pub fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.id_in_use(id) {
                return Some(id);
            }
        }
        None
    }

    fn window_open(&self) -> bool {
        self.in_flight_out.len() + self.pending_release.len() < self.receive_maximum as usize
    }

    fn record_out(&mut self, id: u16, mut publish: Publish) -> Publish {
        publish.packet_id = Some(id);
        self.send_order += 1;
        self.in_flight_out.insert(
            id,
            InFlight {
                publish: publish.clone(),
                state: DeliveryState::Sent,
                order: self.send_order,
            },
        );
        publish
    }

    fn enqueue(&mut self, publish: Publish) {
        if self.max_queued == 0 {
            self.dropped += 1;
            return;
        }
        if self.queue.len() >= self.max_queued {
            self.queue.pop_front();
            self.dropped += 1;
            debug!(client_id = %self.client_id, "offline queue full, dropped oldest message");
        }
        self.queue.push_back(publish);
    }

    /// Hand an outbound message to the session. Returns the PUBLISH to write
    /// now, or `None` if it was queued (or dropped: QoS 0 while offline).
    pub fn deliver(&mut self, mut publish: Publish) -> Option<Publish> {
        publish.dup = false;
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            if !self.connected {
                trace!(client_id = %self.client_id, "QoS 0 message dropped while offline");
                return None;
            }
            return Some(publish);
        }

        if !self.connected || !self.queue.is_empty() || !self.window_open() {
            self.enqueue(publish);
            return None;
        }
        match self.next_packet_id() {
            Some(id) => Some(self.record_out(id, publish)),
            None => {
                self.enqueue(publish);
                None
            }
        }
    }

    /// Release queued messages as far as the client's window allows
    pub fn drain_queue(&mut self) -> Vec<Publish> {
        let mut out = Vec::new();
        if !self.connected {
            return out;
        }
        while let Some(publish) = self.queue.pop_front() {
            if publish.qos == QoS::AtMostOnce {
                out.push(publish);
                continue;
            }
            if !self.window_open() {
                self.queue.push_front(publish);
                break;
            }
            match self.next_packet_id() {
                Some(id) => out.push(self.record_out(id, publish)),
                None => {
                    self.queue.push_front(publish);
                    break;
                }
            }
        }
        out
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Messages dropped because the offline queue overflowed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn queued_messages(&self) -> impl Iterator<Item = &Publish> {
        self.queue.iter()
    }

    /// PUBACK from the client completes a QoS 1 delivery
    pub fn handle_puback(&mut self, id: u16) -> Vec<Packet> {
        match self.in_flight_out.get(&id) {
            Some(r) if r.publish.qos == QoS::AtLeastOnce => {
                self.in_flight_out.remove(&id);
            }
            _ => {
                debug!(client_id = %self.client_id, packet_id = id, "PUBACK for unknown packet id");
                return Vec::new();
            }
        }
        self.drain_queue().into_iter().map(Packet::Publish).collect()
    }

    /// PUBREC from the client: answer with PUBREL and move the record to
    /// `pending_release`. An error reason code ends the exchange.
    pub fn handle_pubrec(&mut self, id: u16, reason: ReasonCode) -> Vec<Packet> {
        let record = match self.in_flight_out.remove(&id) {
            Some(r) if r.publish.qos == QoS::ExactlyOnce => r,
            Some(r) => {
                debug!(client_id = %self.client_id, packet_id = id, "PUBREC for a QoS 1 delivery");
                self.in_flight_out.insert(id, r);
                return Vec::new();
            }
            None if self.pending_release.contains_key(&id) => {
                return vec![Packet::PubRel(PubRel::new(id))];
            }
            None => {
                return vec![Packet::PubRel(PubRel::with_reason(
                    id,
                    ReasonCode::PacketIdNotFound,
                ))];
            }
        };

        if reason.is_error() {
            debug!(client_id = %self.client_id, packet_id = id, %reason, "delivery refused by client");
            return self.drain_queue().into_iter().map(Packet::Publish).collect();
        }

        self.pending_release.insert(
            id,
            InFlight {
                state: DeliveryState::ReleaseSent,
                ..record
            },
        );
        vec![Packet::PubRel(PubRel::new(id))]
    }

    /// PUBCOMP from the client completes a QoS 2 delivery
    pub fn handle_pubcomp(&mut self, id: u16) -> Vec<Packet> {
        if self.pending_release.remove(&id).is_none() {
            debug!(client_id = %self.client_id, packet_id = id, "PUBCOMP for unknown packet id");
            return Vec::new();
        }
        self.drain_queue().into_iter().map(Packet::Publish).collect()
    }

    /// Record an inbound QoS 2 PUBLISH. Returns false for a duplicate of a
    /// message still awaiting PUBREL; PUBREC is due either way.
    pub fn receive_qos2(&mut self, publish: Publish) -> bool {
        let Some(id) = publish.packet_id else {
            return false;
        };
        if self.in_flight_in.contains_key(&id) {
            return false;
        }
        self.in_flight_in.insert(
            id,
            InFlight {
                publish,
                state: DeliveryState::Acknowledged,
                order: 0,
            },
        );
        true
    }

    /// PUBREL from the client releases the stored message exactly once
    pub fn handle_pubrel(&mut self, id: u16) -> Option<Publish> {
        self.in_flight_in.remove(&id).map(|r| r.publish)
    }

    /// Packets owed to a client that resumed this session: unacknowledged
    /// PUBLISHes with DUP set and PUBRELs in original order, then whatever
    /// the window lets out of the queue.
    pub fn resume(&mut self) -> Vec<Packet> {
        let mut records: Vec<&InFlight> = self
            .in_flight_out
            .values()
            .chain(self.pending_release.values())
            .collect();
        records.sort_by_key(|r| r.order);

        let mut out: Vec<Packet> = records
            .into_iter()
            .map(|r| match r.state {
                DeliveryState::ReleaseSent => {
                    Packet::PubRel(PubRel::new(r.publish.packet_id.unwrap_or_default()))
                }
                _ => {
                    let mut p = r.publish.clone();
                    p.dup = true;
                    Packet::Publish(p)
                }
            })
            .collect();
        out.extend(self.drain_queue().into_iter().map(Packet::Publish));
        out
    }

    /// Restore an outbound record loaded from storage
    pub fn restore_in_flight(&mut self, id: u16, publish: Publish, state: DeliveryState) {
        self.send_order += 1;
        let record = InFlight {
            publish,
            state,
            order: self.send_order,
        };
        match state {
            DeliveryState::Sent => self.in_flight_out.insert(id, record),
            DeliveryState::ReleaseSent => self.pending_release.insert(id, record),
            DeliveryState::Acknowledged => self.in_flight_in.insert(id, record),
        };
    }

    pub fn restore_queued(&mut self, publish: Publish) {
        self.enqueue(publish);
    }

    /// Drop all delivery state; used by clean start
    pub fn reset(&mut self) {
        self.subscriptions.clear();
        self.in_flight_out.clear();
        self.pending_release.clear();
        self.in_flight_in.clear();
        self.queue.clear();
        self.delayed_will = None;
    }
}
