//! Shared broker state
//!
//! Only ever touched through the broker's mutex.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::BytesMut;
use smallvec::SmallVec;
use tracing::{trace, warn};

use super::{ConnectionId, RetainedStore, Transport};
use crate::cluster::ReplicaTable;
use crate::codec::Encoder;
use crate::protocol::{Packet, ProtocolVersion, Publish, QoS};
use crate::session::Session;
use crate::topic::TopicMatcher;

/// An attached connection as seen from the state: its transport and the
/// encoder for the generation it negotiated
#[derive(Debug, Clone)]
pub struct Link {
    pub client_id: Arc<str>,
    pub transport: Arc<dyn Transport>,
    pub encoder: Encoder,
}

impl Link {
    pub fn send_packet(&self, packet: &Packet) {
        let mut buf = BytesMut::new();
        match self.encoder.encode(packet, &mut buf) {
            Ok(()) => self.transport.send(buf.freeze()),
            Err(e) => warn!(client_id = %self.client_id, "failed to encode {:?}: {}", packet.packet_type(), e),
        }
    }
}

/// One delivery target resolved from the matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub client_id: Arc<str>,
    pub qos: QoS,
    pub retain_as_published: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

#[derive(Debug, Default)]
pub struct BrokerState {
    pub sessions: AHashMap<Arc<str>, Session>,
    /// Trie value is the filter as subscribed, the key into
    /// `Session::subscriptions`
    pub matcher: TopicMatcher<Arc<str>>,
    pub retained: RetainedStore,
    pub links: AHashMap<ConnectionId, Link>,
    pub replicas: ReplicaTable,
    /// Creation counter for subscriptions (first-seen order)
    pub subscription_seq: u64,
    /// Logical clock stamped on shared-group members when picked
    pub dispatch_clock: u64,
    /// Counter for server-assigned client identifiers
    pub assigned_ids: u64,
}

impl BrokerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link currently attached to `client_id`, if it is connected
    pub fn link_for(&self, client_id: &str) -> Option<&Link> {
        let connection = self.sessions.get(client_id)?.connection?;
        self.links.get(&connection)
    }

    /// Encode and queue `packet` on the connection attached to `client_id`
    pub fn send_to(&self, client_id: &str, packet: &Packet) -> bool {
        match self.link_for(client_id) {
            Some(link) => {
                link.send_packet(packet);
                true
            }
            None => false,
        }
    }

    /// Resolve every session that should receive a message on `topic`.
    ///
    /// Overlapping non-shared subscriptions of one client collapse into a
    /// single target at the highest QoS, carrying all their identifiers.
    /// Each share group yields exactly one member: the connected one picked
    /// longest ago, ties going to the earliest subscription.
    pub fn targets(&mut self, topic: &str, origin: Option<&str>) -> Vec<Target> {
        let matched: Vec<(Arc<str>, bool, Arc<str>)> = self
            .matcher
            .matches(topic)
            .into_iter()
            .map(|(key, raw)| (key.client_id.clone(), key.share_group.is_some(), raw.clone()))
            .collect();

        let mut targets: Vec<Target> = Vec::new();
        let mut by_client: AHashMap<Arc<str>, usize> = AHashMap::new();
        let mut groups: Vec<(Arc<str>, Vec<Arc<str>>)> = Vec::new();

        for (client_id, shared, raw) in matched {
            let Some(sub) = self
                .sessions
                .get(&client_id)
                .and_then(|s| s.subscriptions.get(&raw))
            else {
                continue;
            };

            if shared {
                match groups.iter_mut().find(|(g, _)| *g == raw) {
                    Some((_, members)) => members.push(client_id),
                    None => groups.push((raw, vec![client_id])),
                }
                continue;
            }

            if sub.no_local && origin == Some(&*client_id) {
                continue;
            }
            match by_client.get(&client_id) {
                Some(&i) => {
                    let t = &mut targets[i];
                    t.qos = t.qos.max(sub.qos);
                    t.retain_as_published |= sub.retain_as_published;
                    t.subscription_ids.extend(sub.subscription_id);
                }
                None => {
                    by_client.insert(client_id.clone(), targets.len());
                    targets.push(Target {
                        client_id,
                        qos: sub.qos,
                        retain_as_published: sub.retain_as_published,
                        subscription_ids: sub.subscription_id.into_iter().collect(),
                    });
                }
            }
        }

        for (raw, members) in groups {
            if let Some(target) = self.pick_shared(&raw, &members) {
                targets.push(target);
            }
        }
        targets
    }

    fn pick_shared(&mut self, raw: &Arc<str>, members: &[Arc<str>]) -> Option<Target> {
        let chosen = members
            .iter()
            .filter_map(|client_id| {
                let session = self.sessions.get(client_id)?;
                let sub = session.subscriptions.get(raw)?;
                Some((
                    (!session.connected, sub.last_shared_dispatch, sub.seq),
                    client_id,
                ))
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, client_id)| client_id.clone())?;

        self.dispatch_clock += 1;
        let clock = self.dispatch_clock;
        let sub = self.sessions.get_mut(&chosen)?.subscriptions.get_mut(raw)?;
        sub.last_shared_dispatch = Some(clock);
        trace!(group = %raw, client_id = %chosen, "shared dispatch");
        Some(Target {
            client_id: chosen,
            qos: sub.qos,
            retain_as_published: sub.retain_as_published,
            subscription_ids: sub.subscription_id.into_iter().collect(),
        })
    }

    /// Hand `publish` to the session of `client_id` and write it out if the
    /// session releases it immediately
    pub fn deliver(&mut self, client_id: &str, publish: Publish) -> Delivery {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return Delivery::NoSession;
        };
        let Some(publish) =
            fit_packet_size(publish, session.protocol_version, session.max_packet_size)
        else {
            return Delivery::TooLarge;
        };
        let offline_qos0 = !session.connected && publish.qos == QoS::AtMostOnce;
        match session.deliver(publish) {
            Some(out) => {
                if let Some(link) = session.connection.and_then(|c| self.links.get(&c)) {
                    link.send_packet(&Packet::Publish(out));
                }
                Delivery::Sent
            }
            None if offline_qos0 => Delivery::Offline,
            None => Delivery::Queued,
        }
    }

    /// Remove a session and every trie entry it owns
    pub fn remove_session(&mut self, client_id: &str) -> Option<Session> {
        let session = self.sessions.remove(client_id)?;
        self.matcher.remove_client(client_id);
        Some(session)
    }

    pub fn next_assigned_id(&mut self, node_id: &str) -> String {
        self.assigned_ids += 1;
        format!("{}-{:x}", node_id, self.assigned_ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held in the session queue (offline or window full)
    Queued,
    Offline,
    TooLarge,
    NoSession,
}

/// Shrink `publish` to the client's maximum packet size by dropping user
/// properties, then the request/response properties. `None` if it still
/// does not fit.
pub fn fit_packet_size(
    publish: Publish,
    version: ProtocolVersion,
    max: Option<u32>,
) -> Option<Publish> {
    let Some(max) = max else {
        return Some(publish);
    };
    let encoder = Encoder::new(version);
    let placeholder = publish.qos != QoS::AtMostOnce && publish.packet_id.is_none();
    let mut packet = Packet::Publish(publish);
    if let Packet::Publish(p) = &mut packet {
        if placeholder {
            p.packet_id = Some(1);
        }
    }

    let mut level = 0;
    while !encoder
        .encoded_len(&packet)
        .is_ok_and(|n| n <= max as usize)
    {
        let Packet::Publish(p) = &mut packet else {
            return None;
        };
        match level {
            0 => p.properties.user_properties.clear(),
            1 => {
                p.properties.content_type = None;
                p.properties.response_topic = None;
                p.properties.correlation_data = None;
            }
            _ => return None,
        }
        level += 1;
    }

    match packet {
        Packet::Publish(mut p) => {
            if placeholder {
                p.packet_id = None;
            }
            Some(p)
        }
        _ => None,
    }
}
