//! Serializable data models for persistence.
//!
//! Storage-friendly mirrors of runtime types, encoded with bincode. Monotonic
//! instants are stored as Unix seconds and mapped back relative to the
//! restoring process's clock.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

use crate::broker::RetainedMessage;
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS, SubscriptionOptions, Will};
use crate::session::{DeliveryState, InFlight, Session, SessionExpiry, Subscription};

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub publish: StoredPublish,
    pub origin: Option<String>,
    /// Unix timestamp in seconds when the message was stored
    pub stored_at_secs: u64,
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub protocol_version: u8,
    pub session_expiry_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    pub queued: Vec<StoredPublish>,
    pub in_flight: Vec<StoredInFlight>,
    pub will: Option<StoredWill>,
    /// Unix timestamp when disconnected; `None` while connected
    pub disconnected_at_secs: Option<u64>,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredSubscription {
    /// Filter as subscribed, share prefix included
    pub filter: String,
    /// v5 options byte
    pub options: u8,
    pub subscription_id: Option<u32>,
    pub seq: u64,
}

/// Stored QoS 1/2 handshake record
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredInFlight {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = sent, 1 = acknowledged (inbound), 2 = release sent
    pub state: u8,
    pub order: u64,
}

/// Stored publish message
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: StoredProperties,
}

/// Stored will message
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
}

/// Message properties that travel with a stored publish or will
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub will_delay_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

// ============================================================================
// Clock conversion
// ============================================================================

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wall-clock seconds for `instant`, taking `now` as the present
fn instant_to_unix_secs(instant: Instant, now: Instant) -> u64 {
    now_unix_secs().saturating_sub(now.saturating_duration_since(instant).as_secs())
}

/// Instant for wall-clock `secs`, taking `now` as the present; future
/// timestamps map to `now`
fn unix_secs_to_instant(secs: u64, now: Instant) -> Instant {
    let elapsed = Duration::from_secs(now_unix_secs().saturating_sub(secs));
    now.checked_sub(elapsed).unwrap_or(now)
}

// ============================================================================
// Conversions
// ============================================================================

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            will_delay_interval: props.will_delay_interval,
            user_properties: props.user_properties.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(bytes::Bytes::from),
            will_delay_interval: stored.will_delay_interval,
            user_properties: stored.user_properties,
            ..Default::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: StoredProperties::from(&publish.properties),
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: bytes::Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            dup: stored.dup,
            packet_id: stored.packet_id,
            properties: Properties::from(stored.properties),
        }
    }
}

impl From<&Will> for StoredWill {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.to_string(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
            properties: StoredProperties::from(&will.properties),
        }
    }
}

impl From<StoredWill> for Will {
    fn from(stored: StoredWill) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: bytes::Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            properties: Properties::from(stored.properties),
        }
    }
}

fn state_code(state: DeliveryState) -> u8 {
    match state {
        DeliveryState::Sent => 0,
        DeliveryState::Acknowledged => 1,
        DeliveryState::ReleaseSent => 2,
    }
}

impl StoredInFlight {
    fn capture(packet_id: u16, record: &InFlight) -> Self {
        Self {
            packet_id,
            publish: StoredPublish::from(&record.publish),
            state: state_code(record.state),
            order: record.order,
        }
    }

    pub fn delivery_state(&self) -> DeliveryState {
        match self.state {
            1 => DeliveryState::Acknowledged,
            2 => DeliveryState::ReleaseSent,
            _ => DeliveryState::Sent,
        }
    }
}

impl StoredSubscription {
    /// Runtime subscription, or `None` if the stored options byte is invalid
    pub fn to_subscription(&self) -> Option<Subscription> {
        let options = SubscriptionOptions::from_byte(self.options)?;
        let parsed = crate::topic::parse_filter(&self.filter, 0).ok()?;
        Some(Subscription {
            filter: Arc::from(parsed.filter),
            shared_group: parsed.share_group.map(Arc::from),
            qos: options.qos,
            no_local: options.no_local,
            retain_as_published: options.retain_as_published,
            retain_handling: options.retain_handling,
            subscription_id: self.subscription_id,
            last_shared_dispatch: None,
            seq: self.seq,
        })
    }
}

impl StoredSession {
    /// Snapshot `session` as of `now`
    pub fn capture(session: &Session, now: Instant) -> Self {
        let mut in_flight: Vec<StoredInFlight> = session
            .in_flight_out
            .iter()
            .chain(session.pending_release.iter())
            .chain(session.in_flight_in.iter())
            .map(|(id, record)| StoredInFlight::capture(*id, record))
            .collect();
        in_flight.sort_by_key(|r| r.order);

        Self {
            client_id: session.client_id.to_string(),
            protocol_version: session.protocol_version as u8,
            session_expiry_interval: session.session_expiry.as_secs(),
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(raw, sub)| StoredSubscription {
                    filter: raw.to_string(),
                    options: sub.options().to_byte(),
                    subscription_id: sub.subscription_id,
                    seq: sub.seq,
                })
                .collect(),
            queued: session.queued_messages().map(StoredPublish::from).collect(),
            in_flight,
            will: session.will.as_ref().map(StoredWill::from),
            disconnected_at_secs: session
                .disconnected_at
                .map(|at| instant_to_unix_secs(at, now)),
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_level(self.protocol_version).unwrap_or(ProtocolVersion::V5)
    }

    pub fn session_expiry(&self) -> SessionExpiry {
        SessionExpiry::from_secs(self.session_expiry_interval)
    }

    /// When the session lost its connection, in the restoring process's clock.
    /// A session stored while connected counts as disconnected at `now`.
    pub fn disconnected_at(&self, now: Instant) -> Instant {
        self.disconnected_at_secs
            .map(|secs| unix_secs_to_instant(secs, now))
            .unwrap_or(now)
    }
}

impl StoredRetainedMessage {
    pub fn capture(message: &RetainedMessage, now: Instant) -> Self {
        Self {
            publish: StoredPublish::from(&message.publish),
            origin: message.origin.as_deref().map(str::to_string),
            stored_at_secs: instant_to_unix_secs(message.stored_at, now),
        }
    }

    pub fn restore(self, now: Instant) -> RetainedMessage {
        RetainedMessage {
            publish: Publish::from(self.publish),
            origin: self.origin.map(Arc::from),
            stored_at: unix_secs_to_instant(self.stored_at_secs, now),
        }
    }
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionId;
    use crate::protocol::RetainHandling;
    use crate::session::Attachment;
    use pretty_assertions::assert_eq;

    fn publish(topic: &str, qos: QoS, id: Option<u16>) -> Publish {
        Publish {
            topic: Arc::from(topic),
            qos,
            packet_id: id,
            payload: bytes::Bytes::from_static(b"payload"),
            ..Default::default()
        }
    }

    #[test]
    fn session_capture_keeps_delivery_state() {
        let now = Instant::now();
        let mut session = Session::new(Arc::from("c1"), 10, now);
        session.attach(
            Attachment {
                connection: ConnectionId(1),
                protocol_version: ProtocolVersion::V5,
                keep_alive: 30,
                session_expiry: SessionExpiry::from_secs(300),
                will: None,
                receive_maximum: 10,
                max_packet_size: None,
            },
            now,
        );
        session.subscriptions.insert(
            Arc::from("$share/g/a/+"),
            Subscription {
                filter: Arc::from("a/+"),
                shared_group: Some(Arc::from("g")),
                qos: QoS::AtLeastOnce,
                no_local: false,
                retain_as_published: true,
                retain_handling: RetainHandling::Never,
                subscription_id: Some(3),
                last_shared_dispatch: Some(9),
                seq: 4,
            },
        );
        session.restore_in_flight(5, publish("a/b", QoS::ExactlyOnce, Some(5)), DeliveryState::ReleaseSent);
        session.restore_in_flight(6, publish("a/c", QoS::AtLeastOnce, Some(6)), DeliveryState::Sent);

        let stored = StoredSession::capture(&session, now);
        assert_eq!(stored.session_expiry_interval, 300);
        assert_eq!(stored.protocol_version(), ProtocolVersion::V5);
        assert_eq!(stored.disconnected_at_secs, None);
        assert_eq!(
            stored.in_flight.iter().map(|r| (r.packet_id, r.delivery_state())).collect::<Vec<_>>(),
            vec![(5, DeliveryState::ReleaseSent), (6, DeliveryState::Sent)]
        );

        let sub = stored.subscriptions[0].to_subscription().unwrap();
        assert_eq!(&*sub.filter, "a/+");
        assert_eq!(sub.shared_group.as_deref(), Some("g"));
        assert_eq!(sub.retain_handling, RetainHandling::Never);
        assert_eq!(sub.subscription_id, Some(3));
        assert_eq!(sub.seq, 4);
        assert_eq!(sub.last_shared_dispatch, None);
    }

    #[test]
    fn retained_capture_preserves_age() {
        let now = Instant::now();
        let stored_at = now.checked_sub(Duration::from_secs(30)).unwrap_or(now);
        let message = RetainedMessage {
            publish: publish("sensors/t", QoS::AtLeastOnce, None),
            origin: Some(Arc::from("c1")),
            stored_at,
        };
        let restored = StoredRetainedMessage::capture(&message, now).restore(now);
        let age = now.saturating_duration_since(restored.stored_at).as_secs();
        assert!((29..=31).contains(&age), "age {}", age);
        assert_eq!(restored.origin.as_deref(), Some("c1"));
        assert_eq!(restored.publish, message.publish);
    }

    #[test]
    fn invalid_options_byte_is_skipped() {
        let stored = StoredSubscription {
            filter: "a".to_string(),
            options: 0xFF,
            subscription_id: None,
            seq: 0,
        };
        assert!(stored.to_subscription().is_none());
    }
}
