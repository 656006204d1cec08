//! Retained message store
//!
//! One entry per exact topic name. Entries carrying a message expiry
//! interval are dropped lazily when a lookup touches them and in bulk by
//! the periodic sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::Publish;
use crate::topic::topic_matches_filter;

#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub publish: Publish,
    /// Client that published it; `None` for server or cluster origin
    pub origin: Option<Arc<str>>,
    pub stored_at: Instant,
}

impl RetainedMessage {
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.publish.properties.message_expiry_interval {
            Some(secs) => now >= self.stored_at + Duration::from_secs(secs as u64),
            None => false,
        }
    }

    /// Copy for replay, with the expiry interval reduced by the time spent
    /// in the store
    pub fn replay(&self, now: Instant) -> Publish {
        let mut publish = self.publish.clone();
        if let Some(secs) = publish.properties.message_expiry_interval {
            let elapsed = now.saturating_duration_since(self.stored_at).as_secs();
            publish.properties.message_expiry_interval =
                Some(secs.saturating_sub(elapsed as u32).max(1));
        }
        publish.retain = true;
        publish.dup = false;
        publish.packet_id = None;
        publish
    }
}

/// Outcome of [`RetainedStore::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedChange {
    Stored,
    Cleared,
    /// Empty payload for a topic with nothing retained
    Unchanged,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    entries: AHashMap<Arc<str>, RetainedMessage>,
}

/// Result of [`RetainedStore::matching`]
#[derive(Debug, Default)]
pub struct RetainedMatch {
    pub messages: Vec<Publish>,
    /// Topics found expired and removed during the lookup
    pub expired: Vec<Arc<str>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `publish` for its topic, or clear the topic if the payload is empty
    pub fn apply(&mut self, publish: &Publish, origin: Option<Arc<str>>, now: Instant) -> RetainedChange {
        if publish.payload.is_empty() {
            return match self.entries.remove(&publish.topic) {
                Some(_) => RetainedChange::Cleared,
                None => RetainedChange::Unchanged,
            };
        }
        let mut stored = publish.clone();
        stored.dup = false;
        stored.packet_id = None;
        stored.retain = true;
        stored.properties.subscription_identifiers.clear();
        stored.properties.topic_alias = None;
        self.entries.insert(
            publish.topic.clone(),
            RetainedMessage {
                publish: stored,
                origin,
                stored_at: now,
            },
        );
        RetainedChange::Stored
    }

    /// Insert a message loaded from storage or received from a peer
    pub fn restore(&mut self, message: RetainedMessage) {
        self.entries.insert(message.publish.topic.clone(), message);
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.entries.get(topic)
    }

    pub fn remove(&mut self, topic: &str) -> Option<RetainedMessage> {
        self.entries.remove(topic)
    }

    /// Live messages whose topic matches the plain filter `filter`, ready
    /// for replay. Expired entries met on the way are dropped and reported.
    pub fn matching(&mut self, filter: &str, now: Instant) -> RetainedMatch {
        let mut expired = Vec::new();
        let mut out = Vec::new();
        for (topic, message) in &self.entries {
            if !topic_matches_filter(topic, filter) {
                continue;
            }
            if message.is_expired(now) {
                expired.push(topic.clone());
            } else {
                out.push(message.replay(now));
            }
        }
        for topic in &expired {
            self.entries.remove(topic);
        }
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        RetainedMatch {
            messages: out,
            expired,
        }
    }

    /// Drop every expired entry, returning the topics removed
    pub fn sweep(&mut self, now: Instant) -> Vec<Arc<str>> {
        let expired: Vec<Arc<str>> = self
            .entries
            .iter()
            .filter(|(_, m)| m.is_expired(now))
            .map(|(t, _)| t.clone())
            .collect();
        for topic in &expired {
            self.entries.remove(topic);
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetainedMessage> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use crate::protocol::{Properties, QoS};

    fn publish(topic: &str, payload: &'static [u8]) -> Publish {
        Publish {
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Arc::from(topic),
            packet_id: Some(9),
            payload: Bytes::from_static(payload),
            ..Default::default()
        }
    }

    #[test]
    fn one_entry_per_topic() {
        let now = Instant::now();
        let mut store = RetainedStore::new();
        assert_eq!(store.apply(&publish("a", b"1"), None, now), RetainedChange::Stored);
        assert_eq!(store.apply(&publish("a", b"2"), None, now), RetainedChange::Stored);
        assert_eq!(store.len(), 1);
        assert_eq!(&store.get("a").unwrap().publish.payload[..], b"2");
        assert_eq!(store.get("a").unwrap().publish.packet_id, None);
    }

    #[test]
    fn empty_payload_clears() {
        let now = Instant::now();
        let mut store = RetainedStore::new();
        store.apply(&publish("a/b", b"1"), None, now);
        assert_eq!(store.apply(&publish("a/b", b""), None, now), RetainedChange::Cleared);
        assert_eq!(store.apply(&publish("a/b", b""), None, now), RetainedChange::Unchanged);
        assert!(store.matching("a/#", now).messages.is_empty());
    }

    #[test]
    fn matching_uses_filters() {
        let now = Instant::now();
        let mut store = RetainedStore::new();
        for t in ["a/1", "a/2", "b/1", "$SYS/x"] {
            store.apply(&publish(t, b"v"), None, now);
        }
        let topics: Vec<String> = store
            .matching("a/+", now)
            .messages
            .into_iter()
            .map(|p| p.topic.to_string())
            .collect();
        assert_eq!(topics, vec!["a/1", "a/2"]);
        assert_eq!(store.matching("#", now).messages.len(), 3);
        assert_eq!(store.matching("$SYS/#", now).messages.len(), 1);
    }

    #[test]
    fn expired_entries_are_swept_on_lookup() {
        let now = Instant::now();
        let mut store = RetainedStore::new();
        let mut p = publish("a", b"v");
        p.properties = Properties {
            message_expiry_interval: Some(10),
            ..Default::default()
        };
        store.apply(&p, None, now);

        let replayed = store.matching("a", now + Duration::from_secs(4)).messages;
        assert_eq!(replayed[0].properties.message_expiry_interval, Some(6));
        assert!(replayed[0].retain);

        let late = store.matching("a", now + Duration::from_secs(10));
        assert!(late.messages.is_empty());
        assert_eq!(late.expired, vec![Arc::<str>::from("a")]);
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_reports_removed_topics() {
        let now = Instant::now();
        let mut store = RetainedStore::new();
        let mut p = publish("short", b"v");
        p.properties.message_expiry_interval = Some(1);
        store.apply(&p, None, now);
        store.apply(&publish("long", b"v"), None, now);

        let removed = store.sweep(now + Duration::from_secs(2));
        assert_eq!(removed, vec![Arc::<str>::from("short")]);
        assert_eq!(store.len(), 1);
    }
}
