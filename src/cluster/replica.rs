//! Replica table
//!
//! What this node knows about sessions owned by its peers: enough to adopt
//! a session (subscriptions included) when its client reconnects here.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use tracing::trace;

use super::protocol::{ClusterError, SessionHeader, SubscriptionHeader};
use crate::session::{SessionExpiry, Subscription};
use crate::topic::parse_filter;

/// A peer's session as mirrored here
#[derive(Debug, Clone)]
pub struct ReplicaSession {
    /// Owning node; empty until a session message names it
    pub node_id: String,
    pub connected: bool,
    pub session_expiry: SessionExpiry,
    pub disconnected_at: Option<Instant>,
    /// Keyed by the filter as subscribed
    pub subscriptions: AHashMap<String, Subscription>,
}

impl ReplicaSession {
    fn new(node_id: String) -> Self {
        Self {
            node_id,
            connected: true,
            session_expiry: SessionExpiry::Never,
            disconnected_at: None,
            subscriptions: AHashMap::new(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        match (self.connected, self.session_expiry, self.disconnected_at) {
            (true, _, _) | (_, SessionExpiry::Never, _) => false,
            (false, SessionExpiry::After(d), Some(at)) => now >= at + d,
            (false, SessionExpiry::After(_), None) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplicaTable {
    sessions: AHashMap<String, ReplicaSession>,
}

impl ReplicaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, client_id: &str) -> Option<&ReplicaSession> {
        self.sessions.get(client_id)
    }

    /// Apply a SessionAdd or SessionUpdate. A disconnected session with zero
    /// expiry is gone and is dropped here too.
    pub fn update_session(&mut self, header: &SessionHeader, now: Instant) {
        let expiry = SessionExpiry::from_secs(header.session_expiry);
        if !header.connected && expiry.is_zero() {
            self.sessions.remove(&header.client_id);
            return;
        }
        let replica = self
            .sessions
            .entry(header.client_id.clone())
            .or_insert_with(|| ReplicaSession::new(header.node_id.clone()));
        replica.node_id.clone_from(&header.node_id);
        replica.session_expiry = expiry;
        if header.connected {
            replica.connected = true;
            replica.disconnected_at = None;
        } else if replica.connected {
            replica.connected = false;
            replica.disconnected_at = Some(now);
        }
    }

    pub fn add_subscription(&mut self, header: &SubscriptionHeader) -> Result<(), ClusterError> {
        let options = header.options()?;
        let parsed = parse_filter(&header.filter, 0)
            .map_err(|_| ClusterError::InvalidField("subscription filter"))?;
        let sub = Subscription {
            filter: Arc::from(parsed.filter),
            shared_group: parsed.share_group.map(Arc::from),
            qos: options.qos,
            no_local: options.no_local,
            retain_as_published: options.retain_as_published,
            retain_handling: options.retain_handling,
            subscription_id: header.subscription_id,
            last_shared_dispatch: None,
            seq: 0,
        };
        trace!(client_id = %header.client_id, filter = %header.filter, "replica subscription");
        self.sessions
            .entry(header.client_id.clone())
            .or_insert_with(|| ReplicaSession::new(String::new()))
            .subscriptions
            .insert(header.filter.clone(), sub);
        Ok(())
    }

    pub fn remove_subscription(&mut self, header: &SubscriptionHeader) -> bool {
        self.sessions
            .get_mut(&header.client_id)
            .and_then(|r| r.subscriptions.remove(&header.filter))
            .is_some()
    }

    pub fn remove(&mut self, client_id: &str) -> Option<ReplicaSession> {
        self.sessions.remove(client_id)
    }

    /// Remove and return the replica for adoption by a local connection
    pub fn take(&mut self, client_id: &str) -> Option<ReplicaSession> {
        self.remove(client_id)
    }

    /// Drop replicas whose expiry elapsed; returns how many went
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, r| !r.is_expired(now));
        before - self.sessions.len()
    }
}
