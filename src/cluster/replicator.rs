//! Applying cluster messages to the local broker

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use super::protocol::{ClusterError, ClusterMessage, RelayedPublish};
use crate::broker::{Broker, BrokerEvent, DisconnectReason};
use crate::persistence::PersistenceOp;

impl Broker {
    /// Apply one message received from peer `from`.
    ///
    /// Relayed publishes reach local sessions only. Session and subscription
    /// messages maintain the replica table; a takeover elsewhere closes and
    /// drops the local copy of the session.
    pub fn apply_cluster(
        &self,
        from: &str,
        msg: ClusterMessage,
        now: Instant,
    ) -> Result<(), ClusterError> {
        trace!(peer = from, kind = msg.type_name(), "cluster message");
        let mut st = self.lock();
        match msg {
            ClusterMessage::Hello(_) => {}
            ClusterMessage::PublishRelay(relayed) => {
                if relayed.header.origin_node == self.node_id() {
                    return Ok(());
                }
                let publish = relayed.to_publish()?;
                let origin = relayed.header.origin_client.as_deref();
                self.route(&mut st, publish, origin, true, now);
            }
            ClusterMessage::RetainedSet(relayed) => {
                let mut publish = relayed.to_publish()?;
                publish.retain = true;
                let origin = relayed.header.origin_client.as_deref();
                self.update_retained(&mut st, &publish, origin, now);
            }
            ClusterMessage::SubscriptionAdd(header) => {
                st.replicas.add_subscription(&header)?;
            }
            ClusterMessage::SubscriptionRemove(header) => {
                st.replicas.remove_subscription(&header);
            }
            ClusterMessage::SessionAdd(header) | ClusterMessage::SessionUpdate(header) => {
                if header.node_id != self.node_id() {
                    st.replicas.update_session(&header, now);
                }
            }
            ClusterMessage::SessionTakenOver(header) => {
                if header.node_id == self.node_id() {
                    return Ok(());
                }
                if header.clean_start && st.replicas.remove(&header.client_id).is_some() {
                    debug!(client_id = %header.client_id, "replica discarded by clean start");
                }
                let client_id: Arc<str> = Arc::from(header.client_id.as_str());
                let Some(connected) = st.sessions.get(&client_id).map(|s| s.connected) else {
                    return Ok(());
                };
                info!(
                    client_id = %client_id,
                    node = %header.node_id,
                    "session taken over by cluster peer"
                );
                if connected {
                    self.drop_connection(&mut st, &client_id, DisconnectReason::TakenOver, false, now);
                }
                st.remove_session(&client_id);
                self.persist(PersistenceOp::DeleteSession {
                    client_id: header.client_id.clone(),
                });
                self.emit(BrokerEvent::SessionTakenOver { client_id });
            }
        }
        Ok(())
    }

    /// Every retained message as RetainedSet, to bring a new peer up to date
    pub fn retained_snapshot(&self, now: Instant) -> Vec<ClusterMessage> {
        let st = self.lock();
        let snapshot: Vec<ClusterMessage> = st
            .retained
            .iter()
            .filter(|m| !m.is_expired(now))
            .map(|m| {
                ClusterMessage::RetainedSet(RelayedPublish::new(
                    &m.replay(now),
                    m.origin.as_deref(),
                    self.node_id(),
                ))
            })
            .collect();
        debug!(count = snapshot.len(), "retained snapshot");
        snapshot
    }
}
