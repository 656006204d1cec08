//! Message Router
//!
//! Fan-out of one publish to every matching session, retained-store
//! maintenance ahead of it, and retained replay for new subscriptions.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::state::{Delivery, Target};
use super::{Broker, BrokerEvent, BrokerState, DropReason, RetainedChange};
use crate::cluster::{ClusterMessage, RelayedPublish};
use crate::persistence::{PersistenceOp, StoredRetainedMessage};
use crate::protocol::Publish;
use crate::session::Subscription;

impl Broker {
    /// Store (if retained) and fan out `publish`.
    ///
    /// `origin` is the publishing client, used for `no_local` and recorded
    /// on retained entries. A `relayed` publish came from a cluster peer: it
    /// reaches local sessions only and is not forwarded again.
    pub(crate) fn route(
        &self,
        st: &mut BrokerState,
        publish: Publish,
        origin: Option<&str>,
        relayed: bool,
        now: Instant,
    ) -> usize {
        if publish.retain {
            self.update_retained(st, &publish, origin, now);
        }

        self.emit(BrokerEvent::MessagePublished {
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
        });

        let targets = st.targets(&publish.topic, origin);
        trace!(topic = %publish.topic, targets = targets.len(), "routing");
        let mut delivered = 0;
        for target in &targets {
            let v5 = st
                .sessions
                .get(&target.client_id)
                .is_some_and(|s| s.protocol_version.is_v5());
            let out = outbound_copy(&publish, target, v5);
            if self.deliver(st, &target.client_id, out, now) {
                delivered += 1;
            }
        }

        if !relayed {
            self.replicate(ClusterMessage::PublishRelay(RelayedPublish::new(
                &publish,
                origin,
                self.node_id(),
            )));
        }
        delivered
    }

    pub(crate) fn update_retained(
        &self,
        st: &mut BrokerState,
        publish: &Publish,
        origin: Option<&str>,
        now: Instant,
    ) {
        match st.retained.apply(publish, origin.map(Arc::from), now) {
            RetainedChange::Stored => {
                if let Some(message) = st.retained.get(&publish.topic) {
                    self.persist(PersistenceOp::SetRetained {
                        topic: publish.topic.to_string(),
                        message: StoredRetainedMessage::capture(message, now),
                    });
                }
            }
            RetainedChange::Cleared => {
                debug!(topic = %publish.topic, "retained message cleared");
                self.persist(PersistenceOp::DeleteRetained {
                    topic: publish.topic.to_string(),
                });
            }
            RetainedChange::Unchanged => {}
        }
    }

    /// Hand one copy to a session, reporting drops. True if it was sent or
    /// queued. The stored copy of an offline session follows its queue.
    pub(crate) fn deliver(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        publish: Publish,
        now: Instant,
    ) -> bool {
        let topic = publish.topic.clone();
        let reason = match st.deliver(client_id, publish) {
            Delivery::Sent => return true,
            Delivery::Queued => {
                if st.sessions.get(client_id).is_some_and(|s| !s.connected) {
                    self.persist_session(st, client_id, now);
                }
                return true;
            }
            Delivery::NoSession => return false,
            Delivery::Offline => DropReason::Offline,
            Delivery::TooLarge => DropReason::PacketTooLarge,
        };
        debug!(client_id = %client_id, topic = %topic, ?reason, "message dropped");
        self.emit(BrokerEvent::MessageDropped {
            client_id: client_id.clone(),
            topic,
            reason,
        });
        false
    }

    /// Publish a will on behalf of `client_id`
    pub(crate) fn publish_will(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        will: Publish,
        now: Instant,
    ) {
        debug!(client_id = %client_id, topic = %will.topic, "publishing will");
        self.emit(BrokerEvent::WillPublished {
            client_id: client_id.clone(),
            topic: will.topic.clone(),
        });
        self.route(st, will, Some(&**client_id), false, now);
    }

    /// Replay retained messages matching a freshly (re-)subscribed filter
    pub(crate) fn replay_retained(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        sub: &Subscription,
        now: Instant,
    ) {
        let v5 = st
            .sessions
            .get(client_id)
            .is_some_and(|s| s.protocol_version.is_v5());
        let found = st.retained.matching(&sub.filter, now);
        for topic in found.expired {
            trace!(topic = %topic, "retained message expired");
            self.persist(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            });
        }
        for mut publish in found.messages {
            publish.qos = publish.qos.min(sub.qos);
            if v5 {
                publish.properties.subscription_identifiers =
                    sub.subscription_id.into_iter().collect();
            }
            self.deliver(st, client_id, publish, now);
        }
    }
}

/// The copy of `publish` a target receives: QoS capped by the
/// subscription, retain kept only with retain-as-published, subscription
/// identifiers attached for v5 clients
fn outbound_copy(publish: &Publish, target: &Target, v5: bool) -> Publish {
    let mut out = publish.clone();
    out.qos = publish.qos.min(target.qos);
    out.retain = target.retain_as_published && publish.retain;
    out.dup = false;
    out.packet_id = None;
    out.properties.topic_alias = None;
    out.properties.subscription_identifiers = if v5 {
        target.subscription_ids.to_vec()
    } else {
        Vec::new()
    };
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use bytes::Bytes;
    use smallvec::smallvec;

    fn target(qos: QoS, rap: bool) -> Target {
        Target {
            client_id: Arc::from("c"),
            qos,
            retain_as_published: rap,
            subscription_ids: smallvec![3, 9],
        }
    }

    fn publish() -> Publish {
        Publish {
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: Arc::from("t"),
            packet_id: Some(12),
            payload: Bytes::from_static(b"p"),
            ..Default::default()
        }
    }

    #[test]
    fn copy_caps_qos_and_clears_retain() {
        let out = outbound_copy(&publish(), &target(QoS::AtLeastOnce, false), true);
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert!(!out.retain);
        assert_eq!(out.packet_id, None);
        assert_eq!(out.properties.subscription_identifiers, vec![3, 9]);
    }

    #[test]
    fn copy_keeps_retain_as_published() {
        let out = outbound_copy(&publish(), &target(QoS::ExactlyOnce, true), false);
        assert!(out.retain);
        assert!(out.properties.subscription_identifiers.is_empty());
    }
}
