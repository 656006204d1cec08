//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::{ClientConnection, Flow};
use crate::broker::{Broker, BrokerEvent, BrokerState};
use crate::cluster::{ClusterMessage, SubscriptionHeader};
use crate::protocol::{
    Packet, Properties, ProtocolError, ReasonCode, RetainHandling, SubAck, Subscribe, UnsubAck,
    Unsubscribe,
};
use crate::session::Subscription;
use crate::topic::{has_wildcards, parse_filter, EntryKey};

impl Broker {
    /// Handle SUBSCRIBE packet
    pub(super) fn handle_subscribe(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        subscribe: Subscribe,
        now: Instant,
    ) -> Result<Flow, ProtocolError> {
        let Some(ctx) = conn.context() else {
            return Err(ProtocolError::Violation("SUBSCRIBE before CONNECT"));
        };
        let client_id = ctx.client_id.clone();
        let cfg = &self.config;

        let subscription_id = subscribe.properties.subscription_identifiers.first().copied();
        if subscription_id.is_some() && !cfg.subscription_identifiers_available {
            return Err(ProtocolError::Unsupported(ReasonCode::SubIdNotSupported));
        }

        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        let mut replays: Vec<Arc<str>> = Vec::new();

        for request in &subscribe.filters {
            let raw = request.filter.as_str();
            let parsed = match parse_filter(raw, cfg.max_topic_levels) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(client_id = %client_id, filter = raw, "invalid topic filter: {}", e);
                    reason_codes.push(ReasonCode::TopicFilterInvalid);
                    continue;
                }
            };
            if parsed.share_group.is_some() {
                if !cfg.shared_subscriptions_available {
                    reason_codes.push(ReasonCode::SharedSubsNotSupported);
                    continue;
                }
                if request.options.no_local {
                    return Err(ProtocolError::Violation("no local on a shared subscription"));
                }
            }
            if has_wildcards(parsed.filter) && !cfg.wildcard_subscription_available {
                reason_codes.push(ReasonCode::WildcardSubsNotSupported);
                continue;
            }
            if !self.hooks().authorize(
                &client_id,
                ctx.username.as_deref(),
                ctx.password.as_deref(),
                raw,
                true,
                &[],
            ) {
                debug!(client_id = %client_id, filter = raw, "SUBSCRIBE denied");
                self.emit(BrokerEvent::NotAuthorized {
                    client_id: client_id.clone(),
                    topic: raw.to_string(),
                });
                reason_codes.push(ReasonCode::NotAuthorized);
                continue;
            }

            let granted = request.options.qos.min(cfg.max_qos);
            let sub = Subscription {
                filter: Arc::from(parsed.filter),
                shared_group: parsed.share_group.map(Arc::from),
                qos: granted,
                no_local: request.options.no_local,
                retain_as_published: request.options.retain_as_published,
                retain_handling: request.options.retain_handling,
                subscription_id,
                last_shared_dispatch: None,
                seq: 0,
            };
            let shared = sub.shared_group.is_some();
            let handling = sub.retain_handling;
            let options = sub.options();
            let raw: Arc<str> = Arc::from(raw);
            let existed = self.install_subscription(st, &client_id, raw.clone(), sub);

            debug!(client_id = %client_id, filter = %raw, qos = ?granted, "subscribed");
            self.emit(BrokerEvent::Subscribed {
                client_id: client_id.clone(),
                filter: raw.clone(),
                qos: granted,
            });
            self.replicate(ClusterMessage::SubscriptionAdd(SubscriptionHeader {
                client_id: client_id.to_string(),
                filter: raw.to_string(),
                options: options.to_byte(),
                subscription_id,
            }));
            reason_codes.push(ReasonCode::granted(granted));

            // Retained messages are never replayed to share groups
            let replay = match handling {
                RetainHandling::SendAlways => true,
                RetainHandling::SendIfNew => !existed,
                RetainHandling::Never => false,
            };
            if replay && !shared {
                replays.push(raw);
            }
        }

        conn.send(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }));

        for raw in replays {
            let sub = st
                .sessions
                .get(&client_id)
                .and_then(|s| s.subscriptions.get(&raw))
                .cloned();
            if let Some(sub) = sub {
                self.replay_retained(st, &client_id, &sub, now);
            }
        }
        self.persist_session(st, &client_id, now);
        Ok(Flow::Continue)
    }

    /// Handle UNSUBSCRIBE packet
    pub(super) fn handle_unsubscribe(
        &self,
        st: &mut BrokerState,
        conn: &ClientConnection,
        unsubscribe: Unsubscribe,
        now: Instant,
    ) -> Result<Flow, ProtocolError> {
        let Some(client_id) = conn.client_id().cloned() else {
            return Err(ProtocolError::Violation("UNSUBSCRIBE before CONNECT"));
        };

        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        for raw in &unsubscribe.filters {
            if parse_filter(raw, self.config.max_topic_levels).is_err() {
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }
            if self.uninstall_subscription(st, &client_id, raw) {
                debug!(client_id = %client_id, filter = %raw, "unsubscribed");
                self.emit(BrokerEvent::Unsubscribed {
                    client_id: client_id.clone(),
                    filter: Arc::from(raw.as_str()),
                });
                self.replicate(ClusterMessage::SubscriptionRemove(SubscriptionHeader {
                    client_id: client_id.to_string(),
                    filter: raw.clone(),
                    options: 0,
                    subscription_id: None,
                }));
                reason_codes.push(ReasonCode::Success);
            } else {
                reason_codes.push(ReasonCode::NoSubscriptionExisted);
            }
        }

        conn.send(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }));
        self.persist_session(st, &client_id, now);
        Ok(Flow::Continue)
    }

    /// Add `sub` to the session of `client_id` and index it in the matcher.
    /// Replacing an existing subscription keeps its first-seen position and
    /// share-group history. Returns whether it replaced one.
    pub(crate) fn install_subscription(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        raw: Arc<str>,
        mut sub: Subscription,
    ) -> bool {
        let Some(session) = st.sessions.get_mut(client_id) else {
            return false;
        };
        let existed = match session.subscriptions.get(&raw) {
            Some(existing) => {
                sub.seq = existing.seq;
                sub.last_shared_dispatch = existing.last_shared_dispatch;
                true
            }
            None => {
                st.subscription_seq += 1;
                sub.seq = st.subscription_seq;
                false
            }
        };
        let key = EntryKey::new(client_id.clone(), sub.shared_group.clone());
        st.matcher.insert(&sub.filter, key, raw.clone());
        session.subscriptions.insert(raw, sub);
        existed
    }

    /// Remove the subscription `raw` from the session and the matcher
    pub(crate) fn uninstall_subscription(
        &self,
        st: &mut BrokerState,
        client_id: &Arc<str>,
        raw: &str,
    ) -> bool {
        let Some(sub) = st
            .sessions
            .get_mut(client_id)
            .and_then(|s| s.subscriptions.remove(raw))
        else {
            return false;
        };
        let key = EntryKey::new(client_id.clone(), sub.shared_group.clone());
        st.matcher.remove(&sub.filter, &key);
        true
    }
}
