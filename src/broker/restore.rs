//! Rebuilding broker state from storage at startup

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{Broker, RetainedMessage};
use crate::persistence::{LoadedData, PersistenceOp, StoredSession};
use crate::protocol::{Publish, Will};
use crate::session::Session;

/// What [`Broker::restore`] brought back
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub retained: usize,
    pub sessions: usize,
    /// Sessions whose expiry elapsed while the broker was down
    pub expired: usize,
}

impl Broker {
    /// Load retained messages and persistent sessions.
    ///
    /// Every restored session starts disconnected. A session stored while
    /// its client was connected lost that connection with the process, so
    /// its will is published now.
    pub fn restore(&self, data: LoadedData, now: Instant) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        let mut wills: Vec<(Arc<str>, Publish)> = Vec::new();
        let mut st = self.lock();

        for (topic, stored) in data.retained {
            let message: RetainedMessage = stored.restore(now);
            if message.is_expired(now) || message.publish.payload.is_empty() {
                self.persist(PersistenceOp::DeleteRetained { topic });
                continue;
            }
            st.retained.restore(message);
            summary.retained += 1;
        }

        let mut sessions = data.sessions;
        // Keep first-seen subscription order across sessions
        sessions.sort_by_key(|(_, s)| s.subscriptions.iter().map(|sub| sub.seq).min());

        for (client_id, stored) in sessions {
            let disconnected_at = stored.disconnected_at(now);
            let expiry = stored.session_expiry();
            let elapsed = match expiry {
                crate::session::SessionExpiry::Never => false,
                crate::session::SessionExpiry::After(d) => disconnected_at
                    .checked_add(d)
                    .is_some_and(|deadline| now >= deadline),
            };
            if elapsed || expiry.is_zero() {
                debug!(client_id = %client_id, "stored session expired while offline");
                self.persist(PersistenceOp::DeleteSession { client_id });
                summary.expired += 1;
                continue;
            }

            let client_id: Arc<str> = Arc::from(client_id);
            let will = if stored.disconnected_at_secs.is_none() {
                stored.will.clone().map(Will::from)
            } else {
                None
            };
            self.restore_session(&mut st, &client_id, stored, disconnected_at, now);
            if let Some(will) = will {
                wills.push((client_id, will.to_publish()));
            }
            summary.sessions += 1;
        }

        for (client_id, will) in wills {
            self.publish_will(&mut st, &client_id, will, now);
        }
        drop(st);

        info!(
            retained = summary.retained,
            sessions = summary.sessions,
            expired = summary.expired,
            "restored state from storage"
        );
        summary
    }

    fn restore_session(
        &self,
        st: &mut super::BrokerState,
        client_id: &Arc<str>,
        stored: StoredSession,
        disconnected_at: Instant,
        now: Instant,
    ) {
        let mut session = Session::new(
            client_id.clone(),
            self.config().max_queued_messages,
            now,
        );
        session.protocol_version = stored.protocol_version();
        session.session_expiry = stored.session_expiry();
        session.disconnected_at = Some(disconnected_at);
        for record in &stored.in_flight {
            session.restore_in_flight(
                record.packet_id,
                Publish::from(record.publish.clone()),
                record.delivery_state(),
            );
        }
        for publish in stored.queued {
            session.restore_queued(Publish::from(publish));
        }
        st.sessions.insert(client_id.clone(), session);

        let mut subscriptions = stored.subscriptions;
        subscriptions.sort_by_key(|s| s.seq);
        for stored_sub in subscriptions {
            match stored_sub.to_subscription() {
                Some(sub) => {
                    self.install_subscription(st, client_id, Arc::from(stored_sub.filter), sub);
                }
                None => {
                    warn!(client_id = %client_id, filter = %stored_sub.filter, "skipping unreadable stored subscription");
                }
            }
        }
    }
}
