//! Broker orchestrator
//!
//! Every piece of shared state (sessions, the subscription trie, retained
//! messages, cluster replicas and the table of attached connections) lives
//! in one [`BrokerState`] behind a single mutex. Handling one inbound frame,
//! one fan-out or one tick holds the lock for the whole step; only socket
//! I/O happens outside it. Outbound bytes are appended to each
//! connection's [`Transport`] and flushed by its task.
//!
//! Time is always passed in, so the core runs deterministically in tests.

mod connection;
mod restore;
mod retained;
mod router;
mod server;
mod state;
mod writer;


pub use connection::{ClientConnection, ConnectionError, Flow};
pub use restore::RestoreSummary;
pub use retained::{RetainedChange, RetainedMatch, RetainedMessage, RetainedStore};
pub use state::BrokerState;
pub use writer::SharedWriter;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use crate::cluster::ClusterMessage;
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceManager, PersistenceOp, StoredSession};
use crate::protocol::{ProtocolVersion, Publish, QoS, ReasonCode};

/// Runtime broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum packet size accepted from clients
    pub max_packet_size: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Clamp for client keep-alive; 0 leaves it untouched
    pub max_keep_alive: u16,
    /// Upper bound for requested session expiry, seconds
    pub max_session_expiry: Option<u32>,
    /// Receive maximum advertised to clients (inbound QoS 2 window)
    pub receive_maximum: u16,
    pub max_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscriptions_available: bool,
    /// Maximum inbound topic alias; 0 disables aliases
    pub max_topic_alias: u16,
    /// Bound on topic levels, also bounds matcher recursion
    pub max_topic_levels: usize,
    /// Offline queue bound per session
    pub max_queued_messages: usize,
    /// Interval of the maintenance tick
    pub tick_interval: Duration,
    /// Cluster node identity
    pub node_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(10),
            max_keep_alive: 0,
            max_session_expiry: None,
            receive_maximum: 1024,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            max_topic_alias: 64,
            max_topic_levels: 128,
            max_queued_messages: 1000,
            tick_interval: Duration::from_millis(250),
            node_id: "relaymq".to_string(),
        }
    }
}

/// Broker-local connection identity; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound half of a client connection
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue encoded bytes; never blocks
    fn send(&self, bytes: Bytes);
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Why a client connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent DISCONNECT
    Normal,
    /// Client sent DISCONNECT 0x04
    NormalWithWill,
    KeepAliveTimeout,
    /// Broker closed the connection for a protocol error
    ProtocolError(ReasonCode),
    /// A newer connection took the session over
    TakenOver,
    /// Socket closed or failed without DISCONNECT
    ConnectionLost,
    ServerShutdown,
}

/// Broker events, delivered to [`Hooks::on_event`] and to event subscribers
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        session_present: bool,
    },
    ClientDisconnected {
        client_id: Arc<str>,
        reason: DisconnectReason,
    },
    ConnectionRefused {
        client_id: String,
        reason: ReasonCode,
    },
    SessionTakenOver {
        client_id: Arc<str>,
    },
    SessionExpired {
        client_id: Arc<str>,
    },
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
    },
    /// A message could not be handed to a session
    MessageDropped {
        client_id: Arc<str>,
        topic: Arc<str>,
        reason: DropReason,
    },
    Subscribed {
        client_id: Arc<str>,
        filter: Arc<str>,
        qos: QoS,
    },
    Unsubscribed {
        client_id: Arc<str>,
        filter: Arc<str>,
    },
    WillPublished {
        client_id: Arc<str>,
        topic: Arc<str>,
    },
    /// A PUBLISH or SUBSCRIBE refused by [`Hooks::authorize`]
    NotAuthorized {
        client_id: Arc<str>,
        topic: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Larger than the client's maximum packet size even without optional properties
    PacketTooLarge,
    /// QoS 0 for a disconnected session
    Offline,
}

/// The broker: shared state plus its collaborators
pub struct Broker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    hooks: Arc<dyn Hooks>,
    events: broadcast::Sender<BrokerEvent>,
    replication: Option<mpsc::UnboundedSender<ClusterMessage>>,
    persistence: Option<Arc<PersistenceManager>>,
    next_connection: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            state: Mutex::new(BrokerState::new()),
            hooks,
            events,
            replication: None,
            persistence: None,
            next_connection: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Mirror state changes to the cluster through `tx`
    pub fn with_replication(mut self, tx: mpsc::UnboundedSender<ClusterMessage>) -> Self {
        self.replication = Some(tx);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn retained_count(&self) -> usize {
        self.state.lock().retained.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().matcher.len()
    }

    /// Run `f` against the locked state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Publish a message originating from the broker itself
    pub fn publish(&self, publish: Publish, now: Instant) -> usize {
        let mut st = self.state.lock();
        self.route(&mut st, publish, None, false, now)
    }

    /// Periodic maintenance: keep-alive timeouts, delayed wills, session
    /// expiry, retained expiry and stale cluster replicas
    pub fn tick(&self, now: Instant) {
        let mut st = self.state.lock();

        let timed_out: Vec<Arc<str>> = st
            .sessions
            .values()
            .filter(|s| s.keep_alive_expired(now))
            .map(|s| s.client_id.clone())
            .collect();
        for client_id in timed_out {
            debug!(client_id = %client_id, "keep-alive timeout");
            self.drop_connection(
                &mut st,
                &client_id,
                DisconnectReason::KeepAliveTimeout,
                true,
                now,
            );
        }

        let due: Vec<(Arc<str>, Publish)> = st
            .sessions
            .values_mut()
            .filter_map(|s| s.take_due_will(now).map(|w| (s.client_id.clone(), w)))
            .collect();
        for (client_id, will) in due {
            self.publish_will(&mut st, &client_id, will, now);
        }

        let expired: Vec<Arc<str>> = st
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.client_id.clone())
            .collect();
        for client_id in expired {
            self.expire_session(&mut st, &client_id, now);
        }

        for topic in st.retained.sweep(now) {
            trace!(topic = %topic, "retained message expired");
            self.persist(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            });
        }

        let stale = st.replicas.sweep(now);
        if stale > 0 {
            debug!(count = stale, "dropped expired cluster replicas");
        }
    }

    /// Close every connection with "server shutting down" and stop the
    /// listener and tick tasks. Sessions are detached as if their
    /// connections were lost, so wills fire and persistent sessions are
    /// stored.
    pub fn shutdown(&self, now: Instant) {
        info!("broker shutting down");
        let mut st = self.state.lock();
        let connected: Vec<Arc<str>> = st
            .sessions
            .values()
            .filter(|s| s.connected)
            .map(|s| s.client_id.clone())
            .collect();
        for client_id in connected {
            self.drop_connection(
                &mut st,
                &client_id,
                DisconnectReason::ServerShutdown,
                true,
                now,
            );
        }
        drop(st);
        // DISCONNECTs are queued before the connection tasks stop
        let _ = self.shutdown.send(());
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        self.hooks.on_event(&event);
        let _ = self.events.send(event);
    }

    pub(crate) fn replicate(&self, msg: ClusterMessage) {
        if let Some(tx) = &self.replication {
            trace!(kind = msg.type_name(), "replicating");
            if tx.send(msg).is_err() {
                debug!("cluster link driver gone, replication dropped");
            }
        }
    }

    pub(crate) fn persist(&self, op: PersistenceOp) {
        if let Some(p) = &self.persistence {
            p.write(op);
        }
    }

    /// Store the session of `client_id` if it outlives its connection
    pub(crate) fn persist_session(&self, st: &BrokerState, client_id: &str, now: Instant) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let Some(session) = st.sessions.get(client_id) else {
            return;
        };
        if session.session_expiry.is_zero() {
            return;
        }
        persistence.write(PersistenceOp::SetSession {
            client_id: client_id.to_string(),
            session: StoredSession::capture(session, now),
        });
    }

    pub(crate) fn hooks(&self) -> &dyn Hooks {
        self.hooks.as_ref()
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, BrokerState> {
        self.state.lock()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("node_id", &self.config.node_id)
            .field("bind_addr", &self.config.bind_addr)
            .finish()
    }
}
