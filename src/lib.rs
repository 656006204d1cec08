//! relaymq - clustered MQTT v3.1.1/v5.0 broker
//!
//! The protocol core (framing, topic matching, session state machines and
//! the broker orchestrator) is sans-IO and driven with explicit time; the
//! TCP server, cluster links and persistence writer are thin tokio drivers
//! around it.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig, BrokerEvent};
pub use cluster::{ClusterConfig, ClusterLinks};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FjallBackend, MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
