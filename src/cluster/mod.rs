//! Cluster replication
//!
//! Nodes are configured with a static peer list and exchange a binary
//! replication stream over TCP: publishes, retained changes, subscription
//! and session state. Each node keeps a replica of its peers' sessions so a
//! client reconnecting here resumes with its subscriptions.
//!
//! ```toml
//! [cluster]
//! enabled = true
//! node_id = "node-a"
//! listen_addr = "0.0.0.0:7947"
//! peers = ["node-b:7947", "node-c:7947"]
//! ```

mod link;
mod protocol;
mod replica;
mod replicator;

pub use link::ClusterLinks;
pub use protocol::{
    ClusterError, ClusterFramer, ClusterMessage, HelloHeader, MessageType, PublishHeader,
    RelayedProperties, RelayedPublish, SessionHeader, SubscriptionHeader, TakeoverHeader,
    CLUSTER_PROTOCOL_VERSION, DEFAULT_MAX_FRAME_SIZE,
};
pub use replica::{ReplicaSession, ReplicaTable};

pub use crate::config::ClusterConfig;
