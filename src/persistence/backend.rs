//! Storage backend trait for persistence.
//!
//! Implemented by the fjall store used in production and by an in-memory
//! store for tests and ephemeral brokers.

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// Persistence operation for batch writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    DeleteRetained {
        topic: String,
    },
    SetSession {
        client_id: String,
        session: StoredSession,
    },
    DeleteSession {
        client_id: String,
    },
}

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>>;

    /// Apply a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    /// Flush all pending writes to durable storage
    async fn flush(&self) -> Result<()>;

    /// Flush and release resources
    async fn close(&self) -> Result<()>;

    /// Load all data at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.list_sessions().await?,
        })
    }
}
