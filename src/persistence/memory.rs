//! In-memory storage backend.
//!
//! Nothing survives the process; useful for tests and for brokers that want
//! the write path exercised without a data directory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::Result;
use super::models::{StoredRetainedMessage, StoredSession};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    retained: RwLock<BTreeMap<String, StoredRetainedMessage>>,
    sessions: RwLock<BTreeMap<String, StoredSession>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Ok(self.retained.read().get(topic).cloned())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Ok(self
            .retained
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.sessions.read().get(client_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        Ok(self
            .sessions
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut retained = self.retained.write();
        let mut sessions = self.sessions.write();
        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    retained.insert(topic, message);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    retained.remove(&topic);
                }
                PersistenceOp::SetSession { client_id, session } => {
                    sessions.insert(client_id, session);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    sessions.remove(&client_id);
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
