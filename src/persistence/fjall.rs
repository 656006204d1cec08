//! Fjall storage backend.
//!
//! One LSM keyspace with a `retained` partition keyed by topic and a
//! `sessions` partition keyed by client identifier; values are bincode
//! records from [`super::models`].

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::warn;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredRetainedMessage, StoredSession};

const RETAINED: &str = "retained";
const SESSIONS: &str = "sessions";

pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
}

impl FjallBackend {
    /// Open (or create) the store under `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let retained = keyspace.open_partition(RETAINED, PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition(SESSIONS, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            retained,
            sessions,
        })
    }

    fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
    }

    fn decode<T: bincode::Decode<()>>(partition: &'static str, key: &str, bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|source| PersistenceError::Decode {
                partition,
                key: key.to_string(),
                source,
            })
    }

    fn get<T: bincode::Decode<()>>(
        partition: &PartitionHandle,
        name: &'static str,
        key: &str,
    ) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(bytes) => Self::decode(name, key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every record of a partition. A record that no longer decodes is
    /// skipped so one bad entry does not block startup.
    fn list<T: bincode::Decode<()>>(
        partition: &PartitionHandle,
        name: &'static str,
    ) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for item in partition.iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| PersistenceError::InvalidKey { partition: name })?;
            match Self::decode(name, &key, &value) {
                Ok(record) => out.push((key, record)),
                Err(e) => warn!("Skipping stored record: {}", e),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Self::get(&self.retained, RETAINED, topic)
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Self::list(&self.retained, RETAINED)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Self::get(&self.sessions, SESSIONS, client_id)
    }

    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>> {
        Self::list(&self.sessions, SESSIONS)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    batch.insert(&self.retained, topic, Self::encode(&message)?);
                }
                PersistenceOp::DeleteRetained { topic } => batch.remove(&self.retained, topic),
                PersistenceOp::SetSession { client_id, session } => {
                    batch.insert(&self.sessions, client_id, Self::encode(&session)?);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    batch.remove(&self.sessions, client_id)
                }
            }
        }
        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Files are released when the keyspace drops
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn undecodable_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();
        backend.sessions.insert("broken", vec![0xFFu8; 3]).unwrap();

        assert!(backend.list_sessions().await.unwrap().is_empty());
        assert!(matches!(
            backend.get_session("broken").await,
            Err(PersistenceError::Decode { partition: SESSIONS, .. })
        ));
    }
}
