//! Persistence module for relaymq.
//!
//! Provides durable storage for:
//! - Retained messages
//! - Sessions that outlive their connection (subscriptions, in-flight
//!   QoS 1/2 records, queued messages, will)
//!
//! The broker never waits on storage: it hands [`PersistenceOp`]s to the
//! [`PersistenceManager`], whose background task batches them into the
//! backend.

mod backend;
mod error;
mod fjall;
mod memory;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    LoadedData, StoredInFlight, StoredProperties, StoredPublish, StoredRetainedMessage,
    StoredSession, StoredSubscription, StoredWill,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackendType, PersistenceConfig};

/// Persistence manager that handles background writes
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Create a new persistence manager with the given backend.
    ///
    /// Spawns a background task that batches and commits writes, so it must
    /// be called inside a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer = tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Open the backend named by `config` and start the writer
    pub fn from_config(config: &PersistenceConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match config.backend {
            BackendType::Fjall => {
                info!("Opening fjall store at {}", config.path.display());
                Arc::new(FjallBackend::open(&config.path)?)
            }
            BackendType::Memory => Arc::new(MemoryBackend::new()),
        };
        Ok(Self::new(
            backend,
            config.flush_interval,
            config.max_batch_size,
        ))
    }

    /// Fire-and-forget write operation (non-blocking for hot path).
    ///
    /// If the channel is full, the operation is dropped.
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("Persistence channel full, dropping operation: {}", e);
        }
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Flush pending writes and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        let _ = self.shutdown_tx.send(()).await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        self.backend.flush().await?;
        self.backend.close().await?;

        info!("Persistence manager shutdown complete");
        Ok(())
    }

    async fn commit(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>, why: &str) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!("Flushed {} operations ({})", count, why),
            Err(e) => error!("Failed to write batch of {} ({}): {}", count, why, e),
        }
    }

    /// Background writer loop that batches and commits writes
    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::commit(&backend, &mut batch, "max batch").await;
                            }
                        }
                        None => {
                            Self::commit(&backend, &mut batch, "channel closed").await;
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    Self::commit(&backend, &mut batch, "interval").await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Persistence writer received shutdown signal");
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    Self::commit(&backend, &mut batch, "shutdown").await;
                    break;
                }
            }
        }

        info!("Persistence writer loop exited");
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn retained(topic: &str, payload: &[u8]) -> StoredRetainedMessage {
        StoredRetainedMessage {
            publish: StoredPublish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: 1,
                retain: true,
                dup: false,
                packet_id: None,
                properties: StoredProperties::default(),
            },
            origin: None,
            stored_at_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs(),
        }
    }

    #[tokio::test]
    async fn test_fjall_backend_batch_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend
            .batch_write(vec![
                PersistenceOp::SetRetained {
                    topic: "topic1".to_string(),
                    message: retained("topic1", &[1]),
                },
                PersistenceOp::SetRetained {
                    topic: "topic2".to_string(),
                    message: retained("topic2", &[2]),
                },
                PersistenceOp::DeleteRetained {
                    topic: "topic1".to_string(),
                },
            ])
            .await
            .unwrap();

        let listed = backend.list_retained().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "topic2");
        assert_eq!(listed[0].1.publish.payload, vec![2]);
        assert!(backend.get_retained("topic1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fjall_reopen_keeps_sessions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let session = StoredSession {
            client_id: "c1".to_string(),
            protocol_version: 5,
            session_expiry_interval: 600,
            subscriptions: vec![StoredSubscription {
                filter: "a/#".to_string(),
                options: 1,
                subscription_id: None,
                seq: 1,
            }],
            queued: vec![],
            in_flight: vec![],
            will: None,
            disconnected_at_secs: None,
        };
        {
            let backend = FjallBackend::open(temp_dir.path()).unwrap();
            backend
                .batch_write(vec![PersistenceOp::SetSession {
                    client_id: "c1".to_string(),
                    session: session.clone(),
                }])
                .await
                .unwrap();
            backend.close().await.unwrap();
        }

        let backend = FjallBackend::open(temp_dir.path()).unwrap();
        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.sessions, vec![("c1".to_string(), session)]);
        assert!(loaded.retained.is_empty());
    }

    #[tokio::test]
    async fn test_manager_flushes_on_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 1000);

        manager.write(PersistenceOp::SetRetained {
            topic: "a".to_string(),
            message: retained("a", b"x"),
        });
        manager.write(PersistenceOp::DeleteSession {
            client_id: "gone".to_string(),
        });
        manager.shutdown().await.unwrap();

        assert!(backend.get_retained("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manager_flushes_full_batch() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 2);

        for topic in ["a", "b"] {
            manager.write(PersistenceOp::SetRetained {
                topic: topic.to_string(),
                message: retained(topic, b"x"),
            });
        }
        for _ in 0..50 {
            if backend.list_retained().await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.list_retained().await.unwrap().len(), 2);
    }
}
