//! Cluster link driver
//!
//! Links are one-directional. A node sends its replication stream on the
//! links it dials (one per configured peer) and applies what arrives on the
//! links it accepts, so every message reaches each peer exactly once. A
//! dialed link opens with Hello followed by the retained snapshot; it is
//! re-dialed with exponential backoff when it fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{ClusterError, ClusterFramer, ClusterMessage, HelloHeader, CLUSTER_PROTOCOL_VERSION};
use crate::broker::Broker;
use crate::config::ClusterConfig;

type Outbox = mpsc::UnboundedSender<Bytes>;

/// Running cluster link driver
pub struct ClusterLinks {
    node_id: String,
    config: ClusterConfig,
    broker: Arc<Broker>,
    /// One sender per connected outbound link
    outboxes: Mutex<Vec<(String, Outbox)>>,
}

impl ClusterLinks {
    pub fn new(config: ClusterConfig, broker: Arc<Broker>) -> Arc<Self> {
        Arc::new(Self {
            node_id: broker.node_id().to_string(),
            config,
            broker,
            outboxes: Mutex::new(Vec::new()),
        })
    }

    /// Start the listener, one dialer per peer and the fan-out of `replication`
    pub async fn start(
        self: &Arc<Self>,
        replication: mpsc::UnboundedReceiver<ClusterMessage>,
    ) -> Result<Vec<JoinHandle<()>>, ClusterError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(
            node_id = %self.node_id,
            "Cluster link listener on {}",
            listener.local_addr()?
        );
        Ok(self.start_with_listener(listener, replication))
    }

    pub fn start_with_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        replication: mpsc::UnboundedReceiver<ClusterMessage>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(self.config.peers.len() + 2);
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        tasks.push(tokio::spawn(self.clone().fan_out(replication)));
        for peer in self.config.peers.clone() {
            tasks.push(tokio::spawn(self.clone().dial_loop(peer)));
        }
        tasks
    }

    /// Number of outbound links currently up
    pub fn connected_peers(&self) -> usize {
        self.outboxes.lock().len()
    }

    /// Encode each replicated message once and hand it to every link
    async fn fan_out(self: Arc<Self>, mut replication: mpsc::UnboundedReceiver<ClusterMessage>) {
        while let Some(msg) = replication.recv().await {
            let frame = match msg.to_bytes() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode {} for the cluster: {}", msg.type_name(), e);
                    continue;
                }
            };
            self.outboxes
                .lock()
                .retain(|(_, outbox)| outbox.send(frame.clone()).is_ok());
        }
        debug!("Replication stream closed");
    }

    async fn dial_loop(self: Arc<Self>, peer: String) {
        let mut retry = self.config.reconnect_min;
        loop {
            debug!(peer = %peer, "Dialing cluster peer");
            match self.run_outbound(&peer).await {
                Ok(()) => {
                    info!(peer = %peer, "Cluster link closed");
                    retry = self.config.reconnect_min;
                }
                Err(e) => {
                    warn!(peer = %peer, "Cluster link failed: {}", e);
                }
            }
            debug!(peer = %peer, "Reconnecting in {:?}", retry);
            tokio::time::sleep(retry).await;
            retry = std::cmp::min(retry * 2, self.config.reconnect_max.max(Duration::from_millis(1)));
        }
    }

    async fn run_outbound(&self, peer: &str) -> Result<(), ClusterError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| {
                ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            })??;
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        // Register before the snapshot so nothing published meanwhile is lost
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.outboxes.lock().push((peer.to_string(), tx));

        let mut opening = BytesMut::new();
        ClusterMessage::Hello(HelloHeader {
            node_id: self.node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
        })
        .encode(&mut opening)?;
        for msg in self.broker.retained_snapshot(Instant::now()) {
            msg.encode(&mut opening)?;
        }
        let result = self
            .pump(&mut read_half, &mut write_half, opening.freeze(), &mut rx)
            .await;
        self.outboxes.lock().retain(|(name, _)| name != peer);
        result
    }

    async fn pump(
        &self,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        opening: Bytes,
        rx: &mut mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<(), ClusterError> {
        write_half.write_all(&opening).await?;
        info!("Cluster link up");

        // Nothing is expected back on an outbound link; reading only
        // detects the peer going away
        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => write_half.write_all(&frame).await?,
                    None => return Ok(()),
                },
                result = read_half.read(&mut scratch) => match result? {
                    0 => return Ok(()),
                    _ => {}
                },
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Cluster link from {}", addr);
                    let links = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = links.run_inbound(stream).await {
                            warn!("Cluster link from {} closed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept cluster link: {}", e);
                }
            }
        }
    }

    /// Read an inbound link: Hello first, then messages to apply
    async fn run_inbound(&self, mut stream: TcpStream) -> Result<(), ClusterError> {
        let mut framer = ClusterFramer::new(self.config.max_frame_size);
        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        let mut peer: Option<String> = None;

        loop {
            read_buf.clear();
            if stream.read_buf(&mut read_buf).await? == 0 {
                if let Some(peer) = &peer {
                    info!(peer = %peer, "Cluster peer disconnected");
                }
                return Ok(());
            }
            framer.push(&read_buf);
            while let Some(msg) = framer.next_message()? {
                match (&peer, msg) {
                    (None, ClusterMessage::Hello(hello)) => {
                        if hello.version != CLUSTER_PROTOCOL_VERSION {
                            return Err(ClusterError::VersionMismatch(hello.version));
                        }
                        info!(peer = %hello.node_id, "Cluster peer connected");
                        peer = Some(hello.node_id);
                    }
                    (None, _) => {
                        return Err(ClusterError::InvalidField("expected Hello"));
                    }
                    (Some(from), msg) => {
                        if let Err(e) = self.broker.apply_cluster(from, msg, Instant::now()) {
                            warn!(peer = %from, "Dropped cluster message: {}", e);
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ClusterLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLinks")
            .field("node_id", &self.node_id)
            .field("peers", &self.config.peers)
            .finish()
    }
}
