//! TCP server driver
//!
//! One task per socket feeds bytes into the broker and flushes the
//! connection's [`SharedWriter`]; one more task drives the periodic tick.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Broker, ConnectionError, Flow, SharedWriter, Transport};

impl Broker {
    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("MQTT listener on {}", listener.local_addr()?);
        let ticker = self.spawn_ticker();
        let active = Arc::new(AtomicUsize::new(0));
        let mut shutdown_rx = self.subscribe_shutdown();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        if active.load(Ordering::Acquire) >= self.config.max_connections {
                            warn!("Connection limit reached, rejecting {}", addr);
                            continue;
                        }
                        debug!("New TCP connection from {}", addr);
                        active.fetch_add(1, Ordering::AcqRel);
                        let broker = self.clone();
                        let active = active.clone();
                        tokio::spawn(async move {
                            broker.handle_stream(stream, addr).await;
                            active.fetch_sub(1, Ordering::AcqRel);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
                result = shutdown_rx.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
            }
        }
        ticker.abort();
        Ok(())
    }

    /// Spawn the maintenance tick task
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = self.clone();
        let mut shutdown_rx = self.subscribe_shutdown();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.tick_interval);
            loop {
                tokio::select! {
                    biased;

                    _ = ticker.tick() => {
                        broker.tick(Instant::now());
                    }
                    result = shutdown_rx.recv() => match result {
                        Ok(()) | Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(_)) => continue,
                    },
                }
            }
        })
    }

    async fn handle_stream(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let writer = Arc::new(SharedWriter::new());
        let mut conn = self.accept(writer.clone());
        let mut read_buf = BytesMut::with_capacity(4096);
        let connect_deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        let mut shutdown_rx = self.subscribe_shutdown();

        let result: Result<(), ConnectionError> = loop {
            tokio::select! {
                result = stream.read_buf(&mut read_buf) => match result {
                    Ok(0) => {
                        debug!("Connection closed from {}", addr);
                        break Ok(());
                    }
                    Ok(_) => {
                        let flow = self.receive(&mut conn, &read_buf, Instant::now());
                        read_buf.clear();
                        match flow {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Err(e) => break Err(e.into()),
                },
                _ = writer.notified() => {
                    let data = writer.take_buffer();
                    if !data.is_empty() {
                        if let Err(e) = stream.write_all(&data).await {
                            break Err(e.into());
                        }
                    }
                    if writer.is_closed() {
                        break Ok(());
                    }
                }
                _ = tokio::time::sleep_until(connect_deadline), if conn.client_id().is_none() => {
                    break Err(ConnectionError::ConnectTimeout);
                }
                result = shutdown_rx.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break Err(ConnectionError::Shutdown),
                    Err(RecvError::Lagged(_)) => continue,
                },
            }
        };

        // Whatever the broker queued before the close still goes out
        let data = writer.take_buffer();
        if !data.is_empty() {
            let _ = stream.write_all(&data).await;
        }
        writer.close();
        self.connection_lost(&mut conn, Instant::now());
        let _ = stream.shutdown().await;

        match result {
            Ok(()) | Err(ConnectionError::Shutdown) => {}
            Err(ConnectionError::Io(e)) => debug!("Connection error from {}: {}", addr, e),
            Err(e) => debug!("Connection from {} closed: {}", addr, e),
        }
    }
}
