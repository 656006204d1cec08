//! relaymq - clustered MQTT v3.1.1/v5.0 broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>  Maximum connections (default: 100000)
//!   --max-packet-size <N>  Maximum packet size
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

use relaymq::acl::AclProvider;
use relaymq::auth::AuthProvider;
use relaymq::broker::Broker;
use relaymq::cluster::ClusterLinks;
use relaymq::config::Config;
use relaymq::hooks::CompositeHooks;
use relaymq::persistence::PersistenceManager;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// relaymq - clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version)]
#[command(about = "Clustered MQTT v3.1.1/v5.0 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Receive maximum (inbound QoS 2 window)
    #[arg(long)]
    receive_maximum: Option<u16>,

    /// Cluster node identifier
    #[arg(long)]
    node_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI values override the file
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(n) = self.max_connections {
            config.limits.max_connections = n;
        }
        if let Some(n) = self.max_packet_size {
            config.limits.max_packet_size = n;
        }
        if let Some(qos) = self.max_qos {
            config.mqtt.max_qos = qos;
        }
        if let Some(n) = self.receive_maximum {
            config.limits.receive_maximum = n;
        }
        if let Some(node_id) = &self.node_id {
            config.cluster.node_id = Some(node_id.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Error loading configuration: {}", e);
        std::process::exit(1);
    });
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // CLI overrides config; RUST_LOG-style directives are accepted too
    let level = args
        .log_level
        .map(LogLevel::as_str)
        .unwrap_or(config.log.level.as_str());
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {}", path.display());
    }

    let broker_config = config.broker_config();
    info!("Starting relaymq");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Node: {}", broker_config.node_id);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!(
        "  Authentication: {}",
        if config.auth.enabled { "enabled" } else { "disabled" }
    );
    info!(
        "  ACL: {}",
        if config.acl.enabled { "enabled" } else { "disabled" }
    );

    // Auth first, then ACL
    let auth_provider = Arc::new(AuthProvider::new(&config.auth));
    let acl_provider = Arc::new(AclProvider::new(&config.acl, auth_provider.clone()));
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider).with(acl_provider));

    let mut broker = Broker::with_hooks(broker_config, hooks);

    let persistence = if config.persistence.enabled {
        let manager = Arc::new(PersistenceManager::from_config(&config.persistence)?);
        broker = broker.with_persistence(manager.clone());
        Some(manager)
    } else {
        info!("  Persistence: disabled");
        None
    };

    let replication = if config.cluster.enabled {
        let (tx, rx) = mpsc::unbounded_channel();
        broker = broker.with_replication(tx);
        Some(rx)
    } else {
        info!("  Cluster: disabled");
        None
    };

    let broker = Arc::new(broker);

    if let Some(persistence) = &persistence {
        let data = persistence.load_all().await?;
        broker.restore(data, Instant::now());
    }

    let mut cluster_tasks = Vec::new();
    if let Some(rx) = replication {
        info!(
            "  Cluster: listening on {}, peers: {}",
            config.cluster.listen_addr,
            config.cluster.peers.join(", ")
        );
        let links = ClusterLinks::new(config.cluster.clone(), broker.clone());
        cluster_tasks = links.start(rx).await?;
    }

    let server = tokio::spawn(broker.clone().run());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Ctrl-C received, shutting down");
            broker.shutdown(Instant::now());
        }
        result = server => {
            match result {
                Ok(Ok(())) => warn!("Listener stopped"),
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Listener task failed: {}", e),
            }
            broker.shutdown(Instant::now());
        }
    }

    for task in cluster_tasks {
        task.abort();
    }
    if let Some(persistence) = persistence {
        persistence.shutdown().await?;
    }

    info!("relaymq stopped");
    Ok(())
}
