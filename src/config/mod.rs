//! Configuration Module
//!
//! TOML configuration for relaymq with support for:
//! - Server settings (bind address, connect timeout, tick interval)
//! - Connection and packet limits
//! - Session parameters
//! - MQTT feature flags
//! - Authentication and ACL
//! - Cluster peers
//! - Persistence
//! - `${VAR}` substitution and `RELAYMQ__` environment overrides

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;

pub use cluster::ClusterConfig;
pub use persistence::{BackendType, PersistenceConfig};

mod cluster;
mod persistence;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
    pub cluster: ClusterConfig,
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Time allowed between accept and CONNECT
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maintenance tick (keep-alive, wills, expiry)
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            connect_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Receive maximum advertised to clients (inbound QoS 2 window)
    pub receive_maximum: u16,
    /// Maximum queued messages per offline client
    pub max_queued_messages: usize,
    /// Maximum levels in a topic name or filter
    pub max_topic_levels: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            receive_maximum: 1024,
            max_queued_messages: 1000,
            max_topic_levels: 128,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Clamp for client keep-alive in seconds; 0 leaves it untouched
    pub max_keep_alive: u16,
    /// Upper bound for requested session expiry (e.g. "1d"); unset is unbounded
    #[serde(with = "humantime_serde")]
    pub max_session_expiry: Option<Duration>,
    /// Maximum inbound topic aliases; 0 disables them
    pub max_topic_aliases: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_keep_alive: 0,
            max_session_expiry: None,
            max_topic_aliases: 64,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub shared_subscriptions: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    pub roles: Vec<AclRole>,
    /// Permissions for users without a role, anonymous clients included
    pub default: AclPermissions,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    /// Topic patterns this role can publish to; `%c` and `%u` expand to the
    /// client id and username
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `RELAYMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///    - `RELAYMQ__CLUSTER__PEERS=a:7947,b:7947` overrides `cluster.peers`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("auth.allow_anonymous", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file: defaults plus environment
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore
        // stays part of the field name
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.peers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from environment variables only (no file)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.limits.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "receive_maximum must be at least 1".to_string(),
            ));
        }
        if self.limits.max_packet_size < 64 {
            return Err(ConfigError::Validation(
                "max_packet_size must be at least 64 bytes".to_string(),
            ));
        }
        if self.server.tick_interval.is_zero() {
            return Err(ConfigError::Validation(
                "tick_interval must be greater than zero".to_string(),
            ));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                match (&user.password, &user.password_hash) {
                    (None, None) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' must have either 'password' or 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' cannot have both 'password' and 'password_hash'",
                            user.username
                        )));
                    }
                    (Some(pwd), None) if pwd.is_empty() => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has empty password",
                            user.username
                        )));
                    }
                    (None, Some(hash)) if !hash.starts_with("$argon2") => {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    _ => {}
                }
            }
        }

        if self.auth.enabled && self.acl.enabled {
            let role_names: std::collections::HashSet<_> =
                self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        if self.cluster.enabled {
            if self.cluster.reconnect_min.is_zero()
                || self.cluster.reconnect_min > self.cluster.reconnect_max
            {
                return Err(ConfigError::Validation(
                    "cluster reconnect_min must be non-zero and at most reconnect_max".to_string(),
                ));
            }
            if self.cluster.node_id.as_deref() == Some("") {
                return Err(ConfigError::Validation(
                    "cluster node_id must not be empty".to_string(),
                ));
            }
        }

        self.persistence.validate()
    }

    /// Runtime broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        let node_id = if self.cluster.enabled {
            self.cluster.get_node_id()
        } else {
            self.cluster
                .node_id
                .clone()
                .unwrap_or_else(|| "relaymq".to_string())
        };
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.server.connect_timeout,
            max_keep_alive: self.session.max_keep_alive,
            max_session_expiry: self
                .session
                .max_session_expiry
                .map(|d| d.as_secs().min(u32::MAX as u64) as u32),
            receive_maximum: self.limits.receive_maximum,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            wildcard_subscription_available: self.mqtt.wildcard_subscriptions,
            subscription_identifiers_available: self.mqtt.subscription_identifiers,
            shared_subscriptions_available: self.mqtt.shared_subscriptions,
            max_topic_alias: self.session.max_topic_aliases,
            max_topic_levels: self.limits.max_topic_levels,
            max_queued_messages: self.limits.max_queued_messages,
            tick_interval: self.server.tick_interval,
            node_id,
        }
    }
}
