//! Node configuration.
//!
//! Layered, lowest precedence first: built-in defaults, an optional YAML
//! file, `TASKSYNC__*` environment variables (`__` separates sections, e.g.
//! `TASKSYNC__SERVER__LISTEN_ADDR`), then command-line overrides applied by
//! the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tasksync_realtime::{ActivityConfig, HubConfig, MqttBridgeConfig, PresenceConfig};
use thiserror::Error;
use validator::Validate;

use crate::observability::LogFormat;

/// Accepted log levels.
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NodeConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub auth: AuthConfig,
    #[validate(nested)]
    pub presence: PresenceSettings,
    #[validate(nested)]
    pub activity: ActivitySettings,
    #[validate(nested)]
    pub bridge: BridgeSettings,
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Identifies this node on the bridge. Random when unset.
    pub node_id: Option<String>,
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            node_id: None,
            max_connections: 10_000,
        }
    }
}

/// Handshake verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuthConfig {
    /// Hex-encoded Ed25519 verification key of the token issuer.
    #[validate(length(equal = 64))]
    pub verification_key: String,
    /// Active user ids.
    pub users: Vec<String>,
}

/// Presence timings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PresenceSettings {
    #[validate(range(min = 100, max = 60_000))]
    pub typing_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub remote_ttl_secs: u64,
    #[validate(range(min = 1))]
    pub heartbeat_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            typing_timeout_ms: 5_000,
            remote_ttl_secs: 90,
            heartbeat_secs: 30,
        }
    }
}

/// Activity feed retention.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ActivitySettings {
    #[validate(range(min = 1, max = 10_000))]
    pub max_per_user: usize,
    #[validate(range(min = 1, max = 3650))]
    pub max_age_days: u64,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            max_per_user: 100,
            max_age_days: 30,
        }
    }
}

/// Pub/sub used between nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    /// In-process channel; only nodes in the same process see each other.
    #[default]
    Memory,
    /// MQTT broker.
    Mqtt,
}

/// Cross-node bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BridgeSettings {
    pub kind: BridgeKind,
    #[validate(length(min = 1))]
    pub broker_url: String,
    #[validate(length(min = 1))]
    pub topic_prefix: String,
    /// MQTT client id. Derived from the node id when unset.
    pub client_id: Option<String>,
    #[validate(range(min = 5, max = 3600))]
    pub keep_alive_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let mqtt = MqttBridgeConfig::default();
        Self {
            kind: BridgeKind::Memory,
            broker_url: mqtt.broker_url,
            topic_prefix: mqtt.topic_prefix,
            client_id: None,
            keep_alive_secs: mqtt.keep_alive_secs,
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    #[validate(length(min = 1))]
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&NodeConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TASKSYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("auth.users"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Check every field.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }
        if !self.auth.verification_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid(
                "auth.verification_key must be hex".to_string(),
            ));
        }
        Ok(())
    }

    /// Node id, generating one when unset.
    pub fn node_id(&self) -> String {
        self.server
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()))
    }

    /// Settings for the sync hub.
    pub fn hub_config(&self, node_id: String) -> HubConfig {
        HubConfig {
            node_id,
            max_connections: self.server.max_connections,
            presence: PresenceConfig {
                typing_timeout: Duration::from_millis(self.presence.typing_timeout_ms),
                remote_ttl: Duration::from_secs(self.presence.remote_ttl_secs),
                heartbeat_interval: Duration::from_secs(self.presence.heartbeat_secs),
            },
            activity: ActivityConfig {
                max_per_user: self.activity.max_per_user,
                max_age: Duration::from_secs(self.activity.max_age_days * 24 * 60 * 60),
            },
        }
    }

    /// Settings for the MQTT transport.
    pub fn mqtt_config(&self, node_id: &str) -> MqttBridgeConfig {
        MqttBridgeConfig {
            broker_url: self.bridge.broker_url.clone(),
            client_id: self
                .bridge
                .client_id
                .clone()
                .unwrap_or_else(|| format!("tasksync-{}", node_id)),
            topic_prefix: self.bridge.topic_prefix.clone(),
            keep_alive_secs: self.bridge.keep_alive_secs,
        }
    }
}
