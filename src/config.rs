//! Configuration module
//!
//! TOML file (default `~/.config/ocpp-netnode/config.toml`), every
//! section optional. Missing file means defaults, so a bare binary
//! comes up as a standalone node listening on 9000.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::decision::DefaultPolicy;
use crate::wire::signature::{SignatureKeyring, VerifyMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Where the config file lives unless `NETNODE_CONFIG` says otherwise.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-netnode")
        .join("config.toml")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub upstream: UpstreamConfig,
    pub routing: RoutingConfig,
    pub signing: SigningConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Identity and listen socket of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Logical node identifier on the overlay.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Links without traffic for this long are considered dead.
    pub stale_timeout_seconds: i64,
}

/// The CSMS (or parent node) this node connects up to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub enabled: bool,
    /// e.g. "ws://csms.example:9000/nn/NN-1"
    pub url: String,
    /// Node identity of the parent on the other end of the link.
    pub id: String,
    /// Whether the upstream link speaks the overlay framing.
    pub overlay: bool,
    /// Seconds between reconnect attempts.
    pub reconnect_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Applied when no filter is registered for an action.
    pub default_policy: DefaultPolicy,
    /// Default per-request timeout in seconds.
    pub request_timeout_seconds: u64,
    /// How long a relay back-route is kept without its response.
    pub relay_ttl_seconds: u64,
}

/// Message signing and verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub verify: VerifyMode,
    /// key id -> hex-encoded shared secret
    pub keys: std::collections::HashMap<String, String>,
    /// Key used to sign locally-produced and rewritten payloads.
    pub sign_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "NN-1".to_string(),
            host: "0.0.0.0".to_string(),
            port: 9000,
            stale_timeout_seconds: 300,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            id: "CSMS".to_string(),
            overlay: true,
            reconnect_seconds: 5,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Forward,
            request_timeout_seconds: 30,
            relay_ttl_seconds: 120,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 9100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::Invalid("node.id must not be empty".into()));
        }
        if self.routing.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "routing.request_timeout_seconds must be positive".into(),
            ));
        }
        if self.upstream.enabled && self.upstream.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.url required when upstream.enabled".into(),
            ));
        }
        if self.upstream.enabled && self.upstream.id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.id required when upstream.enabled".into(),
            ));
        }
        if let Some(key) = &self.signing.sign_key {
            if !self.signing.keys.contains_key(key) {
                return Err(ConfigError::Invalid(format!(
                    "signing.sign_key '{key}' has no entry in signing.keys"
                )));
            }
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    pub fn metrics_address(&self) -> String {
        format!("{}:{}", self.metrics.host, self.metrics.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.routing.request_timeout_seconds)
    }

    pub fn relay_ttl(&self) -> Duration {
        Duration::from_secs(self.routing.relay_ttl_seconds)
    }

    /// Decode the configured hex secrets into a keyring.
    pub fn build_keyring(&self) -> Result<SignatureKeyring, ConfigError> {
        let mut keyring = SignatureKeyring::new();
        for (key_id, secret_hex) in &self.signing.keys {
            let secret = hex::decode(secret_hex).map_err(|e| {
                ConfigError::Invalid(format!("signing.keys.{key_id} is not hex: {e}"))
            })?;
            keyring.insert(key_id.clone(), secret);
        }
        Ok(keyring)
    }
}
