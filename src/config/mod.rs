//! # Configuration Management Module
//!
//! TOML configuration for the collector. Every section has serde defaults, so a partial file
//! (or an empty one) loads into a working configuration.
//!
//! ## Configuration Structure
//!
//! - [`MqttConfig`] - Broker connection, topic subscription and reconnect policy
//! - [`DatabaseConfig`] - SQLite packet store location
//! - [`DecryptionConfig`] - Candidate channel keys, tried in order
//! - [`RetentionConfig`] - History window and cleanup cadence
//! - [`CacheConfig`] - Node-name cache eviction
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshtrace::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Broker: {}:{}", config.mqtt.host, config.mqtt.port);
//!     println!("Subscription: {}", config.mqtt.subscription());
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [mqtt]
//! host = "mqtt.meshtastic.org"
//! port = 1883
//! topic_prefix = "msh/US"
//! topic_suffix = "/#"
//!
//! [database]
//! path = "meshtrace.db"
//!
//! [decryption]
//! keys = ["1PG7OiApB1nwvP+rz05pAQ=="]
//!
//! [retention]
//! hours = 168
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::crypto::DEFAULT_CHANNEL_KEY;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub decryption: DecryptionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub topic_prefix: String,
    pub topic_suffix: String,
    pub client_id: String,
    pub keepalive_secs: u64,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    /// Give up after this many consecutive failed attempts (0 = never give up).
    pub reconnect_max_attempts: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "mqtt.meshtastic.org".to_string(),
            port: 1883,
            username: Some("meshdev".to_string()),
            password: Some("large4cats".to_string()),
            topic_prefix: "msh/US".to_string(),
            topic_suffix: "/#".to_string(),
            client_id: "meshtrace".to_string(),
            keepalive_secs: 60,
            reconnect_base_secs: 1,
            reconnect_max_secs: 60,
            reconnect_max_attempts: 20,
        }
    }
}

impl MqttConfig {
    /// Full subscription filter, prefix plus wildcard suffix.
    pub fn subscription(&self) -> String {
        format!("{}{}", self.topic_prefix.trim_end_matches('/'), self.topic_suffix)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(5))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "meshtrace.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptionConfig {
    /// Base64 channel keys.
    pub keys: Vec<String>,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            keys: vec![DEFAULT_CHANNEL_KEY.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// History window; zero or negative disables cleanup.
    pub hours: i64,
    pub interval_minutes: u64,
    /// How long shutdown waits for a running pass before abandoning it.
    pub stop_grace_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hours: 168,
            interval_minutes: 60,
            stop_grace_secs: 10,
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1).saturating_mul(60))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub node_name_eviction_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_name_eviction_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.node_name_eviction_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshtrace.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(anyhow!("mqtt.host must not be empty"));
        }
        if self.mqtt.reconnect_base_secs == 0 || self.mqtt.reconnect_max_secs < self.mqtt.reconnect_base_secs {
            return Err(anyhow!(
                "mqtt reconnect delays invalid: base={}s max={}s",
                self.mqtt.reconnect_base_secs,
                self.mqtt.reconnect_max_secs
            ));
        }
        if self.database.path.trim().is_empty() {
            return Err(anyhow!("database.path must not be empty"));
        }
        if self.decryption.keys.is_empty() {
            log::warn!("No decryption keys configured; encrypted packets will be stored opaque");
        }
        Ok(())
    }
}
