//! Worker configuration
//!
//! Loaded from TOML. Credentials are never stored in the file itself: the
//! broker options name environment variables that are read at connect time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// URL schemes the bundled broker driver understands
pub const SUPPORTED_SCHEMES: &[&str] = &["mqtt", "mqtts", "tcp", "ssl", "memory"];

/// Top-level worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with scheme, host and port
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Durable queue the worker consumes from
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Durable direct exchange asserted for the deployment
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Maximum connection attempts, for the initial connect and for each reconnect cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between connection attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Interval for "still retrying" log lines while waiting between reconnect attempts
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval_secs: u64,
    /// Time allowed for a single connection attempt to be acknowledged
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub options: BrokerOptions,
}

/// Broker-specific connection options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerOptions {
    /// Stable client identifier; generated when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Prefix prepended to exchange/queue names when mapped onto topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Start every session clean (drops broker-side queued messages)
    #[serde(default)]
    pub clean_start: bool,
    /// How long the broker keeps a persistent session after a disconnect
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u32,
    /// Shared subscription group; workers in one group split a queue's messages.
    /// Empty subscribes to the plain topic.
    #[serde(default = "default_share_group")]
    pub share_group: String,
}

/// Worker process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Upper bound on waiting for in-flight tasks during shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_queue() -> String {
    "celery".to_string()
}

fn default_exchange() -> String {
    "default".to_string()
}

fn default_max_retries() -> u32 {
    600
}

fn default_retry_delay_ms() -> u64 {
    60_000 // one minute
}

fn default_progress_log_interval() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    60
}

fn default_topic_prefix() -> String {
    "celery".to_string()
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

fn default_session_expiry() -> u32 {
    3600
}

fn default_share_group() -> String {
    "celery-workers".to_string()
}

fn default_drain_timeout() -> u64 {
    30
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            queue: default_queue(),
            exchange: default_exchange(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            progress_log_interval_secs: default_progress_log_interval(),
            connect_timeout_secs: default_connect_timeout(),
            options: BrokerOptions::default(),
        }
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            topic_prefix: default_topic_prefix(),
            max_packet_size: default_max_packet_size(),
            clean_start: false,
            session_expiry_secs: default_session_expiry(),
            share_group: default_share_group(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl BrokerSection {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate broker settings consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.url).map_err(|_| ConfigError::InvalidBrokerUrl(self.url.clone()))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{} (unsupported scheme '{}')",
                self.url,
                url.scheme()
            )));
        }
        if self.queue.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.queue must not be empty".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.max_retries must be greater than 0".to_string(),
            ));
        }
        if self.options.share_group.contains(['/', '+', '#']) {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.options.share_group '{}' must be a single topic level",
                self.options.share_group
            )));
        }
        Ok(())
    }
}

impl BrokerOptions {
    /// Resolve username and password from the configured environment variables
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }

    /// Fill in a generated client id when none is configured
    ///
    /// A persistent session is keyed by the client id, so it is generated
    /// once and reused for every later connection attempt.
    pub fn ensure_client_id(&mut self) -> &str {
        self.client_id
            .get_or_insert_with(|| format!("celery-worker-{}", Uuid::new_v4().simple()))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorkerConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.drain_timeout_secs)
    }
}
