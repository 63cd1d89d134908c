//! Process configuration.
//!
//! Each binary builds one configuration value at startup and hands sections
//! of it to the components it constructs. Sources are layered, later ones
//! overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config <path>`)
//! 3. Environment variables: `PARLEY__<SECTION>__<KEY>`, for example
//!    `PARLEY__LOG__BACKEND=kafka` or `PARLEY__AUTH__SECRET=...`
//!
//! # Example
//!
//! ```toml
//! [http]
//! bind = "0.0.0.0:8080"
//!
//! [log]
//! backend = "kafka"
//! brokers = "kafka-1:9092,kafka-2:9092"
//! dead_letter_topic = "dead-messages"
//!
//! [auth]
//! secret = "change-me"
//! users = { alice = "wonderland" }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const ENV_PREFIX: &str = "PARLEY";

/// Configuration errors. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Durable log backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// Process-local log; producers and consumers must share the process.
    #[default]
    Memory,
    /// Kafka cluster (requires the `kafka` feature)
    Kafka,
}

impl fmt::Display for LogBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogBackend::Memory => write!(f, "memory"),
            LogBackend::Kafka => write!(f, "kafka"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub backend: LogBackend,
    /// Comma-separated broker list
    pub brokers: String,
    pub main_topic: String,
    /// Unset means retries go back to `main_topic`
    pub retry_topic: Option<String>,
    pub dead_letter_topic: String,
    pub consumer_group: String,
    pub publish_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::default(),
            brokers: "localhost:9092".to_string(),
            main_topic: "messages".to_string(),
            retry_topic: None,
            dead_letter_topic: "dead-messages".to_string(),
            consumer_group: "persistence".to_string(),
            publish_timeout_ms: 5000,
        }
    }
}

impl LogConfig {
    /// Topic retries are republished to.
    pub fn retry_topic(&self) -> &str {
        match self.retry_topic.as_deref() {
            Some(topic) if !topic.is_empty() => topic,
            _ => &self.main_topic,
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == LogBackend::Kafka && self.brokers.trim().is_empty() {
            return Err(ConfigError::Invalid("log.brokers must not be empty".into()));
        }
        if self.main_topic.is_empty() || self.dead_letter_topic.is_empty() {
            return Err(ConfigError::Invalid("log topics must not be empty".into()));
        }
        if self.consumer_group.is_empty() {
            return Err(ConfigError::Invalid("log.consumer_group must not be empty".into()));
        }
        if self.main_topic == self.dead_letter_topic {
            return Err(ConfigError::Invalid(
                "log.main_topic and log.dead_letter_topic must differ".into(),
            ));
        }
        if self.retry_topic() == self.dead_letter_topic {
            return Err(ConfigError::Invalid(
                "log.retry_topic and log.dead_letter_topic must differ".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// libSQL database file; unset means an in-memory database
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub max_retry: u32,
    pub publish_attempts: u32,
    pub publish_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            publish_attempts: 3,
            publish_backoff_ms: 100,
        }
    }
}

impl ConsumerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_attempts == 0 {
            return Err(ConfigError::Invalid(
                "consumer.publish_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for issuing and verifying tokens
    pub secret: String,
    pub token_ttl_secs: u64,
    /// username -> password accepted by the login endpoint
    pub users: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_secs: 3600,
            users: HashMap::new(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("users", &self.users.len())
            .finish()
    }
}

impl AuthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("auth.secret is required".into()));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("auth.token_ttl_secs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
    /// How long shutdown waits for open connections to finish
    pub drain_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            drain_timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Configuration of the real-time gateway.
///
/// `store` and `consumer` are used only with the memory log backend, where
/// the persistence consumer runs inside the gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub http: HttpConfig,
    pub log: LogConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub consumer: ConsumerConfig,
    /// Capacity of each connection's outbound channel
    pub outbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            log: LogConfig::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
            consumer: ConsumerConfig::default(),
            outbound_buffer: 256,
        }
    }
}

impl GatewayConfig {
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        load(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.auth.validate()?;
        self.consumer.validate()?;
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("outbound_buffer must be positive".into()));
        }
        Ok(())
    }

    /// Log the effective configuration (without secrets).
    pub fn log_config(&self) {
        info!(
            bind = %self.http.bind,
            backend = %self.log.backend,
            main_topic = %self.log.main_topic,
            retry_topic = %self.log.retry_topic(),
            dead_letter_topic = %self.log.dead_letter_topic,
            outbound_buffer = self.outbound_buffer,
            users = self.auth.users.len(),
            "Gateway configuration"
        );
    }

    /// Configuration for tests: memory backend, in-memory store, fixed secret.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.http.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        config.auth.secret = "test-secret".to_string();
        config
            .auth
            .users
            .insert("alice".to_string(), "wonderland".to_string());
        config.consumer.publish_backoff_ms = 1;
        config
    }
}

/// Configuration of the persistence consumer process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub log: LogConfig,
    pub store: StoreConfig,
    pub consumer: ConsumerConfig,
}

impl PersistConfig {
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        load(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.consumer.validate()
    }

    pub fn log_config(&self) {
        info!(
            backend = %self.log.backend,
            group = %self.log.consumer_group,
            main_topic = %self.log.main_topic,
            retry_topic = %self.log.retry_topic(),
            dead_letter_topic = %self.log.dead_letter_topic,
            max_retry = self.consumer.max_retry,
            store = ?self.store.path,
            "Persistence configuration"
        );
    }
}

/// Layer defaults, an optional file and `PARLEY__*` environment variables.
pub fn load<T: DeserializeOwned>(file: Option<&Path>) -> Result<T, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    Ok(builder.build()?.try_deserialize()?)
}
