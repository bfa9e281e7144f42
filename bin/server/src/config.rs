//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables. Nested sections
//! use `__` as separator, e.g. `NATS__URL` or `POLLER__INTERVAL_MS`.

use serde::Deserialize;
use std::time::Duration;
use switchyard_messaging::{NatsConfig, RetryPolicy};
use switchyard_scheduler::PollerConfig;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the management API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Name used as consumer group, retry source and audit actor.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Explicit 10-bit node id. Derived from the host when absent.
    #[serde(default)]
    pub node_id: Option<u16>,

    #[serde(default)]
    pub nats: NatsSettings,

    #[serde(default)]
    pub topics: TopicConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub poller: PollerSettings,
}

/// NATS connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    #[serde(default = "default_nats_url")]
    pub url: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default = "default_dedup_bucket")]
    pub dedup_bucket: String,
}

/// Topic names.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Topic carrying START_WORKFLOW and FINISH_TASK events.
    #[serde(default = "default_workflow_event_topic")]
    pub workflow_event: String,

    /// Topic retry intents are published to.
    #[serde(default = "default_retries_topic")]
    pub retries: String,
}

/// Delivery policy of the workflow event consumers.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Retry attempts after a transient failure. Zero disables retries.
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

/// Wait-task poller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_poller_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_application_name() -> String {
    "switchyard".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_dedup_bucket() -> String {
    "switchyard-dedup".to_string()
}

fn default_workflow_event_topic() -> String {
    "workflow-event".to_string()
}

fn default_retries_topic() -> String {
    "retries-event".to_string()
}

fn default_repeat_count() -> u32 {
    10
}

fn default_delay_ms() -> u64 {
    300
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_dedup_ttl_secs() -> u64 {
    12 * 60 * 60
}

fn default_poller_interval_ms() -> u64 {
    5_000
}

fn default_page_size() -> usize {
    1_000
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            partitions: default_partitions(),
            dedup_bucket: default_dedup_bucket(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            workflow_event: default_workflow_event_topic(),
            retries: default_retries_topic(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            repeat_count: default_repeat_count(),
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poller_interval_ms(),
            page_size: default_page_size(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    #[must_use]
    pub fn nats_config(&self) -> NatsConfig {
        NatsConfig {
            partitions: Some(self.nats.partitions),
            dedup_bucket_name: Some(self.nats.dedup_bucket.clone()),
            dedup_ttl: Some(self.consumer.dedup_ttl()),
            ..NatsConfig::new(self.nats.url.clone())
        }
    }

    #[must_use]
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::new(self.application_name.clone())
            .with_interval(Duration::from_millis(self.poller.interval_ms))
            .with_page_size(self.poller.page_size)
    }
}

impl ConsumerConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            repeat_count: self.repeat_count,
            delay: Duration::from_millis(self.delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    #[must_use]
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}
