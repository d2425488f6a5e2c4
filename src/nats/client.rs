use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream};
use serde::Deserialize;
use tracing::info;

/// NATS configuration
#[derive(Clone, Debug, Deserialize)]
pub struct NatsConfig {
    /// Publish notifications to JetStream instead of the log
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_stream_subjects")]
    pub stream_subjects: Vec<String>,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i64,
}

fn default_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_stream_name() -> String {
    "GATEKEEP_NOTIFICATIONS".to_string()
}

fn default_stream_subjects() -> Vec<String> {
    vec!["gatekeep.notifications.>".to_string()]
}

fn default_max_age_days() -> i64 {
    7
}

fn default_max_bytes() -> i64 {
    1024 * 1024 * 1024 // 1GB
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_url(),
            stream_name: default_stream_name(),
            stream_subjects: default_stream_subjects(),
            max_age_days: default_max_age_days(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// NATS client with JetStream
pub struct NatsClient {
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to NATS and initialize JetStream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;

        let nats_client = Self {
            jetstream: jetstream::new(client),
            config,
        };

        nats_client.ensure_stream().await?;

        Ok(nats_client)
    }

    /// Ensure the notification stream exists
    async fn ensure_stream(&self) -> Result<()> {
        if self.jetstream.get_stream(&self.config.stream_name).await.is_ok() {
            info!("Stream '{}' already exists", self.config.stream_name);
            return Ok(());
        }

        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: self.config.stream_subjects.clone(),
            max_age: std::time::Duration::from_secs((self.config.max_age_days * 86400) as u64),
            max_bytes: self.config.max_bytes,
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        self.jetstream
            .create_stream(stream_config)
            .await
            .context("Failed to create JetStream stream")?;

        info!("Created JetStream stream '{}'", self.config.stream_name);
        Ok(())
    }

    /// Get JetStream context for publishing
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }
}
