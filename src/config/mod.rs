pub mod runtime;
pub use runtime::{new_runtime_config, RuntimeConfig, SharedRuntimeConfig};

use serde::Deserialize;
use std::time::Duration;

use crate::keys::KeySettings;
use crate::rate_limit::RateWindows;
use crate::telemetry::TelemetrySettings;

pub use crate::nats::NatsConfig;

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub nats: NatsConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bearer token for key management and admin routes. None = unrestricted (dev mode)
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Budget for a single store call on the request path
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_database_path() -> String {
    "gatekeep.db".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Key presentation
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_live_prefix")]
    pub live_prefix: String,
    #[serde(default = "default_sandbox_prefix")]
    pub sandbox_prefix: String,
    #[serde(default = "default_sandbox_ttl_days")]
    pub sandbox_ttl_days: i64,
}

fn default_live_prefix() -> String {
    "gk_live".to_string()
}

fn default_sandbox_prefix() -> String {
    "gk_test".to_string()
}

fn default_sandbox_ttl_days() -> i64 {
    crate::keys::DEFAULT_SANDBOX_TTL_DAYS
}

impl KeysConfig {
    pub fn settings(&self) -> KeySettings {
        KeySettings {
            live_prefix: self.live_prefix.clone(),
            sandbox_prefix: self.sandbox_prefix.clone(),
            sandbox_ttl_days: self.sandbox_ttl_days,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            live_prefix: default_live_prefix(),
            sandbox_prefix: default_sandbox_prefix(),
            sandbox_ttl_days: default_sandbox_ttl_days(),
        }
    }
}

/// Rate limit windows
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_sustained_window")]
    pub sustained_window_seconds: u64,
    #[serde(default = "default_burst_window")]
    pub burst_window_seconds: u64,
    /// Extra lifetime of a window key past its window
    #[serde(default = "default_grace")]
    pub grace_seconds: u64,
}

fn default_sustained_window() -> u64 {
    60
}

fn default_burst_window() -> u64 {
    10
}

fn default_grace() -> u64 {
    5
}

impl RateLimitConfig {
    pub fn windows(&self) -> RateWindows {
        RateWindows {
            sustained: Duration::from_secs(self.sustained_window_seconds),
            burst: Duration::from_secs(self.burst_window_seconds),
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sustained_window_seconds: default_sustained_window(),
            burst_window_seconds: default_burst_window(),
            grace_seconds: default_grace(),
        }
    }
}

/// Quota cycle maintenance
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// How often to sweep for keys whose monthly cycle ended
    #[serde(default = "default_reset_interval")]
    pub reset_interval_seconds: u64,
}

fn default_reset_interval() -> u64 {
    3600
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reset_interval_seconds: default_reset_interval(),
        }
    }
}

/// Usage telemetry workers and detectors
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_latency_buffer_size")]
    pub latency_buffer_size: usize,
    #[serde(default = "default_error_rate_window")]
    pub error_rate_window_seconds: u64,
    #[serde(default = "default_error_rate_min_samples")]
    pub error_rate_min_samples: u64,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: f64,
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_seconds: u64,
    /// How often expired counters are purged from memory
    #[serde(default = "default_purge_interval")]
    pub purge_interval_seconds: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_latency_buffer_size() -> usize {
    1000
}

fn default_error_rate_window() -> u64 {
    300
}

fn default_error_rate_min_samples() -> u64 {
    10
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_threshold_percent() -> f64 {
    90.0
}

fn default_dedup_ttl() -> u64 {
    86_400
}

fn default_purge_interval() -> u64 {
    60
}

impl TelemetryConfig {
    /// Detector settings; counter TTLs keep their defaults
    pub fn settings(&self) -> TelemetrySettings {
        TelemetrySettings {
            latency_buffer_size: self.latency_buffer_size,
            error_rate_window: Duration::from_secs(self.error_rate_window_seconds),
            error_rate_min_samples: self.error_rate_min_samples,
            error_rate_threshold: self.error_rate_threshold,
            threshold_percent: self.threshold_percent,
            dedup_ttl: Duration::from_secs(self.dedup_ttl_seconds),
            ..TelemetrySettings::default()
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            latency_buffer_size: default_latency_buffer_size(),
            error_rate_window_seconds: default_error_rate_window(),
            error_rate_min_samples: default_error_rate_min_samples(),
            error_rate_threshold: default_error_rate_threshold(),
            threshold_percent: default_threshold_percent(),
            dedup_ttl_seconds: default_dedup_ttl(),
            purge_interval_seconds: default_purge_interval(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: GatewayConfig = toml::from_str(&contents)?;
    Ok(config)
}
