use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Runtime-configurable admission limits. Changes via PUT /api/admin/config
/// take effect on the next request without restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub rate_limit_enabled: bool,
    /// Gateway-wide ceiling across all keys; None disables the global scope
    pub global_limit_per_minute: Option<u64>,
    /// Ceiling per method+path across all keys; None disables the endpoint scope
    pub endpoint_limit_per_minute: Option<u64>,
    /// Admit requests when the counter store cannot answer
    pub rate_limit_fail_open: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            global_limit_per_minute: None,
            endpoint_limit_per_minute: None,
            rate_limit_fail_open: true,
        }
    }
}

impl RuntimeConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(b) =
            lookup("GATEKEEP_RATE_LIMIT_ENABLED").and_then(|v| v.parse::<bool>().ok())
        {
            cfg.rate_limit_enabled = b;
        }
        if let Some(n) =
            lookup("GATEKEEP_GLOBAL_LIMIT_PER_MINUTE").and_then(|v| v.parse::<u64>().ok())
        {
            cfg.global_limit_per_minute = Some(n);
        }
        if let Some(n) =
            lookup("GATEKEEP_ENDPOINT_LIMIT_PER_MINUTE").and_then(|v| v.parse::<u64>().ok())
        {
            cfg.endpoint_limit_per_minute = Some(n);
        }
        if let Some(b) =
            lookup("GATEKEEP_RATE_LIMIT_FAIL_OPEN").and_then(|v| v.parse::<bool>().ok())
        {
            cfg.rate_limit_fail_open = b;
        }

        cfg
    }
}

pub type SharedRuntimeConfig = Arc<RwLock<RuntimeConfig>>;

pub fn new_runtime_config() -> SharedRuntimeConfig {
    Arc::new(RwLock::new(RuntimeConfig::from_env()))
}
