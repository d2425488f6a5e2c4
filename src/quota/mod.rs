//! Monthly call quota tracking.
//!
//! Quota is a billing and notification signal, not an admission gate: usage
//! is counted off the request path and never blocks the current request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::keys::{next_quota_reset, KeyRecord, KeyStore, Owner};
use crate::store::StoreError;

/// Calls left in the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum Remaining {
    Unlimited,
    Limited(u64),
}

/// Quota position of a key after a usage change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub key_id: String,
    pub owner: Owner,
    pub used: u64,
    pub quota: Option<u64>,
    pub remaining: Remaining,
    pub resets_at: DateTime<Utc>,
}

impl QuotaStatus {
    /// `(quota - remaining) / quota * 100`; None when unlimited.
    pub fn percentage(&self) -> Option<f64> {
        match (self.quota, self.remaining) {
            (Some(quota), Remaining::Limited(remaining)) if quota > 0 => {
                Some((quota - remaining) as f64 / quota as f64 * 100.0)
            }
            (Some(0), _) => Some(100.0),
            _ => None,
        }
    }
}

/// Quota operation errors
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaError {
    KeyNotFound(String),
    PlanNotFound(String),
    Store(StoreError),
}

impl std::fmt::Display for QuotaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaError::KeyNotFound(id) => write!(f, "API key '{}' not found", id),
            QuotaError::PlanNotFound(id) => write!(f, "Plan '{}' not found", id),
            QuotaError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for QuotaError {}

impl From<StoreError> for QuotaError {
    fn from(e: StoreError) -> Self {
        QuotaError::Store(e)
    }
}

/// Tracks monthly usage counters on key records.
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn KeyStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Count one call against the key's monthly quota.
    pub fn consume(&self, key_id: &str) -> Result<QuotaStatus, QuotaError> {
        let record = self
            .store
            .increment_usage(key_id)?
            .ok_or_else(|| QuotaError::KeyNotFound(key_id.to_string()))?;
        self.status_of(record)
    }

    pub fn remaining_quota(&self, key_id: &str) -> Result<Remaining, QuotaError> {
        Ok(self.status(key_id)?.remaining)
    }

    pub fn status(&self, key_id: &str) -> Result<QuotaStatus, QuotaError> {
        let record = self
            .store
            .get(key_id)?
            .ok_or_else(|| QuotaError::KeyNotFound(key_id.to_string()))?;
        self.status_of(record)
    }

    pub fn reset(&self, key_id: &str) -> Result<QuotaStatus, QuotaError> {
        self.reset_at(key_id, Utc::now())
    }

    /// Zero the counter and move `quota_reset_at` to the next month start.
    pub fn reset_at(&self, key_id: &str, now: DateTime<Utc>) -> Result<QuotaStatus, QuotaError> {
        let record = self
            .store
            .reset_usage(key_id, next_quota_reset(now))?
            .ok_or_else(|| QuotaError::KeyNotFound(key_id.to_string()))?;
        info!(key_id, resets_at = %record.quota_reset_at, "Quota reset");
        self.status_of(record)
    }

    /// Reset every key whose cycle ended before `now`. Returns how many were reset.
    ///
    /// A failure on one key is logged and does not stop the rest.
    pub fn reset_due(&self, now: DateTime<Utc>) -> Result<usize, QuotaError> {
        let due = self.store.due_for_reset(now)?;
        let mut reset = 0;
        for key_id in &due {
            match self.reset_at(key_id, now) {
                Ok(_) => reset += 1,
                Err(e) => warn!(key_id = %key_id, error = %e, "Failed to reset quota"),
            }
        }
        Ok(reset)
    }

    fn status_of(&self, record: KeyRecord) -> Result<QuotaStatus, QuotaError> {
        let plan = self
            .store
            .plan(&record.plan_id)?
            .ok_or_else(|| QuotaError::PlanNotFound(record.plan_id.clone()))?;
        let remaining = match plan.quota {
            None => Remaining::Unlimited,
            Some(quota) => Remaining::Limited(quota.saturating_sub(record.usage_count)),
        };
        Ok(QuotaStatus {
            key_id: record.id,
            owner: record.owner,
            used: record.usage_count,
            quota: plan.quota,
            remaining,
            resets_at: record.quota_reset_at,
        })
    }
}

/// Background task that periodically resets expired quota cycles.
pub async fn run_quota_reset(tracker: QuotaTracker, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let job = tracker.clone();
        let result = tokio::task::spawn_blocking(move || job.reset_due(Utc::now())).await;
        match result {
            Ok(Ok(count)) => debug!(count, "Quota reset sweep complete"),
            Ok(Err(e)) => warn!(error = %e, "Quota reset sweep failed"),
            Err(e) => warn!(error = %e, "Quota reset task panicked"),
        }
    }
}
