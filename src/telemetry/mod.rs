//! Usage telemetry.
//!
//! Completed requests are enqueued as [`UsageEvent`]s by the admission layer
//! and processed off the request path by a pool of workers. Processing
//! updates rolling counters, counts quota usage and derives threshold and
//! anomaly notifications for the [`Notifier`].
//!
//! Delivery is at-least-once. Each event id is remembered for
//! `dedup_ttl` so a redelivered event is skipped instead of counted twice,
//! and each threshold fires at most once per quota cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::quota::{QuotaError, QuotaStatus, QuotaTracker};
use crate::store::{CounterStore, StoreError};

mod notifier;
mod queue;
mod usage_log;

#[cfg(test)]
mod tests;

pub use notifier::{LogNotifier, Notification, NotificationKind, Notifier};
pub use queue::{spawn_workers, UsageEmitter};
pub use usage_log::{MemoryUsageLog, SqliteUsageLog, UsageLog};

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub event_id: String,
    pub key_id: String,
    pub product_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub latency_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// `METHOD /path`
    pub endpoint: String,
}

impl UsageEvent {
    pub fn new(key_id: &str, endpoint: &str, status_code: u16, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            key_id: key_id.to_string(),
            product_id: None,
            timestamp,
            status_code,
            latency_ms: 0,
            bytes_in: 0,
            bytes_out: 0,
            endpoint: endpoint.to_string(),
        }
    }

    /// Client and server errors both count toward the error rate
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Telemetry tuning
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub latency_buffer_size: usize,
    pub latency_ttl: Duration,
    pub error_rate_window: Duration,
    pub error_rate_min_samples: u64,
    /// Fraction in `0.0..=1.0`; the rate must exceed it
    pub error_rate_threshold: f64,
    pub threshold_percent: f64,
    pub dedup_ttl: Duration,
    pub key_counter_ttl: Duration,
    pub product_counter_ttl: Duration,
    pub day_counter_ttl: Duration,
    pub hour_counter_ttl: Duration,
    pub status_counter_ttl: Duration,
    pub endpoint_counter_ttl: Duration,
}

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            latency_buffer_size: 1000,
            latency_ttl: Duration::from_secs(DAY),
            error_rate_window: Duration::from_secs(300),
            error_rate_min_samples: 10,
            error_rate_threshold: 0.5,
            threshold_percent: 90.0,
            dedup_ttl: Duration::from_secs(DAY),
            key_counter_ttl: Duration::from_secs(35 * DAY),
            product_counter_ttl: Duration::from_secs(35 * DAY),
            day_counter_ttl: Duration::from_secs(7 * DAY),
            hour_counter_ttl: Duration::from_secs(48 * HOUR),
            status_counter_ttl: Duration::from_secs(DAY),
            endpoint_counter_ttl: Duration::from_secs(DAY),
        }
    }
}

/// What processing one event amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Recorded { notifications: usize },
    Duplicate,
    Failed(String),
}

/// Telemetry processing errors
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryError {
    Store(StoreError),
    Quota(QuotaError),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::Store(e) => write!(f, "counter store: {}", e),
            TelemetryError::Quota(e) => write!(f, "quota: {}", e),
        }
    }
}

impl std::error::Error for TelemetryError {}

impl From<StoreError> for TelemetryError {
    fn from(e: StoreError) -> Self {
        TelemetryError::Store(e)
    }
}

impl From<QuotaError> for TelemetryError {
    fn from(e: QuotaError) -> Self {
        TelemetryError::Quota(e)
    }
}

/// Result of the synchronous half of processing
#[derive(Debug)]
pub enum Recorded {
    Duplicate,
    Applied(Vec<Notification>),
}

/// Consumes usage events and raises notifications.
#[derive(Clone)]
pub struct UsageTelemetry {
    counters: Arc<dyn CounterStore>,
    quota: QuotaTracker,
    log: Arc<dyn UsageLog>,
    notifier: Arc<dyn Notifier>,
    settings: TelemetrySettings,
}

fn ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

impl UsageTelemetry {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        quota: QuotaTracker,
        log: Arc<dyn UsageLog>,
        notifier: Arc<dyn Notifier>,
        settings: TelemetrySettings,
    ) -> Self {
        Self {
            counters,
            quota,
            log,
            notifier,
            settings,
        }
    }

    /// Process one event end to end. Never fails: errors are logged and a
    /// notifier failure does not undo or retry the counter updates.
    pub async fn process(&self, event: UsageEvent) -> ProcessOutcome {
        let event_id = event.event_id.clone();
        let recorder = self.clone();
        let recorded = tokio::task::spawn_blocking(move || recorder.record(&event)).await;

        let notifications = match recorded {
            Ok(Ok(Recorded::Duplicate)) => {
                debug!(event_id = %event_id, "Skipping duplicate usage event");
                return ProcessOutcome::Duplicate;
            }
            Ok(Ok(Recorded::Applied(notifications))) => notifications,
            Ok(Err(e)) => {
                error!(event_id = %event_id, error = %e, "Failed to record usage event");
                return ProcessOutcome::Failed(e.to_string());
            }
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Usage recording task failed");
                return ProcessOutcome::Failed(e.to_string());
            }
        };

        let count = notifications.len();
        for notification in &notifications {
            if let Err(e) = self.notifier.notify(notification).await {
                warn!(
                    event_id = %event_id,
                    kind = notification.kind.as_str(),
                    error = %e,
                    "Notifier failed; notification dropped"
                );
            }
        }
        ProcessOutcome::Recorded {
            notifications: count,
        }
    }

    /// Apply an event to counters and quota; return notifications to send.
    ///
    /// All windows and TTLs are measured from the event's own timestamp.
    /// The dedup marker is released when applying fails so a redelivery is
    /// retried rather than skipped.
    pub fn record(&self, event: &UsageEvent) -> Result<Recorded, TelemetryError> {
        let now_ms = event.timestamp.timestamp_millis();

        let seen_key = format!("usage:seen:{}", event.event_id);
        if !self
            .counters
            .set_if_absent(&seen_key, now_ms, ms(self.settings.dedup_ttl))?
        {
            return Ok(Recorded::Duplicate);
        }

        self.apply(event, now_ms).map_err(|e| {
            if let Err(release) = self.counters.remove(&seen_key) {
                warn!(
                    event_id = %event.event_id,
                    error = %release,
                    "Failed to release dedup marker"
                );
            }
            e
        })
    }

    fn apply(&self, event: &UsageEvent, now_ms: i64) -> Result<Recorded, TelemetryError> {
        if let Err(e) = self.log.record(event) {
            warn!(event_id = %event.event_id, error = %e, "Failed to persist usage event");
        }

        self.update_counters(event, now_ms)?;

        let mut notifications = Vec::new();
        let status = match self.quota.consume(&event.key_id) {
            Ok(status) => Some(status),
            Err(QuotaError::KeyNotFound(_)) => {
                warn!(key_id = %event.key_id, "Usage event for unknown key");
                None
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(status) = &status {
            notifications.extend(self.quota_notifications(status, now_ms)?);
        }
        if let Some(notification) = self.error_rate_notification(event, status.as_ref(), now_ms)? {
            notifications.push(notification);
        }

        Ok(Recorded::Applied(notifications))
    }

    fn update_counters(&self, event: &UsageEvent, now_ms: i64) -> Result<(), StoreError> {
        let s = &self.settings;
        let key = &event.key_id;
        let day = event.timestamp.format("%Y%m%d");
        let hour = event.timestamp.format("%Y%m%d%H");

        self.counters
            .increment(&format!("usage:key:{}", key), now_ms, ms(s.key_counter_ttl))?;
        if let Some(product) = &event.product_id {
            self.counters.increment(
                &format!("usage:product:{}", product),
                now_ms,
                ms(s.product_counter_ttl),
            )?;
        }
        self.counters.increment(
            &format!("usage:day:{}:{}", key, day),
            now_ms,
            ms(s.day_counter_ttl),
        )?;
        self.counters.increment(
            &format!("usage:hour:{}:{}", key, hour),
            now_ms,
            ms(s.hour_counter_ttl),
        )?;
        self.counters.increment(
            &format!("usage:status:{}:{}", key, event.status_code),
            now_ms,
            ms(s.status_counter_ttl),
        )?;
        self.counters.increment(
            &format!("usage:endpoint:{}:{}", key, event.endpoint),
            now_ms,
            ms(s.endpoint_counter_ttl),
        )?;
        self.counters.push_capped(
            &format!("latency:{}", key),
            event.latency_ms as f64,
            s.latency_buffer_size,
            now_ms,
            ms(s.latency_ttl),
        )?;
        Ok(())
    }

    /// Threshold events for the crossing this call caused, at most once per cycle.
    fn quota_notifications(
        &self,
        status: &QuotaStatus,
        now_ms: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let Some(quota) = status.quota else {
            return Ok(Vec::new());
        };
        let mut notifications = Vec::new();
        let previous = status.used.saturating_sub(1);

        let checks = [
            (NotificationKind::UsageThreshold, self.settings.threshold_percent),
            (NotificationKind::QuotaExceeded, 100.0),
        ];
        for (kind, percent) in checks {
            if !crosses(previous, status.used, quota, percent) {
                continue;
            }
            let marker = format!(
                "quota:fired:{}:{}:{}",
                status.key_id,
                status.resets_at.timestamp_millis(),
                kind.as_str()
            );
            let ttl_ms = (status.resets_at.timestamp_millis() - now_ms).max(0)
                + ms(Duration::from_secs(DAY));
            if !self.counters.set_if_absent(&marker, now_ms, ttl_ms)? {
                continue;
            }
            notifications.push(Notification {
                kind,
                payload: json!({
                    "keyId": status.key_id,
                    "used": status.used,
                    "quota": quota,
                    "remaining": quota.saturating_sub(status.used),
                    "percentage": status.percentage(),
                    "resetsAt": status.resets_at,
                }),
                owner: Some(status.owner.clone()),
            });
        }
        Ok(notifications)
    }

    /// Error-rate anomaly over the trailing window, at most once per window.
    fn error_rate_notification(
        &self,
        event: &UsageEvent,
        status: Option<&QuotaStatus>,
        now_ms: i64,
    ) -> Result<Option<Notification>, StoreError> {
        let s = &self.settings;
        let window_ms = ms(s.error_rate_window);
        let total_key = format!("errors:total:{}", event.key_id);
        let failed_key = format!("errors:failed:{}", event.key_id);

        let total = self
            .counters
            .record_in_window(&total_key, now_ms, window_ms, window_ms)?;
        let failed = if event.is_error() {
            self.counters
                .record_in_window(&failed_key, now_ms, window_ms, window_ms)?
        } else {
            self.counters.count_in_window(&failed_key, now_ms, window_ms)?
        };

        if total < s.error_rate_min_samples {
            return Ok(None);
        }
        let rate = failed as f64 / total as f64;
        if rate <= s.error_rate_threshold {
            return Ok(None);
        }

        let alerted_key = format!("errors:alerted:{}", event.key_id);
        if !self.counters.set_if_absent(&alerted_key, now_ms, window_ms)? {
            return Ok(None);
        }

        warn!(key_id = %event.key_id, rate, samples = total, "Error rate anomaly");
        Ok(Some(Notification {
            kind: NotificationKind::ErrorRate,
            payload: json!({
                "keyId": event.key_id,
                "errorRate": rate,
                "errors": failed,
                "samples": total,
                "windowSeconds": s.error_rate_window.as_secs(),
            }),
            owner: status.map(|s| s.owner.clone()),
        }))
    }

    /// Latency samples currently buffered for a key, oldest first
    pub fn latency_samples(
        &self,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<f64>, StoreError> {
        self.counters
            .samples(&format!("latency:{}", key_id), now.timestamp_millis())
    }
}

/// True when `used` is the first count at or past `percent` of `quota`.
fn crosses(previous: u64, used: u64, quota: u64, percent: f64) -> bool {
    if quota == 0 {
        return false;
    }
    let threshold = quota as f64 * percent / 100.0;
    (previous as f64) < threshold && (used as f64) >= threshold
}
