// Rate limiting for admitted API keys.
//
// Sliding-window log over the shared counter store. Each check is one atomic
// trim+insert+count+expire on the store, so concurrent requests for the same
// key cannot lose updates. Under heavy concurrency the limit may be overshot
// by a small bounded amount; exact admission is not required.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::keys::Plan;
use crate::store::{CounterStore, StoreError};

/// Counter namespace a window belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    /// Per-key sustained rate
    Sustained,
    /// Per-key short window
    Burst,
    /// Per method+path
    Endpoint,
    /// Whole gateway
    Global,
}

impl RateScope {
    fn namespace(&self) -> &'static str {
        match self {
            RateScope::Sustained => "rl:key",
            RateScope::Burst => "rl:burst",
            RateScope::Endpoint => "rl:endpoint",
            RateScope::Global => "rl:global",
        }
    }
}

/// Outcome of one window check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub scope: RateScope,
    pub limit: u64,
    pub remaining: u64,
    /// `now + window`; approximate for a sliding window
    pub reset_at: DateTime<Utc>,
    /// Whole seconds, set only when rejected
    pub retry_after: Option<u64>,
}

/// Window lengths for the per-key scopes.
#[derive(Debug, Clone, Copy)]
pub struct RateWindows {
    pub sustained: Duration,
    pub burst: Duration,
}

impl Default for RateWindows {
    fn default() -> Self {
        Self {
            sustained: Duration::from_secs(60),
            burst: Duration::from_secs(10),
        }
    }
}

/// Sliding-window-log rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    /// Extra lifetime given to a window key beyond its window
    grace: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub fn check(
        &self,
        subject: &str,
        scope: RateScope,
        limit: u64,
        window: Duration,
    ) -> Result<Decision, StoreError> {
        self.check_at(subject, scope, limit, window, Utc::now())
    }

    /// Record one request for `subject` in `scope` at `now` and decide.
    ///
    /// `allowed = count <= limit`, where `count` includes this request.
    pub fn check_at(
        &self,
        subject: &str,
        scope: RateScope,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let key = format!("{}:{}", scope.namespace(), subject);
        let window_ms = window.as_millis() as i64;
        let ttl_ms = (window + self.grace).as_millis() as i64;

        let count = self
            .store
            .record_in_window(&key, now.timestamp_millis(), window_ms, ttl_ms)?;

        let allowed = count <= limit;
        let reset_at = now + chrono::Duration::milliseconds(window_ms);
        let retry_after = if allowed {
            None
        } else {
            debug!(subject, scope = ?scope, count, limit, "Rate limit exceeded");
            Some(retry_after_secs(window))
        };

        Ok(Decision {
            allowed,
            scope,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            retry_after,
        })
    }

    /// Sustained check for a key, then burst if the plan has one.
    ///
    /// A burst rejection wins. When both pass the tighter of the two decisions
    /// is returned. A burst allowance above the plan's sustained rate raises
    /// the sustained ceiling to match, so a burst can actually be spent.
    pub fn check_plan_at(
        &self,
        key_id: &str,
        plan: &Plan,
        windows: &RateWindows,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let sustained_limit = plan.rate_limit.max(plan.burst_limit.unwrap_or(0));
        let sustained = self.check_at(
            key_id,
            RateScope::Sustained,
            sustained_limit,
            windows.sustained,
            now,
        )?;
        if !sustained.allowed {
            return Ok(sustained);
        }

        let Some(burst_limit) = plan.burst_limit else {
            return Ok(sustained);
        };
        let burst = self.check_at(key_id, RateScope::Burst, burst_limit, windows.burst, now)?;
        if !burst.allowed || burst.remaining < sustained.remaining {
            return Ok(burst);
        }
        Ok(sustained)
    }
}

/// Window length in whole seconds, rounded up, never zero.
fn retry_after_secs(window: Duration) -> u64 {
    let ms = window.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}
