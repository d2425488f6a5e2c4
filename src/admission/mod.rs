//! Request admission.
//!
//! Every inbound request passes through [`AdmissionPipeline::admit`]:
//!
//! 1. Extract the presented key (header, query parameter, bearer token)
//! 2. Validate it against the key registry
//! 3. Reject revoked keys, then expired keys
//! 4. Enforce the key's IP whitelist
//! 5. Check the sustained and burst windows, then the endpoint and global
//!    ceilings from the runtime config
//!
//! Key store failures fail closed. Counter store failures follow
//! `rate_limit_fail_open`. Completed requests are reported through
//! [`AdmissionPipeline::record_completion`], which only enqueues.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::auth::{extract_client_ip, extract_presented_key, TokenError};
use crate::config::{RuntimeConfig, SharedRuntimeConfig};
use crate::keys::{KeyRecord, KeyRegistry, Owner, Plan, RegistryError};
use crate::rate_limit::{Decision, RateLimiter, RateScope, RateWindows};
use crate::store::{with_timeout, StoreError};
use crate::telemetry::{UsageEmitter, UsageEvent};

#[cfg(test)]
mod tests;

const SHARED_WINDOW: Duration = Duration::from_secs(60);
const GLOBAL_SUBJECT: &str = "gateway";

/// Request data admission looks at.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
    pub remote_addr: Option<IpAddr>,
    pub method: &'a str,
    pub path: &'a str,
}

impl AdmissionRequest<'_> {
    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Validated key context attached to an admitted request.
#[derive(Debug, Clone)]
pub struct KeyContext {
    pub record: KeyRecord,
    pub owner: Owner,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub struct Admitted {
    pub context: KeyContext,
    /// None when rate limiting is disabled or the counter store failed open
    pub rate: Option<Decision>,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub error: AdmissionError,
    pub rate: Option<Decision>,
}

impl Rejection {
    fn new(error: AdmissionError) -> Self {
        Self { error, rate: None }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = self.error.into_response();
        if let Some(decision) = &self.rate {
            RateLimitHeaders::apply(response.headers_mut(), decision);
        }
        response
    }
}

/// Reasons a request is not admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionError {
    KeyRequired,
    InvalidKey,
    MalformedKey,
    KeyRevoked,
    KeyExpired,
    IpNotAllowed(Option<String>),
    RateLimitExceeded { scope: RateScope, retry_after: u64 },
    /// A store needed to decide did not answer
    Unavailable(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::KeyRequired => "API_KEY_REQUIRED",
            AdmissionError::InvalidKey | AdmissionError::MalformedKey => "INVALID_API_KEY",
            AdmissionError::KeyRevoked => "API_KEY_REVOKED",
            AdmissionError::KeyExpired => "API_KEY_EXPIRED",
            AdmissionError::IpNotAllowed(_) => "IP_NOT_ALLOWED",
            AdmissionError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AdmissionError::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::KeyRequired
            | AdmissionError::InvalidKey
            | AdmissionError::MalformedKey => StatusCode::UNAUTHORIZED,
            AdmissionError::KeyRevoked
            | AdmissionError::KeyExpired
            | AdmissionError::IpNotAllowed(_) => StatusCode::FORBIDDEN,
            AdmissionError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::KeyRequired => write!(f, "API key required"),
            AdmissionError::InvalidKey => write!(f, "Invalid API key"),
            AdmissionError::MalformedKey => write!(f, "Malformed API key"),
            AdmissionError::KeyRevoked => write!(f, "API key has been revoked"),
            AdmissionError::KeyExpired => write!(f, "API key has expired"),
            AdmissionError::IpNotAllowed(Some(ip)) => {
                write!(f, "Client address {} is not allowed for this key", ip)
            }
            AdmissionError::IpNotAllowed(None) => {
                write!(f, "Client address could not be determined")
            }
            AdmissionError::RateLimitExceeded { retry_after, .. } => {
                write!(f, "Rate limit exceeded, retry after {}s", retry_after)
            }
            AdmissionError::Unavailable(_) => write!(f, "Service temporarily unavailable"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<TokenError> for AdmissionError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Missing | TokenError::Empty => AdmissionError::KeyRequired,
            TokenError::InvalidFormat => AdmissionError::MalformedKey,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    code: &'static str,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// `X-RateLimit-*` and `Retry-After` response headers.
pub struct RateLimitHeaders;

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "x-ratelimit-limit";
    pub const REMAINING: &'static str = "x-ratelimit-remaining";
    pub const RESET: &'static str = "x-ratelimit-reset";

    pub fn apply(headers: &mut HeaderMap, decision: &Decision) {
        let set = |headers: &mut HeaderMap, name: &'static str, value: u64| {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        };
        set(headers, Self::LIMIT, decision.limit);
        set(headers, Self::REMAINING, decision.remaining);
        set(headers, Self::RESET, decision.reset_at.timestamp().max(0) as u64);
        match decision.retry_after {
            Some(secs) if !decision.allowed => set(headers, "retry-after", secs),
            _ => {
                headers.remove(axum::http::header::RETRY_AFTER);
            }
        }
    }
}

/// Admission pipeline shared by all requests.
#[derive(Clone)]
pub struct AdmissionPipeline {
    registry: KeyRegistry,
    limiter: RateLimiter,
    windows: RateWindows,
    runtime_config: SharedRuntimeConfig,
    store_timeout: Duration,
    emitter: UsageEmitter,
}

impl AdmissionPipeline {
    pub fn new(
        registry: KeyRegistry,
        limiter: RateLimiter,
        windows: RateWindows,
        runtime_config: SharedRuntimeConfig,
        store_timeout: Duration,
        emitter: UsageEmitter,
    ) -> Self {
        Self {
            registry,
            limiter,
            windows,
            runtime_config,
            store_timeout,
            emitter,
        }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub async fn admit(&self, request: AdmissionRequest<'_>) -> Result<Admitted, Rejection> {
        self.admit_at(request, Utc::now()).await
    }

    pub async fn admit_at(
        &self,
        request: AdmissionRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Admitted, Rejection> {
        let settings = self.registry.settings();
        let prefixes = [settings.live_prefix.as_str(), settings.sandbox_prefix.as_str()];
        let presented = extract_presented_key(request.headers, request.query, &prefixes)
            .map_err(|e| Rejection::new(e.into()))?;

        let (mut record, plan) = self.lookup(presented, now).await.map_err(Rejection::new)?;

        if record.revoked {
            debug!(key_id = %record.id, "Rejected revoked key");
            return Err(Rejection::new(AdmissionError::KeyRevoked));
        }
        if record.is_expired_at(now) {
            debug!(key_id = %record.id, "Rejected expired key");
            return Err(Rejection::new(AdmissionError::KeyExpired));
        }

        let client_ip = extract_client_ip(request.headers, request.remote_addr);
        if !record.allows_ip(client_ip.as_deref()) {
            debug!(key_id = %record.id, client_ip = ?client_ip, "Client address not whitelisted");
            return Err(Rejection::new(AdmissionError::IpNotAllowed(client_ip)));
        }

        let config = self.runtime_config();
        let rate = if config.rate_limit_enabled {
            self.check_rates(&record.id, &plan, &request, &config, now)
                .await?
        } else {
            None
        };

        self.mark_used(&record.id, now);
        record.last_used_at = Some(now);

        let owner = record.owner.clone();
        Ok(Admitted {
            context: KeyContext {
                record,
                owner,
                plan,
            },
            rate,
        })
    }

    /// Report a completed request. Never blocks; a full queue drops the event.
    pub fn record_completion(&self, event: UsageEvent) -> bool {
        self.emitter.emit(event)
    }

    /// `last_used_at` is bookkeeping; it is written off the request path so a
    /// busy key store cannot turn an established identity into a rejection.
    fn mark_used(&self, key_id: &str, now: DateTime<Utc>) {
        let registry = self.registry.clone();
        let key_id = key_id.to_string();
        tokio::task::spawn_blocking(move || registry.mark_used_at(&key_id, now));
    }

    fn runtime_config(&self) -> RuntimeConfig {
        match self.runtime_config.read() {
            Ok(cfg) => cfg.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn lookup(
        &self,
        presented: String,
        now: DateTime<Utc>,
    ) -> Result<(KeyRecord, Plan), AdmissionError> {
        let registry = self.registry.clone();
        let result = with_timeout(self.store_timeout, move || {
            Ok(registry.authenticate(&presented).and_then(|record| {
                let plan = registry.plan(&record.plan_id)?;
                Ok((record, plan))
            }))
        })
        .await;

        match result {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(RegistryError::MalformedKey)) => Err(AdmissionError::MalformedKey),
            Ok(Err(RegistryError::InvalidKey)) => Err(AdmissionError::InvalidKey),
            Ok(Err(e)) => {
                error!(error = %e, "Key lookup failed");
                Err(AdmissionError::Unavailable(e.to_string()))
            }
            Err(e) => {
                error!(error = %e, "Key store unavailable");
                Err(AdmissionError::Unavailable(e.to_string()))
            }
        }
    }

    /// Per-key windows first, then endpoint and global ceilings.
    async fn check_rates(
        &self,
        key_id: &str,
        plan: &Plan,
        request: &AdmissionRequest<'_>,
        config: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, Rejection> {
        let limiter = self.limiter.clone();
        let windows = self.windows;
        let subject = key_id.to_string();
        let plan = plan.clone();
        let endpoint = request.endpoint();
        let endpoint_limit = config.endpoint_limit_per_minute;
        let global_limit = config.global_limit_per_minute;

        let result = with_timeout(self.store_timeout, move || {
            let key = limiter.check_plan_at(&subject, &plan, &windows, now)?;
            if !key.allowed {
                return Ok(key);
            }
            if let Some(limit) = endpoint_limit {
                let d =
                    limiter.check_at(&endpoint, RateScope::Endpoint, limit, SHARED_WINDOW, now)?;
                if !d.allowed {
                    return Ok(d);
                }
            }
            if let Some(limit) = global_limit {
                let d = limiter.check_at(
                    GLOBAL_SUBJECT,
                    RateScope::Global,
                    limit,
                    SHARED_WINDOW,
                    now,
                )?;
                if !d.allowed {
                    return Ok(d);
                }
            }
            Ok::<Decision, StoreError>(key)
        })
        .await;

        match result {
            Ok(decision) if decision.allowed => Ok(Some(decision)),
            Ok(decision) => {
                let retry_after = decision.retry_after.unwrap_or(1);
                debug!(key_id, scope = ?decision.scope, retry_after, "Rate limited");
                Err(Rejection {
                    error: AdmissionError::RateLimitExceeded {
                        scope: decision.scope,
                        retry_after,
                    },
                    rate: Some(decision),
                })
            }
            Err(e) if config.rate_limit_fail_open => {
                warn!(error = %e, "Counter store failed; admitting without rate limit");
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "Counter store failed; rejecting request");
                Err(Rejection::new(AdmissionError::Unavailable(e.to_string())))
            }
        }
    }
}
