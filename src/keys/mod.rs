//! API key records, plans and the key lifecycle.
//!
//! A presented key has the shape `<prefix>_<IDENTIFIER>.<secret>`:
//!
//! ```text
//!   gk_live_9F2C41D07AB3E658.Jx0v...43 chars...
//!   └──┬──┘ └──────┬───────┘ └──────┬─────────┘
//!    prefix    identifier         secret
//! ```
//!
//! The identifier is public, stored in plaintext and indexed; it is the only
//! thing used to find a record. The secret is never stored, only its SHA-256,
//! and is compared in constant time against the candidate record.

use chrono::{DateTime, Datelike, Duration, LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

mod registry;
mod secret;
mod sqlite;
mod store;


pub use registry::{IssuedKey, KeyRegistry, KeySettings, RegistryError};
pub use secret::{format_key, hash_secret, parse_key, secret_matches, ParsedKey};
pub use sqlite::SqliteKeyStore;
pub use store::{KeyStore, MemoryKeyStore};

/// Who a key belongs to. Exactly one kind of owner is ever set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Owner {
    User(String),
    Broker(String),
}

impl Owner {
    pub fn kind(&self) -> &'static str {
        match self {
            Owner::User(_) => "user",
            Owner::Broker(_) => "broker",
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            Owner::User(id) | Owner::Broker(id) => id,
        }
    }

    /// Rebuild from the persisted `(kind, reference)` pair
    pub fn from_parts(kind: &str, reference: String) -> Option<Self> {
        match kind {
            "user" => Some(Owner::User(reference)),
            "broker" => Some(Owner::Broker(reference)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.reference())
    }
}

/// Live keys are production keys; sandbox keys expire after a fixed period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEnvironment {
    Live,
    Sandbox,
}

impl KeyEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyEnvironment::Live => "live",
            KeyEnvironment::Sandbox => "sandbox",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(KeyEnvironment::Live),
            "sandbox" => Some(KeyEnvironment::Sandbox),
            _ => None,
        }
    }
}

/// Throughput and quota limits attached to a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// Requests per sustained window
    pub rate_limit: u64,
    /// Requests per burst window
    pub burst_limit: Option<u64>,
    /// Monthly call cap (None = unlimited)
    pub quota: Option<u64>,
}

/// Stored state of an issued key. Never contains the secret itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyRecord {
    /// Opaque record id (UUID v7)
    pub id: String,
    /// Presented prefix, e.g. `gk_live`
    pub prefix: String,
    /// Public uppercase-hex lookup token
    pub identifier: String,
    /// SHA-256 (hex) of the secret part
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub owner: Owner,
    pub plan_id: String,
    pub environment: KeyEnvironment,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_whitelist: BTreeSet<String>,
    pub usage_count: u64,
    pub quota_reset_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl KeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires <= now)
    }

    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        &self.owner == owner
    }

    /// An empty whitelist allows every address.
    pub fn allows_ip(&self, ip: Option<&str>) -> bool {
        if self.ip_whitelist.is_empty() {
            return true;
        }
        ip.map_or(false, |ip| self.ip_whitelist.contains(ip))
    }
}

/// First instant of the calendar month after `now` (UTC).
pub fn next_quota_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0) {
        LocalResult::Single(t) => t,
        _ => unreachable!("the first day of a month always exists in UTC"),
    }
}

/// Sandbox keys live for this many days unless configured otherwise
pub const DEFAULT_SANDBOX_TTL_DAYS: i64 = 30;

pub(crate) fn sandbox_expiry(now: DateTime<Utc>, ttl_days: i64) -> DateTime<Utc> {
    now + Duration::days(ttl_days)
}
