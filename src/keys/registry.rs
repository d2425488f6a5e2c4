use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::secret::{generate_identifier, generate_secret};
use super::{
    format_key, hash_secret, next_quota_reset, parse_key, sandbox_expiry, secret_matches,
    KeyEnvironment, KeyRecord, KeyStore, Owner, Plan, DEFAULT_SANDBOX_TTL_DAYS,
};
use crate::store::StoreError;

/// Presentation settings for issued keys
#[derive(Debug, Clone)]
pub struct KeySettings {
    pub live_prefix: String,
    pub sandbox_prefix: String,
    pub sandbox_ttl_days: i64,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            live_prefix: "gk_live".to_string(),
            sandbox_prefix: "gk_test".to_string(),
            sandbox_ttl_days: DEFAULT_SANDBOX_TTL_DAYS,
        }
    }
}

impl KeySettings {
    fn prefix_for(&self, environment: KeyEnvironment) -> &str {
        match environment {
            KeyEnvironment::Live => &self.live_prefix,
            KeyEnvironment::Sandbox => &self.sandbox_prefix,
        }
    }
}

/// A freshly issued or rotated key. `plaintext` is shown to the caller once
/// and never stored.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub plaintext: String,
    pub record: KeyRecord,
}

/// Issues, validates, rotates and revokes API keys.
#[derive(Clone)]
pub struct KeyRegistry {
    store: Arc<dyn KeyStore>,
    settings: KeySettings,
}

impl KeyRegistry {
    pub fn new(store: Arc<dyn KeyStore>, settings: KeySettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn settings(&self) -> &KeySettings {
        &self.settings
    }

    pub fn plan(&self, plan_id: &str) -> Result<Plan, RegistryError> {
        self.store
            .plan(plan_id)?
            .ok_or_else(|| RegistryError::PlanNotFound(plan_id.to_string()))
    }

    pub fn issue(
        &self,
        owner: Owner,
        plan_id: &str,
        environment: KeyEnvironment,
    ) -> Result<IssuedKey, RegistryError> {
        self.issue_at(owner, plan_id, environment, Utc::now())
    }

    /// Issue a key as of `now`.
    ///
    /// The plan must exist. Sandbox keys expire `sandbox_ttl_days` after issuance.
    pub fn issue_at(
        &self,
        owner: Owner,
        plan_id: &str,
        environment: KeyEnvironment,
        now: DateTime<Utc>,
    ) -> Result<IssuedKey, RegistryError> {
        self.plan(plan_id)?;

        let prefix = self.settings.prefix_for(environment).to_string();
        let identifier = generate_identifier();
        let secret = generate_secret();

        let expires_at = match environment {
            KeyEnvironment::Sandbox => Some(sandbox_expiry(now, self.settings.sandbox_ttl_days)),
            KeyEnvironment::Live => None,
        };

        let record = KeyRecord {
            id: Uuid::now_v7().to_string(),
            prefix: prefix.clone(),
            identifier: identifier.clone(),
            secret_hash: hash_secret(&secret),
            owner,
            plan_id: plan_id.to_string(),
            environment,
            revoked: false,
            expires_at,
            ip_whitelist: BTreeSet::new(),
            usage_count: 0,
            quota_reset_at: next_quota_reset(now),
            last_used_at: None,
            created_at: now,
        };
        self.store.insert(&record)?;

        info!(
            key_id = %record.id,
            identifier = %record.identifier,
            owner = %record.owner,
            plan = %record.plan_id,
            environment = record.environment.as_str(),
            "Issued API key"
        );

        Ok(IssuedKey {
            plaintext: format_key(&prefix, &identifier, &secret),
            record,
        })
    }

    pub fn validate(&self, presented: &str) -> Result<KeyRecord, RegistryError> {
        self.validate_at(presented, Utc::now())
    }

    /// Prove possession of a presented key and record the use.
    ///
    /// The matched record is returned whatever its revocation or expiry state;
    /// callers classify those. `last_used_at` is only updated for usable keys.
    pub fn validate_at(
        &self,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyRecord, RegistryError> {
        let mut record = self.authenticate(presented)?;
        if !record.revoked && !record.is_expired_at(now) && self.mark_used_at(&record.id, now) {
            record.last_used_at = Some(now);
        }
        Ok(record)
    }

    /// Prove possession of a presented key without writing to the store.
    ///
    /// Malformed input fails before any store access. Candidates are found by
    /// exact identifier match and the secret is checked in constant time.
    pub fn authenticate(&self, presented: &str) -> Result<KeyRecord, RegistryError> {
        let parsed = parse_key(presented)?;
        let candidates = self.store.find_by_identifier(parsed.identifier)?;

        let matched = candidates.into_iter().find(|candidate| {
            candidate.prefix == parsed.prefix
                && secret_matches(parsed.secret, &candidate.secret_hash)
        });

        matched.ok_or_else(|| {
            debug!(identifier = %parsed.identifier, "Presented key did not match");
            RegistryError::InvalidKey
        })
    }

    /// Best-effort `last_used_at` bookkeeping. Returns whether the write landed.
    pub fn mark_used_at(&self, id: &str, now: DateTime<Utc>) -> bool {
        match self.store.touch(id, now) {
            Ok(()) => true,
            Err(e) => {
                warn!(key_id = %id, error = %e, "Failed to update last_used_at");
                false
            }
        }
    }

    /// Replace the secret of a key, keeping its id, identifier and usage state.
    pub fn rotate(&self, id: &str, owner: &Owner) -> Result<IssuedKey, RegistryError> {
        let current = self.owned_record(id, owner)?;
        if current.revoked {
            return Err(RegistryError::KeyRevoked(id.to_string()));
        }

        let secret = generate_secret();
        let record = self
            .store
            .replace_secret_hash(id, &hash_secret(&secret))?
            .ok_or_else(|| RegistryError::RecordNotFound(id.to_string()))?;

        // Revoked between the read and the swap
        if record.revoked {
            return Err(RegistryError::KeyRevoked(id.to_string()));
        }

        info!(key_id = %record.id, identifier = %record.identifier, "Rotated API key secret");

        Ok(IssuedKey {
            plaintext: format_key(&record.prefix, &record.identifier, &secret),
            record,
        })
    }

    /// Revoke a key. Terminal; revoking twice is a no-op.
    pub fn revoke(&self, id: &str, owner: &Owner) -> Result<KeyRecord, RegistryError> {
        self.owned_record(id, owner)?;
        let record = self
            .store
            .set_revoked(id)?
            .ok_or_else(|| RegistryError::RecordNotFound(id.to_string()))?;

        info!(key_id = %record.id, identifier = %record.identifier, "Revoked API key");
        Ok(record)
    }

    /// Replace the client IP whitelist. An empty set allows every address.
    pub fn set_ip_whitelist(
        &self,
        id: &str,
        owner: &Owner,
        ips: BTreeSet<String>,
    ) -> Result<KeyRecord, RegistryError> {
        let current = self.owned_record(id, owner)?;
        if current.revoked {
            return Err(RegistryError::KeyRevoked(id.to_string()));
        }
        let record = self
            .store
            .set_ip_whitelist(id, &ips)?
            .ok_or_else(|| RegistryError::RecordNotFound(id.to_string()))?;
        if record.revoked {
            return Err(RegistryError::KeyRevoked(id.to_string()));
        }

        info!(key_id = %record.id, entries = record.ip_whitelist.len(), "Updated IP whitelist");
        Ok(record)
    }

    pub fn list(&self, owner: &Owner) -> Result<Vec<KeyRecord>, RegistryError> {
        Ok(self.store.list_by_owner(owner)?)
    }

    fn owned_record(&self, id: &str, owner: &Owner) -> Result<KeyRecord, RegistryError> {
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| RegistryError::RecordNotFound(id.to_string()))?;
        if !record.is_owned_by(owner) {
            return Err(RegistryError::RecordNotOwned(id.to_string()));
        }
        Ok(record)
    }
}

/// Key lifecycle errors
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Referenced plan does not exist
    PlanNotFound(String),
    /// No record with this id
    RecordNotFound(String),
    /// Record exists but belongs to another owner
    RecordNotOwned(String),
    /// Record is revoked and can no longer change
    KeyRevoked(String),
    /// Presented key is not `prefix_IDENTIFIER.secret`
    MalformedKey,
    /// Well-formed key that matches no record
    InvalidKey,
    Store(StoreError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::PlanNotFound(id) => write!(f, "Plan '{}' not found", id),
            RegistryError::RecordNotFound(id) => write!(f, "API key '{}' not found", id),
            RegistryError::RecordNotOwned(id) => {
                write!(f, "API key '{}' belongs to another owner", id)
            }
            RegistryError::KeyRevoked(id) => write!(f, "API key '{}' is revoked", id),
            RegistryError::MalformedKey => write!(f, "Malformed API key"),
            RegistryError::InvalidKey => write!(f, "Invalid API key"),
            RegistryError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Store(e)
    }
}
