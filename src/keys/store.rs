//! Key and plan persistence. Pure data access: no ownership or policy checks.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;

use super::{KeyRecord, Owner, Plan};
use crate::store::StoreError;

/// Storage for key records and the plans they reference.
///
/// Every mutating method is a single atomic update and returns the record as
/// it stands afterwards (`None` when the id is unknown). Revocation is
/// terminal: mutations other than [`KeyStore::set_revoked`] leave a revoked
/// record untouched and return it unchanged.
pub trait KeyStore: Send + Sync {
    fn insert_plan(&self, plan: &Plan) -> Result<(), StoreError>;

    fn plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError>;

    /// Insert a new record. Fails if the id or identifier is already taken.
    fn insert(&self, record: &KeyRecord) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError>;

    /// Exact indexed lookup by public identifier, revoked and expired included.
    fn find_by_identifier(&self, identifier: &str) -> Result<Vec<KeyRecord>, StoreError>;

    fn list_by_owner(&self, owner: &Owner) -> Result<Vec<KeyRecord>, StoreError>;

    /// Swap the secret hash in one step; the old hash stops matching at the
    /// same instant the new one starts.
    fn replace_secret_hash(
        &self,
        id: &str,
        secret_hash: &str,
    ) -> Result<Option<KeyRecord>, StoreError>;

    fn set_revoked(&self, id: &str) -> Result<Option<KeyRecord>, StoreError>;

    fn set_ip_whitelist(
        &self,
        id: &str,
        ips: &BTreeSet<String>,
    ) -> Result<Option<KeyRecord>, StoreError>;

    fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// `usage_count += 1`
    fn increment_usage(&self, id: &str) -> Result<Option<KeyRecord>, StoreError>;

    /// `usage_count = 0`, `quota_reset_at = next_reset_at`
    fn reset_usage(
        &self,
        id: &str,
        next_reset_at: DateTime<Utc>,
    ) -> Result<Option<KeyRecord>, StoreError>;

    /// Ids of non-revoked records whose `quota_reset_at` is before `now`.
    fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}

/// In-memory [`KeyStore`].
///
/// Records are keyed by id with a secondary identifier index, the same
/// shape as the persistent store's unique index.
pub struct MemoryKeyStore {
    records: DashMap<String, KeyRecord>,
    identifiers: DashMap<String, String>,
    plans: DashMap<String, Plan>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            identifiers: DashMap::new(),
            plans: DashMap::new(),
        }
    }

    /// Apply `f` to a non-revoked record under its entry lock.
    fn mutate<F>(&self, id: &str, f: F) -> Option<KeyRecord>
    where
        F: FnOnce(&mut KeyRecord),
    {
        let mut record = self.records.get_mut(id)?;
        if !record.revoked {
            f(&mut record);
        }
        Some(record.clone())
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn insert_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        self.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    fn plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        Ok(self.plans.get(plan_id).map(|p| p.clone()))
    }

    fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::Backend(format!(
                "duplicate key id '{}'",
                record.id
            )));
        }
        match self.identifiers.entry(record.identifier.clone()) {
            Entry::Occupied(_) => Err(StoreError::Backend(format!(
                "duplicate key identifier '{}'",
                record.identifier
            ))),
            Entry::Vacant(vacant) => {
                self.records.insert(record.id.clone(), record.clone());
                vacant.insert(record.id.clone());
                Ok(())
            }
        }
    }

    fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    fn find_by_identifier(&self, identifier: &str) -> Result<Vec<KeyRecord>, StoreError> {
        let Some(id) = self.identifiers.get(identifier).map(|id| id.clone()) else {
            return Ok(Vec::new());
        };
        Ok(self.records.get(&id).map(|r| r.clone()).into_iter().collect())
    }

    fn list_by_owner(&self, owner: &Owner) -> Result<Vec<KeyRecord>, StoreError> {
        let mut records: Vec<KeyRecord> = self
            .records
            .iter()
            .filter(|r| r.is_owned_by(owner))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn replace_secret_hash(
        &self,
        id: &str,
        secret_hash: &str,
    ) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.mutate(id, |r| r.secret_hash = secret_hash.to_string()))
    }

    fn set_revoked(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.mutate(id, |r| r.revoked = true))
    }

    fn set_ip_whitelist(
        &self,
        id: &str,
        ips: &BTreeSet<String>,
    ) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.mutate(id, |r| r.ip_whitelist = ips.clone()))
    }

    fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(id, |r| r.last_used_at = Some(at));
        Ok(())
    }

    fn increment_usage(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.mutate(id, |r| r.usage_count += 1))
    }

    fn reset_usage(
        &self,
        id: &str,
        next_reset_at: DateTime<Utc>,
    ) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.mutate(id, |r| {
            r.usage_count = 0;
            r.quota_reset_at = next_reset_at;
        }))
    }

    fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| !r.revoked && r.quota_reset_at < now)
            .map(|r| r.id.clone())
            .collect())
    }
}
