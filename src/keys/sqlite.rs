//! Key persistence using SQLite.
//!
//! Timestamps are stored as unix milliseconds so range filters (quota resets)
//! stay plain integer comparisons. Every mutation is a single `UPDATE`
//! guarded by `revoked = 0`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use super::{KeyEnvironment, KeyRecord, KeyStore, Owner, Plan};
use crate::store::{open_sqlite, StoreError};

const RECORD_COLUMNS: &str = "id, prefix, identifier, secret_hash, owner_kind, owner_ref, plan_id, \
     environment, revoked, expires_at, ip_whitelist, usage_count, quota_reset_at, last_used_at, \
     created_at";

/// Persists key records and plans in SQLite.
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyStore {
    /// Opens (or creates) the SQLite database and ensures the tables exist.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = open_sqlite(db_path)
            .with_context(|| format!("Failed to open key DB at {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("key DB lock poisoned"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plans (
                id          TEXT PRIMARY KEY,
                rate_limit  INTEGER NOT NULL,
                burst_limit INTEGER,
                quota       INTEGER
            );
            CREATE TABLE IF NOT EXISTS api_keys (
                id             TEXT PRIMARY KEY,
                prefix         TEXT NOT NULL,
                identifier     TEXT NOT NULL UNIQUE,
                secret_hash    TEXT NOT NULL,
                owner_kind     TEXT NOT NULL CHECK (owner_kind IN ('user', 'broker')),
                owner_ref      TEXT NOT NULL,
                plan_id        TEXT NOT NULL REFERENCES plans(id),
                environment    TEXT NOT NULL,
                revoked        INTEGER NOT NULL DEFAULT 0,
                expires_at     INTEGER,
                ip_whitelist   TEXT NOT NULL DEFAULT '[]',
                usage_count    INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
                quota_reset_at INTEGER NOT NULL,
                last_used_at   INTEGER,
                created_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_owner ON api_keys (owner_kind, owner_ref);
            CREATE INDEX IF NOT EXISTS idx_api_keys_reset ON api_keys (quota_reset_at);",
        )
        .context("Failed to create key tables")?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("key DB lock poisoned".to_string()))
    }

    fn select_by_id(conn: &Connection, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        let sql = format!("SELECT {} FROM api_keys WHERE id = ?1", RECORD_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], read_row)
            .optional()?;
        row.map(RawRecord::into_record).transpose()
    }

    /// Run a guarded update then read back the record on the same connection.
    fn update_then_get(
        &self,
        id: &str,
        sql: &str,
        bind: impl rusqlite::Params,
    ) -> Result<Option<KeyRecord>, StoreError> {
        let conn = self.lock()?;
        conn.execute(sql, bind)?;
        Self::select_by_id(&conn, id)
    }
}

/// Row as stored, before conversion into domain types
struct RawRecord {
    id: String,
    prefix: String,
    identifier: String,
    secret_hash: String,
    owner_kind: String,
    owner_ref: String,
    plan_id: String,
    environment: String,
    revoked: bool,
    expires_at: Option<i64>,
    ip_whitelist: String,
    usage_count: i64,
    quota_reset_at: i64,
    last_used_at: Option<i64>,
    created_at: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        prefix: row.get(1)?,
        identifier: row.get(2)?,
        secret_hash: row.get(3)?,
        owner_kind: row.get(4)?,
        owner_ref: row.get(5)?,
        plan_id: row.get(6)?,
        environment: row.get(7)?,
        revoked: row.get(8)?,
        expires_at: row.get(9)?,
        ip_whitelist: row.get(10)?,
        usage_count: row.get(11)?,
        quota_reset_at: row.get(12)?,
        last_used_at: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn from_millis(ms: i64, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("invalid timestamp {} on key {}", ms, id)))
}

impl RawRecord {
    fn into_record(self) -> Result<KeyRecord, StoreError> {
        let owner = Owner::from_parts(&self.owner_kind, self.owner_ref).ok_or_else(|| {
            StoreError::Backend(format!("unknown owner kind on key {}", self.id))
        })?;
        let environment = KeyEnvironment::parse(&self.environment).ok_or_else(|| {
            StoreError::Backend(format!("unknown environment on key {}", self.id))
        })?;
        let ip_whitelist: BTreeSet<String> = serde_json::from_str(&self.ip_whitelist)?;
        let expires_at = self
            .expires_at
            .map(|ms| from_millis(ms, &self.id))
            .transpose()?;
        let last_used_at = self
            .last_used_at
            .map(|ms| from_millis(ms, &self.id))
            .transpose()?;

        Ok(KeyRecord {
            quota_reset_at: from_millis(self.quota_reset_at, &self.id)?,
            created_at: from_millis(self.created_at, &self.id)?,
            id: self.id,
            prefix: self.prefix,
            identifier: self.identifier,
            secret_hash: self.secret_hash,
            owner,
            plan_id: self.plan_id,
            environment,
            revoked: self.revoked,
            expires_at,
            ip_whitelist,
            usage_count: self.usage_count.max(0) as u64,
            last_used_at,
        })
    }
}

impl KeyStore for SqliteKeyStore {
    fn insert_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO plans (id, rate_limit, burst_limit, quota) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                rate_limit = excluded.rate_limit,
                burst_limit = excluded.burst_limit,
                quota = excluded.quota",
            params![
                plan.id,
                plan.rate_limit as i64,
                plan.burst_limit.map(|v| v as i64),
                plan.quota.map(|v| v as i64)
            ],
        )?;
        Ok(())
    }

    fn plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        let conn = self.lock()?;
        let plan = conn
            .query_row(
                "SELECT id, rate_limit, burst_limit, quota FROM plans WHERE id = ?1",
                params![plan_id],
                |row| {
                    let rate_limit: i64 = row.get(1)?;
                    let burst_limit: Option<i64> = row.get(2)?;
                    let quota: Option<i64> = row.get(3)?;
                    Ok(Plan {
                        id: row.get(0)?,
                        rate_limit: rate_limit.max(0) as u64,
                        burst_limit: burst_limit.map(|v| v.max(0) as u64),
                        quota: quota.map(|v| v.max(0) as u64),
                    })
                },
            )
            .optional()?;
        Ok(plan)
    }

    fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let ip_whitelist = serde_json::to_string(&record.ip_whitelist)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO api_keys ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                RECORD_COLUMNS
            ),
            params![
                record.id,
                record.prefix,
                record.identifier,
                record.secret_hash,
                record.owner.kind(),
                record.owner.reference(),
                record.plan_id,
                record.environment.as_str(),
                record.revoked,
                record.expires_at.map(|t| t.timestamp_millis()),
                ip_whitelist,
                record.usage_count as i64,
                record.quota_reset_at.timestamp_millis(),
                record.last_used_at.map(|t| t.timestamp_millis()),
                record.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        let conn = self.lock()?;
        Self::select_by_id(&conn, id)
    }

    fn find_by_identifier(&self, identifier: &str) -> Result<Vec<KeyRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM api_keys WHERE identifier = ?1",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![identifier], read_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn list_by_owner(&self, owner: &Owner) -> Result<Vec<KeyRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM api_keys \
             WHERE owner_kind = ?1 AND owner_ref = ?2 ORDER BY created_at ASC",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner.kind(), owner.reference()], read_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn replace_secret_hash(
        &self,
        id: &str,
        secret_hash: &str,
    ) -> Result<Option<KeyRecord>, StoreError> {
        self.update_then_get(
            id,
            "UPDATE api_keys SET secret_hash = ?2 WHERE id = ?1 AND revoked = 0",
            params![id, secret_hash],
        )
    }

    fn set_revoked(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.update_then_get(
            id,
            "UPDATE api_keys SET revoked = 1 WHERE id = ?1",
            params![id],
        )
    }

    fn set_ip_whitelist(
        &self,
        id: &str,
        ips: &BTreeSet<String>,
    ) -> Result<Option<KeyRecord>, StoreError> {
        let encoded = serde_json::to_string(ips)?;
        self.update_then_get(
            id,
            "UPDATE api_keys SET ip_whitelist = ?2 WHERE id = ?1 AND revoked = 0",
            params![id, encoded],
        )
    }

    fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1 AND revoked = 0",
            params![id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn increment_usage(&self, id: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.update_then_get(
            id,
            "UPDATE api_keys SET usage_count = usage_count + 1 WHERE id = ?1 AND revoked = 0",
            params![id],
        )
    }

    fn reset_usage(
        &self,
        id: &str,
        next_reset_at: DateTime<Utc>,
    ) -> Result<Option<KeyRecord>, StoreError> {
        self.update_then_get(
            id,
            "UPDATE api_keys SET usage_count = 0, quota_reset_at = ?2 \
             WHERE id = ?1 AND revoked = 0",
            params![id, next_reset_at.timestamp_millis()],
        )
    }

    fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM api_keys \
             WHERE revoked = 0 AND quota_reset_at < ?1 ORDER BY quota_reset_at ASC",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis()], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
