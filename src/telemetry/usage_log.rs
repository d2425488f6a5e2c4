//! Raw usage record persistence.
//!
//! Inserts are keyed by event id, so recording a redelivered event twice
//! leaves a single row.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::sync::Mutex;

use super::UsageEvent;
use crate::store::{open_sqlite, StoreError};

/// Append-only store of processed usage events.
pub trait UsageLog: Send + Sync {
    fn record(&self, event: &UsageEvent) -> Result<(), StoreError>;

    /// Number of stored events for a key
    fn count_for_key(&self, key_id: &str) -> Result<u64, StoreError>;
}

/// In-memory usage log for tests and single-node runs without a database.
#[derive(Default)]
pub struct MemoryUsageLog {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl UsageLog for MemoryUsageLog {
    fn record(&self, event: &UsageEvent) -> Result<(), StoreError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| StoreError::Backend("usage log lock poisoned".to_string()))?;
        if !events.iter().any(|e| e.event_id == event.event_id) {
            events.push(event.clone());
        }
        Ok(())
    }

    fn count_for_key(&self, key_id: &str) -> Result<u64, StoreError> {
        let events = self
            .events
            .lock()
            .map_err(|_| StoreError::Backend("usage log lock poisoned".to_string()))?;
        Ok(events.iter().filter(|e| e.key_id == key_id).count() as u64)
    }
}

/// Usage log in a SQLite table.
pub struct SqliteUsageLog {
    conn: Mutex<Connection>,
}

impl SqliteUsageLog {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = open_sqlite(db_path)
            .with_context(|| format!("Failed to open usage DB at {}", db_path))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_events (
                event_id    TEXT PRIMARY KEY,
                key_id      TEXT NOT NULL,
                product_id  TEXT,
                timestamp   INTEGER NOT NULL,
                status_code INTEGER NOT NULL,
                latency_ms  INTEGER NOT NULL,
                bytes_in    INTEGER NOT NULL,
                bytes_out   INTEGER NOT NULL,
                endpoint    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_events_key ON usage_events (key_id, timestamp);",
        )
        .context("Failed to create usage_events table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl UsageLog for SqliteUsageLog {
    fn record(&self, event: &UsageEvent) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("usage DB lock poisoned".to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO usage_events
                (event_id, key_id, product_id, timestamp, status_code, latency_ms,
                 bytes_in, bytes_out, endpoint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.event_id,
                event.key_id,
                event.product_id,
                event.timestamp.timestamp_millis(),
                event.status_code as i64,
                event.latency_ms as i64,
                event.bytes_in as i64,
                event.bytes_out as i64,
                event.endpoint,
            ],
        )?;
        Ok(())
    }

    fn count_for_key(&self, key_id: &str) -> Result<u64, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("usage DB lock poisoned".to_string()))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM usage_events WHERE key_id = ?1",
            params![key_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
