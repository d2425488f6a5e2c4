//! Shared storage primitives.
//!
//! Every store call made from the admission path goes through [`with_timeout`],
//! which moves the (synchronous) store operation onto the blocking pool and
//! bounds how long the caller waits for it.

use std::sync::Arc;
use std::time::Duration;

mod counter;

pub use counter::{CounterStore, MemoryCounterStore};

/// Errors raised by key, usage and counter stores.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store did not answer within the configured budget
    Timeout(Duration),
    /// The backend could not be reached
    Unavailable(String),
    /// A key holds a value of a different kind than the operation expects
    WrongType(String),
    /// Any other backend failure
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout(d) => write!(f, "store call timed out after {}ms", d.as_millis()),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::WrongType(key) => write!(f, "wrong value type stored at '{}'", key),
            StoreError::Backend(msg) => write!(f, "store failure: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization: {}", e))
    }
}

/// Run a blocking store operation on the blocking pool, bounded by `timeout`.
///
/// A timeout abandons the wait but not the task; store operations are atomic
/// so a late completion never leaves partial state behind.
pub async fn with_timeout<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(StoreError::Backend(format!(
            "store task failed: {}",
            join_error
        ))),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// How long a SQLite writer waits for a competing writer before failing.
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Open a SQLite database in WAL mode so readers never wait on writers.
pub fn open_sqlite(db_path: &str) -> anyhow::Result<rusqlite::Connection> {
    use anyhow::Context;

    let conn = rusqlite::Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path))?;
    conn.busy_timeout(SQLITE_BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;
    // In-memory databases report "memory" and stay that way
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("Failed to enable WAL")?;
    tracing::debug!(db_path, journal_mode = %mode, "SQLite connection opened");
    Ok(conn)
}

/// Background task that drops expired counters, windows and markers.
pub async fn run_counter_purge(store: Arc<dyn CounterStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let purged = store.purge_expired(chrono::Utc::now().timestamp_millis());
        tracing::debug!(purged, "Counter purge complete");
    }
}
