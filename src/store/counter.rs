//! Shared counter store: sliding-window logs, TTL counters, markers and
//! capped sample buffers.
//!
//! Each trait method is a single read-modify-write. Implementations must make
//! it atomic with respect to concurrent calls on the same key.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::VecDeque;

use super::StoreError;

/// Atomic counter operations shared by every gateway instance.
pub trait CounterStore: Send + Sync {
    /// Drop window entries at or before `now_ms - window_ms`, insert `now_ms`,
    /// refresh the key's expiry to `ttl_ms` and return the resulting count.
    fn record_in_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_ms: i64,
    ) -> Result<u64, StoreError>;

    /// Same trim as [`CounterStore::record_in_window`] without inserting.
    fn count_in_window(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError>;

    /// Increment a counter. The expiry is set only when the counter is created.
    fn increment(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<u64, StoreError>;

    /// Read a counter, `None` if absent or expired.
    fn get(&self, key: &str, now_ms: i64) -> Result<Option<u64>, StoreError>;

    /// Set a marker if absent. Returns true when this call created it.
    fn set_if_absent(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError>;

    /// Delete a key of any kind. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Append a sample, dropping the oldest beyond `cap`. Returns the buffer length.
    fn push_capped(
        &self,
        key: &str,
        value: f64,
        cap: usize,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<usize, StoreError>;

    /// Samples currently held at `key`, oldest first.
    fn samples(&self, key: &str, now_ms: i64) -> Result<Vec<f64>, StoreError>;

    /// Remove every expired key. Returns how many were removed.
    fn purge_expired(&self, now_ms: i64) -> usize;
}

enum Value {
    Window(VecDeque<i64>),
    Counter(u64),
    Marker,
    Samples(VecDeque<f64>),
}

struct Slot {
    value: Value,
    expires_at_ms: i64,
}

impl Slot {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// In-process [`CounterStore`] backed by a [`DashMap`].
///
/// The entry API holds the shard lock for the whole read-modify-write, which
/// gives per-key atomicity. Suitable for single-instance deployments and tests;
/// multi-instance deployments plug a networked store into the same trait.
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Number of live and not-yet-purged keys
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_window(entries: &mut VecDeque<i64>, now_ms: i64, window_ms: i64) {
    let cutoff = now_ms - window_ms;
    entries.retain(|&ts| ts > cutoff);
}

impl CounterStore for MemoryCounterStore {
    fn record_in_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        ttl_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                value: Value::Window(VecDeque::new()),
                expires_at_ms: now_ms + ttl_ms,
            });
        if slot.is_expired(now_ms) {
            slot.value = Value::Window(VecDeque::new());
        }
        let count = match &mut slot.value {
            Value::Window(entries) => {
                trim_window(entries, now_ms, window_ms);
                entries.push_back(now_ms);
                entries.len() as u64
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        slot.expires_at_ms = now_ms + ttl_ms;
        Ok(count)
    }

    fn count_in_window(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64, StoreError> {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(0);
        };
        if slot.is_expired(now_ms) {
            return Ok(0);
        }
        match &mut slot.value {
            Value::Window(entries) => {
                trim_window(entries, now_ms, window_ms);
                Ok(entries.len() as u64)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn increment(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<u64, StoreError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                value: Value::Counter(0),
                expires_at_ms: now_ms + ttl_ms,
            });
        if slot.is_expired(now_ms) {
            slot.value = Value::Counter(0);
            slot.expires_at_ms = now_ms + ttl_ms;
        }
        match &mut slot.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn get(&self, key: &str, now_ms: i64) -> Result<Option<u64>, StoreError> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        if slot.is_expired(now_ms) {
            return Ok(None);
        }
        match &slot.value {
            Value::Counter(n) => Ok(Some(*n)),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_if_absent(&self, key: &str, now_ms: i64, ttl_ms: i64) -> Result<bool, StoreError> {
        match self.slots.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now_ms) {
                    occupied.insert(Slot {
                        value: Value::Marker,
                        expires_at_ms: now_ms + ttl_ms,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Marker,
                    expires_at_ms: now_ms + ttl_ms,
                });
                Ok(true)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }

    fn push_capped(
        &self,
        key: &str,
        value: f64,
        cap: usize,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<usize, StoreError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                value: Value::Samples(VecDeque::new()),
                expires_at_ms: now_ms + ttl_ms,
            });
        if slot.is_expired(now_ms) {
            slot.value = Value::Samples(VecDeque::new());
        }
        let len = match &mut slot.value {
            Value::Samples(samples) => {
                samples.push_back(value);
                while samples.len() > cap {
                    samples.pop_front();
                }
                samples.len()
            }
            _ => return Err(StoreError::WrongType(key.to_string())),
        };
        slot.expires_at_ms = now_ms + ttl_ms;
        Ok(len)
    }

    fn samples(&self, key: &str, now_ms: i64) -> Result<Vec<f64>, StoreError> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(Vec::new());
        };
        if slot.is_expired(now_ms) {
            return Ok(Vec::new());
        }
        match &slot.value {
            Value::Samples(samples) => Ok(samples.iter().copied().collect()),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn purge_expired(&self, now_ms: i64) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now_ms));
        before.saturating_sub(self.slots.len())
    }
}
