//! # Recent-Hit Cache
//!
//! Shared, TTL-based approximation of "hits so far today" per counter. The
//! record pipeline reads it on every event so the durable store is only
//! consulted on a miss, and increments it atomically so concurrent callers
//! see each other's sampled hits within the TTL window.
//!
//! Values may lag the store. Expiry forces a re-read, which heals any drift.

use crate::clock::Clock;
use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of live entries.
pub const DEFAULT_CAPACITY: usize = 100_000;

/// Shared cache contract used by the record pipeline.
///
/// An `Err` from any method means the cache itself is unreachable, which is
/// distinct from `Ok(None)` (key absent or expired).
pub trait RecentHitCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Store `value` only if the key is absent. Returns whether it was stored.
    fn add(&self, key: &str, value: u64, ttl: Duration) -> Result<bool>;

    /// Add `step` to an existing entry, or create it with `init`.
    /// Returns the new value. Atomic relative to other callers.
    fn incr_with_init(&self, key: &str, ttl: Duration, init: u64, step: u64) -> Result<u64>;
}

/// Position of an entry in expiry order. The sequence number breaks ties
/// between entries expiring at the same instant, oldest insert first.
type ExpiryKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: u64,
    expires_at: DateTime<Utc>,
    seq: u64,
}

impl CacheEntry {
    fn expiry_key(&self) -> ExpiryKey {
        (self.expires_at, self.seq)
    }
}

/// Entries plus an index ordered by expiry. Both are always updated together.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    by_expiry: BTreeMap<ExpiryKey, String>,
    next_seq: u64,
}

impl CacheState {
    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|entry| entry.expires_at > now)
    }

    fn insert(&mut self, key: &str, value: u64, expires_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = CacheEntry {
            value,
            expires_at,
            seq,
        };
        self.by_expiry.insert(entry.expiry_key(), key.to_string());
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.by_expiry.remove(&old.expiry_key());
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.remove(key) {
            self.by_expiry.remove(&old.expiry_key());
        }
    }

    /// Drop the entry closest to expiry. Returns whether it was still live.
    fn pop_oldest(&mut self, now: DateTime<Utc>) -> Option<bool> {
        let ((expires_at, _), key) = self.by_expiry.pop_first()?;
        self.entries.remove(&key);
        Some(expires_at > now)
    }

    fn front_expired(&self, now: DateTime<Utc>) -> bool {
        self.by_expiry
            .first_key_value()
            .map_or(false, |((expires_at, _), _)| *expires_at <= now)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_expiry.clear();
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Live entries dropped to make room
    pub total_evictions: u64,
}

/// In-process [`RecentHitCache`] bounded by capacity.
///
/// When full, expired entries are dropped first; if none expired the entry
/// closest to expiry is evicted. Both come off the front of the expiry index,
/// so making room costs `O(log n)` per dropped entry.
pub struct LocalHitCache {
    state: RwLock<CacheState>,
    capacity: usize,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for LocalHitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHitCache")
            .field("entries", &self.state.read().entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl LocalHitCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, clock)
    }

    pub fn with_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        LocalHitCache {
            state: RwLock::new(CacheState::default()),
            capacity: capacity.max(1),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.state.read().live(key, now).is_some()
    }

    pub fn remove(&self, key: &str) {
        self.state.write().remove(key);
    }

    pub fn clear(&self) {
        self.state.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.state.read().entries.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Make room for one new entry. Caller holds the write lock.
    fn make_room(&self, state: &mut CacheState, now: DateTime<Utc>) {
        if state.entries.len() < self.capacity {
            return;
        }

        while state.front_expired(now) {
            state.pop_oldest(now);
        }

        while state.entries.len() >= self.capacity {
            match state.pop_oldest(now) {
                Some(true) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                Some(false) => {}
                None => break,
            }
        }
    }

    /// Insert or replace `key`, making room first if it is not already present.
    fn store(
        &self,
        state: &mut CacheState,
        now: DateTime<Utc>,
        key: &str,
        value: u64,
        ttl: Duration,
    ) {
        if !state.entries.contains_key(key) {
            self.make_room(state, now);
        }
        state.insert(key, value, Self::expiry(now, ttl));
    }
}

impl RecentHitCache for LocalHitCache {
    fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now();
        let value = self.state.read().live(key, now).map(|entry| entry.value);

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    fn add(&self, key: &str, value: u64, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.write();

        if state.live(key, now).is_some() {
            return Ok(false);
        }

        self.store(&mut state, now, key, value, ttl);
        Ok(true)
    }

    fn incr_with_init(&self, key: &str, ttl: Duration, init: u64, step: u64) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.state.write();

        if let Some(entry) = state.entries.get_mut(key) {
            if entry.expires_at > now {
                entry.value = entry.value.saturating_add(step);
                return Ok(entry.value);
            }
        }

        self.store(&mut state, now, key, init, ttl);
        Ok(init)
    }
}
