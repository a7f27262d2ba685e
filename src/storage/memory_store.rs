//! In-memory counter store.
//!
//! Holds every counter in a `BTreeMap` behind a single `RwLock`, which makes
//! `upsert_add` trivially atomic. It can be switched into an "unavailable"
//! state to exercise error paths.

use super::CounterStore;
use crate::error::{Result, UsageError};
use crate::types::{CounterKey, UsageQuery, UsageRow};
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    rows: RwLock<BTreeMap<CounterKey, u64>>,
    unavailable: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every stored counter.
    pub fn snapshot(&self) -> Vec<(CounterKey, u64)> {
        self.rows
            .read()
            .iter()
            .map(|(key, hits)| (key.clone(), *hits))
            .collect()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(UsageError::StoreUnavailable(
                "memory store switched off".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl CounterStore for MemoryCounterStore {
    fn hits(&self, key: &CounterKey) -> Result<u64> {
        self.check()?;
        Ok(self.rows.read().get(key).copied().unwrap_or(0))
    }

    fn upsert_add(&self, key: &CounterKey, delta: u64) -> Result<()> {
        self.check()?;
        let mut rows = self.rows.write();
        let hits = rows.entry(key.clone()).or_insert(0);
        *hits = hits.saturating_add(delta);
        Ok(())
    }

    fn enumerate(&self, query: &UsageQuery) -> Result<Vec<UsageRow>> {
        self.check()?;
        let mut grouped: BTreeMap<(NaiveDate, String), u64> = BTreeMap::new();

        for (key, hits) in self.rows.read().iter() {
            if query.matches(key) {
                *grouped
                    .entry((key.date, key.feature.clone()))
                    .or_insert(0) += *hits;
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((date, feature), count)| UsageRow::new(feature, date, count))
            .collect())
    }

    fn earliest_date(&self, not_before: NaiveDate) -> Result<Option<NaiveDate>> {
        self.check()?;
        Ok(self
            .rows
            .read()
            .keys()
            .map(|key| key.date)
            .filter(|date| *date >= not_before)
            .min())
    }

    fn count_before(&self, cutoff: NaiveDate) -> Result<u64> {
        self.check()?;
        Ok(self
            .rows
            .read()
            .keys()
            .filter(|key| key.date < cutoff)
            .count() as u64)
    }

    fn delete_before(&self, cutoff: NaiveDate, limit: u64) -> Result<u64> {
        self.check()?;
        let mut rows = self.rows.write();
        // Keys sort by date first, so expired rows form a prefix of the map.
        let expired: Vec<CounterKey> = rows
            .keys()
            .take_while(|key| key.date < cutoff)
            .take(limit as usize)
            .cloned()
            .collect();

        for key in &expired {
            rows.remove(key);
        }
        Ok(expired.len() as u64)
    }

    fn total_rows(&self) -> Result<u64> {
        self.check()?;
        Ok(self.rows.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_matches_sqlite_semantics() -> Result<()> {
        let store = MemoryCounterStore::new();
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "zeta", "bot/1.0"), 2)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "alpha", "bot/1.0"), 3)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "alpha", "bot/2.0"), 4)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 25), "zeta", "other"), 100)?;

        let rows = store.enumerate(&UsageQuery {
            agent_prefix: "bot".to_string(),
            start: day(2024, 7, 1),
            end: day(2024, 7, 31),
            features: None,
        })?;
        assert_eq!(
            rows,
            vec![
                UsageRow::new("alpha", day(2024, 7, 26), 7),
                UsageRow::new("zeta", day(2024, 7, 26), 2),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_delete_before_only_touches_expired() -> Result<()> {
        let store = MemoryCounterStore::new();
        for i in 0..5 {
            store.upsert_add(&CounterKey::new(day(2024, 1, 1), "f", &i.to_string()), 1)?;
        }
        store.upsert_add(&CounterKey::new(day(2024, 7, 1), "f", "keep"), 1)?;

        assert_eq!(store.delete_before(day(2024, 6, 1), 3)?, 3);
        assert_eq!(store.delete_before(day(2024, 6, 1), 3)?, 2);
        assert_eq!(store.delete_before(day(2024, 6, 1), 3)?, 0);
        assert_eq!(store.total_rows()?, 1);
        Ok(())
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        let key = CounterKey::new(day(2024, 7, 26), "f", "a");
        assert!(matches!(
            store.hits(&key),
            Err(UsageError::StoreUnavailable(_))
        ));
        assert!(store.upsert_add(&key, 1).is_err());

        store.set_unavailable(false);
        assert!(store.upsert_add(&key, 1).is_ok());
    }
}
