//! Durable counter storage.
//!
//! Two implementations of [`CounterStore`]:
//! - **SQLite**: the production store, one row per `(date, feature, agent)`
//! - **Memory**: a `BTreeMap` behind a lock, for tests and embedding
//!
//! Both provide the atomic insert-or-add upsert the record pipeline relies on.

pub mod memory_store;
pub mod sqlite_store;

pub use memory_store::MemoryCounterStore;
pub use sqlite_store::SqliteCounterStore;

use crate::error::Result;
use crate::types::{CounterKey, UsageQuery, UsageRow};
use chrono::NaiveDate;

/// Transactional store of usage counters.
///
/// `upsert_add` must be atomic relative to concurrent writers on the same key:
/// it either inserts the row with `delta` hits or adds `delta` to the stored
/// value, never losing an increment and never duplicating a row.
pub trait CounterStore: Send + Sync {
    /// Stored hits for one counter, 0 when the row does not exist.
    fn hits(&self, key: &CounterKey) -> Result<u64>;

    /// Add `delta` to a counter, creating it if absent.
    fn upsert_add(&self, key: &CounterKey, delta: u64) -> Result<()>;

    /// Hits summed per `(date, feature)`, ordered by date then feature.
    fn enumerate(&self, query: &UsageQuery) -> Result<Vec<UsageRow>>;

    /// Earliest stored date at or after `not_before`.
    fn earliest_date(&self, not_before: NaiveDate) -> Result<Option<NaiveDate>>;

    /// Number of rows dated strictly before `cutoff`.
    fn count_before(&self, cutoff: NaiveDate) -> Result<u64>;

    /// Delete at most `limit` rows dated strictly before `cutoff`.
    /// Returns the number of rows removed.
    fn delete_before(&self, cutoff: NaiveDate, limit: u64) -> Result<u64>;

    /// Total number of counter rows.
    fn total_rows(&self) -> Result<u64>;
}
