//! # Pruner
//!
//! Deletes counters that fell out of the retention window, one bounded batch
//! per statement so no delete ever holds the store for long.

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::storage::CounterStore;
use crate::types::retention_cutoff;
use chrono::NaiveDate;
use log::info;
use std::sync::Arc;

pub struct Pruner {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    retention: RetentionConfig,
}

impl std::fmt::Debug for Pruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pruner")
            .field("retention", &self.retention)
            .finish()
    }
}

impl Pruner {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        retention: RetentionConfig,
    ) -> Self {
        Pruner {
            store,
            clock,
            retention,
        }
    }

    /// First day that is kept.
    pub fn cutoff(&self) -> NaiveDate {
        retention_cutoff(self.clock.today(), self.retention.max_age_days)
    }

    /// Delete expired counters in batches until none are left or `limit`
    /// rows are gone. `progress` receives the percentage done after every
    /// batch. Returns the number of rows deleted.
    pub fn prune(
        &self,
        mut progress: Option<&mut dyn FnMut(f64)>,
        limit: Option<u64>,
    ) -> Result<u64> {
        let cutoff = self.cutoff();
        let limit = limit.unwrap_or(u64::MAX);
        let total = self.store.count_before(cutoff)?;
        let mut deleted: u64 = 0;

        while deleted < limit {
            let batch = self.retention.purge_batch_size.min(limit - deleted);
            let removed = self.store.delete_before(cutoff, batch)?;
            deleted += removed;

            if let Some(report) = progress.as_mut() {
                let percent = if total == 0 {
                    100.0
                } else {
                    (deleted as f64 * 100.0 / total as f64).min(100.0)
                };
                report(percent);
            }

            if removed == 0 {
                break;
            }
        }

        if deleted > 0 {
            info!(
                "pruned {} usage counters dated before {}",
                deleted, cutoff
            );
        }
        Ok(deleted)
    }
}
