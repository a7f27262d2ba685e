//! # Query Engine
//!
//! Read side of the counter store: aggregated usage per `(date, feature)`
//! for an agent prefix, and a data-driven default date window.

use crate::clock::Clock;
use crate::error::{Result, UsageError};
use crate::storage::CounterStore;
use crate::types::{retention_cutoff, start_of_day, UsageQuery, UsageReport, UsageRow};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;

pub struct QueryEngine {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    max_age_days: u32,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("max_age_days", &self.max_age_days)
            .finish()
    }
}

impl QueryEngine {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, max_age_days: u32) -> Self {
        QueryEngine {
            store,
            clock,
            max_age_days,
        }
    }

    /// Usage for agents starting with `agent`, summed per `(date, feature)`.
    ///
    /// Dates are inclusive at day granularity and never reach further back
    /// than the retention cutoff. `features`, when given, restricts the
    /// result to those features. No matching rows is an empty list.
    pub fn enumerate(
        &self,
        agent: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        features: Option<&[String]>,
    ) -> Result<Vec<UsageRow>> {
        let cutoff = retention_cutoff(self.clock.today(), self.max_age_days);
        let query = UsageQuery {
            agent_prefix: agent.to_string(),
            start: start.date_naive().max(cutoff),
            end: end.date_naive(),
            features: features.map(|f| f.to_vec()),
        };

        if query.start > query.end {
            return Ok(Vec::new());
        }
        self.store.enumerate(&query)
    }

    /// Default window covering all retained data: from midnight of the
    /// earliest retained day (today if the store is empty) until now.
    pub fn suggest_date_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.clock.now();
        let cutoff = retention_cutoff(end.date_naive(), self.max_age_days);
        let first_day = self
            .store
            .earliest_date(cutoff)?
            .unwrap_or_else(|| end.date_naive());

        Ok((start_of_day(first_day), end))
    }

    /// Query surface used by report views and the CLI.
    ///
    /// A missing start or end is taken from [`Self::suggest_date_range`].
    pub fn query(
        &self,
        agent: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        features: Option<&[String]>,
    ) -> Result<UsageReport> {
        if agent.is_empty() {
            return Err(UsageError::InvalidInput(
                "agent must not be empty".to_string(),
            ));
        }

        let (start, end) = match (start, end) {
            (Some(start), Some(end)) => (start, end),
            (start, end) => {
                let (suggested_start, suggested_end) = self.suggest_date_range()?;
                (
                    start.unwrap_or(suggested_start),
                    end.unwrap_or(suggested_end),
                )
            }
        };

        let usage = self.enumerate(agent, start, end, features)?;
        Ok(UsageReport {
            agent: agent.to_string(),
            start: start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end: end.to_rfc3339_opts(SecondsFormat::Secs, true),
            usage,
        })
    }
}
