//! Core data types: counter keys, query filters and result rows.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest agent string stored, in bytes.
pub const MAX_AGENT_LEN: usize = 255;

/// Format of the `date` field surfaced by queries.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Identity of one durable counter row: `(date, feature, agent)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub date: NaiveDate,
    pub feature: String,
    pub agent: String,
}

impl CounterKey {
    /// Build a key, truncating the agent to [`MAX_AGENT_LEN`] bytes.
    pub fn new(date: NaiveDate, feature: &str, agent: &str) -> Self {
        CounterKey {
            date,
            feature: feature.to_string(),
            agent: truncate_agent(agent).to_string(),
        }
    }

    /// Key of the recent-hit cache entry shadowing this counter.
    pub fn cache_key(&self) -> String {
        format!(
            "recent-hits:{}:{}:{}",
            self.feature,
            agent_digest(&self.agent),
            self.date.format("%Y%m%d")
        )
    }
}

/// Truncate on a character boundary so that at most [`MAX_AGENT_LEN`] bytes remain.
pub fn truncate_agent(agent: &str) -> &str {
    if agent.len() <= MAX_AGENT_LEN {
        return agent;
    }
    let mut end = MAX_AGENT_LEN;
    while !agent.is_char_boundary(end) {
        end -= 1;
    }
    &agent[..end]
}

/// Hex SHA-256 of an agent string.
pub fn agent_digest(agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Midnight UTC of `date`.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Oldest day still inside a retention window of `max_age_days`.
pub fn retention_cutoff(today: NaiveDate, max_age_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(max_age_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Aggregated usage for one `(date, feature)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRow {
    pub feature: String,
    /// Calendar day as `YYYY-MM-DD`
    pub date: String,
    pub count: u64,
}

impl UsageRow {
    pub fn new(feature: impl Into<String>, date: NaiveDate, count: u64) -> Self {
        UsageRow {
            feature: feature.into(),
            date: date.format(DATE_FORMAT).to_string(),
            count,
        }
    }
}

/// Filter handed to [`crate::storage::CounterStore::enumerate`].
///
/// Date bounds are inclusive and already clamped to the retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery {
    /// Prefix of the stored agent string
    pub agent_prefix: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Restrict to these features when present
    pub features: Option<Vec<String>>,
}

impl UsageQuery {
    /// Whether a stored row falls inside this filter.
    pub fn matches(&self, key: &CounterKey) -> bool {
        key.agent.starts_with(&self.agent_prefix)
            && key.date >= self.start
            && key.date <= self.end
            && self
                .features
                .as_ref()
                .map_or(true, |features| features.iter().any(|f| *f == key.feature))
    }
}

/// Result of the public query surface: the resolved window plus usage rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub agent: String,
    /// RFC 3339 start of the window
    pub start: String,
    /// RFC 3339 end of the window
    pub end: String,
    pub usage: Vec<UsageRow>,
}
