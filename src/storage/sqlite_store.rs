//! # SQLite Counter Store
//!
//! One row per `(usage_date, feature, agent)`. Increments are applied with a
//! single `INSERT ... ON CONFLICT DO UPDATE` statement in autocommit mode, so
//! concurrent writers (threads or processes) never lose hits and the row lock
//! is held only for the duration of that statement.

use super::CounterStore;
use crate::error::{Result, UsageError};
use crate::types::{CounterKey, UsageQuery, UsageRow, DATE_FORMAT};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS feature_usage (
        usage_date TEXT NOT NULL,
        feature TEXT NOT NULL,
        agent TEXT NOT NULL,
        hits INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (usage_date, feature, agent)
    );
    CREATE INDEX IF NOT EXISTS feature_usage_feature_date
        ON feature_usage (feature, usage_date);
";

/// SQLite-backed [`CounterStore`].
pub struct SqliteCounterStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCounterStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteCounterStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("opened {} (journal_mode={})", path.display(), mode);

        Self::init(conn, Some(path))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteCounterStore {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Location on disk, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn to_sql_count(n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| UsageError::InvalidInput(format!("count {} out of range", n)))
}

fn date_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

impl CounterStore for SqliteCounterStore {
    fn hits(&self, key: &CounterKey) -> Result<u64> {
        let conn = self.conn.lock();
        let hits: Option<i64> = conn
            .query_row(
                "SELECT hits FROM feature_usage
                 WHERE usage_date = ?1 AND feature = ?2 AND agent = ?3",
                params![key.date, key.feature, key.agent],
                |row| row.get(0),
            )
            .optional()?;

        Ok(hits.unwrap_or(0).max(0) as u64)
    }

    fn upsert_add(&self, key: &CounterKey, delta: u64) -> Result<()> {
        let delta = to_sql_count(delta)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO feature_usage (usage_date, feature, agent, hits)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (usage_date, feature, agent)
             DO UPDATE SET hits = hits + excluded.hits",
            params![key.date, key.feature, key.agent, delta],
        )?;
        Ok(())
    }

    fn enumerate(&self, query: &UsageQuery) -> Result<Vec<UsageRow>> {
        if query.start > query.end {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT usage_date, feature, SUM(hits) FROM feature_usage
             WHERE substr(agent, 1, length(?1)) = ?1
               AND usage_date >= ?2 AND usage_date <= ?3",
        );
        let mut values = vec![
            Value::Text(query.agent_prefix.clone()),
            Value::Text(date_text(query.start)),
            Value::Text(date_text(query.end)),
        ];

        if let Some(ref features) = query.features {
            if features.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<String> = (0..features.len())
                .map(|i| format!("?{}", values.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND feature IN ({})", placeholders.join(", ")));
            values.extend(features.iter().cloned().map(Value::Text));
        }

        sql.push_str(
            " GROUP BY usage_date, feature
              ORDER BY usage_date ASC, feature ASC",
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            let date: NaiveDate = row.get(0)?;
            let feature: String = row.get(1)?;
            let hits: i64 = row.get(2)?;
            Ok(UsageRow::new(feature, date, hits.max(0) as u64))
        })?;

        let mut usage = Vec::new();
        for row in rows {
            usage.push(row?);
        }
        Ok(usage)
    }

    fn earliest_date(&self, not_before: NaiveDate) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock();
        let date: Option<NaiveDate> = conn.query_row(
            "SELECT MIN(usage_date) FROM feature_usage WHERE usage_date >= ?1",
            params![not_before],
            |row| row.get(0),
        )?;
        Ok(date)
    }

    fn count_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feature_usage WHERE usage_date < ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn delete_before(&self, cutoff: NaiveDate, limit: u64) -> Result<u64> {
        if limit == 0 {
            return Ok(0);
        }
        let limit = to_sql_count(limit)?;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM feature_usage WHERE rowid IN (
                SELECT rowid FROM feature_usage
                WHERE usage_date < ?1
                ORDER BY usage_date ASC
                LIMIT ?2
            )",
            params![cutoff, limit],
        )?;
        Ok(deleted as u64)
    }

    fn total_rows(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM feature_usage", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_upsert_creates_then_adds() -> Result<()> {
        let store = SqliteCounterStore::open_in_memory()?;
        let key = CounterKey::new(day(2024, 7, 26), "f1", "bot/1.0");

        assert_eq!(store.hits(&key)?, 0);
        store.upsert_add(&key, 1)?;
        assert_eq!(store.hits(&key)?, 1);
        store.upsert_add(&key, 10)?;
        assert_eq!(store.hits(&key)?, 11);
        assert_eq!(store.total_rows()?, 1);
        Ok(())
    }

    #[test]
    fn test_enumerate_groups_and_orders() -> Result<()> {
        let store = SqliteCounterStore::open_in_memory()?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "zeta", "bot/1.0"), 2)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "alpha", "bot/1.0"), 3)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "alpha", "bot/2.0"), 4)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 25), "zeta", "bot/1.0"), 5)?;
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
                UsageRow::new("zeta", day(2024, 7, 25), 5),
                UsageRow::new("alpha", day(2024, 7, 26), 7),
                UsageRow::new("zeta", day(2024, 7, 26), 2),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_prefix_is_case_sensitive_and_literal() -> Result<()> {
        let store = SqliteCounterStore::open_in_memory()?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "f1", "Bot%x"), 1)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "f1", "bot_y"), 1)?;

        let query = |prefix: &str| UsageQuery {
            agent_prefix: prefix.to_string(),
            start: day(2024, 7, 26),
            end: day(2024, 7, 26),
            features: None,
        };

        assert!(store.enumerate(&query("bot%"))?.is_empty());
        assert_eq!(store.enumerate(&query("Bot%"))?[0].count, 1);
        assert!(store.enumerate(&query("boty"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_delete_before_is_bounded() -> Result<()> {
        let store = SqliteCounterStore::open_in_memory()?;
        for i in 0..10 {
            store.upsert_add(
                &CounterKey::new(day(2024, 1, 1), "f1", &format!("agent-{}", i)),
                1,
            )?;
        }
        store.upsert_add(&CounterKey::new(day(2024, 7, 26), "f1", "fresh"), 1)?;

        assert_eq!(store.count_before(day(2024, 7, 1))?, 10);
        assert_eq!(store.delete_before(day(2024, 7, 1), 4)?, 4);
        assert_eq!(store.delete_before(day(2024, 7, 1), 100)?, 6);
        assert_eq!(store.delete_before(day(2024, 7, 1), 100)?, 0);
        assert_eq!(store.total_rows()?, 1);
        Ok(())
    }

    #[test]
    fn test_earliest_date() -> Result<()> {
        let store = SqliteCounterStore::open_in_memory()?;
        assert_eq!(store.earliest_date(day(2024, 1, 1))?, None);

        store.upsert_add(&CounterKey::new(day(2023, 12, 1), "f1", "a"), 1)?;
        store.upsert_add(&CounterKey::new(day(2024, 7, 25), "f1", "a"), 1)?;
        assert_eq!(store.earliest_date(day(2024, 1, 1))?, Some(day(2024, 7, 25)));
        assert_eq!(store.earliest_date(day(2023, 1, 1))?, Some(day(2023, 12, 1)));
        Ok(())
    }

    #[test]
    fn test_reopen_on_disk() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("nested").join("usage.db");
        let key = CounterKey::new(day(2024, 7, 26), "f1", "bot");

        {
            let store = SqliteCounterStore::open(&path, Duration::from_secs(1))?;
            store.upsert_add(&key, 3)?;
        }

        let store = SqliteCounterStore::open(&path, Duration::from_secs(1))?;
        assert_eq!(store.hits(&key)?, 3);
        assert_eq!(store.path(), Some(path.as_path()));
        Ok(())
    }
}
