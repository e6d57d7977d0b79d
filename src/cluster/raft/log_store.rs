//! SQLite-backed Raft log and stable store.
//!
//! ```text
//! <raft data dir>/
//! ├── raft-log.db      entries(log_index, entry)   one JSON entry per row
//! └── raft-stable.db   kv(key, value)              vote, committed, last_purged
//! ```

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::{Arc, Mutex};

use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{Entry, LogState, OptionalSend, RaftLogReader, StorageIOError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{io_err, LogId, StorageError, TypeConfig, Vote};
use crate::cluster::net::{LOG_DB, STABLE_DB};

const KEY_VOTE: &str = "vote";
const KEY_COMMITTED: &str = "committed";
const KEY_LAST_PURGED: &str = "last_purged";

#[derive(Clone)]
pub struct SqliteLogStore {
    log: Arc<Mutex<Connection>>,
    stable: Arc<Mutex<Connection>>,
}

impl SqliteLogStore {
    /// Open (or create) both databases under `dir`.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let log = Connection::open(dir.join(LOG_DB))?;
        apply_pragmas(&log)?;
        log.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                log_index INTEGER PRIMARY KEY,
                entry     TEXT NOT NULL
            );",
        )?;

        let stable = Connection::open(dir.join(STABLE_DB))?;
        apply_pragmas(&stable)?;
        stable.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            log: Arc::new(Mutex::new(log)),
            stable: Arc::new(Mutex::new(stable)),
        })
    }

    fn read_kv<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, std::io::Error> {
        let conn = self.stable.lock().expect("mutex poisoned");
        let raw: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(io_err)?;
        match raw {
            Some(json) => serde_json::from_str(&json).map(Some).map_err(io_err),
            None => Ok(None),
        }
    }

    fn write_kv<T: Serialize>(&self, key: &str, value: &T) -> Result<(), std::io::Error> {
        let json = serde_json::to_string(value).map_err(io_err)?;
        let conn = self.stable.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, json],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn read_range(&self, start: i64, end: i64) -> Result<Vec<Entry<TypeConfig>>, std::io::Error> {
        let conn = self.log.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT entry FROM entries
                 WHERE log_index >= ?1 AND log_index < ?2
                 ORDER BY log_index",
            )
            .map_err(io_err)?;
        let rows = stmt
            .query_map(params![start, end], |row| row.get::<_, String>(0))
            .map_err(io_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let json = row.map_err(io_err)?;
            entries.push(serde_json::from_str(&json).map_err(io_err)?);
        }
        Ok(entries)
    }

    fn last_entry(&self) -> Result<Option<Entry<TypeConfig>>, std::io::Error> {
        let conn = self.log.lock().expect("mutex poisoned");
        let raw: Option<String> = conn
            .query_row(
                "SELECT entry FROM entries ORDER BY log_index DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(io_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(io_err))
            .transpose()
    }

    fn append_all(&self, entries: Vec<Entry<TypeConfig>>) -> Result<(), std::io::Error> {
        let mut conn = self.log.lock().expect("mutex poisoned");
        let tx = conn.transaction().map_err(io_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO entries (log_index, entry) VALUES (?1, ?2)")
                .map_err(io_err)?;
            for entry in &entries {
                let json = serde_json::to_string(entry).map_err(io_err)?;
                stmt.execute(params![to_sql_index(entry.log_id.index), json])
                    .map_err(io_err)?;
            }
        }
        tx.commit().map_err(io_err)
    }

    fn delete_from(&self, index: u64) -> Result<(), std::io::Error> {
        let conn = self.log.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM entries WHERE log_index >= ?1",
            params![to_sql_index(index)],
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn delete_through(&self, index: u64) -> Result<(), std::io::Error> {
        let conn = self.log.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM entries WHERE log_index <= ?1",
            params![to_sql_index(index)],
        )
        .map_err(io_err)?;
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA busy_timeout = 5000;",
    )
}

fn to_sql_index(index: u64) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

/// Convert a range over log indexes to a half-open `[start, end)` pair.
fn sql_bounds<RB: RangeBounds<u64>>(range: &RB) -> (i64, i64) {
    let start = match range.start_bound() {
        Bound::Included(&s) => to_sql_index(s),
        Bound::Excluded(&s) => to_sql_index(s.saturating_add(1)),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => to_sql_index(e.saturating_add(1)),
        Bound::Excluded(&e) => to_sql_index(e),
        Bound::Unbounded => i64::MAX,
    };
    (start, end)
}

impl RaftLogReader<TypeConfig> for SqliteLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError> {
        let (start, end) = sql_bounds(&range);
        let entries = self
            .read_range(start, end)
            .map_err(|e| StorageIOError::read_logs(&e))?;
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for SqliteLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError> {
        let last_purged_log_id: Option<LogId> = self
            .read_kv(KEY_LAST_PURGED)
            .map_err(|e| StorageIOError::read_logs(&e))?;
        let last = self
            .last_entry()
            .map_err(|e| StorageIOError::read_logs(&e))?
            .map(|e| e.log_id);

        Ok(LogState {
            last_purged_log_id,
            last_log_id: last.or(last_purged_log_id),
        })
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError> {
        self.write_kv(KEY_COMMITTED, &committed)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError> {
        let committed: Option<Option<LogId>> = self
            .read_kv(KEY_COMMITTED)
            .map_err(|e| StorageIOError::read_logs(&e))?;
        Ok(committed.flatten())
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError> {
        self.write_kv(KEY_VOTE, vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError> {
        let vote = self
            .read_kv(KEY_VOTE)
            .map_err(|e| StorageIOError::read_vote(&e))?;
        Ok(vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        self.append_all(entries)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError> {
        tracing::debug!(%log_id, "truncating raft log");
        self.delete_from(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError> {
        tracing::debug!(%log_id, "purging raft log");
        self.write_kv(KEY_LAST_PURGED, &log_id)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        self.delete_through(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
