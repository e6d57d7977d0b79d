//! SQLite-backed per-node database.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  One connection is shared behind a `Mutex`; callers that
//! need a transaction lock it through [`Database::lock`].
//!
//! The replicated tables live here next to node-local ones.  Only the
//! state machine writes the replicated tables while the node is clustered.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ClusterNodeRecord, ClusterRecord, LiveNode, NodeStatus};
use super::timestamp;

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// The node's database.
pub struct Database {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.apply_pragmas()?;
        db.init_db()?;
        Ok(db)
    }

    /// Lock the connection. Hold the guard only for synchronous work.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("mutex poisoned")
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables if they do not already exist.
    /// Idempotent, so it runs on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Singleton cluster configuration
            CREATE TABLE IF NOT EXISTS clusters (
                id             INTEGER PRIMARY KEY CHECK (id = 1),
                enabled        INTEGER NOT NULL DEFAULT 0,
                key            TEXT NOT NULL DEFAULT '',
                raft_bootstrap INTEGER,
                raft_ip        TEXT NOT NULL DEFAULT '',
                raft_port      INTEGER NOT NULL DEFAULT 0
            );

            -- Stable identity of this node
            CREATE TABLE IF NOT EXISTS node_identity (
                id         INTEGER PRIMARY KEY CHECK (id = 1),
                node_uuid  TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Topology cache
            CREATE TABLE IF NOT EXISTS cluster_nodes (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                node_uuid  TEXT NOT NULL UNIQUE,
                status     TEXT NOT NULL,
                hostname   TEXT NOT NULL DEFAULT '',
                api        TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Replicated: notes
            CREATE TABLE IF NOT EXISTS cluster_notes (
                id         INTEGER PRIMARY KEY,
                title      TEXT NOT NULL,
                content    TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Replicated: options (single row)
            CREATE TABLE IF NOT EXISTS cluster_options (
                id              INTEGER PRIMARY KEY,
                keyboard_layout TEXT NOT NULL DEFAULT '',
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            -- Replicated: S3 targets
            CREATE TABLE IF NOT EXISTS cluster_s3_configs (
                id         INTEGER PRIMARY KEY,
                name       TEXT NOT NULL UNIQUE,
                endpoint   TEXT NOT NULL,
                region     TEXT NOT NULL,
                bucket     TEXT NOT NULL,
                access_key TEXT NOT NULL,
                secret_key TEXT NOT NULL
            );

            -- Last log position applied to the replicated tables
            CREATE TABLE IF NOT EXISTS fsm_applied (
                id    INTEGER PRIMARY KEY CHECK (id = 1),
                state TEXT NOT NULL
            );
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, timestamp()],
            )?;
        }

        conn.execute("INSERT OR IGNORE INTO clusters (id) VALUES (1)", [])?;

        Ok(())
    }

    // ── Cluster row ─────────────────────────────────────────────────

    pub fn load_cluster(&self) -> anyhow::Result<ClusterRecord> {
        let conn = self.lock();
        let record = conn.query_row(
            "SELECT enabled, key, raft_bootstrap, raft_ip, raft_port FROM clusters WHERE id = 1",
            [],
            |row| {
                Ok(ClusterRecord {
                    enabled: row.get::<_, i64>(0)? != 0,
                    key: row.get(1)?,
                    raft_bootstrap: row.get::<_, Option<i64>>(2)?.map(|v| v != 0),
                    bind_ip: row.get(3)?,
                    bind_port: u16::try_from(row.get::<_, i64>(4)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            4,
                            rusqlite::types::Type::Integer,
                            Box::new(e),
                        )
                    })?,
                })
            },
        )?;
        Ok(record)
    }

    pub fn save_cluster(&self, record: &ClusterRecord) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO clusters (id, enabled, key, raft_bootstrap, raft_ip, raft_port)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                key = excluded.key,
                raft_bootstrap = excluded.raft_bootstrap,
                raft_ip = excluded.raft_ip,
                raft_port = excluded.raft_port",
            params![
                record.enabled as i64,
                record.key,
                record.raft_bootstrap.map(|b| b as i64),
                record.bind_ip,
                record.bind_port as i64,
            ],
        )?;
        Ok(())
    }

    // ── Node identity ───────────────────────────────────────────────

    /// Return this node's UUID, generating and persisting one on first use.
    pub fn node_uuid(&self) -> anyhow::Result<String> {
        let conn = self.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT node_uuid FROM node_identity WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(uuid) = existing {
            return Ok(uuid);
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO node_identity (id, node_uuid, created_at) VALUES (1, ?1, ?2)",
            params![uuid, timestamp()],
        )?;
        Ok(uuid)
    }

    // ── Topology cache ──────────────────────────────────────────────

    pub fn list_nodes(&self) -> anyhow::Result<Vec<ClusterNodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, node_uuid, status, hostname, api, created_at, updated_at
             FROM cluster_nodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClusterNodeRecord {
                id: row.get(0)?,
                node_uuid: row.get(1)?,
                status: NodeStatus::parse(&row.get::<_, String>(2)?),
                hostname: row.get(3)?,
                api: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Mark every node in `live` online and every other cached node offline.
    ///
    /// Rows are never deleted so historical topology stays inspectable.
    pub fn reconcile_nodes(&self, live: &[LiveNode]) -> anyhow::Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let now = timestamp();

        for node in live {
            tx.execute(
                "INSERT INTO cluster_nodes (node_uuid, status, hostname, api, created_at, updated_at)
                 VALUES (?1, 'online', ?2, ?3, ?4, ?4)
                 ON CONFLICT(node_uuid) DO UPDATE SET
                    status = 'online',
                    hostname = excluded.hostname,
                    api = excluded.api,
                    updated_at = excluded.updated_at",
                params![node.node_uuid, node.hostname, node.api, now],
            )?;
        }

        let mut stmt = tx.prepare("SELECT node_uuid FROM cluster_nodes WHERE status = 'online'")?;
        let online: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for uuid in online {
            if !live.iter().any(|n| n.node_uuid == uuid) {
                tx.execute(
                    "UPDATE cluster_nodes SET status = 'offline', updated_at = ?2 WHERE node_uuid = ?1",
                    params![uuid, now],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

// -- Tests --------------------------------------------------------------------
