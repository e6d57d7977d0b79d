//! The replicated state machine.
//!
//! [`FsmDispatcher`] turns committed log entries into store mutations.  It
//! decodes the [`Command`] envelope, looks the domain up in the
//! [`HandlerRegistry`] and runs the handler inside a SQLite transaction.
//!
//! A single state-machine lock is shared by [`FsmDispatcher::apply`],
//! [`FsmDispatcher::apply_direct`], [`FsmDispatcher::snapshot`] and
//! [`FsmDispatcher::restore`], so writes to the replicated tables form one
//! serial history in log order.
//!
//! The consensus adapter may pass an opaque "applied" marker with each
//! entry.  It is written in the same transaction as the handler's changes,
//! so a restart never re-applies an entry whose effects are already stored.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use metrics::counter;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::command::Command;
use super::domains::{self, notes, options, s3};
use super::registry::HandlerRegistry;
use crate::db::models::{NoteRecord, OptionRecord, S3ConfigRecord};
use crate::db::Database;
use crate::metrics::{FSM_APPLY_TOTAL, FSM_RESTORE_TOTAL, FSM_SNAPSHOT_TOTAL};

/// Errors produced while applying, snapshotting or restoring.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("failed to decode command: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("no handler for domain={0}")]
    NoHandler(String),

    #[error("handler failed for domain={domain} action={action}: {source:#}")]
    Handler {
        domain: String,
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode snapshot: {0}")]
    SnapshotDecode(#[source] serde_json::Error),

    #[error("failed to encode snapshot: {0}")]
    SnapshotEncode(#[source] serde_json::Error),

    #[error("state machine store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("state machine table error: {0:#}")]
    Table(#[from] anyhow::Error),
}

/// Result of applying one entry, handed back to whoever proposed it.
///
/// A commit can succeed while the handler fails; `error` carries the
/// handler-level failure in that case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyOutcome {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(err: &FsmError) -> Self {
        Self {
            error: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// What a committed log entry carries.
#[derive(Debug, Clone, Copy)]
pub enum EntryKind<'a> {
    /// A serialized [`Command`].
    Command(&'a [u8]),
    /// Blank or membership entries used internally by the consensus core.
    Internal,
}

/// Deep copy of every replicated table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub notes: Vec<NoteRecord>,
    pub options: Vec<OptionRecord>,
    pub s3_configs: Vec<S3ConfigRecord>,
}

/// A point-in-time snapshot, detached from the store.
///
/// Serialization happens in [`FsmSnapshot::persist`], which can run after
/// the state-machine lock has been released.
#[derive(Debug, Clone)]
pub struct FsmSnapshot {
    pub data: ClusterSnapshot,
    /// Applied marker at the time of capture.
    pub applied: Option<String>,
}

impl FsmSnapshot {
    pub fn persist<W: Write>(&self, sink: W) -> Result<(), FsmError> {
        serde_json::to_writer(sink, &self.data).map_err(FsmError::SnapshotEncode)
    }
}

pub struct FsmDispatcher {
    db: Arc<Database>,
    registry: HandlerRegistry,
    state_lock: Mutex<()>,
}

impl FsmDispatcher {
    /// A dispatcher with an empty registry.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            registry: HandlerRegistry::new(),
            state_lock: Mutex::new(()),
        }
    }

    /// A dispatcher with every built-in domain registered.
    pub fn with_default_handlers(db: Arc<Database>) -> Self {
        let dispatcher = Self::new(db);
        domains::register_defaults(&dispatcher.registry);
        dispatcher
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ── Apply ───────────────────────────────────────────────────────

    /// Apply one committed log entry.
    ///
    /// Decode failures, unknown domains and handler errors are returned in
    /// the [`ApplyOutcome`] and never stop the next entry from applying.
    /// `Err` is reserved for store failures that leave the entry unapplied.
    pub fn apply(
        &self,
        entry: EntryKind<'_>,
        applied: Option<&str>,
    ) -> Result<ApplyOutcome, FsmError> {
        let _guard = self.state_lock.lock().expect("mutex poisoned");
        let mut conn = self.db.lock();
        let mut tx = conn.transaction()?;

        let outcome = match entry {
            EntryKind::Internal => ApplyOutcome::ok(),
            EntryKind::Command(bytes) => match self.execute(&mut tx, bytes) {
                Ok(domain) => {
                    counter!(FSM_APPLY_TOTAL, "domain" => domain, "result" => "ok").increment(1);
                    ApplyOutcome::ok()
                }
                Err(err) => {
                    warn!(error = %err, "command rejected by state machine");
                    counter!(FSM_APPLY_TOTAL, "domain" => domain_label(&err), "result" => "error")
                        .increment(1);
                    ApplyOutcome::failed(&err)
                }
            },
        };

        if let Some(state) = applied {
            write_applied(&tx, state)?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Apply a command to the local store without going through the log.
    ///
    /// Runs the same handler as [`FsmDispatcher::apply`], so a node that is
    /// not clustered ends up with exactly the rows a replica would have.
    pub fn apply_direct(&self, command: &Command) -> Result<(), FsmError> {
        let _guard = self.state_lock.lock().expect("mutex poisoned");
        let mut conn = self.db.lock();
        let mut tx = conn.transaction()?;
        self.dispatch(&mut tx, command)?;
        tx.commit()?;
        Ok(())
    }

    fn execute(&self, tx: &mut Transaction<'_>, bytes: &[u8]) -> Result<String, FsmError> {
        let command = Command::decode(bytes).map_err(FsmError::Decode)?;
        self.dispatch(tx, &command)?;
        Ok(command.domain)
    }

    fn dispatch(&self, tx: &mut Transaction<'_>, command: &Command) -> Result<(), FsmError> {
        let handler = self
            .registry
            .lookup(&command.domain)
            .ok_or_else(|| FsmError::NoHandler(command.domain.clone()))?;

        // A failing handler rolls back only its own writes.
        let sp = tx.savepoint()?;
        match handler.handle(&sp, &command.action, command.payload_bytes()) {
            Ok(()) => {
                sp.commit()?;
                debug!(domain = %command.domain, action = %command.action, "command applied");
                Ok(())
            }
            Err(source) => Err(FsmError::Handler {
                domain: command.domain.clone(),
                action: command.action.clone(),
                source,
            }),
        }
    }

    // ── Snapshot / restore ──────────────────────────────────────────

    /// Capture every replicated table and the applied marker.
    pub fn snapshot(&self) -> Result<FsmSnapshot, FsmError> {
        let _guard = self.state_lock.lock().expect("mutex poisoned");
        let conn = self.db.lock();
        let data = ClusterSnapshot {
            notes: notes::list(&conn)?,
            options: options::list(&conn)?,
            s3_configs: s3::list(&conn)?,
        };
        let applied = read_applied(&conn)?;
        counter!(FSM_SNAPSHOT_TOTAL).increment(1);
        Ok(FsmSnapshot { data, applied })
    }

    /// Replace every replicated table with the snapshot read from `reader`.
    ///
    /// The whole snapshot is decoded before anything is deleted; a bad
    /// snapshot leaves the current tables untouched.
    pub fn restore<R: Read>(&self, reader: R, applied: Option<&str>) -> Result<(), FsmError> {
        let snapshot: ClusterSnapshot =
            serde_json::from_reader(reader).map_err(FsmError::SnapshotDecode)?;

        let _guard = self.state_lock.lock().expect("mutex poisoned");
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        clear_tables(&tx)?;
        notes::insert_all(&tx, &snapshot.notes)?;
        options::insert_all(&tx, &snapshot.options)?;
        s3::insert_all(&tx, &snapshot.s3_configs)?;
        match applied {
            Some(state) => write_applied(&tx, state)?,
            None => {
                tx.execute("DELETE FROM fsm_applied", [])?;
            }
        }
        tx.commit()?;

        counter!(FSM_RESTORE_TOTAL).increment(1);
        info!(
            notes = snapshot.notes.len(),
            options = snapshot.options.len(),
            s3_configs = snapshot.s3_configs.len(),
            "state machine restored from snapshot"
        );
        Ok(())
    }

    /// Applied marker last written alongside an entry or restore.
    pub fn applied_state(&self) -> Result<Option<String>, FsmError> {
        let conn = self.db.lock();
        read_applied(&conn)
    }

    /// Forget the applied marker. Used when the on-disk log is discarded.
    pub fn clear_applied(&self) -> Result<(), FsmError> {
        let _guard = self.state_lock.lock().expect("mutex poisoned");
        let conn = self.db.lock();
        conn.execute("DELETE FROM fsm_applied", [])?;
        Ok(())
    }

    /// Empty every replicated table and the applied marker.
    ///
    /// A joining node starts from this state and adopts the leader's data
    /// from the log or a snapshot.
    pub fn reset(&self) -> Result<(), FsmError> {
        let _guard = self.state_lock.lock().expect("mutex poisoned");
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        clear_tables(&tx)?;
        tx.execute("DELETE FROM fsm_applied", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Read-only access to the replicated tables.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let conn = self.db.lock();
        f(&conn)
    }
}

fn clear_tables(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "DELETE FROM cluster_notes;
         DELETE FROM cluster_options;
         DELETE FROM cluster_s3_configs;",
    )
}

fn write_applied(conn: &rusqlite::Connection, state: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO fsm_applied (id, state) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET state = excluded.state",
        params![state],
    )?;
    Ok(())
}

fn read_applied(conn: &rusqlite::Connection) -> Result<Option<String>, FsmError> {
    Ok(conn
        .query_row("SELECT state FROM fsm_applied WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?)
}

fn domain_label(err: &FsmError) -> String {
    match err {
        FsmError::NoHandler(domain) => domain.clone(),
        FsmError::Handler { domain, .. } => domain.clone(),
        _ => "unknown".to_string(),
    }
}

// -- Tests --------------------------------------------------------------------
