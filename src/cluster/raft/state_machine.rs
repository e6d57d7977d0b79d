//! openraft state-machine adapter over [`FsmDispatcher`].
//!
//! The last applied log id and membership are kept as an opaque marker that
//! the dispatcher writes in the same transaction as each entry's effects.
//! After a restart openraft resumes from that marker, so no entry is applied
//! twice.
//!
//! The most recent snapshot lives under `snapshots/` as two files:
//! `current.meta` (openraft metadata) and `current.snap` (table data).

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{Entry, EntryPayload, RaftSnapshotBuilder, StorageIOError};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::types::{io_err, LogId, SnapshotMeta, StorageError, StoredMembership, TypeConfig};
use crate::cluster::fsm::{ApplyOutcome, EntryKind, FsmDispatcher};
use crate::cluster::net::SNAPSHOT_DIR;

const META_FILE: &str = "current.meta";
const DATA_FILE: &str = "current.snap";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppliedState {
    last_applied: Option<LogId>,
    membership: StoredMembership,
}

#[derive(Clone)]
pub struct StateMachineStore {
    dispatcher: Arc<FsmDispatcher>,
    snapshot_dir: PathBuf,
    snapshot_seq: Arc<AtomicU64>,
}

impl StateMachineStore {
    pub fn new(dispatcher: Arc<FsmDispatcher>, raft_dir: &Path) -> anyhow::Result<Self> {
        let snapshot_dir = raft_dir.join(SNAPSHOT_DIR);
        std::fs::create_dir_all(&snapshot_dir)?;
        Ok(Self {
            dispatcher,
            snapshot_dir,
            snapshot_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    fn load_applied(&self) -> Result<AppliedState, std::io::Error> {
        match self.dispatcher.applied_state().map_err(io_err)? {
            Some(json) => serde_json::from_str(&json).map_err(io_err),
            None => Ok(AppliedState::default()),
        }
    }

    fn save_snapshot(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), std::io::Error> {
        let meta_json = serde_json::to_vec(meta).map_err(io_err)?;
        write_atomic(&self.snapshot_dir.join(DATA_FILE), data)?;
        write_atomic(&self.snapshot_dir.join(META_FILE), &meta_json)
    }

    fn load_snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, std::io::Error> {
        let meta_path = self.snapshot_dir.join(META_FILE);
        if !meta_path.exists() {
            return Ok(None);
        }
        let meta: SnapshotMeta =
            serde_json::from_slice(&std::fs::read(meta_path)?).map_err(io_err)?;
        let data = std::fs::read(self.snapshot_dir.join(DATA_FILE))?;
        Ok(Some((meta, data)))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError> {
        let snap = self
            .dispatcher
            .snapshot()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;
        let state: AppliedState = match &snap.applied {
            Some(json) => {
                serde_json::from_str(json).map_err(|e| StorageIOError::read_state_machine(&e))?
            }
            None => AppliedState::default(),
        };

        let mut data = Vec::new();
        snap.persist(&mut data)
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match state.last_applied {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, seq),
            None => format!("--{seq}"),
        };
        let meta = SnapshotMeta {
            last_log_id: state.last_applied,
            last_membership: state.membership,
            snapshot_id,
        };

        self.save_snapshot(&meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "snapshot built");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(&mut self) -> Result<(Option<LogId>, StoredMembership), StorageError> {
        let state = self
            .load_applied()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;
        Ok((state.last_applied, state.membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        let mut state = self
            .load_applied()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;
        let mut outcomes = Vec::new();

        for entry in entries {
            tracing::debug!(log_id = %entry.log_id, "applying entry");
            state.last_applied = Some(entry.log_id);
            if let EntryPayload::Membership(ref membership) = entry.payload {
                state.membership = StoredMembership::new(Some(entry.log_id), membership.clone());
            }
            let marker =
                serde_json::to_string(&state).map_err(|e| StorageIOError::write_state_machine(&e))?;

            let kind = match &entry.payload {
                EntryPayload::Normal(data) => EntryKind::Command(data),
                EntryPayload::Blank | EntryPayload::Membership(_) => EntryKind::Internal,
            };
            let outcome = self
                .dispatcher
                .apply(kind, Some(&marker))
                .map_err(|e| StorageIOError::write_state_machine(&e))?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError> {
        let data = snapshot.into_inner();
        info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "installing snapshot");

        let state = AppliedState {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
        };
        let marker = serde_json::to_string(&state)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        self.dispatcher
            .restore(data.as_slice(), Some(&marker))
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        self.save_snapshot(meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError> {
        let stored = self
            .load_snapshot()
            .map_err(|e| StorageIOError::read_snapshot(None, &e))?;
        Ok(stored.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}
