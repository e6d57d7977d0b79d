//! `note` domain: cluster-wide free-form notes.

use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::cluster::command::action;
use crate::cluster::registry::CommandHandler;
use crate::db::models::NoteRecord;
use crate::db::timestamp;

/// Payload of `note/create`.
///
/// `id` is set when replaying rows that already exist (pre-cluster
/// backfill); otherwise the handler assigns `max(id) + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteCreate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Payload of `note/update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteUpdate {
    pub id: i64,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteDelete {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteBulkDelete {
    pub ids: Vec<i64>,
}

pub struct NoteHandler;

impl CommandHandler for NoteHandler {
    fn handle(&self, conn: &Connection, action: &str, payload: &[u8]) -> anyhow::Result<()> {
        match action {
            action::CREATE => create(conn, &serde_json::from_slice(payload)?).map(|_| ()),
            action::UPDATE => update(conn, &serde_json::from_slice(payload)?),
            action::DELETE => {
                let req: NoteDelete = serde_json::from_slice(payload)?;
                delete(conn, &[req.id])
            }
            action::BULK_DELETE => {
                let req: NoteBulkDelete = serde_json::from_slice(payload)?;
                delete(conn, &req.ids)
            }
            other => anyhow::bail!("unsupported note action: {other}"),
        }
    }
}

/// Insert (or overwrite by id) a note and return its id.
pub fn create(conn: &Connection, note: &NoteCreate) -> anyhow::Result<i64> {
    let id = match note.id {
        Some(id) if id > 0 => id,
        _ => conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM cluster_notes",
            [],
            |row| row.get(0),
        )?,
    };
    let created_at = note.created_at.clone().unwrap_or_else(timestamp);
    let updated_at = note.updated_at.clone().unwrap_or_else(|| created_at.clone());

    conn.execute(
        "INSERT INTO cluster_notes (id, title, content, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            content = excluded.content,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        params![id, note.title, note.content, created_at, updated_at],
    )?;
    Ok(id)
}

pub fn update(conn: &Connection, note: &NoteUpdate) -> anyhow::Result<()> {
    let updated_at = note.updated_at.clone().unwrap_or_else(timestamp);
    let changed = conn.execute(
        "UPDATE cluster_notes SET title = ?2, content = ?3, updated_at = ?4 WHERE id = ?1",
        params![note.id, note.title, note.content, updated_at],
    )?;
    if changed == 0 {
        anyhow::bail!("note_not_found: {}", note.id);
    }
    Ok(())
}

/// Delete the given ids. Missing ids are ignored.
pub fn delete(conn: &Connection, ids: &[i64]) -> anyhow::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    conn.execute(
        &format!("DELETE FROM cluster_notes WHERE id IN ({placeholders})"),
        params_from_iter(ids.iter()),
    )?;
    Ok(())
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<NoteRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, content, created_at, updated_at FROM cluster_notes ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(NoteRecord {
            id: row.get(0)?,
            title: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Insert rows verbatim. Used by snapshot restore on an emptied table.
pub fn insert_all(conn: &Connection, notes: &[NoteRecord]) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO cluster_notes (id, title, content, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for n in notes {
        stmt.execute(params![n.id, n.title, n.content, n.created_at, n.updated_at])?;
    }
    Ok(())
}
