//! `options` domain: the cluster-wide settings row.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::cluster::command::action;
use crate::cluster::registry::CommandHandler;
use crate::db::models::OptionRecord;
use crate::db::timestamp;

const OPTIONS_ROW: i64 = 1;

/// Payload of `options/set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSet {
    pub keyboard_layout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

pub struct OptionsHandler;

impl CommandHandler for OptionsHandler {
    fn handle(&self, conn: &Connection, action: &str, payload: &[u8]) -> anyhow::Result<()> {
        match action {
            action::SET => set(conn, &serde_json::from_slice(payload)?),
            other => anyhow::bail!("unsupported options action: {other}"),
        }
    }
}

/// Upsert row 1. `created_at` is only written on first insert unless the
/// payload carries one explicitly.
pub fn set(conn: &Connection, opts: &OptionSet) -> anyhow::Result<()> {
    let updated_at = opts.updated_at.clone().unwrap_or_else(timestamp);
    let created_at = opts.created_at.clone().unwrap_or_else(|| updated_at.clone());
    let keep_created = opts.created_at.is_none();

    conn.execute(
        "INSERT INTO cluster_options (id, keyboard_layout, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            keyboard_layout = excluded.keyboard_layout,
            created_at = CASE WHEN ?5 THEN cluster_options.created_at ELSE excluded.created_at END,
            updated_at = excluded.updated_at",
        params![
            OPTIONS_ROW,
            opts.keyboard_layout,
            created_at,
            updated_at,
            keep_created
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection) -> anyhow::Result<Option<OptionRecord>> {
    let record = conn
        .query_row(
            "SELECT id, keyboard_layout, created_at, updated_at FROM cluster_options WHERE id = ?1",
            params![OPTIONS_ROW],
            map_row,
        )
        .optional()?;
    Ok(record)
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<OptionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, keyboard_layout, created_at, updated_at FROM cluster_options ORDER BY id",
    )?;
    let rows = stmt.query_map([], map_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert_all(conn: &Connection, options: &[OptionRecord]) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO cluster_options (id, keyboard_layout, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for o in options {
        stmt.execute(params![o.id, o.keyboard_layout, o.created_at, o.updated_at])?;
    }
    Ok(())
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OptionRecord> {
    Ok(OptionRecord {
        id: row.get(0)?,
        keyboard_layout: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn set_at(layout: &str, at: &str) -> OptionSet {
        OptionSet {
            keyboard_layout: layout.to_string(),
            created_at: None,
            updated_at: Some(at.to_string()),
        }
    }

    #[test]
    fn test_set_keeps_single_row() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.lock();
        assert!(get(&conn).unwrap().is_none());

        set(&conn, &set_at("us", "2026-01-01T00:00:00.000Z")).unwrap();
        set(&conn, &set_at("de", "2026-02-01T00:00:00.000Z")).unwrap();

        let rows = list(&conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].keyboard_layout, "de");
        assert_eq!(rows[0].created_at, "2026-01-01T00:00:00.000Z");
        assert_eq!(rows[0].updated_at, "2026-02-01T00:00:00.000Z");
    }

    #[test]
    fn test_handler_set_action() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.lock();
        OptionsHandler
            .handle(&conn, action::SET, br#"{"keyboardLayout":"fr"}"#)
            .unwrap();
        assert_eq!(get(&conn).unwrap().unwrap().keyboard_layout, "fr");
        assert!(OptionsHandler.handle(&conn, action::DELETE, b"{}").is_err());
    }
}
