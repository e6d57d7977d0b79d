//! `s3Configs` domain: S3 backup targets shared by the cluster.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::cluster::command::action;
use crate::cluster::registry::CommandHandler;
use crate::db::models::S3ConfigRecord;

/// Payload of `s3Configs/create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ConfigInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3ConfigInput {
    /// First missing required field, as a machine-readable code.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            (&self.endpoint, "endpoint_is_required"),
            (&self.region, "region_is_required"),
            (&self.bucket, "bucket_is_required"),
            (&self.access_key, "accessKey_is_required"),
            (&self.secret_key, "secretKey_is_required"),
        ]
        .into_iter()
        .find(|(value, _)| value.trim().is_empty())
        .map(|(_, code)| code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3ConfigDelete {
    pub id: i64,
}

pub struct S3ConfigHandler;

impl CommandHandler for S3ConfigHandler {
    fn handle(&self, conn: &Connection, action: &str, payload: &[u8]) -> anyhow::Result<()> {
        match action {
            action::CREATE => create(conn, &serde_json::from_slice(payload)?).map(|_| ()),
            action::DELETE => {
                let req: S3ConfigDelete = serde_json::from_slice(payload)?;
                delete(conn, req.id)
            }
            other => anyhow::bail!("unsupported s3Configs action: {other}"),
        }
    }
}

/// Insert (or overwrite by id) a target and return its id.
pub fn create(conn: &Connection, cfg: &S3ConfigInput) -> anyhow::Result<i64> {
    let id = match cfg.id {
        Some(id) if id > 0 => id,
        _ => conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM cluster_s3_configs",
            [],
            |row| row.get(0),
        )?,
    };

    let result = conn.execute(
        "INSERT INTO cluster_s3_configs (id, name, endpoint, region, bucket, access_key, secret_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            endpoint = excluded.endpoint,
            region = excluded.region,
            bucket = excluded.bucket,
            access_key = excluded.access_key,
            secret_key = excluded.secret_key",
        params![
            id,
            cfg.name,
            cfg.endpoint,
            cfg.region,
            cfg.bucket,
            cfg.access_key,
            cfg.secret_key
        ],
    );

    match result {
        Ok(_) => Ok(id),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            anyhow::bail!("s3_config_name_taken: {}", cfg.name)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn delete(conn: &Connection, id: i64) -> anyhow::Result<()> {
    conn.execute("DELETE FROM cluster_s3_configs WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<S3ConfigRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, endpoint, region, bucket, access_key, secret_key
         FROM cluster_s3_configs ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(S3ConfigRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            endpoint: row.get(2)?,
            region: row.get(3)?,
            bucket: row.get(4)?,
            access_key: row.get(5)?,
            secret_key: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert_all(conn: &Connection, configs: &[S3ConfigRecord]) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO cluster_s3_configs (id, name, endpoint, region, bucket, access_key, secret_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for c in configs {
        stmt.execute(params![
            c.id,
            c.name,
            c.endpoint,
            c.region,
            c.bucket,
            c.access_key,
            c.secret_key
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn target(name: &str) -> S3ConfigInput {
        S3ConfigInput {
            id: None,
            name: name.to_string(),
            endpoint: "https://s3.example.net".to_string(),
            region: "eu-central-1".to_string(),
            bucket: "backups".to_string(),
            access_key: "AKIAEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_missing_field_reports_first_gap() {
        let mut cfg = target("a");
        assert_eq!(cfg.missing_field(), None);
        cfg.region = " ".to_string();
        cfg.secret_key.clear();
        assert_eq!(cfg.missing_field(), Some("region_is_required"));
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.lock();
        assert_eq!(create(&conn, &target("one")).unwrap(), 1);
        assert_eq!(create(&conn, &target("two")).unwrap(), 2);
        delete(&conn, 2).unwrap();
        assert_eq!(create(&conn, &target("three")).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let db = Database::open(":memory:").unwrap();
        let conn = db.lock();
        create(&conn, &target("offsite")).unwrap();
        let err = create(&conn, &target("offsite")).unwrap_err();
        assert!(err.to_string().starts_with("s3_config_name_taken"));
        assert_eq!(list(&conn).unwrap().len(), 1);
    }
}
