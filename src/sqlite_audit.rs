//! SQLite implementation of the audit sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::audit::{AuditEntry, AuditError, AuditQuery, AuditSink, AuditStatus, Viewer};
use crate::task::SYSTEM_ACTOR;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ops_audit (
    id INTEGER PRIMARY KEY,
    actor_id TEXT NOT NULL,
    actor_email TEXT NOT NULL DEFAULT '',
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_name TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    source_address TEXT NOT NULL DEFAULT '',
    detail TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_ops_audit_actor ON ops_audit(actor_id, created_at);
CREATE INDEX IF NOT EXISTS idx_ops_audit_resource ON ops_audit(resource_id, created_at);
"#;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite-backed audit log. Rows are inserted and read, never updated or
/// deleted; the table has no mutation surface beyond `append`.
#[derive(Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    /// Create a new SqliteAuditLog.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the audit table.
    pub async fn run_migrations(&self) -> Result<(), AuditError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| AuditError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&format!("{}Z", raw.replace(' ', "T")))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, AuditError> {
    let storage = |e: sqlx::Error| AuditError::Storage(e.to_string());

    let status_raw: String = row.try_get("status").map_err(storage)?;
    let status: AuditStatus = status_raw.parse().map_err(AuditError::Storage)?;
    let detail_raw: String = row.try_get("detail").map_err(storage)?;
    let detail =
        serde_json::from_str(&detail_raw).map_err(|e| AuditError::Storage(e.to_string()))?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(AuditEntry {
        actor_id: row.try_get("actor_id").map_err(storage)?,
        actor_email: row.try_get("actor_email").map_err(storage)?,
        action: row.try_get("action").map_err(storage)?,
        resource_type: row.try_get("resource_type").map_err(storage)?,
        resource_id: row.try_get("resource_id").map_err(storage)?,
        resource_name: row.try_get("resource_name").map_err(storage)?,
        status,
        source_address: row.try_get("source_address").map_err(storage)?,
        detail,
        created_at: parse_ts(&created_at),
    })
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let detail = serde_json::to_string(&entry.detail)
            .map_err(|e| AuditError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO ops_audit
                (actor_id, actor_email, action, resource_type, resource_id,
                 resource_name, status, source_address, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.actor_id)
        .bind(&entry.actor_email)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.resource_name)
        .bind(entry.status.as_str())
        .bind(&entry.source_address)
        .bind(detail)
        .bind(entry.created_at.format(TS_FORMAT).to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn query(
        &self,
        query: &AuditQuery,
        viewer: &Viewer,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let mut sql = String::from(
            "SELECT actor_id, actor_email, action, resource_type, resource_id, \
             resource_name, status, source_address, detail, created_at \
             FROM ops_audit WHERE 1 = 1",
        );
        let mut binds: Vec<String> = Vec::new();

        // Row-level visibility: non-elevated viewers see their own rows
        // only, and system-authored rows need elevation.
        if !viewer.elevated {
            sql.push_str(" AND actor_id = ? AND actor_id != ?");
            binds.push(viewer.actor_id.clone());
            binds.push(SYSTEM_ACTOR.to_string());
        }

        if let Some(actor_id) = &query.actor_id {
            sql.push_str(" AND actor_id = ?");
            binds.push(actor_id.clone());
        }
        if let Some(resource_id) = &query.resource_id {
            sql.push_str(" AND resource_id = ?");
            binds.push(resource_id.clone());
        }
        if let Some(since) = &query.since {
            sql.push_str(" AND created_at >= ?");
            binds.push(since.format(TS_FORMAT).to_string());
        }
        if let Some(until) = &query.until {
            sql.push_str(" AND created_at <= ?");
            binds.push(until.format(TS_FORMAT).to_string());
        }

        sql.push_str(" ORDER BY created_at, id");

        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = q.bind(bind.as_str());
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuditError::Storage(e.to_string()))?;

        rows.iter().map(entry_from_row).collect()
    }
}
