//! SQLite implementation of StatusStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::store::{NewTask, StatusStore, StoreError};
use crate::task::{
    Actor, OperationKind, OperationPayload, ResourceKey, StoredTask, TaskFailure, TaskId,
    TaskStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ops_tasks (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_name TEXT NOT NULL DEFAULT '',
    payload TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_email TEXT NOT NULL DEFAULT '',
    source_address TEXT NOT NULL DEFAULT '',
    attempt INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    error_code TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_ops_tasks_status ON ops_tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_ops_tasks_resource ON ops_tasks(resource_type, resource_id, status);
"#;

const TASK_COLUMNS: &str = "id, kind, resource_type, resource_id, resource_name, payload, \
     actor_id, actor_email, source_address, attempt, status, error_code, error_message, \
     created_at, updated_at, started_at, completed_at";

/// SQLite-backed status store.
#[derive(Clone)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    /// Create a new SqliteStatusStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the task table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Resolve a guarded update that touched no rows into the precise
    /// error: task missing, or an illegal transition.
    async fn transition_error(&self, id: TaskId, to: TaskStatus) -> StoreError {
        match self.get(id).await {
            Ok(task) => StoreError::InvalidTransition {
                id,
                from: task.status,
                to,
            },
            Err(e) => e,
        }
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&format!("{}Z", raw.replace(' ', "T")))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredTask, StoreError> {
    let storage = |e: sqlx::Error| StoreError::Storage(e.to_string());

    let id: i64 = row.try_get("id").map_err(storage)?;
    let kind_raw: String = row.try_get("kind").map_err(storage)?;
    let kind: OperationKind = kind_raw
        .parse()
        .map_err(|e: crate::task::UnknownKind| StoreError::Serialization(e.to_string()))?;
    let payload_raw: String = row.try_get("payload").map_err(storage)?;
    let payload: OperationPayload =
        serde_json::from_str(&payload_raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let status_raw: String = row.try_get("status").map_err(storage)?;
    let status: TaskStatus = status_raw.parse().map_err(StoreError::Serialization)?;

    let error_code: Option<String> = row.try_get("error_code").map_err(storage)?;
    let error_message: Option<String> = row.try_get("error_message").map_err(storage)?;
    let failure = error_code.map(|code| TaskFailure {
        code,
        message: error_message.unwrap_or_default(),
    });

    let attempt: i64 = row.try_get("attempt").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;
    let updated_at: String = row.try_get("updated_at").map_err(storage)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(storage)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(storage)?;

    Ok(StoredTask {
        id: TaskId(id),
        kind,
        resource: ResourceKey {
            resource_type: row.try_get("resource_type").map_err(storage)?,
            resource_id: row.try_get("resource_id").map_err(storage)?,
        },
        resource_name: row.try_get("resource_name").map_err(storage)?,
        payload,
        actor: Actor {
            id: row.try_get("actor_id").map_err(storage)?,
            email: row.try_get("actor_email").map_err(storage)?,
        },
        source_address: row.try_get("source_address").map_err(storage)?,
        attempt: attempt as u32,
        status,
        failure,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        started_at: started_at.as_deref().map(parse_ts),
        completed_at: completed_at.as_deref().map(parse_ts),
    })
}

fn truncated(message: &str) -> &str {
    if message.len() > 2000 {
        &message[..2000]
    } else {
        message
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO ops_tasks
                (kind, resource_type, resource_id, resource_name, payload,
                 actor_id, actor_email, source_address)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(task.kind.as_str())
        .bind(&task.resource.resource_type)
        .bind(&task.resource.resource_id)
        .bind(&task.resource_name)
        .bind(payload)
        .bind(&task.actor.id)
        .bind(&task.actor.email)
        .bind(&task.source_address)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(TaskId(id))
    }

    async fn claim(&self, limit: usize) -> Result<Vec<StoredTask>, StoreError> {
        // SQLite has no UPDATE ... LIMIT with RETURNING, so claim in two
        // steps inside a transaction.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM ops_tasks
            WHERE status = 'pending'
            ORDER BY created_at, id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        if ids.is_empty() {
            tx.commit()
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            return Ok(vec![]);
        }

        let placeholders: Vec<String> = ids.iter().map(|_| "?".to_string()).collect();
        let in_clause = placeholders.join(",");

        let update_query = format!(
            "UPDATE ops_tasks SET status = 'running', attempt = attempt + 1, \
             started_at = datetime('now'), updated_at = datetime('now') WHERE id IN ({})",
            in_clause
        );
        let mut update = sqlx::query(&update_query);
        for id in &ids {
            update = update.bind(id);
        }
        update
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let select_query = format!(
            "SELECT {} FROM ops_tasks WHERE id IN ({}) ORDER BY created_at, id",
            TASK_COLUMNS, in_clause
        );
        let mut select = sqlx::query(&select_query);
        for id in &ids {
            select = select.bind(id);
        }
        let rows = select
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        rows.iter().map(task_from_row).collect()
    }

    async fn record_attempt(&self, id: TaskId) -> Result<u32, StoreError> {
        let attempt: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE ops_tasks
            SET attempt = attempt + 1, updated_at = datetime('now')
            WHERE id = ? AND status = 'running'
            RETURNING attempt
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        match attempt {
            Some(n) => Ok(n as u32),
            None => Err(self.transition_error(id, TaskStatus::Running).await),
        }
    }

    async fn mark_succeeded(&self, id: TaskId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ops_tasks
            SET status = 'succeeded', completed_at = datetime('now'),
                updated_at = datetime('now'), error_code = NULL, error_message = NULL
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Succeeded).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, failure: &TaskFailure) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ops_tasks
            SET status = 'failed', completed_at = datetime('now'),
                updated_at = datetime('now'), error_code = ?, error_message = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(&failure.code)
        .bind(truncated(&failure.message))
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Failed).await);
        }
        Ok(())
    }

    async fn cancel_pending(&self, id: TaskId, failure: &TaskFailure) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ops_tasks
            SET status = 'failed', completed_at = datetime('now'),
                updated_at = datetime('now'), error_code = ?, error_message = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(&failure.code)
        .bind(truncated(&failure.message))
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_orphans(&self, failure: &TaskFailure) -> Result<Vec<StoredTask>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let select_query = format!(
            "SELECT {} FROM ops_tasks WHERE status = 'running' ORDER BY created_at, id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&select_query)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        if rows.is_empty() {
            tx.commit()
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            return Ok(vec![]);
        }

        sqlx::query(
            r#"
            UPDATE ops_tasks
            SET status = 'failed', completed_at = datetime('now'),
                updated_at = datetime('now'), error_code = ?, error_message = ?
            WHERE status = 'running'
            "#,
        )
        .bind(&failure.code)
        .bind(truncated(&failure.message))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let mut task = task_from_row(row)?;
                task.status = TaskStatus::Failed;
                task.failure = Some(failure.clone());
                Ok(task)
            })
            .collect()
    }

    async fn get(&self, id: TaskId) -> Result<StoredTask, StoreError> {
        let select_query = format!("SELECT {} FROM ops_tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&select_query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn pending(&self) -> Result<Vec<StoredTask>, StoreError> {
        let select_query = format!(
            "SELECT {} FROM ops_tasks WHERE status = 'pending' ORDER BY created_at, id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&select_query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        rows.iter().map(task_from_row).collect()
    }

    async fn active_for_resource(
        &self,
        resource: &ResourceKey,
    ) -> Result<Option<StoredTask>, StoreError> {
        let select_query = format!(
            "SELECT {} FROM ops_tasks \
             WHERE resource_type = ? AND resource_id = ? AND status IN ('pending', 'running') \
             ORDER BY created_at, id LIMIT 1",
            TASK_COLUMNS
        );
        let row = sqlx::query(&select_query)
            .bind(&resource.resource_type)
            .bind(&resource.resource_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        row.as_ref().map(task_from_row).transpose()
    }
}
