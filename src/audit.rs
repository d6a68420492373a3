//! Append-only audit trail of operation outcomes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::task::{StoredTask, TaskFailure, SYSTEM_ACTOR};

/// Outcome recorded by an audit entry. Mirrors the task's status at the
/// time of writing, it is not a lifecycle of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown audit status: {other}")),
        }
    }
}

/// An immutable record of an action's provisional or final outcome.
///
/// Created once, never updated or deleted. The `detail` map is the one
/// intentionally open shape in the crate: free-form diagnostic data, with
/// `errorCode`, `errorMessage` and `taskId` as the recognized keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_id: String,
    pub actor_email: String,
    /// `<resourceType>.<verb>`, e.g. `app.deploy` or `app.backup.create`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_name: String,
    pub status: AuditStatus,
    /// Caller's network origin. Empty for system-initiated entries.
    pub source_address: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry for a task lifecycle event, attributed to the
    /// task's original actor.
    pub fn for_task(task: &StoredTask, status: AuditStatus, detail: serde_json::Value) -> Self {
        Self {
            actor_id: task.actor.id.clone(),
            actor_email: task.actor.email.clone(),
            action: format!("{}.{}", task.resource.resource_type, task.kind),
            resource_type: task.resource.resource_type.clone(),
            resource_id: task.resource.resource_id.clone(),
            resource_name: task.resource_name.clone(),
            status,
            source_address: task.source_address.clone(),
            detail,
            created_at: Utc::now(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.actor_id == SYSTEM_ACTOR
    }
}

/// The recognized detail shape for failure entries.
pub fn failure_detail(task: &StoredTask, failure: &TaskFailure) -> serde_json::Value {
    serde_json::json!({
        "taskId": task.id,
        "attempt": task.attempt,
        "errorCode": failure.code,
        "errorMessage": failure.message,
    })
}

/// Filter for audit queries. All fields are optional and conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// The principal reading the trail. Non-elevated viewers only see their
/// own entries; `system`-authored entries require elevation.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub actor_id: String,
    pub elevated: bool,
}

impl Viewer {
    pub fn new(actor_id: impl Into<String>, elevated: bool) -> Self {
        Self {
            actor_id: actor_id.into(),
            elevated,
        }
    }
}

/// Error type for audit storage.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// Port for the append-only audit backend.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one entry. There is no update or delete counterpart.
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Entries visible to `viewer`, oldest first.
    async fn query(&self, query: &AuditQuery, viewer: &Viewer)
        -> Result<Vec<AuditEntry>, AuditError>;
}

/// A sink that discards all entries. Useful for tests and embedding
/// without an audit backend.
#[derive(Debug, Clone, Default)]
pub struct NoopAuditSink;

impl NoopAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn append(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }

    async fn query(
        &self,
        _query: &AuditQuery,
        _viewer: &Viewer,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(Vec::new())
    }
}

/// Best-effort writer over an [`AuditSink`].
///
/// An audit outage degrades observability, not availability: write
/// failures are logged and swallowed, the triggering operation never
/// sees them.
#[derive(Clone)]
pub struct AuditWriter {
    sink: Arc<dyn AuditSink>,
}

impl AuditWriter {
    pub fn new(sink: impl AuditSink + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn from_arc(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Append an entry, swallowing failure.
    pub async fn write(&self, entry: AuditEntry) {
        if let Err(e) = self.sink.append(&entry).await {
            warn!(
                action = %entry.action,
                resource = %entry.resource_id,
                error = %e,
                "audit write failed, continuing"
            );
        }
    }

    /// Query the trail through the sink's visibility rules.
    pub async fn entries(
        &self,
        query: &AuditQuery,
        viewer: &Viewer,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        self.sink.query(query, viewer).await
    }
}
