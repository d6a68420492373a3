//! Task submission and cancellation surface.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::audit::{failure_detail, AuditEntry, AuditStatus, AuditWriter};
use crate::driver::CancelRegistry;
use crate::lock::LockManager;
use crate::notify::{Notifier, TaskTransition};
use crate::store::{NewTask, StatusStore, StoreError};
use crate::task::{
    Actor, OperationKind, OperationPayload, ResourceKey, StoredTask, TaskFailure, TaskId,
    TaskStatus, UnknownKind,
};

/// An operation submitted by a caller. The caller arrives authenticated;
/// `actor` is who they are and `source_address` where they came from.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: String,
    pub resource_type: String,
    pub resource_id: String,
    pub resource_name: String,
    pub payload: serde_json::Value,
    pub actor: Actor,
    pub source_address: String,
}

/// Rejection errors, surfaced synchronously at submit time. No task or
/// audit row exists for a rejected request.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("unknown operation kind: {0}")]
    UnknownKind(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: OperationKind, reason: String },

    /// Distinct from every other error so callers can tell the user an
    /// operation is already running instead of reporting a failure.
    #[error("an operation is already in progress for {0}")]
    ResourceBusy(ResourceKey),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not been picked up and was failed directly.
    Cancelled,
    /// The task was in flight and the driver was signalled to abort.
    AbortRequested,
    /// The task was in flight and the driver cannot abort. It runs to
    /// natural completion.
    NoOp,
}

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already finished")]
    AlreadyFinished(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Accepts operations, persists them as pending tasks, and hands back the
/// task id without ever blocking on execution.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn StatusStore>,
    locks: LockManager,
    audit: AuditWriter,
    notifier: Notifier,
    cancels: CancelRegistry,
}

impl TaskQueue {
    /// Wire the queue to the same lock manager, audit writer, notifier and
    /// cancel registry the worker pool uses.
    pub fn new(
        store: Arc<dyn StatusStore>,
        locks: LockManager,
        audit: AuditWriter,
        notifier: Notifier,
        cancels: CancelRegistry,
    ) -> Self {
        Self {
            store,
            locks,
            audit,
            notifier,
            cancels,
        }
    }

    /// Validate and enqueue an operation. Returns the task id once the
    /// pending record is durable; execution happens later.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, SubmitError> {
        let kind: OperationKind = request
            .kind
            .parse()
            .map_err(|e: UnknownKind| SubmitError::UnknownKind(e.0))?;
        let payload =
            OperationPayload::parse(kind, request.payload).map_err(|e| SubmitError::InvalidPayload {
                kind,
                reason: e.to_string(),
            })?;
        let resource = ResourceKey::new(request.resource_type, request.resource_id);

        self.locks
            .claim(&resource)
            .map_err(|_| SubmitError::ResourceBusy(resource.clone()))?;

        let source_address = if request.actor.is_system() {
            String::new()
        } else {
            request.source_address
        };
        let actor = request.actor;

        let id = match self
            .store
            .insert(NewTask {
                kind,
                payload,
                resource: resource.clone(),
                resource_name: request.resource_name.clone(),
                actor: actor.clone(),
                source_address: source_address.clone(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.locks.abandon(&resource);
                return Err(e.into());
            }
        };
        self.locks.bind(&resource, id);

        info!(task = %id, kind = %kind, resource = %resource, actor = %actor.id, "task enqueued");

        self.audit
            .write(AuditEntry {
                actor_id: actor.id,
                actor_email: actor.email,
                action: format!("{}.{}", resource.resource_type, kind),
                resource_type: resource.resource_type.clone(),
                resource_id: resource.resource_id.clone(),
                resource_name: request.resource_name,
                status: AuditStatus::Pending,
                source_address,
                detail: serde_json::json!({ "taskId": id }),
                created_at: Utc::now(),
            })
            .await;

        self.notifier.publish(
            &resource,
            TaskTransition {
                task_id: id,
                resource_id: resource.resource_id.clone(),
                status: TaskStatus::Pending,
                attempt: 0,
                last_error: None,
            },
        );

        Ok(id)
    }

    /// Read-only projection of a task's current state.
    pub async fn task(&self, id: TaskId) -> Result<StoredTask, StoreError> {
        self.store.get(id).await
    }

    /// Request cancellation of a task.
    ///
    /// A task still waiting for pickup is failed directly, with no worker
    /// involvement. An in-flight task is aborted only if the driver
    /// supports it; otherwise it runs to completion and the request is
    /// recorded as a no-op.
    pub async fn cancel(&self, id: TaskId, actor: &Actor) -> Result<CancelOutcome, CancelError> {
        let task = self.store.get(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => CancelError::NotFound(id),
            other => CancelError::Store(other),
        })?;

        match task.status {
            TaskStatus::Pending => {
                let failure = TaskFailure::cancelled(actor);
                if self.store.cancel_pending(id, &failure).await? {
                    self.locks.release(&task.resource, id);

                    let mut cancelled = task;
                    cancelled.status = TaskStatus::Failed;
                    cancelled.failure = Some(failure.clone());
                    self.audit
                        .write(AuditEntry::for_task(
                            &cancelled,
                            AuditStatus::Failed,
                            failure_detail(&cancelled, &failure),
                        ))
                        .await;
                    self.notifier.publish(
                        &cancelled.resource,
                        TaskTransition {
                            task_id: id,
                            resource_id: cancelled.resource.resource_id.clone(),
                            status: TaskStatus::Failed,
                            attempt: cancelled.attempt,
                            last_error: Some(failure),
                        },
                    );
                    Ok(CancelOutcome::Cancelled)
                } else {
                    // A worker picked it up while we looked.
                    Ok(self.signal_running(&task, actor).await)
                }
            }
            TaskStatus::Running => Ok(self.signal_running(&task, actor).await),
            TaskStatus::Succeeded | TaskStatus::Failed => Err(CancelError::AlreadyFinished(id)),
        }
    }

    async fn signal_running(&self, task: &StoredTask, actor: &Actor) -> CancelOutcome {
        let signalled = self.cancels.signal(task.id);
        let (outcome, note) = if signalled {
            (
                CancelOutcome::AbortRequested,
                "abort signalled to the in-flight driver call",
            )
        } else {
            (
                CancelOutcome::NoOp,
                "task is already running and the driver does not support abort; it will run to completion",
            )
        };

        self.audit
            .write(AuditEntry {
                actor_id: actor.id.clone(),
                actor_email: actor.email.clone(),
                action: format!("{}.cancel", task.resource.resource_type),
                resource_type: task.resource.resource_type.clone(),
                resource_id: task.resource.resource_id.clone(),
                resource_name: task.resource_name.clone(),
                status: AuditStatus::Success,
                source_address: String::new(),
                detail: serde_json::json!({ "taskId": task.id, "note": note }),
                created_at: Utc::now(),
            })
            .await;

        outcome
    }
}
