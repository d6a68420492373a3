//! Status storage trait and types.

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{
    Actor, OperationKind, OperationPayload, ResourceKey, StoredTask, TaskFailure, TaskId,
    TaskStatus,
};

/// A task accepted for execution, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: OperationKind,
    pub payload: OperationPayload,
    pub resource: ResourceKey,
    pub resource_name: String,
    pub actor: Actor,
    pub source_address: String,
}

/// Error type for status storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// A backward or skipping move through the state machine. This is a
    /// programming error in the caller, not a recoverable condition.
    #[error("invalid status transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl StoreError {
    /// True for errors that a bounded persistence retry cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidTransition { .. })
    }
}

/// Trait for status storage backends.
///
/// Implementations own the durable task table and enforce the state
/// machine with guarded writes so a lost race surfaces as
/// [`StoreError::InvalidTransition`] instead of silently clobbering a
/// terminal status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist a task in `pending` state and return its id.
    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// Claim up to `limit` pending tasks atomically, FIFO by creation.
    ///
    /// Claimed tasks transition `pending -> running` and their `attempt`
    /// counter moves to 1.
    async fn claim(&self, limit: usize) -> Result<Vec<StoredTask>, StoreError>;

    /// Bump the attempt counter of a `running` task before a retry
    /// executes. Same record, same id. Returns the new attempt number.
    async fn record_attempt(&self, id: TaskId) -> Result<u32, StoreError>;

    /// Transition a `running` task to `succeeded`, clearing error detail.
    async fn mark_succeeded(&self, id: TaskId) -> Result<(), StoreError>;

    /// Transition a `pending` or `running` task to `failed`.
    async fn mark_failed(&self, id: TaskId, failure: &TaskFailure) -> Result<(), StoreError>;

    /// Cancel a task that has not been picked up yet: a direct
    /// `pending -> failed` move. Returns false when the task is no longer
    /// pending, so the caller can fall back to in-flight handling.
    async fn cancel_pending(&self, id: TaskId, failure: &TaskFailure) -> Result<bool, StoreError>;

    /// Fail every `running` task. Call on startup to recover from crashes.
    ///
    /// Tasks never re-enter `pending`, so recovery fails them forward with
    /// an explanatory error. Returns the affected tasks in their failed
    /// shape for auditing and notification.
    async fn fail_orphans(&self, failure: &TaskFailure) -> Result<Vec<StoredTask>, StoreError>;

    /// Fetch a single task.
    async fn get(&self, id: TaskId) -> Result<StoredTask, StoreError>;

    /// All tasks still waiting for pickup, FIFO by creation.
    async fn pending(&self) -> Result<Vec<StoredTask>, StoreError>;

    /// The task currently outstanding (`pending` or `running`) for a
    /// resource, if any.
    async fn active_for_resource(
        &self,
        resource: &ResourceKey,
    ) -> Result<Option<StoredTask>, StoreError>;
}
