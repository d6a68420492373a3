//! External operation driver boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::task::{OperationKind, OperationPayload, TaskId};

/// Error returned by an operation driver.
///
/// The classification is the driver's alone. The worker pool routes on the
/// variant and never inspects error text.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transient failure, worth retrying.
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    /// Permanent failure, won't succeed on retry.
    #[error("permanent [{code}]: {message}")]
    Permanent { code: String, message: String },
}

impl DriverError {
    /// Create a transient error.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    /// Create a permanent error with a caller-visible code.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Free-form success detail reported by a driver.
#[derive(Debug, Clone, Default)]
pub struct DriverReport {
    pub detail: serde_json::Value,
}

impl DriverReport {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_detail(detail: serde_json::Value) -> Self {
        Self { detail }
    }
}

/// Cooperative abort signal handed to a driver call.
///
/// Drivers that cannot abort mid-flight may ignore it entirely.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never signalled.
    pub fn inert() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if it isn't.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without a signal, stay pending.
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// In-flight cancellation handles, shared between the submission surface
/// and the worker pool. One explicit object, wired in at construction.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<TaskId, watch::Sender<bool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight task and get the token its driver call watches.
    pub fn register(&self, id: TaskId) -> CancelToken {
        let (tx, rx) = watch::channel(false);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        CancelToken { rx }
    }

    pub fn remove(&self, id: TaskId) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Signal an in-flight task. Returns false when nothing is registered
    /// for the id, which means the driver cannot be aborted.
    pub fn signal(&self, id: TaskId) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(&id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }
}

/// The contract this subsystem requires from the infrastructure-control
/// collaborator. A black-box command executor returning classified outcomes.
#[async_trait]
pub trait OperationDriver: Send + Sync {
    /// Whether in-flight calls honor the cancel token.
    fn supports_abort(&self) -> bool {
        false
    }

    /// Execute one operation against the target infrastructure.
    async fn execute(
        &self,
        kind: OperationKind,
        payload: &OperationPayload,
        cancel: CancelToken,
    ) -> Result<DriverReport, DriverError>;
}
