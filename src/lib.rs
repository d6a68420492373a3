//! # Opsflow
//!
//! The asynchronous operation core for infrastructure control planes.
//!
//! Long-running, potentially-failing infrastructure operations (deploys,
//! restarts, backups, service actions) are submitted as tasks, executed by
//! a bounded worker pool under per-resource mutual exclusion, tracked
//! through a durable status state machine, broadcast to subscribers in
//! realtime, and permanently recorded in an append-only audit trail.
//!
//! ## Why Opsflow?
//!
//! - **One task per resource** - conflicting operations never race; a busy
//!   resource rejects new submissions immediately instead of queuing them
//! - **Driver-classified retries** - transient failures back off and retry
//!   on the same task record, permanent failures settle at once
//! - **Audit you can trust** - entries are written once the outcome is
//!   known and never touched again, and an audit outage never fails the
//!   operation that triggered it
//! - **Embeddable** - a library, not a service; transports and drivers
//!   plug in at trait seams
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opsflow::{
//!     AuditWriter, CancelRegistry, LockManager, Notifier, SqliteAuditLog,
//!     SqliteStatusStore, SubmitRequest, TaskQueue, WorkerPoolBuilder,
//! };
//!
//! let store = Arc::new(SqliteStatusStore::new(pool.clone()));
//! let locks = LockManager::new();
//! let audit = AuditWriter::new(SqliteAuditLog::new(pool));
//! let notifier = Notifier::new();
//! let cancels = CancelRegistry::new();
//!
//! let queue = TaskQueue::new(
//!     store.clone(), locks.clone(), audit.clone(), notifier.clone(), cancels.clone(),
//! );
//! let pool = WorkerPoolBuilder::new(store, Arc::new(MyDriver))
//!     .locks(locks)
//!     .audit(audit)
//!     .notifier(notifier)
//!     .cancel_registry(cancels)
//!     .workers(4)
//!     .build();
//!
//! tokio::spawn(async move { pool.run().await });
//! let task_id = queue.submit(SubmitRequest { /* ... */ }).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - SQLite-backed status store and audit log (default)

pub mod audit;
pub mod driver;
pub mod lock;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod store;
pub mod task;
pub mod worker;

pub use audit::{
    AuditEntry, AuditError, AuditQuery, AuditSink, AuditStatus, AuditWriter, NoopAuditSink, Viewer,
};
pub use driver::{CancelRegistry, CancelToken, DriverError, DriverReport, OperationDriver};
pub use lock::{HoldGuard, LockError, LockManager, StaleLock};
pub use notify::{Notifier, TaskTransition};
pub use queue::{CancelError, CancelOutcome, SubmitError, SubmitRequest, TaskQueue};
pub use retry::RetryPolicy;
pub use store::{NewTask, StatusStore, StoreError};
pub use task::{
    Actor, OperationKind, OperationPayload, PayloadError, ResourceKey, StoredTask, TaskFailure,
    TaskId, TaskStatus, UnknownKind, SYSTEM_ACTOR,
};
pub use worker::{ShutdownHandle, WorkerPool, WorkerPoolBuilder};

#[cfg(feature = "sqlite")]
pub mod sqlite_audit;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(feature = "sqlite")]
pub use sqlite_audit::SqliteAuditLog;

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStatusStore;
