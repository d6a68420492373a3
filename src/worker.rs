//! Worker pool that executes queued operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::audit::{failure_detail, AuditEntry, AuditStatus, AuditWriter, NoopAuditSink};
use crate::driver::{CancelRegistry, CancelToken, DriverError, DriverReport, OperationDriver};
use crate::lock::LockManager;
use crate::notify::{Notifier, TaskTransition};
use crate::retry::{clamp_to_ceiling, RetryPolicy};
use crate::store::{StatusStore, StoreError};
use crate::task::{StoredTask, TaskFailure, TaskStatus};

struct PoolInner {
    store: Arc<dyn StatusStore>,
    driver: Arc<dyn OperationDriver>,
    locks: LockManager,
    audit: AuditWriter,
    notifier: Notifier,
    cancels: CancelRegistry,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    backoff_ceiling: Duration,
    persist_retry: RetryPolicy,
}

impl PoolInner {
    fn publish(&self, task: &StoredTask, status: TaskStatus, last_error: Option<TaskFailure>) {
        self.notifier.publish(
            &task.resource,
            TaskTransition {
                task_id: task.id,
                resource_id: task.resource.resource_id.clone(),
                status,
                attempt: task.attempt,
                last_error,
            },
        );
    }
}

/// Signals a running pool to stop claiming work and return.
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// A bounded pool of executors that pulls pending tasks, runs them through
/// the operation driver, and settles their status, audit trail, and locks.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    poll_interval: Duration,
    stale_after: Duration,
    sweep_interval: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until shutdown is signalled.
    ///
    /// Recovers from a previous crash first: tasks stuck in `running` are
    /// failed forward and resource claims are rebuilt from the surviving
    /// pending rows. Then alternates between claiming eligible work and
    /// sweeping stale locks.
    pub async fn run(&self) {
        self.recover().await;

        let mut shutdown = self.shutdown_rx.clone();
        let mut claim_tick = tokio::time::interval(self.poll_interval);
        let mut sweep_tick = tokio::time::interval(self.sweep_interval);

        info!(
            workers = self.inner.semaphore.available_permits(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "worker pool started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = claim_tick.tick() => self.claim_cycle().await,
                _ = sweep_tick.tick() => self.sweep_stale().await,
            }
        }

        info!("worker pool stopping");
    }

    async fn claim_cycle(&self) {
        let available = self.inner.semaphore.available_permits();
        if available == 0 {
            return;
        }

        let tasks = match self.inner.store.claim(available).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "failed to claim pending tasks");
                return;
            }
        };

        for task in tasks {
            let Ok(permit) = self.inner.semaphore.clone().acquire_owned().await else {
                return;
            };
            let inner = self.inner.clone();
            tokio::spawn(async move {
                execute(inner, task, permit).await;
            });
        }
    }

    async fn recover(&self) {
        let failure = TaskFailure::new("orphaned", "task was running when the process restarted");
        match self.inner.store.fail_orphans(&failure).await {
            Ok(orphans) if !orphans.is_empty() => {
                warn!(count = orphans.len(), "failed orphaned tasks from a previous run");
                for task in &orphans {
                    self.inner.locks.release(&task.resource, task.id);
                    self.inner
                        .audit
                        .write(AuditEntry::for_task(
                            task,
                            AuditStatus::Failed,
                            failure_detail(task, &failure),
                        ))
                        .await;
                    self.inner
                        .publish(task, TaskStatus::Failed, Some(failure.clone()));
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "orphan recovery failed"),
        }

        match self.inner.store.pending().await {
            Ok(pending) => {
                for task in pending {
                    self.inner.locks.restore(&task.resource, task.id);
                }
            }
            Err(e) => error!(error = %e, "could not restore resource claims for pending tasks"),
        }
    }

    /// Force-release locks whose owner has been executing beyond the stale
    /// threshold and fail the owning task. A crashed executor must not
    /// keep a resource locked forever.
    async fn sweep_stale(&self) {
        for stale in self.inner.locks.stale_holds(self.stale_after) {
            warn!(
                resource = %stale.key,
                task = %stale.owner,
                held_secs = stale.held_for.as_secs(),
                "stale resource lock detected, force-releasing"
            );
            self.inner.locks.force_release(&stale.key);
            self.inner.cancels.remove(stale.owner);

            let failure = TaskFailure::new(
                "stale_lock",
                format!(
                    "lock held for {}s without completing, force-released by supervisor",
                    stale.held_for.as_secs()
                ),
            );
            match self.inner.store.mark_failed(stale.owner, &failure).await {
                Ok(()) => {
                    if let Ok(task) = self.inner.store.get(stale.owner).await {
                        self.inner
                            .audit
                            .write(AuditEntry::for_task(
                                &task,
                                AuditStatus::Failed,
                                failure_detail(&task, &failure),
                            ))
                            .await;
                        self.inner
                            .publish(&task, TaskStatus::Failed, Some(failure.clone()));
                    }
                }
                Err(e) => {
                    warn!(task = %stale.owner, error = %e, "could not fail task for stale lock")
                }
            }
        }
    }
}

async fn execute(inner: Arc<PoolInner>, mut task: StoredTask, permit: OwnedSemaphorePermit) {
    let mut permit = Some(permit);
    let mut waited = Duration::ZERO;

    debug!(task = %task.id, kind = %task.kind, resource = %task.resource, "executing task");
    inner.publish(&task, TaskStatus::Running, None);

    loop {
        let hold = match inner.locks.hold(&task.resource, task.id) {
            Ok(hold) => hold,
            Err(e) => {
                warn!(task = %task.id, error = %e, "lost resource lock, failing task");
                finish_failed(&inner, &task, TaskFailure::new("lock_lost", e.to_string())).await;
                return;
            }
        };

        let token = if inner.driver.supports_abort() {
            inner.cancels.register(task.id)
        } else {
            CancelToken::inert()
        };
        let result = inner.driver.execute(task.kind, &task.payload, token).await;
        inner.cancels.remove(task.id);
        drop(hold);

        match result {
            Ok(report) => {
                finish_succeeded(&inner, &task, report).await;
                return;
            }
            Err(DriverError::Permanent { code, message }) => {
                finish_failed(&inner, &task, TaskFailure::new(code, message)).await;
                return;
            }
            Err(DriverError::Transient(err)) => {
                let next_attempt = task.attempt + 1;
                let delay = inner
                    .retry
                    .delay_for_attempt(next_attempt)
                    .and_then(|d| clamp_to_ceiling(d, waited, inner.backoff_ceiling));

                let Some(delay) = delay else {
                    warn!(task = %task.id, attempts = task.attempt, error = %err, "retries exhausted");
                    finish_failed(
                        &inner,
                        &task,
                        TaskFailure::new(
                            "retries_exhausted",
                            format!("gave up after {} attempts: {err:#}", task.attempt),
                        ),
                    )
                    .await;
                    return;
                };

                debug!(
                    task = %task.id,
                    attempt = next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );

                // Give up the worker slot while sleeping so other queued
                // work keeps moving.
                drop(permit.take());
                waited += delay;
                tokio::time::sleep(delay).await;
                let Ok(reacquired) = inner.semaphore.clone().acquire_owned().await else {
                    return;
                };
                permit = Some(reacquired);

                match persist(&inner, "record_attempt", || {
                    inner.store.record_attempt(task.id)
                })
                .await
                {
                    Ok(attempt) => {
                        task.attempt = attempt;
                        inner.publish(&task, TaskStatus::Running, None);
                    }
                    Err(e) => {
                        error!(task = %task.id, error = %e, "could not record retry attempt, abandoning task");
                        inner.locks.release(&task.resource, task.id);
                        return;
                    }
                }
            }
        }
    }
}

async fn finish_succeeded(inner: &Arc<PoolInner>, task: &StoredTask, report: DriverReport) {
    match persist(inner, "mark_succeeded", || {
        inner.store.mark_succeeded(task.id)
    })
    .await
    {
        Ok(()) => {
            let mut detail = serde_json::json!({ "taskId": task.id, "attempt": task.attempt });
            if !report.detail.is_null() {
                detail["result"] = report.detail;
            }
            inner
                .audit
                .write(AuditEntry::for_task(task, AuditStatus::Success, detail))
                .await;
            inner.publish(task, TaskStatus::Succeeded, None);
            info!(
                task = %task.id,
                kind = %task.kind,
                resource = %task.resource,
                attempt = task.attempt,
                "task succeeded"
            );
        }
        Err(StoreError::InvalidTransition { .. }) => {
            // The task reached a terminal state elsewhere, typically the
            // stale sweep. Its outcome is already settled; drop ours.
            warn!(task = %task.id, "task already settled, dropping late success result");
        }
        Err(e) => {
            // The operation ran but its outcome could not be recorded.
            // Never report success for an unrecorded outcome.
            error!(task = %task.id, error = %e, "could not persist success, outcome unrecorded");
            inner
                .audit
                .write(AuditEntry::for_task(
                    task,
                    AuditStatus::Failed,
                    serde_json::json!({
                        "taskId": task.id,
                        "errorCode": "status_persist_failed",
                        "errorMessage": e.to_string(),
                    }),
                ))
                .await;
        }
    }
    inner.locks.release(&task.resource, task.id);
}

async fn finish_failed(inner: &Arc<PoolInner>, task: &StoredTask, failure: TaskFailure) {
    match persist(inner, "mark_failed", || {
        inner.store.mark_failed(task.id, &failure)
    })
    .await
    {
        Ok(()) => {
            inner
                .audit
                .write(AuditEntry::for_task(
                    task,
                    AuditStatus::Failed,
                    failure_detail(task, &failure),
                ))
                .await;
            inner.publish(task, TaskStatus::Failed, Some(failure.clone()));
            info!(task = %task.id, code = %failure.code, "task failed");
        }
        Err(StoreError::InvalidTransition { .. }) => {
            warn!(task = %task.id, "task already settled, dropping late failure result");
        }
        Err(e) => {
            error!(task = %task.id, error = %e, "could not persist failure");
        }
    }
    inner.locks.release(&task.resource, task.id);
}

/// Retry a status write with its own short backoff, separate from the
/// operation retry policy. Fatal errors are returned immediately.
async fn persist<T, F, Fut>(inner: &Arc<PoolInner>, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => match inner.persist_retry.delay_for_attempt(attempt + 1) {
                Some(delay) => {
                    warn!(what, attempt, error = %e, "status write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

/// Builder for constructing a WorkerPool.
pub struct WorkerPoolBuilder {
    store: Arc<dyn StatusStore>,
    driver: Arc<dyn OperationDriver>,
    locks: LockManager,
    audit: AuditWriter,
    notifier: Notifier,
    cancels: CancelRegistry,
    workers: usize,
    poll_interval: Duration,
    retry: RetryPolicy,
    backoff_ceiling: Duration,
    stale_after: Duration,
    sweep_interval: Duration,
    persist_retry: RetryPolicy,
}

impl WorkerPoolBuilder {
    /// Create a new builder with the given store and driver.
    ///
    /// Defaults: 4 workers, 250ms poll, exponential retry over 3 attempts
    /// with a 60s total backoff ceiling, 10 minute stale-lock threshold
    /// swept every 30s.
    pub fn new(store: Arc<dyn StatusStore>, driver: Arc<dyn OperationDriver>) -> Self {
        Self {
            store,
            driver,
            locks: LockManager::new(),
            audit: AuditWriter::new(NoopAuditSink),
            notifier: Notifier::new(),
            cancels: CancelRegistry::new(),
            workers: 4,
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::exponential(3),
            backoff_ceiling: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            persist_retry: RetryPolicy::fixed(3, Duration::from_millis(200)),
        }
    }

    /// Share the lock manager used by the submission surface.
    pub fn locks(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn audit(mut self, audit: AuditWriter) -> Self {
        self.audit = audit;
        self
    }

    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Share the cancel registry used by the submission surface.
    pub fn cancel_registry(mut self, cancels: CancelRegistry) -> Self {
        self.cancels = cancels;
        self
    }

    /// Set the number of concurrent executors.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    pub fn workers(mut self, workers: usize) -> Self {
        assert!(workers > 0, "worker pool needs at least 1 worker");
        self.workers = workers;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry policy for transient driver failures.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cap the cumulative backoff a single task may spend across retries.
    pub fn backoff_ceiling(mut self, ceiling: Duration) -> Self {
        self.backoff_ceiling = ceiling;
        self
    }

    /// How long an execution hold may last before the sweep reclaims it.
    pub fn stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the bounded retry used for status writes themselves.
    pub fn persist_retry(mut self, retry: RetryPolicy) -> Self {
        self.persist_retry = retry;
        self
    }

    /// Build the pool.
    pub fn build(self) -> WorkerPool {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        WorkerPool {
            inner: Arc::new(PoolInner {
                store: self.store,
                driver: self.driver,
                locks: self.locks,
                audit: self.audit,
                notifier: self.notifier,
                cancels: self.cancels,
                semaphore: Arc::new(Semaphore::new(self.workers)),
                retry: self.retry,
                backoff_ceiling: self.backoff_ceiling,
                persist_retry: self.persist_retry,
            }),
            poll_interval: self.poll_interval,
            stale_after: self.stale_after,
            sweep_interval: self.sweep_interval,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }
}
