//! Tests for the submission surface: validation, busy rejection, and
//! cancellation of tasks that have not been picked up.

use std::sync::Arc;

use opsflow::{
    Actor, AuditQuery, AuditStatus, AuditWriter, CancelError, CancelOutcome, CancelRegistry,
    LockManager, Notifier, ResourceKey, SqliteAuditLog, SqliteStatusStore, StatusStore,
    SubmitError, SubmitRequest, TaskQueue, TaskStatus, Viewer,
};
use sqlx::sqlite::SqlitePoolOptions;

struct TestQueue {
    queue: TaskQueue,
    store: Arc<SqliteStatusStore>,
    audit: AuditWriter,
    locks: LockManager,
}

async fn setup() -> TestQueue {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();

    let store = Arc::new(SqliteStatusStore::new(pool.clone()));
    store.run_migrations().await.unwrap();
    let log = SqliteAuditLog::new(pool);
    log.run_migrations().await.unwrap();

    let audit = AuditWriter::new(log);
    let locks = LockManager::new();
    let queue = TaskQueue::new(
        store.clone(),
        locks.clone(),
        audit.clone(),
        Notifier::new(),
        CancelRegistry::new(),
    );

    TestQueue {
        queue,
        store,
        audit,
        locks,
    }
}

fn deploy_request(resource_id: &str) -> SubmitRequest {
    SubmitRequest {
        kind: "deploy".to_string(),
        resource_type: "app".to_string(),
        resource_id: resource_id.to_string(),
        resource_name: resource_id.to_string(),
        payload: serde_json::json!({"compose_path": "/srv/app/compose.yml"}),
        actor: Actor::new("user-1", "user@example.com"),
        source_address: "203.0.113.7".to_string(),
    }
}

async fn audit_entries(t: &TestQueue, resource_id: &str) -> Vec<opsflow::AuditEntry> {
    t.audit
        .entries(
            &AuditQuery {
                resource_id: Some(resource_id.to_string()),
                ..Default::default()
            },
            &Viewer::new("admin", true),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_submit_persists_pending_task_and_audit_entry() {
    let t = setup().await;

    let id = t.queue.submit(deploy_request("app-1")).await.unwrap();

    let task = t.queue.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 0);

    let entries = audit_entries(&t, "app-1").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Pending);
    assert_eq!(entries[0].action, "app.deploy");
    assert_eq!(entries[0].actor_id, "user-1");
    assert_eq!(entries[0].source_address, "203.0.113.7");
    assert_eq!(entries[0].detail["taskId"], serde_json::json!(id.0));
}

#[tokio::test]
async fn test_unknown_kind_is_rejected_without_side_effects() {
    let t = setup().await;

    let mut request = deploy_request("app-1");
    request.kind = "format_disk".to_string();

    let err = t.queue.submit(request).await.unwrap_err();
    assert!(matches!(err, SubmitError::UnknownKind(k) if k == "format_disk"));

    // Nothing happened: no task, no audit row, no claim.
    assert!(t.store.pending().await.unwrap().is_empty());
    assert!(audit_entries(&t, "app-1").await.is_empty());
    assert!(!t.locks.is_claimed(&ResourceKey::new("app", "app-1")));
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_side_effects() {
    let t = setup().await;

    let mut request = deploy_request("app-1");
    request.payload = serde_json::json!({});

    let err = t.queue.submit(request).await.unwrap_err();
    assert!(matches!(err, SubmitError::InvalidPayload { .. }));
    assert!(t.store.pending().await.unwrap().is_empty());
    assert!(!t.locks.is_claimed(&ResourceKey::new("app", "app-1")));
}

#[tokio::test]
async fn test_busy_resource_rejects_second_submission() {
    let t = setup().await;

    t.queue.submit(deploy_request("app-1")).await.unwrap();

    let mut second = deploy_request("app-1");
    second.kind = "restart".to_string();
    second.payload = serde_json::json!({});

    let err = t.queue.submit(second).await.unwrap_err();
    assert!(matches!(err, SubmitError::ResourceBusy(_)));

    // The rejection left no trace: one task, one audit entry.
    assert_eq!(t.store.pending().await.unwrap().len(), 1);
    assert_eq!(audit_entries(&t, "app-1").await.len(), 1);

    // A different resource is unaffected.
    t.queue.submit(deploy_request("app-2")).await.unwrap();
}

#[tokio::test]
async fn test_system_actor_has_empty_source_address() {
    let t = setup().await;

    let mut request = deploy_request("app-1");
    request.actor = Actor::system();

    t.queue.submit(request).await.unwrap();

    let entries = audit_entries(&t, "app-1").await;
    assert_eq!(entries[0].actor_id, "system");
    assert_eq!(entries[0].source_address, "");
}

#[tokio::test]
async fn test_cancel_pending_fails_task_and_frees_resource() {
    let t = setup().await;
    let actor = Actor::new("user-1", "user@example.com");

    let id = t.queue.submit(deploy_request("app-1")).await.unwrap();
    let outcome = t.queue.cancel(id, &actor).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let task = t.queue.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure.unwrap().code, "cancelled");

    let entries = audit_entries(&t, "app-1").await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].status, AuditStatus::Failed);
    assert_eq!(entries[1].detail["errorCode"], "cancelled");

    // The resource accepts new work again.
    t.queue.submit(deploy_request("app-1")).await.unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_and_finished_tasks() {
    let t = setup().await;
    let actor = Actor::new("user-1", "user@example.com");

    let err = t.queue.cancel(opsflow::TaskId(99), &actor).await.unwrap_err();
    assert!(matches!(err, CancelError::NotFound(_)));

    // Drive a task to a terminal state by hand.
    let id = t.queue.submit(deploy_request("app-1")).await.unwrap();
    t.store.claim(1).await.unwrap();
    t.store.mark_succeeded(id).await.unwrap();

    let err = t.queue.cancel(id, &actor).await.unwrap_err();
    assert!(matches!(err, CancelError::AlreadyFinished(_)));
}
