//! Tests for the realtime notifier.

use std::time::Duration;

use opsflow::{Notifier, ResourceKey, TaskId, TaskStatus, TaskTransition};

fn transition(status: TaskStatus, attempt: u32) -> TaskTransition {
    TaskTransition {
        task_id: TaskId(1),
        resource_id: "app-1".to_string(),
        status,
        attempt,
        last_error: None,
    }
}

#[tokio::test]
async fn test_subscriber_receives_transitions_in_order() {
    let notifier = Notifier::new();
    let resource = ResourceKey::new("app", "app-1");

    let mut rx = notifier.subscribe(&resource);

    notifier.publish(&resource, transition(TaskStatus::Pending, 0));
    notifier.publish(&resource, transition(TaskStatus::Running, 1));
    notifier.publish(&resource, transition(TaskStatus::Succeeded, 1));

    assert_eq!(rx.recv().await.unwrap().status, TaskStatus::Pending);
    assert_eq!(rx.recv().await.unwrap().status, TaskStatus::Running);
    let last = rx.recv().await.unwrap();
    assert_eq!(last.status, TaskStatus::Succeeded);
    assert_eq!(last.attempt, 1);
}

#[tokio::test]
async fn test_no_replay_for_late_subscribers() {
    let notifier = Notifier::new();
    let resource = ResourceKey::new("app", "app-1");

    // Keep the channel alive so the early publish actually goes out.
    let _early = notifier.subscribe(&resource);
    notifier.publish(&resource, transition(TaskStatus::Pending, 0));

    // A late subscriber only sees what happens after it joined. Missed
    // transitions are recovered from the status store, not from here.
    let mut late = notifier.subscribe(&resource);
    notifier.publish(&resource, transition(TaskStatus::Running, 1));

    assert_eq!(late.recv().await.unwrap().status, TaskStatus::Running);
    let nothing = tokio::time::timeout(Duration::from_millis(50), late.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_publish_without_subscribers_is_a_noop() {
    let notifier = Notifier::new();
    let resource = ResourceKey::new("app", "app-1");

    notifier.publish(&resource, transition(TaskStatus::Pending, 0));
}

#[tokio::test]
async fn test_subscribers_are_scoped_per_resource() {
    let notifier = Notifier::new();
    let app1 = ResourceKey::new("app", "app-1");
    let app2 = ResourceKey::new("app", "app-2");

    let mut rx1 = notifier.subscribe(&app1);
    let mut rx2 = notifier.subscribe(&app2);

    notifier.publish(&app1, transition(TaskStatus::Pending, 0));

    assert_eq!(rx1.recv().await.unwrap().status, TaskStatus::Pending);
    let nothing = tokio::time::timeout(Duration::from_millis(50), rx2.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_multiple_subscribers_each_receive() {
    let notifier = Notifier::new();
    let resource = ResourceKey::new("app", "app-1");

    let mut rx1 = notifier.subscribe(&resource);
    let mut rx2 = notifier.subscribe(&resource);

    notifier.publish(&resource, transition(TaskStatus::Running, 1));

    assert_eq!(rx1.recv().await.unwrap().status, TaskStatus::Running);
    assert_eq!(rx2.recv().await.unwrap().status, TaskStatus::Running);
}
