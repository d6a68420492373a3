//! Realtime fan-out of status transitions to subscribed observers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::task::{ResourceKey, TaskFailure, TaskId, TaskStatus};

const CHANNEL_CAPACITY: usize = 64;

/// One status transition, as published to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskTransition {
    pub task_id: TaskId,
    pub resource_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub last_error: Option<TaskFailure>,
}

/// Maps resource keys to subscriber channels.
///
/// Delivery is best-effort and at-most-once per transition per
/// subscriber. This is a convenience channel, not the source of truth; a
/// subscriber that misses a transition recovers by querying the status
/// store directly.
#[derive(Clone, Default)]
pub struct Notifier {
    channels: Arc<Mutex<HashMap<ResourceKey, broadcast::Sender<TaskTransition>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to transitions for one resource. The stream ends when
    /// the receiver is dropped.
    pub fn subscribe(&self, resource: &ResourceKey) -> broadcast::Receiver<TaskTransition> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(resource.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a transition to whoever is listening. Nobody listening is
    /// not an error.
    pub fn publish(&self, resource: &ResourceKey, transition: TaskTransition) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = channels.get(resource) {
            if tx.send(transition).is_err() {
                // Every receiver is gone, drop the channel.
                channels.remove(resource);
            }
        }
    }
}
