//! Per-resource mutual exclusion for conflicting operations.
//!
//! The manager tracks two things for every resource: a *claim*, taken when
//! a task is accepted and held until the task reaches a terminal status,
//! and a *hold*, taken by a worker around each driver call. The claim is
//! what keeps a resource down to one outstanding task; the hold is what a
//! worker gives up between retry attempts and what the stale sweep watches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::task::{ResourceKey, TaskId};

/// Error type for lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// The resource already has an outstanding task. Reported immediately,
    /// callers are never queued.
    #[error("an operation is already in progress for {0}")]
    Busy(ResourceKey),

    /// A hold was requested for a task that no longer owns the claim,
    /// typically after a stale-lock force release.
    #[error("resource {key} is not claimed by task {owner}")]
    NotClaimed { key: ResourceKey, owner: TaskId },

    /// A second hold on an already held resource. Programming error.
    #[error("resource {0} is already held")]
    AlreadyHeld(ResourceKey),
}

#[derive(Debug)]
struct LockEntry {
    owner: Option<TaskId>,
    held_since: Option<Instant>,
}

/// A hold that is out of bounds of the stale threshold.
#[derive(Debug, Clone)]
pub struct StaleLock {
    pub key: ResourceKey,
    pub owner: TaskId,
    pub held_for: Duration,
}

type LockTable = Arc<Mutex<HashMap<ResourceKey, LockEntry>>>;

/// Serializes operations per resource key.
///
/// One explicit service object constructed at process start and handed to
/// the components that need it. Cheap to clone, internally synchronized.
#[derive(Clone, Default)]
pub struct LockManager {
    table: LockTable,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, LockEntry>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a resource for a task about to be persisted.
    ///
    /// Synchronous and non-blocking: a busy resource is reported
    /// immediately rather than queuing the caller. Bind the owner with
    /// [`bind`](Self::bind) once the task id is known, or drop the
    /// reservation with [`abandon`](Self::abandon) if persistence fails.
    pub fn claim(&self, key: &ResourceKey) -> Result<(), LockError> {
        let mut table = self.lock_table();
        if table.contains_key(key) {
            return Err(LockError::Busy(key.clone()));
        }
        table.insert(
            key.clone(),
            LockEntry {
                owner: None,
                held_since: None,
            },
        );
        Ok(())
    }

    /// Attach the persisted task id to a fresh reservation.
    pub fn bind(&self, key: &ResourceKey, owner: TaskId) {
        let mut table = self.lock_table();
        if let Some(entry) = table.get_mut(key) {
            if entry.owner.is_none() {
                entry.owner = Some(owner);
            }
        }
    }

    /// Drop a reservation whose task was never persisted.
    pub fn abandon(&self, key: &ResourceKey) {
        let mut table = self.lock_table();
        if let Some(entry) = table.get(key) {
            if entry.owner.is_none() {
                table.remove(key);
            }
        }
    }

    /// Re-create a bound claim from persisted state after a restart.
    pub fn restore(&self, key: &ResourceKey, owner: TaskId) {
        let mut table = self.lock_table();
        table.entry(key.clone()).or_insert(LockEntry {
            owner: Some(owner),
            held_since: None,
        });
    }

    /// Take the execution hold before a driver call.
    ///
    /// The returned guard releases the hold on every exit path, panics
    /// included. Workers drop it between retry attempts and take it again
    /// before the retry executes.
    pub fn hold(&self, key: &ResourceKey, owner: TaskId) -> Result<HoldGuard, LockError> {
        let mut table = self.lock_table();
        let entry = table.get_mut(key).ok_or_else(|| LockError::NotClaimed {
            key: key.clone(),
            owner,
        })?;
        if entry.owner != Some(owner) {
            return Err(LockError::NotClaimed {
                key: key.clone(),
                owner,
            });
        }
        if entry.held_since.is_some() {
            return Err(LockError::AlreadyHeld(key.clone()));
        }
        entry.held_since = Some(Instant::now());
        Ok(HoldGuard {
            table: self.table.clone(),
            key: key.clone(),
            owner,
        })
    }

    /// Release a task's claim at its terminal transition.
    ///
    /// Idempotent: releasing an already released claim, or one that has
    /// since been handed to another task, is a no-op.
    pub fn release(&self, key: &ResourceKey, owner: TaskId) {
        let mut table = self.lock_table();
        if let Some(entry) = table.get(key) {
            if entry.owner == Some(owner) {
                table.remove(key);
            }
        }
    }

    /// Holds older than `threshold`, for the supervisory sweep.
    pub fn stale_holds(&self, threshold: Duration) -> Vec<StaleLock> {
        let table = self.lock_table();
        let now = Instant::now();
        table
            .iter()
            .filter_map(|(key, entry)| {
                let owner = entry.owner?;
                let held_for = now.duration_since(entry.held_since?);
                (held_for > threshold).then(|| StaleLock {
                    key: key.clone(),
                    owner,
                    held_for,
                })
            })
            .collect()
    }

    /// Forcibly remove a claim regardless of owner or hold state.
    ///
    /// Returns the owner that was evicted. Only the stale sweep calls
    /// this; a task whose claim was evicted fails its next hold.
    pub fn force_release(&self, key: &ResourceKey) -> Option<TaskId> {
        let mut table = self.lock_table();
        let entry = table.remove(key)?;
        if let Some(owner) = entry.owner {
            warn!(resource = %key, task = %owner, "force-released resource lock");
        }
        entry.owner
    }

    /// Whether a resource currently has an outstanding claim.
    pub fn is_claimed(&self, key: &ResourceKey) -> bool {
        self.lock_table().contains_key(key)
    }
}

/// Scoped execution hold. Dropping it releases the hold, never the claim.
#[derive(Debug)]
pub struct HoldGuard {
    table: LockTable,
    key: ResourceKey,
    owner: TaskId,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = table.get_mut(&self.key) {
            if entry.owner == Some(self.owner) {
                entry.held_since = None;
            }
        }
    }
}
