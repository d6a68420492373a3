//! Task records, operation kinds, and the status state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a task, assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The reserved principal id for work not initiated by a human caller.
pub const SYSTEM_ACTOR: &str = "system";

/// The principal an operation is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub email: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }

    /// The reserved system principal, used by background machinery.
    pub fn system() -> Self {
        Self {
            id: SYSTEM_ACTOR.to_string(),
            email: String::new(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_ACTOR
    }
}

/// The target of an operation, and the key operations serialize on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// Error returned when parsing an operation kind that is not in the allowlist.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operation kind: {0}")]
pub struct UnknownKind(pub String);

/// The closed set of recognized operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "deploy")]
    Deploy,
    #[serde(rename = "restart")]
    Restart,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "rebuild")]
    Rebuild,
    #[serde(rename = "backup.create")]
    BackupCreate,
    #[serde(rename = "backup.restore")]
    BackupRestore,
    #[serde(rename = "service.action")]
    ServiceAction,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Rebuild => "rebuild",
            Self::BackupCreate => "backup.create",
            Self::BackupRestore => "backup.restore",
            Self::ServiceAction => "service.action",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(Self::Deploy),
            "restart" => Ok(Self::Restart),
            "stop" => Ok(Self::Stop),
            "delete" => Ok(Self::Delete),
            "rebuild" => Ok(Self::Rebuild),
            "backup.create" => Ok(Self::BackupCreate),
            "backup.restore" => Ok(Self::BackupRestore),
            "service.action" => Ok(Self::ServiceAction),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Error returned when a payload does not match its operation kind.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("{0}")]
    Shape(String),
}

/// Parameters for an operation, keyed by kind.
///
/// One variant per recognized kind, so a payload that does not fit its
/// operation is rejected at the submission boundary instead of surfacing
/// as a runtime surprise inside a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OperationPayload {
    #[serde(rename = "deploy")]
    Deploy {
        compose_path: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    #[serde(rename = "restart")]
    Restart {
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(rename = "stop")]
    Stop {
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(rename = "delete")]
    Delete {
        #[serde(default)]
        force: bool,
    },
    #[serde(rename = "rebuild")]
    Rebuild {
        #[serde(default)]
        no_cache: bool,
    },
    #[serde(rename = "backup.create")]
    BackupCreate { destination: String },
    #[serde(rename = "backup.restore")]
    BackupRestore { backup_id: String },
    #[serde(rename = "service.action")]
    ServiceAction { service: String, action: String },
}

impl OperationPayload {
    /// Validate raw parameters against a kind and produce the typed payload.
    pub fn parse(kind: OperationKind, params: serde_json::Value) -> Result<Self, PayloadError> {
        let mut obj = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            _ => return Err(PayloadError::NotAnObject),
        };
        obj.insert(
            "kind".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );
        serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| PayloadError::Shape(e.to_string()))
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Deploy { .. } => OperationKind::Deploy,
            Self::Restart { .. } => OperationKind::Restart,
            Self::Stop { .. } => OperationKind::Stop,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Rebuild { .. } => OperationKind::Rebuild,
            Self::BackupCreate { .. } => OperationKind::BackupCreate,
            Self::BackupRestore { .. } => OperationKind::BackupRestore,
            Self::ServiceAction { .. } => OperationKind::ServiceAction,
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> to` is a legal move.
    ///
    /// Running to running is a retry attempt on the same record. Pending to
    /// failed is cancellation before pickup. Terminal states are immutable
    /// and no state is ever re-entered backward.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Failed) | (Running, Running) | (Running, Succeeded) | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Structured error detail attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The failure recorded when a pending task is cancelled.
    pub fn cancelled(by: &Actor) -> Self {
        Self::new("cancelled", format!("cancelled by {}", by.id))
    }
}

/// A task retrieved from storage.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTask {
    pub id: TaskId,
    pub kind: OperationKind,
    pub resource: ResourceKey,
    pub resource_name: String,
    pub payload: OperationPayload,
    pub actor: Actor,
    pub source_address: String,
    pub attempt: u32,
    pub status: TaskStatus,
    pub failure: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            OperationKind::Deploy,
            OperationKind::Restart,
            OperationKind::Stop,
            OperationKind::Delete,
            OperationKind::Rebuild,
            OperationKind::BackupCreate,
            OperationKind::BackupRestore,
            OperationKind::ServiceAction,
        ] {
            assert_eq!(kind.as_str().parse::<OperationKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!("drop_tables".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_transitions_forward_only() {
        use TaskStatus::*;

        assert!(Pending.can_transition(Running));
        assert!(Pending.can_transition(Failed));
        assert!(Running.can_transition(Running));
        assert!(Running.can_transition(Succeeded));
        assert!(Running.can_transition(Failed));

        // No skipping running on the way to success.
        assert!(!Pending.can_transition(Succeeded));

        // Nothing re-enters pending, terminal states are frozen.
        for from in [Running, Succeeded, Failed] {
            assert!(!from.can_transition(Pending));
        }
        for from in [Succeeded, Failed] {
            for to in [Pending, Running, Succeeded, Failed] {
                assert!(!from.can_transition(to));
            }
        }
    }

    #[test]
    fn test_payload_parse_validates_shape() {
        let payload = OperationPayload::parse(
            OperationKind::Deploy,
            serde_json::json!({"compose_path": "/srv/app/compose.yml"}),
        )
        .unwrap();
        assert_eq!(payload.kind(), OperationKind::Deploy);

        // Missing required field for the kind.
        let err = OperationPayload::parse(OperationKind::Deploy, serde_json::json!({}));
        assert!(matches!(err, Err(PayloadError::Shape(_))));

        // Not an object at all.
        let err = OperationPayload::parse(OperationKind::Restart, serde_json::json!(42));
        assert!(matches!(err, Err(PayloadError::NotAnObject)));

        // Parameterless kinds accept an empty object and null.
        OperationPayload::parse(OperationKind::Restart, serde_json::json!({})).unwrap();
        OperationPayload::parse(OperationKind::Stop, serde_json::Value::Null).unwrap();
    }
}
