use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a plan. Stored as the exact uppercase strings the Oozie
/// reprocessing API exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Draft,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "DRAFT",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "STOPPED" => Ok(Self::Stopped),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl TaskStatus {
    /// Whether this status is terminal. Terminal statuses are monotonic:
    /// only an operator retry moves a task back to `Pending`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of Oozie job a task reruns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Workflow,
    Coordinator,
    Bundle,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Workflow => "workflow",
            Self::Coordinator => "coordinator",
            Self::Bundle => "bundle",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "coordinator" => Ok(Self::Coordinator),
            "bundle" => Ok(Self::Bundle),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Role of an authentication principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admin => "admin",
            Self::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "viewer" => Ok(Self::Viewer),
            other => Err(RoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Role`] string.
#[derive(Debug, Clone)]
pub struct RoleParseError(pub String);

impl fmt::Display for RoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid role: {:?}", self.0)
    }
}

impl std::error::Error for RoleParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An authentication principal. Only referenced by `created_by` on plans
/// and by WebSocket session admission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A plan -- an operator-authored batch of rerun tasks with a lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: PlanStatus,
    pub oozie_url: String,
    pub use_rest: bool,
    pub max_concurrency: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- a single rerun of one Oozie job. The row doubles as the audit
/// log for the execution: command, stdout, stderr, exit_code, timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: i64,
    pub plan_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub job_id: String,

    pub action: String,
    pub date: String,
    pub coordinator: String,

    pub wf_failnodes: bool,
    pub wf_skip_nodes: String,

    pub refresh: bool,
    pub failed: bool,

    pub extra_props: Json<BTreeMap<String, String>>,

    pub status: TaskStatus,
    pub attempt: i64,

    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
