//! Task data model for the phase pipeline.
//!
//! Tasks are the atomic units of work: one skill invocation on one agent.
//! Each task tracks its status, the artifact it produced, rejection
//! feedback from review gates, and an attempt counter used to discard
//! results from executions that lost ownership of the task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::artifact::ArtifactId;
use super::review::ReviewIssue;

/// Unique identifier for a task within a workflow.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies, or reset for another attempt.
    #[default]
    Pending,
    /// Owned by an in-flight skill execution.
    InProgress,
    /// Finished with a stored artifact.
    Done,
    /// Finished with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl TaskStatus {
    /// The failure message, if Failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            TaskStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Proof of ownership handed to one execution of a task.
///
/// A result is only applied when its lease still matches the task's
/// current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub task: TaskId,
    pub attempt: u32,
}

/// A single skill invocation in a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name of the owning phase.
    pub phase: String,
    /// Agent currently responsible for the task.
    pub agent: String,
    pub skill: String,
    pub description: String,
    /// Tasks that must be Done before this one may start.
    pub dependency_ids: Vec<TaskId>,
    pub status: TaskStatus,
    /// Task-specific skill input.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Issues from the latest rejection, passed back to the skill.
    #[serde(default)]
    pub feedback: Vec<ReviewIssue>,
    /// Artifact produced by the latest successful attempt.
    pub artifact_id: Option<ArtifactId>,
    /// Number of times the task has been started.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task for `skill` owned by `agent`.
    pub fn new(phase: &str, agent: &str, skill: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            phase: phase.to_string(),
            agent: agent.to_string(),
            skill: skill.to_string(),
            description: description.to_string(),
            dependency_ids: Vec::new(),
            status: TaskStatus::Pending,
            input: Map::new(),
            feedback: Vec::new(),
            artifact_id: None,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.input.insert(key.to_string(), value.into());
        self
    }

    /// Take ownership for a new attempt and return its lease.
    pub fn start(&mut self) -> Lease {
        self.attempt += 1;
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        Lease {
            task: self.id,
            attempt: self.attempt,
        }
    }

    /// Whether `lease` still owns this task.
    pub fn holds(&self, lease: &Lease) -> bool {
        lease.task == self.id
            && lease.attempt == self.attempt
            && self.status == TaskStatus::InProgress
    }

    /// Mark the task done with the artifact it produced.
    pub fn complete(&mut self, artifact_id: ArtifactId) {
        self.status = TaskStatus::Done;
        self.artifact_id = Some(artifact_id);
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Return the task to Pending so another execution can take it.
    ///
    /// The attempt counter is bumped so any in-flight execution's lease
    /// goes stale.
    pub fn release(&mut self) {
        self.attempt += 1;
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }

    /// Reset for a review retry, carrying the rejection's issues.
    pub fn reset_with_feedback(&mut self, feedback: Vec<ReviewIssue>) {
        self.status = TaskStatus::Pending;
        self.feedback = feedback;
        self.started_at = None;
        self.completed_at = None;
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == TaskStatus::InProgress
    }

    /// Seconds since the current attempt started, if running.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<i64> {
        match (&self.status, self.started_at) {
            (TaskStatus::InProgress, Some(started)) => Some((now - started).num_seconds()),
            _ => None,
        }
    }
}
