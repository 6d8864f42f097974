//! Core workflow type definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::core::{ArtifactType, TaskId};

/// Unique identifier for a workflow run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of one phase.
///
/// `Pending -> InProgress -> InReview -> {Complete | InProgress | Blocked}`.
/// Complete is terminal; Blocked is terminal until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    InReview,
    Complete,
    Blocked,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Complete | PhaseStatus::Blocked)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::InReview => write!(f, "in_review"),
            PhaseStatus::Complete => write!(f, "complete"),
            PhaseStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Review checkpoint at the end of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewGate {
    /// Reviewer agent; empty means route by skill.
    pub agent: String,
    pub skill: String,
    /// Artifact type under review; `None` reviews the last task's output.
    pub target: Option<ArtifactType>,
}

impl ReviewGate {
    pub fn new(agent: &str, skill: &str, target: Option<ArtifactType>) -> Self {
        Self {
            agent: agent.to_string(),
            skill: skill.to_string(),
            target,
        }
    }
}

/// A named pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskId>,
    pub review_gate: Option<ReviewGate>,
    pub max_iterations: u32,
    pub min_review_rounds: u32,
    pub requires_tests_pass: bool,
}

impl Phase {
    pub fn new(name: &str) -> Self {
        Self::from_config(name, &WorkflowConfig::default())
    }

    /// A phase using the configured iteration limits.
    pub fn from_config(name: &str, config: &WorkflowConfig) -> Self {
        Self {
            name: name.to_string(),
            tasks: Vec::new(),
            review_gate: None,
            max_iterations: config.max_review_iterations.max(1),
            min_review_rounds: config.min_review_rounds,
            requires_tests_pass: false,
        }
    }

    pub fn with_gate(mut self, gate: ReviewGate) -> Self {
        self.review_gate = Some(gate);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_min_review_rounds(mut self, rounds: u32) -> Self {
        self.min_review_rounds = rounds;
        self
    }

    pub fn requiring_tests_pass(mut self) -> Self {
        self.requires_tests_pass = true;
        self
    }

    pub fn is_gated(&self) -> bool {
        self.review_gate.is_some()
    }
}
