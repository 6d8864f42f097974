use thiserror::Error;

use crate::core::{ArtifactId, ArtifactType, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error in skill '{skill}' (project '{project}'): {message}")]
    Validation {
        project: String,
        skill: String,
        message: String,
    },

    #[error("Missing artifact {artifact_type} required by skill '{skill}' (project '{project}')")]
    MissingArtifact {
        project: String,
        skill: String,
        artifact_type: ArtifactType,
    },

    #[error("Review rejected phase '{phase}' (project '{project}', artifact {}): {issues} issue(s)", artifact_label(.artifact_id))]
    ReviewRejected {
        project: String,
        phase: String,
        artifact_id: Option<ArtifactId>,
        issues: usize,
    },

    #[error("Phase '{phase}' blocked after {iterations} review iteration(s) (project '{project}', artifact {})", artifact_label(.artifact_id))]
    IterationLimitExceeded {
        project: String,
        phase: String,
        artifact_id: Option<ArtifactId>,
        iterations: u32,
    },

    #[error("Permission denied: role '{role}' may not {permission} (project '{project}')")]
    PermissionDenied {
        project: String,
        role: String,
        permission: String,
    },

    #[error("Message {message_id} could not be delivered to '{receiver}' (project '{project}')")]
    MessageDelivery {
        project: String,
        receiver: String,
        message_id: String,
    },

    #[error("Skill '{skill}' on agent '{agent}' failed (project '{project}'): {message}")]
    SkillFailed {
        project: String,
        agent: String,
        skill: String,
        message: String,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent '{agent}' has no skill '{skill}'")]
    SkillNotFound { agent: String, skill: String },

    #[error("No agent routes skill '{0}'")]
    NoRoute(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Phase already declared: {0}")]
    DuplicatePhase(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Invalid task transition for {task}: {from} -> {to}")]
    InvalidTaskTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("Stale lease for task {task}: result discarded")]
    StaleLease { task: TaskId },

    #[error("Corrupt artifact history: {0}")]
    CorruptHistory(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Soft failures that the coordinator may recover from on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ReviewRejected { .. } | Error::StaleLease { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn artifact_label(id: &Option<ArtifactId>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string())
}
