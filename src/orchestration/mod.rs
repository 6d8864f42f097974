//! Orchestration layer for the coordination engine.
//!
//! This module drives a workflow end to end: task dispatch and result
//! handling, review gates, progress reporting, conflict mediation and
//! liveness monitoring with recovery.

mod conflict;
mod health;
mod orchestrator;
mod progress;

pub use conflict::{
    nfr_text, resolution_artifact, Conflict, ConflictStrategy, KeywordStrategy, Resolution, Theme,
    DEFAULT_DECISION, DEFAULT_RATIONALE,
};
pub use health::{
    health_score, CrashedAgent, HealthConfig, HealthMonitor, HealthReport, HealthStatus,
    RecoveryAction, RecoveryKind, RetryTracker, StuckAgent, DEFAULT_MAX_RETRIES,
    DEFAULT_OVERDUE_THRESHOLD_SECS, DEFAULT_STUCK_THRESHOLD_SECS, NO_MESSAGE_ACTIVITY,
};
pub use orchestrator::{Orchestrator, OrchestratorEvent, RunOutcome, ORCHESTRATOR};
pub use progress::{
    review_summary, FailedReview, FailedTask, PhaseProgress, ProgressReport, ReviewSummary, NOT_STARTED,
};
