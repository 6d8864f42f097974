//! Run state with phase transition validation.
//!
//! `WorkflowRun` is the persisted part of a workflow: per-phase status,
//! review counters and the timestamped transition history. Definitions
//! (phases, tasks) live in the engine and are rebuilt on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::types::{PhaseStatus, WorkflowId};

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    /// The status that was entered.
    pub status: PhaseStatus,
    /// When this status was entered.
    pub entered_at: DateTime<Utc>,
}

/// Live state of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRun {
    pub name: String,
    pub status: PhaseStatus,
    /// Number of rejections so far. Never exceeds the phase's max_iterations.
    pub iteration_count: u32,
    /// Number of gate evaluations so far, approvals included.
    pub review_rounds: u32,
    /// Why the gate itself failed, when it could not produce a verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_error: Option<String>,
    pub history: Vec<PhaseHistoryEntry>,
}

impl PhaseRun {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: PhaseStatus::Pending,
            iteration_count: 0,
            review_rounds: 0,
            gate_error: None,
            history: vec![PhaseHistoryEntry {
                status: PhaseStatus::Pending,
                entered_at: Utc::now(),
            }],
        }
    }

    /// Whether the state machine allows moving to `target`.
    ///
    /// Valid transitions:
    /// - Pending -> InProgress
    /// - InProgress -> InReview
    /// - InReview -> Complete | InProgress | Blocked
    /// - Blocked -> InProgress (explicit reset only)
    pub fn can_transition(&self, target: PhaseStatus) -> bool {
        matches!(
            (self.status, target),
            (PhaseStatus::Pending, PhaseStatus::InProgress)
                | (PhaseStatus::InProgress, PhaseStatus::InReview)
                | (PhaseStatus::InReview, PhaseStatus::Complete)
                | (PhaseStatus::InReview, PhaseStatus::InProgress)
                | (PhaseStatus::InReview, PhaseStatus::Blocked)
                | (PhaseStatus::Blocked, PhaseStatus::InProgress)
        )
    }

    pub fn transition(&mut self, target: PhaseStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: format!("{}:{}", self.name, self.status),
                to: target.to_string(),
            });
        }
        tracing::info!(phase = %self.name, from = %self.status, to = %target, "phase transition");
        self.status = target;
        self.history.push(PhaseHistoryEntry {
            status: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }
}

/// Persisted state of one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowId,
    pub project: String,
    /// Phases in pipeline order.
    pub phases: Vec<PhaseRun>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(project: &str) -> Self {
        Self {
            id: WorkflowId::new(),
            project: project.to_string(),
            phases: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRun> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Result<&mut PhaseRun> {
        self.phases
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::PhaseNotFound(name.to_string()))
    }

    /// First phase that is not Complete.
    pub fn current_phase(&self) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| p.status != PhaseStatus::Complete)
            .map(|p| p.name.as_str())
    }

    pub fn status(&self, phase: &str) -> Option<PhaseStatus> {
        self.phase(phase).map(|p| p.status)
    }

    pub fn iteration_count(&self, phase: &str) -> u32 {
        self.phase(phase).map(|p| p.iteration_count).unwrap_or(0)
    }

    pub fn completed_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Complete)
            .count()
    }

    pub fn blocked_phase(&self) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Blocked)
            .map(|p| p.name.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(|p| p.status == PhaseStatus::Complete)
    }
}
