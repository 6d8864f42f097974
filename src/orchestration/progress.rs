//! Read-only progress aggregation over the store and the workflow run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::agent::AgentRegistry;
use crate::core::{ArtifactStore, ArtifactType, TaskId};
use crate::util::round1;
use crate::workflow::{PhaseStatus, WorkflowEngine};

pub const NOT_STARTED: &str = "not_started";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    /// Status of the newest version of every type the phase produces.
    pub artifacts: BTreeMap<String, String>,
    pub complete: bool,
    pub status: PhaseStatus,
    pub iteration_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub total: usize,
    pub approved: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub phase: String,
    pub skill: String,
    pub error: String,
}

/// A phase whose review gate could not deliver a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedReview {
    pub phase: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub project: String,
    pub phases: BTreeMap<String, PhaseProgress>,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub progress_percentage: f64,
    pub total_artifacts: usize,
    pub review_summary: ReviewSummary,
    pub failed_tasks: Vec<FailedTask>,
    pub failed_reviews: Vec<FailedReview>,
    pub generated_at: DateTime<Utc>,
}

impl ProgressReport {
    pub fn build(engine: &WorkflowEngine, store: &ArtifactStore, registry: &AgentRegistry) -> Self {
        let mut phases = BTreeMap::new();
        for phase in engine.phases() {
            let artifacts = produced_types(engine, &phase.name, store, registry)
                .into_iter()
                .map(|t| {
                    let status = store
                        .latest(t)
                        .map(|a| a.status.to_string())
                        .unwrap_or_else(|| NOT_STARTED.to_string());
                    (t.as_str().to_string(), status)
                })
                .collect();
            let status = engine.status(&phase.name).unwrap_or_default();
            phases.insert(
                phase.name.clone(),
                PhaseProgress {
                    artifacts,
                    complete: status == PhaseStatus::Complete,
                    status,
                    iteration_count: engine.iteration_count(&phase.name),
                },
            );
        }

        let total_phases = engine.phases().len();
        let completed_phases = engine.run().completed_phases();
        let progress_percentage = if total_phases == 0 {
            0.0
        } else {
            round1(completed_phases as f64 / total_phases as f64 * 100.0)
        };

        let failed_tasks = engine
            .failed_tasks()
            .into_iter()
            .map(|t| FailedTask {
                id: t.id,
                phase: t.phase.clone(),
                skill: t.skill.clone(),
                error: t.status.error().unwrap_or_default().to_string(),
            })
            .collect();
        let failed_reviews = engine
            .failed_reviews()
            .into_iter()
            .map(|(phase, error)| FailedReview {
                phase: phase.to_string(),
                error: error.to_string(),
            })
            .collect();

        Self {
            project: engine.project().to_string(),
            phases,
            completed_phases,
            total_phases,
            progress_percentage,
            total_artifacts: store.len(),
            review_summary: review_summary(store),
            failed_tasks,
            failed_reviews,
            generated_at: Utc::now(),
        }
    }
}

/// Types a phase produces: what its tasks produced or will produce, plus
/// the gate's target.
fn produced_types(
    engine: &WorkflowEngine,
    phase: &str,
    store: &ArtifactStore,
    registry: &AgentRegistry,
) -> Vec<ArtifactType> {
    let mut types = Vec::new();
    for task in engine.tasks(phase) {
        let produced = task
            .artifact_id
            .and_then(|id| store.get(&id))
            .map(|a| a.artifact_type)
            .or_else(|| {
                registry
                    .candidates(&task.skill)
                    .first()
                    .and_then(|a| a.skill(&task.skill))
                    .map(|s| s.output_type())
            });
        if let Some(t) = produced {
            if !types.contains(&t) {
                types.push(t);
            }
        }
    }
    if let Some(target) = engine.phase(phase).and_then(|p| p.review_gate.as_ref()).and_then(|g| g.target) {
        if !types.contains(&target) {
            types.push(target);
        }
    }
    types
}

/// Counts gate verdicts only; other feedback (e.g. conflict resolutions)
/// carries no `approved` key.
pub fn review_summary(store: &ArtifactStore) -> ReviewSummary {
    let mut summary = ReviewSummary::default();
    for feedback in store.history(ArtifactType::ReviewFeedback) {
        if let Some(approved) = feedback.field("approved").and_then(|v| v.as_bool()) {
            summary.total += 1;
            if approved {
                summary.approved += 1;
            } else {
                summary.rejected += 1;
            }
        }
    }
    summary
}
