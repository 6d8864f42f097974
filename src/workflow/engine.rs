//! Phase/task scheduling with review-gate retry semantics.
//!
//! The engine owns the phase definitions, the task DAG and the live
//! `WorkflowRun`. It never executes anything itself: the orchestrator asks
//! it for runnable tasks, reports results under a lease, and feeds gate
//! verdicts back through [`WorkflowEngine::record_review`].
//!
//! Phases run strictly in order. Only the first non-Complete phase hands
//! out work, and a Blocked phase stops the pipeline until it is reset.

use std::collections::HashSet;

use crate::agent::AgentRole;
use crate::config::WorkflowConfig;
use crate::core::{
    Artifact, ArtifactId, ArtifactStore, ArtifactType, Lease, ReviewIssue, ReviewOutcome, Severity,
    Task, TaskDAG, TaskId, TaskStatus,
};
use crate::error::{Error, Result};
use crate::permissions::{self, Permission};

use super::state::{PhaseRun, WorkflowRun};
use super::types::{Phase, PhaseStatus, ReviewGate};

/// What the engine decided after one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseDecision {
    /// The phase is done; the next one may start.
    Complete,
    /// Approved, but more review rounds are required before completion.
    ReviewAgain { rounds: u32, required: u32 },
    /// Rejected; these tasks were reset with the issues as feedback.
    Retry { reset: Vec<TaskId>, iteration: u32 },
    /// Rejected for the last allowed time.
    Blocked { iterations: u32 },
    /// Rejected while rejections are configured to abort the run.
    Rejected { issues: Vec<ReviewIssue> },
    /// The gate could not deliver a verdict; the phase is Blocked.
    GateFailed { error: String },
}

/// Everything needed to run a phase's gate.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub phase: String,
    pub gate: Option<ReviewGate>,
    /// The phase's terminal artifact, if one exists.
    pub target: Option<Artifact>,
}

/// Whether the newest test results report no failures.
///
/// Reads `all_passed` when present, otherwise requires `failed == 0`.
pub fn tests_pass(store: &ArtifactStore) -> bool {
    let Some(results) = store.latest(ArtifactType::TestResults) else {
        return false;
    };
    if let Some(all_passed) = results.content.get("all_passed").and_then(|v| v.as_bool()) {
        return all_passed;
    }
    results
        .content
        .get("failed")
        .and_then(|v| v.as_u64())
        .map(|failed| failed == 0)
        .unwrap_or(false)
}

pub struct WorkflowEngine {
    project: String,
    phases: Vec<Phase>,
    dag: TaskDAG,
    run: WorkflowRun,
    fail_on_review_rejection: bool,
}

impl WorkflowEngine {
    pub fn new(project: &str, config: &WorkflowConfig) -> Self {
        Self {
            project: project.to_string(),
            phases: Vec::new(),
            dag: TaskDAG::new(),
            run: WorkflowRun::new(project),
            fail_on_review_rejection: config.fail_on_review_rejection,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Append a phase to the pipeline. Tasks are added with `add_task`.
    pub fn add_phase(&mut self, mut phase: Phase) -> Result<()> {
        if self.phases.iter().any(|p| p.name == phase.name) {
            return Err(Error::DuplicatePhase(phase.name));
        }
        phase.tasks.clear();
        self.run.phases.push(PhaseRun::new(&phase.name));
        self.phases.push(phase);
        Ok(())
    }

    pub fn add_task(&mut self, task: Task) -> Result<TaskId> {
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.name == task.phase)
            .ok_or_else(|| Error::PhaseNotFound(task.phase.clone()))?;
        let id = task.id;
        if !phase.tasks.contains(&id) {
            phase.tasks.push(id);
        }
        self.dag.add_task(task);
        Ok(id)
    }

    /// `to` waits for `from`. A task may not wait on a later phase.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_phase = self.phase_index_of(from)?;
        let to_phase = self.phase_index_of(to)?;
        if from_phase > to_phase {
            return Err(Error::DependencyCycle(format!(
                "task {} in phase '{}' cannot wait on later phase '{}'",
                to.short(),
                self.phases[to_phase].name,
                self.phases[from_phase].name
            )));
        }
        self.dag.add_dependency(from, to)
    }

    /// Make each task of `phase` depend on the one declared before it.
    pub fn chain(&mut self, phase: &str) -> Result<()> {
        let tasks = self
            .phase(phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?
            .tasks
            .clone();
        for pair in tasks.windows(2) {
            self.dag.add_dependency(&pair[0], &pair[1])?;
        }
        Ok(())
    }

    fn phase_index_of(&self, task: &TaskId) -> Result<usize> {
        let task = self.dag.get_task(task).ok_or(Error::TaskNotFound(*task))?;
        self.phases
            .iter()
            .position(|p| p.name == task.phase)
            .ok_or_else(|| Error::PhaseNotFound(task.phase.clone()))
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    pub fn dag(&self) -> &TaskDAG {
        &self.dag
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.dag.get_task(id)
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.dag.get_task_mut(id).ok_or(Error::TaskNotFound(*id))
    }

    /// Tasks of a phase in declaration order.
    pub fn tasks(&self, phase: &str) -> Vec<&Task> {
        self.phase(phase)
            .map(|p| p.tasks.iter().filter_map(|id| self.dag.get_task(id)).collect())
            .unwrap_or_default()
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        self.dag.all_tasks()
    }

    pub fn status(&self, phase: &str) -> Option<PhaseStatus> {
        self.run.status(phase)
    }

    pub fn iteration_count(&self, phase: &str) -> u32 {
        self.run.iteration_count(phase)
    }

    /// The phase currently allowed to make progress.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.run.current_phase().and_then(|name| self.phase(name))
    }

    pub fn is_finished(&self) -> bool {
        self.run.is_complete()
    }

    /// Pending tasks of the current phase whose dependencies are all Done.
    pub fn runnable(&self) -> Vec<Task> {
        let Some(phase) = self.current_phase() else {
            return Vec::new();
        };
        match self.run.status(&phase.name) {
            Some(PhaseStatus::Pending) | Some(PhaseStatus::InProgress) => {}
            _ => return Vec::new(),
        }
        phase
            .tasks
            .iter()
            .filter_map(|id| self.dag.get_task(id))
            .filter(|t| t.status == TaskStatus::Pending && self.dag.dependencies_done(&t.id))
            .cloned()
            .collect()
    }

    /// Hand the task to a specific agent.
    pub fn assign(&mut self, id: &TaskId, agent: &str) -> Result<()> {
        self.task_mut(id)?.agent = agent.to_string();
        Ok(())
    }

    /// Take ownership of a runnable task.
    pub fn start_task(&mut self, id: &TaskId) -> Result<Lease> {
        let runnable = self.runnable().iter().any(|t| t.id == *id);
        let task = self.dag.get_task(id).ok_or(Error::TaskNotFound(*id))?;
        if !runnable {
            return Err(Error::InvalidTaskTransition {
                task: *id,
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            });
        }
        let phase = task.phase.clone();
        let run = self.run.phase_mut(&phase)?;
        if run.status == PhaseStatus::Pending {
            run.transition(PhaseStatus::InProgress)?;
        }
        let lease = self.task_mut(id)?.start();
        tracing::debug!(task = %id.short(), phase = %phase, attempt = lease.attempt, "task started");
        Ok(lease)
    }

    /// Whether `lease` still owns its task.
    pub fn holds(&self, lease: &Lease) -> bool {
        self.task(&lease.task).is_some_and(|t| t.holds(lease))
    }

    fn leased_task(&mut self, lease: &Lease) -> Result<&mut Task> {
        let task = self.task_mut(&lease.task)?;
        if !task.holds(lease) {
            return Err(Error::StaleLease { task: lease.task });
        }
        Ok(task)
    }

    /// Record a successful execution. Fails with `StaleLease` if the task
    /// was released or reassigned since the lease was issued.
    pub fn complete_task(&mut self, lease: &Lease, artifact_id: ArtifactId) -> Result<()> {
        self.leased_task(lease)?.complete(artifact_id);
        Ok(())
    }

    pub fn fail_task(&mut self, lease: &Lease, error: &str) -> Result<()> {
        self.leased_task(lease)?.fail(error);
        Ok(())
    }

    /// Take ownership away from the current execution and requeue the task.
    pub fn release_task(&mut self, id: &TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if !task.is_in_progress() {
            return Err(Error::InvalidTaskTransition {
                task: *id,
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        task.release();
        Ok(())
    }

    /// Take ownership away and fail the task instead of requeueing it.
    pub fn abort_task(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        self.release_task(id)?;
        self.task_mut(id)?.fail(reason);
        Ok(())
    }

    /// Requeue a Failed task.
    pub fn retry_task(&mut self, id: &TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if !task.is_failed() {
            return Err(Error::InvalidTaskTransition {
                task: *id,
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        let feedback = std::mem::take(&mut task.feedback);
        task.reset_with_feedback(feedback);
        Ok(())
    }

    /// Every task of the phase is Done and has an artifact.
    pub fn is_task_complete(&self, phase: &str) -> bool {
        self.phase(phase).is_some_and(|p| {
            p.tasks.iter().all(|id| {
                self.dag
                    .get_task(id)
                    .is_some_and(|t| t.is_done() && t.artifact_id.is_some())
            })
        })
    }

    /// The current phase, if it is ready for (another) gate evaluation.
    pub fn awaiting_review(&self) -> Option<String> {
        let phase = self.current_phase()?;
        match self.run.status(&phase.name)? {
            PhaseStatus::Complete | PhaseStatus::Blocked => None,
            _ if self.is_task_complete(&phase.name) => Some(phase.name.clone()),
            _ => None,
        }
    }

    /// Artifact a phase's gate judges: the newest artifact of the gate's
    /// target type, else the output of the phase's last task.
    pub fn terminal_artifact(&self, phase: &str, store: &ArtifactStore) -> Option<Artifact> {
        let def = self.phase(phase)?;
        if let Some(target) = def.review_gate.as_ref().and_then(|g| g.target) {
            return store.latest(target);
        }
        def.tasks
            .last()
            .and_then(|id| self.dag.get_task(id))
            .and_then(|t| t.artifact_id)
            .and_then(|id| store.get(&id))
    }

    /// Move a task-complete phase into review and describe its gate.
    pub fn begin_review(&mut self, phase: &str, store: &ArtifactStore) -> Result<ReviewRequest> {
        let def = self
            .phase(phase)
            .cloned()
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?;
        let run = self
            .run
            .phase(phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?;
        if run.status == PhaseStatus::Blocked {
            return Err(self.iteration_limit(phase, run.iteration_count, store));
        }
        if !self.is_task_complete(phase) {
            return Err(Error::InvalidPhaseTransition {
                from: format!("{}:{}", phase, run.status),
                to: PhaseStatus::InReview.to_string(),
            });
        }

        let run = self.run.phase_mut(phase)?;
        if run.status == PhaseStatus::Pending {
            run.transition(PhaseStatus::InProgress)?;
        }
        if run.status == PhaseStatus::InProgress {
            run.transition(PhaseStatus::InReview)?;
        }
        if run.status != PhaseStatus::InReview {
            return Err(Error::InvalidPhaseTransition {
                from: format!("{}:{}", phase, run.status),
                to: PhaseStatus::InReview.to_string(),
            });
        }

        Ok(ReviewRequest {
            phase: phase.to_string(),
            gate: def.review_gate.clone(),
            target: self.terminal_artifact(phase, store),
        })
    }

    fn iteration_limit(&self, phase: &str, iterations: u32, store: &ArtifactStore) -> Error {
        Error::IterationLimitExceeded {
            project: self.project.clone(),
            phase: phase.to_string(),
            artifact_id: self.terminal_artifact(phase, store).map(|a| a.id),
            iterations,
        }
    }

    /// Apply one gate verdict to a phase in review.
    ///
    /// A phase that requires passing tests treats failing or missing test
    /// results as a rejection. Ungated phases pass `ReviewOutcome::approve`
    /// and skip the minimum-rounds requirement.
    pub fn record_review(
        &mut self,
        phase: &str,
        outcome: &ReviewOutcome,
        store: &ArtifactStore,
    ) -> Result<PhaseDecision> {
        let def = self
            .phase(phase)
            .cloned()
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?;
        let run = self
            .run
            .phase(phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?;
        match run.status {
            PhaseStatus::InReview => {}
            PhaseStatus::Blocked => {
                return Err(self.iteration_limit(phase, run.iteration_count, store))
            }
            status => {
                return Err(Error::InvalidPhaseTransition {
                    from: format!("{}:{}", phase, status),
                    to: "reviewed".to_string(),
                })
            }
        }

        let mut approved = outcome.approved;
        let mut issues = outcome.issues.clone();
        if def.requires_tests_pass && !tests_pass(store) {
            approved = false;
            issues.push(ReviewIssue::new(
                "tests",
                Severity::High,
                "latest test results do not report all tests passing",
            ));
        }

        let run = self.run.phase_mut(phase)?;
        run.review_rounds += 1;
        let rounds = run.review_rounds;

        if approved {
            let required = if def.is_gated() { def.min_review_rounds } else { 0 };
            if rounds < required {
                tracing::info!(phase, rounds, required, "approved, another review round required");
                return Ok(PhaseDecision::ReviewAgain { rounds, required });
            }
            run.transition(PhaseStatus::Complete)?;
            if self.run.is_complete() {
                self.run.completed_at = Some(chrono::Utc::now());
            }
            return Ok(PhaseDecision::Complete);
        }

        run.iteration_count += 1;
        let iteration = run.iteration_count;
        tracing::warn!(phase, iteration, issues = issues.len(), "review rejected");

        if self.fail_on_review_rejection {
            run.transition(PhaseStatus::Blocked)?;
            return Ok(PhaseDecision::Rejected { issues });
        }
        if iteration >= def.max_iterations {
            run.transition(PhaseStatus::Blocked)?;
            tracing::warn!(phase, iterations = iteration, "phase blocked at iteration limit");
            return Ok(PhaseDecision::Blocked { iterations: iteration });
        }

        run.transition(PhaseStatus::InProgress)?;
        let reset = self.rework_set(&def, store);
        for id in &reset {
            self.task_mut(id)?.reset_with_feedback(issues.clone());
        }
        Ok(PhaseDecision::Retry { reset, iteration })
    }

    /// Block a phase in review whose gate failed to deliver a verdict.
    ///
    /// Not counted against `max_iterations`: a broken gate is not a
    /// rejection and retrying it blindly would not help. The phase stays
    /// Blocked until `reset_phase`.
    pub fn record_gate_failure(&mut self, phase: &str, error: &str) -> Result<PhaseDecision> {
        let run = self.run.phase_mut(phase)?;
        if run.status != PhaseStatus::InReview {
            return Err(Error::InvalidPhaseTransition {
                from: format!("{}:{}", phase, run.status),
                to: PhaseStatus::Blocked.to_string(),
            });
        }
        run.transition(PhaseStatus::Blocked)?;
        run.gate_error = Some(error.to_string());
        tracing::error!(project = %self.project, phase, error, "review gate failed, phase blocked");
        Ok(PhaseDecision::GateFailed {
            error: error.to_string(),
        })
    }

    /// Phases whose gate failed, with the recorded error.
    pub fn failed_reviews(&self) -> Vec<(&str, &str)> {
        self.run
            .phases
            .iter()
            .filter_map(|p| p.gate_error.as_deref().map(|e| (p.name.as_str(), e)))
            .collect()
    }

    /// Tasks to redo after a rejection: producers of the reviewed type plus
    /// their dependents inside the phase, or the last task as a fallback.
    fn rework_set(&self, def: &Phase, store: &ArtifactStore) -> Vec<TaskId> {
        let produced = |id: &TaskId| {
            self.dag
                .get_task(id)
                .and_then(|t| t.artifact_id)
                .and_then(|a| store.get(&a))
                .map(|a| a.artifact_type)
        };
        let target = def
            .review_gate
            .as_ref()
            .and_then(|g| g.target)
            .or_else(|| def.tasks.last().and_then(produced));

        let mut selected: HashSet<TaskId> = def
            .tasks
            .iter()
            .filter(|id| target.is_some() && produced(*id) == target)
            .copied()
            .collect();
        if selected.is_empty() {
            selected.extend(def.tasks.last().copied());
        }
        let dependents: Vec<TaskId> = selected
            .iter()
            .flat_map(|id| self.dag.transitive_dependents(id))
            .collect();
        selected.extend(dependents);

        def.tasks
            .iter()
            .filter(|id| selected.contains(id))
            .copied()
            .collect()
    }

    /// Reopen a Blocked phase. Only roles holding `ResetPhase` may do this.
    ///
    /// Counters start over and every task of the phase is requeued.
    pub fn reset_phase(&mut self, phase: &str, role: AgentRole) -> Result<()> {
        permissions::check(role, Permission::ResetPhase, &self.project)?;
        let tasks = self
            .phase(phase)
            .ok_or_else(|| Error::PhaseNotFound(phase.to_string()))?
            .tasks
            .clone();
        let run = self.run.phase_mut(phase)?;
        if run.status != PhaseStatus::Blocked {
            return Err(Error::InvalidPhaseTransition {
                from: format!("{}:{}", phase, run.status),
                to: PhaseStatus::InProgress.to_string(),
            });
        }
        run.transition(PhaseStatus::InProgress)?;
        run.iteration_count = 0;
        run.review_rounds = 0;
        run.gate_error = None;

        for id in &tasks {
            let task = self.task_mut(id)?;
            if task.is_in_progress() {
                task.release();
            } else {
                let feedback = std::mem::take(&mut task.feedback);
                task.reset_with_feedback(feedback);
            }
        }
        tracing::info!(phase, %role, "blocked phase reset");
        Ok(())
    }

    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.dag.all_tasks().into_iter().filter(|t| t.is_failed()).collect()
    }

    pub fn in_progress_tasks(&self) -> Vec<&Task> {
        self.dag
            .all_tasks()
            .into_iter()
            .filter(|t| t.is_in_progress())
            .collect()
    }

    /// Failed tasks plus unfinished tasks of Blocked phases.
    pub fn blocked_tasks(&self) -> Vec<&Task> {
        self.dag
            .all_tasks()
            .into_iter()
            .filter(|t| {
                t.is_failed()
                    || (!t.is_done() && self.run.status(&t.phase) == Some(PhaseStatus::Blocked))
            })
            .collect()
    }

    /// Adopt persisted run counters for the same pipeline.
    ///
    /// Tasks of Complete phases are marked Done; a phase caught mid-review
    /// goes back to InProgress since task state is not persisted.
    pub fn restore(&mut self, mut run: WorkflowRun) -> Result<()> {
        let ours: Vec<&str> = self.phases.iter().map(|p| p.name.as_str()).collect();
        let theirs: Vec<&str> = run.phases.iter().map(|p| p.name.as_str()).collect();
        if ours != theirs {
            let missing = theirs
                .iter()
                .chain(ours.iter())
                .find(|n| !ours.contains(n) || !theirs.contains(n))
                .unwrap_or(&"<order>")
                .to_string();
            return Err(Error::PhaseNotFound(missing));
        }

        for phase in run.phases.iter_mut() {
            if phase.status == PhaseStatus::InReview {
                phase.transition(PhaseStatus::InProgress)?;
            }
        }
        let complete: Vec<String> = run
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Complete)
            .map(|p| p.name.clone())
            .collect();
        run.project = self.project.clone();
        self.run = run;

        for name in complete {
            let ids = self.phase(&name).map(|p| p.tasks.clone()).unwrap_or_default();
            for id in ids {
                let task = self.task_mut(&id)?;
                task.status = TaskStatus::Done;
                task.completed_at = Some(chrono::Utc::now());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("project", &self.project)
            .field("phases", &self.phases.len())
            .field("tasks", &self.dag.task_count())
            .field("current", &self.run.current_phase())
            .finish()
    }
}
