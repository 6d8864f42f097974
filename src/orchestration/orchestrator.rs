//! Orchestrator driving a workflow end to end.
//!
//! The Orchestrator pulls runnable tasks from the [`WorkflowEngine`],
//! resolves an agent for each, executes the skill on the blocking pool and
//! feeds results back under the task's lease. Completed phases go through
//! their review gate before the next phase may start. Periodic health checks
//! run inside the same loop and their recovery actions are applied
//! immediately.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentRegistry, AgentRole, Invocation, PROGRESS_TOPIC};
use crate::config::Config;
use crate::core::{Artifact, ArtifactId, ArtifactStore, ArtifactType, Lease, ReviewOutcome, Task, TaskId};
use crate::error::{Error, Result};
use crate::message::{Message, MessageBus, Recipient};
use crate::permissions::{self, Permission};
use crate::skill::{LeaseAuthority, LeaseCheck, SkillInput};
use crate::state::Snapshot;
use crate::util;
use crate::workflow::{PhaseDecision, ReviewGate, ReviewRequest, WorkflowEngine};

use super::conflict::{nfr_text, resolution_artifact, Conflict, ConflictStrategy, KeywordStrategy};
use super::health::{HealthConfig, HealthMonitor, HealthReport, RecoveryAction, RecoveryKind, RetryTracker};
use super::progress::ProgressReport;

/// Bus identity of the orchestrator.
pub const ORCHESTRATOR: &str = "orchestrator";

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every phase is Complete.
    Completed,
    /// A phase hit its iteration limit and needs a manual reset.
    Blocked { phase: String },
    /// Nothing runnable and nothing in flight; these tasks failed.
    Stalled { failed_tasks: Vec<TaskId> },
    /// The cancellation token fired. In-flight tasks were released.
    Cancelled,
}

/// Lifecycle events for observers that prefer a channel over polling.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    TaskStarted { task: TaskId, agent: String },
    TaskCompleted { task: TaskId, artifact: ArtifactId },
    TaskFailed { task: TaskId, error: String },
    /// A late result from a released attempt was thrown away.
    StaleResult { task: TaskId, attempt: u32 },
    PhaseReviewed { phase: String, decision: PhaseDecision },
    RecoveryApplied(RecoveryAction),
}

/// Store writes made by a running skill are checked against the live
/// engine, so an execution that lost its task cannot touch shared state.
///
/// Only called from the blocking pool, where `blocking_read` is allowed.
impl LeaseAuthority for RwLock<WorkflowEngine> {
    fn while_held(&self, lease: &Lease, write: &mut dyn FnMut()) -> bool {
        let engine = self.blocking_read();
        if !engine.holds(lease) {
            return false;
        }
        write();
        true
    }
}

/// Result of one skill execution, tagged with the lease it ran under.
struct Execution {
    lease: Lease,
    agent: String,
    skill: String,
    result: Result<Artifact>,
}

pub struct Orchestrator {
    project: String,
    config: Config,
    registry: Arc<AgentRegistry>,
    store: Arc<ArtifactStore>,
    bus: Arc<MessageBus>,
    engine: Arc<RwLock<WorkflowEngine>>,
    /// Project-level input merged under every task's own input.
    input: SkillInput,
    strategy: Box<dyn ConflictStrategy>,
    monitor: HealthMonitor,
    retries: Mutex<RetryTracker>,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl Orchestrator {
    /// `store` and `bus` must be the ones the registry's agents were built with.
    pub fn new(
        config: Config,
        registry: Arc<AgentRegistry>,
        engine: WorkflowEngine,
        store: Arc<ArtifactStore>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let monitor = HealthMonitor::new(HealthConfig::from(&config.health));
        Self {
            project: engine.project().to_string(),
            config,
            registry,
            store,
            bus,
            engine: Arc::new(RwLock::new(engine)),
            input: SkillInput::new(),
            strategy: Box::new(KeywordStrategy::default()),
            monitor,
            retries: Mutex::new(RetryTracker::new()),
            events: None,
        }
    }

    pub fn with_input(mut self, input: SkillInput) -> Self {
        self.input = input;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: impl ConflictStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn engine(&self) -> Arc<RwLock<WorkflowEngine>> {
        Arc::clone(&self.engine)
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn retries(&self) -> std::sync::MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session for every agent that has no inbox yet.
    pub fn start_sessions(&self) -> usize {
        self.registry
            .names()
            .iter()
            .filter(|name| !self.bus.is_registered(name))
            .filter_map(|name| match self.registry.start_session(name) {
                Ok(_) => {
                    self.lifecycle("session_started", name, Map::new());
                    Some(())
                }
                Err(e) => {
                    tracing::warn!(agent = %name, error = %e, "failed to start agent session");
                    None
                }
            })
            .count()
    }

    /// Drive the workflow until it completes, blocks, stalls or is cancelled.
    ///
    /// `Err(ReviewRejected)` is returned when rejections are configured to
    /// abort the run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome> {
        tracing::info!(project = %self.project, "workflow run started");
        self.start_sessions();

        let period = Duration::from_secs(self.config.health.check_interval_secs.max(1));
        let mut health_tick = time::interval_at(time::Instant::now() + period, period);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut inflight: JoinSet<Execution> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancel_inflight(&mut inflight).await);
            }

            self.dispatch(&mut inflight).await?;

            let awaiting = self.engine.read().await.awaiting_review();
            if let Some(phase) = awaiting {
                self.review_phase(&phase).await?;
                continue;
            }

            if let Some(outcome) = self.settled(inflight.is_empty()).await {
                inflight.abort_all();
                tracing::info!(project = %self.project, ?outcome, "workflow run finished");
                return Ok(outcome);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.cancel_inflight(&mut inflight).await);
                }
                _ = health_tick.tick() => {
                    let report = self.check_health().await;
                    self.apply_recovery(&report).await?;
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    self.handle_execution(joined).await?;
                }
            }
        }
    }

    /// The run's outcome, if it cannot make further progress.
    async fn settled(&self, idle: bool) -> Option<RunOutcome> {
        let engine = self.engine.read().await;
        if engine.is_finished() {
            return Some(RunOutcome::Completed);
        }
        if let Some(phase) = engine.run().blocked_phase() {
            return Some(RunOutcome::Blocked {
                phase: phase.to_string(),
            });
        }
        if idle && engine.in_progress_tasks().is_empty() && engine.runnable().is_empty() {
            return Some(RunOutcome::Stalled {
                failed_tasks: engine.failed_tasks().iter().map(|t| t.id).collect(),
            });
        }
        None
    }

    async fn cancel_inflight(&self, inflight: &mut JoinSet<Execution>) -> RunOutcome {
        let mut engine = self.engine.write().await;
        let running: Vec<TaskId> = engine.in_progress_tasks().iter().map(|t| t.id).collect();
        for id in &running {
            if let Err(e) = engine.release_task(id) {
                tracing::warn!(task = %id.short(), error = %e, "failed to release task on cancel");
            }
        }
        inflight.abort_all();
        tracing::info!(project = %self.project, released = running.len(), "workflow run cancelled");
        RunOutcome::Cancelled
    }

    /// The agent that should run a task: its assigned agent when that agent
    /// owns the skill, otherwise whatever the routing table picks.
    fn resolve_agent(&self, task: &Task) -> Result<Arc<Agent>> {
        if !task.agent.is_empty() {
            if let Some(agent) = self.registry.get(&task.agent).filter(|a| a.has_skill(&task.skill)) {
                return Ok(agent);
            }
        }
        self.registry.route(&task.skill)
    }

    fn task_input(&self, task: &Task) -> SkillInput {
        let mut input = self.input.clone();
        input.extend(task.input.clone());
        input
    }

    /// Start runnable tasks up to the concurrency limit.
    async fn dispatch(&self, inflight: &mut JoinSet<Execution>) -> Result<usize> {
        let mut engine = self.engine.write().await;
        let limit = self.config.workflow.max_concurrent_tasks.max(1);
        let capacity = limit.saturating_sub(engine.in_progress_tasks().len());
        let mut dispatched = 0;

        for task in engine.runnable().into_iter().take(capacity) {
            let agent = match self.resolve_agent(&task) {
                Ok(agent) => agent,
                Err(e) => {
                    let lease = engine.start_task(&task.id)?;
                    engine.fail_task(&lease, &e.to_string())?;
                    tracing::error!(task = %task.id.short(), skill = %task.skill, error = %e, "task unroutable");
                    self.emit(OrchestratorEvent::TaskFailed {
                        task: task.id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if task.agent != agent.name() {
                engine.assign(&task.id, agent.name())?;
            }
            let lease = engine.start_task(&task.id)?;
            self.registry.note_assigned(agent.name());
            self.bus.publish(Message::notification(
                ORCHESTRATOR,
                Recipient::Agent(agent.name().to_string()),
                json!({
                    "event": "task_assigned",
                    "task_id": task.id,
                    "phase": task.phase,
                    "skill": task.skill,
                    "attempt": lease.attempt,
                }),
            ));
            tracing::info!(task = %task.id.short(), agent = agent.name(), skill = %task.skill, attempt = lease.attempt, "task dispatched");
            self.emit(OrchestratorEvent::TaskStarted {
                task: task.id,
                agent: agent.name().to_string(),
            });

            let input = self.task_input(&task);
            let authority: Arc<dyn LeaseAuthority> = self.engine.clone();
            let invocation = Invocation::new(&self.project)
                .with_parameters(task.input.clone())
                .with_feedback(task.feedback.clone())
                .under_lease(LeaseCheck::new(lease, authority));
            let skill = task.skill.clone();
            inflight.spawn(async move {
                let name = agent.name().to_string();
                let runner = Arc::clone(&agent);
                let skill_name = skill.clone();
                let result =
                    util::blocking(move || runner.run_skill(&skill_name, &input, &invocation)).await;
                Execution {
                    lease,
                    agent: name,
                    skill,
                    result,
                }
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Apply an execution result if its lease is still current.
    async fn handle_execution(&self, joined: std::result::Result<Execution, JoinError>) -> Result<()> {
        let execution = match joined {
            Ok(execution) => execution,
            Err(e) => {
                tracing::debug!(error = %e, "execution aborted");
                return Ok(());
            }
        };
        let Execution {
            lease,
            agent,
            skill,
            result,
        } = execution;
        self.registry.note_finished(&agent);

        let mut engine = self.engine.write().await;
        if !engine.holds(&lease) {
            tracing::warn!(task = %lease.task.short(), attempt = lease.attempt, agent = %agent, "discarding stale result");
            self.emit(OrchestratorEvent::StaleResult {
                task: lease.task,
                attempt: lease.attempt,
            });
            return Ok(());
        }

        let mut details = Map::new();
        details.insert("task_id".to_string(), json!(lease.task));
        details.insert("skill".to_string(), json!(skill));
        match result {
            Ok(artifact) => {
                let stored = self.store.put(artifact);
                engine.complete_task(&lease, stored.id)?;
                self.retries().reset(&lease.task);
                tracing::info!(task = %lease.task.short(), agent = %agent, artifact_type = %stored.artifact_type, version = stored.version, "task completed");
                details.insert("artifact_id".to_string(), json!(stored.id));
                self.lifecycle("task_completed", &agent, details);
                self.emit(OrchestratorEvent::TaskCompleted {
                    task: lease.task,
                    artifact: stored.id,
                });
            }
            Err(e) => {
                engine.fail_task(&lease, &e.to_string())?;
                tracing::error!(project = %self.project, task = %lease.task.short(), agent = %agent, skill = %skill, error = %e, "task failed");
                details.insert("error".to_string(), json!(e.to_string()));
                self.lifecycle("task_failed", &agent, details);
                self.emit(OrchestratorEvent::TaskFailed {
                    task: lease.task,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Report an agent's lifecycle event on the progress topic.
    ///
    /// Sent as the orchestrator and never addressed to the agent, so it does
    /// not count as the agent communicating.
    fn lifecycle(&self, event: &str, agent: &str, mut details: Map<String, Value>) {
        details.insert("event".to_string(), json!(event));
        details.insert("agent".to_string(), json!(agent));
        self.bus.publish(Message::notification(
            ORCHESTRATOR,
            Recipient::Topic(PROGRESS_TOPIC.to_string()),
            Value::Object(details),
        ));
    }

    /// Run the gate of a task-complete phase and apply its verdict.
    ///
    /// A gate that errors or returns a malformed verdict blocks the phase
    /// with the error recorded on it; see `WorkflowEngine::record_gate_failure`.
    pub async fn review_phase(&self, phase: &str) -> Result<PhaseDecision> {
        let request = self.engine.write().await.begin_review(phase, &self.store)?;
        let (outcome, feedback_id) = match &request.gate {
            None => (ReviewOutcome::approve("no review gate"), None),
            Some(gate) => match self.run_gate(&request, gate).await {
                Ok((outcome, feedback)) => (outcome, Some(feedback)),
                Err(e) => return self.gate_failed(phase, gate, e).await,
            },
        };

        let decision = self
            .engine
            .write()
            .await
            .record_review(phase, &outcome, &self.store)?;
        tracing::info!(phase, ?decision, "phase reviewed");
        self.bus.publish(Message::notification(
            ORCHESTRATOR,
            Recipient::Topic(PROGRESS_TOPIC.to_string()),
            json!({
                "event": "phase_reviewed",
                "phase": phase,
                "approved": outcome.approved,
                "issues": outcome.issues.len(),
            }),
        ));
        self.emit(OrchestratorEvent::PhaseReviewed {
            phase: phase.to_string(),
            decision: decision.clone(),
        });

        if let PhaseDecision::Rejected { issues } = &decision {
            let artifact_id = request
                .target
                .as_ref()
                .map(|a| a.id)
                .or(feedback_id);
            return Err(Error::ReviewRejected {
                project: self.project.clone(),
                phase: phase.to_string(),
                artifact_id,
                issues: issues.len(),
            });
        }
        Ok(decision)
    }

    async fn gate_failed(&self, phase: &str, gate: &ReviewGate, error: Error) -> Result<PhaseDecision> {
        let message = format!("gate '{}' failed: {}", gate.skill, error);
        let decision = self
            .engine
            .write()
            .await
            .record_gate_failure(phase, &message)?;
        self.bus.publish(Message::notification(
            ORCHESTRATOR,
            Recipient::Topic(PROGRESS_TOPIC.to_string()),
            json!({ "event": "review_failed", "phase": phase, "error": message }),
        ));
        self.emit(OrchestratorEvent::PhaseReviewed {
            phase: phase.to_string(),
            decision: decision.clone(),
        });
        Ok(decision)
    }

    fn gate_agent(&self, gate: &ReviewGate) -> Result<Arc<Agent>> {
        if !gate.agent.is_empty() {
            if let Some(agent) = self.registry.get(&gate.agent).filter(|a| a.has_skill(&gate.skill)) {
                return Ok(agent);
            }
        }
        self.registry.route(&gate.skill)
    }

    /// Execute a gate skill and store its feedback.
    async fn run_gate(&self, request: &ReviewRequest, gate: &ReviewGate) -> Result<(ReviewOutcome, ArtifactId)> {
        let agent = self.gate_agent(gate)?;
        let target = request.target.as_ref();

        let mut input = self.input.clone();
        input.insert("phase".to_string(), json!(request.phase));
        input.insert("target_artifact_id".to_string(), json!(target.map(|a| a.id)));
        input.insert(
            "target_artifact_type".to_string(),
            json!(target.map(|a| a.artifact_type).or(gate.target)),
        );
        let invocation = Invocation::new(&self.project)
            .with_parameters(input.clone())
            .for_review(target.map(|a| a.id));

        self.bus.publish(Message::notification(
            ORCHESTRATOR,
            Recipient::Agent(agent.name().to_string()),
            json!({ "event": "review_requested", "phase": request.phase, "skill": gate.skill }),
        ));

        let runner = Arc::clone(&agent);
        let skill = gate.skill.clone();
        let feedback = util::blocking(move || runner.run_skill(&skill, &input, &invocation)).await?;

        let round = {
            let engine = self.engine.read().await;
            engine
                .run()
                .phase(&request.phase)
                .map(|p| p.review_rounds + 1)
                .unwrap_or(1)
        };
        let mut feedback = feedback
            .with_metadata("phase", request.phase.as_str())
            .with_metadata("review_round", round);
        if let Some(target) = target {
            feedback = feedback.with_metadata("target_artifact_id", target.id.to_string());
        }
        let stored = self.store.put(feedback);
        let outcome = ReviewOutcome::from_artifact(&stored, &self.project, &gate.skill)?;
        tracing::debug!(phase = %request.phase, gate = %gate.skill, approved = outcome.approved, round, "gate evaluated");
        Ok((outcome, stored.id))
    }

    /// Current progress, computed without blocking execution.
    pub async fn progress_report(&self) -> ProgressReport {
        let engine = self.engine.read().await;
        ProgressReport::build(&engine, &self.store, &self.registry)
    }

    /// Store the current progress report as a progress_report artifact.
    pub async fn record_progress_report(&self) -> Result<Artifact> {
        let report = self.progress_report().await;
        let artifact = Artifact::new(ArtifactType::ProgressReport, serde_json::to_value(&report)?, ORCHESTRATOR)
            .with_metadata("project_name", self.project.as_str());
        Ok(self.store.put(artifact))
    }

    /// Decide a batch of conflicts and record them as review feedback.
    pub fn resolve_conflicts(&self, role: AgentRole, conflicts: &[Conflict]) -> Result<Artifact> {
        permissions::check(role, Permission::ResolveConflict, &self.project)?;
        let nfrs = nfr_text(&self.store);
        let resolutions: Vec<_> = conflicts
            .iter()
            .map(|c| self.strategy.resolve(c, &nfrs))
            .collect();
        tracing::info!(project = %self.project, strategy = self.strategy.name(), conflicts = conflicts.len(), "conflicts resolved");
        Ok(self
            .store
            .put(resolution_artifact(&resolutions, &self.project, role.as_str())))
    }

    pub async fn reset_phase(&self, phase: &str, role: AgentRole) -> Result<()> {
        self.engine.write().await.reset_phase(phase, role)
    }

    pub async fn check_health(&self) -> HealthReport {
        let engine = self.engine.read().await;
        self.monitor
            .check(&self.registry.names(), &engine, &self.bus, Utc::now())
    }

    /// Apply a report's recovery actions in order and return those applied.
    ///
    /// A stuck agent's tasks are released and handed to another agent of
    /// the same role when one exists. A task reassigned more than
    /// `max_retries` times is failed instead.
    pub async fn apply_recovery(&self, report: &HealthReport) -> Result<Vec<RecoveryAction>> {
        let mut applied = Vec::new();
        for action in &report.recovery_actions {
            match action.action {
                RecoveryKind::Restart => {
                    if let Err(e) = self.registry.start_session(&action.agent) {
                        tracing::warn!(agent = %action.agent, error = %e, "restart failed");
                        continue;
                    }
                    self.lifecycle("session_restarted", &action.agent, Map::new());
                }
                RecoveryKind::InterruptAndReassign => {
                    let mut engine = self.engine.write().await;
                    for id in &action.tasks {
                        self.reassign(&mut engine, id, &action.agent)?;
                    }
                }
            }
            tracing::info!(agent = %action.agent, action = %action.action, reason = %action.reason, "recovery applied");
            self.emit(OrchestratorEvent::RecoveryApplied(action.clone()));
            applied.push(action.clone());
        }
        Ok(applied)
    }

    fn reassign(&self, engine: &mut WorkflowEngine, id: &TaskId, from: &str) -> Result<()> {
        let Some(task) = engine.task(id).filter(|t| t.is_in_progress()).cloned() else {
            return Ok(());
        };
        let max_retries = self.monitor.config().max_retries;
        let attempts = self.retries().increment(id);
        if attempts > max_retries {
            engine.abort_task(id, &format!("abandoned after {} reassignments", max_retries))?;
            tracing::error!(task = %id.short(), agent = from, attempts, "task abandoned");
            self.emit(OrchestratorEvent::TaskFailed {
                task: *id,
                error: format!("abandoned after {} reassignments", max_retries),
            });
            return Ok(());
        }

        engine.release_task(id)?;
        match self.registry.route_alternate(&task.skill, from) {
            Some(alternate) => {
                engine.assign(id, alternate.name())?;
                tracing::info!(task = %id.short(), from, to = alternate.name(), attempts, "task reassigned");
            }
            None => {
                tracing::warn!(task = %id.short(), agent = from, attempts, "no alternate agent, task requeued");
            }
        }
        Ok(())
    }

    /// Persistable state of the run.
    pub async fn snapshot(&self) -> Snapshot {
        let engine = self.engine.read().await;
        Snapshot::capture(&self.project, &self.store, engine.run())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.project)
            .field("agents", &self.registry.len())
            .field("artifacts", &self.store.len())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
