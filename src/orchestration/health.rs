//! Health monitoring for agents.
//!
//! The `HealthMonitor` infers liveness without heartbeats, from the message
//! bus history and the task statuses held by the workflow engine:
//!
//! - **Crash detection**: a registered agent that never appears in the
//!   message history (as sender or direct receiver) is crashed. The
//!   recommended action is `restart`.
//! - **Stuck detection**: an agent holding at least one InProgress task whose
//!   most recent message is older than the stuck threshold is stuck. The
//!   recommended action is `interrupt_and_reassign`.
//!
//! Both checks feed a 0-100 health score:
//! `max(0, 100 - 10*blocked - 5*overdue - 20*crashed - 15*stuck)`.
//!
//! Reports are recomputed on demand and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::config::HealthSettings;
use crate::core::TaskId;
use crate::message::MessageBus;
use crate::workflow::WorkflowEngine;

/// Default time without activity before an agent is considered stuck.
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 300; // 5 minutes

/// Default run time after which an InProgress task counts as overdue.
pub const DEFAULT_OVERDUE_THRESHOLD_SECS: u64 = 3600;

/// Default maximum number of reassignments before giving up on a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Reason reported for agents with no communication record.
pub const NO_MESSAGE_ACTIVITY: &str = "no_message_activity";

/// Configuration for health monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Silence after which an agent with work in flight is considered stuck.
    pub stuck_threshold: Duration,
    /// Run time after which an InProgress task is overdue.
    pub overdue_threshold: Duration,
    /// Maximum number of reassignments before a task is failed.
    pub max_retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::from_secs(DEFAULT_STUCK_THRESHOLD_SECS),
            overdue_threshold: Duration::from_secs(DEFAULT_OVERDUE_THRESHOLD_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl HealthConfig {
    /// Create a new health config with the specified stuck threshold.
    pub fn with_stuck_threshold(threshold: Duration) -> Self {
        Self {
            stuck_threshold: threshold,
            ..Default::default()
        }
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            stuck_threshold: Duration::from_secs(settings.stuck_threshold_secs),
            overdue_threshold: Duration::from_secs(settings.overdue_threshold_secs),
            max_retries: settings.max_retries,
        }
    }
}

/// Score band of a health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Score of 70 or more.
    Healthy,
    /// Score between 40 and 69.
    AtRisk,
    /// Score below 40.
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: u32) -> Self {
        match score {
            70.. => HealthStatus::Healthy,
            40..=69 => HealthStatus::AtRisk,
            _ => HealthStatus::Critical,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::AtRisk => write!(f, "at_risk"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Compute the health score from issue counts.
///
/// # Example
///
/// ```
/// use conductor::orchestration::health_score;
///
/// assert_eq!(health_score(1, 1, 1, 0), 65);
/// assert_eq!(health_score(0, 0, 0, 0), 100);
/// assert_eq!(health_score(0, 0, 5, 5), 0);
/// ```
pub fn health_score(blocked: usize, overdue: usize, crashed: usize, stuck: usize) -> u32 {
    let penalty = 10 * blocked + 5 * overdue + 20 * crashed + 15 * stuck;
    100usize.saturating_sub(penalty) as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashedAgent {
    pub agent: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckAgent {
    pub agent: String,
    pub idle_seconds: i64,
    /// InProgress tasks held by the agent.
    pub tasks: Vec<TaskId>,
}

/// Recovery actions for unhealthy agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Reinitialize the agent's session.
    Restart,
    /// Requeue the agent's tasks for another agent of the same role.
    InterruptAndReassign,
}

impl std::fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryKind::Restart => write!(f, "restart"),
            RecoveryKind::InterruptAndReassign => write!(f, "interrupt_and_reassign"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub agent: String,
    pub action: RecoveryKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskId>,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub health_score: u32,
    pub health_status: HealthStatus,
    pub crashed_agents: Vec<CrashedAgent>,
    pub stuck_agents: Vec<StuckAgent>,
    /// Restarts first, then reassignments.
    pub recovery_actions: Vec<RecoveryAction>,
    pub blocked_tasks: usize,
    pub overdue_tasks: usize,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.health_status == HealthStatus::Healthy
    }
}

/// Tracks reassignment counts per task for recovery decisions.
///
/// # Example
///
/// ```
/// use conductor::core::TaskId;
/// use conductor::orchestration::RetryTracker;
///
/// let mut tracker = RetryTracker::new();
/// let task_id = TaskId::new();
///
/// assert_eq!(tracker.get_retries(&task_id), 0);
/// tracker.increment(&task_id);
/// assert_eq!(tracker.get_retries(&task_id), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Increment the retry count for a task, returning the new count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(*task_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}

/// Liveness inference over the agent roster.
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Registered agents that never sent or directly received a message.
    pub fn detect_crashed(&self, agents: &[String], bus: &MessageBus) -> Vec<CrashedAgent> {
        agents
            .iter()
            .filter(|agent| bus.last_activity(agent).is_none())
            .map(|agent| CrashedAgent {
                agent: agent.clone(),
                reason: NO_MESSAGE_ACTIVITY.to_string(),
            })
            .collect()
    }

    /// Agents holding InProgress tasks that have been silent too long.
    ///
    /// Silence is measured from the agent's newest message, or from the
    /// earliest start of its running tasks when it has none.
    pub fn detect_stuck(
        &self,
        engine: &WorkflowEngine,
        bus: &MessageBus,
        now: DateTime<Utc>,
    ) -> Vec<StuckAgent> {
        let mut holding: BTreeMap<String, Vec<(TaskId, Option<DateTime<Utc>>)>> = BTreeMap::new();
        for task in engine.in_progress_tasks() {
            holding
                .entry(task.agent.clone())
                .or_default()
                .push((task.id, task.started_at));
        }

        let threshold = self.config.stuck_threshold.as_secs() as i64;
        holding
            .into_iter()
            .filter_map(|(agent, tasks)| {
                let since = bus
                    .last_activity(&agent)
                    .or_else(|| tasks.iter().filter_map(|(_, started)| *started).min())?;
                let idle_seconds = (now - since).num_seconds();
                (idle_seconds > threshold).then(|| StuckAgent {
                    agent,
                    idle_seconds,
                    tasks: tasks.into_iter().map(|(id, _)| id).collect(),
                })
            })
            .collect()
    }

    /// InProgress tasks running longer than the overdue threshold.
    pub fn overdue_tasks(&self, engine: &WorkflowEngine, now: DateTime<Utc>) -> Vec<TaskId> {
        let threshold = self.config.overdue_threshold.as_secs() as i64;
        engine
            .in_progress_tasks()
            .into_iter()
            .filter(|t| t.running_for(now).is_some_and(|secs| secs > threshold))
            .map(|t| t.id)
            .collect()
    }

    /// Run both liveness checks and score the result.
    pub fn check(
        &self,
        agents: &[String],
        engine: &WorkflowEngine,
        bus: &MessageBus,
        now: DateTime<Utc>,
    ) -> HealthReport {
        let crashed_agents = self.detect_crashed(agents, bus);
        let stuck_agents = self.detect_stuck(engine, bus, now);
        let blocked_tasks = engine.blocked_tasks().len();
        let overdue_tasks = self.overdue_tasks(engine, now).len();

        let mut recovery_actions: Vec<RecoveryAction> = crashed_agents
            .iter()
            .map(|c| RecoveryAction {
                agent: c.agent.clone(),
                action: RecoveryKind::Restart,
                reason: c.reason.clone(),
                tasks: Vec::new(),
            })
            .collect();
        recovery_actions.extend(stuck_agents.iter().map(|s| RecoveryAction {
            agent: s.agent.clone(),
            action: RecoveryKind::InterruptAndReassign,
            reason: format!("idle for {}s while holding {} task(s)", s.idle_seconds, s.tasks.len()),
            tasks: s.tasks.clone(),
        }));

        let health_score = health_score(
            blocked_tasks,
            overdue_tasks,
            crashed_agents.len(),
            stuck_agents.len(),
        );

        let mut risk_factors = Vec::new();
        let mut recommendations = Vec::new();
        if blocked_tasks > 0 {
            risk_factors.push(format!("{} blocked task(s)", blocked_tasks));
            recommendations.push("Resolve failed tasks or reset blocked phases".to_string());
        }
        for (phase, error) in engine.failed_reviews() {
            risk_factors.push(format!("review of phase '{}' failed: {}", phase, error));
            recommendations.push(format!("Fix the review gate of '{}' and reset the phase", phase));
        }
        if let Some(phase) = engine.run().blocked_phase() {
            let gate_failed = engine.run().phase(phase).is_some_and(|p| p.gate_error.is_some());
            if !gate_failed {
                risk_factors.push(format!(
                    "phase '{}' blocked after {} review iteration(s)",
                    phase,
                    engine.iteration_count(phase)
                ));
            }
        }
        if overdue_tasks > 0 {
            risk_factors.push(format!("{} overdue task(s)", overdue_tasks));
            recommendations.push("Review scope or capacity for long-running tasks".to_string());
        }
        if !crashed_agents.is_empty() {
            let names: Vec<&str> = crashed_agents.iter().map(|c| c.agent.as_str()).collect();
            risk_factors.push(format!("crashed agent(s): {}", names.join(", ")));
            recommendations.push("Restart crashed agent sessions".to_string());
        }
        if !stuck_agents.is_empty() {
            let names: Vec<&str> = stuck_agents.iter().map(|s| s.agent.as_str()).collect();
            risk_factors.push(format!("stuck agent(s): {}", names.join(", ")));
            recommendations.push("Reassign work held by stuck agents".to_string());
        }

        let health_status = HealthStatus::from_score(health_score);
        if health_status != HealthStatus::Healthy {
            tracing::warn!(
                health_score,
                %health_status,
                crashed = crashed_agents.len(),
                stuck = stuck_agents.len(),
                blocked_tasks,
                overdue_tasks,
                "team health degraded"
            );
        }

        HealthReport {
            health_score,
            health_status,
            crashed_agents,
            stuck_agents,
            recovery_actions,
            blocked_tasks,
            overdue_tasks,
            risk_factors,
            recommendations,
            checked_at: now,
        }
    }
}
