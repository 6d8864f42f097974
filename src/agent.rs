//! Agents, their roles, and the explicit skill routing registry.
//!
//! An `Agent` owns a fixed set of skills and executes them against the
//! shared artifact store. The `AgentRegistry` is built once at startup and
//! handed to the orchestrator; it maps every skill name to the agents that
//! can run it and picks one according to a `RoutingStrategy`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use crate::core::{Artifact, ArtifactId, ArtifactStore, ReviewIssue};
use crate::message::{Inbox, Message, MessageBus, MessageKind, Recipient};
use crate::skill::{LeaseCheck, Skill, SkillContext, SkillInput};
use crate::{util, Error, Result};

/// Topic every agent reports lifecycle and task events on.
pub const PROGRESS_TOPIC: &str = "progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ProductManager,
    Architect,
    Developer,
    QaEngineer,
    TeamLead,
    ProjectManager,
    Reviewer,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::ProductManager,
        AgentRole::Architect,
        AgentRole::Developer,
        AgentRole::QaEngineer,
        AgentRole::TeamLead,
        AgentRole::ProjectManager,
        AgentRole::Reviewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::ProductManager => "product_manager",
            AgentRole::Architect => "architect",
            AgentRole::Developer => "developer",
            AgentRole::QaEngineer => "qa_engineer",
            AgentRole::TeamLead => "team_lead",
            AgentRole::ProjectManager => "project_manager",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call execution details beyond the skill input itself.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub project: String,
    pub parameters: SkillInput,
    pub feedback: Vec<ReviewIssue>,
    /// Set when the skill runs as a review gate over this artifact.
    pub review_target: Option<ArtifactId>,
    /// Set when the skill runs for a leased task attempt.
    pub lease: Option<LeaseCheck>,
}

impl Invocation {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Self::default()
        }
    }

    pub fn with_parameters(mut self, parameters: SkillInput) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_feedback(mut self, feedback: Vec<ReviewIssue>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn for_review(mut self, target: Option<ArtifactId>) -> Self {
        self.review_target = target;
        self
    }

    pub fn under_lease(mut self, check: LeaseCheck) -> Self {
        self.lease = Some(check);
        self
    }
}

pub struct Agent {
    name: String,
    role: AgentRole,
    skills: HashMap<String, Arc<dyn Skill>>,
    store: Arc<ArtifactStore>,
    bus: Arc<MessageBus>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("skills", &self.skill_names())
            .finish()
    }
}

impl Agent {
    pub fn new(name: &str, role: AgentRole, store: Arc<ArtifactStore>, bus: Arc<MessageBus>) -> Self {
        Self {
            name: name.to_string(),
            role,
            skills: HashMap::new(),
            store,
            bus,
        }
    }

    pub fn with_skill(mut self, skill: impl Skill + 'static) -> Self {
        self.register_skill(Arc::new(skill));
        self
    }

    pub fn register_skill(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn has_skill(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    pub fn skill(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    /// Skill names, sorted.
    pub fn skill_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and run a skill, returning its artifact without storing it.
    ///
    /// Blocking: call from the blocking pool (see `util::blocking`).
    pub fn run_skill(&self, name: &str, input: &SkillInput, invocation: &Invocation) -> Result<Artifact> {
        let skill = self.skill(name).ok_or_else(|| Error::SkillNotFound {
            agent: self.name.clone(),
            skill: name.to_string(),
        })?;

        let errors = skill.validate(input);
        if !errors.is_empty() {
            return Err(Error::Validation {
                project: invocation.project.clone(),
                skill: name.to_string(),
                message: errors.join("; "),
            });
        }
        if let Some(missing) = skill
            .required_artifacts()
            .into_iter()
            .find(|t| self.store.latest(*t).is_none())
        {
            return Err(Error::MissingArtifact {
                project: invocation.project.clone(),
                skill: name.to_string(),
                artifact_type: missing,
            });
        }

        let ctx = SkillContext::new(
            Arc::clone(&self.store),
            &invocation.project,
            &self.name,
            self.role,
            skill.as_ref(),
        )
        .with_bus(Arc::clone(&self.bus))
        .with_parameters(invocation.parameters.clone())
        .with_feedback(invocation.feedback.clone())
        .for_review(invocation.review_target)
        .under_lease(invocation.lease.clone());

        tracing::debug!(agent = %self.name, skill = name, project = %invocation.project, "executing skill");
        let mut artifact = skill.execute(input, &ctx)?;

        if artifact.artifact_type != skill.output_type() {
            return Err(Error::Validation {
                project: invocation.project.clone(),
                skill: name.to_string(),
                message: format!(
                    "returned a {} artifact, declared output is {}",
                    artifact.artifact_type,
                    skill.output_type()
                ),
            });
        }
        if artifact.producer.is_empty() {
            artifact.producer = self.name.clone();
        }
        Ok(artifact)
    }

    /// Run a skill and store its artifact.
    pub fn execute_skill(&self, name: &str, input: &SkillInput, project: &str) -> Result<Artifact> {
        let artifact = self.run_skill(name, input, &Invocation::new(project))?;
        Ok(self.store.put(artifact))
    }

    /// Ask a peer to run one of its skills over the bus.
    pub async fn request_skill(
        &self,
        peer: &str,
        name: &str,
        input: SkillInput,
        project: &str,
    ) -> Result<Artifact> {
        self.bus.request(&self.name, peer, name, input, project).await
    }

    /// Report on the progress topic under this agent's own name.
    ///
    /// Coordinators report through their own identity instead, so that the
    /// history only credits an agent with messages it really sent.
    pub fn announce(&self, event: &str, mut details: Map<String, Value>) -> usize {
        details.insert("event".to_string(), json!(event));
        self.bus.publish(Message::notification(
            &self.name,
            Recipient::Topic(PROGRESS_TOPIC.to_string()),
            Value::Object(details),
        ))
    }

    /// Consume the inbox until it closes, answering skill Requests.
    pub async fn serve(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(message) = inbox.recv().await {
            match message.kind {
                MessageKind::Request => {
                    let payload = match Arc::clone(&self).handle_request(&message).await {
                        Ok(artifact) => json!({ "status": "success", "artifact": artifact }),
                        Err(e) => {
                            tracing::warn!(agent = %self.name, sender = %message.sender, error = %e, "request failed");
                            json!({ "status": "error", "error": e.to_string() })
                        }
                    };
                    self.bus.publish(message.reply(payload));
                }
                kind => {
                    tracing::trace!(agent = %self.name, sender = %message.sender, ?kind, "inbox message");
                }
            }
        }
        tracing::debug!(agent = %self.name, "inbox closed");
    }

    async fn handle_request(self: Arc<Self>, message: &Message) -> Result<Artifact> {
        let payload = &message.payload;
        let skill = payload
            .get("skill")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let project = payload
            .get("project")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input = payload
            .get("input")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        util::blocking(move || self.execute_skill(&skill, &input, &project)).await
    }
}

/// How to pick among several agents able to run the same skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    /// Fewest currently assigned tasks wins; ties go to the earliest registered.
    LoadBased,
}

/// Explicit roster of agents plus the skill routing table.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<Agent>>,
    routes: HashMap<String, Vec<usize>>,
    strategy: RoutingStrategy,
    cursors: Mutex<HashMap<String, usize>>,
    load: Mutex<HashMap<String, usize>>,
}

impl AgentRegistry {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Add an agent and route all of its skills to it.
    ///
    /// Registering a name twice replaces the earlier agent.
    pub fn register(&mut self, agent: Agent) -> Arc<Agent> {
        let agent = Arc::new(agent);
        match self.agents.iter().position(|a| a.name == agent.name) {
            Some(idx) => self.agents[idx] = Arc::clone(&agent),
            None => self.agents.push(Arc::clone(&agent)),
        }
        self.rebuild_routes();
        agent
    }

    fn rebuild_routes(&mut self) {
        self.routes.clear();
        for (idx, agent) in self.agents.iter().enumerate() {
            for skill in agent.skill_names() {
                self.routes.entry(skill).or_default().push(idx);
            }
        }
    }

    fn load_guard(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.load.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.name == name).cloned()
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents able to run `skill`, in registration order.
    pub fn candidates(&self, skill: &str) -> Vec<Arc<Agent>> {
        self.routes
            .get(skill)
            .map(|idxs| idxs.iter().map(|i| Arc::clone(&self.agents[*i])).collect())
            .unwrap_or_default()
    }

    /// Pick the agent that should run `skill`.
    pub fn route(&self, skill: &str) -> Result<Arc<Agent>> {
        let candidates = self.candidates(skill);
        if candidates.is_empty() {
            return Err(Error::NoRoute(skill.to_string()));
        }
        let chosen = match self.strategy {
            RoutingStrategy::RoundRobin => {
                let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
                let cursor = cursors.entry(skill.to_string()).or_insert(0);
                let idx = *cursor % candidates.len();
                *cursor += 1;
                Arc::clone(&candidates[idx])
            }
            RoutingStrategy::LoadBased => self.least_loaded(candidates).ok_or_else(|| Error::NoRoute(skill.to_string()))?,
        };
        Ok(chosen)
    }

    /// Another agent of the same role as `exclude` that can run `skill`.
    pub fn route_alternate(&self, skill: &str, exclude: &str) -> Option<Arc<Agent>> {
        let role = self.get(exclude)?.role;
        let candidates = self
            .candidates(skill)
            .into_iter()
            .filter(|a| a.role == role && a.name != exclude)
            .collect();
        self.least_loaded(candidates)
    }

    fn least_loaded(&self, candidates: Vec<Arc<Agent>>) -> Option<Arc<Agent>> {
        let load = self.load_guard();
        candidates
            .into_iter()
            .enumerate()
            .min_by_key(|(i, a)| (load.get(&a.name).copied().unwrap_or(0), *i))
            .map(|(_, a)| a)
    }

    pub fn note_assigned(&self, agent: &str) {
        *self.load_guard().entry(agent.to_string()).or_insert(0) += 1;
    }

    pub fn note_finished(&self, agent: &str) {
        if let Some(count) = self.load_guard().get_mut(agent) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn load_of(&self, agent: &str) -> usize {
        self.load_guard().get(agent).copied().unwrap_or(0)
    }

    /// (Re)create the agent's inbox and spawn its serve loop.
    ///
    /// Publishes nothing: a fresh session is not evidence that the agent is
    /// alive. Must be called from within a tokio runtime.
    pub fn start_session(&self, name: &str) -> Result<JoinHandle<()>> {
        let agent = self.get(name).ok_or_else(|| Error::AgentNotFound(name.to_string()))?;
        let inbox = agent.bus.register(&agent.name);
        let handle = tokio::spawn(Arc::clone(&agent).serve(inbox));
        tracing::info!(agent = name, "agent session started");
        Ok(handle)
    }

    /// Start a session for every registered agent.
    pub fn start_sessions(&self) -> Vec<JoinHandle<()>> {
        self.agents
            .iter()
            .filter_map(|a| self.start_session(&a.name).ok())
            .collect()
    }
}
