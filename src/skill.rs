//! Skill contract: the pluggable unit of work an agent executes.
//!
//! A skill is a blocking function `(input, context) -> Artifact`. How it
//! computes its content is its own business; the engine only relies on the
//! declared output type, the required inputs and the returned artifact.
//! Skills always run on the blocking pool, never on a runtime worker.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::agent::AgentRole;
use crate::core::{Artifact, ArtifactId, ArtifactStatus, ArtifactStore, ArtifactType, Lease, ReviewIssue};
use crate::message::{Message, MessageBus, Recipient};
use crate::permissions::{self, Permission};
use crate::{Error, Result};

/// Free-form skill input.
pub type SkillInput = Map<String, Value>;

pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// The only artifact type this skill may write.
    fn output_type(&self) -> ArtifactType;

    /// Input keys that must be present and non-null.
    fn required_inputs(&self) -> &[&'static str] {
        &[]
    }

    /// Artifact types that must already be stored before execution.
    fn required_artifacts(&self) -> Vec<ArtifactType> {
        Vec::new()
    }

    /// Validation errors for `input`; empty when the input is acceptable.
    fn validate(&self, input: &SkillInput) -> Vec<String> {
        missing_fields(input, self.required_inputs())
    }

    fn execute(&self, input: &SkillInput, ctx: &SkillContext) -> Result<Artifact>;
}

/// Names of `required` keys that are absent or null in `input`.
pub fn missing_fields(input: &SkillInput, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|key| input.get(**key).map_or(true, Value::is_null))
        .map(|key| format!("missing required field '{}'", key))
        .collect()
}

/// Knows which attempt of a task currently owns it.
pub trait LeaseAuthority: Send + Sync {
    /// Run `write` only while `lease` is current, keeping it current for the
    /// duration. Returns false, without running `write`, for a stale lease.
    fn while_held(&self, lease: &Lease, write: &mut dyn FnMut()) -> bool;
}

/// The lease a task execution runs under, plus the authority that can
/// revoke it.
#[derive(Clone)]
pub struct LeaseCheck {
    lease: Lease,
    authority: Arc<dyn LeaseAuthority>,
}

impl LeaseCheck {
    pub fn new(lease: Lease, authority: Arc<dyn LeaseAuthority>) -> Self {
        Self { lease, authority }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

impl std::fmt::Debug for LeaseCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCheck").field("lease", &self.lease).finish()
    }
}

#[derive(Clone)]
struct BusLink {
    bus: Arc<MessageBus>,
    runtime: Option<Handle>,
}

/// What a running skill may see and touch.
pub struct SkillContext {
    store: Arc<ArtifactStore>,
    bus: Option<BusLink>,
    project: String,
    agent: String,
    role: AgentRole,
    skill: String,
    output_type: ArtifactType,
    parameters: SkillInput,
    feedback: Vec<ReviewIssue>,
    review_target: Option<ArtifactId>,
    lease: Option<LeaseCheck>,
}

impl SkillContext {
    pub fn new(
        store: Arc<ArtifactStore>,
        project: &str,
        agent: &str,
        role: AgentRole,
        skill: &dyn Skill,
    ) -> Self {
        Self {
            store,
            bus: None,
            project: project.to_string(),
            agent: agent.to_string(),
            role,
            skill: skill.name().to_string(),
            output_type: skill.output_type(),
            parameters: Map::new(),
            feedback: Vec::new(),
            review_target: None,
            lease: None,
        }
    }

    /// Attach the bus so the skill can notify or call peers.
    ///
    /// Captures the current runtime handle when there is one.
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(BusLink {
            bus,
            runtime: Handle::try_current().ok(),
        });
        self
    }

    pub fn with_parameters(mut self, parameters: SkillInput) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_feedback(mut self, feedback: Vec<ReviewIssue>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Mark this execution as a review gate over `target`.
    pub fn for_review(mut self, target: Option<ArtifactId>) -> Self {
        self.review_target = target;
        self
    }

    /// Tie store writes to a task lease. Once the task is released or
    /// reassigned, `put` and `set_status` fail with `StaleLease`.
    pub fn under_lease(mut self, lease: Option<LeaseCheck>) -> Self {
        self.lease = lease;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn parameters(&self) -> &SkillInput {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Issues from the last rejection of this task's output.
    pub fn feedback(&self) -> &[ReviewIssue] {
        &self.feedback
    }

    pub fn is_review(&self) -> bool {
        self.review_target.is_some()
    }

    pub fn review_target(&self) -> Option<ArtifactId> {
        self.review_target
    }

    pub fn latest(&self, artifact_type: ArtifactType) -> Option<Artifact> {
        self.store.latest(artifact_type)
    }

    pub fn get(&self, id: &ArtifactId) -> Option<Artifact> {
        self.store.get(id)
    }

    pub fn history(&self, artifact_type: ArtifactType) -> Vec<Artifact> {
        self.store.history(artifact_type)
    }

    /// Latest artifact of a type, or `MissingArtifact`.
    pub fn require(&self, artifact_type: ArtifactType) -> Result<Artifact> {
        self.latest(artifact_type).ok_or_else(|| Error::MissingArtifact {
            project: self.project.clone(),
            skill: self.skill.clone(),
            artifact_type,
        })
    }

    /// Store an artifact of this skill's own output type.
    pub fn put(&self, artifact: Artifact) -> Result<Artifact> {
        if artifact.artifact_type != self.output_type {
            return Err(Error::PermissionDenied {
                project: self.project.clone(),
                role: self.role.to_string(),
                permission: format!("write {} artifacts", artifact.artifact_type),
            });
        }
        self.guarded(|| self.store.put(artifact))
    }

    /// Approve or reject an artifact. Only review gates may do this.
    pub fn set_status(&self, id: &ArtifactId, status: ArtifactStatus) -> Result<()> {
        if !self.is_review() {
            return Err(Error::PermissionDenied {
                project: self.project.clone(),
                role: self.role.to_string(),
                permission: format!("{} outside a review gate", Permission::SetArtifactStatus),
            });
        }
        permissions::check(self.role, Permission::SetArtifactStatus, &self.project)?;
        if !self.guarded(|| self.store.set_status(id, status))? {
            tracing::warn!(artifact = %id, %status, "set_status on unknown artifact");
        }
        Ok(())
    }

    /// Apply a store write, under the lease when there is one.
    fn guarded<T>(&self, write: impl FnOnce() -> T) -> Result<T> {
        let Some(check) = &self.lease else {
            return Ok(write());
        };
        let mut write = Some(write);
        let mut written = None;
        let held = check.authority.while_held(&check.lease, &mut || {
            if let Some(write) = write.take() {
                written = Some(write());
            }
        });
        match written {
            Some(value) if held => Ok(value),
            _ => {
                tracing::warn!(
                    task = %check.lease.task.short(),
                    attempt = check.lease.attempt,
                    agent = %self.agent,
                    skill = %self.skill,
                    "write refused: lease no longer held"
                );
                Err(Error::StaleLease {
                    task: check.lease.task,
                })
            }
        }
    }

    /// Publish a notification from this skill's agent. Returns deliveries.
    pub fn notify(&self, recipient: Recipient, payload: Value) -> usize {
        match &self.bus {
            Some(link) => link
                .bus
                .publish(Message::notification(&self.agent, recipient, payload)),
            None => 0,
        }
    }

    /// Ask a peer agent to run one of its skills and wait for the artifact.
    pub fn request_skill(&self, peer: &str, skill: &str, input: SkillInput) -> Result<Artifact> {
        let link = self.bus.as_ref().ok_or_else(|| Error::MessageDelivery {
            project: self.project.clone(),
            receiver: peer.to_string(),
            message_id: "unsent".to_string(),
        })?;
        let runtime = link.runtime.clone().ok_or_else(|| Error::MessageDelivery {
            project: self.project.clone(),
            receiver: peer.to_string(),
            message_id: "unsent".to_string(),
        })?;
        runtime.block_on(link.bus.request(&self.agent, peer, skill, input, &self.project))
    }
}
