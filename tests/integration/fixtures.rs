//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted skills backed by closures
//! - The requirements/PRD/coverage-gate trio used by end-to-end scenarios
//! - A harness holding the shared store, bus and registry

#![allow(dead_code)]

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conductor::agent::{Agent, AgentRegistry, AgentRole, RoutingStrategy};
use conductor::config::{Config, WorkflowConfig};
use conductor::core::{
    Artifact, ArtifactStatus, ArtifactStore, ArtifactType, ReviewIssue, ReviewOutcome, Severity,
};
use conductor::message::MessageBus;
use conductor::orchestration::Orchestrator;
use conductor::skill::{Skill, SkillContext, SkillInput};
use conductor::workflow::WorkflowEngine;
use conductor::{Error, Result};

type Script = dyn Fn(&SkillInput, &SkillContext) -> Result<Artifact> + Send + Sync;

/// A skill whose behavior is a closure.
pub struct Scripted {
    name: String,
    output: ArtifactType,
    required_inputs: &'static [&'static str],
    required_artifacts: Vec<ArtifactType>,
    script: Box<Script>,
}

impl Scripted {
    pub fn new(
        name: &str,
        output: ArtifactType,
        script: impl Fn(&SkillInput, &SkillContext) -> Result<Artifact> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            output,
            required_inputs: &[],
            required_artifacts: Vec::new(),
            script: Box::new(script),
        }
    }

    pub fn requiring_inputs(mut self, fields: &'static [&'static str]) -> Self {
        self.required_inputs = fields;
        self
    }

    pub fn requiring_artifacts(mut self, types: &[ArtifactType]) -> Self {
        self.required_artifacts = types.to_vec();
        self
    }
}

impl Skill for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_type(&self) -> ArtifactType {
        self.output
    }

    fn required_inputs(&self) -> &[&'static str] {
        self.required_inputs
    }

    fn required_artifacts(&self) -> Vec<ArtifactType> {
        self.required_artifacts.clone()
    }

    fn execute(&self, input: &SkillInput, ctx: &SkillContext) -> Result<Artifact> {
        (self.script)(input, ctx)
    }
}

/// A skill producing `content` as an artifact of type `output`.
pub fn produce(name: &str, output: ArtifactType, content: Value) -> Scripted {
    Scripted::new(name, output, move |_, _| Ok(Artifact::new(output, content.clone(), "")))
}

/// Like `produce`, but blocks for `delay` first.
pub fn slow(name: &str, output: ArtifactType, delay: Duration) -> Scripted {
    let skill = name.to_string();
    Scripted::new(name, output, move |_, ctx| {
        std::thread::sleep(delay);
        Ok(Artifact::new(output, json!({ "skill": skill, "agent": ctx.agent() }), ""))
    })
}

/// A gate that approves or rejects according to `approve`, marking the
/// target accordingly.
pub fn switch_gate(name: &str, approve: Arc<AtomicBool>) -> Scripted {
    Scripted::new(name, ArtifactType::ReviewFeedback, move |_, ctx| {
        let approved = approve.load(Ordering::SeqCst);
        let outcome = if approved {
            ReviewOutcome::approve("approved")
        } else {
            ReviewOutcome::reject(
                vec![ReviewIssue::new("quality", Severity::High, "not good enough")],
                "rejected",
            )
        };
        verdict(ctx, outcome)
    })
}

pub fn approving_gate(name: &str) -> Scripted {
    switch_gate(name, Arc::new(AtomicBool::new(true)))
}

/// Mark the review target and wrap the verdict in a feedback artifact.
pub fn verdict(ctx: &SkillContext, outcome: ReviewOutcome) -> Result<Artifact> {
    if let Some(target) = ctx.review_target() {
        let status = if outcome.approved {
            ArtifactStatus::Approved
        } else {
            ArtifactStatus::Rejected
        };
        ctx.set_status(&target, status)?;
    }
    Ok(Artifact::new(
        ArtifactType::ReviewFeedback,
        serde_json::to_value(outcome)?,
        "",
    ))
}

/// Splits `raw_requirements` into one requirement per non-empty line.
pub fn requirement_analysis() -> Scripted {
    Scripted::new("requirement_analysis", ArtifactType::Requirements, |input, _| {
        let raw = input
            .get("raw_requirements")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let requirements: Vec<Value> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(i, line)| json!({ "id": format!("REQ-{:03}", i + 1), "description": line }))
            .collect();
        Ok(Artifact::new(
            ArtifactType::Requirements,
            json!({
                "functional_requirements": requirements,
                "non_functional_requirements": input.get("nfrs").cloned().unwrap_or(json!([])),
            }),
            "",
        ))
    })
    .requiring_inputs(&["raw_requirements"])
}

/// Writes a PRD covering the first `first_pass` requirements, and all of
/// them once review feedback is present.
pub fn product_design(first_pass: usize) -> Scripted {
    Scripted::new("product_design", ArtifactType::Prd, move |_, ctx| {
        let requirements = ctx.require(ArtifactType::Requirements)?;
        let ids: Vec<Value> = requirements
            .field("functional_requirements")
            .and_then(Value::as_array)
            .map(|reqs| reqs.iter().filter_map(|r| r.get("id").cloned()).collect())
            .unwrap_or_default();
        let covered: Vec<Value> = if ctx.feedback().is_empty() {
            ids.into_iter().take(first_pass).collect()
        } else {
            ids
        };
        Ok(Artifact::new(
            ArtifactType::Prd,
            json!({ "covers": covered, "revision_notes": ctx.feedback().len() }),
            "",
        ))
    })
    .requiring_artifacts(&[ArtifactType::Requirements])
}

/// Approves a PRD only at 100% requirement coverage.
pub fn coverage_gate() -> Scripted {
    Scripted::new("product_review", ArtifactType::ReviewFeedback, |_, ctx| {
        let target = ctx
            .review_target()
            .and_then(|id| ctx.get(&id))
            .ok_or_else(|| Error::Validation {
                project: ctx.project().to_string(),
                skill: "product_review".to_string(),
                message: "no PRD to review".to_string(),
            })?;
        let requirements = ctx.require(ArtifactType::Requirements)?;
        let all: Vec<Value> = requirements
            .field("functional_requirements")
            .and_then(Value::as_array)
            .map(|reqs| reqs.iter().filter_map(|r| r.get("id").cloned()).collect())
            .unwrap_or_default();
        let covers = target
            .field("covers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let issues: Vec<ReviewIssue> = all
            .iter()
            .filter(|id| !covers.contains(id))
            .map(|id| ReviewIssue::new("coverage", Severity::High, format!("{} not covered", id)))
            .collect();
        let outcome = if issues.is_empty() {
            ReviewOutcome::approve(format!("100% coverage of {} requirements", all.len()))
        } else {
            ReviewOutcome::reject(issues, "incomplete coverage")
        };
        verdict(ctx, outcome)
    })
}

pub fn raw_requirements(count: usize) -> SkillInput {
    let raw: Vec<String> = (1..=count).map(|i| format!("The user can do thing {}", i)).collect();
    let mut input = Map::new();
    input.insert("raw_requirements".to_string(), json!(raw.join("\n")));
    input
}

/// Shared store, bus and registry for one scenario.
pub struct Harness {
    pub store: Arc<ArtifactStore>,
    pub bus: Arc<MessageBus>,
    pub registry: AgentRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_strategy(RoutingStrategy::RoundRobin)
    }

    pub fn with_strategy(strategy: RoutingStrategy) -> Self {
        Self {
            store: Arc::new(ArtifactStore::new()),
            bus: Arc::new(MessageBus::new()),
            registry: AgentRegistry::new(strategy),
        }
    }

    pub fn agent(&self, name: &str, role: AgentRole) -> Agent {
        Agent::new(name, role, Arc::clone(&self.store), Arc::clone(&self.bus))
    }

    pub fn register(&mut self, agent: Agent) -> Arc<Agent> {
        self.registry.register(agent)
    }

    /// Register the product manager owning the requirements trio.
    pub fn product_manager(&mut self, first_pass: usize) -> Arc<Agent> {
        let agent = self
            .agent("product_manager", AgentRole::ProductManager)
            .with_skill(requirement_analysis())
            .with_skill(product_design(first_pass))
            .with_skill(coverage_gate());
        self.register(agent)
    }

    pub fn orchestrator(self, engine: WorkflowEngine, workflow: WorkflowConfig) -> Orchestrator {
        let config = Config {
            project_name: engine.project().to_string(),
            workflow,
            ..Config::default()
        };
        self.orchestrator_with(engine, config)
    }

    pub fn orchestrator_with(self, engine: WorkflowEngine, config: Config) -> Orchestrator {
        Orchestrator::new(config, Arc::new(self.registry), engine, self.store, self.bus)
    }
}

/// Skill input with a single `key`.
pub fn input(key: &str, value: Value) -> SkillInput {
    let mut input = Map::new();
    input.insert(key.to_string(), value);
    input
}
