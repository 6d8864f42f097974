//! Conflict resolution tests.
//!
//! These tests verify NFR-aligned option selection, that decisions are
//! recorded as review feedback, and that the strategy is replaceable.

use serde_json::json;

use conductor::agent::AgentRole;
use conductor::config::WorkflowConfig;
use conductor::core::{Artifact, ArtifactType};
use conductor::orchestration::{
    Conflict, ConflictStrategy, Orchestrator, Resolution, DEFAULT_RATIONALE,
};
use conductor::workflow::{Phase, WorkflowEngine};
use conductor::Error;

use crate::fixtures::Harness;

fn orchestrator_with_nfrs(nfrs: serde_json::Value) -> Orchestrator {
    let harness = Harness::new();
    harness.store.put(Artifact::new(
        ArtifactType::Requirements,
        json!({ "functional_requirements": [], "non_functional_requirements": nfrs }),
        "product_manager",
    ));
    let workflow = WorkflowConfig::default();
    let mut engine = WorkflowEngine::new("shop", &workflow);
    engine.add_phase(Phase::new("design")).unwrap();
    harness.orchestrator(engine, workflow)
}

fn storage_conflict() -> Conflict {
    Conflict::new(
        &["architect", "developer"],
        "session storage",
        &["Relational table", "In-memory cache for fast lookups", "Encrypted secure vault"],
    )
}

/// Test: Performance NFR
/// Given requirements demanding performance
/// When architect and developer disagree on storage
/// Then the fast option wins and the decision is stored as review feedback
#[tokio::test]
async fn test_performance_nfr_selects_fast_option() {
    let orch = orchestrator_with_nfrs(json!([{ "description": "Performance: p99 under 50ms" }]));

    let artifact = orch
        .resolve_conflicts(AgentRole::ProjectManager, &[storage_conflict()])
        .unwrap();

    assert_eq!(artifact.artifact_type, ArtifactType::ReviewFeedback);
    assert_eq!(artifact.version, 1);
    assert_eq!(artifact.metadata["type"], "conflict_resolution");
    let resolution = &artifact.content["resolutions"][0];
    assert_eq!(resolution["decision"], "In-memory cache for fast lookups");
    assert_eq!(resolution["rationale"], "Selected for performance alignment with NFRs");
    assert_eq!(resolution["parties"], json!(["architect", "developer"]));
    assert_eq!(artifact.content["resolved_count"], 1);

    // Resolutions are not gate verdicts.
    assert_eq!(orch.progress_report().await.review_summary.total, 0);
}

/// Test: Security NFR
/// Given requirements that only mention security
/// When the conflict is resolved
/// Then the secure option wins
#[tokio::test]
async fn test_security_nfr_selects_secure_option() {
    let orch = orchestrator_with_nfrs(json!(["All data must meet security review"]));
    let artifact = orch
        .resolve_conflicts(AgentRole::Architect, &[storage_conflict()])
        .unwrap();
    assert_eq!(artifact.content["resolutions"][0]["decision"], "Encrypted secure vault");
    assert_eq!(artifact.producer, "architect");
}

/// Test: No NFR match
/// Given requirements without performance or security concerns
/// When several conflicts are resolved together
/// Then each falls back to its first option, or defers when it has none
#[tokio::test]
async fn test_fallback_and_deferral() {
    let orch = orchestrator_with_nfrs(json!([{ "description": "Accessible UI" }]));
    let empty = Conflict::new(&["qa_engineer", "developer"], "flaky test ownership", &[]);

    let artifact = orch
        .resolve_conflicts(AgentRole::TeamLead, &[storage_conflict(), empty])
        .unwrap();
    let resolutions = artifact.content["resolutions"].as_array().unwrap();
    assert_eq!(resolutions[0]["decision"], "Relational table");
    assert_eq!(resolutions[0]["rationale"], DEFAULT_RATIONALE);
    assert_eq!(resolutions[1]["decision"], "defer to architect");
    assert_eq!(artifact.content["total_conflicts"], 2);
}

/// Test: Role gate
/// Given a developer
/// When it tries to resolve a conflict
/// Then PermissionDenied is raised and nothing is stored
#[tokio::test]
async fn test_developer_cannot_resolve() {
    let orch = orchestrator_with_nfrs(json!([]));
    let err = orch
        .resolve_conflicts(AgentRole::Developer, &[storage_conflict()])
        .unwrap_err();
    match err {
        Error::PermissionDenied { project, role, permission } => {
            assert_eq!(project, "shop");
            assert_eq!(role, "developer");
            assert_eq!(permission, "resolve_conflict");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(orch.store().latest(ArtifactType::ReviewFeedback).is_none());
}

struct LastOption;

impl ConflictStrategy for LastOption {
    fn name(&self) -> &str {
        "last_option"
    }

    fn resolve(&self, conflict: &Conflict, _nfr_text: &str) -> Resolution {
        Resolution {
            issue: conflict.issue.clone(),
            parties: conflict.parties.clone(),
            decision: conflict.options.last().cloned().unwrap_or_default(),
            rationale: "latest proposal".to_string(),
            status: "resolved".to_string(),
        }
    }
}

/// Test: Replaceable strategy
/// Given an orchestrator configured with a custom strategy
/// When a conflict is resolved
/// Then the custom strategy decides
#[tokio::test]
async fn test_custom_strategy_is_used() {
    let orch = orchestrator_with_nfrs(json!(["performance"])).with_conflict_strategy(LastOption);
    let artifact = orch
        .resolve_conflicts(AgentRole::ProjectManager, &[storage_conflict()])
        .unwrap();
    assert_eq!(artifact.content["resolutions"][0]["decision"], "Encrypted secure vault");
    assert_eq!(artifact.content["resolutions"][0]["rationale"], "latest proposal");
}
