//! Snapshot and configuration persistence tests.

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conductor::agent::{AgentRegistry, AgentRole};
use conductor::config::{Config, WorkflowConfig};
use conductor::core::{ArtifactStatus, ArtifactType};
use conductor::message::MessageBus;
use conductor::orchestration::{Orchestrator, RunOutcome};
use conductor::state::Snapshot;
use conductor::workflow::{default_sdlc, PhaseStatus};

use crate::fixtures::{approving_gate, produce, Harness};

/// Test: Resume from a snapshot
/// Given a run that completed only the requirements phase
/// When its snapshot is saved, loaded and restored into a fresh pipeline
/// Then artifact history and phase counters survive and design is next
#[tokio::test]
async fn test_snapshot_resume() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        project_name: "shop".to_string(),
        state_path: Some(dir.path().join("snapshot.json").to_string_lossy().into_owned()),
        ..Config::default()
    };
    config.save_to(&dir.path().join("conductor.toml")).unwrap();
    let config = Config::load_from(&dir.path().join("conductor.toml")).unwrap();

    let mut harness = Harness::new();
    harness.register(
        harness
            .agent("product_manager", AgentRole::ProductManager)
            .with_skill(produce("requirement_analysis", ArtifactType::Requirements, json!({"n": 5})))
            .with_skill(produce("user_story_writing", ArtifactType::UserStories, json!({})))
            .with_skill(produce("product_design", ArtifactType::Prd, json!({})))
            .with_skill(approving_gate("product_review")),
    );
    let engine = default_sdlc(&config.project_name, &config.workflow).unwrap();
    let orch = harness.orchestrator_with(engine, config.clone());

    // No architect is registered, so the run stalls at design.
    let outcome = orch.run(CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Stalled { .. }));

    let path = config.snapshot_path().unwrap();
    orch.snapshot().await.save(path.clone()).await.unwrap();

    let snapshot = Snapshot::load(path).await.unwrap().unwrap();
    let mut fresh = default_sdlc("shop", &WorkflowConfig::default()).unwrap();
    let store = snapshot.restore(&mut fresh).unwrap();

    assert_eq!(store.len(), orch.store().len());
    assert_eq!(store.latest(ArtifactType::Prd).unwrap().status, ArtifactStatus::Approved);
    assert_eq!(fresh.status("requirements"), Some(PhaseStatus::Complete));
    assert_eq!(fresh.current_phase().unwrap().name, "design");
    assert_eq!(fresh.runnable()[0].skill, "system_design");

    // The restored state drives a new orchestrator to completion of design's first task.
    let store = Arc::new(store);
    let bus = Arc::new(MessageBus::new());
    let mut registry = AgentRegistry::default();
    registry.register(
        conductor::agent::Agent::new("architect", AgentRole::Architect, Arc::clone(&store), Arc::clone(&bus))
            .with_skill(produce("system_design", ArtifactType::ArchitectureDesign, json!({}))),
    );
    let resumed = Orchestrator::new(config, Arc::new(registry), fresh, store, bus);
    let outcome = resumed.run(CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Stalled { .. }));
    assert_eq!(
        resumed.store().latest(ArtifactType::ArchitectureDesign).unwrap().version,
        1
    );
    assert_eq!(resumed.store().history(ArtifactType::Requirements).len(), 1);
}
