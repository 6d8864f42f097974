//! Health monitor and recovery integration tests.
//!
//! These tests verify that crashed and stuck agents are detected from the
//! message history and task statuses, and that recovery requeues work
//! without letting late results leak into shared state.

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conductor::agent::AgentRole;
use conductor::config::{Config, HealthSettings, WorkflowConfig};
use conductor::core::{Artifact, ArtifactId, ArtifactType, Task, TaskStatus};
use conductor::message::{Message, Recipient};
use conductor::orchestration::{
    HealthConfig, HealthMonitor, HealthStatus, OrchestratorEvent, RecoveryKind, RunOutcome,
};
use conductor::workflow::{Phase, WorkflowEngine};
use conductor::Error;

use crate::fixtures::{produce, slow, Harness, Scripted};

fn implementation_engine(agent: &str) -> WorkflowEngine {
    let workflow = WorkflowConfig::default();
    let mut engine = WorkflowEngine::new("shop", &workflow);
    engine.add_phase(Phase::new("implementation")).unwrap();
    engine
        .add_task(Task::new("implementation", agent, "code_generation", ""))
        .unwrap();
    engine
}

/// Test: Crash detection and restart
/// Given two registered agents of which only one ever communicated
/// When health is checked and recovery applied
/// Then the silent one is crashed and restarted, and stays flagged until it speaks
#[tokio::test]
async fn test_crashed_agent_is_restarted() {
    let mut harness = Harness::new();
    harness.register(harness.agent("developer", AgentRole::Developer));
    let qa = harness.register(harness.agent("qa_engineer", AgentRole::QaEngineer));
    harness.bus.publish(Message::notification(
        "developer",
        Recipient::Topic("progress".to_string()),
        json!({"event": "hello"}),
    ));
    let orch = harness.orchestrator(implementation_engine("developer"), WorkflowConfig::default());

    let report = orch.check_health().await;
    assert_eq!(report.crashed_agents.len(), 1);
    assert_eq!(report.crashed_agents[0].agent, "qa_engineer");
    assert_eq!(report.health_score, 80);
    assert_eq!(report.health_status, HealthStatus::Healthy);
    assert_eq!(report.recovery_actions[0].action, RecoveryKind::Restart);

    let applied = orch.apply_recovery(&report).await.unwrap();
    assert_eq!(applied.len(), 1);
    assert!(orch.bus().is_registered("qa_engineer"));

    // A restarted session proves nothing until the agent itself talks.
    assert_eq!(orch.check_health().await.crashed_agents.len(), 1);

    qa.announce("ready", serde_json::Map::new());
    let after = orch.check_health().await;
    assert!(after.crashed_agents.is_empty());
    assert_eq!(after.health_score, 100);
}

/// Test: Crash detection after a run
/// Given a developer that runs the only task and a qa_engineer nobody addresses
/// When the run completes and health is checked
/// Then session bookkeeping has not masked the silent qa_engineer
#[tokio::test]
async fn test_silent_agent_is_crashed_after_run() {
    let mut harness = Harness::new();
    harness.register(
        harness
            .agent("developer", AgentRole::Developer)
            .with_skill(produce("code_generation", ArtifactType::SourceCode, json!({}))),
    );
    harness.register(harness.agent("qa_engineer", AgentRole::QaEngineer));
    let orch = harness.orchestrator(implementation_engine("developer"), WorkflowConfig::default());

    assert_eq!(orch.run(CancellationToken::new()).await.unwrap(), RunOutcome::Completed);
    assert!(orch.bus().is_registered("qa_engineer"));

    let report = orch.check_health().await;
    let crashed: Vec<&str> = report.crashed_agents.iter().map(|c| c.agent.as_str()).collect();
    assert_eq!(crashed, vec!["qa_engineer"]);
    assert_eq!(report.recovery_actions.len(), 1);
    assert_eq!(report.recovery_actions[0].agent, "qa_engineer");
    assert_eq!(report.recovery_actions[0].action, RecoveryKind::Restart);
}

/// Test: Stuck agent work is reassigned
/// Given a developer silent while holding an InProgress task
/// When recovery is applied
/// Then the task goes to the other developer and the old lease is stale
#[tokio::test]
async fn test_stuck_agent_task_is_reassigned() {
    let mut harness = Harness::new();
    for name in ["developer-1", "developer-2"] {
        harness.register(
            harness
                .agent(name, AgentRole::Developer)
                .with_skill(produce("code_generation", ArtifactType::SourceCode, json!({}))),
        );
    }
    let orch = harness.orchestrator(implementation_engine("developer-1"), WorkflowConfig::default());

    let engine = orch.engine();
    let (task_id, lease) = {
        let mut engine = engine.write().await;
        let id = engine.runnable()[0].id;
        (id, engine.start_task(&id).unwrap())
    };
    orch.bus().publish(Message::notification(
        "developer-2",
        Recipient::Topic("progress".to_string()),
        json!({}),
    ));

    let monitor = HealthMonitor::new(HealthConfig::with_stuck_threshold(Duration::from_secs(60)));
    let report = {
        let engine = engine.read().await;
        let names = orch.registry().names();
        assert!(monitor.detect_stuck(&engine, orch.bus(), Utc::now()).is_empty());
        monitor.check(&names, &engine, orch.bus(), Utc::now() + chrono::Duration::seconds(120))
    };
    assert_eq!(report.stuck_agents.len(), 1);
    assert_eq!(report.stuck_agents[0].agent, "developer-1");
    assert_eq!(report.stuck_agents[0].tasks, vec![task_id]);
    // developer-1 is also silent overall, so it is crashed too.
    assert_eq!(report.health_score, 65);
    let actions: Vec<_> = report.recovery_actions.iter().map(|a| a.action).collect();
    assert_eq!(actions, vec![RecoveryKind::Restart, RecoveryKind::InterruptAndReassign]);

    orch.apply_recovery(&report).await.unwrap();

    let mut engine = engine.write().await;
    let task = engine.task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.agent, "developer-2");

    let late = engine.complete_task(&lease, ArtifactId::new());
    assert!(matches!(late, Err(Error::StaleLease { .. })));
}

/// Test: Reassignment limit
/// Given a stuck task with no alternate agent
/// When it is reassigned more than max_retries times
/// Then it is failed instead of requeued again
#[tokio::test]
async fn test_reassignment_limit_fails_task() {
    let mut harness = Harness::new();
    harness.register(
        harness
            .agent("developer", AgentRole::Developer)
            .with_skill(produce("code_generation", ArtifactType::SourceCode, json!({}))),
    );
    let orch = harness.orchestrator(implementation_engine("developer"), WorkflowConfig::default());
    let monitor = HealthMonitor::new(HealthConfig::with_stuck_threshold(Duration::from_secs(1)));
    let engine = orch.engine();
    let task_id = engine.read().await.runnable()[0].id;

    for attempt in 1..=4 {
        engine.write().await.start_task(&task_id).unwrap();
        let report = {
            let engine = engine.read().await;
            monitor.check(&[], &engine, orch.bus(), Utc::now() + chrono::Duration::seconds(10))
        };
        assert_eq!(report.stuck_agents.len(), 1, "attempt {attempt}");
        orch.apply_recovery(&report).await.unwrap();

        let engine = engine.read().await;
        let task = engine.task(&task_id).unwrap();
        if attempt <= 3 {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.agent, "developer");
        } else {
            assert!(task.is_failed());
            assert!(task.status.error().unwrap().contains("3 reassignments"));
        }
    }

    let report = orch.progress_report().await;
    assert_eq!(report.failed_tasks.len(), 1);
}

/// Test: Live reassignment during a run
/// Given a developer whose skill hangs and an idle peer of the same role
/// When the periodic health check flags the hung developer as stuck
/// Then the task is reassigned, completed by the peer and the late result discarded
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_reassigns_hung_task() {
    let mut harness = Harness::new();
    harness.register(
        harness
            .agent("developer-1", AgentRole::Developer)
            .with_skill(slow("code_generation", ArtifactType::SourceCode, Duration::from_secs(5))),
    );
    harness.register(
        harness
            .agent("developer-2", AgentRole::Developer)
            .with_skill(slow("code_generation", ArtifactType::SourceCode, Duration::from_millis(10))),
    );
    let config = Config {
        health: HealthSettings {
            stuck_threshold_secs: 0,
            check_interval_secs: 1,
            ..HealthSettings::default()
        },
        ..Config::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orch = harness
        .orchestrator_with(implementation_engine("developer-1"), config)
        .with_events(tx);

    let outcome = orch.run(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let code = orch.store().history(ArtifactType::SourceCode);
    assert_eq!(code.len(), 1);
    assert_eq!(code[0].producer, "developer-2");

    let mut reassigned = false;
    while let Ok(event) = rx.try_recv() {
        if let OrchestratorEvent::RecoveryApplied(action) = event {
            reassigned |= action.action == RecoveryKind::InterruptAndReassign && action.agent == "developer-1";
        }
    }
    assert!(reassigned);
}

/// Test: Side writes from an abandoned execution
/// Given a developer whose skill wakes up and writes through its context
///   only after its task was reassigned and completed elsewhere
/// When the late write is attempted
/// Then it is refused with StaleLease and the store keeps only the new owner's output
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_context_write_is_refused() {
    let refused = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&refused);
    let lagging = Scripted::new("code_generation", ArtifactType::SourceCode, move |_, ctx| {
        std::thread::sleep(Duration::from_millis(1500));
        let side = ctx.put(Artifact::new(ArtifactType::SourceCode, json!({ "draft": true }), ""));
        flag.store(matches!(side, Err(Error::StaleLease { .. })), Ordering::SeqCst);
        side
    });

    let mut harness = Harness::new();
    harness.register(harness.agent("developer-1", AgentRole::Developer).with_skill(lagging));
    harness.register(
        harness
            .agent("developer-2", AgentRole::Developer)
            .with_skill(produce("code_generation", ArtifactType::SourceCode, json!({ "final": true }))),
    );
    let config = Config {
        health: HealthSettings {
            stuck_threshold_secs: 0,
            check_interval_secs: 1,
            ..HealthSettings::default()
        },
        ..Config::default()
    };
    let orch = harness.orchestrator_with(implementation_engine("developer-1"), config);

    assert_eq!(orch.run(CancellationToken::new()).await.unwrap(), RunOutcome::Completed);
    // Let the abandoned execution wake up and try its write.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(refused.load(Ordering::SeqCst));
    let code = orch.store().history(ArtifactType::SourceCode);
    assert_eq!(code.len(), 1);
    assert_eq!(code[0].producer, "developer-2");
    assert_eq!(code[0].content["final"], true);
}

/// Test: Cancellation releases in-flight work
/// Given a run whose only task hangs
/// When the run is cancelled
/// Then the task is back to Pending for a later run
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_releases_inflight_task() {
    let mut harness = Harness::new();
    harness.register(
        harness
            .agent("developer", AgentRole::Developer)
            .with_skill(slow("code_generation", ArtifactType::SourceCode, Duration::from_millis(500))),
    );
    let orch = harness.orchestrator(implementation_engine("developer"), WorkflowConfig::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    assert_eq!(orch.run(cancel).await.unwrap(), RunOutcome::Cancelled);
    let engine = orch.engine();
    let engine = engine.read().await;
    assert!(engine.in_progress_tasks().is_empty());
    assert_eq!(engine.runnable().len(), 1);
    assert!(orch.store().is_empty());
}
