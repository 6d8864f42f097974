//! Parallel execution correctness tests.
//!
//! These tests verify that independent tasks really run side by side, that
//! the concurrency limit holds, and that concurrent writers never corrupt
//! the per-type version sequence or request/response correlation.

use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conductor::agent::{AgentRole, RoutingStrategy};
use conductor::config::WorkflowConfig;
use conductor::core::{Artifact, ArtifactStore, ArtifactType, Task};
use conductor::orchestration::RunOutcome;
use conductor::workflow::{Phase, WorkflowEngine};

use crate::fixtures::{input, Harness, Scripted};

/// Test: Concurrent puts keep versions contiguous
/// Given 8 threads each storing 25 artifacts of one type
/// When they all finish
/// Then versions 1..=200 each appear exactly once
#[test]
fn test_concurrent_puts_on_one_type() {
    let store = Arc::new(ArtifactStore::new());
    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..25 {
                    store.put(Artifact::new(
                        ArtifactType::SourceCode,
                        json!({ "worker": worker, "i": i }),
                        "developer",
                    ));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let history = store.history(ArtifactType::SourceCode);
    assert_eq!(history.len(), 200);
    let versions: Vec<u32> = history.iter().map(|a| a.version).collect();
    assert_eq!(versions, (1..=200).collect::<Vec<u32>>());
    assert_eq!(store.latest(ArtifactType::SourceCode).unwrap().version, 200);
}

/// A skill that records how many copies of itself run at once.
fn tracked(name: &str, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Scripted {
    Scripted::new(name, ArtifactType::SourceCode, move |_, ctx| {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(Artifact::new(ArtifactType::SourceCode, json!({ "agent": ctx.agent() }), ""))
    })
}

async fn run_independent_tasks(max_concurrent_tasks: usize) -> (usize, Vec<u32>) {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut harness = Harness::with_strategy(RoutingStrategy::LoadBased);
    for name in ["developer-1", "developer-2", "developer-3", "developer-4"] {
        harness.register(harness.agent(name, AgentRole::Developer).with_skill(tracked(
            "code_generation",
            Arc::clone(&running),
            Arc::clone(&peak),
        )));
    }

    let workflow = WorkflowConfig {
        max_concurrent_tasks,
        ..WorkflowConfig::default()
    };
    let mut engine = WorkflowEngine::new("shop", &workflow);
    engine.add_phase(Phase::new("implementation")).unwrap();
    for i in 0..4 {
        engine
            .add_task(Task::new("implementation", "", "code_generation", &format!("module {}", i)))
            .unwrap();
    }

    let orch = harness.orchestrator(engine, workflow);
    assert_eq!(orch.run(CancellationToken::new()).await.unwrap(), RunOutcome::Completed);

    let versions = orch
        .store()
        .history(ArtifactType::SourceCode)
        .iter()
        .map(|a| a.version)
        .collect();
    (peak.load(Ordering::SeqCst), versions)
}

/// Test: Independent tasks execute concurrently
/// Given four tasks with no dependency edges and four developers
/// When the run allows four concurrent tasks
/// Then more than one skill runs at once and versions stay contiguous
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_tasks_run_concurrently() {
    let (peak, versions) = run_independent_tasks(4).await;
    assert!(peak > 1, "expected overlap, peak was {peak}");
    assert_eq!(versions, vec![1, 2, 3, 4]);
}

/// Test: Concurrency limit
/// Given the same four tasks
/// When only one task may run at a time
/// Then no two skills ever overlap
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_respected() {
    let (peak, versions) = run_independent_tasks(1).await;
    assert_eq!(peak, 1);
    assert_eq!(versions.len(), 4);
}

/// Test: Correlated requests in flight together
/// Given an agent serving its inbox
/// When a peer sends ten requests at once
/// Then every reply matches its own request
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_requests_are_correlated() {
    let mut harness = Harness::new();
    let echo = Scripted::new("echo", ArtifactType::SourceCode, |input, _| {
        Ok(Artifact::new(ArtifactType::SourceCode, json!({ "n": input["n"] }), ""))
    })
    .requiring_inputs(&["n"]);
    harness.register(harness.agent("developer", AgentRole::Developer).with_skill(echo));
    let asker = harness.register(harness.agent("architect", AgentRole::Architect));
    harness.registry.start_session("developer").unwrap();

    let mut requests = JoinSet::new();
    for n in 0..10 {
        let asker = Arc::clone(&asker);
        requests.spawn(async move {
            let artifact = asker
                .request_skill("developer", "echo", input("n", json!(n)), "shop")
                .await
                .unwrap();
            (n, artifact)
        });
    }

    let mut versions = HashSet::new();
    while let Some(joined) = requests.join_next().await {
        let (n, artifact) = joined.unwrap();
        assert_eq!(artifact.content["n"], n);
        assert_eq!(artifact.producer, "developer");
        versions.insert(artifact.version);
    }
    assert_eq!(versions.len(), 10);
    assert_eq!(harness.store.history(ArtifactType::SourceCode).len(), 10);
}
