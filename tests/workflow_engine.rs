use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use entraflow_core::config::{AppConfig, EngineConfig};
use entraflow_core::condition::Condition;
use entraflow_core::error::EntraflowError;
use entraflow_core::event::EventBus;
use entraflow_core::payload::Payload;
use entraflow_core::traits::StateStore;
use entraflow_core::types::{NodeStatus, RunStatus, WorkflowRun};
use entraflow_core::workflow::{BackoffPolicy, EdgeSpec, NodeSpec, WorkflowDefinition};
use entraflow_engine::run_log::read_log;
use entraflow_engine::{AgentRegistry, MemoryStateStore, Orchestrator, RunLogger, SqliteStateStore};
use entraflow_test_utils::{fixtures, ConcurrencyProbe, MockAgent};

fn engine_config(max_parallelism: usize) -> EngineConfig {
    EngineConfig {
        max_parallelism,
        default_timeout_secs: 60,
        default_max_retries: 1,
        backoff: BackoffPolicy::default(),
    }
}

fn registry(agents: &[Arc<MockAgent>]) -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register_arc(agent.clone());
    }
    Arc::new(registry)
}

fn orchestrator(agents: &[Arc<MockAgent>], store: Arc<dyn StateStore>) -> Orchestrator {
    Orchestrator::new(registry(agents), store, engine_config(4))
}

#[tokio::test(start_paused = true)]
async fn test_execution_order_respects_dependencies() {
    let agent = MockAgent::new("mock").shared();
    let orch = Orchestrator::new(
        registry(&[agent.clone()]),
        Arc::new(MemoryStateStore::new()),
        engine_config(1),
    );
    let def = WorkflowDefinition::new("layers")
        .node(NodeSpec::new("publish", "mock").depends_on(&["render", "audit"]))
        .node(NodeSpec::new("render", "mock").depends_on(&["fetch"]))
        .node(NodeSpec::new("audit", "mock").depends_on(&["fetch", "lint"]))
        .node(NodeSpec::new("lint", "mock"))
        .node(NodeSpec::new("fetch", "mock"));

    let run = orch.start(Arc::new(def.clone()), HashMap::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let order: Vec<String> = agent.contexts().into_iter().map(|c| c.node_id).collect();
    assert_eq!(order.len(), 5);
    let position = |id: &str| order.iter().position(|n| n == id).unwrap();
    for node in &def.nodes {
        for dep in &node.depends_on {
            assert!(
                position(dep) < position(&node.id),
                "{} ran before its dependency {}",
                node.id,
                dep
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_cycle_rejected_before_any_agent_runs() {
    let agent = MockAgent::new("mock").shared();
    let store = Arc::new(MemoryStateStore::new());
    let orch = orchestrator(&[agent.clone()], store.clone());
    let def = WorkflowDefinition::new("loop")
        .node(NodeSpec::new("start", "mock"))
        .node(NodeSpec::new("a", "mock").depends_on(&["start", "c"]))
        .node(NodeSpec::new("b", "mock").depends_on(&["a"]))
        .node(NodeSpec::new("c", "mock").depends_on(&["b"]));

    let err = orch.start(Arc::new(def), HashMap::new()).await.unwrap_err();

    match err {
        EntraflowError::CycleDetected { path } => {
            assert!(path.len() >= 4);
            assert_eq!(path.first(), path.last());
            for id in ["a", "b", "c"] {
                assert!(path.iter().any(|p| p == id));
            }
        }
        other => panic!("expected cycle, got {other}"),
    }
    assert_eq!(agent.calls(), 0);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_false_condition_skips_target_and_its_dependents() {
    let scorer = MockAgent::returning("scorer", json!({"score": 5})).shared();
    let worker = MockAgent::new("worker").shared();
    let orch = orchestrator(&[scorer.clone(), worker.clone()], Arc::new(MemoryStateStore::new()));
    let def = WorkflowDefinition::new("gated")
        .node(NodeSpec::new("a", "scorer"))
        .node(NodeSpec::new("b", "worker"))
        .node(NodeSpec::new("c", "worker").depends_on(&["b"]))
        .edge(EdgeSpec::when("a", "b", Condition::less_than("score", 0.0)));

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(run.node_status("a"), Some(NodeStatus::Succeeded));
    assert_eq!(run.node_status("b"), Some(NodeStatus::Skipped));
    assert_eq!(run.node_status("c"), Some(NodeStatus::Skipped));
    assert_eq!(worker.calls(), 0);
    assert_eq!(run.status, RunStatus::PartiallyCompleted);
}

#[tokio::test(start_paused = true)]
async fn test_true_condition_lets_target_run() {
    let scorer = MockAgent::returning("scorer", json!({"score": -3})).shared();
    let worker = MockAgent::new("worker").shared();
    let orch = orchestrator(&[scorer.clone(), worker.clone()], Arc::new(MemoryStateStore::new()));
    let def = WorkflowDefinition::new("gated")
        .node(NodeSpec::new("a", "scorer"))
        .node(NodeSpec::new("b", "worker"))
        .edge(EdgeSpec::when("a", "b", Condition::less_than("score", 0.0)));

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(worker.calls(), 1);
    let seen = worker.contexts();
    assert_eq!(seen[0].upstream("a").unwrap().field("score"), Some(&json!(-3)));
}

#[tokio::test(start_paused = true)]
async fn test_retries_follow_exponential_backoff() {
    let flaky = MockAgent::new("flaky").failing_times(2).shared();
    let orch = orchestrator(&[flaky.clone()], Arc::new(MemoryStateStore::new()));
    let backoff = BackoffPolicy {
        base_delay_ms: 1000,
        multiplier: 2.0,
        max_delay_ms: 30_000,
        jitter: false,
    };
    let def = WorkflowDefinition::new("retry").node(
        NodeSpec::new("a", "flaky")
            .with_max_retries(3)
            .with_backoff(backoff),
    );

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let a = run.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Succeeded);
    assert_eq!(a.attempts, 3);

    let times = flaky.call_times();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));
}

#[tokio::test(start_paused = true)]
async fn test_retries_back_off_then_fail_after_last_attempt() {
    let broken = MockAgent::new("broken").always_failing().shared();
    let orch = orchestrator(&[broken.clone()], Arc::new(MemoryStateStore::new()));
    let def = WorkflowDefinition::new("retry").node(
        NodeSpec::new("a", "broken")
            .with_max_retries(3)
            .with_backoff(BackoffPolicy {
                base_delay_ms: 1000,
                multiplier: 2.0,
                max_delay_ms: 30_000,
                jitter: false,
            }),
    );

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(broken.calls(), 3);
    let times = broken.call_times();
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));

    let a = run.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
    assert_eq!(a.attempts, 3);
    assert!(a.next_attempt_at.is_none());
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_node() {
    let broken = MockAgent::new("broken").always_failing().shared();
    let orch = orchestrator(&[broken.clone()], Arc::new(MemoryStateStore::new()));
    let def = WorkflowDefinition::new("retry").node(
        NodeSpec::new("a", "broken")
            .with_max_retries(2)
            .with_backoff(BackoffPolicy {
                base_delay_ms: 10,
                ..BackoffPolicy::default()
            }),
    );

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(broken.calls(), 2);
    let a = run.node("a").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
    assert!(a.last_error.as_ref().unwrap().message.contains("scripted failure"));
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_branch_skips_join_and_fails_run() {
    let ok = MockAgent::new("ok").shared();
    let bad = MockAgent::new("bad").always_failing().shared();
    let orch = orchestrator(&[ok.clone(), bad.clone()], Arc::new(MemoryStateStore::new()));

    let run = orch
        .start(Arc::new(fixtures::diamond("ok", "bad", "ok", "ok")), HashMap::new())
        .await
        .unwrap();

    assert_eq!(run.node_status("a"), Some(NodeStatus::Succeeded));
    assert_eq!(run.node_status("b"), Some(NodeStatus::Failed));
    assert_eq!(run.node_status("c"), Some(NodeStatus::Succeeded));
    assert_eq!(run.node_status("d"), Some(NodeStatus::Skipped));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(ok.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_feeding_only_optional_nodes_is_partial() {
    let ok = MockAgent::new("ok").shared();
    let bad = MockAgent::new("bad").always_failing().shared();
    let orch = orchestrator(&[ok.clone(), bad.clone()], Arc::new(MemoryStateStore::new()));
    let mut def = fixtures::diamond("ok", "bad", "ok", "ok");
    def.nodes[3].optional = true;

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(run.node_status("d"), Some(NodeStatus::Skipped));
    assert_eq!(run.status, RunStatus::PartiallyCompleted);
    assert!(!run.status.is_failure());
}

#[tokio::test(start_paused = true)]
async fn test_independent_nodes_run_concurrently() {
    let probe = ConcurrencyProbe::new();
    let slow = MockAgent::new("slow")
        .with_delay(Duration::from_millis(100))
        .with_probe(probe.clone())
        .shared();
    let orch = orchestrator(&[slow.clone()], Arc::new(MemoryStateStore::new()));
    let def = WorkflowDefinition::new("pair")
        .node(NodeSpec::new("weather", "slow"))
        .node(NodeSpec::new("news", "slow"));

    let started = Instant::now();
    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(probe.max_observed(), 2);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_resume_of_finished_run_is_a_no_op() {
    let agent = MockAgent::new("mock").shared();
    let store = Arc::new(MemoryStateStore::new());
    let orch = orchestrator(&[agent.clone()], store.clone());

    let run = orch
        .start(Arc::new(fixtures::linear("mock")), HashMap::new())
        .await
        .unwrap();
    let saves = store.save_count();

    let resumed = orch.resume(&run.run_id).await.unwrap();

    assert_eq!(resumed, run);
    assert_eq!(agent.calls(), 3);
    assert_eq!(store.save_count(), saves);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_crash_runs_only_unfinished_nodes() {
    let agent = MockAgent::returning("mock", json!({"step": "b"})).shared();
    let store = Arc::new(MemoryStateStore::new());

    // Snapshot as left by a process that died while `b` was executing.
    let mut snapshot = WorkflowRun::new(Arc::new(fixtures::linear("mock")), HashMap::new());
    {
        let a = snapshot.nodes.get_mut("a").unwrap();
        a.status = NodeStatus::Succeeded;
        a.attempts = 1;
        a.result = Some(Payload::new(json!({"step": "a"})));
    }
    {
        let b = snapshot.nodes.get_mut("b").unwrap();
        b.status = NodeStatus::Running;
        b.attempts = 1;
    }
    store.save(&snapshot).await.unwrap();

    let orch = orchestrator(&[agent.clone()], store.clone());
    let run = orch.resume(&snapshot.run_id).await.unwrap();

    assert_eq!(run.run_id, snapshot.run_id);
    assert_eq!(run.status, RunStatus::Completed);
    let executed: Vec<String> = agent.contexts().into_iter().map(|c| c.node_id).collect();
    assert_eq!(executed, vec!["b", "c"]);
    assert_eq!(run.node("a").unwrap().attempts, 1);
    assert_eq!(run.node("b").unwrap().attempts, 1);
    assert_eq!(
        agent.contexts()[0].upstream("a").unwrap().field("step"),
        Some(&json!("a"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_can_be_resumed() {
    let agent = MockAgent::new("mock").with_delay(Duration::from_secs(1)).shared();
    let store = Arc::new(MemoryStateStore::new());

    let first = orchestrator(&[agent.clone()], store.clone());
    let token = first.cancel_token();
    let (run, _) = tokio::join!(
        first.start(Arc::new(fixtures::linear("mock")), HashMap::new()),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        }
    );
    let run = run.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(agent.calls(), 1);

    let second = orchestrator(&[agent.clone()], store.clone());
    let resumed = second.resume(&run.run_id).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(agent.calls(), 3);
    assert_eq!(second.status(&run.run_id).await.unwrap().succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_resume_retries_only_when_attempts_remain() {
    let bad = MockAgent::new("bad").always_failing().shared();
    let store = Arc::new(MemoryStateStore::new());
    let orch = orchestrator(&[bad.clone()], store.clone());
    let def = WorkflowDefinition::new("one").node(NodeSpec::new("a", "bad"));

    let run = orch.start(Arc::new(def), HashMap::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let resumed = orch.resume(&run.run_id).await.unwrap();
    assert_eq!(resumed, run);
    assert_eq!(bad.calls(), 1);
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state").join("runs.db");
    let agent = MockAgent::returning("mock", json!({"ok": true})).shared();

    let run = {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&db).unwrap());
        let orch = orchestrator(&[agent.clone()], store);
        orch.start(Arc::new(fixtures::linear("mock")), HashMap::new())
            .await
            .unwrap()
    };

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&db).unwrap());
    let orch = orchestrator(&[agent.clone()], store);
    let summary = orch.status(&run.run_id).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.succeeded, 3);

    let runs = orch.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].workflow, "linear");

    let resumed = orch.resume(&run.run_id).await.unwrap();
    assert_eq!(resumed, run);
    assert_eq!(agent.calls(), 3);
}

#[tokio::test]
async fn test_briefing_workflow_on_builtin_agents() {
    let config = AppConfig::from_toml(fixtures::BRIEFING_CONFIG).unwrap();
    let definition = config.find_workflow("briefing").unwrap();
    let orch = Orchestrator::new(
        Arc::new(AgentRegistry::with_builtins()),
        Arc::new(MemoryStateStore::new()),
        config.engine.clone(),
    );

    let run = orch.start(Arc::new(definition), HashMap::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let alert = run.node("alert").unwrap().result.as_ref().unwrap();
    assert_eq!(alert.field("sentiment.score"), Some(&json!(-0.8)));
    let report = run.node("report").unwrap().result.as_ref().unwrap();
    assert_eq!(report.field("weather.sky"), Some(&json!("clear")));
    assert_eq!(report.field("news.sentiment.score"), Some(&json!(-0.8)));
}

#[tokio::test]
async fn test_logged_resume_with_nothing_to_do_returns() {
    let dir = tempfile::tempdir().unwrap();
    let agent = MockAgent::new("mock").shared();
    let bus = Arc::new(EventBus::default());
    let orch = orchestrator(&[agent.clone()], Arc::new(MemoryStateStore::new()))
        .with_event_bus(bus.clone());

    let (run, path) = RunLogger::new(dir.path().to_path_buf())
        .record(
            &bus,
            "linear",
            orch.start(Arc::new(fixtures::linear("mock")), HashMap::new()),
        )
        .await;
    let run = run.unwrap();
    let entries = read_log(&path.unwrap()).unwrap();
    assert_eq!(entries.first().unwrap()["type"], "run_started");
    assert_eq!(entries.last().unwrap()["type"], "run_finished");

    let label = format!("resume-{}", run.run_id);
    let (resumed, path) = tokio::time::timeout(
        Duration::from_secs(5),
        RunLogger::new(dir.path().to_path_buf()).record(&bus, &label, orch.resume(&run.run_id)),
    )
    .await
    .expect("logging a finished run's resume must not block");

    assert_eq!(resumed.unwrap(), run);
    assert_eq!(agent.calls(), 3);
    assert!(read_log(&path.unwrap()).unwrap().is_empty());
}
