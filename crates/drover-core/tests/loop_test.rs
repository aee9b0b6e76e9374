//! End-to-end loop tests: backend + engine + hooks + persisted state,
//! with agent CLIs faked as shell scripts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_core::agent::{AgentDefinition, AgentRegistry};
use drover_core::driver::{LoopConfig, LoopOutcome, RetryPolicy, TaskLoop};
use drover_core::engine::{EngineConfig, ExecutionEngine};
use drover_core::hooks::{HookBus, HookKind};
use drover_core::model::{ModelConfig, ModelSelector, SelectionStrategy};
use drover_core::pool::WorkerPoolManager;
use drover_core::task::{TaskPriority, TaskStatus};
use drover_core::InvokerRegistry;

use drover_state::{Checkpoint, CheckpointStore, LoopState, SelectorCursor, StateLayout};
use drover_test_utils::{fake_cli, pending_task, recording_cli, MemoryBackend};

// ===========================================================================
// Fixture
// ===========================================================================

struct Fixture {
    dir: tempfile::TempDir,
    backend: Arc<MemoryBackend>,
    hooks: Arc<HookBus>,
    agents: Arc<AgentRegistry>,
    layout: StateLayout,
    record: PathBuf,
}

impl Fixture {
    /// Fake `claude` that records argv and succeeds.
    fn recording() -> Self {
        Self::with_script(|dir, record| {
            recording_cli(dir, "claude", record, "done", 0);
        })
    }

    /// Fake `claude` with a custom body built from the fixture paths.
    fn with_body(builder: impl FnOnce(&Path, &Path) -> String) -> Self {
        Self::with_script(|dir, record| {
            let body = builder(dir, record);
            fake_cli(dir, "claude", &body);
        })
    }

    fn with_script(write_script: impl FnOnce(&Path, &Path)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("argv.log");
        write_script(dir.path(), &record);

        Self {
            layout: StateLayout::new(dir.path(), "default"),
            backend: Arc::new(MemoryBackend::new()),
            hooks: Arc::new(HookBus::new()),
            agents: Arc::new(AgentRegistry::new()),
            record,
            dir,
        }
    }

    fn set_agents(&mut self, agents: AgentRegistry) {
        self.agents = Arc::new(agents);
    }
}

/// Build the engine + loop for a fixture.
fn task_loop(
    fixture: &Fixture,
    models: Vec<ModelConfig>,
    fallback: Vec<ModelConfig>,
    config: LoopConfig,
) -> TaskLoop {
    let mut cli_paths = HashMap::new();
    cli_paths.insert("claude".to_string(), fixture.dir.path().join("claude"));

    let engine_config = EngineConfig {
        env_prefix: "DROVER_LOOP_TEST".to_string(),
        cli_paths,
        kill_grace: Duration::from_millis(200),
        ..Default::default()
    };

    let engine = Arc::new(
        ExecutionEngine::new(
            Arc::new(InvokerRegistry::with_builtins()),
            ModelSelector::new(models, fallback, SelectionStrategy::RoundRobin),
            Arc::new(WorkerPoolManager::with_defaults()),
            Arc::clone(&fixture.hooks),
            engine_config,
        )
        .unwrap(),
    );

    TaskLoop::new(
        Arc::clone(&fixture.backend) as Arc<dyn drover_core::TaskBackend>,
        engine,
        Arc::clone(&fixture.agents),
        Arc::clone(&fixture.hooks),
        fixture.layout.clone(),
        config,
    )
    .unwrap()
}

fn claude_model(name: &str) -> ModelConfig {
    ModelConfig::new(name, "claude", name)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

fn record_lines(record: &Path) -> Vec<String> {
    std::fs::read_to_string(record)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

// ===========================================================================
// Three-agent sequential workflow
// ===========================================================================

#[tokio::test]
async fn three_agent_workflow_runs_models_in_order() {
    let mut fixture = Fixture::recording();

    // Planner -> Implementer -> Reviewer, chained by dependencies.
    let mut agents = AgentRegistry::new();
    agents.register(
        AgentDefinition::new("planner", "", "Plan the work.")
            .unwrap()
            .with_model("opus"),
    );
    agents.register(
        AgentDefinition::new("implementer", "", "Implement the plan.")
            .unwrap()
            .with_model("sonnet"),
    );
    agents.register(
        AgentDefinition::new("reviewer", "", "Review the diff.")
            .unwrap()
            .with_model("haiku"),
    );
    fixture.set_agents(agents);

    fixture.backend.add_task(
        pending_task("T1", TaskPriority::Medium, &[])
            .with_metadata("agent", serde_json::json!("planner")),
    );
    fixture.backend.add_task(
        pending_task("T2", TaskPriority::Medium, &["T1"])
            .with_metadata("agent", serde_json::json!("implementer")),
    );
    fixture.backend.add_task(
        pending_task("T3", TaskPriority::Medium, &["T2"])
            .with_metadata("agent", serde_json::json!("reviewer")),
    );

    let models = vec![claude_model("opus"), claude_model("sonnet"), claude_model("haiku")];
    let mut runner = task_loop(&fixture, models, vec![], LoopConfig::default());

    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, LoopOutcome::BacklogDrained);
    assert_eq!(summary.metrics.completed, 3);
    assert_eq!(summary.metrics.failed, 0);
    assert!(summary.is_success());

    for id in ["T1", "T2", "T3"] {
        assert_eq!(fixture.backend.status_of(id), Some(TaskStatus::Completed));
    }

    // The three invocations passed opus, sonnet, haiku in order (the
    // claude invoker resolves the aliases to full identifiers).
    let lines = record_lines(&fixture.record);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("claude-opus-4-1"));
    assert!(lines[1].contains("claude-sonnet-4-5"));
    assert!(lines[2].contains("claude-haiku-4-5"));
}

// ===========================================================================
// Dependency gating
// ===========================================================================

#[tokio::test]
async fn higher_priority_task_waits_for_its_dependency() {
    let fixture = Fixture::recording();
    fixture
        .backend
        .add_task(pending_task("base", TaskPriority::Low, &[]));
    fixture
        .backend
        .add_task(pending_task("urgent", TaskPriority::Critical, &["base"]));

    let mut runner = task_loop(
        &fixture,
        vec![claude_model("m1")],
        vec![],
        LoopConfig::default(),
    );
    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.metrics.completed, 2);
    // Loop state records the last task executed; the dependency ran first.
    assert_eq!(runner.state().last_task_id.as_deref(), Some("urgent"));
}

#[tokio::test]
async fn quarantined_tasks_are_never_picked() {
    let fixture = Fixture::recording();
    let mut task = pending_task("Q1", TaskPriority::High, &[]);
    task.status = TaskStatus::Quarantined;
    fixture.backend.add_task(task);

    let mut runner = task_loop(
        &fixture,
        vec![claude_model("m1")],
        vec![],
        LoopConfig::default(),
    );
    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, LoopOutcome::BacklogDrained);
    assert_eq!(summary.metrics.completed, 0);
    assert_eq!(fixture.backend.status_of("Q1"), Some(TaskStatus::Quarantined));
}

// ===========================================================================
// Retry policy
// ===========================================================================

#[tokio::test]
async fn failed_attempt_retries_with_context_then_succeeds() {
    let fixture = Fixture::with_body(|dir, _record| {
        let counter = dir.join("count");
        let second_argv = dir.join("argv-second.log");
        format!(
            "count=$(cat {counter} 2>/dev/null || echo 0)\n\
             count=$((count + 1))\n\
             echo $count > {counter}\n\
             if [ \"$count\" -eq 1 ]; then\n\
               echo 'transient failure'\n\
               exit 1\n\
             fi\n\
             echo \"$@\" > {second_argv}\n\
             echo done\n\
             exit 0",
            counter = counter.display(),
            second_argv = second_argv.display(),
        )
    });
    fixture
        .backend
        .add_task(pending_task("T1", TaskPriority::Medium, &[]));

    let mut rx = fixture.hooks.subscribe();

    let config = LoopConfig {
        retry: RetryPolicy {
            max_retries: 1,
            ..fast_retry()
        },
        ..Default::default()
    };
    let mut runner = task_loop(&fixture, vec![claude_model("m1")], vec![], config);
    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.metrics.completed, 1);
    assert_eq!(fixture.backend.status_of("T1"), Some(TaskStatus::Completed));

    // A task_retry hook fired before the second attempt.
    let mut saw_retry = false;
    while let Ok(event) = rx.try_recv() {
        if event.kind() == HookKind::TaskRetry {
            saw_retry = true;
        }
    }
    assert!(saw_retry);

    // The second attempt's prompt carried the previous-attempt context.
    let second_argv =
        std::fs::read_to_string(fixture.dir.path().join("argv-second.log")).unwrap();
    assert!(second_argv.contains("Previous Attempt Context"));
    assert!(second_argv.contains("ALL_MODELS_EXHAUSTED"));
}

#[tokio::test]
async fn exhausted_retries_mark_task_failed_and_enqueue_remediation() {
    let fixture = Fixture::with_body(|_, _| "echo broken\nexit 1".to_string());
    fixture
        .backend
        .add_task(pending_task("T1", TaskPriority::Medium, &[]));

    let config = LoopConfig {
        remediate_failures: true,
        retry: RetryPolicy {
            max_retries: 0,
            ..fast_retry()
        },
        ..Default::default()
    };
    let mut runner = task_loop(&fixture, vec![claude_model("m1")], vec![], config);
    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(fixture.backend.status_of("T1"), Some(TaskStatus::Failed));
    // T1 failed, and its remediation task ran (and failed) too; the
    // remediation task itself spawned no further work.
    assert_eq!(summary.metrics.failed, 2);
    let snapshot = fixture.backend.snapshot();
    assert_eq!(snapshot.len(), 2);
    let remediation = snapshot.iter().find(|t| t.id != "T1").unwrap();
    assert!(remediation.title.starts_with("Remediate:"));
    assert_eq!(remediation.metadata_str("remediates"), Some("T1"));
    assert!(!summary.is_success());
}

// ===========================================================================
// Backend errors
// ===========================================================================

#[tokio::test]
async fn backend_errors_skip_iterations_without_aborting() {
    let fixture = Fixture::recording();
    fixture.backend.set_failing(Some("connection refused"));

    let config = LoopConfig {
        max_iterations: Some(2),
        backend_error_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let mut runner = task_loop(&fixture, vec![claude_model("m1")], vec![], config);
    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, LoopOutcome::MaxIterationsReached);
    assert_eq!(summary.metrics.skipped, 2);
    assert_eq!(summary.metrics.completed, 0);
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn cancellation_requeues_in_flight_task_as_pending() {
    let fixture = Fixture::with_body(|_, _| "sleep 60".to_string());
    fixture
        .backend
        .add_task(pending_task("T1", TaskPriority::Medium, &[]));

    let mut rx = fixture.hooks.subscribe();
    let mut runner = task_loop(
        &fixture,
        vec![claude_model("m1")],
        vec![],
        LoopConfig::default(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let summary = runner.run(cancel).await.unwrap();

    assert_eq!(summary.outcome, LoopOutcome::Stopped);
    // Not failed: pending, so a resumed loop retries it.
    assert_eq!(fixture.backend.status_of("T1"), Some(TaskStatus::Pending));

    let mut saw_abort = false;
    while let Ok(event) = rx.try_recv() {
        if event.kind() == HookKind::TaskAbort {
            saw_abort = true;
        }
    }
    assert!(saw_abort);
}

// ===========================================================================
// Resume after crash
// ===========================================================================

#[tokio::test]
async fn resume_requeues_in_flight_task_and_skips_completed_work() {
    let fixture = Fixture::recording();

    // T1 finished before the "crash"; T2 was mid-flight.
    let mut t1 = pending_task("T1", TaskPriority::Medium, &[]);
    t1.status = TaskStatus::Completed;
    fixture.backend.add_task(t1);
    let mut t2 = pending_task("T2", TaskPriority::Medium, &["T1"]);
    t2.status = TaskStatus::InProgress;
    fixture.backend.add_task(t2);

    // The crashed loop left a checkpoint with T2 in flight.
    let mut crashed_state = LoopState::default();
    crashed_state.iteration = 1;
    crashed_state.last_task_id = Some("T1".to_string());
    crashed_state.metrics.completed = 1;
    let checkpoint = Checkpoint::new(
        crashed_state,
        Some("T2".to_string()),
        1,
        SelectorCursor::default(),
    );
    fixture.layout.ensure_dirs().unwrap();
    CheckpointStore::new(fixture.layout.clone())
        .save(&checkpoint)
        .unwrap();

    let mut runner = task_loop(
        &fixture,
        vec![claude_model("m1")],
        vec![],
        LoopConfig::default(),
    );
    let summary = runner.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcome, LoopOutcome::BacklogDrained);
    // Resumed metrics carried over, plus T2's completion.
    assert_eq!(summary.metrics.completed, 2);
    assert_eq!(summary.iterations, 2);
    assert_eq!(fixture.backend.status_of("T2"), Some(TaskStatus::Completed));

    // T1 was not re-run: exactly one spawn happened in this process.
    assert_eq!(record_lines(&fixture.record).len(), 1);
}

// ===========================================================================
// Persistence at task boundaries
// ===========================================================================

#[tokio::test]
async fn state_and_checkpoints_are_written_at_boundaries() {
    let fixture = Fixture::recording();
    fixture
        .backend
        .add_task(pending_task("T1", TaskPriority::Medium, &[]));

    let mut runner = task_loop(
        &fixture,
        vec![claude_model("m1")],
        vec![],
        LoopConfig::default(),
    );
    runner.run(CancellationToken::new()).await.unwrap();

    let state_file = fixture.layout.state_file();
    assert!(state_file.exists());
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
    assert_eq!(raw["LAST_TASK_ID"], "T1");
    assert_eq!(raw["LAST_ITERATION"], 1);
    assert_eq!(raw["metrics"]["completed"], 1);

    // A verifiable checkpoint exists.
    let latest = CheckpointStore::new(fixture.layout.clone())
        .load_latest()
        .unwrap()
        .expect("boundary checkpoint present");
    assert!(latest.verify());
    assert_eq!(latest.loop_state.iteration, 1);
}
