//! The task loop driver.
//!
//! One loop iteration: check termination, fetch the next ready task from
//! the backend, resolve its agent, mark it in-progress, execute through
//! the engine, apply the retry policy, update metrics, and persist loop
//! state plus a checkpoint at the task boundary. Cancellation is observed
//! at every suspension point; an in-flight task is re-marked pending (not
//! failed) so a resumed loop can pick it up again.

pub mod retry;

pub use retry::{BackoffStrategy, RetryPolicy};

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use drover_state::{Checkpoint, CheckpointStore, LoopMetrics, LoopState, LoopStateStore, StateLayout, WisdomStore};

use crate::agent::{AgentDefinition, AgentRegistry};
use crate::backend::{NewTask, StatusFields, TaskBackend};
use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::error::DroverError;
use crate::hooks::{HookBus, HookEvent};
use crate::prompt::build_prompt;
use crate::task::{Task, TaskPriority, TaskStatus};

/// How many checkpoints to keep on disk.
const CHECKPOINT_KEEP: usize = 20;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub namespace: String,
    /// Stop after this many iterations; `None` runs until the backlog
    /// drains or a stop signal arrives.
    pub max_iterations: Option<u64>,
    /// Minimum spacing of mid-execution checkpoints. Task-boundary
    /// checkpoints are always written.
    pub checkpoint_throttle: Duration,
    /// Enqueue a remediation task when a task fails terminally.
    pub remediate_failures: bool,
    /// Pause after a backend error before the next iteration.
    pub backend_error_backoff: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            max_iterations: None,
            checkpoint_throttle: Duration::from_secs(60),
            remediate_failures: false,
            backend_error_backoff: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The backend had no ready tasks left.
    BacklogDrained,
    MaxIterationsReached,
    /// Operator stop or cancellation signal.
    Stopped,
    /// An essential plugin degraded or a fatal error unwound.
    Aborted { reason: String },
}

#[derive(Debug, Clone)]
pub struct LoopSummary {
    pub outcome: LoopOutcome,
    pub iterations: u64,
    pub metrics: LoopMetrics,
}

impl LoopSummary {
    /// Process exit status: zero only when nothing failed or was skipped.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, LoopOutcome::Aborted { .. })
            && self.metrics.failed == 0
            && self.metrics.skipped == 0
    }
}

enum TaskOutcome {
    Completed,
    Failed,
    Skipped,
    Aborted,
}

pub struct TaskLoop {
    backend: Arc<dyn TaskBackend>,
    engine: Arc<ExecutionEngine>,
    agents: Arc<AgentRegistry>,
    hooks: Arc<HookBus>,
    layout: StateLayout,
    state_store: LoopStateStore,
    checkpoints: CheckpointStore,
    wisdom: WisdomStore,
    config: LoopConfig,
    state: LoopState,
    last_checkpoint_at: Option<Instant>,
}

impl TaskLoop {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        engine: Arc<ExecutionEngine>,
        agents: Arc<AgentRegistry>,
        hooks: Arc<HookBus>,
        layout: StateLayout,
        config: LoopConfig,
    ) -> Result<Self> {
        config.retry.validate()?;
        layout.ensure_dirs()?;
        Ok(Self {
            backend,
            engine,
            agents,
            hooks,
            state_store: LoopStateStore::new(layout.clone()),
            checkpoints: CheckpointStore::new(layout.clone()),
            wisdom: WisdomStore::new(layout.clone()),
            layout,
            config,
            state: LoopState::default(),
            last_checkpoint_at: None,
        })
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Restore loop state from the latest valid checkpoint and requeue a
    /// task the previous process left in flight.
    async fn resume(&mut self) -> Result<()> {
        self.state = self.state_store.load().unwrap_or_default();

        let Some(checkpoint) = self.checkpoints.load_latest()? else {
            return Ok(());
        };

        tracing::info!(
            iteration = checkpoint.loop_state.iteration,
            in_flight = ?checkpoint.in_flight_task_id,
            "resuming from checkpoint"
        );
        self.state = checkpoint.loop_state.clone();
        self.engine.restore_selector_cursor(checkpoint.selector_cursor);

        if let Some(task_id) = &checkpoint.in_flight_task_id {
            match self.backend.get_task(task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::InProgress => {
                    self.backend
                        .update_task_status(task_id, TaskStatus::Pending, StatusFields::default())
                        .await
                        .map_err(|e| anyhow::anyhow!("failed to requeue in-flight task: {e}"))?;
                    tracing::info!(task_id = %task_id, "requeued in-flight task for retry");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "could not inspect in-flight task on resume");
                }
            }
        }
        Ok(())
    }

    fn persist(&mut self, in_flight: Option<String>, attempt_index: u32) {
        if let Err(e) = self.state_store.save(&self.state) {
            tracing::warn!(error = %e, "failed to persist loop state");
        }
        let checkpoint = Checkpoint::new(
            self.state.clone(),
            in_flight,
            attempt_index,
            self.engine.selector_cursor(),
        );
        match self.checkpoints.save(&checkpoint) {
            Ok(_) => {
                self.last_checkpoint_at = Some(Instant::now());
                if let Err(e) = self.checkpoints.prune(CHECKPOINT_KEEP) {
                    tracing::warn!(error = %e, "failed to prune checkpoints");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to write checkpoint"),
        }
    }

    /// Mid-execution checkpoint, throttled.
    fn maybe_persist(&mut self, in_flight: &str, attempt_index: u32) {
        let due = match self.last_checkpoint_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.checkpoint_throttle,
        };
        if due {
            self.persist(Some(in_flight.to_string()), attempt_index);
        }
    }

    async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => true,
        }
    }

    /// Run until a terminal condition and return a summary.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<LoopSummary> {
        self.resume().await.context("checkpoint resume failed")?;

        self.hooks.emit(HookEvent::LoopStart {
            namespace: self.config.namespace.clone(),
            iteration: self.state.iteration,
        });

        let run_label = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let mut backend_ready_emitted = false;

        let outcome = loop {
            if cancel.is_cancelled() {
                break LoopOutcome::Stopped;
            }
            if let Some(max) = self.config.max_iterations {
                if self.state.iteration >= max {
                    break LoopOutcome::MaxIterationsReached;
                }
            }
            if self.hooks.essential_degraded() {
                break LoopOutcome::Aborted {
                    reason: "essential plugin degraded".to_string(),
                };
            }

            let task = match self.backend.find_next_task().await {
                Ok(task) => {
                    if !backend_ready_emitted {
                        backend_ready_emitted = true;
                        self.hooks.emit(HookEvent::BackendReady {
                            backend: "task-backend".to_string(),
                        });
                    }
                    task
                }
                Err(e) => {
                    // A flaky backend skips the iteration, it does not
                    // abort the loop.
                    tracing::warn!(error = %e, "backend error, skipping iteration");
                    self.state.metrics.skipped += 1;
                    self.state.iteration += 1;
                    self.persist(None, 0);
                    if Self::sleep_or_cancel(self.config.backend_error_backoff, &cancel).await {
                        break LoopOutcome::Stopped;
                    }
                    continue;
                }
            };

            let Some(task) = task else {
                break LoopOutcome::BacklogDrained;
            };

            match self.run_task(&task, &run_label, &cancel).await {
                TaskOutcome::Completed => self.state.metrics.completed += 1,
                TaskOutcome::Failed => self.state.metrics.failed += 1,
                TaskOutcome::Skipped => self.state.metrics.skipped += 1,
                TaskOutcome::Aborted => {
                    self.state.in_fallback = self.engine.in_fallback();
                    self.persist(None, 0);
                    break LoopOutcome::Stopped;
                }
            }

            self.state.iteration += 1;
            self.state.last_task_id = Some(task.id.clone());
            self.state.in_fallback = self.engine.in_fallback();
            self.hooks.emit(HookEvent::Step {
                iteration: self.state.iteration,
            });
            // Task boundary: always checkpoint.
            self.persist(None, 0);
        };

        self.hooks.emit(HookEvent::LoopEnd {
            iterations: self.state.iteration,
            completed: self.state.metrics.completed,
            failed: self.state.metrics.failed,
        });
        if let Err(e) = self.state_store.save(&self.state) {
            tracing::warn!(error = %e, "failed to persist final loop state");
        }

        Ok(LoopSummary {
            outcome,
            iterations: self.state.iteration,
            metrics: self.state.metrics.clone(),
        })
    }

    fn resolve_agent(&self, task: &Task) -> Option<Arc<AgentDefinition>> {
        task.metadata_str("agent")
            .and_then(|name| {
                let found = self.agents.get(name);
                if found.is_none() {
                    tracing::warn!(task_id = %task.id, agent = name, "task names an unregistered agent");
                }
                found
            })
            .or_else(|| self.agents.default_agent())
    }

    /// Execute one task through the engine with task-level retries.
    async fn run_task(
        &mut self,
        task: &Task,
        run_label: &str,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        if let Err(e) = self
            .backend
            .update_task_status(&task.id, TaskStatus::InProgress, StatusFields::started_now())
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "cannot mark task in-progress, skipping");
            return TaskOutcome::Skipped;
        }

        self.hooks.emit(HookEvent::TaskStart {
            task_id: task.id.clone(),
            title: task.title.clone(),
            iteration: self.state.iteration,
        });

        let agent = self.resolve_agent(task);
        let policy = self.config.retry.with_task_overrides(task);
        let task_started = Instant::now();
        let mut retry_context: Option<String> = None;

        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                self.maybe_persist(&task.id, attempt);
            }

            let prompt = build_prompt(task, agent.as_deref(), retry_context.as_deref());
            let output_file =
                self.layout
                    .run_log_file(run_label, &task.id, &format!("attempt{attempt}"));

            let request = ExecutionRequest {
                prompt,
                output_file: output_file.clone(),
                task_id: Some(task.id.clone()),
                model: task
                    .metadata_str("model")
                    .map(str::to_string)
                    .or_else(|| agent.as_ref().and_then(|a| a.model().map(str::to_string))),
                priority: Some(task.priority),
                feature: task.feature.clone(),
                env: agent
                    .as_ref()
                    .map(|a| {
                        a.env()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
                agent_timeout_secs: task
                    .metadata_u64("timeout_secs")
                    .or_else(|| agent.as_ref().and_then(|a| a.timeout_secs())),
                tools: agent.as_ref().map(|a| a.tools().to_vec()).unwrap_or_default(),
                working_dir: None,
            };

            match self.engine.execute(request, cancel).await {
                Ok(result) => {
                    // Rough spend accounting; real token counts would need
                    // semantic output parsing, which is out of scope.
                    self.state
                        .metrics
                        .record_tokens(&result.model, (result.output.len() / 4) as u64);
                    if let Err(e) = self
                        .backend
                        .update_task_status(
                            &task.id,
                            TaskStatus::Completed,
                            StatusFields::completed_now(),
                        )
                        .await
                    {
                        tracing::warn!(task_id = %task.id, error = %e, "failed to mark task completed");
                    }
                    self.hooks.emit(HookEvent::TaskComplete {
                        task_id: task.id.clone(),
                        duration_ms: task_started.elapsed().as_millis() as u64,
                        iteration: self.state.iteration,
                    });
                    self.finalize_log(&output_file, run_label, &task.id, "completed");
                    return TaskOutcome::Completed;
                }
                Err(DroverError::Cancelled(_)) => {
                    return self.abort_task(task, "cancelled").await;
                }
                Err(error) => {
                    if let Err(e) = self.wisdom.record(error.code(), &error.to_string()) {
                        tracing::debug!(error = %e, "failed to record wisdom entry");
                    }

                    if policy.is_retryable(&error) && attempt < policy.max_retries {
                        let delay = policy.delay_with_jitter(attempt);
                        self.hooks.emit(HookEvent::TaskRetry {
                            task_id: task.id.clone(),
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                        });
                        retry_context = Some(format!(
                            "Attempt {} failed ({}): {}",
                            attempt + 1,
                            error.code(),
                            error
                        ));
                        if Self::sleep_or_cancel(delay, cancel).await {
                            return self.abort_task(task, "cancelled during retry backoff").await;
                        }
                        attempt += 1;
                        continue;
                    }

                    if let Err(e) = self
                        .backend
                        .update_task_status(
                            &task.id,
                            TaskStatus::Failed,
                            StatusFields::completed_now(),
                        )
                        .await
                    {
                        tracing::warn!(task_id = %task.id, error = %e, "failed to mark task failed");
                    }
                    self.hooks.emit(HookEvent::TaskFailed {
                        task_id: task.id.clone(),
                        error: error.to_string(),
                        iteration: self.state.iteration,
                    });
                    self.finalize_log(&output_file, run_label, &task.id, "failed");

                    // Never remediate a remediation task; that way lies an
                    // unbounded chain.
                    if self.config.remediate_failures && task.metadata_str("remediates").is_none() {
                        self.enqueue_remediation(task, &error).await;
                    }
                    return TaskOutcome::Failed;
                }
            }
        }
    }

    /// Cancellation mid-task: put the task back to pending for a resumed
    /// loop, never mark it failed.
    async fn abort_task(&self, task: &Task, reason: &str) -> TaskOutcome {
        if let Err(e) = self
            .backend
            .update_task_status(&task.id, TaskStatus::Pending, StatusFields::default())
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "failed to requeue task on abort");
        }
        self.hooks.emit(HookEvent::TaskAbort {
            task_id: task.id.clone(),
            reason: reason.to_string(),
        });
        TaskOutcome::Aborted
    }

    async fn enqueue_remediation(&self, task: &Task, error: &DroverError) {
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("remediates".to_string(), serde_json::json!(task.id));
        metadata.insert("failure_code".to_string(), serde_json::json!(error.code()));

        let input = NewTask {
            title: format!("Remediate: {}", task.title),
            description: format!(
                "Task {} ({}) failed: {}\n\nInvestigate the failure and fix the underlying problem.",
                task.id, task.title, error
            ),
            priority: Some(TaskPriority::High),
            feature: task.feature.clone(),
            dependencies: Vec::new(),
            metadata,
        };
        match self.backend.create_task(input).await {
            Ok(created) => {
                tracing::info!(task_id = %task.id, remediation = %created.id, "enqueued remediation task");
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to enqueue remediation task");
            }
        }
    }

    /// Rename the final attempt's log to the `<task>-<status>.log` shape
    /// consumed by log viewers.
    fn finalize_log(&self, attempt_log: &std::path::Path, run_label: &str, task_id: &str, status: &str) {
        let final_path = self.layout.run_log_file(run_label, task_id, status);
        if attempt_log.exists() {
            if let Err(e) = std::fs::rename(attempt_log, &final_path) {
                tracing::debug!(error = %e, "failed to rename attempt log");
            }
        }
    }
}

impl std::fmt::Debug for TaskLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLoop")
            .field("namespace", &self.config.namespace)
            .field("iteration", &self.state.iteration)
            .finish()
    }
}
