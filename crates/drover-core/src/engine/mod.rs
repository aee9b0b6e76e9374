//! Model-aware CLI execution engine.
//!
//! One [`ExecutionEngine::execute`] call runs a composed prompt to
//! completion: acquire a pool slot, rotate through the model pools, spawn
//! the chosen invoker's CLI, tee output, enforce timeouts, classify the
//! exit, and either return a success or advance to the next model. The
//! engine never raises for per-attempt failures; only an exhausted pool,
//! a hard spawn guard, or cancellation surface as errors.

pub mod classify;
pub mod spawn;

pub use spawn::{PtySpawner, SpawnOutcome, SpawnSpec};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use drover_state::SelectorCursor;

use crate::error::{AttemptOutcome, AttemptRecord, DroverError};
use crate::hooks::{HookBus, HookEvent};
use crate::invoker::{CliLocator, InvokeOptions, InvokerRegistry, PromptDelivery};
use crate::model::{ModelConfig, ModelSelector};
use crate::pool::{memory, WorkerPoolManager};
use crate::task::TaskPriority;

use classify::{classify_output, read_tail, OutputClass, OUTPUT_TAIL_BYTES};
use spawn::{spawn_piped, ChunkFn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix for `<PREFIX>_<NAME>_PATH` CLI overrides.
    pub env_prefix: String,
    /// Configured CLI paths, consulted after env overrides.
    pub cli_paths: HashMap<String, PathBuf>,
    /// Timeout when neither the model nor the agent sets one.
    pub default_timeout_secs: u64,
    /// Window between graceful terminate and force kill.
    pub kill_grace: Duration,
    /// Fixed wait after a rate limit; exponential backoff when unset.
    pub rate_limit_wait: Option<Duration>,
    /// Base for exponential rate-limit backoff.
    pub backoff_base: Duration,
    /// Cap for exponential rate-limit backoff.
    pub max_delay: Duration,
    /// Retry the same model after a rate limit instead of advancing.
    pub retry_same_model: bool,
    /// Bound on same-model retries. Mandatory with `retry_same_model`.
    pub max_retries_per_model: Option<u32>,
    /// Prefer a PTY spawner when one is configured and available.
    pub prefer_pty: bool,
    /// Hard floor of available memory below which spawns are refused.
    pub min_available_memory_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            env_prefix: "DROVER".to_string(),
            cli_paths: HashMap::new(),
            default_timeout_secs: 300,
            kill_grace: Duration::from_secs(5),
            rate_limit_wait: None,
            backoff_base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            retry_same_model: false,
            max_retries_per_model: None,
            prefer_pty: true,
            min_available_memory_bytes: memory::MIN_AVAILABLE_MEMORY_BYTES,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), DroverError> {
        if self.retry_same_model && self.max_retries_per_model.is_none() {
            return Err(DroverError::ConfigInvalid {
                reason: "retry_same_model requires max_retries_per_model; \
                         unbounded same-model retries are refused"
                    .to_string(),
            });
        }
        if self.default_timeout_secs == 0 {
            return Err(DroverError::ConfigInvalid {
                reason: "default_timeout_secs must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// One execution request: a composed prompt plus routing metadata.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    /// Attempt output is teed here; classification reads its tail.
    pub output_file: PathBuf,
    pub task_id: Option<String>,
    /// Preferred model (agent- or task-level); the first attempt uses it
    /// when it names an enabled model in either pool. Failover then
    /// proceeds through the selector as usual.
    pub model: Option<String>,
    pub priority: Option<TaskPriority>,
    pub feature: Option<String>,
    /// Caller (agent-level) environment overrides. Model overrides win.
    pub env: Vec<(String, String)>,
    /// Agent-level timeout; model timeouts take precedence.
    pub agent_timeout_secs: Option<u64>,
    pub tools: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>, output_file: PathBuf) -> Self {
        Self {
            prompt: prompt.into(),
            output_file,
            task_id: None,
            model: None,
            priority: None,
            feature: None,
            env: Vec::new(),
            agent_timeout_secs: None,
            tools: Vec::new(),
            working_dir: None,
        }
    }
}

/// Successful execution summary.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Collected output, capped; the output file holds the full text.
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub resource_exhausted: Option<String>,
    /// Generic name of the model that succeeded.
    pub model: String,
    pub cli: String,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
}

pub struct ExecutionEngine {
    registry: Arc<InvokerRegistry>,
    selector: Mutex<ModelSelector>,
    pools: Arc<WorkerPoolManager>,
    hooks: Arc<HookBus>,
    config: EngineConfig,
    /// Resolved CLI name -> executable path.
    cli_paths: HashMap<String, PathBuf>,
    /// PIDs killed by the resource governor, with the reason.
    resource_exhausted: Arc<Mutex<HashMap<u32, String>>>,
    retry_counters: Mutex<HashMap<String, u32>>,
    pty: Option<Arc<dyn PtySpawner>>,
}

impl ExecutionEngine {
    /// Build the engine: validates config, resolves every registered CLI
    /// (fails with [`DroverError::CliNotFound`] when none resolve), and
    /// wires the pool manager's terminate handler.
    pub fn new(
        registry: Arc<InvokerRegistry>,
        selector: ModelSelector,
        pools: Arc<WorkerPoolManager>,
        hooks: Arc<HookBus>,
        config: EngineConfig,
    ) -> Result<Self, DroverError> {
        config.validate()?;

        let locator = CliLocator::new(config.env_prefix.clone(), config.cli_paths.clone());
        let commands = registry.commands();
        let cli_paths = locator.locate_all(&commands)?;

        let resource_exhausted: Arc<Mutex<HashMap<u32, String>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::clone(&resource_exhausted);
        pools.set_terminate_handler(Arc::new(move |pid, reason| {
            {
                let mut map = sink.lock().unwrap_or_else(|e| e.into_inner());
                map.insert(pid, reason);
            }
            #[cfg(unix)]
            {
                // SAFETY: the governor only hands us pids it tracked.
                unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            }
        }));

        Ok(Self {
            registry,
            selector: Mutex::new(selector),
            pools,
            hooks,
            config,
            cli_paths,
            resource_exhausted,
            retry_counters: Mutex::new(HashMap::new()),
            pty: None,
        })
    }

    /// Inject a PTY spawner, preferred over pipes when available.
    pub fn with_pty_spawner(mut self, pty: Arc<dyn PtySpawner>) -> Self {
        self.pty = Some(pty);
        self
    }

    pub fn selector_cursor(&self) -> SelectorCursor {
        self.selector.lock().unwrap_or_else(|e| e.into_inner()).cursor()
    }

    pub fn restore_selector_cursor(&self, cursor: SelectorCursor) {
        self.selector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .restore_cursor(cursor);
    }

    pub fn in_fallback(&self) -> bool {
        self.selector.lock().unwrap_or_else(|e| e.into_inner()).in_fallback()
    }

    /// Operator/test reset of the one-way fallback switch.
    pub fn reset_selector(&self) {
        self.selector.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    pub fn pools(&self) -> &Arc<WorkerPoolManager> {
        &self.pools
    }

    fn rate_limit_delay(&self, attempt: u32) -> Duration {
        match self.config.rate_limit_wait {
            Some(fixed) => fixed,
            None => {
                let base_ms = self.config.backoff_base.as_millis() as u64;
                let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(exp.min(self.config.max_delay.as_millis() as u64))
            }
        }
    }

    /// Count a failed primary-pool attempt; once every enabled primary
    /// model has failed, flip to the fallback pool. Switching to an empty
    /// fallback would leave the selector permanently dead (the switch is
    /// one-way), so it only happens when fallback models exist.
    fn note_pool_failure(&self, primary_failures: &mut usize) {
        let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
        if !selector.in_fallback() {
            *primary_failures += 1;
            if *primary_failures >= selector.primary_enabled_len()
                && selector.fallback_enabled_len() > 0
            {
                selector.switch_to_fallback();
            }
        }
    }

    /// Run one prompt to completion across the model pools.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DroverError> {
        let started = Instant::now();
        let task_id = request.task_id.clone();

        self.hooks.emit(HookEvent::ExecutionStart {
            task_id: task_id.clone(),
        });

        let pool_name = self
            .pools
            .pool_for_task(request.feature.as_deref(), request.priority);
        // The guard releases the slot on every exit path, including
        // cancellation.
        let _slot = self.pools.acquire(&pool_name, task_id.clone()).await?;

        let total_models = {
            let selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            selector.total_enabled()
        };

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt: u32 = 0;
        let mut primary_failures: usize = 0;
        let mut retry_model: Option<ModelConfig> = None;
        // Per-task model preference, consumed by the first attempt.
        let mut preferred: Option<ModelConfig> = request.model.as_deref().and_then(|name| {
            let selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            let found = selector.find_by_name(name);
            if found.is_none() {
                tracing::warn!(model = name, "preferred model is not configured, using rotation");
            }
            found
        });

        while (attempt as usize) < total_models {
            if cancel.is_cancelled() {
                self.emit_execution_end(&task_id, false, attempt, started);
                return Err(DroverError::Cancelled("execution cancelled".to_string()));
            }

            let model = match retry_model.take().or_else(|| preferred.take()) {
                Some(model) => model,
                None => {
                    let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
                    match selector.get_next() {
                        Some(model) => model,
                        None => break,
                    }
                }
            };

            self.hooks.emit(HookEvent::ModelSelected {
                task_id: task_id.clone(),
                cli: model.cli.clone(),
                model: model.name.clone(),
                attempt,
            });

            // Resolve the invoker: by configured CLI name first, then by
            // model string, finally by availability probe.
            let invoker = match self.registry.get(&model.cli) {
                Some(invoker) => invoker,
                None => match self.registry.resolve_for_model(&model.model_string).await {
                    Some(invoker) => invoker,
                    None => {
                        tracing::warn!(cli = %model.cli, model = %model.name, "no invoker for model, skipping");
                        attempts.push(AttemptRecord {
                            cli: model.cli.clone(),
                            model: model.name.clone(),
                            exit_code: None,
                            timed_out: false,
                            outcome: AttemptOutcome::SpawnSkipped,
                        });
                        attempt += 1;
                        self.note_pool_failure(&mut primary_failures);
                        continue;
                    }
                },
            };

            // Skip silently when the CLI never resolved to a path.
            let Some(program) = self.cli_paths.get(invoker.command()) else {
                tracing::debug!(cli = %invoker.command(), "CLI not locatable, skipping model");
                attempts.push(AttemptRecord {
                    cli: model.cli.clone(),
                    model: model.name.clone(),
                    exit_code: None,
                    timed_out: false,
                    outcome: AttemptOutcome::SpawnSkipped,
                });
                attempt += 1;
                self.note_pool_failure(&mut primary_failures);
                continue;
            };

            // Pre-spawn memory guard: a starved host fails hard, before
            // the kernel OOM killer picks a victim for us.
            let available = memory::available_memory_bytes();
            if available < self.config.min_available_memory_bytes {
                self.emit_execution_end(&task_id, false, attempt, started);
                return Err(DroverError::SpawnFailed {
                    reason: format!(
                        "{} MiB available, below the {} MiB floor",
                        available / (1024 * 1024),
                        self.config.min_available_memory_bytes / (1024 * 1024)
                    ),
                });
            }

            let effective_timeout_secs = model
                .timeout_secs
                .or(request.agent_timeout_secs)
                .unwrap_or(self.config.default_timeout_secs);

            // Env precedence: process env, then caller/agent overrides,
            // then model overrides.
            let mut env = request.env.clone();
            env.extend(model.env.iter().map(|(k, v)| (k.clone(), v.clone())));

            let args = invoker.build_args(&InvokeOptions {
                prompt: request.prompt.clone(),
                model: model.model_string.clone(),
                tools: request.tools.clone(),
                extra_args: model.args.clone(),
            });
            let stdin_payload = matches!(invoker.prompt_delivery(), PromptDelivery::Stdin)
                .then(|| request.prompt.clone());

            let spec = SpawnSpec {
                program: program.clone(),
                args,
                env,
                stdin_payload,
                nice: self.pools.nice_for(&pool_name),
                working_dir: request.working_dir.clone(),
                output_file: request.output_file.clone(),
                timeout: Duration::from_secs(effective_timeout_secs),
                kill_grace: self.config.kill_grace,
            };

            self.hooks.emit(HookEvent::CliSpawnStart {
                task_id: task_id.clone(),
                cli: model.cli.clone(),
                model: model.name.clone(),
                attempt,
            });

            let on_chunk: ChunkFn = {
                let hooks = Arc::clone(&self.hooks);
                let task_id = task_id.clone();
                Arc::new(move |chunk: &[u8]| {
                    hooks.emit(HookEvent::AgentResponse {
                        task_id: task_id.clone(),
                        chunk: String::from_utf8_lossy(chunk).into_owned(),
                    });
                })
            };
            let on_spawned: spawn::SpawnedFn = {
                let pools = Arc::clone(&self.pools);
                let pool_name = pool_name.clone();
                let task_id = task_id.clone();
                Box::new(move |pid| {
                    pools.track_process(pid, &pool_name, task_id);
                })
            };

            let use_pty = self.config.prefer_pty
                && self.pty.as_ref().is_some_and(|pty| pty.is_available());
            let outcome = if use_pty {
                // Unwrap is guarded by use_pty above.
                let pty = self.pty.as_ref().map(Arc::clone);
                match pty {
                    Some(pty) => pty.spawn(&spec, on_chunk, on_spawned, cancel).await,
                    None => spawn_piped(&spec, on_chunk, on_spawned, cancel).await,
                }
            } else {
                spawn_piped(&spec, on_chunk, on_spawned, cancel).await
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(cli = %model.cli, model = %model.name, error = %e, "spawn failed, advancing to next model");
                    self.hooks.emit(HookEvent::CliSpawnEnd {
                        task_id: task_id.clone(),
                        cli: model.cli.clone(),
                        model: model.name.clone(),
                        attempt,
                        pid: None,
                    });
                    attempts.push(AttemptRecord {
                        cli: model.cli.clone(),
                        model: model.name.clone(),
                        exit_code: None,
                        timed_out: false,
                        outcome: AttemptOutcome::Failed,
                    });
                    attempt += 1;
                    self.note_pool_failure(&mut primary_failures);
                    continue;
                }
            };

            self.pools.untrack_process(outcome.pid);
            self.hooks.emit(HookEvent::CliSpawnEnd {
                task_id: task_id.clone(),
                cli: model.cli.clone(),
                model: model.name.clone(),
                attempt,
                pid: Some(outcome.pid),
            });

            let duration_ms = outcome.duration.as_millis() as u64;
            self.hooks.emit(HookEvent::CliResult {
                task_id: task_id.clone(),
                cli: model.cli.clone(),
                model: model.name.clone(),
                attempt,
                exit_code: outcome.exit_code,
                duration_ms,
                timed_out: outcome.timed_out,
            });

            if outcome.cancelled {
                self.emit_execution_end(&task_id, false, attempt + 1, started);
                return Err(DroverError::Cancelled("execution cancelled".to_string()));
            }

            // Did the resource governor kill this pid?
            let resource_reason = {
                let mut map = self.resource_exhausted.lock().unwrap_or_else(|e| e.into_inner());
                map.remove(&outcome.pid)
            };
            if let Some(reason) = resource_reason {
                tracing::warn!(pid = outcome.pid, %reason, "attempt ended by resource governor");
                attempts.push(AttemptRecord {
                    cli: model.cli.clone(),
                    model: model.name.clone(),
                    exit_code: outcome.exit_code,
                    timed_out: false,
                    outcome: AttemptOutcome::ResourceExhausted,
                });
                attempt += 1;
                self.note_pool_failure(&mut primary_failures);
                continue;
            }

            if outcome.timed_out {
                attempts.push(AttemptRecord {
                    cli: model.cli.clone(),
                    model: model.name.clone(),
                    exit_code: outcome.exit_code,
                    timed_out: true,
                    outcome: AttemptOutcome::TimedOut,
                });
                attempt += 1;
                self.note_pool_failure(&mut primary_failures);
                continue;
            }

            let tail = read_tail(&request.output_file, OUTPUT_TAIL_BYTES);
            match classify_output(&tail) {
                OutputClass::RateLimited => {
                    attempts.push(AttemptRecord {
                        cli: model.cli.clone(),
                        model: model.name.clone(),
                        exit_code: outcome.exit_code,
                        timed_out: false,
                        outcome: AttemptOutcome::RateLimited,
                    });

                    let delay = self.rate_limit_delay(attempt);
                    tracing::info!(
                        model = %model.name,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            self.emit_execution_end(&task_id, false, attempt + 1, started);
                            return Err(DroverError::Cancelled("execution cancelled".to_string()));
                        }
                    }

                    if self.config.retry_same_model {
                        // Validation guarantees the bound is present.
                        let max = self.config.max_retries_per_model.unwrap_or(0);
                        let mut counters =
                            self.retry_counters.lock().unwrap_or_else(|e| e.into_inner());
                        let count = counters.entry(model.name.clone()).or_insert(0);
                        if *count < max {
                            *count += 1;
                            retry_model = Some(model);
                            continue;
                        }
                        counters.remove(&model.name);
                    }
                    attempt += 1;
                    self.note_pool_failure(&mut primary_failures);
                }
                OutputClass::QuotaExceeded => {
                    attempts.push(AttemptRecord {
                        cli: model.cli.clone(),
                        model: model.name.clone(),
                        exit_code: outcome.exit_code,
                        timed_out: false,
                        outcome: AttemptOutcome::QuotaExceeded,
                    });
                    {
                        let mut selector =
                            self.selector.lock().unwrap_or_else(|e| e.into_inner());
                        if selector.fallback_enabled_len() > 0 {
                            selector.switch_to_fallback();
                        }
                    }
                    attempt += 1;
                }
                OutputClass::Clean => {
                    if outcome.exit_code == Some(0) {
                        attempts.push(AttemptRecord {
                            cli: model.cli.clone(),
                            model: model.name.clone(),
                            exit_code: Some(0),
                            timed_out: false,
                            outcome: AttemptOutcome::Succeeded,
                        });
                        self.emit_execution_end(&task_id, true, attempt + 1, started);
                        return Ok(ExecutionResult {
                            exit_code: 0,
                            output: outcome.output,
                            duration: started.elapsed(),
                            timed_out: false,
                            resource_exhausted: None,
                            model: model.name,
                            cli: model.cli,
                            attempts: attempt + 1,
                        });
                    }
                    attempts.push(AttemptRecord {
                        cli: model.cli.clone(),
                        model: model.name.clone(),
                        exit_code: outcome.exit_code,
                        timed_out: false,
                        outcome: AttemptOutcome::Failed,
                    });
                    attempt += 1;
                    self.note_pool_failure(&mut primary_failures);
                }
            }
        }

        self.emit_execution_end(&task_id, false, attempt, started);
        Err(DroverError::AllModelsExhausted { attempts })
    }

    fn emit_execution_end(
        &self,
        task_id: &Option<String>,
        success: bool,
        attempts: u32,
        started: Instant,
    ) {
        self.hooks.emit(HookEvent::ExecutionEnd {
            task_id: task_id.clone(),
            success,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("cli_paths", &self.cli_paths)
            .field("prefer_pty", &self.config.prefer_pty)
            .finish()
    }
}
