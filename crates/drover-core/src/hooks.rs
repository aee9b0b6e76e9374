//! Lifecycle hook bus.
//!
//! Events are a fixed enumeration with per-kind payloads. Plugins register
//! a handler set (a record of optional functions keyed by kind) and are
//! dispatched sequentially in registration order. A handler error never
//! aborts the loop: it is logged and the plugin is marked degraded. The
//! bus also fans events out over a broadcast channel for stream consumers
//! (the observability surface).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event kind the loop and engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    ConfigLoad,
    LoopStart,
    TaskStart,
    TaskComplete,
    TaskFailed,
    TaskRetry,
    TaskAbort,
    LoopEnd,
    Step,
    ToolCall,
    AgentResponse,
    CliResult,
    BackendReady,
    ExecutionStart,
    ModelSelected,
    CliSpawnStart,
    CliSpawnEnd,
    ExecutionEnd,
}

impl HookKind {
    pub const ALL: [HookKind; 18] = [
        HookKind::ConfigLoad,
        HookKind::LoopStart,
        HookKind::TaskStart,
        HookKind::TaskComplete,
        HookKind::TaskFailed,
        HookKind::TaskRetry,
        HookKind::TaskAbort,
        HookKind::LoopEnd,
        HookKind::Step,
        HookKind::ToolCall,
        HookKind::AgentResponse,
        HookKind::CliResult,
        HookKind::BackendReady,
        HookKind::ExecutionStart,
        HookKind::ModelSelected,
        HookKind::CliSpawnStart,
        HookKind::CliSpawnEnd,
        HookKind::ExecutionEnd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigLoad => "config_load",
            Self::LoopStart => "loop_start",
            Self::TaskStart => "task_start",
            Self::TaskComplete => "task_complete",
            Self::TaskFailed => "task_failed",
            Self::TaskRetry => "task_retry",
            Self::TaskAbort => "task_abort",
            Self::LoopEnd => "loop_end",
            Self::Step => "step",
            Self::ToolCall => "tool_call",
            Self::AgentResponse => "agent_response",
            Self::CliResult => "cli_result",
            Self::BackendReady => "backend_ready",
            Self::ExecutionStart => "execution_start",
            Self::ModelSelected => "model_selected",
            Self::CliSpawnStart => "cli_spawn_start",
            Self::CliSpawnEnd => "cli_spawn_end",
            Self::ExecutionEnd => "execution_end",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event with its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    ConfigLoad { namespace: String },
    LoopStart { namespace: String, iteration: u64 },
    TaskStart { task_id: String, title: String, iteration: u64 },
    TaskComplete { task_id: String, duration_ms: u64, iteration: u64 },
    TaskFailed { task_id: String, error: String, iteration: u64 },
    TaskRetry { task_id: String, attempt: u32, delay_ms: u64 },
    TaskAbort { task_id: String, reason: String },
    LoopEnd { iterations: u64, completed: u64, failed: u64 },
    Step { iteration: u64 },
    ToolCall { task_id: Option<String>, tool: String },
    AgentResponse { task_id: Option<String>, chunk: String },
    CliResult {
        task_id: Option<String>,
        cli: String,
        model: String,
        attempt: u32,
        exit_code: Option<i32>,
        duration_ms: u64,
        timed_out: bool,
    },
    BackendReady { backend: String },
    ExecutionStart { task_id: Option<String> },
    ModelSelected { task_id: Option<String>, cli: String, model: String, attempt: u32 },
    CliSpawnStart { task_id: Option<String>, cli: String, model: String, attempt: u32 },
    CliSpawnEnd {
        task_id: Option<String>,
        cli: String,
        model: String,
        attempt: u32,
        pid: Option<u32>,
    },
    ExecutionEnd { task_id: Option<String>, success: bool, attempts: u32, duration_ms: u64 },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            Self::ConfigLoad { .. } => HookKind::ConfigLoad,
            Self::LoopStart { .. } => HookKind::LoopStart,
            Self::TaskStart { .. } => HookKind::TaskStart,
            Self::TaskComplete { .. } => HookKind::TaskComplete,
            Self::TaskFailed { .. } => HookKind::TaskFailed,
            Self::TaskRetry { .. } => HookKind::TaskRetry,
            Self::TaskAbort { .. } => HookKind::TaskAbort,
            Self::LoopEnd { .. } => HookKind::LoopEnd,
            Self::Step { .. } => HookKind::Step,
            Self::ToolCall { .. } => HookKind::ToolCall,
            Self::AgentResponse { .. } => HookKind::AgentResponse,
            Self::CliResult { .. } => HookKind::CliResult,
            Self::BackendReady { .. } => HookKind::BackendReady,
            Self::ExecutionStart { .. } => HookKind::ExecutionStart,
            Self::ModelSelected { .. } => HookKind::ModelSelected,
            Self::CliSpawnStart { .. } => HookKind::CliSpawnStart,
            Self::CliSpawnEnd { .. } => HookKind::CliSpawnEnd,
            Self::ExecutionEnd { .. } => HookKind::ExecutionEnd,
        }
    }
}

pub type HookFn = Arc<dyn Fn(&HookEvent) -> anyhow::Result<()> + Send + Sync>;

/// A plugin's handler set: optional functions keyed by kind, plus an
/// optional catch-all for kinds without a dedicated handler.
#[derive(Default, Clone)]
pub struct HookHandlers {
    handlers: HashMap<HookKind, HookFn>,
    catch_all: Option<HookFn>,
}

impl HookHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, kind: HookKind, f: F) -> Self
    where
        F: Fn(&HookEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(f));
        self
    }

    /// Handler for every kind not covered by a dedicated `on` handler.
    pub fn any<F>(mut self, f: F) -> Self
    where
        F: Fn(&HookEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.catch_all = Some(Arc::new(f));
        self
    }

    fn handler_for(&self, kind: HookKind) -> Option<&HookFn> {
        self.handlers.get(&kind).or(self.catch_all.as_ref())
    }
}

struct PluginEntry {
    name: String,
    essential: bool,
    handlers: HookHandlers,
    degraded: AtomicBool,
}

/// The bus: sequential plugin dispatch plus a broadcast fan-out.
pub struct HookBus {
    plugins: RwLock<Vec<PluginEntry>>,
    broadcast: broadcast::Sender<HookEvent>,
}

impl HookBus {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self {
            plugins: RwLock::new(Vec::new()),
            broadcast,
        }
    }

    pub fn register(&self, name: impl Into<String>, handlers: HookHandlers) {
        self.register_inner(name.into(), handlers, false);
    }

    /// An essential plugin's failure makes the loop abort instead of
    /// continuing degraded.
    pub fn register_essential(&self, name: impl Into<String>, handlers: HookHandlers) {
        self.register_inner(name.into(), handlers, true);
    }

    fn register_inner(&self, name: String, handlers: HookHandlers, essential: bool) {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        plugins.push(PluginEntry {
            name,
            essential,
            handlers,
            degraded: AtomicBool::new(false),
        });
    }

    /// Live event stream for observers. Slow receivers lag, they do not
    /// block dispatch.
    pub fn subscribe(&self) -> broadcast::Receiver<HookEvent> {
        self.broadcast.subscribe()
    }

    /// Dispatch one event: broadcast first, then plugins in registration
    /// order. Handler errors are logged and degrade the plugin.
    pub fn emit(&self, event: HookEvent) {
        // No receivers is fine.
        let _ = self.broadcast.send(event.clone());

        let kind = event.kind();
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        for plugin in plugins.iter() {
            let Some(handler) = plugin.handlers.handler_for(kind) else {
                continue;
            };
            if let Err(e) = handler(&event) {
                tracing::warn!(
                    plugin = %plugin.name,
                    kind = %kind,
                    error = %e,
                    "hook handler failed; marking plugin degraded"
                );
                plugin.degraded.store(true, Ordering::Relaxed);
            }
        }
    }

    pub fn degraded_plugins(&self) -> Vec<String> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins
            .iter()
            .filter(|p| p.degraded.load(Ordering::Relaxed))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Whether any essential plugin has degraded; the loop aborts on this.
    pub fn essential_degraded(&self) -> bool {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins
            .iter()
            .any(|p| p.essential && p.degraded.load(Ordering::Relaxed))
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let names: Vec<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
        f.debug_struct("HookBus").field("plugins", &names).finish()
    }
}
