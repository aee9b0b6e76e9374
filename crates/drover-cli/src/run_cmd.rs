//! `drover run` -- assemble the stack and drive the task loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use drover_core::driver::{LoopConfig, LoopSummary, TaskLoop};
use drover_core::engine::ExecutionEngine;
use drover_core::error::DroverError;
use drover_core::hooks::{HookBus, HookEvent};
use drover_core::invoker::InvokerRegistry;
use drover_core::observe::Observer;
use drover_core::pool::monitor::{spawn_resource_monitor, ResourceMonitorConfig};
use drover_core::TaskBackend;
use drover_state::{write_atomic, MonitorEntry, MonitorStateStore, StateLayout};

use crate::backend_file::FileBackend;
use crate::config::ConfigFile;

pub struct RunArgs {
    pub project_dir: PathBuf,
    pub namespace: String,
    pub max_iterations: Option<u64>,
    pub tasks_file: Option<PathBuf>,
    pub remediate: bool,
}

/// Run the loop to completion. Returns the process exit code.
pub async fn run(config: ConfigFile, args: RunArgs) -> Result<i32> {
    let layout = StateLayout::new(&args.project_dir, &args.namespace);
    layout.ensure_dirs()?;

    let tasks_path = args
        .tasks_file
        .unwrap_or_else(|| layout.root().join("tasks.json"));
    let backend = Arc::new(
        FileBackend::open(&tasks_path)
            .with_context(|| format!("failed to open task file {}", tasks_path.display()))?,
    );
    if backend.is_empty() {
        println!(
            "No tasks in {}; seed it and run again.",
            tasks_path.display()
        );
        return Ok(0);
    }

    let hooks = Arc::new(HookBus::new());
    let observer = Observer::new(256);
    observer.install(&hooks);
    hooks.emit(HookEvent::ConfigLoad {
        namespace: args.namespace.clone(),
    });

    let pools = Arc::new(config.pool_manager()?);
    let cancel = CancellationToken::new();
    let monitor_handle = spawn_resource_monitor(
        Arc::clone(&pools),
        ResourceMonitorConfig::default(),
        cancel.child_token(),
    );

    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(InvokerRegistry::with_builtins()),
        config.selector(),
        Arc::clone(&pools),
        Arc::clone(&hooks),
        config.engine_config(),
    )?);
    let agents = Arc::new(config.agent_registry()?);

    let loop_config = LoopConfig {
        namespace: args.namespace.clone(),
        max_iterations: args.max_iterations,
        remediate_failures: args.remediate,
        retry: config.retry_policy(),
        ..Default::default()
    };
    let mut task_loop = TaskLoop::new(
        Arc::clone(&backend) as Arc<dyn TaskBackend>,
        engine,
        agents,
        Arc::clone(&hooks),
        layout.clone(),
        loop_config,
    )?;

    // Register this loop for external observers.
    let monitor_store = MonitorStateStore::new(layout.clone());
    let pid = std::process::id();
    if let Err(e) = monitor_store.register(MonitorEntry {
        namespace: args.namespace.clone(),
        pid,
        started_at: Utc::now(),
        log_file: layout.runs_dir(),
        args: std::env::args().collect(),
    }) {
        tracing::warn!(error = %e, "failed to register in monitor state");
    }
    if let Err(e) = write_atomic(&layout.pid_file(), pid.to_string().as_bytes()) {
        tracing::warn!(error = %e, "failed to write pid file");
    }

    // Operator stop: first Ctrl-C cancels; the loop finishes the
    // in-flight subprocess (up to its timeout) and requeues the task.
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop signal received, finishing in-flight work");
            stopper.cancel();
        }
    });

    let outcome = task_loop.run(cancel.clone()).await;

    cancel.cancel();
    let _ = monitor_handle.await;
    pools.shutdown();
    if let Err(e) = monitor_store.remove(pid) {
        tracing::warn!(error = %e, "failed to deregister from monitor state");
    }
    let _ = std::fs::remove_file(layout.pid_file());

    match outcome {
        Ok(summary) => {
            print_summary(&summary);
            Ok(if summary.is_success() { 0 } else { 1 })
        }
        Err(error) => {
            print_fatal(&error);
            Ok(2)
        }
    }
}

fn print_summary(summary: &LoopSummary) {
    println!();
    println!("Loop finished: {:?}", summary.outcome);
    println!("  iterations: {}", summary.iterations);
    println!(
        "  completed: {}  failed: {}  skipped: {}",
        summary.metrics.completed, summary.metrics.failed, summary.metrics.skipped
    );
    if !summary.metrics.tokens_by_model.is_empty() {
        println!("  approx tokens by model:");
        for (model, tokens) in &summary.metrics.tokens_by_model {
            println!("    {model}: {tokens}");
        }
    }
}

fn print_fatal(error: &anyhow::Error) {
    eprintln!("drover run failed: {error:#}");
    if let Some(drover) = error.downcast_ref::<DroverError>() {
        eprintln!("  code: {}", drover.code());
        for hint in drover.remediations() {
            eprintln!("  hint: {hint}");
        }
    }
}
