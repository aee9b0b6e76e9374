//! `drover tasks` -- list the backlog from the task file.

use std::path::PathBuf;

use anyhow::{Context, Result};

use drover_core::task::TaskStatus;
use drover_core::TaskBackend;
use drover_state::StateLayout;

use crate::backend_file::FileBackend;

pub async fn run(
    project_dir: PathBuf,
    namespace: String,
    tasks_file: Option<PathBuf>,
    status: Option<String>,
) -> Result<()> {
    let layout = StateLayout::new(&project_dir, &namespace);
    let tasks_path = tasks_file.unwrap_or_else(|| layout.root().join("tasks.json"));
    let backend = FileBackend::open(&tasks_path)
        .with_context(|| format!("failed to open task file {}", tasks_path.display()))?;

    let filter: Option<TaskStatus> = match status.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value(serde_json::Value::String(raw.to_string()))
                .map_err(|_| anyhow::anyhow!("unknown status '{raw}'"))?,
        ),
    };

    let pending = backend.list_pending_tasks().await?;
    let completed = backend.list_completed_tasks().await?;
    let failed = backend.list_failed_tasks().await?;

    println!("tasks in {}:", tasks_path.display());
    println!(
        "  pending: {}  completed: {}  failed: {}",
        pending.len(),
        completed.len(),
        failed.len()
    );

    let all = [pending, completed, failed].concat();
    for task in all {
        if let Some(filter) = filter {
            if task.status != filter {
                continue;
            }
        }
        let deps = if task.dependencies.is_empty() {
            String::new()
        } else {
            format!(" (after {})", task.dependencies.join(", "))
        };
        println!(
            "  [{}] {} {} -- {}{}",
            task.status, task.priority, task.id, task.title, deps
        );
    }

    Ok(())
}
