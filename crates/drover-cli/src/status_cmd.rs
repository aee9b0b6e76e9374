//! `drover status` -- print persisted loop state and live-loop registry.

use std::path::PathBuf;

use anyhow::Result;

use drover_state::{CheckpointStore, LoopStateStore, MonitorStateStore, StateLayout};

fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from(format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}

pub fn run(project_dir: PathBuf, namespace: String) -> Result<()> {
    let layout = StateLayout::new(&project_dir, &namespace);

    let state = LoopStateStore::new(layout.clone()).load()?;
    println!("namespace: {namespace}");
    println!("state file: {}", layout.state_file().display());
    println!("  iteration: {}", state.iteration);
    println!(
        "  last task: {}",
        state.last_task_id.as_deref().unwrap_or("-")
    );
    println!(
        "  completed: {}  failed: {}  skipped: {}",
        state.metrics.completed, state.metrics.failed, state.metrics.skipped
    );
    println!("  fallback pool active: {}", state.in_fallback);

    match CheckpointStore::new(layout.clone()).load_latest()? {
        Some(checkpoint) => {
            println!(
                "latest checkpoint: {} (in flight: {})",
                checkpoint.timestamp.to_rfc3339(),
                checkpoint.in_flight_task_id.as_deref().unwrap_or("-")
            );
        }
        None => println!("latest checkpoint: none"),
    }

    let entries = MonitorStateStore::new(layout).load()?;
    if entries.is_empty() {
        println!("live loops: none");
    } else {
        println!("live loops:");
        for entry in entries {
            let liveness = if pid_alive(entry.pid) { "" } else { " (stale)" };
            println!(
                "  {} pid {}{} since {}",
                entry.namespace,
                entry.pid,
                liveness,
                entry.started_at.to_rfc3339()
            );
        }
    }

    Ok(())
}
