//! Periodic resource probe over tracked PIDs.
//!
//! One monitor task per pool manager scans every tracked process, reads
//! its resident memory, and reports over-limit observations back to the
//! manager, which enforces the grace window and fires the terminate
//! handler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::WorkerPoolManager;

#[derive(Debug, Clone)]
pub struct ResourceMonitorConfig {
    /// Probe cadence.
    pub interval: Duration,
    /// How long a process may stay over its ceiling before termination.
    pub grace: Duration,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            grace: Duration::from_secs(5),
        }
    }
}

/// Spawn the monitor task. It runs until `cancel` fires.
pub fn spawn_resource_monitor(
    manager: Arc<WorkerPoolManager>,
    config: ResourceMonitorConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new();
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tracked = manager.tracked_snapshot();
            if tracked.is_empty() {
                continue;
            }

            let pids: Vec<sysinfo::Pid> = tracked
                .iter()
                .map(|(pid, _)| sysinfo::Pid::from_u32(*pid))
                .collect();
            sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&pids), true);

            for (pid, pool) in tracked {
                let limit_mb = manager.memory_limit_mb(&pool);
                match sys.process(sysinfo::Pid::from_u32(pid)) {
                    Some(process) => {
                        let rss_mb = process.memory() / (1024 * 1024);
                        if rss_mb > limit_mb {
                            tracing::debug!(pid, rss_mb, limit_mb, pool, "process over memory limit");
                            manager.note_over_limit(pid, rss_mb, limit_mb, config.grace);
                        } else {
                            manager.clear_over_limit(pid);
                        }
                    }
                    None => {
                        // Process exited between tracking and probing.
                        manager.untrack_process(pid);
                    }
                }
            }
        }
    })
}
