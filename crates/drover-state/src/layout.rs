//! Filesystem layout of the `.drover/` state directory.
//!
//! ```text
//! .drover/
//!   state.json                      loop state, default namespace
//!   state-<namespace>.json          loop state, named namespace
//!   monitor-state.json              one entry per live loop process
//!   <namespace>.pid                 pid file for a running loop
//!   checkpoints/<task>-<iter>.json  checksummed resume snapshots
//!   runs/<namespace>/<ts>/logs/     per-attempt agent output files
//!   ai-monitor/wisdom.json          learned error patterns
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".drover";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resolved paths for one namespace's persisted state.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
    namespace: String,
}

impl StateLayout {
    /// Layout rooted at `<project_dir>/.drover` for the given namespace.
    pub fn new(project_dir: &Path, namespace: impl Into<String>) -> Self {
        Self {
            root: project_dir.join(STATE_DIR_NAME),
            namespace: namespace.into(),
        }
    }

    /// Layout for the current working directory.
    pub fn discover(namespace: impl Into<String>) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to resolve current directory")?;
        Ok(Self::new(&cwd, namespace))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `state.json` for the default namespace, `state-<ns>.json` otherwise.
    pub fn state_file(&self) -> PathBuf {
        if self.namespace == DEFAULT_NAMESPACE {
            self.root.join("state.json")
        } else {
            self.root.join(format!("state-{}.json", self.namespace))
        }
    }

    pub fn monitor_state_file(&self) -> PathBuf {
        self.root.join("monitor-state.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(format!("{}.pid", self.namespace))
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn checkpoint_file(&self, task_id: &str, iteration: u64) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("{}-{}.json", sanitize(task_id), iteration))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs").join(&self.namespace)
    }

    /// Log directory for one run, keyed by a caller-supplied timestamp label.
    pub fn run_logs_dir(&self, run_label: &str) -> PathBuf {
        self.runs_dir().join(run_label).join("logs")
    }

    /// `runs/<ns>/<label>/logs/<task>-<status>.log`
    pub fn run_log_file(&self, run_label: &str, task_id: &str, status: &str) -> PathBuf {
        self.run_logs_dir(run_label)
            .join(format!("{}-{}.log", sanitize(task_id), status))
    }

    pub fn wisdom_file(&self) -> PathBuf {
        self.root.join("ai-monitor").join("wisdom.json")
    }

    /// Files the observability watcher should monitor for cross-process
    /// writes: loop state, monitor registry, the pid file, and checkpoints.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        vec![
            self.state_file(),
            self.monitor_state_file(),
            self.pid_file(),
            self.checkpoints_dir(),
        ]
    }

    /// Create the directory skeleton.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.checkpoints_dir(),
            self.runs_dir(),
            self.wisdom_file().parent().map(Path::to_path_buf).unwrap_or_default(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Task ids are opaque strings from the backend; keep file names tame.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
