//! Registry of live loop processes.
//!
//! Every `drover run` registers itself in `monitor-state.json` so external
//! dashboards (and `drover status`) can enumerate loops across namespaces
//! without talking to them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::write_json_atomic;
use crate::layout::StateLayout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub namespace: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorStateStore {
    layout: StateLayout,
}

impl MonitorStateStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn load(&self) -> Result<Vec<MonitorEntry>> {
        let path = self.layout.monitor_state_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse monitor state at {}", path.display()))
    }

    fn save(&self, entries: &[MonitorEntry]) -> Result<()> {
        write_json_atomic(&self.layout.monitor_state_file(), &entries)
    }

    /// Register a live loop, replacing any stale entry for the same
    /// namespace or pid.
    pub fn register(&self, entry: MonitorEntry) -> Result<()> {
        let mut entries = self.load()?;
        entries.retain(|e| e.namespace != entry.namespace && e.pid != entry.pid);
        entries.push(entry);
        self.save(&entries)
    }

    pub fn remove(&self, pid: u32) -> Result<()> {
        let mut entries = self.load()?;
        entries.retain(|e| e.pid != pid);
        self.save(&entries)
    }

    /// Drop entries whose process is gone, as judged by `alive`.
    pub fn prune_dead(&self, alive: impl Fn(u32) -> bool) -> Result<Vec<MonitorEntry>> {
        let mut entries = self.load()?;
        entries.retain(|e| alive(e.pid));
        self.save(&entries)?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(namespace: &str, pid: u32) -> MonitorEntry {
        MonitorEntry {
            namespace: namespace.to_string(),
            pid,
            started_at: Utc::now(),
            log_file: PathBuf::from("/tmp/loop.log"),
            args: vec!["run".to_string()],
        }
    }

    #[test]
    fn register_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStateStore::new(StateLayout::new(dir.path(), "default"));

        store.register(entry("a", 100)).unwrap();
        store.register(entry("b", 200)).unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn register_replaces_same_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStateStore::new(StateLayout::new(dir.path(), "default"));

        store.register(entry("a", 100)).unwrap();
        store.register(entry("a", 101)).unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pid, 101);
    }

    #[test]
    fn remove_by_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStateStore::new(StateLayout::new(dir.path(), "default"));

        store.register(entry("a", 100)).unwrap();
        store.remove(100).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn prune_dead_drops_dead_pids() {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStateStore::new(StateLayout::new(dir.path(), "default"));

        store.register(entry("a", 100)).unwrap();
        store.register(entry("b", 200)).unwrap();

        let live = store.prune_dead(|pid| pid == 200).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].pid, 200);
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
