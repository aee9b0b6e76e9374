//! Per-namespace loop state, written after every task transition.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::atomic::write_json_atomic;
use crate::layout::StateLayout;

/// Cumulative counters kept across loop iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Rough per-model token spend, keyed by generic model name.
    #[serde(default)]
    pub tokens_by_model: BTreeMap<String, u64>,
}

impl LoopMetrics {
    pub fn record_tokens(&mut self, model: &str, tokens: u64) {
        *self.tokens_by_model.entry(model.to_string()).or_insert(0) += tokens;
    }
}

/// Process-wide loop state. The loop driver is the only writer; dashboards
/// and `drover status` read the serialized form.
///
/// The `LAST_TASK_ID` / `LAST_ITERATION` key casing is part of the on-disk
/// contract consumed by external dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(rename = "LAST_TASK_ID", default)]
    pub last_task_id: Option<String>,
    #[serde(rename = "LAST_ITERATION", default)]
    pub iteration: u64,
    /// Per-model rate-limit retry counters.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Whether the model selector has switched to the fallback pool.
    #[serde(default)]
    pub in_fallback: bool,
    #[serde(default)]
    pub metrics: LoopMetrics,
}

/// Loads and saves [`LoopState`] for one namespace.
#[derive(Debug, Clone)]
pub struct LoopStateStore {
    layout: StateLayout,
}

impl LoopStateStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    /// Load the persisted state, or the default when none exists yet.
    pub fn load(&self) -> Result<LoopState> {
        let path = self.layout.state_file();
        if !path.exists() {
            return Ok(LoopState::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse loop state at {}", path.display()))
    }

    pub fn save(&self, state: &LoopState) -> Result<()> {
        write_json_atomic(&self.layout.state_file(), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store(dir: &Path) -> LoopStateStore {
        LoopStateStore::new(StateLayout::new(dir, "default"))
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = store(dir.path()).load().unwrap();
        assert_eq!(state, LoopState::default());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let mut state = LoopState {
            last_task_id: Some("T7".to_string()),
            iteration: 12,
            in_fallback: true,
            ..Default::default()
        };
        state.metrics.completed = 10;
        state.metrics.failed = 2;
        state.metrics.record_tokens("gemini-flash", 4200);
        state.retry_counts.insert("sonnet".to_string(), 1);

        s.save(&state).unwrap();
        assert_eq!(s.load().unwrap(), state);
    }

    #[test]
    fn on_disk_keys_use_dashboard_casing() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let state = LoopState {
            last_task_id: Some("T1".to_string()),
            iteration: 3,
            ..Default::default()
        };
        s.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(s.layout.state_file()).unwrap())
                .unwrap();
        assert_eq!(raw["LAST_TASK_ID"], "T1");
        assert_eq!(raw["LAST_ITERATION"], 3);
        assert!(raw.get("metrics").is_some());
    }

    #[test]
    fn namespaced_states_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = LoopStateStore::new(StateLayout::new(dir.path(), "a"));
        let b = LoopStateStore::new(StateLayout::new(dir.path(), "b"));

        a.save(&LoopState {
            iteration: 1,
            ..Default::default()
        })
        .unwrap();
        b.save(&LoopState {
            iteration: 2,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(a.load().unwrap().iteration, 1);
        assert_eq!(b.load().unwrap().iteration, 2);
    }
}
