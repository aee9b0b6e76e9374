//! Checksummed resume snapshots.
//!
//! A checkpoint captures everything the loop needs to resume after a crash
//! without asking the backend to remember mid-flight state. The checksum
//! covers the serialized snapshot with the checksum field blanked; a
//! mismatch on load means a torn or tampered file and the snapshot is
//! discarded rather than trusted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use anyhow::{Context, Result};

use crate::atomic::write_atomic;
use crate::layout::StateLayout;
use crate::loop_state::LoopState;

/// Position of the model selector, enough to restore rotation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorCursor {
    pub primary_index: usize,
    pub fallback_index: usize,
    pub in_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub loop_state: LoopState,
    pub in_flight_task_id: Option<String>,
    pub attempt_index: u32,
    pub selector_cursor: SelectorCursor,
    pub timestamp: DateTime<Utc>,
    /// Hex sha256 of the snapshot serialized with this field empty.
    pub checksum: String,
}

impl Checkpoint {
    pub fn new(
        loop_state: LoopState,
        in_flight_task_id: Option<String>,
        attempt_index: u32,
        selector_cursor: SelectorCursor,
    ) -> Self {
        let mut cp = Self {
            loop_state,
            in_flight_task_id,
            attempt_index,
            selector_cursor,
            timestamp: Utc::now(),
            checksum: String::new(),
        };
        cp.checksum = cp.compute_checksum();
        cp
    }

    fn compute_checksum(&self) -> String {
        let mut blank = self.clone();
        blank.checksum = String::new();
        // Serialization of a struct we just built cannot fail.
        let bytes = serde_json::to_vec(&blank).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn verify(&self) -> bool {
        !self.checksum.is_empty() && self.checksum == self.compute_checksum()
    }
}

/// Reads and writes checkpoints under `.drover/checkpoints/`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: StateLayout,
}

impl CheckpointStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    /// Persist a checkpoint as `<task>-<iter>.json`. The write is atomic;
    /// a crash mid-write leaves either the previous snapshot or nothing.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<std::path::PathBuf> {
        let task_label = checkpoint
            .in_flight_task_id
            .as_deref()
            .unwrap_or("boundary");
        let path = self
            .layout
            .checkpoint_file(task_label, checkpoint.loop_state.iteration);
        let bytes =
            serde_json::to_vec_pretty(checkpoint).context("failed to serialize checkpoint")?;
        write_atomic(&path, &bytes)?;
        Ok(path)
    }

    /// Load the most recent checkpoint that passes checksum verification.
    ///
    /// Corrupt or torn files are logged and skipped, never trusted.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let dir = self.layout.checkpoints_dir();
        if !dir.exists() {
            return Ok(None);
        }

        let mut candidates: Vec<Checkpoint> = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable checkpoint, skipping");
                    continue;
                }
            };
            let cp: Checkpoint = match serde_json::from_str(&contents) {
                Ok(cp) => cp,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "malformed checkpoint, skipping");
                    continue;
                }
            };
            if !cp.verify() {
                tracing::warn!(path = %path.display(), "checkpoint checksum mismatch, discarding");
                continue;
            }
            candidates.push(cp);
        }

        candidates.sort_by_key(|cp| cp.timestamp);
        Ok(candidates.pop())
    }

    /// Delete all but the `keep` most recent checkpoints.
    pub fn prune(&self, keep: usize) -> Result<()> {
        let dir = self.layout.checkpoints_dir();
        if !dir.exists() {
            return Ok(());
        }

        let mut files: Vec<(std::time::SystemTime, std::path::PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                files.push((
                    meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                    entry.path(),
                ));
            }
        }
        files.sort_by_key(|(mtime, _)| *mtime);
        let excess = files.len().saturating_sub(keep);
        for (_, path) in files.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to prune checkpoint");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(StateLayout::new(dir, "default"))
    }

    fn sample(iteration: u64, task: Option<&str>) -> Checkpoint {
        let state = LoopState {
            iteration,
            last_task_id: Some("T0".to_string()),
            ..Default::default()
        };
        Checkpoint::new(
            state,
            task.map(str::to_string),
            1,
            SelectorCursor {
                primary_index: 2,
                fallback_index: 0,
                in_fallback: false,
            },
        )
    }

    #[test]
    fn checksum_verifies_after_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let cp = sample(3, Some("T3"));
        assert!(cp.verify());
        let path = s.save(&cp).unwrap();
        assert!(path.ends_with("T3-3.json"));

        let loaded = s.load_latest().unwrap().expect("checkpoint present");
        assert_eq!(loaded, cp);
        assert!(loaded.verify());
    }

    #[test]
    fn tampered_checkpoint_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let cp = sample(1, Some("T1"));
        let path = s.save(&cp).unwrap();

        // Flip the iteration without recomputing the checksum.
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("\"LAST_ITERATION\": 1", "\"LAST_ITERATION\": 99"))
            .unwrap();

        assert!(s.load_latest().unwrap().is_none());
    }

    #[test]
    fn torn_checkpoint_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let layout = StateLayout::new(dir.path(), "default");
        layout.ensure_dirs().unwrap();
        std::fs::write(layout.checkpoint_file("T1", 1), "{\"loop_state\": {").unwrap();

        assert!(s.load_latest().unwrap().is_none());
    }

    #[test]
    fn latest_by_timestamp_wins() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let older = sample(1, Some("T1"));
        let mut newer = sample(2, Some("T2"));
        newer.timestamp = older.timestamp + chrono::Duration::seconds(10);
        newer.checksum = String::new();
        newer.checksum = {
            let mut blank = newer.clone();
            blank.checksum = String::new();
            hex::encode(Sha256::digest(serde_json::to_vec(&blank).unwrap()))
        };

        s.save(&older).unwrap();
        s.save(&newer).unwrap();

        let loaded = s.load_latest().unwrap().unwrap();
        assert_eq!(loaded.in_flight_task_id.as_deref(), Some("T2"));
    }

    #[test]
    fn missing_dir_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load_latest().unwrap().is_none());
    }

    #[test]
    fn prune_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        for i in 0..5 {
            s.save(&sample(i, Some(&format!("T{i}")))).unwrap();
        }
        s.prune(2).unwrap();

        let remaining = std::fs::read_dir(s.layout.checkpoints_dir())
            .unwrap()
            .count();
        assert_eq!(remaining, 2);
    }
}
