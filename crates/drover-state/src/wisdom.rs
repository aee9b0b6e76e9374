//! Learned error-pattern store.
//!
//! The loop records classified failures here so the ai-monitor extension
//! can suggest remediations for recurring breakage. Nothing in the core
//! reads it back on the hot path.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::write_json_atomic;
use crate::layout::StateLayout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WisdomEntry {
    /// Error kind code, e.g. `RATE_LIMIT`.
    pub kind: String,
    /// A short output snippet that triggered the classification.
    pub pattern: String,
    pub occurrences: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WisdomStore {
    layout: StateLayout,
}

impl WisdomStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn load(&self) -> Result<Vec<WisdomEntry>> {
        let path = self.layout.wisdom_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse wisdom store at {}", path.display()))
    }

    /// Record one classified failure. Entries are deduplicated on
    /// `(kind, pattern)` with an occurrence counter.
    pub fn record(&self, kind: &str, snippet: &str) -> Result<()> {
        let pattern = normalize_snippet(snippet);
        let mut entries = self.load()?;

        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.kind == kind && e.pattern == pattern)
        {
            existing.occurrences += 1;
            existing.last_seen = Utc::now();
        } else {
            entries.push(WisdomEntry {
                kind: kind.to_string(),
                pattern,
                occurrences: 1,
                last_seen: Utc::now(),
            });
        }

        write_json_atomic(&self.layout.wisdom_file(), &entries)
    }

    pub fn entries_for(&self, kind: &str) -> Result<Vec<WisdomEntry>> {
        Ok(self.load()?.into_iter().filter(|e| e.kind == kind).collect())
    }
}

/// Collapse whitespace and cap length so near-identical failures dedupe.
fn normalize_snippet(snippet: &str) -> String {
    let collapsed: String = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(200).collect()
}
