//! Model configuration and name normalization.

pub mod selector;

pub use selector::{ModelSelector, SelectionStrategy};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COST_WEIGHT: u32 = 50;

fn default_cost_weight() -> u32 {
    DEFAULT_COST_WEIGHT
}

fn default_enabled() -> bool {
    true
}

/// Maps a generic model name to a concrete CLI invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Generic name used in task metadata and metrics, e.g. "gemini-flash".
    pub name: String,
    /// Invoker name that runs this model, e.g. "claude".
    pub cli: String,
    /// Concrete model identifier handed to the CLI.
    pub model_string: String,
    /// Per-model timeout in seconds; overrides agent and default timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Relative cost used by the cost-aware strategy.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: u32,
    /// Extra argv appended before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides applied to spawns of this model. These win
    /// over agent-level overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Disabled models are skipped by the selector.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ModelConfig {
    pub fn new(
        name: impl Into<String>,
        cli: impl Into<String>,
        model_string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cli: cli.into(),
            model_string: model_string.into(),
            timeout_secs: None,
            cost_weight: DEFAULT_COST_WEIGHT,
            args: Vec::new(),
            env: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_cost_weight(mut self, weight: u32) -> Self {
        self.cost_weight = weight;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Strip an optional `provider/` prefix from a model identifier: the part
/// after the first `/` when one is present, the input otherwise.
pub fn strip_model_prefix(model: &str) -> &str {
    match model.split_once('/') {
        Some((_, rest)) => rest,
        None => model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_provider_prefix() {
        assert_eq!(strip_model_prefix("anthropic/sonnet"), "sonnet");
        assert_eq!(strip_model_prefix("google/gemini-flash"), "gemini-flash");
    }

    #[test]
    fn strip_leaves_bare_names_alone() {
        assert_eq!(strip_model_prefix("sonnet"), "sonnet");
        assert_eq!(strip_model_prefix(""), "");
    }

    #[test]
    fn strip_is_idempotent_for_prefixed_names() {
        for input in ["anthropic/sonnet", "sonnet", "x/y"] {
            let once = strip_model_prefix(input);
            assert_eq!(strip_model_prefix(once), once);
        }
    }

    #[test]
    fn config_defaults() {
        let json = r#"{"name":"flash","cli":"gemini","model_string":"gemini-2.0-flash"}"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cost_weight, DEFAULT_COST_WEIGHT);
        assert!(config.enabled);
        assert!(config.timeout_secs.is_none());
        assert!(config.args.is_empty());
    }

    #[test]
    fn builder_helpers() {
        let config = ModelConfig::new("flash", "gemini", "gemini-2.0-flash")
            .with_timeout_secs(120)
            .with_cost_weight(10);
        assert_eq!(config.timeout_secs, Some(120));
        assert_eq!(config.cost_weight, 10);

        let off = ModelConfig::new("x", "claude", "x").disabled();
        assert!(!off.enabled);
    }
}
