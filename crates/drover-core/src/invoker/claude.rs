//! Invoker for the `claude` CLI family.
//!
//! Argv shape: `claude --print --model <id> [--allowedTools a,b,c]
//! [extra args] <prompt>` with the prompt as the positional last argument.
//! Short aliases (`opus`, `sonnet`, `haiku`, case-insensitive) map to full
//! model identifiers through a configurable table; provider prefixes are
//! stripped before alias mapping.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::strip_model_prefix;

use super::{InvokeOptions, Invoker, PromptDelivery};

pub struct ClaudeInvoker {
    aliases: BTreeMap<String, String>,
}

impl ClaudeInvoker {
    pub fn new() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert("opus".to_string(), "claude-opus-4-1".to_string());
        aliases.insert("sonnet".to_string(), "claude-sonnet-4-5".to_string());
        aliases.insert("haiku".to_string(), "claude-haiku-4-5".to_string());
        Self { aliases }
    }

    /// Replace the default alias table.
    pub fn with_aliases(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Strip a provider prefix, then map known aliases case-insensitively.
    fn resolve_model(&self, model: &str) -> String {
        let stripped = strip_model_prefix(model);
        self.aliases
            .get(&stripped.to_lowercase())
            .cloned()
            .unwrap_or_else(|| stripped.to_string())
    }
}

impl Default for ClaudeInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for ClaudeInvoker {
    fn name(&self) -> &str {
        "claude"
    }

    fn command(&self) -> &str {
        "claude"
    }

    fn supported_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.aliases.keys().cloned().collect();
        models.extend(self.aliases.values().cloned());
        models
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn build_args(&self, options: &InvokeOptions) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--model".to_string(),
            self.resolve_model(&options.model),
        ];
        if !options.tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(options.tools.join(","));
        }
        args.extend(options.extra_args.iter().cloned());
        args.push(options.prompt.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(model: &str) -> InvokeOptions {
        InvokeOptions {
            prompt: "do the thing".to_string(),
            model: model.to_string(),
            tools: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn argv_shape_prompt_is_positional_last() {
        let invoker = ClaudeInvoker::new();
        let args = invoker.build_args(&options("claude-sonnet-4-5"));
        assert_eq!(
            args,
            ["--print", "--model", "claude-sonnet-4-5", "do the thing"]
        );
    }

    #[test]
    fn aliases_map_to_full_identifiers() {
        let invoker = ClaudeInvoker::new();
        assert_eq!(invoker.resolve_model("opus"), "claude-opus-4-1");
        assert_eq!(invoker.resolve_model("SONNET"), "claude-sonnet-4-5");
        assert_eq!(invoker.resolve_model("Haiku"), "claude-haiku-4-5");
    }

    #[test]
    fn prefix_is_stripped_before_alias_mapping() {
        let invoker = ClaudeInvoker::new();
        assert_eq!(invoker.resolve_model("anthropic/opus"), "claude-opus-4-1");
    }

    #[test]
    fn unknown_model_passes_through() {
        let invoker = ClaudeInvoker::new();
        assert_eq!(invoker.resolve_model("claude-3-7-sonnet"), "claude-3-7-sonnet");
    }

    #[test]
    fn tool_allowlist_is_comma_joined() {
        let invoker = ClaudeInvoker::new();
        let mut opts = options("sonnet");
        opts.tools = vec!["Bash".to_string(), "Read".to_string(), "Edit".to_string()];
        let args = invoker.build_args(&opts);
        assert_eq!(
            args,
            [
                "--print",
                "--model",
                "claude-sonnet-4-5",
                "--allowedTools",
                "Bash,Read,Edit",
                "do the thing"
            ]
        );
    }

    #[test]
    fn extra_args_come_before_the_prompt() {
        let invoker = ClaudeInvoker::new();
        let mut opts = options("haiku");
        opts.extra_args = vec!["--verbose".to_string()];
        let args = invoker.build_args(&opts);
        assert_eq!(args.last().unwrap(), "do the thing");
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn custom_alias_table() {
        let mut aliases = BTreeMap::new();
        aliases.insert("fast".to_string(), "claude-haiku-4-5".to_string());
        let invoker = ClaudeInvoker::with_aliases(aliases);
        assert_eq!(invoker.resolve_model("fast"), "claude-haiku-4-5");
        // The stock aliases are gone.
        assert_eq!(invoker.resolve_model("opus"), "opus");
    }

    #[test]
    fn supported_models_include_aliases_and_full_ids() {
        let models = ClaudeInvoker::new().supported_models();
        assert!(models.contains(&"opus".to_string()));
        assert!(models.contains(&"claude-opus-4-1".to_string()));
    }
}
