//! Invoker for the `opencode` CLI family.
//!
//! Argv shape: `opencode --yes --model <id> [extra args] --prompt <string>`.
//! No tool allowlist support.

use async_trait::async_trait;

use crate::model::strip_model_prefix;

use super::{InvokeOptions, Invoker, PromptDelivery};

pub struct OpencodeInvoker;

impl OpencodeInvoker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpencodeInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for OpencodeInvoker {
    fn name(&self) -> &str {
        "opencode"
    }

    fn command(&self) -> &str {
        "opencode"
    }

    fn supported_models(&self) -> Vec<String> {
        vec![
            "gpt-5".to_string(),
            "gpt-5-mini".to_string(),
            "o4-mini".to_string(),
        ]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn build_args(&self, options: &InvokeOptions) -> Vec<String> {
        let mut args = vec![
            "--yes".to_string(),
            "--model".to_string(),
            strip_model_prefix(&options.model).to_string(),
        ];
        args.extend(options.extra_args.iter().cloned());
        args.push("--prompt".to_string());
        args.push(options.prompt.clone());
        args
    }
}
