//! Invoker for the `gemini` CLI family.
//!
//! Argv shape: `gemini -m <id> [extra args]` with the prompt written to
//! stdin. The CLI runs non-interactively whenever stdin is not a TTY, so
//! no extra flag is needed.

use async_trait::async_trait;

use crate::model::strip_model_prefix;

use super::{InvokeOptions, Invoker, PromptDelivery};

pub struct GeminiInvoker;

impl GeminiInvoker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GeminiInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for GeminiInvoker {
    fn name(&self) -> &str {
        "gemini"
    }

    fn command(&self) -> &str {
        "gemini"
    }

    fn supported_models(&self) -> Vec<String> {
        vec![
            "gemini-flash".to_string(),
            "gemini-pro".to_string(),
            "gemini-2.0-flash".to_string(),
            "gemini-2.5-pro".to_string(),
        ]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Stdin
    }

    fn build_args(&self, options: &InvokeOptions) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            strip_model_prefix(&options.model).to_string(),
        ];
        args.extend(options.extra_args.iter().cloned());
        args
    }
}
