//! Invoker for the `droid` CLI family.
//!
//! Argv shape: `droid -m <id> [extra args] -p <string>`. Droid is
//! non-interactive by default; there is no separate flag for it.

use async_trait::async_trait;

use crate::model::strip_model_prefix;

use super::{InvokeOptions, Invoker, PromptDelivery};

pub struct DroidInvoker;

impl DroidInvoker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DroidInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for DroidInvoker {
    fn name(&self) -> &str {
        "droid"
    }

    fn command(&self) -> &str {
        "droid"
    }

    fn supported_models(&self) -> Vec<String> {
        vec!["droid-core".to_string(), "droid-mini".to_string()]
    }

    fn prompt_delivery(&self) -> PromptDelivery {
        PromptDelivery::Argv
    }

    fn build_args(&self, options: &InvokeOptions) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            strip_model_prefix(&options.model).to_string(),
        ];
        args.extend(options.extra_args.iter().cloned());
        args.push("-p".to_string());
        args.push(options.prompt.clone());
        args
    }
}
