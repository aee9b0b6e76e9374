//! The `Invoker` trait -- the adapter interface for agent CLIs.
//!
//! Each concrete invoker wraps one external agent CLI (claude, opencode,
//! droid, gemini) and knows its argv shape: non-interactive flags, model
//! flag, how the prompt is delivered, and whether a tool allowlist is
//! supported. The trait is object-safe so invokers can be stored as
//! `Arc<dyn Invoker>` in the [`InvokerRegistry`].

pub mod claude;
pub mod droid;
pub mod gemini;
pub mod locate;
pub mod opencode;

pub use claude::ClaudeInvoker;
pub use droid::DroidInvoker;
pub use gemini::GeminiInvoker;
pub use locate::CliLocator;
pub use opencode::OpencodeInvoker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DroverError;
use crate::model::strip_model_prefix;

/// How the prompt reaches the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    /// The prompt is part of the argv built by [`Invoker::build_args`].
    Argv,
    /// The prompt is written to the child's stdin, which is then closed.
    Stdin,
}

/// Inputs for building one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub prompt: String,
    /// Model identifier as configured; invokers normalize it themselves.
    pub model: String,
    /// Tool allowlist; ignored by invokers without one.
    pub tools: Vec<String>,
    /// Extra argv from the model config, inserted before the prompt.
    pub extra_args: Vec<String>,
}

/// Adapter interface for one agent CLI.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Registry name, e.g. "claude".
    fn name(&self) -> &str;

    /// Executable to locate on the host, e.g. "claude".
    fn command(&self) -> &str;

    /// Model strings this CLI accepts, used to index the registry.
    fn supported_models(&self) -> Vec<String>;

    fn prompt_delivery(&self) -> PromptDelivery;

    /// Build the full argv (excluding the program itself). Pure: no I/O,
    /// no environment reads.
    fn build_args(&self, options: &InvokeOptions) -> Vec<String>;

    /// Probe whether this CLI is usable on the host.
    async fn is_available(&self) -> bool {
        locate::which(self.command()).is_some()
    }
}

// Compile-time assertion: Invoker must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Invoker) {}
};

/// Registry of invokers plus a model-string index.
///
/// Each supported-model string maps to the invoker that registered it
/// first; later registrations never steal an index entry.
#[derive(Default)]
pub struct InvokerRegistry {
    invokers: Vec<Arc<dyn Invoker>>,
    by_name: HashMap<String, usize>,
    model_index: HashMap<String, usize>,
    default_index: Option<usize>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in invoker.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeInvoker::new()));
        registry.register(Arc::new(OpencodeInvoker::new()));
        registry.register(Arc::new(DroidInvoker::new()));
        registry.register(Arc::new(GeminiInvoker::new()));
        registry
    }

    pub fn register(&mut self, invoker: Arc<dyn Invoker>) {
        let index = self.invokers.len();
        self.by_name.insert(invoker.name().to_string(), index);
        for model in invoker.supported_models() {
            // First registration wins.
            self.model_index.entry(model).or_insert(index);
        }
        self.invokers.push(invoker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Invoker>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.invokers[i]))
    }

    /// Look up by model string: exact match, then with the provider prefix
    /// stripped, then the configured default. `None` means the caller
    /// should fall back to an availability probe.
    pub fn get_for_model(&self, model: &str) -> Option<Arc<dyn Invoker>> {
        if let Some(&i) = self.model_index.get(model) {
            return Some(Arc::clone(&self.invokers[i]));
        }
        let stripped = strip_model_prefix(model);
        if let Some(&i) = self.model_index.get(stripped) {
            return Some(Arc::clone(&self.invokers[i]));
        }
        self.get_default()
    }

    /// [`Self::get_for_model`] plus the last resort: probe invokers in
    /// registration order and take the first that reports available.
    pub async fn resolve_for_model(&self, model: &str) -> Option<Arc<dyn Invoker>> {
        if let Some(invoker) = self.get_for_model(model) {
            return Some(invoker);
        }
        self.find_available().await
    }

    pub fn get_default(&self) -> Option<Arc<dyn Invoker>> {
        self.default_index.map(|i| Arc::clone(&self.invokers[i]))
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), DroverError> {
        match self.by_name.get(name) {
            Some(&i) => {
                self.default_index = Some(i);
                Ok(())
            }
            None => Err(DroverError::ConfigInvalid {
                reason: format!("cannot set default invoker: '{name}' is not registered"),
            }),
        }
    }

    /// Invoker names in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.invokers.iter().map(|i| i.name()).collect()
    }

    /// Executables to locate, in registration order.
    pub fn commands(&self) -> Vec<&str> {
        self.invokers.iter().map(|i| i.command()).collect()
    }

    /// Sequential availability probe in registration order.
    pub async fn find_available(&self) -> Option<Arc<dyn Invoker>> {
        for invoker in &self.invokers {
            if invoker.is_available().await {
                return Some(Arc::clone(invoker));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("invokers", &self.list())
            .field("default", &self.default_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInvoker {
        invoker_name: String,
        models: Vec<String>,
        available: bool,
    }

    impl FakeInvoker {
        fn new(name: &str, models: &[&str], available: bool) -> Arc<Self> {
            Arc::new(Self {
                invoker_name: name.to_string(),
                models: models.iter().map(|s| s.to_string()).collect(),
                available,
            })
        }
    }

    #[async_trait]
    impl Invoker for FakeInvoker {
        fn name(&self) -> &str {
            &self.invoker_name
        }

        fn command(&self) -> &str {
            &self.invoker_name
        }

        fn supported_models(&self) -> Vec<String> {
            self.models.clone()
        }

        fn prompt_delivery(&self) -> PromptDelivery {
            PromptDelivery::Argv
        }

        fn build_args(&self, options: &InvokeOptions) -> Vec<String> {
            vec![options.model.clone(), options.prompt.clone()]
        }

        async fn is_available(&self) -> bool {
            self.available
        }
    }

    #[test]
    fn model_index_first_registration_wins() {
        let mut registry = InvokerRegistry::new();
        registry.register(FakeInvoker::new("first", &["shared"], true));
        registry.register(FakeInvoker::new("second", &["shared"], true));

        assert_eq!(registry.get_for_model("shared").unwrap().name(), "first");
    }

    #[test]
    fn get_for_model_strips_provider_prefix() {
        let mut registry = InvokerRegistry::new();
        registry.register(FakeInvoker::new("a", &["sonnet"], true));

        assert_eq!(
            registry.get_for_model("anthropic/sonnet").unwrap().name(),
            "a"
        );
        assert_eq!(registry.get_for_model("sonnet").unwrap().name(), "a");
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        let mut registry = InvokerRegistry::new();
        registry.register(FakeInvoker::new("a", &["sonnet"], true));
        registry.register(FakeInvoker::new("b", &["gpt-5"], true));
        registry.set_default("b").unwrap();

        assert_eq!(registry.get_for_model("mystery").unwrap().name(), "b");
    }

    #[test]
    fn unknown_model_without_default_is_none() {
        let mut registry = InvokerRegistry::new();
        registry.register(FakeInvoker::new("a", &["sonnet"], true));
        assert!(registry.get_for_model("mystery").is_none());
    }

    #[tokio::test]
    async fn resolve_probes_in_registration_order() {
        let mut registry = InvokerRegistry::new();
        registry.register(FakeInvoker::new("down", &["sonnet"], false));
        registry.register(FakeInvoker::new("up", &["gpt-5"], true));

        let resolved = registry.resolve_for_model("mystery").await.unwrap();
        assert_eq!(resolved.name(), "up");
    }

    #[tokio::test]
    async fn find_available_returns_first_probe_hit() {
        let mut registry = InvokerRegistry::new();
        registry.register(FakeInvoker::new("one", &[], false));
        registry.register(FakeInvoker::new("two", &[], true));
        registry.register(FakeInvoker::new("three", &[], true));

        assert_eq!(registry.find_available().await.unwrap().name(), "two");
    }

    #[test]
    fn set_default_unknown_fails() {
        let mut registry = InvokerRegistry::new();
        let err = registry.set_default("ghost").unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }

    #[test]
    fn builtins_register_all_four() {
        let registry = InvokerRegistry::with_builtins();
        let names = registry.list();
        assert_eq!(names, ["claude", "opencode", "droid", "gemini"]);
    }
}
