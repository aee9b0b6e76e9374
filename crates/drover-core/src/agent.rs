//! Agent role definitions and their registry.
//!
//! An [`AgentDefinition`] describes how to prompt one agent role: its
//! system instructions, tool allowlist, preferred model, environment
//! overrides, and timeout. Definitions are immutable after construction;
//! the validating constructor is the only way to build one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DroverError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    name: String,
    #[serde(default)]
    description: String,
    /// System-instructions text, prepended verbatim to every prompt.
    prompt: String,
    /// Tool allowlist passed through to invokers that support one.
    #[serde(default)]
    tools: Vec<String>,
    /// Generic model name this agent prefers, e.g. "sonnet".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    /// Environment overrides applied to every spawn for this agent.
    #[serde(default)]
    env: BTreeMap<String, String>,
    /// Per-agent timeout in seconds; model timeouts take precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

impl AgentDefinition {
    /// Validate and construct. Rejects empty name or prompt and a
    /// non-positive timeout.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<Self, DroverError> {
        let name = name.into();
        let prompt = prompt.into();
        if name.trim().is_empty() {
            return Err(DroverError::ConfigInvalid {
                reason: "agent name must not be empty".to_string(),
            });
        }
        if prompt.trim().is_empty() {
            return Err(DroverError::ConfigInvalid {
                reason: format!("agent '{name}' has an empty prompt"),
            });
        }
        Ok(Self {
            name,
            description: description.into(),
            prompt,
            tools: Vec::new(),
            model: None,
            env: BTreeMap::new(),
            timeout_secs: None,
        })
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Result<Self, DroverError> {
        if timeout_secs == 0 {
            return Err(DroverError::ConfigInvalid {
                reason: format!("agent '{}' timeout must be positive", self.name),
            });
        }
        self.timeout_secs = Some(timeout_secs);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }
}

/// Named collection of agent definitions with an optional default.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentDefinition>>,
    default: Option<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its own name. Re-registering a name
    /// replaces the previous definition and returns it.
    pub fn register(&mut self, agent: AgentDefinition) -> Option<Arc<AgentDefinition>> {
        self.agents
            .insert(agent.name().to_string(), Arc::new(agent))
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(name).cloned()
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), DroverError> {
        if !self.agents.contains_key(name) {
            return Err(DroverError::ConfigInvalid {
                reason: format!("cannot set default agent: '{name}' is not registered"),
            });
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_agent(&self) -> Option<Arc<AgentDefinition>> {
        self.default.as_deref().and_then(|n| self.get(n))
    }

    pub fn list(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}
