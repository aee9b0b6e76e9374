//! Configuration file management.
//!
//! TOML config at `~/.config/drover/config.toml` (or `$DROVER_CONFIG`),
//! with the resolution chain: CLI flag > env var > config file > default.
//! Scalar engine, retry, server, and pool settings each have a
//! `DROVER_*` environment override (`DROVER_DEFAULT_TIMEOUT_SECS`,
//! `DROVER_BIND`, `DROVER_PORT`, `DROVER_MAX_RETRIES`,
//! `DROVER_POOL_<NAME>_SIZE`, ...); the structured sections (models,
//! agents) come from the file. Sections translate directly into the
//! core's construction inputs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use drover_core::agent::{AgentDefinition, AgentRegistry};
use drover_core::driver::{BackoffStrategy, RetryPolicy};
use drover_core::engine::EngineConfig;
use drover_core::model::{ModelConfig, ModelSelector, SelectionStrategy};
use drover_core::pool::{default_pools, PoolConfig, WorkerPoolManager};

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Config directory, always XDG-style: `$XDG_CONFIG_HOME/drover` or
/// `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Config file path; `$DROVER_CONFIG` overrides.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROVER_CONFIG") {
        return PathBuf::from(path);
    }
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Environment overrides
// -----------------------------------------------------------------------

/// Read and parse one `DROVER_*` variable. Unset means no override; a
/// set-but-unparsable value is a configuration error, never silently
/// ignored.
pub(crate) fn env_parse<T>(var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => {
            let value = raw
                .parse()
                .map_err(|e| anyhow!("invalid value in {var}: {e}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Sections
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsSection {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub primary: Vec<ModelConfig>,
    #[serde(default)]
    pub fallback: Vec<ModelConfig>,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::RoundRobin,
            primary: vec![ModelConfig::new("sonnet", "claude", "sonnet")],
            fallback: vec![
                ModelConfig::new("haiku", "claude", "haiku").with_cost_weight(10),
                ModelConfig::new("gemini-flash", "gemini", "gemini-2.0-flash")
                    .with_cost_weight(5),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub default_timeout_secs: u64,
    pub kill_grace_secs: u64,
    /// Fixed wait after a rate limit; exponential backoff when absent.
    pub rate_limit_wait_ms: Option<u64>,
    pub backoff_base_ms: u64,
    pub max_delay_ms: u64,
    pub retry_same_model: bool,
    pub max_retries_per_model: Option<u32>,
    pub prefer_pty: bool,
    pub min_available_memory_mb: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            kill_grace_secs: 5,
            rate_limit_wait_ms: None,
            backoff_base_ms: 1000,
            max_delay_ms: 60_000,
            retry_same_model: false,
            max_retries_per_model: Some(3),
            prefer_pty: true,
            min_available_memory_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: f64,
    pub strategy: BackoffStrategy,
    pub retryable_errors: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter: policy.jitter,
            strategy: policy.strategy,
            retryable_errors: policy.retryable_errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7077,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// The file
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub models: ModelsSection,
    pub engine: EngineSection,
    pub retry: RetrySection,
    /// Empty means the stock pool set.
    pub pools: HashMap<String, PoolConfig>,
    pub server: ServerSection,
    pub cli_paths: HashMap<String, PathBuf>,
    pub agents: Vec<AgentSection>,
    pub default_agent: Option<String>,
}

impl ConfigFile {
    /// Load the config file (or defaults when it does not exist), then
    /// apply `DROVER_*` environment overrides on top. CLI flags are
    /// applied by the callers, completing the chain
    /// CLI flag > env var > config file > default.
    pub fn load_or_default() -> Result<Self> {
        let path = config_path();
        let mut config: Self = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file at {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overlay per-field `DROVER_*` environment variables.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse("DROVER_DEFAULT_TIMEOUT_SECS")? {
            self.engine.default_timeout_secs = v;
        }
        if let Some(v) = env_parse("DROVER_KILL_GRACE_SECS")? {
            self.engine.kill_grace_secs = v;
        }
        if let Some(v) = env_parse("DROVER_RATE_LIMIT_WAIT_MS")? {
            self.engine.rate_limit_wait_ms = Some(v);
        }
        if let Some(v) = env_parse("DROVER_BACKOFF_BASE_MS")? {
            self.engine.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("DROVER_ENGINE_MAX_DELAY_MS")? {
            self.engine.max_delay_ms = v;
        }
        if let Some(v) = env_parse("DROVER_RETRY_SAME_MODEL")? {
            self.engine.retry_same_model = v;
        }
        if let Some(v) = env_parse("DROVER_MAX_RETRIES_PER_MODEL")? {
            self.engine.max_retries_per_model = Some(v);
        }
        if let Some(v) = env_parse("DROVER_PREFER_PTY")? {
            self.engine.prefer_pty = v;
        }
        if let Some(v) = env_parse("DROVER_MIN_AVAILABLE_MEMORY_MB")? {
            self.engine.min_available_memory_mb = v;
        }

        if let Some(v) = env_parse("DROVER_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_parse("DROVER_INITIAL_DELAY_MS")? {
            self.retry.initial_delay_ms = v;
        }
        if let Some(v) = env_parse("DROVER_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = env_parse("DROVER_BACKOFF_MULTIPLIER")? {
            self.retry.backoff_multiplier = v;
        }
        if let Some(v) = env_parse("DROVER_JITTER")? {
            self.retry.jitter = v;
        }
        if let Ok(raw) = std::env::var("DROVER_RETRY_STRATEGY") {
            self.retry.strategy = match raw.as_str() {
                "linear" => BackoffStrategy::Linear,
                "exponential" => BackoffStrategy::Exponential,
                other => bail!(
                    "invalid value in DROVER_RETRY_STRATEGY: '{other}' \
                     (expected linear or exponential)"
                ),
            };
        }

        if let Ok(bind) = std::env::var("DROVER_BIND") {
            self.server.bind = bind;
        }
        if let Some(v) = env_parse("DROVER_PORT")? {
            self.server.port = v;
        }

        Ok(())
    }

    /// Serialize and write the config file, creating parent dirs.
    pub fn save(&self) -> Result<PathBuf> {
        let path = config_path();
        let dir = path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(config_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, &contents)
            .with_context(|| format!("failed to write config file at {}", path.display()))?;
        Ok(path)
    }

    pub fn selector(&self) -> ModelSelector {
        ModelSelector::new(
            self.models.primary.clone(),
            self.models.fallback.clone(),
            self.models.strategy,
        )
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            env_prefix: "DROVER".to_string(),
            cli_paths: self.cli_paths.clone(),
            default_timeout_secs: self.engine.default_timeout_secs,
            kill_grace: Duration::from_secs(self.engine.kill_grace_secs),
            rate_limit_wait: self.engine.rate_limit_wait_ms.map(Duration::from_millis),
            backoff_base: Duration::from_millis(self.engine.backoff_base_ms),
            max_delay: Duration::from_millis(self.engine.max_delay_ms),
            retry_same_model: self.engine.retry_same_model,
            max_retries_per_model: self.engine.max_retries_per_model,
            prefer_pty: self.engine.prefer_pty,
            min_available_memory_bytes: self.engine.min_available_memory_mb * 1024 * 1024,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter: self.retry.jitter,
            strategy: self.retry.strategy,
            retryable_errors: self.retry.retryable_errors.clone(),
        }
    }

    pub fn pool_manager(&self) -> Result<WorkerPoolManager> {
        let mut pools = if self.pools.is_empty() {
            default_pools()
        } else {
            self.pools.clone()
        };
        // Per-pool overrides, e.g. DROVER_POOL_HIGH_SIZE=4.
        for (name, pool) in pools.iter_mut() {
            let upper = name.to_uppercase().replace('-', "_");
            if let Some(v) = env_parse(&format!("DROVER_POOL_{upper}_SIZE"))? {
                pool.size = v;
            }
            if let Some(v) = env_parse(&format!("DROVER_POOL_{upper}_NICE"))? {
                pool.nice = v;
            }
            if let Some(v) = env_parse(&format!("DROVER_POOL_{upper}_MEMORY_LIMIT_MB"))? {
                pool.memory_limit_mb = v;
            }
        }
        Ok(WorkerPoolManager::new(pools, None)?)
    }

    pub fn agent_registry(&self) -> Result<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for section in &self.agents {
            let mut agent = AgentDefinition::new(
                section.name.clone(),
                section.description.clone(),
                section.prompt.clone(),
            )?
            .with_tools(section.tools.clone())
            .with_env(section.env.clone());
            if let Some(model) = &section.model {
                agent = agent.with_model(model.clone());
            }
            if let Some(timeout) = section.timeout_secs {
                agent = agent.with_timeout_secs(timeout)?;
            }
            registry.register(agent);
        }
        if let Some(default) = &self.default_agent {
            registry.set_default(default)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Env-var tests share process environment; serialize them.
    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = ConfigFile::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let back: ConfigFile = toml::from_str(&toml).unwrap();
        assert_eq!(back.models.primary.len(), 1);
        assert_eq!(back.models.fallback.len(), 2);
        assert_eq!(back.server.port, 7077);
    }

    #[test]
    fn empty_file_parses_to_defaults() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_timeout_secs, 300);
        assert!(config.pools.is_empty());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let toml = r#"
            [engine]
            default_timeout_secs = 42

            [server]
            port = 9000

            [[agents]]
            name = "implementer"
            prompt = "Implement the task."
            model = "sonnet"
        "#;
        let config: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.default_timeout_secs, 42);
        assert_eq!(config.engine.kill_grace_secs, 5);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.agents.len(), 1);

        let registry = config.agent_registry().unwrap();
        assert_eq!(registry.get("implementer").unwrap().model(), Some("sonnet"));
    }

    #[test]
    fn engine_config_conversion() {
        let mut config = ConfigFile::default();
        config.engine.rate_limit_wait_ms = Some(2500);
        config.engine.min_available_memory_mb = 1024;

        let engine = config.engine_config();
        assert_eq!(engine.rate_limit_wait, Some(Duration::from_millis(2500)));
        assert_eq!(engine.min_available_memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(engine.env_prefix, "DROVER");
    }

    #[test]
    fn unknown_default_agent_is_rejected() {
        let mut config = ConfigFile::default();
        config.default_agent = Some("ghost".to_string());
        assert!(config.agent_registry().is_err());
    }

    #[test]
    fn pool_section_parses() {
        let _lock = lock_env();

        let toml = r#"
            [pools.high]
            size = 4
            nice = 0
            memory_limit_mb = 4096
        "#;
        let config: ConfigFile = toml::from_str(toml).unwrap();
        let manager = config.pool_manager().unwrap();
        assert!(manager.has_pool("high"));
        assert_eq!(manager.memory_limit_mb("high"), 4096);
    }

    #[test]
    fn env_var_overrides_config_file_value() {
        let _lock = lock_env();

        let toml = r#"
            [engine]
            default_timeout_secs = 100

            [server]
            port = 9000
        "#;
        let mut config: ConfigFile = toml::from_str(toml).unwrap();

        unsafe { std::env::set_var("DROVER_DEFAULT_TIMEOUT_SECS", "42") };
        unsafe { std::env::set_var("DROVER_PORT", "9100") };
        unsafe { std::env::set_var("DROVER_BIND", "0.0.0.0") };
        let result = config.apply_env_overrides();
        unsafe { std::env::remove_var("DROVER_DEFAULT_TIMEOUT_SECS") };
        unsafe { std::env::remove_var("DROVER_PORT") };
        unsafe { std::env::remove_var("DROVER_BIND") };

        result.unwrap();
        assert_eq!(config.engine.default_timeout_secs, 42);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    #[test]
    fn unset_env_leaves_file_values_alone() {
        let _lock = lock_env();

        let toml = r#"
            [engine]
            default_timeout_secs = 100
        "#;
        let mut config: ConfigFile = toml::from_str(toml).unwrap();
        config.apply_env_overrides().unwrap();

        assert_eq!(config.engine.default_timeout_secs, 100);
        assert_eq!(config.server.port, 7077);
    }

    #[test]
    fn retry_env_overrides() {
        let _lock = lock_env();

        let mut config = ConfigFile::default();

        unsafe { std::env::set_var("DROVER_MAX_RETRIES", "7") };
        unsafe { std::env::set_var("DROVER_INITIAL_DELAY_MS", "250") };
        unsafe { std::env::set_var("DROVER_RETRY_STRATEGY", "linear") };
        unsafe { std::env::set_var("DROVER_JITTER", "0.5") };
        let result = config.apply_env_overrides();
        unsafe { std::env::remove_var("DROVER_MAX_RETRIES") };
        unsafe { std::env::remove_var("DROVER_INITIAL_DELAY_MS") };
        unsafe { std::env::remove_var("DROVER_RETRY_STRATEGY") };
        unsafe { std::env::remove_var("DROVER_JITTER") };

        result.unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.jitter, 0.5);

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn unparsable_env_value_is_an_error_not_ignored() {
        let _lock = lock_env();

        let mut config = ConfigFile::default();

        unsafe { std::env::set_var("DROVER_PORT", "not-a-port") };
        let result = config.apply_env_overrides();
        unsafe { std::env::remove_var("DROVER_PORT") };

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("DROVER_PORT"), "unexpected error: {msg}");
    }

    #[test]
    fn unknown_retry_strategy_env_is_rejected() {
        let _lock = lock_env();

        let mut config = ConfigFile::default();

        unsafe { std::env::set_var("DROVER_RETRY_STRATEGY", "fibonacci") };
        let result = config.apply_env_overrides();
        unsafe { std::env::remove_var("DROVER_RETRY_STRATEGY") };

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("DROVER_RETRY_STRATEGY"), "unexpected error: {msg}");
    }

    #[test]
    fn pool_env_overrides_apply_to_stock_pools() {
        let _lock = lock_env();

        // Empty [pools] section: the stock set is used, and env still
        // overrides it.
        let config = ConfigFile::default();

        unsafe { std::env::set_var("DROVER_POOL_HIGH_SIZE", "4") };
        unsafe { std::env::set_var("DROVER_POOL_LOW_MEMORY_LIMIT_MB", "768") };
        let manager = config.pool_manager();
        unsafe { std::env::remove_var("DROVER_POOL_HIGH_SIZE") };
        unsafe { std::env::remove_var("DROVER_POOL_LOW_MEMORY_LIMIT_MB") };

        let manager = manager.unwrap();
        assert_eq!(manager.memory_limit_mb("low"), 768);
        let mut held = Vec::new();
        // The high pool now admits four concurrent slots.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            for _ in 0..4 {
                held.push(manager.acquire("high", None).await.unwrap());
            }
        });
        assert_eq!(manager.active_count("high"), 4);
    }

    #[test]
    fn engine_env_overrides_flow_into_engine_config() {
        let _lock = lock_env();

        let mut config = ConfigFile::default();

        unsafe { std::env::set_var("DROVER_RATE_LIMIT_WAIT_MS", "2500") };
        unsafe { std::env::set_var("DROVER_PREFER_PTY", "false") };
        let result = config.apply_env_overrides();
        unsafe { std::env::remove_var("DROVER_RATE_LIMIT_WAIT_MS") };
        unsafe { std::env::remove_var("DROVER_PREFER_PTY") };

        result.unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.rate_limit_wait, Some(Duration::from_millis(2500)));
        assert!(!engine.prefer_pty);
    }
}
