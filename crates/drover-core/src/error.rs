//! Error taxonomy for the drover core.
//!
//! Errors are classified by cause, not by throwing site: the engine, the
//! pool manager, and the loop all speak this one tagged union. Every kind
//! carries a stable machine-readable code and construction sites attach
//! remediation hints for user-facing output.

use serde::Serialize;

/// One engine attempt against one `(cli, model)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub cli: String,
    pub model: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    RateLimited,
    QuotaExceeded,
    TimedOut,
    ResourceExhausted,
    /// The invoker's CLI could not be located; the attempt never spawned.
    SpawnSkipped,
    Failed,
}

impl std::fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({:?})", self.cli, self.model, self.outcome)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    /// No agent CLI resolved at engine construction. Fatal.
    #[error("no agent CLI could be located; checked: {}", .checked.join(", "))]
    CliNotFound { checked: Vec<String> },

    /// Resource exhaustion, permission denied, or a missing executable at
    /// spawn time. Fatal for the attempt, not for the loop.
    #[error("failed to spawn agent process: {reason}")]
    SpawnFailed { reason: String },

    #[error("agent process exceeded its {timeout_secs}s timeout")]
    Timeout { timeout_secs: u64 },

    #[error("rate limit reported by {cli} ({model})")]
    RateLimit { cli: String, model: String },

    #[error("quota or billing limit reported by {cli} ({model})")]
    Quota { cli: String, model: String },

    /// The resource governor killed the process.
    #[error("process {pid} terminated by resource governor: {reason}")]
    ResourceExhausted { pid: u32, reason: String },

    #[error("all model configurations failed: [{}]", .attempts.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "))]
    AllModelsExhausted { attempts: Vec<AttemptRecord> },

    #[error("timed out waiting for a slot in pool '{pool}': {reason}")]
    PoolSlotTimeout { pool: String, reason: String },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("task backend error: {0}")]
    Backend(String),

    /// Shutdown or operator stop observed at a suspension point.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl DroverError {
    /// Stable machine-readable code, part of the external contract.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CliNotFound { .. } => "CLI_NOT_FOUND",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RateLimit { .. } => "RATE_LIMIT",
            Self::Quota { .. } => "QUOTA",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::AllModelsExhausted { .. } => "ALL_MODELS_EXHAUSTED",
            Self::PoolSlotTimeout { .. } => "POOL_SLOT_TIMEOUT",
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::Backend(_) => "BACKEND_ERROR",
            Self::Cancelled(_) => "CANCELLED",
        }
    }

    /// Fatal errors unwind out of the loop instead of failing one task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CliNotFound { .. } | Self::ConfigInvalid { .. })
    }

    /// Suggested next steps for user-facing output.
    pub fn remediations(&self) -> Vec<String> {
        match self {
            Self::CliNotFound { checked } => vec![
                "install at least one supported agent CLI (claude, opencode, droid, gemini)"
                    .to_string(),
                format!(
                    "or point DROVER_<NAME>_PATH at an existing binary (checked: {})",
                    checked.join(", ")
                ),
            ],
            Self::SpawnFailed { .. } => vec![
                "free memory or lower pool sizes in the [pools] config section".to_string(),
                "verify the agent CLI binary is executable".to_string(),
            ],
            Self::Timeout { timeout_secs } => vec![format!(
                "raise the model or task timeout (current effective timeout: {timeout_secs}s)"
            )],
            Self::RateLimit { .. } => {
                vec!["increase rate_limit_wait or add fallback models".to_string()]
            }
            Self::Quota { cli, .. } => {
                vec![format!("check billing for the '{cli}' provider or rely on fallback models")]
            }
            Self::ResourceExhausted { .. } => vec![
                "raise the pool's memory_limit_mb or reduce concurrent agents".to_string(),
            ],
            Self::AllModelsExhausted { .. } => vec![
                "add fallback models or review the per-attempt log output".to_string(),
            ],
            Self::PoolSlotTimeout { pool, .. } => vec![format!(
                "increase the '{pool}' pool size or raise acquire_timeout_ms"
            )],
            Self::ConfigInvalid { .. } => {
                vec!["fix the configuration and restart".to_string()]
            }
            Self::Backend(_) => vec!["check that the task backend is reachable".to_string()],
            Self::Cancelled(_) => Vec::new(),
        }
    }
}
