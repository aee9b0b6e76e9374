//! Locating agent CLI executables on the host.
//!
//! Resolution order, per CLI name:
//! 1. `<PREFIX>_<NAME>_PATH` environment variable (existence-checked).
//! 2. The `cli_paths` map from configuration (existence-checked).
//! 3. A `which` lookup on `$PATH`.
//! 4. Built-in install locations (home-relative and `/usr/local/bin`).
//!
//! Every candidate checked is recorded so a total miss can enumerate them.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::DroverError;

/// Run `which <command>` and return the resolved path if any.
pub fn which(command: &str) -> Option<PathBuf> {
    let output = std::process::Command::new("which")
        .arg(command)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    if path.as_os_str().is_empty() || !path.exists() {
        return None;
    }
    Some(path)
}

/// Well-known install locations probed as a last resort.
fn known_locations(command: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        candidates.push(home.join(".local/bin").join(command));
        candidates.push(home.join("bin").join(command));
        // npm-installed CLIs often land in a per-tool local dir.
        candidates.push(home.join(format!(".{command}/local/{command}")));
    }
    candidates.push(PathBuf::from("/usr/local/bin").join(command));
    candidates.push(PathBuf::from("/opt/homebrew/bin").join(command));
    candidates
}

/// Result of probing one CLI.
#[derive(Debug, Clone)]
pub struct LocateOutcome {
    pub path: Option<PathBuf>,
    /// Every candidate examined, for error reporting.
    pub checked: Vec<String>,
}

/// Resolves CLI names to executable paths.
#[derive(Debug, Clone)]
pub struct CliLocator {
    env_prefix: String,
    cli_paths: HashMap<String, PathBuf>,
}

impl CliLocator {
    pub fn new(env_prefix: impl Into<String>, cli_paths: HashMap<String, PathBuf>) -> Self {
        Self {
            env_prefix: env_prefix.into(),
            cli_paths,
        }
    }

    /// Environment variable that overrides probing for `cli`, e.g.
    /// `DROVER_CLAUDE_PATH`.
    pub fn env_var_name(&self, cli: &str) -> String {
        format!(
            "{}_{}_PATH",
            self.env_prefix,
            cli.to_uppercase().replace('-', "_")
        )
    }

    /// Locate one CLI, recording every candidate checked.
    pub fn locate(&self, cli: &str) -> LocateOutcome {
        let mut checked = Vec::new();

        // 1. Environment override.
        let var = self.env_var_name(cli);
        if let Ok(value) = std::env::var(&var) {
            let path = PathBuf::from(&value);
            checked.push(format!("{var}={value}"));
            if path.exists() {
                return LocateOutcome {
                    path: Some(path),
                    checked,
                };
            }
        } else {
            checked.push(format!("{var} (unset)"));
        }

        // 2. Configured path map.
        if let Some(path) = self.cli_paths.get(cli) {
            checked.push(path.display().to_string());
            if path.exists() {
                return LocateOutcome {
                    path: Some(path.clone()),
                    checked,
                };
            }
        }

        // 3. $PATH lookup.
        checked.push(format!("which {cli}"));
        if let Some(path) = which(cli) {
            return LocateOutcome {
                path: Some(path),
                checked,
            };
        }

        // 4. Known install locations.
        for candidate in known_locations(cli) {
            checked.push(candidate.display().to_string());
            if candidate.exists() {
                return LocateOutcome {
                    path: Some(candidate),
                    checked,
                };
            }
        }

        LocateOutcome {
            path: None,
            checked,
        }
    }

    /// Locate every named CLI. Fails with [`DroverError::CliNotFound`]
    /// (enumerating all candidates) only when none resolve.
    pub fn locate_all(&self, clis: &[&str]) -> Result<HashMap<String, PathBuf>, DroverError> {
        let mut resolved = HashMap::new();
        let mut all_checked = Vec::new();

        for cli in clis {
            let outcome = self.locate(cli);
            match outcome.path {
                Some(path) => {
                    tracing::debug!(cli, path = %path.display(), "located agent CLI");
                    resolved.insert(cli.to_string(), path);
                }
                None => all_checked.extend(outcome.checked),
            }
        }

        if resolved.is_empty() {
            return Err(DroverError::CliNotFound {
                checked: all_checked,
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_name_shape() {
        let locator = CliLocator::new("DROVER", HashMap::new());
        assert_eq!(locator.env_var_name("claude"), "DROVER_CLAUDE_PATH");
        assert_eq!(locator.env_var_name("open-code"), "DROVER_OPEN_CODE_PATH");
    }

    #[test]
    fn config_map_resolves_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-cli");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let mut paths = HashMap::new();
        paths.insert("fake-cli".to_string(), bin.clone());
        let locator = CliLocator::new("DROVER_TEST_A", paths);

        let outcome = locator.locate("fake-cli");
        assert_eq!(outcome.path, Some(bin));
    }

    #[test]
    fn config_map_skips_missing_path() {
        let mut paths = HashMap::new();
        paths.insert(
            "ghost-cli-zq".to_string(),
            PathBuf::from("/nonexistent/ghost-cli-zq"),
        );
        let locator = CliLocator::new("DROVER_TEST_B", paths);

        let outcome = locator.locate("ghost-cli-zq");
        assert!(outcome.path.is_none());
        assert!(outcome
            .checked
            .iter()
            .any(|c| c.contains("/nonexistent/ghost-cli-zq")));
    }

    #[test]
    fn env_override_wins_over_config_map() {
        let dir = tempfile::tempdir().unwrap();
        let env_bin = dir.path().join("from-env");
        let map_bin = dir.path().join("from-map");
        std::fs::write(&env_bin, "").unwrap();
        std::fs::write(&map_bin, "").unwrap();

        let mut paths = HashMap::new();
        paths.insert("clitool".to_string(), map_bin);
        let locator = CliLocator::new("DROVER_TEST_C", paths);

        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("DROVER_TEST_C_CLITOOL_PATH", &env_bin) };
        let outcome = locator.locate("clitool");
        unsafe { std::env::remove_var("DROVER_TEST_C_CLITOOL_PATH") };

        assert_eq!(outcome.path, Some(env_bin));
    }

    #[test]
    fn locate_all_fails_only_when_nothing_resolves() {
        let locator = CliLocator::new("DROVER_TEST_D", HashMap::new());
        let err = locator
            .locate_all(&["ghost-cli-one-zq", "ghost-cli-two-zq"])
            .unwrap_err();
        assert_eq!(err.code(), "CLI_NOT_FOUND");
        let msg = err.to_string();
        assert!(msg.contains("ghost-cli-one-zq"));
        assert!(msg.contains("ghost-cli-two-zq"));
    }

    #[test]
    fn locate_all_succeeds_with_partial_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("real-cli");
        std::fs::write(&bin, "").unwrap();

        let mut paths = HashMap::new();
        paths.insert("real-cli".to_string(), bin);
        let locator = CliLocator::new("DROVER_TEST_E", paths);

        let resolved = locator
            .locate_all(&["real-cli", "ghost-cli-zq"])
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("real-cli"));
    }

    #[test]
    fn which_finds_sh() {
        // `sh` exists on every supported platform.
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-command-zq").is_none());
    }
}
