//! Model selection across a primary and a fallback pool.
//!
//! The selector owns two ordered pools of [`ModelConfig`] and a strategy.
//! Switching to the fallback pool is one-way: quota errors and primary
//! exhaustion flip the flag, and only an explicit [`ModelSelector::reset`]
//! (operator or test harness action) flips it back.

use drover_state::SelectorCursor;
use serde::{Deserialize, Serialize};

use super::ModelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    /// Always the first enabled model of the current pool.
    Priority,
    /// The enabled model with the smallest `cost_weight`.
    CostAware,
    Random,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Debug)]
pub struct ModelSelector {
    primary: Vec<ModelConfig>,
    fallback: Vec<ModelConfig>,
    strategy: SelectionStrategy,
    primary_index: usize,
    fallback_index: usize,
    in_fallback: bool,
}

impl ModelSelector {
    pub fn new(
        primary: Vec<ModelConfig>,
        fallback: Vec<ModelConfig>,
        strategy: SelectionStrategy,
    ) -> Self {
        Self {
            primary,
            fallback,
            strategy,
            primary_index: 0,
            fallback_index: 0,
            in_fallback: false,
        }
    }

    fn enabled(pool: &[ModelConfig]) -> Vec<&ModelConfig> {
        pool.iter().filter(|m| m.enabled).collect()
    }

    fn current_pool(&self) -> &[ModelConfig] {
        if self.in_fallback {
            &self.fallback
        } else {
            &self.primary
        }
    }

    /// Pick the next model from the current pool, or `None` when the pool
    /// has no enabled models.
    pub fn get_next(&mut self) -> Option<ModelConfig> {
        let enabled = Self::enabled(self.current_pool());
        if enabled.is_empty() {
            return None;
        }

        let picked = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let index = if self.in_fallback {
                    self.fallback_index
                } else {
                    self.primary_index
                };
                let model = enabled[index % enabled.len()].clone();
                let next_index = (index + 1) % enabled.len();
                if self.in_fallback {
                    self.fallback_index = next_index;
                } else {
                    self.primary_index = next_index;
                }
                model
            }
            SelectionStrategy::Priority => enabled[0].clone(),
            SelectionStrategy::CostAware => enabled
                .iter()
                .min_by_key(|m| m.cost_weight)
                .map(|m| (*m).clone())
                .unwrap_or_else(|| enabled[0].clone()),
            SelectionStrategy::Random => {
                use rand::Rng;
                let i = rand::rng().random_range(0..enabled.len());
                enabled[i].clone()
            }
        };

        Some(picked)
    }

    /// One-way switch to the fallback pool. Idempotent; resets the
    /// fallback rotation index on the first switch only.
    pub fn switch_to_fallback(&mut self) {
        if !self.in_fallback {
            self.in_fallback = true;
            self.fallback_index = 0;
            tracing::info!("model selector switched to fallback pool");
        }
    }

    pub fn in_fallback(&self) -> bool {
        self.in_fallback
    }

    /// Return to the primary pool and rewind rotation. Not used by normal
    /// execution; exposed for operator resets and test harnesses.
    pub fn reset(&mut self) {
        self.in_fallback = false;
        self.primary_index = 0;
        self.fallback_index = 0;
    }

    pub fn primary_enabled_len(&self) -> usize {
        Self::enabled(&self.primary).len()
    }

    pub fn fallback_enabled_len(&self) -> usize {
        Self::enabled(&self.fallback).len()
    }

    /// Enabled models across both pools; bounds the engine's attempt loop.
    pub fn total_enabled(&self) -> usize {
        self.primary_enabled_len() + self.fallback_enabled_len()
    }

    /// Find an enabled model in either pool by generic name or concrete
    /// model string, tolerating a provider prefix. Used for per-task
    /// model preferences; rotation state is untouched.
    pub fn find_by_name(&self, name: &str) -> Option<ModelConfig> {
        let stripped = crate::model::strip_model_prefix(name);
        self.primary
            .iter()
            .chain(self.fallback.iter())
            .filter(|m| m.enabled)
            .find(|m| {
                m.name == name
                    || m.model_string == name
                    || m.name == stripped
                    || m.model_string == stripped
            })
            .cloned()
    }

    pub fn cursor(&self) -> SelectorCursor {
        SelectorCursor {
            primary_index: self.primary_index,
            fallback_index: self.fallback_index,
            in_fallback: self.in_fallback,
        }
    }

    /// Restore a checkpointed rotation position.
    pub fn restore_cursor(&mut self, cursor: SelectorCursor) {
        self.primary_index = cursor.primary_index;
        self.fallback_index = cursor.fallback_index;
        self.in_fallback = cursor.in_fallback;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> ModelConfig {
        ModelConfig::new(name, "claude", name)
    }

    fn selector(strategy: SelectionStrategy) -> ModelSelector {
        ModelSelector::new(
            vec![model("a"), model("b"), model("c")],
            vec![model("x"), model("y")],
            strategy,
        )
    }

    #[test]
    fn round_robin_rotates_primary() {
        let mut s = selector(SelectionStrategy::RoundRobin);
        let names: Vec<String> = (0..4).map(|_| s.get_next().unwrap().name).collect();
        assert_eq!(names, ["a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_visits_every_enabled_model_once_per_cycle() {
        let mut s = selector(SelectionStrategy::RoundRobin);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..s.primary_enabled_len() {
            seen.insert(s.get_next().unwrap().name);
        }
        assert_eq!(seen.len(), 3);

        s.switch_to_fallback();
        let mut fallback_seen = std::collections::HashSet::new();
        for _ in 0..s.fallback_enabled_len() {
            fallback_seen.insert(s.get_next().unwrap().name);
        }
        assert_eq!(fallback_seen.len(), 2);
    }

    #[test]
    fn priority_always_returns_first() {
        let mut s = selector(SelectionStrategy::Priority);
        assert_eq!(s.get_next().unwrap().name, "a");
        assert_eq!(s.get_next().unwrap().name, "a");
    }

    #[test]
    fn cost_aware_picks_cheapest() {
        let mut s = ModelSelector::new(
            vec![
                model("pricey").with_cost_weight(90),
                model("cheap").with_cost_weight(5),
                model("mid"),
            ],
            vec![],
            SelectionStrategy::CostAware,
        );
        assert_eq!(s.get_next().unwrap().name, "cheap");
    }

    #[test]
    fn random_only_picks_enabled() {
        let mut s = ModelSelector::new(
            vec![model("on"), model("off").disabled()],
            vec![],
            SelectionStrategy::Random,
        );
        for _ in 0..20 {
            assert_eq!(s.get_next().unwrap().name, "on");
        }
    }

    #[test]
    fn empty_pool_returns_none() {
        let mut s = ModelSelector::new(vec![], vec![model("x")], SelectionStrategy::RoundRobin);
        assert!(s.get_next().is_none(), "primary pool is empty");

        s.switch_to_fallback();
        assert_eq!(s.get_next().unwrap().name, "x");
    }

    #[test]
    fn disabled_models_are_skipped() {
        let mut s = ModelSelector::new(
            vec![model("a").disabled(), model("b")],
            vec![],
            SelectionStrategy::RoundRobin,
        );
        assert_eq!(s.get_next().unwrap().name, "b");
        assert_eq!(s.get_next().unwrap().name, "b");
        assert_eq!(s.total_enabled(), 1);
    }

    #[test]
    fn fallback_switch_is_one_way() {
        let mut s = selector(SelectionStrategy::RoundRobin);
        assert!(!s.in_fallback());

        s.switch_to_fallback();
        assert!(s.in_fallback());
        assert_eq!(s.get_next().unwrap().name, "x");

        // A second switch does not rewind the fallback rotation.
        s.switch_to_fallback();
        assert_eq!(s.get_next().unwrap().name, "y");
        assert!(s.in_fallback());
    }

    #[test]
    fn reset_returns_to_primary() {
        let mut s = selector(SelectionStrategy::RoundRobin);
        s.get_next();
        s.switch_to_fallback();
        s.reset();
        assert!(!s.in_fallback());
        assert_eq!(s.get_next().unwrap().name, "a");
    }

    #[test]
    fn find_by_name_searches_both_pools() {
        let s = selector(SelectionStrategy::RoundRobin);
        assert_eq!(s.find_by_name("b").unwrap().name, "b");
        assert_eq!(s.find_by_name("y").unwrap().name, "y");
        assert_eq!(s.find_by_name("provider/c").unwrap().name, "c");
        assert!(s.find_by_name("missing").is_none());
    }

    #[test]
    fn find_by_name_skips_disabled() {
        let s = ModelSelector::new(
            vec![model("off").disabled()],
            vec![],
            SelectionStrategy::RoundRobin,
        );
        assert!(s.find_by_name("off").is_none());
    }

    #[test]
    fn cursor_roundtrip_restores_rotation() {
        let mut s = selector(SelectionStrategy::RoundRobin);
        s.get_next();
        s.get_next();
        let cursor = s.cursor();

        let mut restored = selector(SelectionStrategy::RoundRobin);
        restored.restore_cursor(cursor);
        assert_eq!(restored.get_next().unwrap().name, "c");
    }
}
