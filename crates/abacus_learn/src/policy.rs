//! Tabular Q-value store over (tool, context) pairs.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use abacus_core::AbacusConfig;

use crate::error::{LearnError, Result};
use crate::storage::{LearnStorage, QStep};
use crate::types::PolicyEntry;

/// Divisor in the logistic confidence squash. Sized to the reward clamp so
/// a cell that has converged near the clamp maps close to the ends of the
/// confidence range.
const CONFIDENCE_SCALE: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct CachedCell {
    q_value: f64,
    visit_count: u32,
}

struct PolicyCache {
    primed: bool,
    cells: HashMap<(String, String), CachedCell>,
}

/// Q-table with a write-through in-memory cache.
///
/// The cache is lazily primed from `policy_entries` on first access; every
/// update writes the cell through to the store and the cache together. Reads
/// of absent cells report q=0 / 0 visits (the optimistic cold start), never
/// an error.
pub struct PolicyStore {
    storage: Arc<LearnStorage>,
    learning_rate: f64,
    discount_factor: f64,
    min_samples: u32,
    cache: RwLock<PolicyCache>,
}

impl PolicyStore {
    pub fn new(storage: Arc<LearnStorage>, config: &AbacusConfig) -> Self {
        Self {
            storage,
            learning_rate: config.learning_rate,
            discount_factor: config.discount_factor,
            min_samples: config.min_samples,
            cache: RwLock::new(PolicyCache {
                primed: false,
                cells: HashMap::new(),
            }),
        }
    }

    /// Apply one Q-learning update:
    /// `Q(s,a) ← Q(s,a) + α · (reward + γ · max_a' Q(s',a') − Q(s,a))`.
    ///
    /// `next_context_hash = None` marks a terminal transition (no future
    /// term). The candidate set for the future maximum is `available_tools`
    /// when given, otherwise every tool the policy has seen. A non-finite
    /// target is rejected before anything is written, so a failed update
    /// never leaves a partially applied cell.
    pub fn update(
        &self,
        tool_name: &str,
        context_hash: &str,
        reward: f64,
        next_context_hash: Option<&str>,
        available_tools: Option<&[String]>,
    ) -> Result<QStep> {
        self.prime()?;

        let future = match next_context_hash {
            Some(next) => self.max_future_q(next, available_tools),
            None => 0.0,
        };
        let td_target = reward + self.discount_factor * future;
        if !td_target.is_finite() {
            return Err(LearnError::Computation(format!(
                "non-finite TD target for {tool_name} (reward {reward}, future {future})"
            )));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let step = self.storage.q_learning_step(
            tool_name,
            context_hash,
            td_target,
            self.learning_rate,
            &now,
        )?;

        let mut cache = self.cache.write();
        cache.cells.insert(
            (tool_name.to_string(), context_hash.to_string()),
            CachedCell {
                q_value: step.q_value,
                visit_count: step.visit_count,
            },
        );
        Ok(step)
    }

    /// Current (q_value, visit_count) for a cell; (0.0, 0) when absent.
    pub fn lookup(&self, tool_name: &str, context_hash: &str) -> Result<(f64, u32)> {
        self.prime()?;
        let cache = self.cache.read();
        Ok(cache
            .cells
            .get(&(tool_name.to_string(), context_hash.to_string()))
            .map(|cell| (cell.q_value, cell.visit_count))
            .unwrap_or((0.0, 0)))
    }

    /// Confidence in [0, 1] for a cell. A never-visited cell reports 0.0
    /// rather than the logistic midpoint: no evidence is not half-evidence.
    pub fn confidence(&self, tool_name: &str, context_hash: &str) -> Result<f64> {
        let (q_value, visit_count) = self.lookup(tool_name, context_hash)?;
        if visit_count == 0 {
            return Ok(0.0);
        }
        Ok(1.0 / (1.0 + (-q_value / CONFIDENCE_SCALE).exp()))
    }

    /// Whether a cell has too few visits to trust its Q-value.
    pub fn is_cold(&self, tool_name: &str, context_hash: &str) -> Result<bool> {
        let (_, visit_count) = self.lookup(tool_name, context_hash)?;
        Ok(visit_count < self.min_samples)
    }

    /// Durable view of a cell, including its last-updated timestamp.
    pub fn entry(&self, tool_name: &str, context_hash: &str) -> Result<Option<PolicyEntry>> {
        self.storage.load_policy_entry(tool_name, context_hash)
    }

    /// Every tool name the policy has any cell for.
    pub fn known_tools(&self) -> Result<Vec<String>> {
        self.prime()?;
        let cache = self.cache.read();
        let tools: std::collections::BTreeSet<String> =
            cache.cells.keys().map(|(tool, _)| tool.clone()).collect();
        Ok(tools.into_iter().collect())
    }

    fn max_future_q(&self, next_context_hash: &str, available_tools: Option<&[String]>) -> f64 {
        let cache = self.cache.read();
        let lookup = |tool: &str| {
            cache
                .cells
                .get(&(tool.to_string(), next_context_hash.to_string()))
                .map(|cell| cell.q_value)
                .unwrap_or(0.0)
        };

        match available_tools {
            Some(tools) => tools.iter().map(|t| lookup(t)).fold(0.0, f64::max),
            None => cache
                .cells
                .iter()
                .filter(|((_, ctx), _)| ctx == next_context_hash)
                .map(|(_, cell)| cell.q_value)
                .fold(0.0, f64::max),
        }
    }

    fn prime(&self) -> Result<()> {
        {
            let cache = self.cache.read();
            if cache.primed {
                return Ok(());
            }
        }
        let entries = self.storage.all_policy_entries()?;
        let mut cache = self.cache.write();
        if cache.primed {
            return Ok(());
        }
        for entry in entries {
            cache.cells.insert(
                (entry.tool_name, entry.context_hash),
                CachedCell {
                    q_value: entry.q_value,
                    visit_count: entry.visit_count,
                },
            );
        }
        cache.primed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> PolicyStore {
        let storage = Arc::new(LearnStorage::in_memory().unwrap());
        PolicyStore::new(storage, &AbacusConfig::default())
    }

    #[test]
    fn test_absent_cell_reads_as_zero() {
        let store = make_store();
        let (q, visits) = store.lookup("a", "ctx").unwrap();
        assert!((q - 0.0).abs() < f64::EPSILON);
        assert_eq!(visits, 0);
    }

    #[test]
    fn test_terminal_update_moves_toward_reward() {
        let store = make_store();
        let step = store.update("a", "ctx", 1.0, None, None).unwrap();
        // First step from 0: Q = α * 1
        assert!((step.q_value - 0.1).abs() < 1e-12);
        assert!((step.td_error - 1.0).abs() < 1e-12);
        assert_eq!(step.visit_count, 1);
    }

    #[test]
    fn test_repeated_updates_converge_monotonically() {
        let store = make_store();
        let mut previous = 0.0;
        for _ in 0..300 {
            let step = store.update("a", "ctx", 1.0, None, None).unwrap();
            assert!(step.q_value > previous);
            assert!(step.q_value <= 1.0 + 1e-12);
            previous = step.q_value;
        }
        assert!(previous > 0.99);
    }

    #[test]
    fn test_bootstrap_uses_future_max() {
        let store = make_store();
        // Build up value in the next state for tool "b".
        for _ in 0..50 {
            store.update("b", "next", 1.0, None, None).unwrap();
        }
        let (future_q, _) = store.lookup("b", "next").unwrap();
        assert!(future_q > 0.9);

        let step = store
            .update("a", "ctx", 0.0, Some("next"), Some(&["b".to_string()]))
            .unwrap();
        // td_target = 0 + γ·future, so the first step lands at α·γ·future.
        let expected = 0.1 * 0.9 * future_q;
        assert!((step.q_value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_bootstrap_unknown_next_state_is_zero() {
        let store = make_store();
        let step = store
            .update("a", "ctx", 1.0, Some("unseen"), Some(&["x".to_string()]))
            .unwrap();
        assert!((step.q_value - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_bootstrap_candidates_default_to_known_tools() {
        let store = make_store();
        for _ in 0..50 {
            store.update("b", "next", 1.0, None, None).unwrap();
        }
        // No candidate list: the max runs over everything the policy knows
        // in that context.
        let step = store.update("a", "ctx", 0.0, Some("next"), None).unwrap();
        assert!(step.q_value > 0.0);
    }

    #[test]
    fn test_negative_future_never_beats_cold_zero() {
        let store = make_store();
        for _ in 0..50 {
            store.update("b", "next", -1.0, None, None).unwrap();
        }
        // max(Q(next,·)) folds from 0, so a purely negative next state
        // contributes no future value.
        let step = store.update("a", "ctx", 0.0, Some("next"), None).unwrap();
        assert!((step.q_value - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_reward_rejected() {
        let store = make_store();
        let err = store.update("a", "ctx", f64::NAN, None, None).unwrap_err();
        assert!(matches!(err, LearnError::Computation(_)));
        // Nothing was written.
        let (q, visits) = store.lookup("a", "ctx").unwrap();
        assert!((q - 0.0).abs() < f64::EPSILON);
        assert_eq!(visits, 0);
    }

    #[test]
    fn test_confidence_range_and_cold_zero() {
        let store = make_store();
        // Cold cell: exactly 0, not the logistic midpoint.
        assert!((store.confidence("a", "ctx").unwrap() - 0.0).abs() < f64::EPSILON);

        for _ in 0..50 {
            store.update("a", "ctx", 1.0, None, None).unwrap();
        }
        let high = store.confidence("a", "ctx").unwrap();
        assert!(high > 0.5 && high <= 1.0);

        for _ in 0..50 {
            store.update("b", "ctx", -1.0, None, None).unwrap();
        }
        let low = store.confidence("b", "ctx").unwrap();
        assert!((0.0..0.5).contains(&low));
    }

    #[test]
    fn test_is_cold_threshold() {
        let store = make_store();
        assert!(store.is_cold("a", "ctx").unwrap());
        for _ in 0..4 {
            store.update("a", "ctx", 1.0, None, None).unwrap();
        }
        assert!(store.is_cold("a", "ctx").unwrap());
        store.update("a", "ctx", 1.0, None, None).unwrap();
        assert!(!store.is_cold("a", "ctx").unwrap());
    }

    #[test]
    fn test_cache_primes_from_existing_storage() {
        let storage = Arc::new(LearnStorage::in_memory().unwrap());
        let now = chrono::Utc::now().to_rfc3339();
        storage.q_learning_step("a", "ctx", 1.0, 0.5, &now).unwrap();

        // A fresh store over the same storage sees the persisted cell.
        let store = PolicyStore::new(Arc::clone(&storage), &AbacusConfig::default());
        let (q, visits) = store.lookup("a", "ctx").unwrap();
        assert!((q - 0.5).abs() < 1e-12);
        assert_eq!(visits, 1);
    }

    #[test]
    fn test_known_tools_sorted_unique() {
        let store = make_store();
        store.update("beta", "c1", 1.0, None, None).unwrap();
        store.update("alpha", "c1", 1.0, None, None).unwrap();
        store.update("alpha", "c2", 1.0, None, None).unwrap();

        assert_eq!(store.known_tools().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_entry_exposes_visit_metadata() {
        let store = make_store();
        store.update("a", "ctx", 1.0, None, None).unwrap();

        let entry = store.entry("a", "ctx").unwrap().unwrap();
        assert_eq!(entry.visit_count, 1);
        assert!(!entry.last_updated.is_empty());
        assert!(store.entry("a", "other").unwrap().is_none());
    }
}
