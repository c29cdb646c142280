//! Epsilon-greedy tool ranking and selection over the policy store.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use abacus_core::AbacusConfig;

use crate::error::{LearnError, Result};
use crate::policy::PolicyStore;
use crate::types::{ExplorationStats, Recommendation, ToolMetrics};

/// Ranks candidate tools for a context and picks single actions.
///
/// Exploitation orders by Q-value descending with deterministic tie
/// breaking (cold entries first, then tool name), so identical state always
/// yields identical output. Exploration, taken with the current epsilon,
/// boosts cold entries to the top instead so under-tried tools keep getting
/// sampled. Epsilon decays multiplicatively per selection down to a floor.
pub struct ToolSelector {
    initial_exploration_rate: f64,
    exploration_decay: f64,
    min_exploration_rate: f64,
    min_samples: u64,
    ucb_constant: f64,
    top_n: usize,
    exploration_rate: Mutex<f64>,
    total_selections: AtomicU64,
    selection_counts: Mutex<HashMap<String, u64>>,
}

impl ToolSelector {
    pub fn new(config: &AbacusConfig) -> Self {
        Self {
            initial_exploration_rate: config.exploration_rate,
            exploration_decay: config.exploration_decay,
            min_exploration_rate: config.min_exploration_rate,
            min_samples: u64::from(config.min_samples),
            ucb_constant: config.ucb_constant,
            top_n: config.recommendation_limit,
            exploration_rate: Mutex::new(config.exploration_rate),
            total_selections: AtomicU64::new(0),
            selection_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Rank the candidate tools for a context.
    ///
    /// Every candidate appears in the result (up to the configured top-N);
    /// cold entries are flagged `exploratory` rather than dropped, so a
    /// context with no history still produces a full, deterministically
    /// ordered list. Ledger metrics only feed the reason strings; the
    /// ordering itself is the learned Q-values.
    pub fn recommendations(
        &self,
        policy: &PolicyStore,
        metrics: &[ToolMetrics],
        context_hash: &str,
        available_tools: &[String],
    ) -> Result<Vec<Recommendation>> {
        let metrics_by_tool: HashMap<&str, &ToolMetrics> =
            metrics.iter().map(|m| (m.tool_name.as_str(), m)).collect();

        let mut ranked = Vec::with_capacity(available_tools.len());
        for tool in available_tools {
            let (q_value, visit_count) = policy.lookup(tool, context_hash)?;
            let confidence = policy.confidence(tool, context_hash)?;
            let exploratory = policy.is_cold(tool, context_hash)?;

            let mut reason = if exploratory {
                format!("needs sampling ({visit_count} visits)")
            } else {
                format!("q={q_value:.2} over {visit_count} visits")
            };
            if let Some(m) = metrics_by_tool.get(tool.as_str()) {
                reason.push_str(&format!(
                    ", {:.0}% success over {} calls",
                    m.success_rate * 100.0,
                    m.total_calls
                ));
            }

            ranked.push(Recommendation {
                tool_name: tool.clone(),
                score: q_value,
                confidence,
                exploratory,
                reason,
            });
        }

        let explore = {
            let rate = *self.exploration_rate.lock();
            rand::rng().random::<f64>() < rate
        };
        if explore {
            // Exploration pass: under-tried tools first, stable within groups.
            ranked.sort_by(|a, b| {
                b.exploratory
                    .cmp(&a.exploratory)
                    .then_with(|| a.tool_name.cmp(&b.tool_name))
            });
        } else {
            ranked.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| b.exploratory.cmp(&a.exploratory))
                    .then_with(|| a.tool_name.cmp(&b.tool_name))
            });
        }

        self.total_selections.fetch_add(1, Ordering::Relaxed);
        self.decay_exploration();

        ranked.truncate(self.top_n);
        Ok(ranked)
    }

    /// Pick a single tool: epsilon-greedy randomization first, UCB1 once
    /// every candidate has had a chance, greedy otherwise. Returns the tool
    /// and whether the pick counts as exploration.
    pub fn select(
        &self,
        policy: &PolicyStore,
        context_hash: &str,
        available_tools: &[String],
    ) -> Result<(String, bool)> {
        if available_tools.is_empty() {
            return Err(LearnError::InvalidInput(
                "no available tools to select from".into(),
            ));
        }

        let total = self.total_selections.fetch_add(1, Ordering::Relaxed) + 1;
        let epsilon = *self.exploration_rate.lock();

        let mut was_exploration = false;
        let selected = if rand::rng().random::<f64>() < epsilon {
            was_exploration = true;
            let idx = rand::rng().random_range(0..available_tools.len());
            available_tools[idx].clone()
        } else if total > available_tools.len() as u64 {
            // UCB1 after the initial sweep: Q-term plus an exploration bonus
            // that shrinks as a tool accumulates selections.
            let counts = self.selection_counts.lock();
            let mut best: Option<(f64, &String)> = None;
            for tool in available_tools {
                let (q_value, _) = policy.lookup(tool, context_hash)?;
                let n_tool = counts.get(tool).copied().unwrap_or(0).max(1);
                let bonus =
                    self.ucb_constant * ((total as f64).ln() / n_tool as f64).sqrt();
                let score = 1.0 / (1.0 + (-q_value).exp()) + bonus;
                let better = match best {
                    None => true,
                    Some((best_score, best_tool)) => {
                        score > best_score || (score == best_score && tool < best_tool)
                    }
                };
                if better {
                    best = Some((score, tool));
                }
            }
            let tool = best.map(|(_, t)| t.clone()).unwrap_or_default();
            if counts.get(&tool).copied().unwrap_or(0) < self.min_samples {
                was_exploration = true;
            }
            tool
        } else {
            // Greedy on Q, deterministic ties.
            let mut best: Option<(f64, &String)> = None;
            for tool in available_tools {
                let (q_value, _) = policy.lookup(tool, context_hash)?;
                let better = match best {
                    None => true,
                    Some((best_q, best_tool)) => {
                        q_value > best_q || (q_value == best_q && tool < best_tool)
                    }
                };
                if better {
                    best = Some((q_value, tool));
                }
            }
            best.map(|(_, t)| t.clone()).unwrap_or_default()
        };

        *self
            .selection_counts
            .lock()
            .entry(selected.clone())
            .or_insert(0) += 1;
        self.decay_exploration();

        Ok((selected, was_exploration))
    }

    /// Apply the per-selection multiplicative decay, respecting the floor.
    fn decay_exploration(&self) {
        let mut rate = self.exploration_rate.lock();
        *rate = (*rate * self.exploration_decay).max(self.min_exploration_rate);
    }

    /// Reset the exploration rate to its initial value.
    pub fn reset_exploration(&self) {
        *self.exploration_rate.lock() = self.initial_exploration_rate;
    }

    /// Snapshot of the exploration state for monitoring.
    pub fn exploration_stats(&self) -> ExplorationStats {
        ExplorationStats {
            current_exploration_rate: *self.exploration_rate.lock(),
            initial_exploration_rate: self.initial_exploration_rate,
            total_selections: self.total_selections.load(Ordering::Relaxed),
        }
    }
}
