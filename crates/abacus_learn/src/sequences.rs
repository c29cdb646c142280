//! N-gram memory over episode tool sequences.
//!
//! Records every bigram..n-gram of a finished session's tool order with
//! running reward and success averages, and suggests likely next tools by
//! matching the session's recent suffix against recorded grams.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::LearnStorage;
use crate::types::{SequenceStats, SequenceSuggestion};

/// Minimum observations before an n-gram is trusted for suggestions.
const MIN_OCCURRENCES: u32 = 2;

/// Reward clamp used to normalize the reward term in suggestion scores.
const REWARD_SPAN: f64 = 2.0;

pub struct SequenceMemory {
    storage: Arc<LearnStorage>,
    max_gram: usize,
    cache: Mutex<HashMap<String, SequenceStats>>,
}

impl SequenceMemory {
    pub fn new(storage: Arc<LearnStorage>) -> Self {
        Self {
            storage,
            max_gram: 3,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn sequence_key(tools: &[String]) -> String {
        tools.join("->")
    }

    /// Record all n-grams (2..=max) of an episode's tool sequence. Each gram
    /// is credited with the episode reward spread evenly across the
    /// sequence.
    pub fn record(&self, tool_sequence: &[String], episode_reward: f64, success: bool) -> Result<()> {
        if tool_sequence.len() < 2 {
            return Ok(());
        }

        let per_gram_reward = episode_reward / tool_sequence.len() as f64;
        let now = chrono::Utc::now().to_rfc3339();

        for n in 2..=self.max_gram.min(tool_sequence.len()) {
            for window in tool_sequence.windows(n) {
                let key = Self::sequence_key(window);
                let stats = self
                    .storage
                    .upsert_sequence(&key, per_gram_reward, success, &now)?;
                self.cache.lock().insert(key, stats);
            }
        }
        Ok(())
    }

    /// Score each available tool as a continuation of the recent tool
    /// suffix. A candidate's score is the best over all matching grams with
    /// enough observations, blending normalized reward, success rate, and a
    /// count-based confidence term.
    pub fn next_tool_suggestions(
        &self,
        recent_tools: &[String],
        available_tools: &[String],
        top_k: usize,
    ) -> Result<Vec<SequenceSuggestion>> {
        if recent_tools.is_empty() {
            return Ok(Vec::new());
        }

        let mut suggestions = Vec::new();
        for tool in available_tools {
            let mut best_score = 0.0;
            let mut best_reason = String::new();

            for n in 1..self.max_gram.min(recent_tools.len() + 1) {
                let prefix = &recent_tools[recent_tools.len() - n..];
                let mut gram: Vec<String> = prefix.to_vec();
                gram.push(tool.clone());
                let key = Self::sequence_key(&gram);

                let stats = match self.lookup(&key)? {
                    Some(stats) if stats.count >= MIN_OCCURRENCES => stats,
                    _ => continue,
                };

                let score = 0.4 * (stats.avg_reward / REWARD_SPAN).clamp(-1.0, 1.0)
                    + 0.4 * stats.success_rate
                    + 0.2 * (f64::from(stats.count) / 10.0).min(1.0);

                if score > best_score {
                    best_score = score;
                    best_reason = format!(
                        "follows {} ({}x, {:.0}% success)",
                        Self::sequence_key(prefix),
                        stats.count,
                        stats.success_rate * 100.0
                    );
                }
            }

            if best_score > 0.0 {
                suggestions.push(SequenceSuggestion {
                    tool_name: tool.clone(),
                    score: best_score,
                    reason: best_reason,
                });
            }
        }

        suggestions.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.tool_name.cmp(&b.tool_name))
        });
        suggestions.truncate(top_k);
        Ok(suggestions)
    }

    fn lookup(&self, key: &str) -> Result<Option<SequenceStats>> {
        if let Some(stats) = self.cache.lock().get(key) {
            return Ok(Some(stats.clone()));
        }
        let stats = self.storage.get_sequence(key)?;
        if let Some(ref stats) = stats {
            self.cache
                .lock()
                .insert(key.to_string(), stats.clone());
        }
        Ok(stats)
    }
}
