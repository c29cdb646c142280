//! Reward shaping for tool executions.

use abacus_core::AbacusConfig;

use crate::types::{ExecutionStatus, ToolExecution};

/// Tunable reward weights. All values are configuration, not contract; the
/// one hard guarantee is that the output stays within `[-clamp, clamp]`.
#[derive(Debug, Clone)]
pub struct RewardConfig {
    pub success_reward: f64,
    pub failure_penalty: f64,
    pub latency_threshold_ms: u64,
    pub latency_penalty_per_second: f64,
    pub latency_penalty_cap: f64,
    pub clamp: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self::from_config(&AbacusConfig::default())
    }
}

impl RewardConfig {
    pub fn from_config(config: &AbacusConfig) -> Self {
        Self {
            success_reward: config.success_reward,
            failure_penalty: config.failure_penalty,
            latency_threshold_ms: config.latency_threshold_ms,
            latency_penalty_per_second: config.latency_penalty_per_second,
            latency_penalty_cap: config.latency_penalty_cap,
            clamp: config.reward_clamp,
        }
    }
}

/// Map a completed execution to a bounded scalar reward.
///
/// Three additive terms: the base outcome (+success / -failure), the user
/// rating mapped so 3 stars is neutral and the extremes contribute ±1, and
/// a capped penalty for latency beyond the threshold. A pending row
/// contributes no base term. The sum is clamped so a single term can never
/// destabilize the Q-table.
pub fn calculate_reward(config: &RewardConfig, execution: &ToolExecution) -> f64 {
    let mut reward = match execution.status {
        ExecutionStatus::Success => config.success_reward,
        ExecutionStatus::Error => -config.failure_penalty,
        ExecutionStatus::Pending => 0.0,
    };

    if let Some(rating) = execution.user_rating {
        reward += (f64::from(rating) - 3.0) / 2.0;
    }

    if let Some(ms) = execution.execution_time_ms {
        let excess_ms = ms.saturating_sub(config.latency_threshold_ms);
        let penalty = (excess_ms as f64 / 1000.0) * config.latency_penalty_per_second;
        reward -= penalty.min(config.latency_penalty_cap);
    }

    reward.clamp(-config.clamp, config.clamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_execution(
        status: ExecutionStatus,
        execution_time_ms: Option<u64>,
        user_rating: Option<u8>,
    ) -> ToolExecution {
        ToolExecution {
            execution_id: "e1".into(),
            session_id: "s1".into(),
            tool_name: "smart_retrieve".into(),
            arguments: "{}".into(),
            context_hash: "ctx".into(),
            status,
            started_at: "2026-08-01T12:00:00Z".into(),
            completed_at: None,
            execution_time_ms,
            user_rating,
            user_comment: None,
            reward: None,
        }
    }

    #[test]
    fn test_success_base_only() {
        let config = RewardConfig::default();
        let execution = make_execution(ExecutionStatus::Success, Some(120), None);
        let reward = calculate_reward(&config, &execution);
        assert!((reward - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_base_only() {
        let config = RewardConfig::default();
        let execution = make_execution(ExecutionStatus::Error, Some(120), None);
        let reward = calculate_reward(&config, &execution);
        assert!((reward + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rating_terms() {
        let config = RewardConfig::default();

        // 5 stars contributes +1, 3 stars 0, 1 star -1.
        let five = make_execution(ExecutionStatus::Success, Some(100), Some(5));
        assert!((calculate_reward(&config, &five) - 2.0).abs() < f64::EPSILON);

        let three = make_execution(ExecutionStatus::Success, Some(100), Some(3));
        assert!((calculate_reward(&config, &three) - 1.0).abs() < f64::EPSILON);

        let one = make_execution(ExecutionStatus::Success, Some(100), Some(1));
        assert!((calculate_reward(&config, &one) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_under_threshold_no_penalty() {
        let config = RewardConfig::default();
        let execution = make_execution(ExecutionStatus::Success, Some(999), None);
        assert!((calculate_reward(&config, &execution) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_penalty_proportional() {
        let config = RewardConfig::default();
        // 3000ms = 2s over the 1000ms threshold at 0.1/s => -0.2
        let execution = make_execution(ExecutionStatus::Success, Some(3000), None);
        let reward = calculate_reward(&config, &execution);
        assert!((reward - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_latency_penalty_capped() {
        let config = RewardConfig::default();
        // An hour-long call: the cap (0.5) keeps the penalty from dominating
        // the base term.
        let execution = make_execution(ExecutionStatus::Success, Some(3_600_000), None);
        let reward = calculate_reward(&config, &execution);
        assert!((reward - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_reward_bounded_for_all_inputs() {
        let config = RewardConfig::default();
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
        ] {
            for ms in [None, Some(0), Some(500), Some(10_000), Some(u64::MAX)] {
                for rating in [None, Some(1), Some(2), Some(3), Some(4), Some(5)] {
                    let execution = make_execution(status, ms, rating);
                    let reward = calculate_reward(&config, &execution);
                    assert!(
                        (-config.clamp..=config.clamp).contains(&reward),
                        "reward {reward} out of range for {status:?} {ms:?} {rating:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_pending_has_no_base_term() {
        let config = RewardConfig::default();
        let execution = make_execution(ExecutionStatus::Pending, None, None);
        assert!((calculate_reward(&config, &execution) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rating_correction_scenario() {
        // A successful fast call later rated 1 star: +1 + (1-3)/2 = 0.
        let config = RewardConfig::default();
        let execution = make_execution(ExecutionStatus::Success, Some(120), Some(1));
        let reward = calculate_reward(&config, &execution);
        assert!((reward - 0.0).abs() < f64::EPSILON);
    }
}
