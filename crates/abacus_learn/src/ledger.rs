//! The execution ledger: durable log of tool invocations and outcomes.
//!
//! The ledger is a side channel of the tool-execution path. Start/end
//! recording is best-effort by contract: a store failure is logged here and
//! never reaches the caller, because observing a tool call must not be able
//! to fail it. Feedback submission and metric queries are explicit requests
//! and surface their errors.

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{LearnError, Result};
use crate::reward::{RewardConfig, calculate_reward};
use crate::storage::LearnStorage;
use crate::types::{ExecutionStatus, ToolExecution, ToolMetrics};

pub struct ExecutionLedger {
    storage: Arc<LearnStorage>,
    reward_config: RewardConfig,
}

impl ExecutionLedger {
    pub fn new(storage: Arc<LearnStorage>, reward_config: RewardConfig) -> Self {
        Self {
            storage,
            reward_config,
        }
    }

    /// Open a pending ledger row for a starting tool call.
    ///
    /// Always returns a usable row with a fresh execution id; if the insert
    /// fails the id still identifies the attempt for the rest of the call's
    /// lifecycle (the later completion will then find nothing to update and
    /// degrade the same way).
    pub fn record_start(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
        context_hash: &str,
    ) -> ToolExecution {
        let row = ToolExecution {
            execution_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.to_string(),
            context_hash: context_hash.to_string(),
            status: ExecutionStatus::Pending,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            execution_time_ms: None,
            user_rating: None,
            user_comment: None,
            reward: None,
        };

        if let Err(e) = self.storage.insert_execution(&row) {
            warn!(
                tool = tool_name,
                execution_id = %row.execution_id,
                "ledger insert failed, continuing without persistence: {e}"
            );
        }
        row
    }

    /// Record a tool call's terminal outcome and return the computed reward
    /// together with the ledger row, when one could be recovered.
    ///
    /// Persistence failures (including an unknown id, e.g. after a degraded
    /// start) leave the reward pipeline intact: the reward is computed from
    /// the reported outcome alone.
    pub fn record_end(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        execution_time_ms: u64,
    ) -> (f64, Option<ToolExecution>) {
        let mut row = match self.storage.get_execution(execution_id) {
            Ok(row) => row,
            Err(e) => {
                warn!(execution_id, "ledger read failed on completion: {e}");
                None
            }
        };

        let completed_at = chrono::Utc::now().to_rfc3339();
        let reward = {
            // Reward is a function of the outcome, not of ledger health.
            let view = ToolExecution {
                status,
                execution_time_ms: Some(execution_time_ms),
                completed_at: Some(completed_at.clone()),
                ..row.clone().unwrap_or_else(|| ToolExecution {
                    execution_id: execution_id.to_string(),
                    session_id: String::new(),
                    tool_name: String::new(),
                    arguments: "{}".to_string(),
                    context_hash: String::new(),
                    status,
                    started_at: completed_at.clone(),
                    completed_at: None,
                    execution_time_ms: None,
                    user_rating: None,
                    user_comment: None,
                    reward: None,
                })
            };
            calculate_reward(&self.reward_config, &view)
        };

        // The row is handed back (and learning happens) only when the
        // pending -> terminal transition was actually applied; a duplicate
        // completion must not drive a second policy update.
        let applied = match self
            .storage
            .complete_execution(execution_id, status, execution_time_ms, &completed_at, reward)
        {
            Ok(applied) => {
                if !applied {
                    warn!(execution_id, "no pending ledger row to complete");
                }
                applied
            }
            Err(e) => {
                warn!(execution_id, "ledger completion failed: {e}");
                false
            }
        };
        if !applied {
            return (reward, None);
        }

        if let Some(row) = row.as_mut() {
            row.status = status;
            row.execution_time_ms = Some(execution_time_ms);
            row.completed_at = Some(completed_at);
            row.reward = Some(reward);
        }
        (reward, row)
    }

    /// Attach a 1-5 user rating to an execution and recompute its reward.
    ///
    /// The recomputed reward is stored on the row and returned; the policy
    /// update already driven by the original reward is deliberately left in
    /// place as a stale estimate. Query path: errors surface.
    pub fn submit_feedback(
        &self,
        execution_id: &str,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<f64> {
        if !(1..=5).contains(&rating) {
            return Err(LearnError::InvalidInput(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }

        let mut row = self
            .storage
            .get_execution(execution_id)?
            .ok_or_else(|| LearnError::NotFound(execution_id.to_string()))?;

        row.user_rating = Some(rating);
        let reward = calculate_reward(&self.reward_config, &row);

        if !self
            .storage
            .set_user_rating(execution_id, rating, comment, reward)?
        {
            return Err(LearnError::NotFound(execution_id.to_string()));
        }
        Ok(reward)
    }

    /// Per-tool aggregates over the whole ledger.
    pub fn tool_metrics(&self) -> Result<Vec<ToolMetrics>> {
        self.storage.tool_metrics()
    }

    /// Most-recent-first executions, optionally filtered by tool.
    pub fn recent_executions(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ToolExecution>> {
        self.storage.recent_executions(tool_name, limit)
    }

    /// Fetch one execution row.
    pub fn get(&self, execution_id: &str) -> Result<Option<ToolExecution>> {
        self.storage.get_execution(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ledger() -> ExecutionLedger {
        ExecutionLedger::new(
            Arc::new(LearnStorage::in_memory().unwrap()),
            RewardConfig::default(),
        )
    }

    #[test]
    fn test_record_start_persists_pending_row() {
        let ledger = make_ledger();
        let args = serde_json::json!({"entity": "E100"});
        let row = ledger.record_start("s1", "export_data_slice", &args, "ctx-a");

        assert!(!row.execution_id.is_empty());
        assert_eq!(row.status, ExecutionStatus::Pending);

        let stored = ledger.get(&row.execution_id).unwrap().unwrap();
        assert_eq!(stored.tool_name, "export_data_slice");
        assert_eq!(stored.context_hash, "ctx-a");
        assert_eq!(stored.arguments, args.to_string());
    }

    #[test]
    fn test_record_end_success_base_reward() {
        let ledger = make_ledger();
        let row = ledger.record_start("s1", "toolX", &serde_json::json!({}), "ctx");

        let (reward, updated) =
            ledger.record_end(&row.execution_id, ExecutionStatus::Success, 120);
        assert!((reward - 1.0).abs() < f64::EPSILON);

        let updated = updated.unwrap();
        assert_eq!(updated.status, ExecutionStatus::Success);
        assert_eq!(updated.execution_time_ms, Some(120));

        let stored = ledger.get(&row.execution_id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!((stored.reward.unwrap() - 1.0).abs() < f64::EPSILON);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_record_end_error_negative_reward() {
        let ledger = make_ledger();
        let row = ledger.record_start("s1", "toolX", &serde_json::json!({}), "ctx");

        let (reward, _) = ledger.record_end(&row.execution_id, ExecutionStatus::Error, 80);
        assert!((reward + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_end_twice_second_is_inert() {
        let ledger = make_ledger();
        let row = ledger.record_start("s1", "toolX", &serde_json::json!({}), "ctx");
        let (first, first_row) =
            ledger.record_end(&row.execution_id, ExecutionStatus::Success, 120);
        assert!(first_row.is_some());

        // Duplicate completion: reward still computed, but no row handed
        // back and the stored outcome is untouched.
        let (second, second_row) =
            ledger.record_end(&row.execution_id, ExecutionStatus::Error, 999);
        assert!(second_row.is_none());
        assert!((second + 1.0).abs() < f64::EPSILON);

        let stored = ledger.get(&row.execution_id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!((stored.reward.unwrap() - first).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_end_unknown_id_still_yields_reward() {
        let ledger = make_ledger();
        // Simulates a degraded start: no row exists, the reward pipeline
        // must keep working from the reported outcome alone.
        let (reward, row) = ledger.record_end("ghost", ExecutionStatus::Success, 300);
        assert!((reward - 1.0).abs() < f64::EPSILON);
        assert!(row.is_none());
    }

    #[test]
    fn test_submit_feedback_recomputes_reward() {
        let ledger = make_ledger();
        let row = ledger.record_start("s1", "toolX", &serde_json::json!({}), "ctx");
        ledger.record_end(&row.execution_id, ExecutionStatus::Success, 120);

        // 1 star: +1 base + (1-3)/2 = 0.
        let reward = ledger.submit_feedback(&row.execution_id, 1, None).unwrap();
        assert!((reward - 0.0).abs() < f64::EPSILON);

        let stored = ledger.get(&row.execution_id).unwrap().unwrap();
        assert_eq!(stored.user_rating, Some(1));
        assert!((stored.reward.unwrap() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_submit_feedback_five_stars_clamped() {
        let ledger = make_ledger();
        let row = ledger.record_start("s1", "toolX", &serde_json::json!({}), "ctx");
        ledger.record_end(&row.execution_id, ExecutionStatus::Success, 120);

        let reward = ledger
            .submit_feedback(&row.execution_id, 5, Some("excellent"))
            .unwrap();
        // +1 base + 1 rating = 2.0, at the clamp boundary.
        assert!((reward - 2.0).abs() < f64::EPSILON);

        let stored = ledger.get(&row.execution_id).unwrap().unwrap();
        assert_eq!(stored.user_comment.as_deref(), Some("excellent"));
    }

    #[test]
    fn test_submit_feedback_unknown_id_is_not_found() {
        let ledger = make_ledger();
        let err = ledger.submit_feedback("ghost", 4, None).unwrap_err();
        assert!(matches!(err, LearnError::NotFound(_)));
    }

    #[test]
    fn test_submit_feedback_invalid_rating() {
        let ledger = make_ledger();
        let row = ledger.record_start("s1", "toolX", &serde_json::json!({}), "ctx");

        for bad in [0u8, 6, 200] {
            let err = ledger.submit_feedback(&row.execution_id, bad, None).unwrap_err();
            assert!(matches!(err, LearnError::InvalidInput(_)));
        }
    }

    #[test]
    fn test_tool_metrics_and_recent_passthrough() {
        let ledger = make_ledger();
        let row_a = ledger.record_start("s1", "a", &serde_json::json!({}), "ctx");
        ledger.record_end(&row_a.execution_id, ExecutionStatus::Success, 100);
        let row_b = ledger.record_start("s1", "b", &serde_json::json!({}), "ctx");
        ledger.record_end(&row_b.execution_id, ExecutionStatus::Error, 100);

        let metrics = ledger.tool_metrics().unwrap();
        assert_eq!(metrics.len(), 2);

        let recent = ledger.recent_executions(None, 10).unwrap();
        assert_eq!(recent.len(), 2);
        let only_a = ledger.recent_executions(Some("a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
    }
}
