pub mod context;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod policy;
pub mod replay;
pub mod reward;
pub mod selector;
pub mod sequences;
pub mod session;
pub mod storage;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use abacus_core::AbacusConfig;

use ledger::ExecutionLedger;
use metrics::{
    METRIC_BATCH_TD_ERROR, METRIC_EPISODE_REWARD, METRIC_EXPLORATION_RATE, METRIC_REWARD,
    METRIC_TD_ERROR, MetricsTracker,
};
use policy::PolicyStore;
use replay::ReplayBuffer;
use reward::{RewardConfig, calculate_reward};
use selector::ToolSelector;
use sequences::SequenceMemory;
use session::SessionTracker;
use storage::LearnStorage;

pub use error::{LearnError, Result};
pub use types::*;

/// How many policy updates between replay sweeps.
const REPLAY_SWEEP_INTERVAL: u64 = 10;

/// Window used for the per-metric summaries in [`AdvisorService::learning_stats`].
const STATS_WINDOW: usize = 100;

/// The central coordination point for execution feedback and tool
/// recommendation.
///
/// `AdvisorService` owns the store and every learning subsystem, and is the
/// single boundary where telemetry-path errors are caught: recording an
/// execution or updating the policy can log a failure but can never fail the
/// tool call being observed. Query methods (feedback, metrics,
/// recommendations) return typed errors instead.
///
/// Construct one at startup and share it by reference; there is no global
/// instance.
pub struct AdvisorService {
    storage: Arc<LearnStorage>,
    pub ledger: ExecutionLedger,
    pub policy: PolicyStore,
    pub selector: ToolSelector,
    pub sequences: SequenceMemory,
    pub replay: ReplayBuffer,
    pub metrics: MetricsTracker,
    sessions: SessionTracker,
    reward_config: RewardConfig,
    update_count: AtomicU64,
    replay_batch_size: usize,
    feedback_enabled: bool,
}

impl AdvisorService {
    /// Open a persistent service backed by a database at the given path.
    pub fn open(db_path: &str, config: &AbacusConfig) -> Result<Self> {
        let storage = Arc::new(LearnStorage::open(db_path)?);
        Ok(Self::from_storage(storage, config))
    }

    /// Create an in-memory service (useful for tests).
    pub fn in_memory(config: &AbacusConfig) -> Result<Self> {
        let storage = Arc::new(LearnStorage::in_memory()?);
        Ok(Self::from_storage(storage, config))
    }

    fn from_storage(storage: Arc<LearnStorage>, config: &AbacusConfig) -> Self {
        let reward_config = RewardConfig::from_config(config);
        Self {
            ledger: ExecutionLedger::new(Arc::clone(&storage), reward_config.clone()),
            policy: PolicyStore::new(Arc::clone(&storage), config),
            selector: ToolSelector::new(config),
            sequences: SequenceMemory::new(Arc::clone(&storage)),
            replay: ReplayBuffer::new(config.replay_capacity, config.replay_priority_exponent),
            metrics: MetricsTracker::new(config.metrics_capacity),
            sessions: SessionTracker::new(config.session_grace_secs),
            storage,
            reward_config,
            update_count: AtomicU64::new(0),
            replay_batch_size: config.replay_batch_size,
            feedback_enabled: config.feedback_enabled,
        }
    }

    // ── telemetry path ───────────────────────────────────────────────

    /// Record the start of a tool call. Infallible by contract: the caller
    /// gets an execution id whether or not anything could be persisted.
    pub fn record_start(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> String {
        let state = self.sessions.begin_call(session_id);
        if !self.feedback_enabled {
            return Uuid::new_v4().to_string();
        }

        let context_hash = context::context_hash(
            &state.user_query,
            state.previous_tool.as_deref(),
            state.session_length,
        );
        self.ledger
            .record_start(session_id, tool_name, arguments, &context_hash)
            .execution_id
    }

    /// [`record_start`](Self::record_start) for callers handing over the
    /// harness's invocation record whole.
    pub fn observe_start(&self, invocation: &ToolInvocation) -> String {
        self.record_start(
            &invocation.session_id,
            &invocation.tool_name,
            &invocation.arguments,
        )
    }

    /// [`record_end`](Self::record_end) for callers handing over the
    /// harness's outcome record whole.
    pub fn observe_end(&self, execution_id: &str, outcome: &ToolOutcome) -> f64 {
        self.record_end(
            execution_id,
            outcome.status,
            outcome.execution_time_ms,
            &outcome.payload,
        )
    }

    /// Record a tool call's outcome and drive one learning cycle. Returns
    /// the computed reward; every failure past the reward computation is
    /// caught and logged here.
    pub fn record_end(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        execution_time_ms: u64,
        payload: &serde_json::Value,
    ) -> f64 {
        if status == ExecutionStatus::Error {
            debug!(execution_id, %payload, "tool call failed");
        }

        let (reward, row) = if self.feedback_enabled {
            self.ledger.record_end(execution_id, status, execution_time_ms)
        } else {
            let view = ToolExecution {
                execution_id: execution_id.to_string(),
                session_id: String::new(),
                tool_name: String::new(),
                arguments: "{}".to_string(),
                context_hash: String::new(),
                status,
                started_at: chrono::Utc::now().to_rfc3339(),
                completed_at: None,
                execution_time_ms: Some(execution_time_ms),
                user_rating: None,
                user_comment: None,
                reward: None,
            };
            (calculate_reward(&self.reward_config, &view), None)
        };

        // Without a ledger row there is no context to learn against; the
        // reward alone keeps the caller's pipeline alive.
        if let Some(row) = row {
            self.learn_from_execution(&row, reward);
        }
        reward
    }

    fn learn_from_execution(&self, row: &ToolExecution, reward: f64) {
        let session = self.sessions.snapshot(&row.session_id);
        let next_context_hash = match &session {
            Some(s) => context::context_hash(
                &s.user_query,
                Some(row.tool_name.as_str()),
                s.session_length + 1,
            ),
            // Session lost (e.g. process restart between start and end):
            // fall back to the coarsest next state.
            None => context::context_hash("", Some(row.tool_name.as_str()), 1),
        };

        self.replay.push(
            Experience {
                context_hash: row.context_hash.clone(),
                tool_name: row.tool_name.clone(),
                reward,
                next_context_hash: Some(next_context_hash.clone()),
                terminal: false,
            },
            Some(reward.abs() + 1.0),
        );

        match self.policy.update(
            &row.tool_name,
            &row.context_hash,
            reward,
            Some(&next_context_hash),
            None,
        ) {
            Ok(step) => {
                self.metrics.record(METRIC_TD_ERROR, step.td_error.abs());
            }
            Err(e) => {
                warn!(tool = %row.tool_name, "policy update skipped: {e}");
            }
        }
        self.metrics.record(METRIC_REWARD, reward);
        self.metrics.record(
            METRIC_EXPLORATION_RATE,
            self.selector.exploration_stats().current_exploration_rate,
        );

        self.sessions
            .complete_call(&row.session_id, &row.tool_name, reward);

        let count = self.update_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(REPLAY_SWEEP_INTERVAL)
            && self.replay.len() >= self.replay_batch_size
        {
            self.replay_sweep(None);
        }
    }

    /// Replay a sampled batch of past transitions through the Q-step.
    /// Telemetry path: a failing item is logged and skipped, never applied
    /// partially.
    pub fn replay_sweep(&self, available_tools: Option<&[String]>) {
        let batch = self.replay.sample(self.replay_batch_size);
        if batch.is_empty() {
            return;
        }

        let mut total_td_error = 0.0;
        let mut applied = 0usize;
        for experience in &batch {
            let next = if experience.terminal {
                None
            } else {
                experience.next_context_hash.as_deref()
            };
            match self.policy.update(
                &experience.tool_name,
                &experience.context_hash,
                experience.reward,
                next,
                available_tools,
            ) {
                Ok(step) => {
                    total_td_error += step.td_error.abs();
                    applied += 1;
                }
                Err(e) => {
                    warn!(tool = %experience.tool_name, "replay update skipped: {e}");
                }
            }
        }
        if applied > 0 {
            self.metrics
                .record(METRIC_BATCH_TD_ERROR, total_td_error / applied as f64);
        }
    }

    // ── query path ───────────────────────────────────────────────────

    /// Attach a 1-5 user rating to a recorded execution and recompute its
    /// stored reward.
    ///
    /// The policy update already driven by the original reward is left in
    /// place as a stale estimate; later visits to the same cell wash the
    /// difference out.
    pub fn submit_feedback(
        &self,
        execution_id: &str,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<()> {
        if !self.feedback_enabled {
            return Err(LearnError::InvalidInput(
                "feedback ledger is disabled".into(),
            ));
        }
        let reward = self.ledger.submit_feedback(execution_id, rating, comment)?;
        info!(execution_id, rating, reward, "user feedback recorded");
        Ok(())
    }

    /// Ranked tool recommendations for a session's current context. With
    /// the ledger disabled this returns an empty list rather than erroring.
    pub fn recommendations(
        &self,
        session_id: &str,
        user_query: &str,
        available_tools: &[String],
    ) -> Result<Vec<Recommendation>> {
        if !self.feedback_enabled {
            return Ok(Vec::new());
        }

        self.sessions.set_query(session_id, user_query);
        let state = self.sessions.begin_call(session_id);
        let context_hash = context::context_hash(
            user_query,
            state.previous_tool.as_deref(),
            state.session_length,
        );

        // Ledger aggregates only enrich the reason strings; their loss is
        // not worth failing the recommendation.
        let metrics = self.ledger.tool_metrics().unwrap_or_else(|e| {
            warn!("tool metrics unavailable for recommendations: {e}");
            Vec::new()
        });

        self.selector
            .recommendations(&self.policy, &metrics, &context_hash, available_tools)
    }

    /// Per-tool aggregate statistics from the ledger.
    pub fn tool_metrics(&self) -> Result<Vec<ToolMetrics>> {
        if !self.feedback_enabled {
            return Ok(Vec::new());
        }
        self.ledger.tool_metrics()
    }

    /// Most-recent-first executions, optionally filtered by tool.
    pub fn recent_executions(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ToolExecution>> {
        if !self.feedback_enabled {
            return Ok(Vec::new());
        }
        self.ledger.recent_executions(tool_name, limit)
    }

    /// Append a finished episode and feed the sequence memory.
    pub fn log_episode(
        &self,
        session_id: &str,
        tool_sequence: &[String],
        episode_reward: f64,
        outcome: EpisodeOutcome,
    ) -> Result<()> {
        if !self.feedback_enabled {
            return Ok(());
        }

        let episode = Episode {
            session_id: session_id.to_string(),
            tool_sequence: tool_sequence.to_vec(),
            episode_reward,
            outcome,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.storage.insert_episode(&episode)?;

        if let Err(e) =
            self.sequences
                .record(tool_sequence, episode_reward, outcome == EpisodeOutcome::Success)
        {
            warn!(session_id, "sequence memory update failed: {e}");
        }
        self.metrics.record(METRIC_EPISODE_REWARD, episode_reward);
        Ok(())
    }

    /// Finalize a session: log its episode (outcome derived from the
    /// accumulated reward) and retain the session state for the grace
    /// period. Returns the logged episode, or None for an unknown or
    /// already-finalized session.
    pub fn finalize_session(&self, session_id: &str) -> Result<Option<Episode>> {
        let Some(state) = self.sessions.finalize(session_id) else {
            return Ok(None);
        };

        let outcome = if state.accumulated_reward > 0.0 {
            EpisodeOutcome::Success
        } else if state.accumulated_reward < 0.0 {
            EpisodeOutcome::Failure
        } else {
            EpisodeOutcome::Partial
        };

        self.log_episode(
            session_id,
            &state.tool_sequence,
            state.accumulated_reward,
            outcome,
        )?;

        Ok(Some(Episode {
            session_id: session_id.to_string(),
            tool_sequence: state.tool_sequence,
            episode_reward: state.accumulated_reward,
            outcome,
            created_at: chrono::Utc::now().to_rfc3339(),
        }))
    }

    /// Highest-reward successful episodes, optionally filtered to those
    /// whose sequence used a given tool.
    pub fn successful_sequences(
        &self,
        tool_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        if !self.feedback_enabled {
            return Ok(Vec::new());
        }
        self.storage.successful_episodes(tool_name, limit)
    }

    /// Sequence-memory suggestions for what tends to follow the recent
    /// tool trail.
    pub fn next_tool_suggestions(
        &self,
        recent_tools: &[String],
        available_tools: &[String],
        top_k: usize,
    ) -> Result<Vec<SequenceSuggestion>> {
        self.sequences
            .next_tool_suggestions(recent_tools, available_tools, top_k)
    }

    // ── monitoring ───────────────────────────────────────────────────

    /// Comprehensive learning statistics for dashboards.
    pub fn learning_stats(&self) -> LearningStats {
        let mut summaries = BTreeMap::new();
        for name in [
            METRIC_REWARD,
            METRIC_TD_ERROR,
            METRIC_EPISODE_REWARD,
            METRIC_EXPLORATION_RATE,
            METRIC_BATCH_TD_ERROR,
        ] {
            if let Some(summary) = self.metrics.summary(name, STATS_WINDOW) {
                summaries.insert(name.to_string(), summary);
            }
        }

        LearningStats {
            update_count: self.update_count.load(Ordering::Relaxed),
            replay: self.replay.stats(),
            exploration: self.selector.exploration_stats(),
            metrics: summaries,
        }
    }

    /// Snapshot of the exploration schedule.
    pub fn exploration_stats(&self) -> ExplorationStats {
        self.selector.exploration_stats()
    }

    /// Number of tracked sessions (active and in-grace finalized).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop finalized sessions past their grace period.
    pub fn cleanup_sessions(&self) -> usize {
        self.sessions.cleanup()
    }
}
