use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal status of a tool call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse the stored column value. Unrecognized text maps to `Pending`
    /// so a corrupted row degrades to "never completed" rather than failing
    /// the whole query.
    pub fn from_db(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// A tool call observed at start time, as reported by the execution harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// The result of a finished tool call, as reported by the execution harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    /// Tool result on success, error description on failure.
    pub payload: serde_json::Value,
}

/// One row of the durable execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub execution_id: String,
    pub session_id: String,
    pub tool_name: String,
    /// Serialized JSON arguments, kept as text for the audit trail.
    pub arguments: String,
    pub context_hash: String,
    pub status: ExecutionStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub user_rating: Option<u8>,
    pub user_comment: Option<String>,
    pub reward: Option<f64>,
}

/// Aggregate per-tool statistics derived from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetrics {
    pub tool_name: String,
    pub total_calls: u64,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
    pub avg_user_rating: Option<f64>,
}

/// One Q-value cell, keyed by (tool_name, context_hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub tool_name: String,
    pub context_hash: String,
    pub q_value: f64,
    pub visit_count: u32,
    pub last_updated: String,
}

/// How a finished session went, as judged by its aggregate reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Success,
    Partial,
    Failure,
}

impl EpisodeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failure" => Self::Failure,
            _ => Self::Partial,
        }
    }
}

/// One complete session: its ordered tool sequence and aggregate reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub session_id: String,
    pub tool_sequence: Vec<String>,
    pub episode_reward: f64,
    pub outcome: EpisodeOutcome,
    pub created_at: String,
}

/// A single state transition kept for experience replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub context_hash: String,
    pub tool_name: String,
    pub reward: f64,
    pub next_context_hash: Option<String>,
    pub terminal: bool,
}

/// One ranked tool recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub tool_name: String,
    pub score: f64,
    pub confidence: f64,
    /// True when the backing policy entry has too few visits to trust.
    pub exploratory: bool,
    pub reason: String,
}

/// A sequence-memory suggestion for the next tool.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceSuggestion {
    pub tool_name: String,
    pub score: f64,
    pub reason: String,
}

/// Aggregated statistics for one recorded tool n-gram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStats {
    pub sequence_key: String,
    pub count: u32,
    pub avg_reward: f64,
    pub success_rate: f64,
    pub last_seen: String,
}

/// Snapshot of the epsilon-greedy exploration state.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorationStats {
    pub current_exploration_rate: f64,
    pub initial_exploration_rate: f64,
    pub total_selections: u64,
}

/// One observed metric value.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: String,
}

/// Summary statistics over a metric window.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
}

/// Occupancy of the experience replay buffer.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayStats {
    pub len: usize,
    pub capacity: usize,
}

/// Comprehensive learning statistics for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub update_count: u64,
    pub replay: ReplayStats,
    pub exploration: ExplorationStats,
    /// Per-metric summaries, keyed by metric name; empty windows omitted.
    pub metrics: BTreeMap<String, MetricSummary>,
}
