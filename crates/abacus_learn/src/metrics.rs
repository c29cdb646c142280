//! In-memory learning metrics: bounded ring buffers with on-demand summaries.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::types::{MetricSample, MetricSummary};

/// Metric names sampled by the learning pipeline.
pub const METRIC_REWARD: &str = "reward";
pub const METRIC_TD_ERROR: &str = "td_error";
pub const METRIC_EPISODE_REWARD: &str = "episode_reward";
pub const METRIC_EXPLORATION_RATE: &str = "exploration_rate";
pub const METRIC_BATCH_TD_ERROR: &str = "batch_avg_td_error";

/// One bounded ring buffer per metric name. Recording never blocks on I/O
/// and never fails; overflow evicts the oldest sample.
pub struct MetricsTracker {
    capacity: usize,
    buffers: Mutex<HashMap<String, VecDeque<MetricSample>>>,
}

impl MetricsTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a sample for a metric.
    pub fn record(&self, metric_name: &str, value: f64) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(metric_name.to_string()).or_default();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(MetricSample {
            value,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
    }

    /// Most-recent-first samples for a metric, up to `limit`.
    pub fn recent(&self, metric_name: &str, limit: usize) -> Vec<MetricSample> {
        let buffers = self.buffers.lock();
        match buffers.get(metric_name) {
            Some(buffer) => buffer.iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Summary statistics over the most recent `window` samples, or None if
    /// the metric has no samples at all.
    pub fn summary(&self, metric_name: &str, window: usize) -> Option<MetricSummary> {
        let buffers = self.buffers.lock();
        let buffer = buffers.get(metric_name)?;
        if buffer.is_empty() {
            return None;
        }

        let values: Vec<f64> = buffer.iter().rev().take(window).map(|s| s.value).collect();
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Some(MetricSummary {
            count,
            mean,
            std: variance.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            latest: values[0],
        })
    }

    /// Names of all metrics with at least one sample, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let buffers = self.buffers.lock();
        let mut names: Vec<String> = buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
