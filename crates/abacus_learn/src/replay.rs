//! Prioritized experience replay buffer.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;

use crate::types::{Experience, ReplayStats};

struct ReplayInner {
    buffer: VecDeque<Experience>,
    priorities: VecDeque<f64>,
}

/// Fixed-capacity buffer of transitions with priority-weighted sampling.
///
/// Priorities are raised to `priority_exponent` when sampling (0 = uniform,
/// 1 = fully proportional). Pushing past capacity evicts the oldest entry.
pub struct ReplayBuffer {
    capacity: usize,
    priority_exponent: f64,
    inner: Mutex<ReplayInner>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, priority_exponent: f64) -> Self {
        Self {
            capacity,
            priority_exponent,
            inner: Mutex::new(ReplayInner {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                priorities: VecDeque::with_capacity(capacity.min(1024)),
            }),
        }
    }

    /// Add an experience. Without an explicit priority it inherits the
    /// current maximum, so new transitions are sampled at least once.
    pub fn push(&self, experience: Experience, priority: Option<f64>) {
        let mut inner = self.inner.lock();
        let priority = priority.unwrap_or_else(|| {
            inner
                .priorities
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max)
                .max(1.0)
        });

        if inner.buffer.len() == self.capacity {
            inner.buffer.pop_front();
            inner.priorities.pop_front();
        }
        inner.buffer.push_back(experience);
        inner.priorities.push_back(priority.max(0.0));
    }

    /// Sample up to `batch_size` experiences without replacement, weighted
    /// by priority^exponent. When the buffer holds fewer entries than the
    /// batch, everything is returned.
    pub fn sample(&self, batch_size: usize) -> Vec<Experience> {
        let inner = self.inner.lock();
        if inner.buffer.len() <= batch_size {
            return inner.buffer.iter().cloned().collect();
        }

        let mut weights: Vec<f64> = inner
            .priorities
            .iter()
            .map(|p| p.powf(self.priority_exponent).max(f64::MIN_POSITIVE))
            .collect();
        let mut remaining: Vec<usize> = (0..inner.buffer.len()).collect();
        let mut rng = rand::rng();
        let mut batch = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let total: f64 = remaining.iter().map(|&i| weights[i]).sum();
            let mut point = rng.random::<f64>() * total;
            let mut chosen = remaining.len() - 1;
            for (pos, &idx) in remaining.iter().enumerate() {
                point -= weights[idx];
                if point <= 0.0 {
                    chosen = pos;
                    break;
                }
            }
            let idx = remaining.swap_remove(chosen);
            batch.push(inner.buffer[idx].clone());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            len: self.len(),
            capacity: self.capacity,
        }
    }
}
