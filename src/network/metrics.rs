//! Rolling link-health metrics.
//!
//! Aggregates are always recomputed from the current windows, never from
//! lifetime totals, so old behaviour ages out after `capacity` samples.

use crate::network::lock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Samples kept per window
pub const METRICS_WINDOW_CAPACITY: usize = 50;

/// Bounded FIFO of recent samples
#[derive(Debug, Clone)]
pub struct MetricsWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> MetricsWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest one when full
    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }
}

/// Derived classification of recent link health
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityTier {
    /// Classify window aggregates; the first matching tier wins
    pub fn from_aggregates(latency_ms: f64, success_ratio: f64) -> Self {
        if latency_ms < 100.0 && success_ratio > 0.95 {
            QualityTier::Excellent
        } else if latency_ms < 500.0 && success_ratio > 0.85 {
            QualityTier::Good
        } else if latency_ms < 1000.0 && success_ratio > 0.70 {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Unknown => "unknown",
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the aggregator used for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub rolling_latency_ms: f64,
    pub success_ratio: f64,
    pub quality_tier: QualityTier,
    pub samples: usize,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
}

#[derive(Debug)]
struct MetricsState {
    latencies: MetricsWindow<f64>,
    outcomes: MetricsWindow<bool>,
    successful_transfers: u64,
    failed_transfers: u64,
}

impl MetricsState {
    fn rolling_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    fn success_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / self.outcomes.len() as f64
    }

    fn quality_tier(&self) -> QualityTier {
        if self.outcomes.is_empty() {
            return QualityTier::Unknown;
        }
        QualityTier::from_aggregates(self.rolling_latency(), self.success_ratio())
    }
}

/// Owner of the latency and outcome windows
#[derive(Debug)]
pub struct MetricsAggregator {
    state: Mutex<MetricsState>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_capacity(METRICS_WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                latencies: MetricsWindow::new(capacity),
                outcomes: MetricsWindow::new(capacity),
                successful_transfers: 0,
                failed_transfers: 0,
            }),
        }
    }

    /// Record one delivery attempt and return the resulting tier.
    ///
    /// Latency only enters the latency window for successful attempts.
    pub fn record_outcome(&self, latency_ms: f64, success: bool) -> QualityTier {
        let mut state = lock(&self.state);
        if success {
            state.latencies.push(latency_ms);
            state.successful_transfers += 1;
        } else {
            state.failed_transfers += 1;
        }
        state.outcomes.push(success);
        state.quality_tier()
    }

    /// Mean latency of the window in milliseconds, 0 when empty
    pub fn rolling_latency(&self) -> f64 {
        lock(&self.state).rolling_latency()
    }

    /// Share of successful attempts in the window, 0 when empty
    pub fn success_ratio(&self) -> f64 {
        lock(&self.state).success_ratio()
    }

    pub fn quality_tier(&self) -> QualityTier {
        lock(&self.state).quality_tier()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = lock(&self.state);
        MetricsSnapshot {
            rolling_latency_ms: state.rolling_latency(),
            success_ratio: state.success_ratio(),
            quality_tier: state.quality_tier(),
            samples: state.outcomes.len(),
            successful_transfers: state.successful_transfers,
            failed_transfers: state.failed_transfers,
        }
    }
}
