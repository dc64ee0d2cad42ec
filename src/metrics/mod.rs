//! Task metrics aggregation
//!
//! This module provides:
//! - Per-task-kind counters: outcomes, durations, bytes and items
//! - Consolidated snapshots joined with a resource sample
//! - Bottleneck detection over snapshots

pub mod dashboard;

pub use dashboard::{Alert, AlertSeverity, Dashboard, DisplayMetric, MetricStatus};

use crate::config::MetricsConfig;
use crate::optimizer::ResourceSnapshot;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Aggregated counters for one task kind
#[derive(Debug, Clone, Default, Serialize)]
pub struct KindMetrics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_duration_ms: u64,
    pub bytes_processed: u64,
    pub items_processed: u64,
}

impl KindMetrics {
    /// Completed fraction of all finished runs, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded + self.failed;
        if finished == 0 {
            return 1.0;
        }
        self.succeeded as f64 / finished as f64
    }

    /// Mean wall-clock duration per run in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total as f64
    }

    /// Bytes per second over the aggregate runtime.
    pub fn throughput(&self) -> f64 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        self.bytes_processed as f64 / (self.total_duration_ms as f64 / 1000.0)
    }
}

/// A consolidated metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub per_kind: HashMap<String, KindMetrics>,
    pub resources: ResourceSnapshot,
}

/// A detected bottleneck
#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    /// Task kind at fault, or `None` for process-wide conditions
    pub kind: Option<String>,
    pub reason: String,
}

/// Concurrent per-kind metrics store
pub struct MetricsAggregator {
    kinds: DashMap<String, KindMetrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            kinds: DashMap::new(),
        }
    }

    /// Record a successful run.
    pub fn record_success(&self, kind: &str, duration: Duration, bytes: u64, items: u64) {
        let mut entry = self.kinds.entry(kind.to_string()).or_default();
        entry.total += 1;
        entry.succeeded += 1;
        entry.total_duration_ms += duration.as_millis() as u64;
        entry.bytes_processed += bytes;
        entry.items_processed += items;
    }

    /// Record a failed run.
    pub fn record_failure(&self, kind: &str, duration: Duration) {
        let mut entry = self.kinds.entry(kind.to_string()).or_default();
        entry.total += 1;
        entry.failed += 1;
        entry.total_duration_ms += duration.as_millis() as u64;
    }

    /// Record a cancelled run.
    pub fn record_cancelled(&self, kind: &str) {
        let mut entry = self.kinds.entry(kind.to_string()).or_default();
        entry.total += 1;
        entry.cancelled += 1;
    }

    /// Counters for one kind.
    pub fn kind(&self, kind: &str) -> Option<KindMetrics> {
        self.kinds.get(kind).map(|e| e.clone())
    }

    /// Consolidate every kind with a resource sample.
    pub fn snapshot(&self, resources: ResourceSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            per_kind: self
                .kinds
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            resources,
        }
    }

    /// Reset all counters.
    pub fn clear(&self) {
        self.kinds.clear();
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag task kinds and process-wide conditions that look like bottlenecks.
pub fn detect_bottlenecks(snapshot: &MetricsSnapshot, config: &MetricsConfig) -> Vec<Bottleneck> {
    let mut found = Vec::new();
    for (kind, metrics) in &snapshot.per_kind {
        if metrics.average_duration_ms() > config.slow_task_threshold_ms as f64 {
            found.push(Bottleneck {
                kind: Some(kind.clone()),
                reason: format!(
                    "average duration {:.0} ms exceeds {} ms",
                    metrics.average_duration_ms(),
                    config.slow_task_threshold_ms
                ),
            });
        }
        if metrics.bytes_processed > 0
            && metrics.throughput() < config.low_throughput_threshold as f64
        {
            found.push(Bottleneck {
                kind: Some(kind.clone()),
                reason: format!(
                    "throughput {:.1} MB/s below {:.1} MB/s",
                    metrics.throughput() / 1_048_576.0,
                    config.low_throughput_threshold as f64 / 1_048_576.0
                ),
            });
        }
        if metrics.succeeded + metrics.failed > 0
            && metrics.success_rate() < config.low_success_threshold
        {
            found.push(Bottleneck {
                kind: Some(kind.clone()),
                reason: format!(
                    "success rate {:.1}% below {:.1}%",
                    metrics.success_rate() * 100.0,
                    config.low_success_threshold * 100.0
                ),
            });
        }
    }
    if snapshot.resources.process_memory > config.working_set_threshold {
        found.push(Bottleneck {
            kind: None,
            reason: format!(
                "working set {} MB above threshold {} MB",
                snapshot.resources.process_memory / 1_048_576,
                config.working_set_threshold / 1_048_576
            ),
        });
    }
    found
}
