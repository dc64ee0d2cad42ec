//! Metrics dashboard
//!
//! This module provides:
//! - Conversion of metrics snapshots into display metrics with status and
//!   bar percentages
//! - Severity-tagged alerts raised from detected bottlenecks
//! - A background update loop; stopping awaits the loop's completion

use crate::config::MetricsConfig;
use crate::metrics::{detect_bottlenecks, MetricsAggregator, MetricsSnapshot};
use crate::optimizer::{AdaptiveOptimizer, PressureLevel};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Health status of a display metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricStatus {
    Good,
    Warning,
    Critical,
}

/// One renderable metric
#[derive(Debug, Clone, Serialize)]
pub struct DisplayMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub status: MetricStatus,
    /// Fill fraction for bar rendering, in [0, 100]
    pub percentage: f64,
}

impl DisplayMetric {
    fn new(name: &str, value: f64, unit: &str, status: MetricStatus, percentage: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            status,
            percentage: percentage.clamp(0.0, 100.0),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A raised alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

fn status_for_utilization(percent: f64) -> MetricStatus {
    if percent > 90.0 {
        MetricStatus::Critical
    } else if percent > 75.0 {
        MetricStatus::Warning
    } else {
        MetricStatus::Good
    }
}

/// Converts snapshots into display state on a fixed cadence
pub struct Dashboard {
    metrics: Arc<MetricsAggregator>,
    optimizer: Arc<AdaptiveOptimizer>,
    config: MetricsConfig,
    display: RwLock<Vec<DisplayMetric>>,
    alerts: Mutex<Vec<Alert>>,
    shutdown: Mutex<Option<CancellationToken>>,
    update_loop: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dashboard {
    pub fn new(
        metrics: Arc<MetricsAggregator>,
        optimizer: Arc<AdaptiveOptimizer>,
        config: MetricsConfig,
    ) -> Self {
        Self {
            metrics,
            optimizer,
            config,
            display: RwLock::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            update_loop: tokio::sync::Mutex::new(None),
        }
    }

    /// Latest display metrics.
    pub fn display_metrics(&self) -> Vec<DisplayMetric> {
        self.display.read().clone()
    }

    /// Alerts raised since the last drain.
    pub fn drain_alerts(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    /// Refresh display metrics and alerts from a fresh snapshot.
    pub fn update(&self) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot(self.optimizer.sample());
        let mut display = Vec::new();

        display.push(DisplayMetric::new(
            "CPU",
            snapshot.resources.cpu_percent as f64,
            "%",
            status_for_utilization(snapshot.resources.cpu_percent as f64),
            snapshot.resources.cpu_percent as f64,
        ));
        display.push(DisplayMetric::new(
            "Memory",
            snapshot.resources.memory_percent as f64,
            "%",
            status_for_utilization(snapshot.resources.memory_percent as f64),
            snapshot.resources.memory_percent as f64,
        ));
        display.push(DisplayMetric::new(
            "Working set",
            (snapshot.resources.process_memory / 1_048_576) as f64,
            "MB",
            if snapshot.resources.process_memory > self.config.working_set_threshold {
                MetricStatus::Critical
            } else {
                MetricStatus::Good
            },
            snapshot.resources.process_memory as f64 / self.config.working_set_threshold as f64
                * 100.0,
        ));

        for (kind, metrics) in &snapshot.per_kind {
            let rate = metrics.success_rate();
            let status = if rate < 0.8 {
                MetricStatus::Critical
            } else if rate < self.config.low_success_threshold {
                MetricStatus::Warning
            } else {
                MetricStatus::Good
            };
            display.push(DisplayMetric::new(
                &format!("{kind} success"),
                rate * 100.0,
                "%",
                status,
                rate * 100.0,
            ));
            display.push(DisplayMetric::new(
                &format!("{kind} throughput"),
                metrics.throughput() / 1_048_576.0,
                "MB/s",
                MetricStatus::Good,
                0.0,
            ));
        }

        *self.display.write() = display;

        let mut alerts = self.alerts.lock();
        for bottleneck in detect_bottlenecks(&snapshot, &self.config) {
            let severity = if bottleneck.kind.is_none() {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            alerts.push(Alert {
                severity,
                message: match &bottleneck.kind {
                    Some(kind) => format!("{kind}: {}", bottleneck.reason),
                    None => bottleneck.reason.clone(),
                },
                raised_at: Utc::now(),
            });
        }
        if snapshot.resources.pressure == PressureLevel::Critical {
            alerts.push(Alert {
                severity: AlertSeverity::Critical,
                message: "system resource pressure is critical".to_string(),
                raised_at: Utc::now(),
            });
        }

        snapshot
    }

    /// Start the background update loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut update_loop = self.update_loop.lock().await;
        if update_loop.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let dashboard = Arc::clone(self);
        let interval = Duration::from_secs(self.config.update_interval_secs);
        *update_loop = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        dashboard.update();
                    }
                }
            }
        }));
    }

    /// Stop the update loop and await its completion. Idempotent.
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let handle = self.update_loop.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;

    fn dashboard() -> Arc<Dashboard> {
        Arc::new(Dashboard::new(
            Arc::new(MetricsAggregator::new()),
            Arc::new(AdaptiveOptimizer::new(4, OptimizerConfig::default())),
            MetricsConfig::default(),
        ))
    }

    #[test]
    fn test_status_bands() {
        assert_eq!(status_for_utilization(10.0), MetricStatus::Good);
        assert_eq!(status_for_utilization(80.0), MetricStatus::Warning);
        assert_eq!(status_for_utilization(95.0), MetricStatus::Critical);
    }

    #[tokio::test]
    async fn test_update_builds_display_metrics() {
        let dash = dashboard();
        dash.metrics
            .record_success("compress", Duration::from_millis(10), 1000, 1);
        dash.update();

        let display = dash.display_metrics();
        assert!(display.iter().any(|m| m.name == "CPU"));
        assert!(display.iter().any(|m| m.name == "compress success"));
        let cpu = display.iter().find(|m| m.name == "CPU").unwrap();
        assert!((0.0..=100.0).contains(&cpu.percentage));
    }

    #[tokio::test]
    async fn test_flaky_kind_raises_alert() {
        let dash = dashboard();
        for _ in 0..5 {
            dash.metrics
                .record_failure("flaky", Duration::from_millis(10));
        }
        dash.metrics
            .record_success("flaky", Duration::from_millis(10), 10, 1);
        dash.update();

        let alerts = dash.drain_alerts();
        assert!(alerts.iter().any(|a| a.message.contains("flaky")));
        // Alerts drain once.
        assert!(dash.drain_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_awaits_loop() {
        let dash = dashboard();
        dash.start().await;
        dash.start().await; // idempotent
        dash.stop().await;
        dash.stop().await; // idempotent
    }
}
