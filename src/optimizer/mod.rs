//! Adaptive concurrency optimizer
//!
//! This module provides:
//! - System resource sampling (CPU, memory, process footprint)
//! - A pressure level derived from the sample
//! - Per-operation-class concurrency recommendations
//! - A shared concurrency value adjusted on a fixed cadence
//! - A cooperative backoff for callers when resources are scarce

use crate::config::OptimizerConfig;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use sysinfo::System;

/// Observed resource pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PressureLevel {
    /// CPU below 50 % and memory below 60 %
    Low,
    /// Between the Low and High bands
    Moderate,
    /// CPU above 75 % or memory above 80 %
    High,
    /// Either above 90 %
    Critical,
}

/// Operation classes with distinct concurrency appetites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationClass {
    Io,
    Cpu,
    Memory,
    Texture,
    Other,
}

/// One resource sample
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    /// Global CPU utilization in percent
    pub cpu_percent: f32,
    /// System memory utilization in percent
    pub memory_percent: f32,
    /// Resident memory of this process in bytes
    pub process_memory: u64,
    /// Virtual (committed) memory of this process in bytes
    pub committed_memory: u64,
    /// OS threads of this process (0 where the platform hides it)
    pub thread_count: usize,
    /// Pressure derived from the sample
    pub pressure: PressureLevel,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            process_memory: 0,
            committed_memory: 0,
            thread_count: 0,
            pressure: PressureLevel::Low,
        }
    }
}

/// Classify a sample into a pressure level.
pub fn pressure_of(cpu_percent: f32, memory_percent: f32) -> PressureLevel {
    if cpu_percent > 90.0 || memory_percent > 90.0 {
        PressureLevel::Critical
    } else if cpu_percent > 75.0 || memory_percent > 80.0 {
        PressureLevel::High
    } else if cpu_percent < 50.0 && memory_percent < 60.0 {
        PressureLevel::Low
    } else {
        PressureLevel::Moderate
    }
}

/// Samples system resources and recommends concurrency per workload class
pub struct AdaptiveOptimizer {
    system: Mutex<System>,
    config: OptimizerConfig,
    /// Base concurrency the recommendations scale around
    target: usize,
    /// Shared concurrency, nudged once per adjustment interval
    current: AtomicUsize,
    last_adjustment: Mutex<Instant>,
    last_snapshot: RwLock<ResourceSnapshot>,
}

impl AdaptiveOptimizer {
    /// Create an optimizer around a base target concurrency.
    pub fn new(target: usize, config: OptimizerConfig) -> Self {
        let target = target.clamp(config.min_concurrency, config.max_concurrency);
        Self {
            system: Mutex::new(System::new()),
            target,
            current: AtomicUsize::new(target),
            last_adjustment: Mutex::new(Instant::now()),
            last_snapshot: RwLock::new(ResourceSnapshot::default()),
            config,
        }
    }

    /// Take a fresh resource sample.
    pub fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_processes();

        let cpu_percent = system.global_cpu_info().cpu_usage();
        let total = system.total_memory();
        let memory_percent = if total > 0 {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        let process = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid));
        let process_memory = process.map(|p| p.memory()).unwrap_or(0);
        let committed_memory = process.map(|p| p.virtual_memory()).unwrap_or(0);
        #[cfg(target_os = "linux")]
        let thread_count = process
            .and_then(|p| p.tasks())
            .map(|t| t.len())
            .unwrap_or(0);
        #[cfg(not(target_os = "linux"))]
        let thread_count = 0;

        let snapshot = ResourceSnapshot {
            cpu_percent,
            memory_percent,
            process_memory,
            committed_memory,
            thread_count,
            pressure: pressure_of(cpu_percent, memory_percent),
        };
        *self.last_snapshot.write() = snapshot.clone();
        snapshot
    }

    /// Most recent sample without refreshing.
    pub fn last_snapshot(&self) -> ResourceSnapshot {
        self.last_snapshot.read().clone()
    }

    /// Recommended concurrency for an operation class at a pressure level.
    ///
    /// I/O-bound work tolerates up to twice the target; memory- and
    /// texture-heavy work gets half. High pressure steps the result down
    /// one; Critical clamps to the configured minimum.
    pub fn recommend(&self, class: OperationClass, pressure: PressureLevel) -> usize {
        let target = self.target;
        let base = match class {
            OperationClass::Io => target * 2,
            OperationClass::Cpu => target,
            OperationClass::Memory => (target / 2).max(1),
            OperationClass::Texture => (target / 2).max(1),
            OperationClass::Other => target,
        };
        let adjusted = match pressure {
            PressureLevel::Low | PressureLevel::Moderate => base,
            PressureLevel::High => base.saturating_sub(1),
            PressureLevel::Critical => self.config.min_concurrency,
        };
        adjusted.clamp(self.config.min_concurrency, self.config.max_concurrency)
    }

    /// Recommended worker count for the scheduler, weighing queue depth
    /// against current pressure.
    pub fn recommend_workers(&self, queue_depth: usize, min: usize, max: usize) -> usize {
        let snapshot = self.sample();
        let base = match snapshot.pressure {
            PressureLevel::Critical => min,
            PressureLevel::High => self.target.saturating_sub(1).max(min),
            PressureLevel::Moderate => self.target,
            PressureLevel::Low => {
                // A backlog earns extra workers, one per ten queued tasks.
                self.target + (queue_depth / 10)
            }
        };
        base.clamp(min, max)
    }

    /// Shared concurrency value.
    pub fn current_concurrency(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Nudge the shared concurrency toward the observed pressure, at most
    /// once per adjustment interval. Returns the (possibly unchanged)
    /// value.
    pub fn adjust_concurrency(&self) -> usize {
        let interval = Duration::from_secs(self.config.adjustment_interval_secs);
        {
            let mut last = self.last_adjustment.lock();
            if last.elapsed() < interval {
                return self.current.load(Ordering::Acquire);
            }
            *last = Instant::now();
        }

        let pressure = self.sample().pressure;
        let current = self.current.load(Ordering::Acquire);
        let next = match pressure {
            PressureLevel::Low => current + 1,
            PressureLevel::Moderate => current,
            PressureLevel::High => current.saturating_sub(1),
            PressureLevel::Critical => self.config.min_concurrency,
        }
        .clamp(self.config.min_concurrency, self.config.max_concurrency);

        if next != current {
            log::debug!(
                "adaptive concurrency {} -> {} (pressure {:?})",
                current,
                next,
                pressure
            );
        }
        self.current.store(next, Ordering::Release);
        next
    }

    /// Cooperative backoff: sleep briefly when the system is under
    /// pressure so the caller yields resources before heavy work.
    pub async fn wait_for_resources(&self) {
        match self.last_snapshot().pressure {
            PressureLevel::High => tokio::time::sleep(Duration::from_millis(100)).await,
            PressureLevel::Critical => tokio::time::sleep(Duration::from_millis(500)).await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> AdaptiveOptimizer {
        AdaptiveOptimizer::new(4, OptimizerConfig::default())
    }

    #[test]
    fn test_pressure_bands() {
        assert_eq!(pressure_of(30.0, 40.0), PressureLevel::Low);
        assert_eq!(pressure_of(60.0, 40.0), PressureLevel::Moderate);
        assert_eq!(pressure_of(30.0, 70.0), PressureLevel::Moderate);
        assert_eq!(pressure_of(80.0, 40.0), PressureLevel::High);
        assert_eq!(pressure_of(30.0, 85.0), PressureLevel::High);
        assert_eq!(pressure_of(95.0, 40.0), PressureLevel::Critical);
        assert_eq!(pressure_of(30.0, 95.0), PressureLevel::Critical);
    }

    #[test]
    fn test_recommendations_per_class() {
        let opt = optimizer();
        assert_eq!(opt.recommend(OperationClass::Io, PressureLevel::Low), 8);
        assert_eq!(opt.recommend(OperationClass::Cpu, PressureLevel::Low), 4);
        assert_eq!(opt.recommend(OperationClass::Memory, PressureLevel::Low), 2);
        assert_eq!(opt.recommend(OperationClass::Texture, PressureLevel::Low), 2);
        assert_eq!(opt.recommend(OperationClass::Other, PressureLevel::Low), 4);
    }

    #[test]
    fn test_pressure_steps_down() {
        let opt = optimizer();
        assert_eq!(opt.recommend(OperationClass::Cpu, PressureLevel::High), 3);
        assert_eq!(
            opt.recommend(OperationClass::Io, PressureLevel::Critical),
            OptimizerConfig::default().min_concurrency
        );
        // Texture never drops below one worker.
        assert!(opt.recommend(OperationClass::Texture, PressureLevel::High) >= 1);
    }

    #[test]
    fn test_adjustment_respects_interval() {
        let opt = AdaptiveOptimizer::new(
            4,
            OptimizerConfig {
                adjustment_interval_secs: 3600,
                ..Default::default()
            },
        );
        let before = opt.current_concurrency();
        // The interval has not elapsed since construction.
        assert_eq!(opt.adjust_concurrency(), before);
    }

    #[test]
    fn test_recommend_workers_clamps() {
        let opt = optimizer();
        let workers = opt.recommend_workers(0, 1, 16);
        assert!((1..=16).contains(&workers));
        let many = opt.recommend_workers(1000, 1, 16);
        assert!(many <= 16);
    }

    #[test]
    fn test_sample_populates_snapshot() {
        let opt = optimizer();
        let snap = opt.sample();
        assert!(snap.cpu_percent >= 0.0);
        assert!(snap.memory_percent >= 0.0);
        assert_eq!(
            opt.last_snapshot().process_memory,
            snap.process_memory
        );
    }
}
