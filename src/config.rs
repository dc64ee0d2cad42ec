//! Core configuration
//!
//! This module provides:
//! - `CoreConfig` with every tunable of the caching and scheduling core
//! - Per-subsystem config sections with sensible defaults
//! - Application data directory resolution

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// File access controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccessConfig {
    /// Default write acquisition timeout (milliseconds)
    pub write_timeout_ms: u64,
    /// Idle time before a lock entry is eligible for sweeping (seconds)
    pub stale_after_secs: u64,
    /// Sweep cadence (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for FileAccessConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 10_000,
            stale_after_secs: 300, // 5 minutes
            sweep_interval_secs: 60,
        }
    }
}

/// Virtual archive cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveCacheConfig {
    /// Strong-cache cap per archive (bytes)
    pub per_archive_cap: u64,
    /// Strong-cache cap across all archives (bytes)
    pub global_cap: u64,
    /// Payloads larger than this always go to the weak tier (bytes)
    pub weak_threshold: u64,
    /// Idle time before an archive is evicted (seconds)
    pub idle_evict_secs: u64,
    /// Sweep cadence (seconds)
    pub sweep_interval_secs: u64,
    /// Demotion target as a fraction of the global cap
    pub demote_to_fraction: f64,
}

impl Default for ArchiveCacheConfig {
    fn default() -> Self {
        Self {
            per_archive_cap: 50 * 1024 * 1024,   // 50 MB
            global_cap: 500 * 1024 * 1024,       // 500 MB
            weak_threshold: 1024 * 1024,         // 1 MB
            idle_evict_secs: 300,                // 5 minutes
            sweep_interval_secs: 30,
            demote_to_fraction: 0.7,
        }
    }
}

/// Image disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCacheConfig {
    /// Maximum entries held in the decrypted-blob LRU
    pub lru_capacity: usize,
    /// Minimum accepted image dimension (pixels, either side)
    pub min_dimension: u32,
    /// JPEG encoding quality
    pub jpeg_quality: u8,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            lru_capacity: 50,
            min_dimension: 100,
            jpeg_quality: 90,
        }
    }
}

/// Work queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued tasks before enqueue is rejected
    pub capacity: usize,
    /// Enqueue admission timeout (milliseconds)
    pub enqueue_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            enqueue_timeout_ms: 1_000,
        }
    }
}

/// Scheduler worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minimum worker count
    pub min_workers: usize,
    /// Maximum worker count
    pub max_workers: usize,
    /// Initial / target worker count
    pub target_workers: usize,
    /// Idle dequeue timeout after which an excess worker exits (seconds)
    pub worker_idle_timeout_secs: u64,
    /// Adaptive scaling cadence (seconds)
    pub scale_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 16,
            target_workers: 4,
            worker_idle_timeout_secs: 30,
            scale_interval_secs: 1,
        }
    }
}

/// Retry policy defaults applied to task kinds without an explicit policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Multiplicative backoff factor
    pub multiplier: f64,
    /// Jitter factor in [0, 1], applied as +/- fraction of the delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure rate in [0, 1] that opens the circuit
    pub failure_threshold: f64,
    /// Sliding observation window (seconds)
    pub window_secs: u64,
    /// Minimum observations in the window before the rate is meaningful
    pub min_observations: usize,
    /// How long an open circuit stays open (seconds)
    pub open_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window_secs: 60,
            min_observations: 4,
            open_timeout_secs: 30,
        }
    }
}

/// Dead-letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Maximum entries retained
    pub capacity: usize,
    /// Cap on the auto-retry backoff (milliseconds)
    pub max_retry_delay_ms: u64,
    /// Resolved entries older than this are dropped (seconds)
    pub retention_secs: u64,
    /// Cleanup cadence (seconds)
    pub cleanup_interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_retry_delay_ms: 5 * 60 * 1000, // 5 minutes
            retention_secs: 24 * 3600,         // 24 hours
            cleanup_interval_secs: 300,
        }
    }
}

/// Adaptive optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Minimum concurrency the optimizer will ever recommend
    pub min_concurrency: usize,
    /// Maximum concurrency the optimizer will ever recommend
    pub max_concurrency: usize,
    /// How often the shared concurrency may be adjusted (seconds)
    pub adjustment_interval_secs: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 32,
            adjustment_interval_secs: 5,
        }
    }
}

/// Metrics and dashboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Dashboard refresh cadence (seconds)
    pub update_interval_secs: u64,
    /// Working-set threshold for bottleneck detection (bytes)
    pub working_set_threshold: u64,
    /// Average task duration above which a kind is flagged (milliseconds)
    pub slow_task_threshold_ms: u64,
    /// Throughput below which a kind is flagged (bytes per second)
    pub low_throughput_threshold: u64,
    /// Success rate below which a kind is flagged, in [0, 1]
    pub low_success_threshold: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 5,
            working_set_threshold: 2 * 1024 * 1024 * 1024, // 2 GB
            slow_task_threshold_ms: 5_000,
            low_throughput_threshold: 10 * 1024 * 1024, // 10 MB/s
            low_success_threshold: 0.95,
        }
    }
}

/// Top-level configuration for the core runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Override for the cache directory; `None` resolves the per-user
    /// application data directory.
    pub cache_dir: Option<PathBuf>,
    pub file_access: FileAccessConfig,
    pub archive_cache: ArchiveCacheConfig,
    pub image_cache: ImageCacheConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub dead_letter: DeadLetterConfig,
    pub optimizer: OptimizerConfig,
    pub metrics: MetricsConfig,
}

impl CoreConfig {
    /// Resolve the directory that holds the on-disk caches.
    ///
    /// Defaults to `<app-data>/packvault` under the per-user application
    /// data directory; falls back to the process working directory when the
    /// platform exposes no such directory.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("packvault"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Write acquisition timeout as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.file_access.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = CoreConfig::default();
        assert_eq!(config.archive_cache.per_archive_cap, 50 * 1024 * 1024);
        assert_eq!(config.archive_cache.global_cap, 500 * 1024 * 1024);
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.image_cache.lru_capacity, 50);
        assert_eq!(config.optimizer.adjustment_interval_secs, 5);
    }

    #[test]
    fn test_cache_dir_override() {
        let config = CoreConfig {
            cache_dir: Some(PathBuf::from("/tmp/pv-test")),
            ..Default::default()
        };
        assert_eq!(config.resolve_cache_dir(), PathBuf::from("/tmp/pv-test"));
    }
}
