//! Dead-letter queue
//!
//! This module provides:
//! - A bounded store of terminally failed tasks with total failure
//!   categorization: every error maps to exactly one category
//! - Auto-retry scheduling for Transient failures with capped exponential
//!   backoff
//! - Capacity eviction (oldest resolved first), periodic cleanup of aged
//!   resolved entries, category/kind queries and a formatted report

use crate::config::DeadLetterConfig;
use crate::error::CoreError;
use crate::tasks::task::TaskHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Failure categories; categorization is total over `CoreError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureCategory {
    Timeout,
    Cancelled,
    ResourceExhaustion,
    Permanent,
    ExternalService,
    ConfigurationError,
    Transient,
}

/// Map an error (and the task name it came from) to its category.
///
/// Tasks named after external services categorize as `ExternalService`
/// even when the error itself is generic.
pub fn categorize(error: &CoreError, task_name: &str) -> FailureCategory {
    match error {
        CoreError::WriteTimeout { .. } => FailureCategory::Timeout,
        CoreError::Cancelled | CoreError::Disposed => FailureCategory::Cancelled,
        CoreError::ResourceExhaustion(_) | CoreError::Io(_) => {
            FailureCategory::ResourceExhaustion
        }
        CoreError::Permanent(_) => FailureCategory::Permanent,
        CoreError::ExternalService(_) => FailureCategory::ExternalService,
        CoreError::Configuration(_) => FailureCategory::ConfigurationError,
        CoreError::NotFound(_)
        | CoreError::Corrupt(_)
        | CoreError::LockedForWriting { .. }
        | CoreError::Transient(_) => {
            if task_name.contains("Service") {
                FailureCategory::ExternalService
            } else {
                FailureCategory::Transient
            }
        }
    }
}

/// One dead-lettered task
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub task_kind: String,
    pub failed_at: DateTime<Utc>,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    /// When the entry becomes eligible for auto-retry (Transient only)
    pub next_retry_at: Option<DateTime<Utc>>,
    pub category: FailureCategory,
    pub details: Option<String>,
    pub resolved: bool,
}

/// Dead-letter statistics
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub unresolved: usize,
    pub pending_retries: usize,
    pub by_category: HashMap<String, usize>,
}

/// Bounded store of terminally failed tasks
pub struct DeadLetterQueue {
    entries: Mutex<HashMap<Uuid, DeadLetterEntry>>,
    config: DeadLetterConfig,
}

impl DeadLetterQueue {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Backoff before the next auto-retry attempt, capped by config.
    fn retry_backoff(&self, retry_count: u32) -> Duration {
        let base_ms = 1_000u64.saturating_mul(1u64 << retry_count.min(20));
        Duration::from_millis(base_ms.min(self.config.max_retry_delay_ms))
    }

    /// Record a failed task; returns the entry id.
    ///
    /// An entry whose retries are exhausted, or whose category never
    /// auto-retries, is recorded as resolved: no further automatic action
    /// will be taken on it.
    pub fn record(
        &self,
        handle: &Arc<TaskHandle>,
        error: &CoreError,
        retry_count: u32,
        max_retries: u32,
        details: Option<String>,
    ) -> Uuid {
        let category = categorize(error, handle.name());
        let retryable = category == FailureCategory::Transient && retry_count < max_retries;
        let next_retry_at = retryable.then(|| {
            Utc::now()
                + chrono::Duration::from_std(self.retry_backoff(retry_count))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60))
        });

        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            task_id: handle.id(),
            task_name: handle.name().to_string(),
            task_kind: handle.kind().to_string(),
            failed_at: Utc::now(),
            error_kind: error.kind_name().to_string(),
            error_message: error.to_string(),
            retry_count,
            max_retries,
            next_retry_at,
            category,
            details,
            resolved: !retryable,
        };
        let id = entry.id;

        let mut entries = self.entries.lock();
        if entries.len() >= self.config.capacity {
            Self::evict_one(&mut entries);
        }
        entries.insert(id, entry);
        id
    }

    /// Evict the oldest resolved entry, or the oldest entry outright when
    /// nothing is resolved.
    fn evict_one(entries: &mut HashMap<Uuid, DeadLetterEntry>) {
        let victim = entries
            .values()
            .filter(|e| e.resolved)
            .min_by_key(|e| e.failed_at)
            .or_else(|| entries.values().min_by_key(|e| e.failed_at))
            .map(|e| e.id);
        if let Some(id) = victim {
            entries.remove(&id);
        }
    }

    /// Mark an entry resolved; returns whether it existed.
    pub fn resolve(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.resolved = true;
                entry.next_retry_at = None;
                true
            }
            None => false,
        }
    }

    /// Fetch one entry.
    pub fn get(&self, id: Uuid) -> Option<DeadLetterEntry> {
        self.entries.lock().get(&id).cloned()
    }

    /// Entries in a category.
    pub fn by_category(&self, category: FailureCategory) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Entries for a task kind.
    pub fn by_kind(&self, kind: &str) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.task_kind == kind)
            .cloned()
            .collect()
    }

    /// Unresolved entries whose retry time has come.
    pub fn pending_retries(&self) -> Vec<DeadLetterEntry> {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.resolved && e.next_retry_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Drop resolved entries older than the retention window.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.retention_secs as i64);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !(e.resolved && e.failed_at < cutoff));
        before - entries.len()
    }

    /// Spawn the periodic cleanup. The task runs until aborted.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dropped = queue.cleanup();
                if dropped > 0 {
                    log::debug!("dead-letter cleanup dropped {} resolved entries", dropped);
                }
            }
        })
    }

    /// Current statistics.
    pub fn stats(&self) -> DeadLetterStats {
        let entries = self.entries.lock();
        let now = Utc::now();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        for entry in entries.values() {
            *by_category
                .entry(format!("{:?}", entry.category))
                .or_default() += 1;
        }
        DeadLetterStats {
            total: entries.len(),
            unresolved: entries.values().filter(|e| !e.resolved).count(),
            pending_retries: entries
                .values()
                .filter(|e| {
                    !e.resolved && e.next_retry_at.map(|at| at <= now).unwrap_or(false)
                })
                .count(),
            by_category,
        }
    }

    /// Human-readable report of unresolved entries, newest first.
    pub fn report(&self) -> String {
        let mut unresolved: Vec<DeadLetterEntry> = self
            .entries
            .lock()
            .values()
            .filter(|e| !e.resolved)
            .cloned()
            .collect();
        unresolved.sort_by_key(|e| std::cmp::Reverse(e.failed_at));

        let mut out = String::new();
        let _ = writeln!(out, "Dead letter queue: {} unresolved", unresolved.len());
        for entry in unresolved {
            let _ = writeln!(
                out,
                "  [{:?}] {} ({}) - {}: {} (retries {}/{})",
                entry.category,
                entry.task_name,
                entry.task_kind,
                entry.error_kind,
                entry.error_message,
                entry.retry_count,
                entry.max_retries,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn handle(name: &str, kind: &str) -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(
            name.to_string(),
            kind.to_string(),
            0,
            CancellationToken::new(),
        ))
    }

    fn queue() -> DeadLetterQueue {
        DeadLetterQueue::new(DeadLetterConfig::default())
    }

    #[test]
    fn test_categorization_is_total() {
        let samples: Vec<(CoreError, FailureCategory)> = vec![
            (
                CoreError::WriteTimeout {
                    path: "/p".into(),
                    active_readers: 1,
                },
                FailureCategory::Timeout,
            ),
            (CoreError::Cancelled, FailureCategory::Cancelled),
            (CoreError::Disposed, FailureCategory::Cancelled),
            (
                CoreError::ResourceExhaustion("oom".into()),
                FailureCategory::ResourceExhaustion,
            ),
            (
                CoreError::Io(std::io::Error::other("disk")),
                FailureCategory::ResourceExhaustion,
            ),
            (
                CoreError::Permanent("bad arg".into()),
                FailureCategory::Permanent,
            ),
            (
                CoreError::ExternalService("hub down".into()),
                FailureCategory::ExternalService,
            ),
            (
                CoreError::Configuration("bad config".into()),
                FailureCategory::ConfigurationError,
            ),
            (CoreError::NotFound("gone".into()), FailureCategory::Transient),
            (CoreError::Corrupt("bad".into()), FailureCategory::Transient),
            (
                CoreError::LockedForWriting { path: "/p".into() },
                FailureCategory::Transient,
            ),
            (CoreError::Transient("flaky".into()), FailureCategory::Transient),
        ];
        for (error, expected) in samples {
            assert_eq!(categorize(&error, "plain task"), expected, "{error:?}");
        }
    }

    #[test]
    fn test_service_task_names_categorize_as_external() {
        let err = CoreError::Transient("flaky".into());
        assert_eq!(
            categorize(&err, "HubService refresh"),
            FailureCategory::ExternalService
        );
        assert_eq!(categorize(&err, "local work"), FailureCategory::Transient);
    }

    #[test]
    fn test_transient_schedules_auto_retry() {
        let dlq = queue();
        let id = dlq.record(
            &handle("t", "k"),
            &CoreError::Transient("flaky".into()),
            0,
            3,
            None,
        );
        let entry = dlq.get(id).unwrap();
        assert!(!entry.resolved);
        assert!(entry.next_retry_at.is_some());
    }

    #[test]
    fn test_permanent_never_schedules_retry() {
        let dlq = queue();
        let id = dlq.record(
            &handle("t", "k"),
            &CoreError::Permanent("bad".into()),
            0,
            3,
            None,
        );
        let entry = dlq.get(id).unwrap();
        assert!(entry.resolved);
        assert!(entry.next_retry_at.is_none());
    }

    #[test]
    fn test_exhausted_retries_resolve() {
        let dlq = queue();
        let id = dlq.record(
            &handle("t", "k"),
            &CoreError::Transient("flaky".into()),
            3,
            3,
            None,
        );
        let entry = dlq.get(id).unwrap();
        assert!(entry.resolved);
        assert_eq!(entry.retry_count, 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let dlq = DeadLetterQueue::new(DeadLetterConfig {
            max_retry_delay_ms: 5_000,
            ..Default::default()
        });
        assert_eq!(dlq.retry_backoff(0), Duration::from_millis(1_000));
        assert_eq!(dlq.retry_backoff(1), Duration::from_millis(2_000));
        assert_eq!(dlq.retry_backoff(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_capacity_evicts_resolved_first() {
        let dlq = DeadLetterQueue::new(DeadLetterConfig {
            capacity: 2,
            ..Default::default()
        });
        let resolved_id = dlq.record(
            &handle("resolved", "k"),
            &CoreError::Permanent("done".into()),
            0,
            3,
            None,
        );
        let live_id = dlq.record(
            &handle("live", "k"),
            &CoreError::Transient("flaky".into()),
            0,
            3,
            None,
        );
        // Third entry overflows; the resolved one goes.
        dlq.record(
            &handle("new", "k"),
            &CoreError::Transient("flaky".into()),
            0,
            3,
            None,
        );
        assert!(dlq.get(resolved_id).is_none());
        assert!(dlq.get(live_id).is_some());
        assert_eq!(dlq.stats().total, 2);
    }

    #[test]
    fn test_queries_and_report() {
        let dlq = queue();
        dlq.record(
            &handle("a", "image-compression"),
            &CoreError::Transient("x".into()),
            0,
            3,
            None,
        );
        dlq.record(
            &handle("b", "json-minify"),
            &CoreError::Permanent("y".into()),
            0,
            3,
            Some("extra context".into()),
        );

        assert_eq!(dlq.by_kind("json-minify").len(), 1);
        assert_eq!(dlq.by_category(FailureCategory::Transient).len(), 1);
        let report = dlq.report();
        assert!(report.contains("unresolved"));
        assert!(report.contains('a'));
    }

    #[test]
    fn test_cleanup_drops_aged_resolved() {
        let dlq = DeadLetterQueue::new(DeadLetterConfig {
            retention_secs: 0,
            ..Default::default()
        });
        let id = dlq.record(
            &handle("t", "k"),
            &CoreError::Permanent("done".into()),
            0,
            3,
            None,
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(dlq.cleanup(), 1);
        assert!(dlq.get(id).is_none());
    }
}
