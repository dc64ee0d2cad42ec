//! Parallel work scheduler
//!
//! This module provides:
//! - A worker pool between configured min/max, scaled on a fixed cadence
//!   by the adaptive optimizer
//! - Priority dispatch through the bounded work queue
//! - Failure routing: retry policy first, circuit breaker accounting,
//!   dead-letter queue when the retry budget is spent
//! - Broadcast events for task lifecycle, metrics and bottlenecks
//!
//! Shutdown cancels in-flight tasks through their cancellation tokens,
//! drains the queue (drained tasks become Cancelled) and awaits workers.

use crate::config::{MetricsConfig, SchedulerConfig};
use crate::error::{CoreError, CoreResult};
use crate::metrics::{detect_bottlenecks, MetricsAggregator};
use crate::optimizer::AdaptiveOptimizer;
use crate::tasks::dead_letter::DeadLetterQueue;
use crate::tasks::queue::{QueueStats, Submission, WorkQueue};
use crate::tasks::retry::{CircuitBreaker, RetryPolicy};
use crate::tasks::task::{TaskHandle, WorkTask};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scheduler lifecycle and task events
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskStarted {
        id: Uuid,
        name: String,
        kind: String,
    },
    TaskCompleted {
        id: Uuid,
        kind: String,
        duration_ms: u64,
    },
    TaskFailed {
        id: Uuid,
        kind: String,
        error: String,
        will_retry: bool,
    },
    MetricsUpdated,
    BottleneckDetected {
        kind: Option<String>,
        reason: String,
    },
}

/// Scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub workers: usize,
    pub desired_workers: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_retried: u64,
    pub queue: QueueStats,
}

struct Shared {
    queue: Arc<WorkQueue>,
    config: SchedulerConfig,
    metrics_config: MetricsConfig,
    enqueue_timeout: Duration,
    metrics: Arc<MetricsAggregator>,
    optimizer: Arc<AdaptiveOptimizer>,
    retry: Arc<RetryPolicy>,
    breaker: Arc<CircuitBreaker>,
    dead_letters: Arc<DeadLetterQueue>,
    events: broadcast::Sender<SchedulerEvent>,
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
    workers: AtomicUsize,
    desired: AtomicUsize,
    worker_exited: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

/// Worker pool scheduler over the priority work queue
#[derive(Clone)]
pub struct WorkScheduler {
    shared: Arc<Shared>,
}

impl WorkScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<WorkQueue>,
        config: SchedulerConfig,
        metrics_config: MetricsConfig,
        enqueue_timeout: Duration,
        metrics: Arc<MetricsAggregator>,
        optimizer: Arc<AdaptiveOptimizer>,
        retry: Arc<RetryPolicy>,
        breaker: Arc<CircuitBreaker>,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                queue,
                config,
                metrics_config,
                enqueue_timeout,
                metrics,
                optimizer,
                retry,
                breaker,
                dead_letters,
                events,
                shutdown: Mutex::new(CancellationToken::new()),
                running: AtomicBool::new(false),
                workers: AtomicUsize::new(0),
                desired: AtomicUsize::new(0),
                worker_exited: Notify::new(),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                retried: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Start the worker pool. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.shutdown.lock() = CancellationToken::new();
        let target = self
            .shared
            .config
            .target_workers
            .clamp(self.shared.config.min_workers, self.shared.config.max_workers);
        self.shared.desired.store(target, Ordering::Release);
        for _ in 0..target {
            Self::spawn_worker(Arc::clone(&self.shared));
        }
        Self::spawn_scaling_loop(Arc::clone(&self.shared));
        log::info!("scheduler started with {} workers", target);
    }

    /// Whether the scheduler is accepting and dispatching work.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Submit a task at a priority (larger dispatches first).
    ///
    /// Fails with `ResourceExhaustion` when the queue stays full past the
    /// enqueue timeout.
    pub async fn submit(
        &self,
        task: Arc<dyn WorkTask>,
        priority: i32,
    ) -> CoreResult<Arc<TaskHandle>> {
        let cancel = self.shared.shutdown.lock().child_token();
        let handle = Arc::new(TaskHandle::new(
            task.name(),
            task.kind().to_string(),
            priority,
            cancel,
        ));
        let accepted = self
            .shared
            .queue
            .enqueue(
                Submission {
                    task,
                    handle: Arc::clone(&handle),
                },
                self.shared.enqueue_timeout,
            )
            .await;
        if !accepted {
            return Err(CoreError::ResourceExhaustion(
                "work queue is at capacity".to_string(),
            ));
        }
        Ok(handle)
    }

    /// Stop the scheduler: cancel in-flight tasks, drain the queue, await
    /// workers. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.lock().cancel();

        for submission in self.shared.queue.clear() {
            submission.handle.mark_cancelled();
            self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
        }

        while self.shared.workers.load(Ordering::Acquire) > 0 {
            let exited = self.shared.worker_exited.notified();
            tokio::pin!(exited);
            exited.as_mut().enable();
            if self.shared.workers.load(Ordering::Acquire) == 0 {
                break;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), exited).await;
        }
        log::info!("scheduler stopped");
    }

    /// Current statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running(),
            workers: self.shared.workers.load(Ordering::Acquire),
            desired_workers: self.shared.desired.load(Ordering::Acquire),
            tasks_completed: self.shared.completed.load(Ordering::Relaxed),
            tasks_failed: self.shared.failed.load(Ordering::Relaxed),
            tasks_cancelled: self.shared.cancelled.load(Ordering::Relaxed),
            tasks_retried: self.shared.retried.load(Ordering::Relaxed),
            queue: self.shared.queue.stats(),
        }
    }

    fn spawn_worker(shared: Arc<Shared>) {
        shared.workers.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let token = shared.shutdown.lock().clone();
            let idle_timeout = Duration::from_secs(shared.config.worker_idle_timeout_secs);
            loop {
                let dequeued = tokio::select! {
                    _ = token.cancelled() => break,
                    d = shared.queue.dequeue(idle_timeout) => d,
                };
                match dequeued {
                    Some(submission) => Self::run_one(&shared, submission).await,
                    None => {
                        // Idle: excess workers above the floor retire.
                        let floor = shared
                            .desired
                            .load(Ordering::Acquire)
                            .max(shared.config.min_workers);
                        if shared.workers.load(Ordering::Acquire) > floor {
                            break;
                        }
                    }
                }
            }
            shared.workers.fetch_sub(1, Ordering::AcqRel);
            shared.worker_exited.notify_waiters();
        });
    }

    fn spawn_scaling_loop(shared: Arc<Shared>) {
        tokio::spawn(async move {
            let token = shared.shutdown.lock().clone();
            let mut ticker =
                tokio::time::interval(Duration::from_secs(shared.config.scale_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let desired = shared.optimizer.recommend_workers(
                    shared.queue.len(),
                    shared.config.min_workers,
                    shared.config.max_workers,
                );
                shared.desired.store(desired, Ordering::Release);
                // Scale up eagerly; scale down happens via idle retirement.
                while shared.workers.load(Ordering::Acquire) < desired {
                    Self::spawn_worker(Arc::clone(&shared));
                }
                shared.optimizer.adjust_concurrency();

                ticks += 1;
                if ticks % 5 == 0 {
                    let _ = shared.events.send(SchedulerEvent::MetricsUpdated);
                    let snapshot = shared.metrics.snapshot(shared.optimizer.last_snapshot());
                    for bottleneck in detect_bottlenecks(&snapshot, &shared.metrics_config) {
                        let _ = shared.events.send(SchedulerEvent::BottleneckDetected {
                            kind: bottleneck.kind,
                            reason: bottleneck.reason,
                        });
                    }
                }
            }
        });
    }

    async fn run_one(shared: &Arc<Shared>, submission: Submission) {
        let handle = Arc::clone(&submission.handle);
        let kind = handle.kind().to_string();

        if handle.cancel_token().is_cancelled() {
            handle.mark_cancelled();
            shared.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !shared.breaker.allow(&kind) {
            Self::handle_failure(
                shared,
                submission,
                CoreError::Transient(format!("circuit breaker open for '{kind}'")),
            )
            .await;
            return;
        }

        handle.mark_running();
        let _ = shared.events.send(SchedulerEvent::TaskStarted {
            id: handle.id(),
            name: handle.name().to_string(),
            kind: kind.clone(),
        });

        shared.optimizer.wait_for_resources().await;

        let context = handle.context();
        let started = Instant::now();
        let result = tokio::select! {
            _ = handle.cancel_token().cancelled() => Err(CoreError::Cancelled),
            r = submission.task.execute(&context) => r,
        };
        let duration = started.elapsed();

        match result {
            Ok(output) => {
                shared.breaker.record_success(&kind);
                shared.metrics.record_success(
                    &kind,
                    duration,
                    output.bytes_processed,
                    output.items_processed,
                );
                handle.mark_completed(output);
                shared.completed.fetch_add(1, Ordering::Relaxed);
                let _ = shared.events.send(SchedulerEvent::TaskCompleted {
                    id: handle.id(),
                    kind,
                    duration_ms: duration.as_millis() as u64,
                });
            }
            Err(CoreError::Cancelled) => {
                handle.mark_cancelled();
                shared.metrics.record_cancelled(&kind);
                shared.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                shared.breaker.record_failure(&kind);
                shared.metrics.record_failure(&kind, duration);
                Self::handle_failure(shared, submission, error).await;
            }
        }
    }

    /// Route a failure: retry while budget remains, then dead-letter.
    async fn handle_failure(
        shared: &Arc<Shared>,
        submission: Submission,
        error: CoreError,
    ) {
        let handle = Arc::clone(&submission.handle);
        let kind = handle.kind().to_string();
        let failures = handle.record_attempt();
        let max_retries = shared.retry.max_retries(&kind);

        let retry_delay = if error.is_retryable() {
            shared.retry.next_delay(&kind, failures)
        } else {
            None
        };

        let _ = shared.events.send(SchedulerEvent::TaskFailed {
            id: handle.id(),
            kind: kind.clone(),
            error: error.to_string(),
            will_retry: retry_delay.is_some(),
        });

        match retry_delay {
            Some(delay) => {
                shared.retried.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "retrying '{}' in {:?} (failure {}/{})",
                    handle.name(),
                    delay,
                    failures,
                    max_retries
                );
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let token = shared.shutdown.lock().clone();
                    if token.is_cancelled() {
                        submission.handle.mark_cancelled();
                        shared.cancelled.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let handle = Arc::clone(&submission.handle);
                    if !shared
                        .queue
                        .enqueue(submission, shared.enqueue_timeout)
                        .await
                    {
                        // No room to requeue: the failure is final.
                        let queue_error = CoreError::ResourceExhaustion(
                            "work queue full during retry".to_string(),
                        );
                        handle.mark_failed(&queue_error);
                        shared.failed.fetch_add(1, Ordering::Relaxed);
                        let failures = handle.attempts();
                        shared.dead_letters.record(
                            &handle,
                            &queue_error,
                            failures.saturating_sub(1),
                            shared.retry.max_retries(handle.kind()),
                            None,
                        );
                    }
                });
            }
            None => {
                handle.mark_failed(&error);
                shared.failed.fetch_add(1, Ordering::Relaxed);
                shared.dead_letters.record(
                    &handle,
                    &error,
                    failures.saturating_sub(1),
                    max_retries,
                    None,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, DeadLetterConfig, RetryConfig};
    use crate::tasks::task::{ClosureTask, TaskOutput, TaskState};
    use std::sync::atomic::AtomicU32;

    fn scheduler_with(
        workers: usize,
        retry: RetryConfig,
        breaker: BreakerConfig,
    ) -> WorkScheduler {
        WorkScheduler::new(
            Arc::new(WorkQueue::new(100)),
            SchedulerConfig {
                min_workers: workers,
                max_workers: workers,
                target_workers: workers,
                worker_idle_timeout_secs: 30,
                scale_interval_secs: 3600,
            },
            MetricsConfig::default(),
            Duration::from_millis(200),
            Arc::new(MetricsAggregator::new()),
            Arc::new(AdaptiveOptimizer::new(
                workers,
                crate::config::OptimizerConfig::default(),
            )),
            Arc::new(RetryPolicy::new(retry)),
            Arc::new(CircuitBreaker::new(breaker)),
            Arc::new(DeadLetterQueue::new(DeadLetterConfig::default())),
        )
    }

    fn default_scheduler(workers: usize) -> WorkScheduler {
        scheduler_with(workers, RetryConfig::default(), BreakerConfig::default())
    }

    fn succeeding_task(name: &str) -> Arc<ClosureTask> {
        Arc::new(ClosureTask::new(name, "ok-kind", |_| {
            Box::pin(async { Ok(TaskOutput::counted(100, 1)) })
        }))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let scheduler = default_scheduler(2);
        scheduler.start();
        let handle = scheduler.submit(succeeding_task("one"), 0).await.unwrap();
        wait_for(|| handle.state() == TaskState::Completed).await;
        assert_eq!(scheduler.stats().tasks_completed, 1);
        assert_eq!(handle.result().unwrap().bytes_processed, 100);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let scheduler = default_scheduler(2);
        scheduler.start();
        scheduler.start();
        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stats().workers, 0);
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let scheduler = default_scheduler(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        // A slow blocker occupies the single worker while the rest queue up.
        let blocker = Arc::new(ClosureTask::new("blocker", "ok-kind", |_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(TaskOutput::default())
            })
        }));
        scheduler.start();
        scheduler.submit(blocker, 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut handles = Vec::new();
        for (name, priority) in [("zero", 0), ("ten-a", 10), ("ten-b", 10), ("neg", -5)] {
            let order = Arc::clone(&order);
            let task = Arc::new(ClosureTask::new(name, "ok-kind", move |_| {
                let order = Arc::clone(&order);
                let name = name.to_string();
                Box::pin(async move {
                    order.lock().push(name);
                    Ok(TaskOutput::default())
                })
            }));
            handles.push(scheduler.submit(task, priority).await.unwrap());
        }

        wait_for(|| handles.iter().all(|h| h.state() == TaskState::Completed)).await;
        assert_eq!(*order.lock(), ["ten-a", "ten-b", "zero", "neg"]);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_failure_retries_then_dead_letters() {
        let scheduler = scheduler_with(
            1,
            RetryConfig {
                max_retries: 2,
                initial_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2.0,
                jitter: 0.0,
            },
            BreakerConfig {
                min_observations: 100, // keep the breaker out of this test
                ..Default::default()
            },
        );
        scheduler.start();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let task = Arc::new(ClosureTask::new("doomed", "flaky-kind", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(CoreError::Transient("always fails".into())) })
        }));

        let handle = scheduler.submit(task, 0).await.unwrap();
        wait_for(|| handle.state() == TaskState::Failed).await;

        // Initial attempt + 2 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handle.attempts(), 3);

        let entries = scheduler.shared.dead_letters.by_kind("flaky-kind");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 2);
        assert_eq!(entries[0].max_retries, 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_tasks() {
        let scheduler = default_scheduler(1);
        scheduler.start();

        let blocker = Arc::new(ClosureTask::new("blocker", "ok-kind", |cancel| {
            Box::pin(async move {
                cancel.cancelled().await;
                Err(CoreError::Cancelled)
            })
        }));
        let waiting = succeeding_task("waiting");
        let blocked = scheduler.submit(blocker, 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let queued = scheduler.submit(waiting, 0).await.unwrap();

        scheduler.stop().await;
        assert_eq!(blocked.state(), TaskState::Cancelled);
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert!(scheduler.stats().tasks_cancelled >= 2);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let scheduler = default_scheduler(1);
        let mut events = scheduler.subscribe();
        scheduler.start();
        let handle = scheduler.submit(succeeding_task("observed"), 0).await.unwrap();
        wait_for(|| handle.state() == TaskState::Completed).await;

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SchedulerEvent::TaskStarted { .. } => saw_started = true,
                SchedulerEvent::TaskCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_queue_overflow_rejects_submit() {
        let scheduler = WorkScheduler::new(
            Arc::new(WorkQueue::new(1)),
            SchedulerConfig {
                min_workers: 1,
                max_workers: 1,
                target_workers: 1,
                worker_idle_timeout_secs: 30,
                scale_interval_secs: 3600,
            },
            MetricsConfig::default(),
            Duration::from_millis(50),
            Arc::new(MetricsAggregator::new()),
            Arc::new(AdaptiveOptimizer::new(
                1,
                crate::config::OptimizerConfig::default(),
            )),
            Arc::new(RetryPolicy::new(RetryConfig::default())),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(DeadLetterQueue::new(DeadLetterConfig::default())),
        );
        // Not started: nothing drains the queue.
        scheduler.submit(succeeding_task("first"), 0).await.unwrap();
        let err = scheduler.submit(succeeding_task("second"), 0).await;
        assert!(matches!(err, Err(CoreError::ResourceExhaustion(_))));
    }
}
