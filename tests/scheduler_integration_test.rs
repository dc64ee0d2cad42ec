//! End-to-end tests for the scheduler, retry path and dead-letter queue

use packvault::config::{
    BreakerConfig, CoreConfig, DeadLetterConfig, MetricsConfig, OptimizerConfig, RetryConfig,
    SchedulerConfig,
};
use packvault::error::{CoreError, CoreResult};
use packvault::metrics::MetricsAggregator;
use packvault::optimizer::AdaptiveOptimizer;
use packvault::tasks::{
    CircuitBreaker, CircuitState, ClosureTask, DeadLetterQueue, FailureCategory, RetryPolicy,
    TaskOutput, TaskState, WorkQueue, WorkScheduler,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    scheduler: WorkScheduler,
    breaker: Arc<CircuitBreaker>,
    dead_letters: Arc<DeadLetterQueue>,
}

fn fixture(workers: usize, retry: RetryConfig, breaker_config: BreakerConfig) -> Fixture {
    let breaker = Arc::new(CircuitBreaker::new(breaker_config));
    let dead_letters = Arc::new(DeadLetterQueue::new(DeadLetterConfig::default()));
    let scheduler = WorkScheduler::new(
        Arc::new(WorkQueue::new(1_000)),
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
        Arc::new(AdaptiveOptimizer::new(workers, OptimizerConfig::default())),
        Arc::new(RetryPolicy::new(retry)),
        Arc::clone(&breaker),
        Arc::clone(&dead_letters),
    );
    Fixture {
        scheduler,
        breaker,
        dead_letters,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Scenario: tasks at priorities 0, 10, 10, -5 dispatch on a single worker
/// as (10 first), (10 second), (0), (-5).
#[tokio::test]
async fn priority_dispatch_order_on_single_worker() {
    let fx = fixture(1, RetryConfig::default(), BreakerConfig::default());
    fx.scheduler.start();

    // Occupy the lone worker so the submissions below stack in the queue.
    let gate = Arc::new(tokio_util::sync::CancellationToken::new());
    let gate_task = Arc::clone(&gate);
    let blocker = Arc::new(ClosureTask::new("blocker", "order-kind", move |_| {
        let gate = Arc::clone(&gate_task);
        Box::pin(async move {
            gate.cancelled().await;
            CoreResult::Ok(TaskOutput::default())
        })
    }));
    fx.scheduler.submit(blocker, i32::MAX).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (name, priority) in [
        ("priority-zero", 0),
        ("priority-ten-first", 10),
        ("priority-ten-second", 10),
        ("priority-minus-five", -5),
    ] {
        let order = Arc::clone(&order);
        let task = Arc::new(ClosureTask::new(name, "order-kind", move |_| {
            let order = Arc::clone(&order);
            let name = name.to_string();
            Box::pin(async move {
                order.lock().push(name);
                Ok(TaskOutput::default())
            })
        }));
        handles.push(fx.scheduler.submit(task, priority).await.unwrap());
    }

    gate.cancel();
    wait_for("all tasks to complete", || {
        handles.iter().all(|h| h.state() == TaskState::Completed)
    })
    .await;

    assert_eq!(
        *order.lock(),
        [
            "priority-ten-first",
            "priority-ten-second",
            "priority-zero",
            "priority-minus-five"
        ]
    );
    fx.scheduler.stop().await;
}

/// Scenario: a kind configured with three retries at 100 ms initial delay
/// and multiplier 2 fails four times; the attempts back off roughly as
/// 0/100/200/400 ms, the circuit opens, and the dead-letter entry carries
/// retry count 3 with no pending auto-retry.
#[tokio::test]
async fn transient_failures_retry_then_dead_letter_and_open_circuit() {
    let fx = fixture(
        1,
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.0,
        },
        BreakerConfig {
            failure_threshold: 0.5,
            window_secs: 60,
            min_observations: 4,
            open_timeout_secs: 30,
        },
    );
    fx.scheduler.start();

    let attempt_times = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let recorder = Arc::clone(&attempt_times);
    let task = Arc::new(ClosureTask::new("doomed sync", "doomed-kind", move |_| {
        recorder.lock().push(Instant::now());
        Box::pin(async { Err(CoreError::Transient("still broken".into())) })
    }));

    let handle = fx.scheduler.submit(task, 0).await.unwrap();
    wait_for("task to fail terminally", || {
        handle.state() == TaskState::Failed
    })
    .await;

    // Four attempts: the original plus three retries.
    let times = attempt_times.lock().clone();
    assert_eq!(times.len(), 4);
    let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    assert!(gaps[0] >= 90, "first retry came after {} ms", gaps[0]);
    assert!(gaps[1] >= 180, "second retry came after {} ms", gaps[1]);
    assert!(gaps[2] >= 360, "third retry came after {} ms", gaps[2]);

    // Four failures over a 0.5 threshold with min 4 observations: open.
    assert_eq!(fx.breaker.state("doomed-kind"), CircuitState::Open);

    let entries = fx.dead_letters.by_kind("doomed-kind");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.max_retries, 3);
    assert_eq!(entry.category, FailureCategory::Transient);
    assert!(entry.resolved);
    assert!(entry.next_retry_at.is_none());

    fx.scheduler.stop().await;
}

/// Invariant: dead-letter categorization is total and cancellation flows
/// into the Cancelled terminal state, not the dead-letter queue.
#[tokio::test]
async fn cancellation_bypasses_dead_letters() {
    let fx = fixture(1, RetryConfig::default(), BreakerConfig::default());
    fx.scheduler.start();

    let task = Arc::new(ClosureTask::new("patient", "patient-kind", |cancel| {
        Box::pin(async move {
            cancel.cancelled().await;
            Err(CoreError::Cancelled)
        })
    }));
    let handle = fx.scheduler.submit(task, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.request_cancel();

    wait_for("cancellation", || handle.state() == TaskState::Cancelled).await;
    assert!(fx.dead_letters.by_kind("patient-kind").is_empty());
    fx.scheduler.stop().await;
}

/// A permanently failing task skips the retry path entirely.
#[tokio::test]
async fn permanent_failures_skip_retries() {
    let fx = fixture(
        1,
        RetryConfig {
            max_retries: 5,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter: 0.0,
        },
        BreakerConfig::default(),
    );
    fx.scheduler.start();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let task = Arc::new(ClosureTask::new("broken input", "perm-kind", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(CoreError::Permanent("bad argument".into())) })
    }));

    let handle = fx.scheduler.submit(task, 0).await.unwrap();
    wait_for("terminal failure", || handle.state() == TaskState::Failed).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let entries = fx.dead_letters.by_kind("perm-kind");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].category, FailureCategory::Permanent);
    assert!(entries[0].resolved);
    fx.scheduler.stop().await;
}

/// The composition root wires a working pipeline end to end: submit
/// through the runtime, observe completion, shut down cleanly.
#[tokio::test]
async fn runtime_runs_tasks_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(packvault::CoreRuntime::new(CoreConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    }));
    runtime.start().await.unwrap();

    let task = Arc::new(ClosureTask::new("hello", "smoke-kind", |_| {
        Box::pin(async { Ok(TaskOutput::counted(42, 1)) })
    }));
    let handle = runtime.scheduler.submit(task, 5).await.unwrap();
    wait_for("runtime task completion", || {
        handle.state() == TaskState::Completed
    })
    .await;

    assert_eq!(runtime.metrics.kind("smoke-kind").unwrap().succeeded, 1);
    runtime.stop().await.unwrap();
    assert!(runtime.metadata.path().exists());
}
