//! Bounded priority work queue
//!
//! This module provides:
//! - A multi-priority queue: higher priority dispatches first, FIFO within
//!   a priority level
//! - Admission control through a counting semaphore sized to capacity;
//!   enqueue with a timeout reports rejection instead of blocking forever
//! - Queue statistics including a running average depth

use crate::tasks::task::{TaskHandle, TaskState, WorkTask};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

/// A task paired with its observable handle
pub struct Submission {
    pub task: Arc<dyn WorkTask>,
    pub handle: Arc<TaskHandle>,
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_rejected: u64,
    /// Running average of queue depth sampled at enqueue time
    pub average_depth: f64,
    /// Queued tasks by state (normally all Pending)
    pub by_state: HashMap<String, usize>,
}

/// Bounded multi-priority FIFO queue
pub struct WorkQueue {
    /// Priority -> FIFO of submissions; iterated highest priority first
    lanes: Mutex<BTreeMap<i32, VecDeque<Submission>>>,
    slots: Arc<Semaphore>,
    notify: Notify,
    capacity: usize,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    total_rejected: AtomicU64,
    depth_sum: AtomicU64,
    depth_samples: AtomicU64,
}

impl WorkQueue {
    /// Create a queue admitting at most `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(BTreeMap::new()),
            slots: Arc::new(Semaphore::new(capacity)),
            notify: Notify::new(),
            capacity,
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            depth_sum: AtomicU64::new(0),
            depth_samples: AtomicU64::new(0),
        }
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.lanes.lock().values().map(|lane| lane.len()).sum()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a submission, waiting up to `timeout` for a free slot.
    ///
    /// Returns `false` when the queue stayed full for the whole timeout;
    /// the submission is dropped in that case and its handle untouched.
    pub async fn enqueue(&self, submission: Submission, timeout: Duration) -> bool {
        let permit = match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        // The slot stays consumed until dequeue or clear returns it.
        permit.forget();

        submission.handle.mark_pending();
        let depth = {
            let mut lanes = self.lanes.lock();
            lanes
                .entry(submission.handle.priority())
                .or_default()
                .push_back(submission);
            lanes.values().map(|lane| lane.len()).sum::<usize>()
        };

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.depth_sum.fetch_add(depth as u64, Ordering::Relaxed);
        self.depth_samples.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    fn pop_highest(&self) -> Option<Submission> {
        let mut lanes = self.lanes.lock();
        // Highest priority first; FIFO within the lane.
        let (&priority, lane) = lanes.iter_mut().next_back()?;
        let submission = lane.pop_front();
        if lane.is_empty() {
            lanes.remove(&priority);
        }
        submission
    }

    /// Dequeue the oldest task at the highest populated priority, waiting
    /// up to `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Submission> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so a notify between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(submission) = self.pop_highest() {
                self.slots.add_permits(1);
                self.total_dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(submission);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drain every queued submission, releasing their slots.
    pub fn clear(&self) -> Vec<Submission> {
        let drained: Vec<Submission> = {
            let mut lanes = self.lanes.lock();
            let mut out = Vec::new();
            for (_, lane) in std::mem::take(&mut *lanes) {
                out.extend(lane);
            }
            out
        };
        if !drained.is_empty() {
            self.slots.add_permits(drained.len());
        }
        drained
    }

    /// Current statistics.
    pub fn stats(&self) -> QueueStats {
        let by_state = {
            let lanes = self.lanes.lock();
            let mut counts: HashMap<String, usize> = HashMap::new();
            for lane in lanes.values() {
                for submission in lane {
                    let state = match submission.handle.state() {
                        TaskState::Created => "created",
                        TaskState::Pending => "pending",
                        TaskState::Running => "running",
                        TaskState::Completed => "completed",
                        TaskState::Failed => "failed",
                        TaskState::Cancelled => "cancelled",
                    };
                    *counts.entry(state.to_string()).or_default() += 1;
                }
            }
            counts
        };
        let samples = self.depth_samples.load(Ordering::Relaxed);
        QueueStats {
            size: self.len(),
            capacity: self.capacity,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.total_dequeued.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            average_depth: if samples > 0 {
                self.depth_sum.load(Ordering::Relaxed) as f64 / samples as f64
            } else {
                0.0
            },
            by_state,
        }
    }
}
