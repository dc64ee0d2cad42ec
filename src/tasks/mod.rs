//! Parallel work execution
//!
//! This module provides:
//! - The work task abstraction and built-in task variants
//! - The bounded priority work queue
//! - The adaptive worker-pool scheduler
//! - Failure handling: retry policy, circuit breaker, dead-letter queue

pub mod dead_letter;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use dead_letter::{categorize, DeadLetterEntry, DeadLetterQueue, DeadLetterStats, FailureCategory};
pub use queue::{QueueStats, Submission, WorkQueue};
pub use retry::{CircuitBreaker, CircuitState, RetryPolicy};
pub use scheduler::{SchedulerEvent, SchedulerStats, WorkScheduler};
pub use task::{
    ArchiveRecompressTask, ClosureTask, ImageCompressionTask, JsonMinifyTask, MetadataReadTask,
    TaskContext, TaskError, TaskHandle, TaskOutput, TaskState, WorkTask,
};
