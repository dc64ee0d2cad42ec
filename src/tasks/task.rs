//! Work task abstraction
//!
//! This module provides:
//! - The `WorkTask` capability trait the scheduler is generic over
//! - `TaskHandle`: identity, state machine, progress and result slots
//! - Built-in task variants: image compression, JSON minification,
//!   archive recompression, and closure-backed custom tasks
//!
//! Lifecycle: Created -> Pending (enqueue) -> Running (dispatch) ->
//! Completed | Failed | Cancelled. Terminal states absorb late progress
//! updates; there is no state after terminal.

use crate::archive::{ArchiveCache, Fingerprint};
use crate::error::{CoreError, CoreResult};
use crate::fileaccess::FileAccessController;
use crate::store::ImageCache;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Created,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Result payload of a completed task
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    /// Human-readable outcome summary
    pub message: Option<String>,
    /// Bytes processed, for throughput metrics
    pub bytes_processed: u64,
    /// Items processed, for throughput metrics
    pub items_processed: u64,
    /// Typed result for callers that want structured output
    pub value: Option<serde_json::Value>,
}

impl TaskOutput {
    /// Output carrying only throughput numbers.
    pub fn counted(bytes_processed: u64, items_processed: u64) -> Self {
        Self {
            bytes_processed,
            items_processed,
            ..Default::default()
        }
    }
}

/// Error captured into a failed task's state
#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    /// Chained cause, outermost first
    pub cause: Option<String>,
}

impl TaskError {
    pub fn from_core(error: &CoreError) -> Self {
        let cause = std::error::Error::source(error).map(|c| c.to_string());
        Self {
            kind: error.kind_name().to_string(),
            message: error.to_string(),
            cause,
        }
    }
}

/// Execution context handed to a running task
pub struct TaskContext {
    cancel: CancellationToken,
    handle: Arc<TaskHandle>,
}

impl TaskContext {
    /// Cooperative cancellation signal for this task.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress; ignored once the task is terminal.
    pub fn update_progress(&self, done: u64, total: u64) {
        self.handle.update_progress(done, total);
    }
}

/// A unit of schedulable work
#[async_trait]
pub trait WorkTask: Send + Sync {
    /// Run the task to completion or cancellation.
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<TaskOutput>;

    /// Kind tag used for metrics, retry policy and circuit breaking.
    fn kind(&self) -> &str;

    /// Human-readable task name.
    fn name(&self) -> String;
}

struct Timestamps {
    enqueued_at: Option<Instant>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// Identity and observable state of one submitted task
pub struct TaskHandle {
    id: Uuid,
    name: String,
    kind: String,
    priority: i32,
    state: Mutex<TaskState>,
    progress_done: AtomicU64,
    progress_total: AtomicU64,
    attempts: AtomicU32,
    timestamps: Mutex<Timestamps>,
    result: Mutex<Option<TaskOutput>>,
    error: Mutex<Option<TaskError>>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Create a handle for a task; `cancel` is usually a child of the
    /// scheduler's shutdown token.
    pub fn new(name: String, kind: String, priority: i32, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            kind,
            priority,
            state: Mutex::new(TaskState::Created),
            progress_done: AtomicU64::new(0),
            progress_total: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
            timestamps: Mutex::new(Timestamps {
                enqueued_at: None,
                started_at: None,
                finished_at: None,
            }),
            result: Mutex::new(None),
            error: Mutex::new(None),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// (done, total) progress units.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.progress_done.load(Ordering::Acquire),
            self.progress_total.load(Ordering::Acquire),
        )
    }

    /// Failures recorded so far (for retry accounting).
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Request cooperative cancellation.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Captured output, if completed.
    pub fn result(&self) -> Option<TaskOutput> {
        self.result.lock().clone()
    }

    /// Captured error, if failed.
    pub fn error(&self) -> Option<TaskError> {
        self.error.lock().clone()
    }

    /// Wall-clock runtime, once started.
    pub fn duration(&self) -> Option<Duration> {
        let ts = self.timestamps.lock();
        match (ts.started_at, ts.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            (Some(start), None) => Some(start.elapsed()),
            _ => None,
        }
    }

    /// Progress updates after a terminal transition are dropped.
    pub fn update_progress(&self, done: u64, total: u64) {
        if self.state.lock().is_terminal() {
            return;
        }
        self.progress_done.store(done, Ordering::Release);
        self.progress_total.store(total, Ordering::Release);
    }

    pub(crate) fn mark_pending(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = TaskState::Pending;
            self.timestamps.lock().enqueued_at.get_or_insert_with(Instant::now);
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = TaskState::Running;
            self.timestamps.lock().started_at = Some(Instant::now());
        }
    }

    pub(crate) fn mark_completed(&self, output: TaskOutput) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        *state = TaskState::Completed;
        self.timestamps.lock().finished_at = Some(Instant::now());
        *self.result.lock() = Some(output);
    }

    pub(crate) fn mark_failed(&self, error: &CoreError) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        *state = TaskState::Failed;
        self.timestamps.lock().finished_at = Some(Instant::now());
        *self.error.lock() = Some(TaskError::from_core(error));
    }

    pub(crate) fn mark_cancelled(&self) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        *state = TaskState::Cancelled;
        self.timestamps.lock().finished_at = Some(Instant::now());
    }

    /// Build the context a worker hands to `WorkTask::execute`.
    pub(crate) fn context(self: &Arc<Self>) -> TaskContext {
        TaskContext {
            cancel: self.cancel.clone(),
            handle: Arc::clone(self),
        }
    }
}

/// Compress and persist a package thumbnail into the image cache.
pub struct ImageCompressionTask {
    pub images: Arc<ImageCache>,
    pub archive_path: String,
    pub internal_path: String,
    pub fingerprint: Fingerprint,
    pub image: image::DynamicImage,
}

#[async_trait]
impl WorkTask for ImageCompressionTask {
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<TaskOutput> {
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let accepted = self.images.stage(
            &self.archive_path,
            &self.internal_path,
            self.fingerprint,
            &self.image,
        );
        if !accepted {
            return Err(CoreError::Permanent(format!(
                "image {} is below the cacheable size",
                self.internal_path
            )));
        }
        self.images.schedule_save();
        ctx.update_progress(1, 1);
        let bytes = (self.image.width() as u64) * (self.image.height() as u64) * 3;
        Ok(TaskOutput::counted(bytes, 1))
    }

    fn kind(&self) -> &str {
        "image-compression"
    }

    fn name(&self) -> String {
        format!("compress image {}", self.internal_path)
    }
}

/// Minify the JSON entries of an archive in place.
///
/// Rewrites the container through a write scope: entries ending in
/// `.json` are parsed and re-emitted compact; all other entries are
/// copied verbatim. The rewrite goes to a temp file renamed over the
/// original.
pub struct JsonMinifyTask {
    pub controller: Arc<FileAccessController>,
    pub archive_path: PathBuf,
    pub write_timeout: Duration,
}

impl JsonMinifyTask {
    fn rewrite(path: &PathBuf, minify_json: bool) -> CoreResult<(u64, u64)> {
        let source = std::fs::File::open(path)?;
        let mut container = zip::ZipArchive::new(source)
            .map_err(|e| CoreError::Corrupt(format!("{}: {}", path.display(), e)))?;

        let tmp_path = path.with_extension("var.tmp");
        let tmp = std::fs::File::create(&tmp_path)?;
        let mut writer = zip::ZipWriter::new(tmp);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let result = (|| -> CoreResult<(u64, u64)> {
            let mut bytes = 0u64;
            let mut items = 0u64;
            for index in 0..container.len() {
                let mut entry = container
                    .by_index(index)
                    .map_err(|e| CoreError::Corrupt(e.to_string()))?;
                let name = entry.name().to_string();
                if entry.is_dir() {
                    writer
                        .add_directory(name, options)
                        .map_err(|e| CoreError::Corrupt(e.to_string()))?;
                    continue;
                }
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;

                if minify_json && name.to_lowercase().ends_with(".json") {
                    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&data) {
                        if let Ok(compact) = serde_json::to_vec(&value) {
                            items += 1;
                            data = compact;
                        }
                    }
                }

                bytes += data.len() as u64;
                writer
                    .start_file(name, options)
                    .map_err(|e| CoreError::Corrupt(e.to_string()))?;
                writer.write_all(&data)?;
            }
            writer
                .finish()
                .map_err(|e| CoreError::Corrupt(e.to_string()))?;
            Ok((bytes, items))
        })();

        drop(container);
        match result {
            Ok(counts) => {
                // Rename replaces the archive atomically; the original is
                // never left missing.
                std::fs::rename(&tmp_path, path)?;
                Ok(counts)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl WorkTask for JsonMinifyTask {
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<TaskOutput> {
        let _write = self
            .controller
            .acquire_write(&self.archive_path, self.write_timeout)
            .await?;
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let path = self.archive_path.clone();
        let (bytes, items) = tokio::task::spawn_blocking(move || Self::rewrite(&path, true))
            .await
            .map_err(|_| CoreError::Cancelled)??;
        ctx.update_progress(items, items);
        Ok(TaskOutput::counted(bytes, items))
    }

    fn kind(&self) -> &str {
        "json-minify"
    }

    fn name(&self) -> String {
        format!("minify JSON in {}", self.archive_path.display())
    }
}

/// Recompress an archive container entry-by-entry.
pub struct ArchiveRecompressTask {
    pub controller: Arc<FileAccessController>,
    pub archive_path: PathBuf,
    pub write_timeout: Duration,
}

#[async_trait]
impl WorkTask for ArchiveRecompressTask {
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<TaskOutput> {
        let _write = self
            .controller
            .acquire_write(&self.archive_path, self.write_timeout)
            .await?;
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let path = self.archive_path.clone();
        let (bytes, _) = tokio::task::spawn_blocking(move || JsonMinifyTask::rewrite(&path, false))
            .await
            .map_err(|_| CoreError::Cancelled)??;
        ctx.update_progress(1, 1);
        Ok(TaskOutput::counted(bytes, 1))
    }

    fn kind(&self) -> &str {
        "archive-recompress"
    }

    fn name(&self) -> String {
        format!("recompress {}", self.archive_path.display())
    }
}

/// Read package metadata entries out of an archive.
pub struct MetadataReadTask {
    pub archives: Arc<ArchiveCache>,
    pub archive_path: PathBuf,
    pub entry_paths: Vec<String>,
}

#[async_trait]
impl WorkTask for MetadataReadTask {
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<TaskOutput> {
        let archive = self
            .archives
            .get_or_create(&self.archive_path)
            .await
            .ok_or_else(|| {
                CoreError::NotFound(self.archive_path.display().to_string())
            })?;
        if ctx.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let found = self
            .archives
            .read_entries_batch(&archive, &self.entry_paths)
            .await;
        let bytes: u64 = found.values().map(|v| v.len() as u64).sum();
        ctx.update_progress(found.len() as u64, self.entry_paths.len() as u64);
        Ok(TaskOutput::counted(bytes, found.len() as u64))
    }

    fn kind(&self) -> &str {
        "metadata-read"
    }

    fn name(&self) -> String {
        format!("read metadata from {}", self.archive_path.display())
    }
}

type ClosureFuture = BoxFuture<'static, CoreResult<TaskOutput>>;

/// Arbitrary user-defined task backed by a closure.
pub struct ClosureTask {
    name: String,
    kind: String,
    func: Box<dyn Fn(CancellationToken) -> ClosureFuture + Send + Sync>,
}

impl ClosureTask {
    pub fn new<F>(name: impl Into<String>, kind: impl Into<String>, func: F) -> Self
    where
        F: Fn(CancellationToken) -> ClosureFuture + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: kind.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl WorkTask for ClosureTask {
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<TaskOutput> {
        (self.func)(ctx.cancel_token().clone()).await
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
