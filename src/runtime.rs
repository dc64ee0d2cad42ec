//! Top-level core runtime
//!
//! This module provides:
//! - `CoreRuntime`: owns every subsystem and wires their handles at
//!   construction, so nothing in the crate is a global
//! - Lifecycle: `start` spawns the background loops (sweepers, dashboard,
//!   scheduler workers, dead-letter cleanup); `stop` shuts them down and
//!   flushes the on-disk caches

use crate::archive::ArchiveCache;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::fileaccess::FileAccessController;
use crate::memory::{BufferPool, StringPool};
use crate::metrics::{Dashboard, MetricsAggregator};
use crate::optimizer::AdaptiveOptimizer;
use crate::store::{ImageCache, MetadataCache, SearchCache};
use crate::tasks::{CircuitBreaker, DeadLetterQueue, RetryPolicy, WorkQueue, WorkScheduler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Owns and wires the caching and scheduling core
pub struct CoreRuntime {
    config: CoreConfig,
    pub strings: Arc<StringPool>,
    pub buffers: Arc<BufferPool>,
    pub file_access: Arc<FileAccessController>,
    pub archives: Arc<ArchiveCache>,
    pub metadata: Arc<MetadataCache>,
    pub images: Arc<ImageCache>,
    pub search: Arc<SearchCache>,
    pub optimizer: Arc<AdaptiveOptimizer>,
    pub metrics: Arc<MetricsAggregator>,
    pub dashboard: Arc<Dashboard>,
    pub retry: Arc<RetryPolicy>,
    pub breaker: Arc<CircuitBreaker>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub scheduler: WorkScheduler,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl CoreRuntime {
    /// Build the full subsystem graph from configuration.
    pub fn new(config: CoreConfig) -> Self {
        let cache_dir = config.resolve_cache_dir();

        let strings = Arc::new(StringPool::new());
        let buffers = Arc::new(BufferPool::new());
        let file_access = Arc::new(FileAccessController::with_config(config.file_access.clone()));
        let archives = Arc::new(ArchiveCache::new(
            Arc::clone(&file_access),
            Arc::clone(&strings),
            config.archive_cache.clone(),
        ));
        let metadata = Arc::new(MetadataCache::new(&cache_dir, Arc::clone(&strings)));
        let images = Arc::new(ImageCache::new(
            &cache_dir,
            Arc::clone(&buffers),
            config.image_cache.clone(),
        ));
        let search = Arc::new(SearchCache::new(&cache_dir));

        let optimizer = Arc::new(AdaptiveOptimizer::new(
            config.scheduler.target_workers,
            config.optimizer.clone(),
        ));
        let metrics = Arc::new(MetricsAggregator::new());
        let dashboard = Arc::new(Dashboard::new(
            Arc::clone(&metrics),
            Arc::clone(&optimizer),
            config.metrics.clone(),
        ));
        let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter.clone()));

        let scheduler = WorkScheduler::new(
            Arc::new(WorkQueue::new(config.queue.capacity)),
            config.scheduler.clone(),
            config.metrics.clone(),
            Duration::from_millis(config.queue.enqueue_timeout_ms),
            Arc::clone(&metrics),
            Arc::clone(&optimizer),
            Arc::clone(&retry),
            Arc::clone(&breaker),
            Arc::clone(&dead_letters),
        );

        Self {
            config,
            strings,
            buffers,
            file_access,
            archives,
            metadata,
            images,
            search,
            optimizer,
            metrics,
            dashboard,
            retry,
            breaker,
            dead_letters,
            scheduler,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Load the on-disk caches and start every background loop. Idempotent
    /// through the scheduler's and dashboard's own guards.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        {
            let metadata = Arc::clone(&self.metadata);
            let loaded = tokio::task::spawn_blocking(move || metadata.load())
                .await
                .map_err(|_| crate::error::CoreError::Cancelled)??;
            log::info!("metadata cache loaded: {}", loaded);
        }
        self.images.load_index_async().await?;
        {
            let search = Arc::clone(&self.search);
            let _ = tokio::task::spawn_blocking(move || search.load()).await;
        }

        let mut background = self.background.lock();
        background.push(self.file_access.spawn_sweeper());
        background.push(self.archives.spawn_sweeper());
        background.push(self.dead_letters.spawn_cleanup());
        drop(background);

        self.dashboard.start().await;
        self.scheduler.start();
        Ok(())
    }

    /// Stop background work and flush the caches to disk.
    pub async fn stop(self: &Arc<Self>) -> CoreResult<()> {
        self.scheduler.stop().await;
        self.dashboard.stop().await;

        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        let metadata = Arc::clone(&self.metadata);
        tokio::task::spawn_blocking(move || metadata.save())
            .await
            .map_err(|_| crate::error::CoreError::Cancelled)??;
        let images = Arc::clone(&self.images);
        tokio::task::spawn_blocking(move || images.save_sync())
            .await
            .map_err(|_| crate::error::CoreError::Cancelled)??;
        let search = Arc::clone(&self.search);
        tokio::task::spawn_blocking(move || search.save())
            .await
            .map_err(|_| crate::error::CoreError::Cancelled)??;

        self.archives.release_memory();
        Ok(())
    }
}
