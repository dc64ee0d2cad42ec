//! # PACKVAULT - Content Pack Manager Core
//!
//! The headless concurrency and caching core of a desktop manager for
//! large archive-based content packs.
//!
//! ## Architecture
//!
//! - `memory`: string interning pool and pooled byte buffers
//! - `fileaccess`: per-file read/write arbitration with writer priority
//! - `archive`: virtual archive cache with on-demand entry loading
//! - `store`: versioned on-disk caches (metadata, images, search)
//! - `tasks`: priority queue, worker-pool scheduler, retry, circuit
//!   breaker, dead-letter queue
//! - `optimizer`: adaptive concurrency from system resource pressure
//! - `metrics`: per-kind aggregation, bottleneck detection, dashboard
//! - `runtime`: the owning composition root; no global state

#![warn(clippy::all)]

// Crate-wide error types
pub mod error;

// Configuration
pub mod config;

// Memory utilities - interning and buffer pooling
pub mod memory;

// Per-file lock arbitration
pub mod fileaccess;

// Virtual archive cache
pub mod archive;

// On-disk cache stores
pub mod store;

// Task scheduling and failure handling
pub mod tasks;

// Adaptive concurrency
pub mod optimizer;

// Metrics and dashboard
pub mod metrics;

// Composition root
pub mod runtime;

// Re-export commonly used types
pub use archive::{ArchiveCache, Fingerprint, VirtualArchive};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use fileaccess::{FileAccessController, ReadToken, WriteToken};
pub use runtime::CoreRuntime;
pub use store::{ImageCache, MetadataCache, PackageRecord, SearchCache};
pub use tasks::{TaskHandle, TaskState, WorkScheduler, WorkTask};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
