//! Versioned on-disk stores
//!
//! This module provides:
//! - The binary metadata cache (`PackageMetadata.cache`)
//! - The encrypted image disk cache (`PackageImages.cache`)
//! - The search response cache (`HubSearch.cache`)
//! - The shared little-endian codec and payload crypto
//!
//! All three files share the same family of layouts (version header, entry
//! count, keyed entries) and the same atomicity rule: saves go to a temp
//! file that is renamed over the target, so an interrupted save leaves the
//! prior file intact.

pub mod codec;
pub mod crypto;
pub mod images;
pub mod metadata;
pub mod record;
pub mod search;

pub use crypto::{package_key, PayloadCipher};
pub use images::{ImageCache, ImageCacheStats, IndexLoad, IMAGE_CACHE_MAGIC, IMAGE_CACHE_VERSION};
pub use metadata::{MetadataCache, MetadataCacheStats, METADATA_CACHE_VERSION};
pub use record::{ContentCounters, PackageRecord};
pub use search::{SearchCache, SearchCacheStats};
