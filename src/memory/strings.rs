//! String interning pool
//!
//! This module provides:
//! - Exact and case-insensitive interning maps returning shared `Arc<str>`
//! - A path facade that normalizes backslashes before interning
//! - A preloaded vocabulary of status, category, license, extension and
//!   path-prefix strings that survives `clear`
//!
//! Package metadata repeats the same short strings (creator names, license
//! kinds, category tags, internal path prefixes) across thousands of
//! records; interning collapses them to one allocation each.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

/// Strings seeded into the pool at construction and retained by `clear`.
const PRELOADED: &[&str] = &[
    // status kinds
    "Unknown", "Active", "Disabled", "Archived", "Missing", "Corrupted",
    // license kinds
    "CC BY", "CC BY-SA", "CC BY-ND", "CC BY-NC", "CC BY-NC-SA", "CC BY-NC-ND",
    "PC", "PC EA", "Questionable", "FC",
    // category tags
    "morphs", "hair", "clothing", "scene", "looks", "poses", "assets",
    "scripts", "plugins", "subscenes", "skins",
    // extensions
    ".var", ".json", ".jpg", ".png", ".vmi", ".vam", ".vap", ".vaj", ".cs",
    // common internal path prefixes
    "Saves/", "Custom/", "Custom/Atom/", "Custom/Clothing/", "Custom/Hair/",
    "Custom/Scripts/", "Saves/scene/", "Saves/Person/",
];

/// Statistics for the interning pool
#[derive(Debug, Clone, Serialize)]
pub struct StringPoolStats {
    /// Entries in the exact-case map
    pub exact_count: usize,
    /// Entries in the case-insensitive map
    pub ci_count: usize,
    /// Estimated bytes retained by interned strings
    pub estimated_bytes: usize,
}

/// Concurrent string interning pool
pub struct StringPool {
    /// Exact-case map: string -> shared reference
    exact: DashMap<Box<str>, Arc<str>>,
    /// Case-insensitive map: lowercased string -> shared reference
    ci: DashMap<Box<str>, Arc<str>>,
    /// Shared empty string, so empty in yields the same empty out
    empty: Arc<str>,
}

impl StringPool {
    /// Create a pool seeded with the preloaded vocabulary.
    pub fn new() -> Self {
        let pool = Self {
            exact: DashMap::new(),
            ci: DashMap::new(),
            empty: Arc::from(""),
        };
        pool.preload();
        pool
    }

    fn preload(&self) {
        for s in PRELOADED {
            self.intern(s);
            self.intern_ci(s);
        }
    }

    /// Intern a string, returning a shared reference.
    pub fn intern(&self, s: &str) -> Arc<str> {
        if s.is_empty() {
            return Arc::clone(&self.empty);
        }
        if let Some(existing) = self.exact.get(s) {
            return Arc::clone(existing.value());
        }
        let shared: Arc<str> = Arc::from(s);
        self.exact
            .entry(Box::from(s))
            .or_insert_with(|| Arc::clone(&shared));
        shared
    }

    /// Intern a string case-insensitively.
    ///
    /// The first casing seen for a given lowercase form wins; later callers
    /// receive that original casing.
    pub fn intern_ci(&self, s: &str) -> Arc<str> {
        if s.is_empty() {
            return Arc::clone(&self.empty);
        }
        let key = s.to_lowercase();
        if let Some(existing) = self.ci.get(key.as_str()) {
            return Arc::clone(existing.value());
        }
        let shared: Arc<str> = Arc::from(s);
        self.ci
            .entry(key.into_boxed_str())
            .or_insert_with(|| Arc::clone(&shared));
        shared
    }

    /// Intern a filesystem-ish path, normalizing backslashes to slashes.
    pub fn intern_path(&self, s: &str) -> Arc<str> {
        if s.contains('\\') {
            let normalized = s.replace('\\', "/");
            self.intern(&normalized)
        } else {
            self.intern(s)
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> StringPoolStats {
        let estimate = |map: &DashMap<Box<str>, Arc<str>>| {
            map.iter().map(|e| e.key().len() * 2).sum::<usize>()
        };
        StringPoolStats {
            exact_count: self.exact.len(),
            ci_count: self.ci.len(),
            estimated_bytes: estimate(&self.exact) + estimate(&self.ci),
        }
    }

    /// Drop all entries except the preloaded vocabulary.
    pub fn clear(&self) {
        self.exact.clear();
        self.ci.clear();
        self.preload();
    }

    /// Drop entries longer than `max_len` bytes.
    pub fn trim(&self, max_len: usize) {
        self.exact.retain(|k, _| k.len() <= max_len);
        self.ci.retain(|k, _| k.len() <= max_len);
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}
