use super::directive::IncludeOptions;
use crate::types::{ContentHash, FileId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What was rendered: which file, which section, how.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub id: FileId,
    /// Section name as requested, lowercased.
    pub section: Option<String>,
    pub options: IncludeOptions,
}

impl CacheKey {
    pub fn new(id: FileId, section: Option<&str>, options: IncludeOptions) -> Self {
        Self {
            id,
            section: section.map(|s| s.trim().to_lowercase()),
            options,
        }
    }
}

/// A successful sub-resolution and what it depended on.
#[derive(Debug, Clone)]
pub struct CachedRendering {
    pub text: String,
    /// Hash of every file read while rendering, the root included.
    pub dependencies: Vec<(FileId, ContentHash)>,
    /// Deepest include nesting below this rendering.
    pub height: usize,
}

impl CachedRendering {
    pub fn depends_on(&self, id: &FileId) -> bool {
        self.dependencies.iter().any(|(dep, _)| dep == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded LRU of rendered includes. Validity against current file hashes
/// is checked by the resolver on every hit.
pub struct ResolutionCache {
    entries: Mutex<LruCache<CacheKey, Arc<CachedRendering>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResolutionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedRendering>> {
        let found = self.entries.lock().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, key: CacheKey, rendering: CachedRendering) {
        self.entries.lock().put(key, Arc::new(rendering));
    }

    pub fn remove(&self, key: &CacheKey) {
        self.entries.lock().pop(key);
    }

    /// Drop every entry whose rendering read `id`.
    pub fn invalidate_file(&self, id: &FileId) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, rendering)| rendering.depends_on(id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
