use crate::config::CortexConfig;
use crate::error::{CortexError, Result};
use crate::storage::analysis::{compute_hash, find_merge_markers};
use crate::storage::atomic::{cleanup_orphans, write_atomic};
use crate::storage::locks::{LockManager, WriteLock};
use crate::storage::paths::{PathGuard, META_DIR};
use crate::storage::rate_limit::RateLimiter;
use crate::storage::retry::RetryPolicy;
use crate::storage::traits::ContentStore;
use crate::types::{ContentHash, FileId};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Filesystem-backed content store rooted at one directory.
#[derive(Debug)]
pub struct FsContentStore {
    guard: PathGuard,
    locks: LockManager,
    limiter: RateLimiter,
    retry: RetryPolicy,
    max_file_bytes: u64,
}

impl FsContentStore {
    /// Open (or create) a store. Runs crash recovery: stale lock markers and
    /// orphaned temp files from an earlier process are removed.
    pub fn open(root: impl AsRef<Path>, config: &CortexConfig) -> Result<Self> {
        let guard = PathGuard::new(root, &config.storage.allowed_extensions)?;
        fs::create_dir_all(guard.meta_dir())?;

        let locks = LockManager::new(
            guard.meta_dir().join("locks"),
            config.storage.lock_timeout(),
            config.storage.stale_lock_after(),
        )?;

        let stale = locks.cleanup_stale();
        let orphans = cleanup_orphans(guard.root());
        if stale + orphans > 0 {
            log::info!(
                "Recovered {}: removed {} stale lock(s), {} orphaned temp file(s)",
                guard.root().display(),
                stale,
                orphans
            );
        }

        Ok(Self {
            guard,
            locks,
            limiter: RateLimiter::new(&config.rate_limit),
            retry: RetryPolicy::from(&config.storage.retry),
            max_file_bytes: config.storage.max_file_bytes,
        })
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.guard.meta_dir()
    }

    fn check_size(&self, id: &FileId, size: u64) -> Result<()> {
        if size > self.max_file_bytes {
            return Err(CortexError::FileTooLarge {
                id: id.clone(),
                size,
                limit: self.max_file_bytes,
            });
        }
        Ok(())
    }

    /// Whole file regardless of size, `None` if absent.
    fn read_uncapped(&self, id: &FileId) -> Result<Option<Vec<u8>>> {
        let path = self.guard.resolve(id)?;
        match self.retry.run("read", || fs::read(&path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CortexError::Io(e)),
        }
    }

    fn map_not_found(id: &FileId, e: std::io::Error) -> CortexError {
        if e.kind() == ErrorKind::NotFound {
            CortexError::NotFound(id.clone())
        } else {
            CortexError::Io(e)
        }
    }

    fn file_id_for(&self, path: &Path) -> Option<FileId> {
        let relative = path.strip_prefix(self.guard.root()).ok()?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");
        FileId::new(&joined).ok()
    }
}

impl ContentStore for FsContentStore {
    fn root(&self) -> &Path {
        self.guard.root()
    }

    fn validate_path(&self, raw: &str) -> Result<FileId> {
        self.guard.validate(raw)
    }

    fn allowed_extensions(&self) -> &[String] {
        self.guard.allowed_extensions()
    }

    fn read_unthrottled(&self, id: &FileId) -> Result<(Vec<u8>, ContentHash)> {
        let path = self.guard.resolve(id)?;

        let meta = self
            .retry
            .run("stat", || fs::metadata(&path))
            .map_err(|e| Self::map_not_found(id, e))?;
        if !meta.is_file() {
            return Err(CortexError::rejected(id.as_str(), "not a regular file"));
        }
        self.check_size(id, meta.len())?;

        let bytes = self
            .retry
            .run("read", || fs::read(&path))
            .map_err(|e| Self::map_not_found(id, e))?;
        // The file may have grown between stat and read.
        self.check_size(id, bytes.len() as u64)?;

        let hash = compute_hash(&bytes);
        Ok((bytes, hash))
    }

    fn current_hash(&self, id: &FileId) -> Result<Option<ContentHash>> {
        Ok(self.read_uncapped(id)?.map(|bytes| compute_hash(&bytes)))
    }

    fn list_ids(&self) -> Result<Vec<FileId>> {
        let root = self.guard.root();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || e.file_name()
                        .to_str()
                        .map(|n| !n.starts_with('.') && n != META_DIR)
                        .unwrap_or(false)
            });

        let mut ids = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| CortexError::Io(e.into()))?;
            let file_type = entry.file_type();
            if !(file_type.is_file() || file_type.is_symlink()) {
                continue;
            }
            let Some(id) = self.file_id_for(entry.path()) else {
                log::warn!("Skipping non-UTF-8 path {}", entry.path().display());
                continue;
            };
            if !self.guard.is_allowed_extension(&id) {
                continue;
            }
            match self.guard.resolve(&id) {
                Ok(path) if path.is_file() => ids.push(id),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping {}: {}", id, e),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn throttle(&self) -> Result<()> {
        self.limiter.acquire()
    }

    fn lock(&self, id: &FileId) -> Result<WriteLock<'_>> {
        self.locks.acquire(id)
    }

    fn write_locked(
        &self,
        lock: &WriteLock<'_>,
        bytes: &[u8],
        expected: Option<&ContentHash>,
    ) -> Result<ContentHash> {
        let id = lock.id();
        let path = self.guard.resolve(id)?;
        self.check_size(id, bytes.len() as u64)?;

        if let Some(line) = find_merge_markers(&String::from_utf8_lossy(bytes)) {
            return Err(CortexError::MergeMarkersPresent {
                id: id.clone(),
                line,
            });
        }

        if let Some(expected) = expected {
            let actual = self.current_hash(id)?;
            if actual.as_ref() != Some(expected) {
                return Err(CortexError::Conflict {
                    id: id.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        self.retry.run("write", || write_atomic(&path, bytes))?;
        let hash = compute_hash(bytes);
        log::debug!("Wrote {} ({} bytes, {})", id, bytes.len(), hash.short());
        Ok(hash)
    }

    fn delete_locked(&self, lock: &WriteLock<'_>) -> Result<()> {
        let id = lock.id();
        let path = self.guard.resolve(id)?;
        self.retry
            .run("delete", || fs::remove_file(&path))
            .map_err(|e| Self::map_not_found(id, e))?;
        log::debug!("Deleted {}", id);
        Ok(())
    }

    fn read_locked(&self, lock: &WriteLock<'_>) -> Result<Option<Vec<u8>>> {
        self.read_uncapped(lock.id())
    }

    fn restore_locked(&self, lock: &WriteLock<'_>, previous: Option<&[u8]>) -> Result<()> {
        let id = lock.id();
        let path = self.guard.resolve(id)?;
        match previous {
            Some(bytes) => self.retry.run("restore", || write_atomic(&path, bytes))?,
            None => match self.retry.run("restore", || fs::remove_file(&path)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CortexError::Io(e)),
            },
        }
        log::warn!("Rolled back the on-disk content of {}", id);
        Ok(())
    }

    fn is_busy(&self, id: &FileId) -> bool {
        self.locks.is_locked(id)
    }
}
