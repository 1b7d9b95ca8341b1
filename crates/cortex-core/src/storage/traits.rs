use crate::error::Result;
use crate::storage::locks::WriteLock;
use crate::types::{ContentHash, FileId};
use std::path::Path;

/// Byte-level storage of knowledge files.
pub trait ContentStore: Send + Sync {
    // === Paths ===

    /// Storage root (canonical).
    fn root(&self) -> &Path;

    /// Parse and validate a caller-supplied identifier. Rejections happen
    /// here, before any I/O on the target.
    fn validate_path(&self, raw: &str) -> Result<FileId>;

    /// Extensions that count as knowledge files.
    fn allowed_extensions(&self) -> &[String];

    // === Reads ===

    /// Read a file and its hash. Takes a rate-limit token.
    fn read(&self, id: &FileId) -> Result<(Vec<u8>, ContentHash)> {
        self.throttle()?;
        self.read_unthrottled(id)
    }

    /// Read without consuming a rate-limit token (internal re-reads).
    fn read_unthrottled(&self, id: &FileId) -> Result<(Vec<u8>, ContentHash)>;

    /// Hash of the current on-disk bytes, `None` if the file is absent.
    /// Not subject to the size limit, so an oversized file can still be
    /// compared and replaced.
    fn current_hash(&self, id: &FileId) -> Result<Option<ContentHash>>;

    /// Every knowledge file under the root, sorted.
    fn list_ids(&self) -> Result<Vec<FileId>>;

    // === Writes ===

    /// Take one rate-limit token.
    fn throttle(&self) -> Result<()>;

    /// Exclusive write lock for one identifier, bounded by the lock timeout.
    fn lock(&self, id: &FileId) -> Result<WriteLock<'_>>;

    /// Write under an already-held lock. Fails `Conflict` when
    /// `expected` is given and differs from the on-disk hash.
    fn write_locked(
        &self,
        lock: &WriteLock<'_>,
        bytes: &[u8],
        expected: Option<&ContentHash>,
    ) -> Result<ContentHash>;

    /// Throttle, lock, write, unlock.
    fn write(&self, id: &FileId, bytes: &[u8], expected: Option<&ContentHash>) -> Result<ContentHash> {
        self.throttle()?;
        let lock = self.lock(id)?;
        self.write_locked(&lock, bytes, expected)
    }

    /// Delete under an already-held lock.
    fn delete_locked(&self, lock: &WriteLock<'_>) -> Result<()>;

    /// Current bytes under an already-held lock, without the size limit.
    /// `None` if the file is absent.
    fn read_locked(&self, lock: &WriteLock<'_>) -> Result<Option<Vec<u8>>>;

    /// Undo a write: put back what `read_locked` returned before it.
    /// `None` removes the file.
    fn restore_locked(&self, lock: &WriteLock<'_>, previous: Option<&[u8]>) -> Result<()>;

    /// Whether a writer holds the lock for `id` right now.
    fn is_busy(&self, id: &FileId) -> bool;
}
