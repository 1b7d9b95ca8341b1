use crate::config::CortexConfig;
use crate::error::{CortexError, Result};
use crate::graph::{DependencyGraph, GraphFormat, GraphView};
use crate::history::VersionHistory;
use crate::index::{LoadOutcome, MetadataIndex, SyncReport};
use crate::storage::{compute_hash, ContentAnalysis, ContentStore, FsContentStore};
use crate::transclusion::{CacheStats, ContentSource, TransclusionResolver};
use crate::types::{ChangeType, ContentHash, FileId, FileRecord, Link, Section, VersionMetadata};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// A file as returned by [`Cortex::read_file`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileView {
    pub id: FileId,
    pub content: String,
    /// Pass back as `expected` to write against this exact content.
    pub hash: ContentHash,
    pub sections: Vec<Section>,
    pub dependencies: Vec<Link>,
    pub token_estimate: u64,
}

/// Result of a committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub id: FileId,
    pub version: u64,
    pub hash: ContentHash,
    pub token_estimate: u64,
    pub size_bytes: u64,
    /// True when the file did not exist before this write.
    pub created: bool,
}

/// A retained version and its exact content. Nothing is written until the
/// caller writes `content` back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPreview {
    pub target: VersionMetadata,
    pub content: String,
}

/// High-level, embedded knowledge base over one directory.
///
/// All methods take `&self`; share across threads with `Arc<Cortex>`.
///
/// # Example
/// ```rust,no_run
/// use cortex_core::{Cortex, CortexConfig};
///
/// let cortex = Cortex::open("./knowledge", CortexConfig::default()).unwrap();
/// cortex.write_file("notes/intro.md", "# Intro\n{{include:notes/setup.md}}\n", None).unwrap();
/// let rendered = cortex.resolve_transclusions("notes/intro.md", None).unwrap();
/// ```
pub struct Cortex {
    config: CortexConfig,
    store: Arc<FsContentStore>,
    index: Arc<MetadataIndex>,
    history: Arc<VersionHistory>,
    graph: Arc<DependencyGraph>,
    resolver: Arc<TransclusionResolver>,
    warnings: Mutex<Vec<String>>,
}

impl Cortex {
    /// Open (or create) a knowledge base rooted at `root`.
    pub fn open(root: impl AsRef<Path>, config: CortexConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(FsContentStore::open(root.as_ref(), &config)?);
        let history = Arc::new(VersionHistory::open(
            store.root(),
            store.meta_dir().join("history"),
            &config.history,
        )?);

        let index_path = store.meta_dir().join(&config.index.file_name);
        let (index, outcome) = MetadataIndex::load(index_path, store.as_ref(), &|id| history.latest_version(id))?;
        let index = Arc::new(index);

        let mut warnings = Vec::new();
        if let LoadOutcome::Rebuilt { reason, backup } = &outcome {
            let corrupted = CortexError::IndexCorrupted(reason.clone());
            let backup = backup
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no backup".into());
            warnings.push(format!("{} (rebuilt from disk, previous index at {})", corrupted, backup));
        }
        if outcome == LoadOutcome::Loaded {
            let report = index.reconcile(store.as_ref(), &|id| history.latest_version(id))?;
            if !report.is_empty() {
                log::info!(
                    "Caught up with edits made while closed: {} added, {} updated, {} removed",
                    report.added.len(),
                    report.updated.len(),
                    report.removed.len()
                );
            }
        }
        index.save()?;

        let graph = Arc::new(DependencyGraph::new());
        let records: Vec<FileRecord> = index.records().into_iter().filter(|r| r.exists).collect();
        graph.reset(records.iter().map(|r| (&r.id, r.links.as_slice())));

        let resolver = Arc::new(TransclusionResolver::new(config.transclusion.cache_capacity));

        log::info!(
            "Opened knowledge base at {} ({} file(s), {:?})",
            store.root().display(),
            records.len(),
            outcome
        );

        Ok(Self {
            config,
            store,
            index,
            history,
            graph,
            resolver,
            warnings: Mutex::new(warnings),
        })
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn config(&self) -> &CortexConfig {
        &self.config
    }

    /// Problems recovered from since open, oldest first.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.resolver.cache_stats()
    }

    // === Reads ===

    /// Read a file. Counts toward the rate limit and the file's read count.
    /// A file edited outside the engine is re-indexed before returning.
    pub fn read_file(&self, id: &str) -> Result<FileView> {
        let id = self.store.validate_path(id)?;
        let (bytes, hash) = match self.store.read(&id) {
            Ok(read) => read,
            Err(CortexError::NotFound(missing)) => {
                self.forget_vanished(&missing);
                return Err(CortexError::NotFound(missing));
            }
            Err(e) => return Err(e),
        };
        let (content, hash, record) = match self.index.get_record(&id) {
            Some(record) if record.exists && record.content_hash == hash => {
                let content = String::from_utf8(bytes).map_err(|_| CortexError::InvalidEncoding(id.clone()))?;
                (content, hash, record)
            }
            _ => {
                let synced = self.resync(&id)?.ok_or_else(|| CortexError::NotFound(id.clone()))?;
                (synced.text, synced.hash, synced.record)
            }
        };
        self.index.increment_read_count(&id);

        Ok(FileView {
            id,
            content,
            hash,
            sections: record.sections,
            dependencies: record.links,
            token_estimate: record.token_estimate,
        })
    }

    /// Index record of a file, re-synced first if the disk disagrees.
    pub fn get_metadata(&self, id: &str) -> Result<FileRecord> {
        let id = self.store.validate_path(id)?;
        self.sync_file(&id)?.ok_or(CortexError::NotFound(id))
    }

    /// Every indexed file that exists, sorted by id.
    pub fn list_files(&self) -> Vec<FileRecord> {
        self.index.records().into_iter().filter(|r| r.exists).collect()
    }

    pub fn get_dependency_graph(&self, format: GraphFormat) -> GraphView {
        self.graph.export(format)
    }

    /// Dependencies first. `ids` restricts the set; default is every file.
    pub fn loading_order(&self, ids: Option<&[&str]>) -> Result<Vec<FileId>> {
        match ids {
            None => Ok(self.graph.compute_loading_order(None)),
            Some(raw) => {
                let ids = raw
                    .iter()
                    .map(|r| self.store.validate_path(r))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.graph.compute_loading_order(Some(&ids)))
            }
        }
    }

    /// Retained versions, newest first.
    pub fn get_version_history(&self, id: &str, limit: Option<usize>) -> Result<Vec<VersionMetadata>> {
        let id = self.store.validate_path(id)?;
        let versions = self.history.list(&id, limit)?;
        if versions.is_empty() && self.index.get_record(&id).is_none() {
            return Err(CortexError::NotFound(id));
        }
        Ok(versions)
    }

    /// Fetch the content of a retained version without writing anything.
    /// Write it back (or use [`Cortex::restore_version`]) to make it current.
    pub fn rollback(&self, id: &str, version: u64) -> Result<RollbackPreview> {
        let id = self.store.validate_path(id)?;
        let versions = self.history.list(&id, None)?;
        let target = self
            .history
            .rollback_to(&id, &versions, version)
            .ok_or_else(|| CortexError::RollbackTargetMissing {
                id: id.clone(),
                version,
            })?;

        let bytes = self
            .history
            .get_snapshot_content(&target.snapshot_location)
            .map_err(|e| match e {
                CortexError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    CortexError::RollbackTargetMissing {
                        id: id.clone(),
                        version,
                    }
                }
                other => other,
            })?;
        if compute_hash(&bytes) != target.content_hash {
            return Err(CortexError::Validation(format!(
                "snapshot v{} of {} does not match its recorded hash",
                version, id
            )));
        }
        let content = String::from_utf8(bytes).map_err(|_| CortexError::InvalidEncoding(id.clone()))?;
        Ok(RollbackPreview { target, content })
    }

    /// Fully rendered content with every include expanded. `max_depth`
    /// defaults to the configured limit.
    pub fn resolve_transclusions(&self, id: &str, max_depth: Option<usize>) -> Result<String> {
        let id = self.store.validate_path(id)?;
        self.store.throttle()?;
        let max_depth = max_depth.unwrap_or(self.config.transclusion.max_depth);
        self.resolver.resolve(&IndexedSource { cortex: self }, &id, max_depth)
    }

    // === Writes ===

    /// Write a file. With `expected`, fails `Conflict` unless the file still
    /// has that hash.
    pub fn write_file(&self, id: &str, content: &str, expected: Option<&ContentHash>) -> Result<WriteOutcome> {
        let id = self.store.validate_path(id)?;
        self.commit(&id, content, expected, None, None)
    }

    /// Make a retained version current again as a new, later version.
    pub fn restore_version(&self, id: &str, version: u64, expected: Option<&ContentHash>) -> Result<WriteOutcome> {
        let preview = self.rollback(id, version)?;
        let id = preview.target.file_id.clone();
        self.commit(
            &id,
            &preview.content,
            expected,
            Some(ChangeType::Rollback),
            Some(format!("rollback to v{}", version)),
        )
    }

    /// Remove a file. Its history is kept.
    pub fn delete_file(&self, id: &str) -> Result<()> {
        let id = self.store.validate_path(id)?;
        self.store.throttle()?;
        let lock = self.store.lock(&id)?;
        let deleted = self.store.delete_locked(&lock);
        self.forget(&id);
        deleted
    }

    /// Re-scan the root and re-sync every stale, new or vanished record.
    pub fn sync(&self) -> Result<SyncReport> {
        let report = self
            .index
            .reconcile(self.store.as_ref(), &|id| self.history.latest_version(id))?;
        for id in report.changed() {
            if let Some(record) = self.index.get_record(id) {
                self.graph.rebuild_dynamic_edges(id, &record.links);
            }
            self.resolver.invalidate(id);
        }
        for id in &report.removed {
            self.graph.remove_file(id);
            self.resolver.invalidate(id);
        }
        self.index.save()?;
        if !report.is_empty() {
            log::info!(
                "Sync: {} added, {} updated, {} removed",
                report.added.len(),
                report.updated.len(),
                report.removed.len()
            );
        }
        Ok(report)
    }

    /// Persist pending index changes.
    pub fn flush(&self) -> Result<()> {
        self.index.flush()
    }

    // === Internals ===

    /// Write, snapshot, index and re-link under one lock, so version numbers
    /// follow commit order.
    fn commit(
        &self,
        id: &FileId,
        content: &str,
        expected: Option<&ContentHash>,
        change_type: Option<ChangeType>,
        description: Option<String>,
    ) -> Result<WriteOutcome> {
        self.store.throttle()?;
        let lock = self.store.lock(id)?;

        let previous = self.store.read_locked(&lock)?;
        let existed = previous.is_some();
        let hash = self.store.write_locked(&lock, content.as_bytes(), expected)?;

        let change_type = change_type.unwrap_or(if existed {
            ChangeType::Modified
        } else {
            ChangeType::Created
        });
        let known_latest = self.index.get_record(id).map_or(0, |r| r.current_version);
        let meta = match self
            .history
            .create_snapshot(id, content.as_bytes(), change_type, description, known_latest)
        {
            Ok(meta) => meta,
            Err(e) => {
                // Without a snapshot the write never happened.
                log::error!("Snapshot of {} failed, restoring its previous content: {}", id, e);
                if let Err(restore) = self.store.restore_locked(&lock, previous.as_deref()) {
                    log::error!("Could not restore {} after a failed snapshot: {}", id, restore);
                }
                return Err(e);
            }
        };

        let analysis = ContentAnalysis::of(id, content, self.store.allowed_extensions());
        self.index.record_write(id, &analysis, meta.version);
        self.graph.rebuild_dynamic_edges(id, &analysis.links);
        self.resolver.invalidate(id);
        if let Err(e) = self.index.save() {
            // Content and history are committed; the next save catches up.
            log::warn!("Committed {} v{} but could not save the index: {}", id, meta.version, e);
            self.warnings
                .lock()
                .push(format!("index save after writing {} v{} failed: {}", id, meta.version, e));
        }
        drop(lock);

        log::debug!("Committed {} v{} ({})", id, meta.version, change_type);
        Ok(WriteOutcome {
            id: id.clone(),
            version: meta.version,
            hash,
            token_estimate: analysis.token_estimate,
            size_bytes: analysis.size_bytes,
            created: !existed,
        })
    }

    /// Index record of `id`, re-synced if the disk disagrees. `None` if the
    /// file is gone.
    fn sync_file(&self, id: &FileId) -> Result<Option<FileRecord>> {
        let hash = match self.store.read_unthrottled(id) {
            Ok((_, hash)) => hash,
            Err(CortexError::NotFound(_)) => {
                self.forget_vanished(id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if let Some(record) = self.index.get_record(id) {
            if record.exists && record.content_hash == hash {
                return Ok(Some(record));
            }
        }
        Ok(self.resync(id)?.map(|synced| synced.record))
    }

    /// Re-read `id` under its write lock and re-index it if the disk still
    /// disagrees with the index. A commit that finished in the meantime is
    /// taken as is; anything else changed outside the engine.
    fn resync(&self, id: &FileId) -> Result<Option<Synced>> {
        let _lock = self.store.lock(id)?;

        let (bytes, hash) = match self.store.read_unthrottled(id) {
            Ok(read) => read,
            Err(CortexError::NotFound(_)) => {
                if self.forget(id) {
                    log::warn!("{} vanished from disk; dropped its record", id);
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let text = String::from_utf8(bytes).map_err(|_| CortexError::InvalidEncoding(id.clone()))?;

        let existing = self.index.get_record(id);
        if let Some(record) = &existing {
            if record.exists && record.content_hash == hash {
                return Ok(Some(Synced { text, hash, record: record.clone() }));
            }
        }

        let version = match existing {
            Some(record) => {
                log::warn!("{} was modified outside the engine; re-syncing", id);
                record.current_version
            }
            None => {
                log::info!("Indexing {} found on disk", id);
                self.history.latest_version(id)
            }
        };
        let analysis = ContentAnalysis::of(id, &text, self.store.allowed_extensions());
        let record = self.index.record_write(id, &analysis, version);
        self.graph.rebuild_dynamic_edges(id, &analysis.links);
        self.resolver.invalidate(id);
        self.persist();
        Ok(Some(Synced { text, hash, record }))
    }

    /// Drop the record and edges of a file that no longer exists. Returns
    /// whether a record was dropped.
    fn forget(&self, id: &FileId) -> bool {
        let removed = self.index.remove_record(id).is_some();
        self.graph.remove_file(id);
        self.resolver.invalidate(id);
        if removed {
            self.persist();
        }
        removed
    }

    /// Forget `id` after a read found it missing, unless a writer has
    /// recreated it since.
    fn forget_vanished(&self, id: &FileId) {
        if self.index.get_record(id).is_none() {
            return;
        }
        let _lock = match self.store.lock(id) {
            Ok(lock) => lock,
            Err(e) => {
                log::debug!("Not dropping {} now: {}", id, e);
                return;
            }
        };
        match self.store.current_hash(id) {
            Ok(None) => {
                if self.forget(id) {
                    log::warn!("{} vanished from disk; dropped its record", id);
                }
            }
            Ok(Some(_)) => {}
            Err(e) => log::debug!("Not dropping {} now: {}", id, e),
        }
    }

    /// Best-effort save on read paths.
    fn persist(&self) {
        if let Err(e) = self.index.save() {
            log::warn!("Could not save index: {}", e);
        }
    }
}

/// A file's text and hash read under its write lock, with the matching record.
struct Synced {
    text: String,
    hash: ContentHash,
    record: FileRecord,
}

impl Drop for Cortex {
    fn drop(&mut self) {
        if let Err(e) = self.index.flush() {
            log::warn!("Failed to flush index on close: {}", e);
        }
    }
}

/// Resolver view of the knowledge base. Reads skip the rate limiter and
/// re-sync stale records as they go.
struct IndexedSource<'a> {
    cortex: &'a Cortex,
}

impl ContentSource for IndexedSource<'_> {
    fn load(&self, id: &FileId) -> Result<(String, ContentHash)> {
        let (bytes, hash) = match self.cortex.store.read_unthrottled(id) {
            Ok(read) => read,
            Err(CortexError::NotFound(missing)) => {
                self.cortex.forget_vanished(&missing);
                return Err(CortexError::NotFound(missing));
            }
            Err(e) => return Err(e),
        };
        if self.cortex.index.content_hash(id).as_ref() == Some(&hash) {
            let text = String::from_utf8(bytes).map_err(|_| CortexError::InvalidEncoding(id.clone()))?;
            return Ok((text, hash));
        }
        match self.cortex.resync(id)? {
            Some(synced) => Ok((synced.text, synced.hash)),
            None => Err(CortexError::NotFound(id.clone())),
        }
    }

    /// Hash of the bytes on disk, so edits made outside the engine also
    /// invalidate cached renderings.
    fn current_hash(&self, id: &FileId) -> Option<ContentHash> {
        match self.cortex.store.current_hash(id) {
            Ok(hash) => hash,
            Err(e) => {
                log::debug!("Could not hash {}: {}", id, e);
                None
            }
        }
    }

    fn validate_target(&self, raw: &str) -> Result<FileId> {
        self.cortex.store.validate_path(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_cortex() -> (Cortex, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = CortexConfig::default();
        config.rate_limit.enabled = false;
        config.storage.lock_timeout_ms = 200;
        let cortex = Cortex::open(temp_dir.path(), config).unwrap();
        (cortex, temp_dir)
    }

    #[test]
    fn test_write_then_read() {
        let (cortex, _temp) = create_test_cortex();
        let outcome = cortex.write_file("docs/a.md", "# A\nsee [b](b.md)\n", None).unwrap();
        assert_eq!(outcome.version, 1);
        assert!(outcome.created);

        let view = cortex.read_file("docs/a.md").unwrap();
        assert_eq!(view.hash, outcome.hash);
        assert_eq!(view.sections[0].title, "A");
        assert_eq!(view.dependencies[0].target_id.as_str(), "docs/b.md");
        assert_eq!(cortex.get_metadata("docs/a.md").unwrap().read_count, 1);
    }

    #[test]
    fn test_second_write_is_modified() {
        let (cortex, _temp) = create_test_cortex();
        let first = cortex.write_file("a.md", "one", None).unwrap();
        let second = cortex.write_file("a.md", "two", Some(&first.hash)).unwrap();
        assert_eq!(second.version, 2);
        assert!(!second.created);

        let history = cortex.get_version_history("a.md", None).unwrap();
        assert_eq!(history[0].change_type, ChangeType::Modified);
        assert_eq!(history[1].change_type, ChangeType::Created);
    }

    #[test]
    fn test_rejected_paths_surface_immediately() {
        let (cortex, _temp) = create_test_cortex();
        for bad in ["../escape.md", "/etc/passwd", ".cortex/index.json", "image.png"] {
            assert!(
                matches!(cortex.write_file(bad, "x", None), Err(CortexError::PathRejected { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_external_edit_is_resynced_on_read() {
        let (cortex, temp) = create_test_cortex();
        cortex.write_file("a.md", "plain", None).unwrap();
        std::fs::write(temp.path().join("a.md"), "{{include:b.md}}").unwrap();

        let view = cortex.read_file("a.md").unwrap();
        assert_eq!(view.dependencies.len(), 1);
        let deps = cortex.graph.get_dependencies(&FileId::new("a.md").unwrap());
        assert_eq!(deps[0].to.as_str(), "b.md");
        assert_eq!(cortex.get_metadata("a.md").unwrap().current_version, 1);
    }

    #[test]
    fn test_vanished_file_is_forgotten() {
        let (cortex, temp) = create_test_cortex();
        cortex.write_file("a.md", "[b](b.md)", None).unwrap();
        std::fs::remove_file(temp.path().join("a.md")).unwrap();

        assert!(matches!(cortex.read_file("a.md"), Err(CortexError::NotFound(_))));
        assert!(matches!(cortex.get_metadata("a.md"), Err(CortexError::NotFound(_))));
        assert!(cortex.list_files().is_empty());
        assert!(cortex.graph.get_dependencies(&FileId::new("a.md").unwrap()).is_empty());
    }

    #[test]
    fn test_unindexed_file_is_picked_up() {
        let (cortex, temp) = create_test_cortex();
        std::fs::write(temp.path().join("dropped.md"), "# Dropped in\n").unwrap();
        let record = cortex.get_metadata("dropped.md").unwrap();
        assert_eq!(record.sections[0].title, "Dropped in");
        assert_eq!(record.current_version, 0);
    }

    #[test]
    fn test_delete_keeps_history() {
        let (cortex, _temp) = create_test_cortex();
        cortex.write_file("a.md", "one", None).unwrap();
        cortex.delete_file("a.md").unwrap();

        assert!(matches!(cortex.read_file("a.md"), Err(CortexError::NotFound(_))));
        assert!(matches!(cortex.delete_file("a.md"), Err(CortexError::NotFound(_))));
        assert_eq!(cortex.rollback("a.md", 1).unwrap().content, "one");

        let recreated = cortex.write_file("a.md", "again", None).unwrap();
        assert!(recreated.created);
        assert_eq!(recreated.version, 2);
    }

    #[test]
    fn test_restore_version_writes_rollback() {
        let (cortex, _temp) = create_test_cortex();
        cortex.write_file("a.md", "one", None).unwrap();
        cortex.write_file("a.md", "two", None).unwrap();

        let restored = cortex.restore_version("a.md", 1, None).unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(cortex.read_file("a.md").unwrap().content, "one");

        let latest = &cortex.get_version_history("a.md", Some(1)).unwrap()[0];
        assert_eq!(latest.change_type, ChangeType::Rollback);
        assert_eq!(latest.description.as_deref(), Some("rollback to v1"));
    }

    #[test]
    fn test_rollback_to_unknown_version() {
        let (cortex, _temp) = create_test_cortex();
        cortex.write_file("a.md", "one", None).unwrap();
        assert!(matches!(
            cortex.rollback("a.md", 7),
            Err(CortexError::RollbackTargetMissing { version: 7, .. })
        ));
        assert!(matches!(
            cortex.get_version_history("never.md", None),
            Err(CortexError::NotFound(_))
        ));
    }

    #[test]
    fn test_sync_reports_changes() {
        let (cortex, temp) = create_test_cortex();
        cortex.write_file("a.md", "one", None).unwrap();
        std::fs::write(temp.path().join("b.md"), "[a](a.md)").unwrap();

        let report = cortex.sync().unwrap();
        assert_eq!(report.added.len(), 1);
        assert_eq!(cortex.graph.get_dependents(&FileId::new("a.md").unwrap()).len(), 1);
        assert!(cortex.sync().unwrap().is_empty());
    }

    #[test]
    fn test_loading_order_validates_ids() {
        let (cortex, _temp) = create_test_cortex();
        cortex.write_file("README.md", "# Readme", None).unwrap();
        cortex.write_file("ARCHITECTURE.md", "# Arch", None).unwrap();
        let order = cortex.loading_order(None).unwrap();
        assert_eq!(order[0].as_str(), "README.md");
        assert!(cortex.loading_order(Some(&["../x.md"])).is_err());
    }

    #[test]
    fn test_failed_snapshot_leaves_file_untouched() {
        let (cortex, _temp) = create_test_cortex();
        let first = cortex.write_file("a.md", "one", None).unwrap();

        // A plain file where the history directory should be.
        let file_dir = cortex.history.dir().join(crate::storage::encode_id(&FileId::new("a.md").unwrap()));
        std::fs::remove_dir_all(&file_dir).unwrap();
        std::fs::write(&file_dir, b"in the way").unwrap();

        assert!(cortex.write_file("a.md", "two", Some(&first.hash)).is_err());
        assert_eq!(cortex.read_file("a.md").unwrap().content, "one");
        assert_eq!(cortex.get_metadata("a.md").unwrap().content_hash, first.hash);

        std::fs::remove_file(&file_dir).unwrap();
        let retried = cortex.write_file("a.md", "two", Some(&first.hash)).unwrap();
        assert_eq!(retried.version, 2, "version numbers continue past the lost history");
        assert_eq!(cortex.read_file("a.md").unwrap().content, "two");
    }

    #[test]
    fn test_failed_snapshot_of_new_file_removes_it() {
        let (cortex, _temp) = create_test_cortex();
        let file_dir = cortex.history.dir().join(crate::storage::encode_id(&FileId::new("new.md").unwrap()));
        std::fs::write(&file_dir, b"in the way").unwrap();

        assert!(cortex.write_file("new.md", "fresh", None).is_err());
        assert!(matches!(cortex.read_file("new.md"), Err(CortexError::NotFound(_))));
        assert!(cortex.list_files().is_empty());
    }

    #[test]
    fn test_oversized_file_can_be_replaced() {
        let temp = TempDir::new().unwrap();
        let mut config = CortexConfig::default();
        config.rate_limit.enabled = false;
        config.storage.max_file_bytes = 64;
        let cortex = Cortex::open(temp.path(), config).unwrap();

        let big = vec![b'x'; 100];
        std::fs::write(temp.path().join("big.md"), &big).unwrap();
        assert!(matches!(cortex.read_file("big.md"), Err(CortexError::FileTooLarge { .. })));

        let blind = cortex.write_file("big.md", "small", None).unwrap();
        assert!(!blind.created);
        assert_eq!(cortex.read_file("big.md").unwrap().content, "small");

        std::fs::write(temp.path().join("other.md"), &big).unwrap();
        let checked = cortex.write_file("other.md", "small", Some(&compute_hash(&big))).unwrap();
        assert_eq!(checked.version, 1);
        assert!(matches!(
            cortex.write_file("other.md", "again", Some(&compute_hash(&big))),
            Err(CortexError::Conflict { .. })
        ));
    }

    #[test]
    fn test_reads_wait_for_an_in_flight_commit() {
        let (cortex, temp) = create_test_cortex();
        let first = cortex.write_file("a.md", "one", None).unwrap();

        // Simulate a commit that has renamed new bytes into place but not
        // yet recorded them: the reader must not index them as an outside
        // edit of v1.
        let lock = cortex.store.lock(&FileId::new("a.md").unwrap()).unwrap();
        std::fs::write(temp.path().join("a.md"), "two").unwrap();
        std::thread::scope(|s| {
            let reader = s.spawn(|| cortex.read_file("a.md"));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!reader.is_finished());
            drop(lock);
            let view = reader.join().unwrap().unwrap();
            assert_eq!(view.content, "two");
        });
        assert_ne!(cortex.get_metadata("a.md").unwrap().content_hash, first.hash);
    }
}
