use super::schema;
use crate::error::{CortexError, Result};
use crate::storage::{write_atomic, ContentAnalysis, ContentStore};
use crate::types::{ContentHash, FileId, FileRecord};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// How the index came to be in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// No index file existed; the root was scanned.
    Created,
    Migrated { from: u32 },
    /// The file was unusable, set aside, and replaced by a scan.
    Rebuilt { backup: Option<PathBuf>, reason: String },
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<FileId>,
    pub updated: Vec<FileId>,
    pub removed: Vec<FileId>,
    /// Files present on disk that could not be read or parsed.
    pub skipped: Vec<FileId>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Added and updated ids.
    pub fn changed(&self) -> impl Iterator<Item = &FileId> {
        self.added.iter().chain(self.updated.iter())
    }
}

struct IndexState {
    records: BTreeMap<FileId, FileRecord>,
    generation: u64,
}

/// In-memory map of `FileRecord`s persisted as one JSON document.
///
/// Mutations bump a generation counter. `save()` serializes under its own
/// mutex and skips the write when the persisted generation is already
/// current, so a burst of mutations costs one save.
pub struct MetadataIndex {
    path: PathBuf,
    state: RwLock<IndexState>,
    persisted: Mutex<u64>,
}

impl MetadataIndex {
    /// Load the index at `path`, rebuilding from `store` when it is absent or
    /// unusable. `version_of` supplies each file's latest history version.
    pub fn load(
        path: impl Into<PathBuf>,
        store: &dyn ContentStore,
        version_of: &(dyn Fn(&FileId) -> u64 + Sync),
    ) -> Result<(Self, LoadOutcome)> {
        let path = path.into();

        let (records, outcome) = match fs::read(&path) {
            Ok(bytes) => match schema::decode(&bytes) {
                Ok(decoded) => match decoded.migrated_from {
                    None => (decoded.files, LoadOutcome::Loaded),
                    Some(from) => {
                        log::info!("Migrated index {} from schema v{}", path.display(), from);
                        (decoded.files, LoadOutcome::Migrated { from })
                    }
                },
                Err(reason) => {
                    log::warn!("Index {} is unusable: {}", path.display(), reason);
                    let backup = Self::backup(&path);
                    let (records, _) = Self::scan(store, &BTreeMap::new(), version_of)?;
                    (records, LoadOutcome::Rebuilt { backup, reason })
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let (records, _) = Self::scan(store, &BTreeMap::new(), version_of)?;
                (records, LoadOutcome::Created)
            }
            Err(e) => return Err(e.into()),
        };

        // Anything but a clean load has unsaved state.
        let generation = u64::from(outcome != LoadOutcome::Loaded);
        log::info!(
            "Index ready at {} with {} record(s) ({:?})",
            path.display(),
            records.len(),
            outcome
        );

        let index = Self {
            path,
            state: RwLock::new(IndexState { records, generation }),
            persisted: Mutex::new(0),
        };
        Ok((index, outcome))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Reads ===

    pub fn get_record(&self, id: &FileId) -> Option<FileRecord> {
        self.state.read().records.get(id).cloned()
    }

    pub fn content_hash(&self, id: &FileId) -> Option<ContentHash> {
        self.state
            .read()
            .records
            .get(id)
            .filter(|r| r.exists)
            .map(|r| r.content_hash.clone())
    }

    pub fn list_ids(&self) -> Vec<FileId> {
        self.state.read().records.keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<FileRecord> {
        self.state.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        let generation = self.state.read().generation;
        generation > *self.persisted.lock()
    }

    // === Mutations ===

    /// Record a successful write (or a re-sync of external edits).
    pub fn record_write(&self, id: &FileId, analysis: &ContentAnalysis, version: u64) -> FileRecord {
        let now = Utc::now();
        let mut state = self.state.write();
        let record = state
            .records
            .entry(id.clone())
            .or_insert_with(|| new_record(id, analysis, version));
        apply_analysis(record, analysis);
        record.current_version = version.max(record.current_version);
        record.last_modified_time = now;
        let snapshot = record.clone();
        state.generation += 1;
        snapshot
    }

    /// Count one read. Returns the new count, `None` if not indexed.
    pub fn increment_read_count(&self, id: &FileId) -> Option<u64> {
        let mut state = self.state.write();
        let record = state.records.get_mut(id)?;
        record.read_count += 1;
        record.last_access_time = Some(Utc::now());
        let count = record.read_count;
        state.generation += 1;
        Some(count)
    }

    pub fn remove_record(&self, id: &FileId) -> Option<FileRecord> {
        let mut state = self.state.write();
        let removed = state.records.remove(id);
        if removed.is_some() {
            state.generation += 1;
        }
        removed
    }

    /// Bring every record in line with the disk: new files are added,
    /// changed files re-analysed, vanished files dropped. Counters survive.
    ///
    /// Files a writer holds the lock for are left alone, and a result is only
    /// applied when the record still matches what the scan started from.
    pub fn reconcile(
        &self,
        store: &dyn ContentStore,
        version_of: &(dyn Fn(&FileId) -> u64 + Sync),
    ) -> Result<SyncReport> {
        let current = self.state.read().records.clone();
        let (mut scanned, mut report) = Self::scan(store, &current, version_of)?;
        if report.is_empty() {
            return Ok(report);
        }

        let mut state = self.state.write();
        let mut stale = Vec::new();
        for id in report.changed() {
            let untouched = same_revision(state.records.get(id), current.get(id));
            match scanned.remove(id) {
                Some(record) if untouched => {
                    state.records.insert(id.clone(), record);
                }
                _ => stale.push(id.clone()),
            }
        }
        for id in &report.removed {
            if same_revision(state.records.get(id), current.get(id)) {
                state.records.remove(id);
            } else {
                stale.push(id.clone());
            }
        }
        if !stale.is_empty() {
            log::debug!("Reconcile left {} record(s) changed mid-scan alone", stale.len());
            report.added.retain(|id| !stale.contains(id));
            report.updated.retain(|id| !stale.contains(id));
            report.removed.retain(|id| !stale.contains(id));
        }
        if !report.is_empty() {
            state.generation += 1;
        }
        Ok(report)
    }

    // === Persistence ===

    /// Persist if anything changed since the last save. Returns whether a
    /// write happened.
    pub fn save(&self) -> Result<bool> {
        let mut persisted = self.persisted.lock();
        let (generation, bytes) = {
            let state = self.state.read();
            if state.generation <= *persisted {
                return Ok(false);
            }
            (state.generation, schema::encode(&state.records)?)
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &bytes)?;
        *persisted = generation;
        log::debug!("Saved index generation {} ({} bytes)", generation, bytes.len());
        Ok(true)
    }

    pub fn flush(&self) -> Result<()> {
        self.save().map(|_| ())
    }

    // === Internals ===

    /// Move an unusable index aside as `<name>.corrupt-<timestamp>`.
    fn backup(path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let backup = path.with_file_name(format!("{}.corrupt-{}", name, stamp));
        match fs::rename(path, &backup) {
            Ok(()) => {
                log::warn!("Backed up unusable index to {}", backup.display());
                Some(backup)
            }
            Err(e) => {
                log::warn!("Could not back up index {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Hash every file on disk in parallel and derive the new record map
    /// from `previous`.
    fn scan(
        store: &dyn ContentStore,
        previous: &BTreeMap<FileId, FileRecord>,
        version_of: &(dyn Fn(&FileId) -> u64 + Sync),
    ) -> Result<(BTreeMap<FileId, FileRecord>, SyncReport)> {
        let ids = store.list_ids()?;
        let exts = store.allowed_extensions();

        enum Scanned {
            Unchanged(FileId),
            Fresh(FileId, ContentAnalysis),
            Skipped(FileId),
            /// Mid-write; the writer will record it.
            Busy(FileId),
        }

        let scanned: Vec<Scanned> = ids
            .par_iter()
            .map(|id| {
                if store.is_busy(id) {
                    return Scanned::Busy(id.clone());
                }
                let (bytes, hash) = match store.read_unthrottled(id) {
                    Ok(read) => read,
                    Err(e) => {
                        log::warn!("Skipping {} during index scan: {}", id, e);
                        return Scanned::Skipped(id.clone());
                    }
                };
                // A writer may have renamed new bytes into place after the
                // first check but not yet recorded them.
                if store.is_busy(id) {
                    return Scanned::Busy(id.clone());
                }
                if let Some(prev) = previous.get(id) {
                    if prev.exists && prev.content_hash == hash {
                        return Scanned::Unchanged(id.clone());
                    }
                }
                match String::from_utf8(bytes) {
                    Ok(text) => Scanned::Fresh(id.clone(), ContentAnalysis::of(id, &text, exts)),
                    Err(_) => {
                        log::warn!("Skipping {} during index scan: {}", id, CortexError::InvalidEncoding(id.clone()));
                        Scanned::Skipped(id.clone())
                    }
                }
            })
            .collect();

        let mut records = BTreeMap::new();
        let mut report = SyncReport::default();
        for item in scanned {
            match item {
                Scanned::Unchanged(id) => {
                    if let Some(prev) = previous.get(&id) {
                        records.insert(id, prev.clone());
                    }
                }
                Scanned::Fresh(id, analysis) => {
                    let record = match previous.get(&id) {
                        Some(prev) => {
                            let mut record = prev.clone();
                            apply_analysis(&mut record, &analysis);
                            record.last_modified_time = Utc::now();
                            report.updated.push(id.clone());
                            record
                        }
                        None => {
                            report.added.push(id.clone());
                            new_record(&id, &analysis, version_of(&id))
                        }
                    };
                    records.insert(id, record);
                }
                Scanned::Busy(id) => {
                    if let Some(prev) = previous.get(&id) {
                        records.insert(id, prev.clone());
                    }
                }
                Scanned::Skipped(id) => {
                    // Keep what we knew rather than forgetting a file we can't read.
                    if let Some(prev) = previous.get(&id) {
                        records.insert(id.clone(), prev.clone());
                    }
                    report.skipped.push(id);
                }
            }
        }
        report.removed = previous
            .keys()
            .filter(|id| !records.contains_key(*id))
            .cloned()
            .collect();

        Ok((records, report))
    }
}

fn new_record(id: &FileId, analysis: &ContentAnalysis, version: u64) -> FileRecord {
    FileRecord {
        id: id.clone(),
        exists: true,
        size_bytes: analysis.size_bytes,
        content_hash: analysis.hash.clone(),
        token_estimate: analysis.token_estimate,
        sections: analysis.sections.clone(),
        links: analysis.links.clone(),
        read_count: 0,
        last_access_time: None,
        last_modified_time: Utc::now(),
        current_version: version,
    }
}

/// Whether two snapshots of a record describe the same file revision.
fn same_revision(a: Option<&FileRecord>, b: Option<&FileRecord>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.exists == b.exists
                && a.content_hash == b.content_hash
                && a.current_version == b.current_version
        }
        _ => false,
    }
}

fn apply_analysis(record: &mut FileRecord, analysis: &ContentAnalysis) {
    record.exists = true;
    record.size_bytes = analysis.size_bytes;
    record.content_hash = analysis.hash.clone();
    record.token_estimate = analysis.token_estimate;
    record.sections = analysis.sections.clone();
    record.links = analysis.links.clone();
}
