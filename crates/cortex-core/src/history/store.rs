use super::manifest::{relative_location, snapshot_name, Manifest};
use crate::config::HistoryConfig;
use crate::error::{CortexError, Result};
use crate::storage::{compute_hash, encode_id, estimate_tokens, parse_sections, slice_lines, write_atomic};
use crate::types::{ChangeType, FileId, VersionMetadata};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Full-content snapshots per file, pruned to a fixed retention.
///
/// Layout: `<history>/<encoded-id>/v000001.snap` plus `manifest.json`.
/// Version numbers come from the manifest's `next_version` and are never
/// reused.
pub struct VersionHistory {
    root: PathBuf,
    dir: PathBuf,
    max_versions: usize,
    file_locks: Mutex<HashMap<FileId, Arc<Mutex<()>>>>,
}

impl VersionHistory {
    /// `root` is the storage root snapshot locations are relative to;
    /// `dir` is the history directory inside it.
    pub fn open(root: impl Into<PathBuf>, dir: impl Into<PathBuf>, config: &HistoryConfig) -> Result<Self> {
        let root = root.into();
        let dir = dir.into();
        if !dir.starts_with(&root) {
            return Err(CortexError::Config(format!(
                "history directory {} is outside {}",
                dir.display(),
                root.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            root,
            dir,
            max_versions: config.max_versions_per_file.max(1),
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_versions(&self) -> usize {
        self.max_versions
    }

    /// Store `content` as the next version of `id`, then prune.
    ///
    /// `known_latest` is the highest version the caller has seen for `id`;
    /// the new version is always above it, even if the history was lost.
    pub fn create_snapshot(
        &self,
        id: &FileId,
        content: &[u8],
        change_type: ChangeType,
        description: Option<String>,
        known_latest: u64,
    ) -> Result<VersionMetadata> {
        self.with_file_lock(id, || self.snapshot_locked(id, content, change_type, description, known_latest))
    }

    fn snapshot_locked(
        &self,
        id: &FileId,
        content: &[u8],
        change_type: ChangeType,
        description: Option<String>,
        known_latest: u64,
    ) -> Result<VersionMetadata> {
        let file_dir = self.file_dir(id);
        let mut manifest = Manifest::load(&file_dir, id, &self.root)?;
        if manifest.next_version <= known_latest {
            log::warn!(
                "History of {} restarts at v{} but v{} was already assigned",
                id,
                manifest.next_version,
                known_latest
            );
            manifest.next_version = known_latest + 1;
        }

        let text = String::from_utf8_lossy(content);
        let changed_sections = match manifest.latest() {
            Some(previous) => match self.read_location(&previous.snapshot_location) {
                Ok(prev) => changed_sections(&String::from_utf8_lossy(&prev), &text),
                Err(e) => {
                    log::warn!("Previous snapshot of {} unreadable: {}", id, e);
                    all_sections(&text)
                }
            },
            None => all_sections(&text),
        };

        let version = manifest.next_version;
        let snap_path = file_dir.join(snapshot_name(version));
        fs::create_dir_all(&file_dir)?;
        write_atomic(&snap_path, content)?;

        let metadata = VersionMetadata {
            file_id: id.clone(),
            version,
            timestamp: Utc::now(),
            content_hash: compute_hash(content),
            size_bytes: content.len() as u64,
            token_estimate: estimate_tokens(&text),
            change_type,
            changed_sections,
            description,
            snapshot_location: relative_location(&self.root, &snap_path),
        };
        manifest.next_version = version + 1;
        manifest.versions.push(metadata.clone());

        let pruned = self.prune_manifest(&mut manifest, &file_dir);
        manifest.save(&file_dir)?;
        log::debug!(
            "Snapshot {} v{} ({}, {} pruned)",
            id,
            version,
            metadata.change_type,
            pruned
        );
        Ok(metadata)
    }

    /// Raw bytes of a snapshot by its recorded location.
    pub fn get_snapshot_content(&self, location: &str) -> Result<Vec<u8>> {
        self.read_location(location)
    }

    /// Retained versions of `id`, newest first.
    pub fn list(&self, id: &FileId, limit: Option<usize>) -> Result<Vec<VersionMetadata>> {
        let manifest = Manifest::load(&self.file_dir(id), id, &self.root)?;
        let limit = limit.unwrap_or(usize::MAX);
        Ok(manifest.versions.into_iter().rev().take(limit).collect())
    }

    /// Look up `target` in an already fetched history. Never touches disk
    /// and never removes later versions; the caller writes the content back
    /// as a new version.
    pub fn rollback_to(&self, id: &FileId, history: &[VersionMetadata], target: u64) -> Option<VersionMetadata> {
        history
            .iter()
            .find(|v| v.file_id == *id && v.version == target)
            .cloned()
    }

    /// Highest version ever assigned to `id`, 0 if none.
    pub fn latest_version(&self, id: &FileId) -> u64 {
        match Manifest::load(&self.file_dir(id), id, &self.root) {
            Ok(manifest) => manifest.next_version.saturating_sub(1),
            Err(e) => {
                log::warn!("Could not read history of {}: {}", id, e);
                0
            }
        }
    }

    /// Enforce retention for `id`. Returns how many snapshots were removed.
    pub fn prune(&self, id: &FileId) -> Result<usize> {
        self.with_file_lock(id, || {
            let file_dir = self.file_dir(id);
            let mut manifest = Manifest::load(&file_dir, id, &self.root)?;
            let pruned = self.prune_manifest(&mut manifest, &file_dir);
            if pruned > 0 {
                manifest.save(&file_dir)?;
            }
            Ok(pruned)
        })
    }

    fn prune_manifest(&self, manifest: &mut Manifest, file_dir: &Path) -> usize {
        let excess = manifest.versions.len().saturating_sub(self.max_versions);
        for old in manifest.versions.drain(..excess) {
            let path = file_dir.join(snapshot_name(old.version));
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("Could not prune {}: {}", path.display(), e),
            }
        }
        excess
    }

    fn file_dir(&self, id: &FileId) -> PathBuf {
        self.dir.join(encode_id(id))
    }

    /// Run `f` holding the per-file history lock. The lock entry is dropped
    /// again once nobody else is waiting on it.
    fn with_file_lock<T>(&self, id: &FileId, f: impl FnOnce() -> T) -> T {
        let file_lock = self
            .file_locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = file_lock.lock();
            f()
        };

        let mut locks = self.file_locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&file_lock) == 2 {
            locks.remove(id);
        }
        result
    }

    fn read_location(&self, location: &str) -> Result<Vec<u8>> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        let path = self.root.join(relative);
        if escapes || !path.starts_with(&self.dir) || path.extension().map_or(true, |e| e != "snap") {
            return Err(CortexError::rejected(location, "not a snapshot location"));
        }
        Ok(fs::read(path)?)
    }
}

fn all_sections(text: &str) -> Vec<String> {
    parse_sections(text).into_iter().map(|s| s.title).collect()
}

/// Titles of sections in `current` that are new or whose text differs from
/// the section of the same title in `previous`.
fn changed_sections(previous: &str, current: &str) -> Vec<String> {
    let before: HashMap<String, String> = parse_sections(previous)
        .into_iter()
        .map(|s| {
            let body = slice_lines(previous, s.start_line, s.end_line);
            (s.title, body)
        })
        .collect();

    parse_sections(current)
        .into_iter()
        .filter(|s| {
            let body = slice_lines(current, s.start_line, s.end_line);
            before.get(&s.title) != Some(&body)
        })
        .map(|s| s.title)
        .collect()
}
