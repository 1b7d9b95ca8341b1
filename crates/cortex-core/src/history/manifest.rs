use crate::error::Result;
use crate::storage::{compute_hash, estimate_tokens, write_atomic};
use crate::types::{ChangeType, FileId, VersionMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub(crate) const MANIFEST_FILE: &str = "manifest.json";

/// Per-file list of retained snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub file_id: FileId,
    /// Next number to hand out. Never decreases, even when every snapshot
    /// has been pruned.
    pub next_version: u64,
    /// Ascending by version.
    pub versions: Vec<VersionMetadata>,
}

impl Manifest {
    pub fn empty(file_id: FileId) -> Self {
        Self {
            file_id,
            next_version: 1,
            versions: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&VersionMetadata> {
        self.versions.last()
    }

    /// Read `dir/manifest.json`. A missing manifest is an empty history; an
    /// unreadable one is reconstructed from the snapshot files beside it.
    pub fn load(dir: &Path, file_id: &FileId, root: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(manifest) if manifest.file_id == *file_id => Ok(manifest),
                Ok(manifest) => {
                    log::warn!(
                        "History manifest {} belongs to {}, rebuilding for {}",
                        path.display(),
                        manifest.file_id,
                        file_id
                    );
                    Self::recover(dir, file_id, root)
                }
                Err(e) => {
                    log::warn!("History manifest {} is unreadable ({}), rebuilding", path.display(), e);
                    Self::recover(dir, file_id, root)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::empty(file_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(MANIFEST_FILE), &bytes)?;
        Ok(())
    }

    /// Rebuild from `v*.snap` files. Change types and descriptions are lost.
    fn recover(dir: &Path, file_id: &FileId, root: &Path) -> Result<Self> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = parse_snapshot_name(&name) else {
                continue;
            };
            let path = entry.path();
            let bytes = fs::read(&path)?;
            let timestamp: DateTime<Utc> = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            versions.push(VersionMetadata {
                file_id: file_id.clone(),
                version,
                timestamp,
                content_hash: compute_hash(&bytes),
                size_bytes: bytes.len() as u64,
                token_estimate: estimate_tokens(&String::from_utf8_lossy(&bytes)),
                change_type: if version == 1 {
                    ChangeType::Created
                } else {
                    ChangeType::Modified
                },
                changed_sections: Vec::new(),
                description: Some("recovered".to_string()),
                snapshot_location: relative_location(root, &path),
            });
        }
        versions.sort_by_key(|v| v.version);
        let next_version = versions.last().map(|v| v.version + 1).unwrap_or(1);
        Ok(Self {
            file_id: file_id.clone(),
            next_version,
            versions,
        })
    }
}

pub(crate) fn snapshot_name(version: u64) -> String {
    format!("v{:06}.snap", version)
}

fn parse_snapshot_name(name: &str) -> Option<u64> {
    name.strip_prefix('v')?.strip_suffix(".snap")?.parse().ok()
}

/// `path` relative to `root`, `/`-separated.
pub(crate) fn relative_location(root: &Path, path: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
