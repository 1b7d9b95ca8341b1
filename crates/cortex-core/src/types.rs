use crate::error::{CortexError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root-relative identifier of a knowledge file.
///
/// Always `/`-separated, never absolute, and free of `.`/`..` segments after
/// normalization. Lexical safety only: whether the path stays inside the
/// storage root on disk (symlinks included) is decided by the path guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

impl FileId {
    /// Normalize and validate a path-like identifier.
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(CortexError::rejected(raw, "empty identifier"));
        }
        if raw.contains('\0') {
            return Err(CortexError::rejected(raw, "contains NUL byte"));
        }
        let unified = raw.replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(CortexError::rejected(raw, "absolute paths are not identifiers"));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    if segments.pop().is_none() {
                        return Err(CortexError::rejected(raw, "escapes the storage root"));
                    }
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(CortexError::rejected(raw, "does not name a file"));
        }
        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Lowercased extension, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Directory part, empty for files at the root.
    pub fn parent(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        }
    }

    /// Resolve `target` relative to this file's directory, the way a Markdown
    /// link is resolved.
    pub fn resolve_relative(&self, target: &str) -> Result<FileId> {
        let unified = target.replace('\\', "/");
        if let Some(root_relative) = unified.strip_prefix('/') {
            return FileId::new(root_relative);
        }
        let parent = self.parent();
        if parent.is_empty() {
            FileId::new(&unified)
        } else {
            FileId::new(&format!("{}/{}", parent, unified))
        }
    }
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FileId {
    type Error = CortexError;

    fn try_from(value: String) -> Result<Self> {
        FileId::new(&value)
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

impl AsRef<str> for FileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase hex SHA-256 digest of a file's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One heading in a file's outline. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub level: u8,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Plain Markdown link. Cycles are legal.
    Reference,
    /// Inclusion directive. Cycles are a resolution error.
    Transclusion,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Reference => write!(f, "reference"),
            LinkKind::Transclusion => write!(f, "transclusion"),
        }
    }
}

/// Outbound link discovered in a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub target_id: FileId,
    pub kind: LinkKind,
}

/// Index entry shadowing one knowledge file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,

    /// False once the file has been observed missing on disk.
    pub exists: bool,

    pub size_bytes: u64,

    /// Hash of the on-disk bytes as of the last successful index update.
    /// A mismatch with the disk means the file was edited externally.
    pub content_hash: ContentHash,

    pub token_estimate: u64,

    pub sections: Vec<Section>,

    pub links: Vec<Link>,

    pub read_count: u64,

    pub last_access_time: Option<DateTime<Utc>>,

    pub last_modified_time: DateTime<Utc>,

    /// Latest version number in the history, 0 if never snapshotted.
    pub current_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Rollback,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Created => write!(f, "created"),
            ChangeType::Modified => write!(f, "modified"),
            ChangeType::Rollback => write!(f, "rollback"),
        }
    }
}

/// Immutable description of one retained snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub file_id: FileId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub token_estimate: u64,
    pub change_type: ChangeType,
    pub changed_sections: Vec<String>,
    pub description: Option<String>,
    /// Root-relative path of the snapshot file.
    pub snapshot_location: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalization() {
        assert_eq!(FileId::new("./docs//a.md").unwrap().as_str(), "docs/a.md");
        assert_eq!(FileId::new("docs\\sub\\..\\a.md").unwrap().as_str(), "docs/a.md");
        assert_eq!(FileId::new("a.md").unwrap().parent(), "");
        assert_eq!(FileId::new("x/y/a.MD").unwrap().extension().as_deref(), Some("md"));
    }

    #[test]
    fn test_rejections() {
        assert!(FileId::new("").is_err());
        assert!(FileId::new("/etc/passwd").is_err());
        assert!(FileId::new("C:/Windows/a.md").is_err());
        assert!(FileId::new("../outside.md").is_err());
        assert!(FileId::new("a/../../outside.md").is_err());
        assert!(FileId::new("a\0.md").is_err());
        assert!(FileId::new("./").is_err());
    }

    #[test]
    fn test_resolve_relative() {
        let id = FileId::new("guides/setup.md").unwrap();
        assert_eq!(id.resolve_relative("../README.md").unwrap().as_str(), "README.md");
        assert_eq!(id.resolve_relative("deploy.md").unwrap().as_str(), "guides/deploy.md");
        assert_eq!(id.resolve_relative("/top.md").unwrap().as_str(), "top.md");
        assert!(id.resolve_relative("../../escape.md").is_err());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let id: FileId = serde_json::from_str("\"docs/./a.md\"").unwrap();
        assert_eq!(id.as_str(), "docs/a.md");
        assert!(serde_json::from_str::<FileId>("\"../a.md\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_normalized_ids_never_escape(raw in "[a-z./]{1,24}") {
            if let Ok(id) = FileId::new(&raw) {
                let s = id.as_str();
                prop_assert!(!s.starts_with('/'));
                prop_assert!(!s.split('/').any(|seg| seg == ".." || seg == "." || seg.is_empty()));
                // Normalization is idempotent.
                prop_assert_eq!(FileId::new(s).unwrap(), id.clone());
            }
        }
    }
}
