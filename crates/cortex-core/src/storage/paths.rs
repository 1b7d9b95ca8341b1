use crate::error::{CortexError, Result};
use crate::types::FileId;
use std::path::{Path, PathBuf};

/// Reserved directory under the storage root for index, history and locks.
pub const META_DIR: &str = ".cortex";

/// Decides whether an identifier may be touched, before any I/O on it.
///
/// Rules, in order: the identifier must normalize lexically (no absolute
/// paths, no `..` escape), must not name a hidden path (the metadata
/// directory and temp files live there), must carry an allowed extension, and
/// the deepest existing ancestor on disk must canonicalize to a location
/// inside the root. The last rule is what catches symlinks.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    allowed_extensions: Vec<String>,
}

impl PathGuard {
    /// Create the root if needed and pin its canonical form.
    pub fn new(root: impl AsRef<Path>, allowed_extensions: &[String]) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            CortexError::Validation(format!(
                "Failed to create storage root {}: {}",
                root.display(),
                e
            ))
        })?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    pub fn is_allowed_extension(&self, id: &FileId) -> bool {
        id.extension()
            .map(|ext| self.allowed_extensions.iter().any(|a| *a == ext))
            .unwrap_or(false)
    }

    /// Parse and fully validate a raw identifier.
    pub fn validate(&self, raw: &str) -> Result<FileId> {
        let id = FileId::new(raw)?;
        self.resolve(&id)?;
        Ok(id)
    }

    /// Absolute on-disk path for a validated identifier.
    pub fn resolve(&self, id: &FileId) -> Result<PathBuf> {
        if id.as_str().split('/').any(|seg| seg.starts_with('.')) {
            return Err(CortexError::rejected(id.as_str(), "hidden paths are reserved"));
        }
        if !self.is_allowed_extension(id) {
            return Err(CortexError::rejected(
                id.as_str(),
                format!(
                    "extension not allowed (expected one of: {})",
                    self.allowed_extensions.join(", ")
                ),
            ));
        }

        let full = self.root.join(id.as_str());
        self.check_containment(id, &full)?;
        Ok(full)
    }

    /// Walk up to the deepest existing ancestor and make sure it canonicalizes
    /// inside the root. Everything below it is plain, not-yet-created names.
    fn check_containment(&self, id: &FileId, full: &Path) -> Result<()> {
        let mut probe = full;
        loop {
            match std::fs::symlink_metadata(probe) {
                Ok(meta) => {
                    let canonical = match probe.canonicalize() {
                        Ok(c) => c,
                        Err(_) if meta.file_type().is_symlink() => {
                            return Err(CortexError::rejected(id.as_str(), "dangling symlink"));
                        }
                        Err(e) => return Err(CortexError::Io(e)),
                    };
                    if !canonical.starts_with(&self.root) {
                        return Err(CortexError::rejected(
                            id.as_str(),
                            "resolves outside the storage root",
                        ));
                    }
                    if canonical.starts_with(self.meta_dir()) {
                        return Err(CortexError::rejected(id.as_str(), "resolves into metadata"));
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    probe = match probe.parent() {
                        Some(parent) if parent.starts_with(&self.root) => parent,
                        _ => return Ok(()),
                    };
                }
                Err(e) => return Err(CortexError::Io(e)),
            }
        }
    }
}

/// Injective, filesystem-safe encoding of an identifier as one path segment.
pub fn encode_id(id: &FileId) -> String {
    let mut out = String::with_capacity(id.as_str().len() + 8);
    for c in id.as_str().chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}
