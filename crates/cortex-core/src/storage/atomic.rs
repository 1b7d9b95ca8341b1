use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

/// Replace `path` with `bytes` so readers only ever see the old or the new
/// content: write a sibling temp file, fsync it, rename it over the target.
/// The temp file is removed on any failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::now_v7().simple()));
    let result: io::Result<()> = (|| {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        sync_dir(dir);
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Persist the rename itself. Best effort: not every platform lets you open
/// a directory for syncing.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Whether a file name looks like one of our in-flight temp files:
/// `.<name>.<32 hex>.tmp`.
pub fn is_temp_name(name: &str) -> bool {
    let Some(inner) = name.strip_prefix('.').and_then(|n| n.strip_suffix(".tmp")) else {
        return false;
    };
    match inner.rsplit_once('.') {
        Some((stem, token)) => {
            !stem.is_empty() && token.len() == 32 && token.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Delete temp files a crashed writer left anywhere under `root`.
pub fn cleanup_orphans(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_temp = entry.file_name().to_str().map(is_temp_name).unwrap_or(false);
        if is_temp && fs::remove_file(entry.path()).is_ok() {
            log::warn!("Removed orphaned temp file {}", entry.path().display());
            removed += 1;
        }
    }
    removed
}
