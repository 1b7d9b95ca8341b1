use crate::error::{CortexError, Result};
use crate::storage::paths::encode_id;
use crate::types::FileId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

const MARKER_POLL: Duration = Duration::from_millis(10);

/// Exclusive per-file write locks with bounded waits.
///
/// Exclusivity inside the process comes from the `held` table. Each held lock
/// also drops an advisory marker file (`<encoded-id>.lock`, holding PID and
/// acquisition time) so another process, or a human, can see it.
pub struct LockManager {
    lock_dir: PathBuf,
    timeout: Duration,
    stale_after: Duration,
    held: Mutex<HashSet<FileId>>,
    released: Condvar,
}

/// Held write lock. Releases on drop.
#[derive(Debug)]
pub struct WriteLock<'a> {
    manager: &'a LockManager,
    id: FileId,
    marker: Option<PathBuf>,
}

impl WriteLock<'_> {
    pub fn id(&self) -> &FileId {
        &self.id
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            let _ = fs::remove_file(marker);
        }
        let mut held = self.manager.held.lock();
        held.remove(&self.id);
        self.manager.released.notify_all();
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_dir", &self.lock_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, timeout: Duration, stale_after: Duration) -> Result<Self> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_dir,
            timeout,
            stale_after,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_locked(&self, id: &FileId) -> bool {
        self.held.lock().contains(id)
    }

    /// Block until the lock for `id` is ours, or fail with `LockTimeout`.
    pub fn acquire(&self, id: &FileId) -> Result<WriteLock<'_>> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        {
            let mut held = self.held.lock();
            while held.contains(id) {
                if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(id) {
                    return Err(CortexError::LockTimeout {
                        id: id.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
            held.insert(id.clone());
        }

        // From here on the guard owns the in-process slot; dropping it on an
        // error path releases the slot again.
        let mut guard = WriteLock {
            manager: self,
            id: id.clone(),
            marker: None,
        };
        guard.marker = Some(self.create_marker(id, started, deadline)?);
        Ok(guard)
    }

    fn marker_path(&self, id: &FileId) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", encode_id(id)))
    }

    fn create_marker(&self, id: &FileId, started: Instant, deadline: Instant) -> Result<PathBuf> {
        let path = self.marker_path(id);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    writeln!(file, "{}", chrono::Utc::now().to_rfc3339())?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.is_stale(&path) {
                        log::warn!("Removing stale lock marker {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(CortexError::LockTimeout {
                            id: id.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    std::thread::sleep(MARKER_POLL);
                }
                Err(e) => return Err(CortexError::Io(e)),
            }
        }
    }

    /// A marker is stale when its owner is gone, or when it belongs to some
    /// other process and is older than `stale_after`.
    fn is_stale(&self, path: &Path) -> bool {
        let owner = fs::read_to_string(path)
            .ok()
            .and_then(|text| text.lines().next().and_then(|l| l.trim().parse::<u32>().ok()));
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);

        match owner {
            Some(pid) if pid == std::process::id() => false,
            Some(pid) => !process_alive(pid) || age > self.stale_after,
            None => age > self.stale_after,
        }
    }

    /// Startup sweep: delete markers left behind by crashed writers.
    /// Returns how many were removed.
    pub fn cleanup_stale(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.lock_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if self.is_stale(&path) && fs::remove_file(&path).is_ok() {
                log::warn!("Removed stale lock marker {}", path.display());
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, fall back to the age rule.
    true
}
