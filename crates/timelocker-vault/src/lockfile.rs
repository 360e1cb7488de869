use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::VaultError;

const LOCK_FILE: &str = "credentials.lock";
/// A writer holds the lock only for one load-modify-save cycle; anything
/// older than this is a crashed process.
const STALE_AFTER: Duration = Duration::from_secs(60);
const ACQUIRE_RETRIES: u32 = 50;
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

/// Cross-process writer lock for the vault directory, released on drop.
///
/// Holds a JSON marker file describing the owner so a conflicting process can
/// report who is holding the lock, and so stale locks from crashed processes
/// can be reclaimed.
#[derive(Debug)]
pub struct VaultLock {
    path: PathBuf,
}

impl VaultLock {
    /// Acquire the writer lock, waiting briefly for a concurrent writer to
    /// finish and reclaiming stale locks.
    pub fn acquire(dir: &Path) -> Result<Self, VaultError> {
        let path = dir.join(LOCK_FILE);

        for attempt in 0..ACQUIRE_RETRIES {
            match Self::try_create(&path) {
                Ok(lock) => return Ok(lock),
                Err(owner) => {
                    if let Some(owner) = &owner {
                        let age = Utc::now() - owner.acquired_at;
                        if age.num_seconds().unsigned_abs() > STALE_AFTER.as_secs() {
                            warn!(pid = owner.pid, "reclaiming stale vault lock");
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                        if attempt + 1 == ACQUIRE_RETRIES {
                            return Err(VaultError::LockConflict {
                                pid: owner.pid,
                                hostname: owner.hostname.clone(),
                            });
                        }
                    } else {
                        // Unreadable marker: created a moment ago or corrupt.
                        // Retry; reclaim if it never becomes readable.
                        if attempt + 1 == ACQUIRE_RETRIES {
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }

        Err(VaultError::Manager("could not acquire vault lock".into()))
    }

    /// Try to create the marker exclusively; on conflict, return the current
    /// owner when readable.
    fn try_create(path: &Path) -> Result<Self, Option<LockOwner>> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);

        match options.open(path) {
            Ok(file) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    hostname: gethostname::gethostname().to_string_lossy().to_string(),
                    acquired_at: Utc::now(),
                };
                let json = serde_json::to_string(&owner).unwrap_or_default();
                use std::io::Write;
                let mut file = file;
                let _ = file.write_all(json.as_bytes());
                let _ = file.sync_all();
                debug!(path = %path.display(), "vault lock acquired");
                Ok(Self { path: path.to_path_buf() })
            }
            Err(_) => {
                let owner = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|content| serde_json::from_str(&content).ok());
                Err(owner)
            }
        }
    }
}

impl Drop for VaultLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not release vault lock");
            }
        }
    }
}
