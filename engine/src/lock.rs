//! Run lock over a (source root, destination root) pair.
//!
//! An advisory exclusive lock on `<state_dir>/locks/<pair-key>.lock`. The OS
//! drops the lock when the holder exits, so a crashed run never leaves a
//! stale lock behind. The JSON body only identifies the holder in error
//! messages. The file itself is left in place on release: unlinking a lock
//! file another process has already opened would let two runs lock
//! different inodes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MigrateError;

/// Diagnostic content of a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// A held run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
    info: LockInfo,
}

impl RunLock {
    /// Take the lock without blocking.
    ///
    /// Fails with `LockHeld` if another run owns the pair. Nothing outside
    /// `<state_dir>/locks` is touched before the lock is held.
    pub fn acquire(
        state_dir: &Path,
        source: &Path,
        destination: &Path,
        run_id: Uuid,
    ) -> Result<Self, MigrateError> {
        let locks_dir = state_dir.join("locks");
        std::fs::create_dir_all(&locks_dir).map_err(|e| MigrateError::io(&locks_dir, e))?;
        let path = locks_dir.join(format!("{}.lock", pair_key(source, destination)));

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| MigrateError::io(&path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                let holder = read_info(&mut file).map(|info| info.pid);
                return Err(MigrateError::LockHeld {
                    source_root: source.to_path_buf(),
                    destination_root: destination.to_path_buf(),
                    holder,
                });
            }
            return Err(MigrateError::io(&path, e));
        }

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
            run_id,
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        };
        write_info(&mut file, &info).map_err(|e| MigrateError::io(&path, e))?;
        debug!(lock = %path.display(), %run_id, "run lock acquired");

        Ok(RunLock { path, file, info })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release explicitly; errors are reported instead of swallowed.
    pub fn release(self) -> Result<(), MigrateError> {
        FileExt::unlock(&self.file).map_err(|e| MigrateError::io(&self.path, e))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// Stable identifier of a root pair: first 16 bytes of
/// BLAKE3(source NUL destination), hex.
pub fn pair_key(source: &Path, destination: &Path) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(&[0]);
    hasher.update(destination.to_string_lossy().as_bytes());
    hasher.finalize().as_bytes()[..16]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn write_info(file: &mut File, info: &LockInfo) -> std::io::Result<()> {
    let body = serde_json::to_vec(info)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&body)?;
    file.sync_all()
}

fn read_info(file: &mut File) -> Option<LockInfo> {
    let mut body = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut body).ok()?;
    serde_json::from_str(&body).ok()
}
