//! Error types for the migration engine.
//!
//! `MigrateError` covers both run-level failures (which stop the run) and the
//! per-item conditions the copy engine classifies into retry, defer or
//! permanent failure. Per-item errors never escape the copy engine except as
//! a recorded `last_error` on the journal entry.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::Stage;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Momentary I/O failure or stalled operation; retried at item granularity.
    #[error("transient I/O failure on {}: {source}", .path.display())]
    TransientIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Size or digest mismatch.
    #[error("content mismatch for {}: {reason}", .path.display())]
    Corruption { path: PathBuf, reason: String },

    /// Atomic rename is not possible between the two paths.
    #[error("atomic rename unsupported from {} to {}", .from.display(), .to.display())]
    CrossDevice { from: PathBuf, to: PathBuf },

    /// Bookkeeping is unavailable; no further progress is safe.
    #[error("journal unavailable: {0}")]
    Journal(#[from] JournalError),

    /// Another run holds the lock for this root pair.
    #[error("another run is migrating {} -> {}{}", .source_root.display(), .destination_root.display(), .holder.map(|pid| format!(" (pid {pid})")).unwrap_or_default())]
    LockHeld {
        source_root: PathBuf,
        destination_root: PathBuf,
        holder: Option<u32>,
    },

    /// Not enough free space on the destination to keep the configured reserve.
    #[error("insufficient space at {}: need {needed} bytes, {available} available", .path.display())]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    /// Source root or source file does not exist.
    #[error("source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    /// Path is unusable for the requested operation.
    #[error("invalid path {}: {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Run-level I/O failure (state directory, lock file, manifest).
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MigrateError {
    /// Wrap an I/O error from a per-item operation.
    ///
    /// `ENOSPC` becomes `InsufficientSpace` so the item is deferred instead of
    /// burning retries.
    pub fn transient(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if is_no_space(&source) {
            return MigrateError::InsufficientSpace {
                path,
                needed: 0,
                available: 0,
            };
        }
        MigrateError::TransientIo { path, source }
    }

    /// Wrap an I/O error from a run-level operation.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MigrateError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Journal(_)
                | Self::LockHeld { .. }
                | Self::Config(_)
                | Self::Io { .. }
                | Self::InvalidPath { .. }
        )
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::TransientIo { source, .. } | Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Errors from the journal store.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stage transition for entry {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: Stage, to: Stage },

    #[error("unknown journal entry {0}")]
    UnknownEntry(i64),

    #[error("corrupt journal record: {0}")]
    Corrupt(String),

    #[error("journal I/O: {0}")]
    Io(#[from] io::Error),
}

/// Whether an I/O error means the device is full.
pub fn is_no_space(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    #[cfg(windows)]
    {
        // ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL
        if matches!(err.raw_os_error(), Some(112) | Some(39)) {
            return true;
        }
    }
    false
}

/// Whether an I/O error reports a rename across devices.
pub fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EXDEV)
    }
    #[cfg(windows)]
    {
        // ERROR_NOT_SAME_DEVICE
        err.raw_os_error() == Some(17)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}
