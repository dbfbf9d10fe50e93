//! Core data model for migration runs.
//!
//! This module defines the main data structures:
//! - WorkItem: one source file discovered by the scanner
//! - JournalEntry: the durable per-file record kept by the journal
//! - Stage: the copy engine's state machine
//! - Checkpoint, RunSummary, ScanReport: run-level aggregates

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumValue;

/// Stages of the per-file state machine.
///
/// A recorded stage names the last step that durably completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    OpenTemp,
    StreamCopy,
    Flushed,
    DataSynced,
    Hashed,
    Verified,
    Renamed,
    DestDirSynced,
    SourceRemoved,
    SourceDirSynced,
    Done,
    Failed,
    PermanentlyFailed,
}

impl Stage {
    /// The forward path, in order.
    pub const FORWARD: [Stage; 12] = [
        Stage::Init,
        Stage::OpenTemp,
        Stage::StreamCopy,
        Stage::Flushed,
        Stage::DataSynced,
        Stage::Hashed,
        Stage::Verified,
        Stage::Renamed,
        Stage::DestDirSynced,
        Stage::SourceRemoved,
        Stage::SourceDirSynced,
        Stage::Done,
    ];

    /// Position on the forward path; `None` for the failure states.
    pub fn ordinal(&self) -> Option<usize> {
        Self::FORWARD.iter().position(|s| s == self)
    }

    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::PermanentlyFailed)
    }

    /// Commits of this stage must never be batched.
    ///
    /// Covers every stage that authorizes or follows a destructive step, plus
    /// the failure and terminal states.
    pub fn is_barrier(&self) -> bool {
        !matches!(
            self,
            Stage::Init
                | Stage::OpenTemp
                | Stage::StreamCopy
                | Stage::Flushed
                | Stage::DataSynced
                | Stage::Hashed
        )
    }

    /// True once the source file may already be gone.
    pub fn source_released(&self) -> bool {
        matches!(
            self,
            Stage::SourceRemoved | Stage::SourceDirSynced | Stage::Done
        )
    }

    /// Whether the journal accepts a transition from `self` to `next`.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Stage::Failed, Stage::OpenTemp)
            | (Stage::Failed, Stage::Failed)
            | (Stage::Failed, Stage::PermanentlyFailed) => true,
            (Stage::Failed, _) => false,
            (current, Stage::Failed) | (current, Stage::PermanentlyFailed) => {
                !current.source_released()
            }
            (current, next) => match (current.ordinal(), next.ordinal()) {
                (Some(a), Some(b)) => b >= a,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::OpenTemp => "OPEN_TEMP",
            Stage::StreamCopy => "STREAM_COPY",
            Stage::Flushed => "FLUSHED",
            Stage::DataSynced => "DATA_SYNCED",
            Stage::Hashed => "HASHED",
            Stage::Verified => "VERIFIED",
            Stage::Renamed => "RENAMED",
            Stage::DestDirSynced => "DEST_DIR_SYNCED",
            Stage::SourceRemoved => "SOURCE_REMOVED",
            Stage::SourceDirSynced => "SOURCE_DIR_SYNCED",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
            Stage::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::FORWARD
            .iter()
            .chain([Stage::Failed, Stage::PermanentlyFailed].iter())
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Identifier of a journal entry (the SQLite row id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One source file discovered by the scanner. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Normalized absolute source path
    pub source: PathBuf,

    /// Absolute destination path
    pub destination: PathBuf,

    /// Size observed at scan time
    pub size: u64,

    /// Source modification time at scan time (unix milliseconds)
    pub source_mtime_ms: i64,

    /// When the scanner found this file
    pub discovered_at: DateTime<Utc>,

    /// Digest the content must match, from a checksum manifest
    pub expected_digest: Option<ChecksumValue>,
}

/// The durable per-file record owned by the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: EntryId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
    pub source_mtime_ms: i64,
    pub stage: Stage,
    pub bytes_copied: u64,
    /// Prefix digest while streaming, full digest from FLUSHED on
    pub content_digest: Option<ChecksumValue>,
    pub expected_digest: Option<ChecksumValue>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Cross-device fallback was used; atomicity narrowed for this item
    pub narrowed: bool,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Rebuild the work item this entry tracks.
    pub fn work_item(&self) -> WorkItem {
        WorkItem {
            source: self.source.clone(),
            destination: self.destination.clone(),
            size: self.size,
            source_mtime_ms: self.source_mtime_ms,
            discovered_at: self.discovered_at,
            expected_digest: self.expected_digest.clone(),
        }
    }
}

/// Fields updated alongside a stage commit. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageFields {
    pub bytes_copied: Option<u64>,
    pub content_digest: Option<ChecksumValue>,
    /// Reset `content_digest` to NULL (applied before `content_digest`)
    pub clear_digest: bool,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
    pub destination: Option<PathBuf>,
    pub narrowed: Option<bool>,
}

impl StageFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, bytes_copied: u64) -> Self {
        self.bytes_copied = Some(bytes_copied);
        self
    }

    pub fn digest(mut self, digest: ChecksumValue) -> Self {
        self.content_digest = Some(digest);
        self
    }

    pub fn clear_digest(mut self) -> Self {
        self.clear_digest = true;
        self
    }

    pub fn retries(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn narrowed(mut self, narrowed: bool) -> Self {
        self.narrowed = Some(narrowed);
        self
    }

    /// Apply these fields to an in-memory entry, mirroring the SQL update.
    pub fn apply_to(&self, entry: &mut JournalEntry) {
        if let Some(bytes) = self.bytes_copied {
            entry.bytes_copied = bytes;
        }
        if self.clear_digest {
            entry.content_digest = None;
        }
        if let Some(ref digest) = self.content_digest {
            entry.content_digest = Some(digest.clone());
        }
        if let Some(count) = self.retry_count {
            entry.retry_count = count;
        }
        if let Some(ref message) = self.last_error {
            entry.last_error = Some(message.clone());
        }
        if let Some(ref destination) = self.destination {
            entry.destination = destination.clone();
        }
        if let Some(narrowed) = self.narrowed {
            entry.narrowed = narrowed;
        }
    }
}

/// Aggregate progress counters; derived from the journal, never authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub files_done: u64,
    pub bytes_done: u64,
    pub files_failed: u64,
}

/// How a single item ended within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Migrated; source removed
    Done { bytes: u64, narrowed: bool },
    /// Retry budget exhausted
    PermanentlyFailed { error: String },
    /// Left pending for a later run (no space, post-removal error)
    Deferred { error: String },
    /// Stop requested; the item is at a clean transition boundary
    Interrupted,
}

/// A permanently failed path and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub source: PathBuf,
    pub error: String,
    pub retry_count: u32,
}

/// Result of a dry-run scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Entries already in the journal and not yet terminal
    pub resumable_files: u64,
    pub resumable_bytes: u64,
    /// Files the differential walk would add
    pub new_files: u64,
    pub new_bytes: u64,
    /// Files skipped because a terminal entry already covers them
    pub already_done: u64,
}

impl ScanReport {
    pub fn total_files(&self) -> u64 {
        self.resumable_files + self.new_files
    }

    pub fn total_bytes(&self) -> u64 {
        self.resumable_bytes + self.new_bytes
    }
}

/// Outcome of a complete run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_done: u64,
    pub bytes_done: u64,
    pub files_permanently_failed: u64,
    pub files_deferred: u64,
    pub files_interrupted: u64,
    /// Every PERMANENTLY_FAILED entry in the journal, not just this run's
    pub permanently_failed: Vec<FailedItem>,
    /// Sources migrated this run through the cross-device fallback
    pub narrowed: Vec<PathBuf>,
    pub checkpoint: Checkpoint,
    /// A stop request ended the run early
    pub stopped: bool,
    /// Journal entries that are still not terminal after the run
    pub remaining: u64,
}

impl RunSummary {
    /// 0 when everything is DONE, 1 when failures or unfinished items remain.
    ///
    /// Fatal errors never produce a summary; callers map them to 2.
    pub fn exit_code(&self) -> i32 {
        if self.permanently_failed.is_empty() && self.remaining == 0 && !self.stopped {
            0
        } else {
            1
        }
    }
}

/// Where things live for one root pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLayout {
    /// Canonical source root
    pub source_root: PathBuf,

    /// Canonical destination root as given
    pub destination_root: PathBuf,

    /// Root under which relative source paths are mirrored
    pub mirror_root: PathBuf,

    /// Journal and lock directory
    pub state_dir: PathBuf,
}

impl TreeLayout {
    /// Destination mirror of a source path; `None` if outside the source root.
    pub fn destination_for(&self, source: &Path) -> Option<PathBuf> {
        source
            .strip_prefix(&self.source_root)
            .ok()
            .map(|rel| self.mirror_root.join(rel))
    }

    /// Path relative to the source root, for manifests.
    pub fn relative_source<'a>(&self, source: &'a Path) -> Option<&'a Path> {
        source.strip_prefix(&self.source_root).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_are_monotonic() {
        assert!(Stage::Init.can_advance_to(Stage::OpenTemp));
        assert!(Stage::StreamCopy.can_advance_to(Stage::StreamCopy));
        assert!(Stage::Hashed.can_advance_to(Stage::Verified));
        assert!(!Stage::Verified.can_advance_to(Stage::StreamCopy));
        assert!(!Stage::Done.can_advance_to(Stage::Done));
    }

    #[test]
    fn test_failure_loop_transitions() {
        assert!(Stage::Verified.can_advance_to(Stage::Failed));
        assert!(Stage::Failed.can_advance_to(Stage::OpenTemp));
        assert!(Stage::Failed.can_advance_to(Stage::PermanentlyFailed));
        assert!(!Stage::Failed.can_advance_to(Stage::StreamCopy));
        // once the source is gone the destination must never be discarded
        assert!(!Stage::SourceRemoved.can_advance_to(Stage::Failed));
        assert!(!Stage::PermanentlyFailed.can_advance_to(Stage::OpenTemp));
    }

    #[test]
    fn test_stage_round_trip_names() {
        for stage in Stage::FORWARD
            .iter()
            .chain([Stage::Failed, Stage::PermanentlyFailed].iter())
        {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(*stage));
        }
        assert!("BOGUS".parse::<Stage>().is_err());
    }

    #[test]
    fn test_barrier_stages() {
        assert!(!Stage::StreamCopy.is_barrier());
        assert!(Stage::Verified.is_barrier());
        assert!(Stage::DestDirSynced.is_barrier());
        assert!(Stage::Done.is_barrier());
        assert!(Stage::Failed.is_barrier());
    }

    #[test]
    fn test_layout_mirrors_relative_paths() {
        let layout = TreeLayout {
            source_root: PathBuf::from("/src/X"),
            destination_root: PathBuf::from("/dst"),
            mirror_root: PathBuf::from("/dst/X"),
            state_dir: PathBuf::from("/dst/.safemove"),
        };
        assert_eq!(
            layout.destination_for(Path::new("/src/X/a/b.mkv")),
            Some(PathBuf::from("/dst/X/a/b.mkv"))
        );
        assert_eq!(layout.destination_for(Path::new("/elsewhere/b.mkv")), None);
    }

    #[test]
    fn test_exit_code() {
        let mut summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            files_done: 3,
            bytes_done: 30,
            files_permanently_failed: 0,
            files_deferred: 0,
            files_interrupted: 0,
            permanently_failed: Vec::new(),
            narrowed: Vec::new(),
            checkpoint: Checkpoint::default(),
            stopped: false,
            remaining: 0,
        };
        assert_eq!(summary.exit_code(), 0);

        summary.permanently_failed.push(FailedItem {
            source: PathBuf::from("/src/a"),
            error: "mismatch".to_string(),
            retry_count: 3,
        });
        assert_eq!(summary.exit_code(), 1);
    }
}
