//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! migration engine from any specific front-end. Callbacks are invoked from
//! worker threads, so implementations must be `Sync`.

use std::path::Path;

use crate::model::{Checkpoint, ItemOutcome, JournalEntry, RunSummary, ScanReport};

/// Trait for receiving progress updates from a migration run.
///
/// Every method has an empty default so reporters implement only what they
/// display.
pub trait ProgressCallback: Send + Sync {
    /// Called once the run lock is held and the checkpoint is loaded.
    fn on_run_started(&self, _checkpoint: &Checkpoint) {}

    /// Called after a dry-run scan.
    fn on_scan_completed(&self, _report: &ScanReport) {}

    /// Called when a worker picks up an entry.
    fn on_item_started(&self, _entry: &JournalEntry) {}

    /// Called at each streaming progress commit.
    fn on_item_progress(&self, _source: &Path, _bytes_copied: u64, _size: u64) {}

    /// Called after a failed attempt that will be retried.
    fn on_item_retry(&self, _source: &Path, _attempt: u32, _error: &str) {}

    /// Called when a worker is finished with an entry for this run.
    fn on_item_finished(&self, _source: &Path, _outcome: &ItemOutcome) {}

    /// Called when the run ends without a fatal error.
    fn on_run_completed(&self, _summary: &RunSummary) {}
}
