//! Job orchestration module.
//!
//! This module provides the main job lifecycle functions:
//! - Creating a job from a configuration (validating and canonicalizing roots)
//! - Planning a job (a dry-run scan that mutates nothing)
//! - Running a job (lock, scan, dispatch, checkpoint, summarize)
//!
//! The run lock is taken before anything else, so a run that loses the race
//! for a root pair exits with `LockHeld` without touching the journal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::checksums::{generate_checksum_file, parse_checksum_file, ChecksumValue};
use crate::config::MigrationConfig;
use crate::copier::CopyEngine;
use crate::error::MigrateError;
use crate::fs_ops;
use crate::journal::{BatchPolicy, Journal};
use crate::lock::{pair_key, RunLock};
use crate::model::{Checkpoint, FailedItem, ItemOutcome, RunSummary, ScanReport, TreeLayout};
use crate::pool;
use crate::progress::ProgressCallback;
use crate::scanner::Scanner;

const JOURNAL_FILE: &str = "journal.sqlite3";
const STATE_DIR: &str = ".safemove";

/// A migration between one source root and one destination root.
#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub id: Uuid,
    pub config: MigrationConfig,
    pub layout: TreeLayout,
    /// Stop flag; cancel it (e.g. from a signal handler) to end the run at
    /// the next transition boundary.
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
    pub last_summary: Option<RunSummary>,
}

impl MigrationJob {
    pub fn journal_path(&self) -> PathBuf {
        self.layout.state_dir.join(JOURNAL_FILE)
    }

    fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_items: self.config.journal_batch_size,
            max_delay: self.config.journal_batch_interval(),
        }
    }

    fn lock(&self, run_id: Uuid) -> Result<RunLock, MigrateError> {
        RunLock::acquire(
            &self.layout.state_dir,
            &self.layout.source_root,
            &self.layout.destination_root,
            run_id,
        )
    }
}

/// Create a new migration job.
///
/// Validates the configuration, requires the source to be an existing
/// directory and creates the destination root if it is missing.
///
/// # Errors
/// `Config`, `SourceNotFound` or `InvalidPath` for unusable settings; `Io`
/// if the destination cannot be created.
pub fn create_job(config: MigrationConfig) -> Result<MigrationJob, MigrateError> {
    config.validate()?;

    let source_root = match std::fs::canonicalize(&config.source) {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MigrateError::SourceNotFound {
                path: config.source.clone(),
            })
        }
        Err(e) => return Err(MigrateError::io(&config.source, e)),
    };
    if !source_root.is_dir() {
        return Err(MigrateError::InvalidPath {
            path: source_root,
            reason: "source must be a directory".to_string(),
        });
    }

    fs_ops::ensure_dir_durable(&config.destination)
        .map_err(|e| MigrateError::io(&config.destination, e))?;
    let destination_root = std::fs::canonicalize(&config.destination)
        .map_err(|e| MigrateError::io(&config.destination, e))?;

    let mirror_root = if config.keep_root_dir {
        let leaf = source_root
            .file_name()
            .ok_or_else(|| MigrateError::InvalidPath {
                path: source_root.clone(),
                reason: "source root has no name to keep".to_string(),
            })?;
        destination_root.join(leaf)
    } else {
        destination_root.clone()
    };
    if mirror_root == source_root {
        return Err(MigrateError::InvalidPath {
            path: destination_root,
            reason: "destination would mirror onto the source itself".to_string(),
        });
    }

    let state_dir = match &config.state_dir {
        Some(dir) => {
            fs_ops::ensure_dir_durable(dir).map_err(|e| MigrateError::io(dir, e))?;
            std::fs::canonicalize(dir).map_err(|e| MigrateError::io(dir, e))?
        }
        None => destination_root.join(STATE_DIR),
    };

    debug!(source = %source_root.display(), destination = %destination_root.display(),
        state_dir = %state_dir.display(), "job created");

    Ok(MigrationJob {
        id: Uuid::new_v4(),
        layout: TreeLayout {
            source_root,
            destination_root,
            mirror_root,
            state_dir,
        },
        config,
        cancel: CancellationToken::new(),
        created_at: Utc::now(),
        last_summary: None,
    })
}

/// Plan a job: count what a run would do.
///
/// Takes the run lock like a real run, but never writes the journal. A pair
/// without a journal is planned against an empty in-memory one.
pub fn plan_job(job: &MigrationJob) -> Result<ScanReport, MigrateError> {
    let _lock = job.lock(job.id)?;

    let mut config = job.config.clone();
    let expected = load_expected(&mut config)?;

    let journal_path = job.journal_path();
    let journal = if journal_path.exists() {
        Journal::open(&journal_path, config.durability, job.batch_policy())?
    } else {
        Journal::open_in_memory(job.batch_policy())?
    };

    let report = Scanner::new(&journal, &job.layout, &config, &expected).plan()?;
    info!(
        resumable = report.resumable_files,
        new = report.new_files,
        already_done = report.already_done,
        bytes = report.total_bytes(),
        "scan planned"
    );
    Ok(report)
}

/// Run a job to completion, or until stopped.
///
/// Per-item failures end up in the summary; only run-fatal conditions (lock
/// held, journal unavailable, invalid configuration, unrecoverable I/O) are
/// returned as errors. The run lock is released on every exit path.
pub fn run_job(
    job: &mut MigrationJob,
    progress: Option<&dyn ProgressCallback>,
) -> Result<RunSummary, MigrateError> {
    if job.config.dry_run {
        return Err(MigrateError::Config(
            "dry run requested; use plan_job".to_string(),
        ));
    }

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let lock = job.lock(run_id)?;

    let mut config = job.config.clone();
    let expected = load_expected(&mut config)?;
    let layout = &job.layout;

    let journal = Journal::open(&job.journal_path(), config.durability, job.batch_policy())?;
    let key = pair_key(&layout.source_root, &layout.destination_root);
    let checkpoint = match journal.load_checkpoint(&key)? {
        Some(checkpoint) => checkpoint,
        None => journal.recount()?,
    };

    info!(%run_id, source = %layout.source_root.display(), destination = %layout.destination_root.display(),
        files_done = checkpoint.files_done, "run started");
    if let Some(progress) = progress {
        progress.on_run_started(&checkpoint);
    }

    let run_cancel = job.cancel.child();
    let tally = Tally::new(&journal, &key, checkpoint, &config);
    let scanner = Scanner::new(&journal, layout, &config, &expected);

    let dispatched = pool::run(
        &config,
        &run_cancel,
        |dispatcher| scanner.run(&run_cancel, |entry| dispatcher.dispatch(entry)),
        |entry| {
            if let Some(progress) = progress {
                progress.on_item_started(&entry);
            }
            let source = entry.source.clone();
            let outcome =
                CopyEngine::new(&journal, &config, &run_cancel, progress).migrate(entry)?;
            if let Some(progress) = progress {
                progress.on_item_finished(&source, &outcome);
            }
            tally.record(&source, &outcome)
        },
    );

    if let Err(e) = dispatched {
        if let Err(flush_error) = journal.flush() {
            warn!(error = %flush_error, "failed to flush journal after fatal error");
        }
        return Err(e);
    }

    journal.flush()?;
    let stopped = job.cancel.is_cancelled();
    let checkpoint = journal.recount()?;
    journal.save_checkpoint(&key, &checkpoint)?;

    if !stopped {
        if let Some(path) = &config.write_manifest {
            write_manifest(&journal, layout, &config, path)?;
        }
    }

    let permanently_failed = journal
        .permanently_failed()?
        .into_iter()
        .map(|entry| FailedItem {
            source: entry.source,
            error: entry.last_error.unwrap_or_default(),
            retry_count: entry.retry_count,
        })
        .collect();
    let remaining = journal.remaining()?;
    let counts = tally.finish();

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        files_done: counts.files_done,
        bytes_done: counts.bytes_done,
        files_permanently_failed: counts.failed,
        files_deferred: counts.deferred,
        files_interrupted: counts.interrupted,
        permanently_failed,
        narrowed: counts.narrowed,
        checkpoint,
        stopped,
        remaining,
    };
    lock.release()?;

    info!(
        %run_id,
        files_done = summary.files_done,
        bytes_done = summary.bytes_done,
        permanently_failed = summary.files_permanently_failed,
        deferred = summary.files_deferred,
        remaining = summary.remaining,
        stopped,
        "run finished"
    );
    if let Some(progress) = progress {
        progress.on_run_completed(&summary);
    }
    job.last_summary = Some(summary.clone());
    Ok(summary)
}

/// Read the input manifest, if any. A manifest that names its algorithm
/// switches the streaming digest to match.
fn load_expected(
    config: &mut MigrationConfig,
) -> Result<HashMap<PathBuf, ChecksumValue>, MigrateError> {
    let path = match &config.manifest {
        Some(path) => path.clone(),
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path).map_err(|e| MigrateError::io(&path, e))?;
    let (algorithm, digests) = parse_checksum_file(&content, config.digest)
        .map_err(|e| MigrateError::Config(format!("{}: {}", path.display(), e)))?;
    if algorithm != config.digest {
        info!(manifest = %path.display(), %algorithm, "using the manifest's digest algorithm");
        config.digest = algorithm;
    }
    debug!(manifest = %path.display(), entries = digests.len(), "manifest loaded");
    Ok(digests)
}

/// Write a manifest of every DONE entry, relative to the destination root.
fn write_manifest(
    journal: &Journal,
    layout: &TreeLayout,
    config: &MigrationConfig,
    path: &Path,
) -> Result<(), MigrateError> {
    let mut lines = Vec::new();
    for entry in journal.completed() {
        let entry = entry?;
        let digest = match entry.content_digest {
            Some(digest) if digest.algorithm() == config.digest => digest,
            _ => {
                warn!(source = %entry.source.display(),
                    "no {} digest recorded, left out of manifest", config.digest);
                continue;
            }
        };
        let relative = entry
            .destination
            .strip_prefix(&layout.destination_root)
            .unwrap_or(&entry.destination)
            .to_string_lossy()
            .into_owned();
        lines.push((relative, digest));
    }

    let content = generate_checksum_file(&lines, config.digest);
    fs_ops::write_atomic(path, content.as_bytes()).map_err(|e| MigrateError::io(path, e))?;
    info!(manifest = %path.display(), files = lines.len(), "manifest written");
    Ok(())
}

/// Per-run counters, shared by the workers.
struct Tally<'a> {
    journal: &'a Journal,
    pair_key: &'a str,
    every_items: u64,
    interval: Duration,
    state: Mutex<TallyState>,
}

struct TallyState {
    checkpoint: Checkpoint,
    since_save: u64,
    last_save: Instant,
    counts: RunCounts,
}

#[derive(Default)]
struct RunCounts {
    files_done: u64,
    bytes_done: u64,
    failed: u64,
    deferred: u64,
    interrupted: u64,
    narrowed: Vec<PathBuf>,
}

impl<'a> Tally<'a> {
    fn new(
        journal: &'a Journal,
        pair_key: &'a str,
        checkpoint: Checkpoint,
        config: &MigrationConfig,
    ) -> Self {
        Tally {
            journal,
            pair_key,
            every_items: config.checkpoint_every_items,
            interval: config.checkpoint_interval(),
            state: Mutex::new(TallyState {
                checkpoint,
                since_save: 0,
                last_save: Instant::now(),
                counts: RunCounts::default(),
            }),
        }
    }

    /// Count one finished item; persist the checkpoint every N items or T.
    fn record(&self, source: &Path, outcome: &ItemOutcome) -> Result<(), MigrateError> {
        let mut state = self.state.lock();
        match outcome {
            ItemOutcome::Done { bytes, narrowed } => {
                state.counts.files_done += 1;
                state.counts.bytes_done += bytes;
                state.checkpoint.files_done += 1;
                state.checkpoint.bytes_done += bytes;
                if *narrowed {
                    state.counts.narrowed.push(source.to_path_buf());
                }
            }
            ItemOutcome::PermanentlyFailed { .. } => {
                state.counts.failed += 1;
                state.checkpoint.files_failed += 1;
            }
            ItemOutcome::Deferred { .. } => state.counts.deferred += 1,
            ItemOutcome::Interrupted => state.counts.interrupted += 1,
        }

        state.since_save += 1;
        if state.since_save >= self.every_items || state.last_save.elapsed() >= self.interval {
            self.journal.save_checkpoint(self.pair_key, &state.checkpoint)?;
            state.since_save = 0;
            state.last_save = Instant::now();
            debug!(files_done = state.checkpoint.files_done, "checkpoint saved");
        }
        Ok(())
    }

    fn finish(self) -> RunCounts {
        self.state.into_inner().counts
    }
}
