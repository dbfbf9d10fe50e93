//! Copy engine: the per-file migration state machine.
//!
//! ```text
//! INIT -> OPEN_TEMP -> STREAM_COPY -> FLUSHED -> DATA_SYNCED -> HASHED
//!      -> VERIFIED -> RENAMED -> DEST_DIR_SYNCED -> SOURCE_REMOVED
//!      -> SOURCE_DIR_SYNCED -> DONE
//! ```
//!
//! A recorded stage names the last step that durably completed, so resuming
//! an entry means performing the step after its recorded stage. Each
//! destructive step (rename, source removal) runs only after a barrier
//! commit of the stage that authorizes it.
//!
//! Failures before SOURCE_REMOVED clean up destination artifacts and go
//! through FAILED, retried with backoff until `max_retries` is exceeded.
//! Failures after it never touch the destination; the entry keeps its stage
//! and is picked up again by the next run.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::checksums::{create_hasher, ChecksumHasher, ChecksumValue};
use crate::config::MigrationConfig;
use crate::error::{is_cross_device, MigrateError};
use crate::failpoint::{self, FailSite};
use crate::fs_ops;
use crate::journal::Journal;
use crate::model::{ItemOutcome, JournalEntry, Stage, StageFields};
use crate::progress::ProgressCallback;
use crate::verifier;
use crate::watchdog::Watchdog;

/// Why an attempt stopped short of DONE.
enum Halt {
    /// Stop requested; the entry sits at a clean boundary
    Interrupted,
    Failed(MigrateError),
}

impl From<MigrateError> for Halt {
    fn from(err: MigrateError) -> Self {
        Halt::Failed(err)
    }
}

impl From<crate::error::JournalError> for Halt {
    fn from(err: crate::error::JournalError) -> Self {
        Halt::Failed(MigrateError::Journal(err))
    }
}

/// In-memory state of one attempt; rebuilt from the journal on resume.
#[derive(Default)]
struct Scratch {
    temp: Option<Arc<File>>,
    hasher: Option<Box<dyn ChecksumHasher>>,
    source_meta: Option<Metadata>,
}

/// Drives journal entries through the state machine.
pub struct CopyEngine<'a> {
    journal: &'a Journal,
    config: &'a MigrationConfig,
    cancel: &'a CancellationToken,
    progress: Option<&'a dyn ProgressCallback>,
}

impl<'a> CopyEngine<'a> {
    pub fn new(
        journal: &'a Journal,
        config: &'a MigrationConfig,
        cancel: &'a CancellationToken,
        progress: Option<&'a dyn ProgressCallback>,
    ) -> Self {
        CopyEngine {
            journal,
            config,
            cancel,
            progress,
        }
    }

    /// Take one entry as far as this run can.
    ///
    /// Per-item failures are recorded in the journal and reported through
    /// the outcome; only run-fatal errors are returned as `Err`.
    pub fn migrate(&self, mut entry: JournalEntry) -> Result<ItemOutcome, MigrateError> {
        match entry.stage {
            Stage::Done => {
                return Ok(ItemOutcome::Done {
                    bytes: entry.size,
                    narrowed: entry.narrowed,
                })
            }
            Stage::PermanentlyFailed => {
                return Ok(ItemOutcome::PermanentlyFailed {
                    error: entry.last_error.unwrap_or_default(),
                })
            }
            Stage::Failed if entry.retry_count > self.config.max_retries => {
                // crashed between the last FAILED commit and the permanent one
                let error = entry.last_error.clone().unwrap_or_default();
                self.commit(&mut entry, Stage::PermanentlyFailed, StageFields::new())?;
                return Ok(ItemOutcome::PermanentlyFailed { error });
            }
            _ => {}
        }

        loop {
            let halt = match self.attempt(&mut entry) {
                Ok(()) => {
                    return Ok(ItemOutcome::Done {
                        bytes: entry.size,
                        narrowed: entry.narrowed,
                    })
                }
                Err(halt) => halt,
            };

            let err = match halt {
                Halt::Interrupted => return Ok(ItemOutcome::Interrupted),
                Halt::Failed(err) if err.is_fatal() => return Err(err),
                Halt::Failed(err) => err,
            };

            if let Some(outcome) = self.handle_failure(&mut entry, err)? {
                return Ok(outcome);
            }

            let backoff = self.config.retry_backoff(entry.retry_count);
            if self.cancel.wait_timeout(backoff) {
                return Ok(ItemOutcome::Interrupted);
            }
        }
    }

    /// Record a failed attempt. `None` means retry.
    fn handle_failure(
        &self,
        entry: &mut JournalEntry,
        err: MigrateError,
    ) -> Result<Option<ItemOutcome>, MigrateError> {
        let message = err.to_string();

        if entry.stage.source_released() {
            warn!(source = %entry.source.display(), stage = %entry.stage, error = %message,
                "failure after source removal, deferring to next run");
            let stage = entry.stage;
            self.commit(entry, stage, StageFields::new().error(&message))?;
            return Ok(Some(ItemOutcome::Deferred { error: message }));
        }

        self.cleanup(entry);

        match err {
            MigrateError::InsufficientSpace { .. } => {
                warn!(source = %entry.source.display(), error = %message,
                    "insufficient space, deferring item");
                self.commit(entry, Stage::Failed, StageFields::new().error(&message))?;
                Ok(Some(ItemOutcome::Deferred { error: message }))
            }
            MigrateError::SourceNotFound { .. } => {
                warn!(source = %entry.source.display(), "source vanished before it was copied");
                self.commit(
                    entry,
                    Stage::PermanentlyFailed,
                    StageFields::new().error(&message),
                )?;
                Ok(Some(ItemOutcome::PermanentlyFailed { error: message }))
            }
            _ => {
                let attempt = entry.retry_count + 1;
                self.commit(
                    entry,
                    Stage::Failed,
                    StageFields::new().retries(attempt).error(&message),
                )?;
                if attempt > self.config.max_retries {
                    warn!(source = %entry.source.display(), attempts = attempt, error = %message,
                        "retries exhausted, item permanently failed");
                    self.commit(entry, Stage::PermanentlyFailed, StageFields::new())?;
                    return Ok(Some(ItemOutcome::PermanentlyFailed { error: message }));
                }
                warn!(source = %entry.source.display(), attempt, error = %message, "attempt failed, retrying");
                if let Some(progress) = self.progress {
                    progress.on_item_retry(&entry.source, attempt, &message);
                }
                Ok(None)
            }
        }
    }

    /// Delete what this entry may have written at the destination.
    ///
    /// The final destination file is removed only when this entry is known
    /// to have created it.
    fn cleanup(&self, entry: &JournalEntry) {
        let temp = fs_ops::temp_path_for(&entry.destination);
        if let Err(e) = fs_ops::remove_file_if_exists(&temp) {
            warn!(temp = %temp.display(), error = %e, "failed to remove temp file");
        }

        let owns_destination = entry.stage.ordinal() >= Stage::Renamed.ordinal()
            || (entry.stage == Stage::Verified && entry.narrowed);
        if owns_destination {
            if let Err(e) = fs_ops::remove_file_if_exists(&entry.destination) {
                warn!(destination = %entry.destination.display(), error = %e,
                    "failed to remove destination file");
            }
        }
    }

    fn attempt(&self, entry: &mut JournalEntry) -> Result<(), Halt> {
        let mut scratch = Scratch::default();
        while entry.stage != Stage::Done {
            if self.cancel.is_cancelled() {
                debug!(source = %entry.source.display(), stage = %entry.stage, "stopping at boundary");
                return Err(Halt::Interrupted);
            }
            match entry.stage {
                Stage::Init | Stage::Failed => self.open_temp(entry, &mut scratch)?,
                Stage::OpenTemp | Stage::StreamCopy => self.stream_copy(entry, &mut scratch)?,
                Stage::Flushed => self.sync_data(entry, &mut scratch)?,
                Stage::DataSynced => self.record_hash(entry)?,
                Stage::Hashed => self.verify(entry)?,
                Stage::Verified => self.rename(entry)?,
                Stage::Renamed => {
                    fs_ops::sync_parent(&entry.destination)
                        .map_err(|e| MigrateError::transient(&entry.destination, e))?;
                    self.commit(entry, Stage::DestDirSynced, StageFields::new())?;
                }
                Stage::DestDirSynced => {
                    if !fs_ops::remove_file_if_exists(&entry.source)
                        .map_err(|e| MigrateError::transient(&entry.source, e))?
                    {
                        debug!(source = %entry.source.display(), "source already removed");
                    }
                    self.commit(entry, Stage::SourceRemoved, StageFields::new())?;
                }
                Stage::SourceRemoved => {
                    fs_ops::sync_parent(&entry.source)
                        .map_err(|e| MigrateError::transient(&entry.source, e))?;
                    self.commit(entry, Stage::SourceDirSynced, StageFields::new())?;
                }
                Stage::SourceDirSynced => {
                    self.commit(entry, Stage::Done, StageFields::new())?;
                    info!(source = %entry.source.display(), destination = %entry.destination.display(),
                        bytes = entry.size, narrowed = entry.narrowed, "item migrated");
                }
                Stage::Done | Stage::PermanentlyFailed => break,
            }
        }
        Ok(())
    }

    /// INIT/FAILED -> OPEN_TEMP
    fn open_temp(&self, entry: &mut JournalEntry, scratch: &mut Scratch) -> Result<(), Halt> {
        let source_meta = source_metadata(&entry.source)?;
        if let Some(parent) = entry.destination.parent() {
            fs_ops::ensure_dir_durable(parent).map_err(|e| MigrateError::transient(parent, e))?;
        }
        fs_ops::check_free_space(
            &entry.destination,
            source_meta.len(),
            self.config.min_free_space,
        )?;

        let temp_path = fs_ops::temp_path_for(&entry.destination);
        let temp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| MigrateError::transient(&temp_path, e))?;

        self.commit_batched(
            entry,
            Stage::OpenTemp,
            StageFields::new().bytes(0).clear_digest(),
        )?;
        scratch.temp = Some(Arc::new(temp));
        scratch.hasher = Some(create_hasher(self.config.digest));
        scratch.source_meta = Some(source_meta);
        Ok(())
    }

    /// OPEN_TEMP/STREAM_COPY -> FLUSHED, committing STREAM_COPY progress on
    /// the way.
    fn stream_copy(&self, entry: &mut JournalEntry, scratch: &mut Scratch) -> Result<(), Halt> {
        let temp_path = fs_ops::temp_path_for(&entry.destination);
        let source = File::open(&entry.source).map_err(|e| source_error(&entry.source, e))?;
        let source_meta = source
            .metadata()
            .map_err(|e| MigrateError::transient(&entry.source, e))?;
        let source_len = source_meta.len();
        let source = Arc::new(source);

        if scratch.temp.is_none() {
            self.resume_temp(entry, scratch, &temp_path, source_len)?;
        }
        let (temp, hasher) = match (scratch.temp.as_ref(), scratch.hasher.as_mut()) {
            (Some(temp), Some(hasher)) => (Arc::clone(temp), hasher),
            _ => return Err(corruption(&temp_path, "temp file not open").into()),
        };

        let temp_meta = temp
            .metadata()
            .map_err(|e| MigrateError::transient(&temp_path, e))?;
        let mut zero_copy = self.config.zero_copy && fs_ops::same_device(&source_meta, &temp_meta);
        let chunk = self.config.chunk_size as usize;
        let mut buffer = vec![0u8; chunk];
        let mut watchdog = Watchdog::spawn(self.config.stall_timeout())?;
        let mut offset = entry.bytes_copied;
        let mut since_commit = 0u64;

        while offset < source_len {
            let (start, end) = if self.config.preserve_sparse {
                fs_ops::next_data_region(&source, offset, source_len)
                    .map_err(|e| MigrateError::transient(&entry.source, e))?
                    .unwrap_or((source_len, source_len))
            } else {
                (offset, source_len)
            };

            // hole: hashed as zeros, never written
            if start > offset {
                feed_zeros(&mut **hasher, start - offset, &mut buffer);
                since_commit += start - offset;
                offset = start;
            }

            let mut short_read = false;
            while offset < end {
                let want = (end - offset).min(chunk as u64) as usize;
                let job = ChunkJob {
                    origin: entry.source.clone(),
                    source: Arc::clone(&source),
                    temp: Arc::clone(&temp),
                    buffer: std::mem::take(&mut buffer),
                    offset,
                    want,
                    zero_copy,
                };
                let done = match watchdog.run(&entry.source, move || job.run())? {
                    Ok(done) => done,
                    Err(ChunkError::Source(e)) => {
                        return Err(MigrateError::transient(&entry.source, e).into())
                    }
                    Err(ChunkError::Temp(e)) => {
                        return Err(MigrateError::transient(&temp_path, e).into())
                    }
                };
                buffer = done.buffer;
                if let Some(e) = done.fell_back {
                    debug!(source = %entry.source.display(), error = %e,
                        "in-kernel copy unavailable, using buffered copy");
                    zero_copy = false;
                }
                let read = done.read;
                if read == 0 {
                    // source shrank; verification reports the size change
                    short_read = true;
                    break;
                }
                hasher.update(&buffer[..read]);

                offset += read as u64;
                since_commit += read as u64;
                if since_commit >= self.config.progress_commit_bytes && offset < source_len {
                    since_commit = 0;
                    self.commit_progress(entry, &mut watchdog, &temp, &temp_path, &**hasher, offset)?;
                }
                if read < want {
                    short_read = true;
                    break;
                }
            }

            if short_read {
                break;
            }
            if since_commit >= self.config.progress_commit_bytes && offset < source_len {
                since_commit = 0;
                self.commit_progress(entry, &mut watchdog, &temp, &temp_path, &**hasher, offset)?;
            }
        }

        temp.set_len(offset)
            .map_err(|e| MigrateError::transient(&temp_path, e))?;
        let digest = hasher.digest();
        scratch.source_meta = Some(source_meta);
        self.commit_batched(
            entry,
            Stage::Flushed,
            StageFields::new().bytes(offset).digest(digest),
        )?;
        if let Some(progress) = self.progress {
            progress.on_item_progress(&entry.source, offset, entry.size);
        }
        Ok(())
    }

    /// Durable STREAM_COPY checkpoint at `offset`.
    fn commit_progress(
        &self,
        entry: &mut JournalEntry,
        watchdog: &mut Watchdog,
        temp: &Arc<File>,
        temp_path: &Path,
        hasher: &dyn ChecksumHasher,
        offset: u64,
    ) -> Result<(), Halt> {
        // the prefix must read back in full, holes included
        if temp_meta_len(temp, temp_path)? < offset {
            temp.set_len(offset)
                .map_err(|e| MigrateError::transient(temp_path, e))?;
        }
        let file = Arc::clone(temp);
        watchdog
            .run(temp_path, move || file.sync_data())?
            .map_err(|e| MigrateError::transient(temp_path, e))?;
        self.commit_batched(
            entry,
            Stage::StreamCopy,
            StageFields::new().bytes(offset).digest(hasher.digest()),
        )?;
        if let Some(progress) = self.progress {
            progress.on_item_progress(&entry.source, offset, entry.size);
        }
        injected(&entry.source, FailSite::CopyProgress { min_bytes: offset })?;
        if self.cancel.is_cancelled() {
            return Err(Halt::Interrupted);
        }
        Ok(())
    }

    /// Reopen the temp file after a restart and decide how much of it to trust.
    fn resume_temp(
        &self,
        entry: &mut JournalEntry,
        scratch: &mut Scratch,
        temp_path: &Path,
        source_len: u64,
    ) -> Result<(), Halt> {
        let mut temp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(temp_path)
            .map_err(|e| MigrateError::transient(temp_path, e))?;

        let resumed = match (entry.stage, entry.content_digest.as_ref()) {
            (Stage::StreamCopy, Some(recorded)) if entry.bytes_copied > 0 => verifier::trusted_prefix(
                &mut temp,
                entry.bytes_copied,
                recorded,
                self.config.chunk_size as usize,
            )
            .map_err(|e| MigrateError::transient(temp_path, e))?,
            _ => None,
        };

        let hasher = match resumed {
            Some(hasher) => {
                info!(source = %entry.source.display(), offset = entry.bytes_copied,
                    "resuming copy from verified prefix");
                hasher
            }
            None => {
                if entry.bytes_copied > 0 {
                    warn!(source = %entry.source.display(), recorded = entry.bytes_copied,
                        "temp file does not match recorded prefix, restarting copy");
                }
                self.commit_batched(
                    entry,
                    Stage::StreamCopy,
                    StageFields::new().bytes(0).clear_digest(),
                )?;
                create_hasher(self.config.digest)
            }
        };

        fs_ops::check_free_space(
            &entry.destination,
            source_len.saturating_sub(entry.bytes_copied),
            self.config.min_free_space,
        )?;
        temp.set_len(entry.bytes_copied)
            .map_err(|e| MigrateError::transient(temp_path, e))?;
        scratch.temp = Some(Arc::new(temp));
        scratch.hasher = Some(hasher);
        Ok(())
    }

    /// FLUSHED -> DATA_SYNCED
    fn sync_data(&self, entry: &mut JournalEntry, scratch: &mut Scratch) -> Result<(), Halt> {
        let temp_path = fs_ops::temp_path_for(&entry.destination);
        let temp = match scratch.temp.take() {
            Some(temp) => temp,
            None => {
                // not durable before the crash: the whole temp must re-hash.
                // Read-only, since the source's mode may already be applied.
                let recorded = entry.content_digest.clone().ok_or_else(|| {
                    corruption(&temp_path, "no digest recorded at FLUSHED")
                })?;
                let mut temp = File::open(&temp_path).map_err(|e| missing_temp(&temp_path, e))?;
                let len = temp
                    .metadata()
                    .map_err(|e| MigrateError::transient(&temp_path, e))?
                    .len();
                if len != entry.bytes_copied {
                    return Err(corruption(
                        &temp_path,
                        &format!("temp holds {} bytes, {} recorded", len, entry.bytes_copied),
                    )
                    .into());
                }
                let rehashed =
                    verifier::rehash_prefix(&mut temp, len, recorded.algorithm(), self.config.chunk_size as usize)
                        .map_err(|e| MigrateError::transient(&temp_path, e))?
                        .ok_or_else(|| corruption(&temp_path, "temp shorter than recorded"))?;
                verifier::verify_digest(&temp_path, &rehashed.digest(), &recorded)?;
                Arc::new(temp)
            }
        };

        let source_meta = match scratch.source_meta.take() {
            Some(meta) => meta,
            None => source_metadata(&entry.source)?,
        };
        fs_ops::preserve_metadata(&temp, &source_meta)
            .map_err(|e| MigrateError::transient(&temp_path, e))?;
        let mut watchdog = Watchdog::spawn(self.config.stall_timeout())?;
        watchdog
            .run(&temp_path, move || temp.sync_all())?
            .map_err(|e| MigrateError::transient(&temp_path, e))?;

        self.commit_batched(entry, Stage::DataSynced, StageFields::new())?;
        Ok(())
    }

    /// DATA_SYNCED -> HASHED. The digest was accumulated while streaming;
    /// only the temp's size is checked here.
    fn record_hash(&self, entry: &mut JournalEntry) -> Result<(), Halt> {
        let temp_path = fs_ops::temp_path_for(&entry.destination);
        let digest = entry
            .content_digest
            .clone()
            .ok_or_else(|| corruption(&temp_path, "no digest recorded"))?;
        check_temp_size(&temp_path, entry.bytes_copied)?;
        self.commit_batched(entry, Stage::Hashed, StageFields::new().digest(digest))?;
        Ok(())
    }

    /// HASHED -> VERIFIED (barrier: authorizes the rename)
    fn verify(&self, entry: &mut JournalEntry) -> Result<(), Halt> {
        let temp_path = fs_ops::temp_path_for(&entry.destination);
        let digest = entry
            .content_digest
            .clone()
            .ok_or_else(|| corruption(&temp_path, "no digest recorded"))?;
        check_temp_size(&temp_path, entry.bytes_copied)?;
        verifier::verify(
            &entry.destination,
            entry.size,
            entry.bytes_copied,
            &digest,
            entry.expected_digest.as_ref(),
        )?;
        self.commit(entry, Stage::Verified, StageFields::new())?;
        Ok(())
    }

    /// VERIFIED -> RENAMED
    fn rename(&self, entry: &mut JournalEntry) -> Result<(), Halt> {
        let mut temp_path = fs_ops::temp_path_for(&entry.destination);
        let digest = entry
            .content_digest
            .clone()
            .ok_or_else(|| corruption(&temp_path, "no digest recorded"))?;

        if !temp_path.exists() {
            match self.find_relocated_temp(entry, &digest)? {
                Some(moved_to) => {
                    // crashed between moving the temp and recording the new name
                    info!(source = %entry.source.display(), destination = %moved_to.display(),
                        "recovered temp moved to a new name");
                    let stage = entry.stage;
                    self.commit(entry, stage, StageFields::new().destination(&moved_to))?;
                    temp_path = fs_ops::temp_path_for(&moved_to);
                }
                None if entry.destination.exists() => {
                    // renamed (or copied across devices) before the commit was made
                    self.check_destination(entry, &digest)?;
                    self.commit(entry, Stage::Renamed, StageFields::new())?;
                    return Ok(());
                }
                None => {
                    return Err(corruption(&temp_path, "temp file vanished before rename").into())
                }
            }
        }

        if entry.narrowed && entry.destination.exists() {
            // interrupted cross-device copy: the partial destination is ours
            fs_ops::remove_file_if_exists(&entry.destination)
                .map_err(|e| MigrateError::transient(&entry.destination, e))?;
        } else if entry.destination.exists() {
            let free = self.relocate(entry)?;
            temp_path = fs_ops::temp_path_for(&free);
        }

        match rename_into_place(&entry.source, &temp_path, &entry.destination) {
            Ok(()) => {}
            Err(MigrateError::CrossDevice { .. }) => {
                return self.cross_device_fallback(entry, &temp_path, &digest);
            }
            Err(e) => return Err(e.into()),
        }
        self.commit(entry, Stage::Renamed, StageFields::new())?;
        Ok(())
    }

    /// Pick and record a free destination name; a foreign file is never
    /// overwritten.
    ///
    /// The temp moves before the new name is committed. A crash in between
    /// is repaired by [`Self::find_relocated_temp`] on the next attempt.
    fn relocate(&self, entry: &mut JournalEntry) -> Result<PathBuf, Halt> {
        let previous_temp = fs_ops::temp_path_for(&entry.destination);
        let journal = self.journal;
        let source = entry.source.clone();
        let mut lookup_error = None;
        let free = fs_ops::unique_path(&entry.destination, |candidate| {
            candidate.exists()
                || fs_ops::temp_path_for(candidate).exists()
                || journal.destination_claimed(candidate, &source).unwrap_or_else(|e| {
                    lookup_error = Some(e);
                    false
                })
        });
        if let Some(e) = lookup_error {
            return Err(e.into());
        }

        warn!(source = %entry.source.display(), occupied = %entry.destination.display(),
            chosen = %free.display(), "destination occupied, using a new name");
        let new_temp = fs_ops::temp_path_for(&free);
        fs::rename(&previous_temp, &new_temp)
            .map_err(|e| MigrateError::transient(&previous_temp, e))?;
        let stage = entry.stage;
        self.commit(entry, stage, StageFields::new().destination(&free))?;
        Ok(free)
    }

    /// Look for this entry's temp under a name `relocate` may have picked.
    ///
    /// Walks the numbered siblings in the order `relocate` tries them and
    /// stops at the first one it would have taken. A candidate is adopted
    /// only if its temp is unclaimed and matches the recorded size and digest.
    fn find_relocated_temp(
        &self,
        entry: &JournalEntry,
        digest: &ChecksumValue,
    ) -> Result<Option<PathBuf>, Halt> {
        for candidate in fs_ops::numbered_siblings(&entry.destination) {
            let temp = fs_ops::temp_path_for(&candidate);
            if candidate.exists() || self.journal.destination_claimed(&candidate, &entry.source)? {
                continue;
            }
            if !temp.exists() {
                return Ok(None);
            }
            if self.temp_matches(&temp, entry.bytes_copied, digest)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn temp_matches(&self, temp: &Path, len: u64, digest: &ChecksumValue) -> Result<bool, Halt> {
        let mut file = match File::open(temp) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(MigrateError::transient(temp, e).into()),
        };
        if temp_meta_len(&file, temp)? != len {
            return Ok(false);
        }
        let rehashed = verifier::rehash_prefix(
            &mut file,
            len,
            digest.algorithm(),
            self.config.chunk_size as usize,
        )
        .map_err(|e| MigrateError::transient(temp, e))?;
        Ok(rehashed.map(|hasher| hasher.digest() == *digest).unwrap_or(false))
    }

    /// Non-atomic replacement for a rename across devices: copy, re-hash,
    /// sync, then drop the temp.
    fn cross_device_fallback(
        &self,
        entry: &mut JournalEntry,
        temp_path: &Path,
        digest: &ChecksumValue,
    ) -> Result<(), Halt> {
        warn!(source = %entry.source.display(), destination = %entry.destination.display(),
            "rename crosses devices, falling back to verified copy (atomicity narrowed)");
        let stage = entry.stage;
        self.commit(entry, stage, StageFields::new().narrowed(true))?;

        let mut temp_path = temp_path.to_path_buf();
        let (len, copied) = loop {
            match fs_ops::copy_and_hash(
                &temp_path,
                &entry.destination,
                digest.algorithm(),
                self.config.chunk_size as usize,
            ) {
                Ok(copied) => break copied,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    // someone else took the name since the rename attempt
                    let free = self.relocate(entry)?;
                    temp_path = fs_ops::temp_path_for(&free);
                }
                Err(e) => return Err(MigrateError::transient(&entry.destination, e).into()),
            }
        };

        if len != entry.bytes_copied {
            return Err(corruption(
                &entry.destination,
                &format!("copied {} bytes, expected {}", len, entry.bytes_copied),
            )
            .into());
        }
        verifier::verify_digest(&entry.destination, &copied, digest)?;

        fs_ops::remove_file_if_exists(&temp_path)
            .map_err(|e| MigrateError::transient(&temp_path, e))?;
        self.commit(entry, Stage::Renamed, StageFields::new())?;
        Ok(())
    }

    /// Re-hash an already placed destination against the recorded digest.
    fn check_destination(&self, entry: &JournalEntry, digest: &ChecksumValue) -> Result<(), Halt> {
        let mut file =
            File::open(&entry.destination).map_err(|e| MigrateError::transient(&entry.destination, e))?;
        let rehashed = verifier::rehash_prefix(
            &mut file,
            entry.bytes_copied,
            digest.algorithm(),
            self.config.chunk_size as usize,
        )
        .map_err(|e| MigrateError::transient(&entry.destination, e))?
        .ok_or_else(|| corruption(&entry.destination, "destination shorter than recorded"))?;
        let actual_len = file
            .metadata()
            .map_err(|e| MigrateError::transient(&entry.destination, e))?
            .len();
        if actual_len != entry.bytes_copied {
            return Err(corruption(&entry.destination, "destination size differs").into());
        }
        verifier::verify_digest(&entry.destination, &rehashed.digest(), digest)?;
        Ok(())
    }

    fn commit(
        &self,
        entry: &mut JournalEntry,
        stage: Stage,
        fields: StageFields,
    ) -> Result<(), MigrateError> {
        self.journal.commit_stage(entry.id, stage, fields.clone())?;
        self.applied(entry, stage, &fields)
    }

    fn commit_batched(
        &self,
        entry: &mut JournalEntry,
        stage: Stage,
        fields: StageFields,
    ) -> Result<(), MigrateError> {
        self.journal
            .commit_stage_batched(entry.id, stage, fields.clone())?;
        self.applied(entry, stage, &fields)
    }

    fn applied(
        &self,
        entry: &mut JournalEntry,
        stage: Stage,
        fields: &StageFields,
    ) -> Result<(), MigrateError> {
        fields.apply_to(entry);
        entry.stage = stage;
        debug!(entry = %entry.id, source = %entry.source.display(), %stage, "transition");
        injected(&entry.source, FailSite::AfterStage(stage))
    }
}

fn injected(source: &Path, site: FailSite) -> Result<(), MigrateError> {
    failpoint::hit(source, site).map_err(|e| MigrateError::transient(source, e))
}

fn rename_into_place(source: &Path, temp: &Path, destination: &Path) -> Result<(), MigrateError> {
    let result = failpoint::hit(source, FailSite::Rename).and_then(|()| fs::rename(temp, destination));
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => Err(MigrateError::CrossDevice {
            from: temp.to_path_buf(),
            to: destination.to_path_buf(),
        }),
        Err(e) => Err(MigrateError::transient(temp, e)),
    }
}

/// One chunk's read and write, run on the watchdog's helper thread.
struct ChunkJob {
    origin: PathBuf,
    source: Arc<File>,
    temp: Arc<File>,
    buffer: Vec<u8>,
    offset: u64,
    want: usize,
    zero_copy: bool,
}

struct ChunkDone {
    read: usize,
    buffer: Vec<u8>,
    /// Set when the in-kernel copy was refused and the chunk went buffered
    fell_back: Option<io::Error>,
}

enum ChunkError {
    Source(io::Error),
    Temp(io::Error),
}

impl ChunkJob {
    fn run(mut self) -> Result<ChunkDone, ChunkError> {
        failpoint::hit(&self.origin, FailSite::ChunkIo).map_err(ChunkError::Source)?;
        let read = fs_ops::read_full_at(&self.source, &mut self.buffer[..self.want], self.offset)
            .map_err(ChunkError::Source)?;

        let mut fell_back = None;
        if read > 0 {
            if self.zero_copy {
                match copy_range_exact(&self.source, &self.temp, self.offset, read) {
                    Ok(()) => {}
                    Err(e) if fs_ops::zero_copy_unsupported(&e) => {
                        fs_ops::write_all_at(&self.temp, &self.buffer[..read], self.offset)
                            .map_err(ChunkError::Temp)?;
                        fell_back = Some(e);
                    }
                    Err(e) => return Err(ChunkError::Temp(e)),
                }
            } else {
                fs_ops::write_all_at(&self.temp, &self.buffer[..read], self.offset)
                    .map_err(ChunkError::Temp)?;
            }
        }

        Ok(ChunkDone {
            read,
            buffer: self.buffer,
            fell_back,
        })
    }
}

/// Copy exactly `len` bytes in the kernel, looping over short transfers.
fn copy_range_exact(source: &File, temp: &File, offset: u64, len: usize) -> io::Result<()> {
    let mut done = 0;
    while done < len {
        let moved = fs_ops::copy_range(source, temp, offset + done as u64, len - done)?;
        if moved == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "in-kernel copy stopped early",
            ));
        }
        done += moved;
    }
    Ok(())
}

fn feed_zeros(hasher: &mut dyn ChecksumHasher, mut len: u64, buffer: &mut [u8]) {
    if len == 0 {
        return;
    }
    let span = buffer.len().min(len as usize).max(1);
    buffer[..span].fill(0);
    while len > 0 {
        let n = (len as usize).min(span);
        hasher.update(&buffer[..n]);
        len -= n as u64;
    }
}

fn source_metadata(source: &Path) -> Result<Metadata, MigrateError> {
    fs::metadata(source).map_err(|e| source_error(source, e))
}

fn source_error(source: &Path, err: io::Error) -> MigrateError {
    if err.kind() == io::ErrorKind::NotFound {
        MigrateError::SourceNotFound {
            path: source.to_path_buf(),
        }
    } else {
        MigrateError::transient(source, err)
    }
}

fn missing_temp(temp: &Path, err: io::Error) -> MigrateError {
    if err.kind() == io::ErrorKind::NotFound {
        corruption(temp, "temp file vanished")
    } else {
        MigrateError::transient(temp, err)
    }
}

fn temp_meta_len(temp: &File, temp_path: &Path) -> Result<u64, MigrateError> {
    Ok(temp
        .metadata()
        .map_err(|e| MigrateError::transient(temp_path, e))?
        .len())
}

fn check_temp_size(temp_path: &Path, expected: u64) -> Result<(), MigrateError> {
    let len = fs::metadata(temp_path)
        .map_err(|e| missing_temp(temp_path, e))?
        .len();
    if len != expected {
        return Err(corruption(
            temp_path,
            &format!("temp holds {} bytes, {} recorded", len, expected),
        ));
    }
    Ok(())
}

fn corruption(path: &Path, reason: &str) -> MigrateError {
    MigrateError::Corruption {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use crate::failpoint::{arm, disarm, FailAction};
    use crate::journal::BatchPolicy;
    use crate::model::WorkItem;
    use chrono::Utc;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        src: PathBuf,
        dst: PathBuf,
        journal_path: PathBuf,
        batch_policy: BatchPolicy,
        journal: Journal,
        config: MigrationConfig,
        cancel: CancellationToken,
    }

    impl Fixture {
        /// Every commit durable at once, so a crash loses nothing.
        fn new() -> Self {
            Self::with_policy(BatchPolicy {
                max_items: 1,
                max_delay: Duration::from_secs(60),
            })
        }

        fn with_policy(batch_policy: BatchPolicy) -> Self {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            let src = dir.path().join("src");
            let dst = dir.path().join("dst");
            fs::create_dir_all(&src).expect("Failed to create source dir");
            fs::create_dir_all(&dst).expect("Failed to create destination dir");
            let journal_path = dir.path().join("journal.db");
            let journal = Journal::open(&journal_path, DurabilityLevel::Fsynced, batch_policy)
                .expect("Failed to open journal");

            let mut config = MigrationConfig::new(&src, &dst);
            config.min_free_space = 0;
            config.chunk_size = 16 * 1024;
            config.progress_commit_bytes = 32 * 1024;
            config.max_retries = 2;
            config.retry_backoff_base_ms = 1;
            config.retry_backoff_max_ms = 1;

            Fixture {
                _dir: dir,
                src,
                dst,
                journal_path,
                batch_policy,
                journal,
                config,
                cancel: CancellationToken::new(),
            }
        }

        /// Replace the journal with a fresh handle on the same database;
        /// commits still queued in the old one are lost, as in a crash.
        fn reopen(&mut self) {
            self.journal = Journal::open(&self.journal_path, DurabilityLevel::Fsynced, self.batch_policy)
                .expect("Failed to reopen journal");
        }

        fn engine(&self) -> CopyEngine<'_> {
            CopyEngine::new(&self.journal, &self.config, &self.cancel, None)
        }

        fn add(&self, name: &str, content: &[u8]) -> JournalEntry {
            let source = self.src.join(name);
            fs::write(&source, content).expect("Failed to write source file");
            self.add_item(WorkItem {
                source,
                destination: self.dst.join(name),
                size: content.len() as u64,
                source_mtime_ms: 0,
                discovered_at: Utc::now(),
                expected_digest: None,
            })
        }

        fn add_item(&self, item: WorkItem) -> JournalEntry {
            let id = self.journal.begin(&item).expect("Failed to begin entry");
            self.journal.get(id).expect("Failed to read entry")
        }

        fn reload(&self, entry: &JournalEntry) -> JournalEntry {
            self.journal.get(entry.id).expect("Failed to read entry")
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_migrate_moves_file() {
        let fx = Fixture::new();
        let data = content(100 * 1024);
        let entry = fx.add("a.bin", &data);

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        assert_eq!(
            outcome,
            ItemOutcome::Done {
                bytes: data.len() as u64,
                narrowed: false
            }
        );

        let dest = fx.dst.join("a.bin");
        assert_eq!(fs::read(&dest).expect("Failed to read destination"), data);
        assert!(!entry.source.exists());
        assert!(!fs_ops::temp_path_for(&dest).exists());

        let stored = fx.reload(&entry);
        assert_eq!(stored.stage, Stage::Done);
        assert_eq!(stored.bytes_copied, data.len() as u64);
        assert!(stored.content_digest.is_some());
    }

    #[test]
    fn test_empty_file() {
        let fx = Fixture::new();
        let entry = fx.add("empty", b"");

        let outcome = fx.engine().migrate(entry).expect("Migration failed");
        assert_eq!(outcome, ItemOutcome::Done { bytes: 0, narrowed: false });
        assert_eq!(
            fs::metadata(fx.dst.join("empty")).expect("Destination missing").len(),
            0
        );
    }

    #[test]
    fn test_resume_after_crash_mid_copy() {
        let fx = Fixture::new();
        let data = content(200 * 1024);
        let entry = fx.add("big.bin", &data);
        arm(
            &entry.source,
            FailSite::CopyProgress { min_bytes: 96 * 1024 },
            FailAction::Crash,
            1,
        );

        let crashed = catch_unwind(AssertUnwindSafe(|| fx.engine().migrate(entry.clone())));
        assert!(crashed.is_err());
        disarm(&entry.source);

        let stored = fx.reload(&entry);
        assert_eq!(stored.stage, Stage::StreamCopy);
        assert!(stored.bytes_copied >= 96 * 1024);
        assert!(entry.source.exists());
        assert!(!fx.dst.join("big.bin").exists());

        let outcome = fx.engine().migrate(stored).expect("Resume failed");
        assert!(matches!(outcome, ItemOutcome::Done { .. }));
        assert_eq!(fs::read(fx.dst.join("big.bin")).expect("Failed to read destination"), data);
        assert!(!entry.source.exists());
    }

    #[test]
    fn test_torn_temp_restarts_from_zero() {
        let fx = Fixture::new();
        let data = content(128 * 1024);
        let entry = fx.add("torn.bin", &data);
        arm(
            &entry.source,
            FailSite::CopyProgress { min_bytes: 64 * 1024 },
            FailAction::Crash,
            1,
        );
        let crashed = catch_unwind(AssertUnwindSafe(|| fx.engine().migrate(entry.clone())));
        assert!(crashed.is_err());
        disarm(&entry.source);

        // scribble over the recorded prefix
        let temp = fs_ops::temp_path_for(&fx.dst.join("torn.bin"));
        let file = OpenOptions::new().write(true).open(&temp).expect("Failed to open temp");
        fs_ops::write_all_at(&file, b"garbage", 10).expect("Failed to corrupt temp");
        drop(file);

        let stored = fx.reload(&entry);
        let outcome = fx.engine().migrate(stored).expect("Resume failed");
        assert!(matches!(outcome, ItemOutcome::Done { .. }));
        assert_eq!(fs::read(fx.dst.join("torn.bin")).expect("Failed to read destination"), data);
    }

    #[test]
    fn test_crash_at_every_stage_boundary() {
        let fx = Fixture::new();
        let stages = [
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

        for (i, stage) in stages.iter().enumerate() {
            let name = format!("file{}.bin", i);
            let data = content(80 * 1024 + i);
            let entry = fx.add(&name, &data);
            arm(&entry.source, FailSite::AfterStage(*stage), FailAction::Crash, 1);

            let crashed = catch_unwind(AssertUnwindSafe(|| fx.engine().migrate(entry.clone())));
            assert!(crashed.is_err(), "no crash injected after {}", stage);
            disarm(&entry.source);

            let stored = fx.reload(&entry);
            assert_eq!(stored.stage, *stage);

            let outcome = fx.engine().migrate(stored).expect("Resume failed");
            assert!(matches!(outcome, ItemOutcome::Done { .. }), "after {}: {:?}", stage, outcome);

            let dest = fx.dst.join(&name);
            assert_eq!(fs::read(&dest).expect("Failed to read destination"), data, "after {}", stage);
            assert!(!entry.source.exists(), "source kept after {}", stage);
            assert!(!fs_ops::temp_path_for(&dest).exists(), "temp kept after {}", stage);
        }
    }

    #[test]
    fn test_cross_device_rename_falls_back_to_copy() {
        let fx = Fixture::new();
        let data = content(50 * 1024);
        let entry = fx.add("x.bin", &data);
        arm(&entry.source, FailSite::Rename, FailAction::CrossDevice, 1);

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        disarm(&entry.source);
        assert_eq!(
            outcome,
            ItemOutcome::Done {
                bytes: data.len() as u64,
                narrowed: true
            }
        );

        let dest = fx.dst.join("x.bin");
        assert_eq!(fs::read(&dest).expect("Failed to read destination"), data);
        assert!(!fs_ops::temp_path_for(&dest).exists());
        assert!(fx.reload(&entry).narrowed);
    }

    #[test]
    fn test_occupied_destination_gets_new_name() {
        let fx = Fixture::new();
        let data = content(10 * 1024);
        let entry = fx.add("clip.mkv", &data);
        fs::write(fx.dst.join("clip.mkv"), b"someone else").expect("Failed to write foreign file");

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        assert!(matches!(outcome, ItemOutcome::Done { .. }));

        assert_eq!(
            fs::read(fx.dst.join("clip.mkv")).expect("Foreign file missing"),
            b"someone else"
        );
        let stored = fx.reload(&entry);
        assert_eq!(stored.destination, fx.dst.join("clip_1.mkv"));
        assert_eq!(stored.retry_count, 0);
        assert_eq!(fs::read(&stored.destination).expect("Failed to read destination"), data);
    }

    #[test]
    fn test_temp_moved_before_crash_is_recovered() {
        let fx = Fixture::new();
        let data = content(12 * 1024);
        let entry = fx.add("clip.mkv", &data);
        arm(&entry.source, FailSite::AfterStage(Stage::Verified), FailAction::Crash, 1);
        let crashed = catch_unwind(AssertUnwindSafe(|| fx.engine().migrate(entry.clone())));
        assert!(crashed.is_err());
        disarm(&entry.source);

        // the name got taken, the temp moved, and the process died before
        // the new name was recorded
        fs::write(fx.dst.join("clip.mkv"), b"someone else").expect("Failed to write foreign file");
        fs::rename(
            fs_ops::temp_path_for(&fx.dst.join("clip.mkv")),
            fs_ops::temp_path_for(&fx.dst.join("clip_1.mkv")),
        )
        .expect("Failed to move temp");

        let stored = fx.reload(&entry);
        assert_eq!(stored.destination, fx.dst.join("clip.mkv"));
        let outcome = fx.engine().migrate(stored).expect("Resume failed");
        assert!(matches!(outcome, ItemOutcome::Done { .. }), "{:?}", outcome);

        let stored = fx.reload(&entry);
        assert_eq!(stored.destination, fx.dst.join("clip_1.mkv"));
        assert_eq!(stored.retry_count, 0);
        assert_eq!(fs::read(fx.dst.join("clip_1.mkv")).expect("Failed to read destination"), data);
        assert_eq!(
            fs::read(fx.dst.join("clip.mkv")).expect("Foreign file missing"),
            b"someone else"
        );
        assert!(!fx.dst.join("clip_2.mkv").exists());
        assert!(!fs_ops::temp_path_for(&fx.dst.join("clip_1.mkv")).exists());
    }

    #[test]
    fn test_crash_with_unflushed_batch() {
        let mut fx = Fixture::with_policy(BatchPolicy::default());
        let sites = [
            FailSite::AfterStage(Stage::Hashed),
            FailSite::CopyProgress { min_bytes: 64 * 1024 },
        ];

        for (i, site) in sites.iter().enumerate() {
            let name = format!("batched{}.bin", i);
            let data = content(160 * 1024 + i);
            let entry = fx.add(&name, &data);
            arm(&entry.source, *site, FailAction::Crash, 1);

            let crashed = catch_unwind(AssertUnwindSafe(|| fx.engine().migrate(entry.clone())));
            assert!(crashed.is_err(), "no crash injected at {:?}", site);
            disarm(&entry.source);

            fx.reopen();
            let stored = fx.reload(&entry);
            assert!(
                stored.stage.ordinal() < Stage::Verified.ordinal(),
                "barrier reached on disk at {:?}: {}",
                site,
                stored.stage
            );

            let outcome = fx.engine().migrate(stored).expect("Resume failed");
            assert!(matches!(outcome, ItemOutcome::Done { .. }), "at {:?}: {:?}", site, outcome);
            let dest = fx.dst.join(&name);
            assert_eq!(fs::read(&dest).expect("Failed to read destination"), data);
            assert!(!entry.source.exists());
            assert!(!fs_ops::temp_path_for(&dest).exists());
        }
    }

    #[test]
    fn test_stalled_chunk_is_retried() {
        let mut fx = Fixture::new();
        fx.config.stall_timeout_ms = 500;
        let data = content(40 * 1024);
        let entry = fx.add("hung.bin", &data);
        arm(
            &entry.source,
            FailSite::ChunkIo,
            FailAction::Stall(Duration::from_secs(3)),
            1,
        );

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        disarm(&entry.source);
        assert!(matches!(outcome, ItemOutcome::Done { .. }), "{:?}", outcome);

        let stored = fx.reload(&entry);
        assert_eq!(stored.retry_count, 1);
        assert!(stored
            .last_error
            .as_deref()
            .map(|e| e.contains("stalled"))
            .unwrap_or(false));
        assert_eq!(fs::read(fx.dst.join("hung.bin")).expect("Failed to read destination"), data);
    }

    #[cfg(unix)]
    #[test]
    fn test_resume_at_flushed_with_read_only_temp() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        let data = content(20 * 1024);
        let entry = fx.add("ro.bin", &data);
        arm(&entry.source, FailSite::AfterStage(Stage::Flushed), FailAction::Crash, 1);
        let crashed = catch_unwind(AssertUnwindSafe(|| fx.engine().migrate(entry.clone())));
        assert!(crashed.is_err());
        disarm(&entry.source);

        // the source's read-only mode already landed on the temp
        let temp = fs_ops::temp_path_for(&fx.dst.join("ro.bin"));
        fs::set_permissions(&temp, fs::Permissions::from_mode(0o444))
            .expect("Failed to chmod temp");

        let stored = fx.reload(&entry);
        let outcome = fx.engine().migrate(stored).expect("Resume failed");
        assert!(matches!(outcome, ItemOutcome::Done { .. }), "{:?}", outcome);
        assert_eq!(fx.reload(&entry).retry_count, 0);
        assert_eq!(fs::read(fx.dst.join("ro.bin")).expect("Failed to read destination"), data);
    }

    #[test]
    fn test_digest_mismatch_exhausts_retries() {
        let fx = Fixture::new();
        let source = fx.src.join("bad.bin");
        let data = content(4096);
        fs::write(&source, &data).expect("Failed to write source file");
        let entry = fx.add_item(WorkItem {
            source: source.clone(),
            destination: fx.dst.join("bad.bin"),
            size: data.len() as u64,
            source_mtime_ms: 0,
            discovered_at: Utc::now(),
            expected_digest: Some(ChecksumValue::new(
                fx.config.digest,
                "00".repeat(32),
            )),
        });

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        assert!(matches!(outcome, ItemOutcome::PermanentlyFailed { .. }));

        let stored = fx.reload(&entry);
        assert_eq!(stored.stage, Stage::PermanentlyFailed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.last_error.is_some());
        assert!(source.exists());
        assert!(!fx.dst.join("bad.bin").exists());
        assert!(!fs_ops::temp_path_for(&fx.dst.join("bad.bin")).exists());
    }

    #[test]
    fn test_transient_error_is_retried() {
        let fx = Fixture::new();
        let data = content(8 * 1024);
        let entry = fx.add("flaky.bin", &data);
        arm(
            &entry.source,
            FailSite::Rename,
            FailAction::Error(io::ErrorKind::Other),
            1,
        );

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        disarm(&entry.source);
        assert!(matches!(outcome, ItemOutcome::Done { .. }));
        assert_eq!(fx.reload(&entry).retry_count, 1);
    }

    #[test]
    fn test_missing_source_fails_without_retry() {
        let fx = Fixture::new();
        let entry = fx.add_item(WorkItem {
            source: fx.src.join("gone.bin"),
            destination: fx.dst.join("gone.bin"),
            size: 10,
            source_mtime_ms: 0,
            discovered_at: Utc::now(),
            expected_digest: None,
        });

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        assert!(matches!(outcome, ItemOutcome::PermanentlyFailed { .. }));
        let stored = fx.reload(&entry);
        assert_eq!(stored.stage, Stage::PermanentlyFailed);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn test_cancelled_run_stops_at_boundary() {
        let fx = Fixture::new();
        let entry = fx.add("later.bin", &content(1024));
        fx.cancel.cancel();

        let outcome = fx.engine().migrate(entry.clone()).expect("Migration failed");
        assert_eq!(outcome, ItemOutcome::Interrupted);
        assert_eq!(fx.reload(&entry).stage, Stage::Init);
        assert!(entry.source.exists());
    }

    #[test]
    fn test_sparse_source_keeps_content() {
        let fx = Fixture::new();
        let source = fx.src.join("sparse.img");
        let file = File::create(&source).expect("Failed to create sparse file");
        file.set_len(1024 * 1024).expect("Failed to size sparse file");
        fs_ops::write_all_at(&file, &content(4096), 512 * 1024).expect("Failed to write data");
        drop(file);
        let expected = fs::read(&source).expect("Failed to read source");

        let entry = fx.add_item(WorkItem {
            source,
            destination: fx.dst.join("sparse.img"),
            size: expected.len() as u64,
            source_mtime_ms: 0,
            discovered_at: Utc::now(),
            expected_digest: None,
        });

        let outcome = fx.engine().migrate(entry).expect("Migration failed");
        assert!(matches!(outcome, ItemOutcome::Done { .. }));
        assert_eq!(fs::read(fx.dst.join("sparse.img")).expect("Failed to read destination"), expected);
    }
}
