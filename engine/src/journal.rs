//! Durable per-file migration journal.
//!
//! One SQLite database (WAL mode) per state directory. The journal is the
//! single writer of stage transitions: every commit is validated against the
//! latest known stage of the entry and rejected with
//! `JournalError::InvalidTransition` if it breaks monotonicity.
//!
//! Commits of non-destructive stages may be queued with
//! [`Journal::commit_stage_batched`]; the queue is written in one transaction
//! when it reaches the batch size or age, and always before a barrier commit
//! or a read. Queued commits that never reach disk are lost on a crash, which
//! the copy engine tolerates because it re-validates temp files on resume.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, warn};

use crate::checksums::ChecksumValue;
use crate::config::DurabilityLevel;
use crate::error::JournalError;
use crate::model::{Checkpoint, EntryId, JournalEntry, Stage, StageFields, WorkItem};

const SCHEMA_VERSION: i64 = 1;
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(20);
const PAGE_SIZE: usize = 512;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    path            BLOB    NOT NULL UNIQUE,
    destination     BLOB    NOT NULL,
    size            INTEGER NOT NULL,
    source_mtime    INTEGER NOT NULL,
    stage           TEXT    NOT NULL,
    bytes_copied    INTEGER NOT NULL DEFAULT 0,
    content_digest  TEXT,
    expected_digest TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    narrowed        INTEGER NOT NULL DEFAULT 0,
    discovered_at   INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS entries_stage ON entries(stage);
CREATE INDEX IF NOT EXISTS entries_destination ON entries(destination);
CREATE TABLE IF NOT EXISTS checkpoints (
    pair_key     TEXT    PRIMARY KEY,
    files_done   INTEGER NOT NULL,
    bytes_done   INTEGER NOT NULL,
    files_failed INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
);
";

const ENTRY_COLUMNS: &str = "id, path, destination, size, source_mtime, stage, bytes_copied, \
     content_digest, expected_digest, retry_count, last_error, narrowed, discovered_at, updated_at";

const UPDATE_STAGE: &str = "
UPDATE entries SET
    stage          = ?1,
    bytes_copied   = COALESCE(?2, bytes_copied),
    content_digest = COALESCE(?3, CASE WHEN ?4 THEN NULL ELSE content_digest END),
    retry_count    = COALESCE(?5, retry_count),
    last_error     = COALESCE(?6, last_error),
    destination    = COALESCE(?7, destination),
    narrowed       = COALESCE(?8, narrowed),
    updated_at     = ?9
WHERE id = ?10";

/// When queued commits are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_items: usize,
    pub max_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        BatchPolicy {
            max_items: 64,
            max_delay: Duration::from_secs(1),
        }
    }
}

struct QueuedCommit {
    id: EntryId,
    stage: Stage,
    fields: StageFields,
    at: DateTime<Utc>,
}

struct Inner {
    conn: Connection,
    queue: Vec<QueuedCommit>,
    queued_since: Option<Instant>,
}

/// Which entries a paged listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    Pending,
    Completed,
}

/// The migration journal. Shared across workers by reference; all access is
/// serialized behind one mutex.
pub struct Journal {
    inner: Mutex<Inner>,
    path: PathBuf,
    durability: DurabilityLevel,
    batch_policy: BatchPolicy,
}

impl Journal {
    /// Open (or create) the journal database at `path`.
    pub fn open(
        path: &Path,
        durability: DurabilityLevel,
        batch_policy: BatchPolicy,
    ) -> Result<Self, JournalError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, path, durability, batch_policy)
    }

    /// A throwaway journal that never touches disk; used to plan a pair
    /// that has no journal yet.
    pub fn open_in_memory(batch_policy: BatchPolicy) -> Result<Self, JournalError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, Path::new(":memory:"), DurabilityLevel::None, batch_policy)
    }

    fn from_connection(
        conn: Connection,
        path: &Path,
        durability: DurabilityLevel,
        batch_policy: BatchPolicy,
    ) -> Result<Self, JournalError> {
        conn.busy_timeout(Duration::from_secs(10))?;

        match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        }) {
            Ok(mode) if mode.eq_ignore_ascii_case("wal") || mode.eq_ignore_ascii_case("memory") => {}
            Ok(mode) => warn!(path = %path.display(), mode = %mode, "journal is not in WAL mode"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to enable WAL mode"),
        }

        let synchronous = match durability {
            DurabilityLevel::None => "OFF",
            DurabilityLevel::Flushed => "NORMAL",
            DurabilityLevel::Fsynced => "FULL",
        };
        conn.pragma_update(None, "synchronous", synchronous)?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(JournalError::Corrupt(format!(
                "journal schema version {} is newer than supported {}",
                version, SCHEMA_VERSION
            )));
        }
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        debug!(path = %path.display(), ?durability, "journal opened");

        Ok(Journal {
            inner: Mutex::new(Inner {
                conn,
                queue: Vec::new(),
                queued_since: None,
            }),
            path: path.to_path_buf(),
            durability,
            batch_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn durability(&self) -> DurabilityLevel {
        self.durability
    }

    /// Register a work item; returns the existing entry id if the path is
    /// already journaled.
    pub fn begin(&self, item: &WorkItem) -> Result<EntryId, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let tx = inner.conn.transaction()?;
            let id = insert_item(&tx, item)?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// `begin` for a batch, in one transaction.
    pub fn begin_batch(&self, items: &[WorkItem]) -> Result<Vec<EntryId>, JournalError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let tx = inner.conn.transaction()?;
            let ids = items
                .iter()
                .map(|item| insert_item(&tx, item))
                .collect::<Result<Vec<_>, _>>()?;
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Durably record `stage` for an entry. Writes any queued commits first,
    /// in the same transaction.
    pub fn commit_stage(
        &self,
        id: EntryId,
        stage: Stage,
        fields: StageFields,
    ) -> Result<(), JournalError> {
        self.with_retry(|inner| {
            check_transition(inner, id, stage)?;
            let commit = QueuedCommit {
                id,
                stage,
                fields: fields.clone(),
                at: Utc::now(),
            };
            let tx = inner.conn.transaction()?;
            write_commits(&tx, inner.queue.iter().chain(std::iter::once(&commit)))?;
            tx.commit()?;
            inner.queue.clear();
            inner.queued_since = None;
            Ok(())
        })?;
        debug!(entry = %id, %stage, "stage committed");
        Ok(())
    }

    /// Queue a commit of a non-destructive stage. Barrier stages are
    /// committed immediately.
    pub fn commit_stage_batched(
        &self,
        id: EntryId,
        stage: Stage,
        fields: StageFields,
    ) -> Result<(), JournalError> {
        if stage.is_barrier() {
            return self.commit_stage(id, stage, fields);
        }

        let policy = self.batch_policy;
        let due = self.with_retry(|inner| {
            check_transition(inner, id, stage)?;
            inner.queue.push(QueuedCommit {
                id,
                stage,
                fields: fields.clone(),
                at: Utc::now(),
            });
            let since = *inner.queued_since.get_or_insert_with(Instant::now);
            Ok(inner.queue.len() >= policy.max_items || since.elapsed() >= policy.max_delay)
        })?;

        if due {
            self.flush()?;
        }
        Ok(())
    }

    /// Write any queued commits.
    pub fn flush(&self) -> Result<(), JournalError> {
        self.with_retry(flush_queue)
    }

    /// Lazily page through every entry that is not DONE or PERMANENTLY_FAILED,
    /// in id order.
    pub fn pending(&self) -> EntryPages<'_> {
        EntryPages::new(self, Listing::Pending)
    }

    /// Lazily page through DONE entries, in id order.
    pub fn completed(&self) -> EntryPages<'_> {
        EntryPages::new(self, Listing::Completed)
    }

    /// All PERMANENTLY_FAILED entries.
    pub fn permanently_failed(&self) -> Result<Vec<JournalEntry>, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let mut stmt = inner.conn.prepare_cached(&format!(
                "SELECT {} FROM entries WHERE stage = ?1 ORDER BY id",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt.query_map([Stage::PermanentlyFailed.as_str()], RawEntry::from_row)?;
            let mut entries = Vec::new();
            for raw in rows {
                entries.push(raw?.into_entry()?);
            }
            Ok(entries)
        })
    }

    pub fn lookup(&self, source: &Path) -> Result<Option<JournalEntry>, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            select_by_path(&inner.conn, source)
        })
    }

    pub fn get(&self, id: EntryId) -> Result<JournalEntry, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let raw = inner
                .conn
                .query_row(
                    &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                    [id.0],
                    RawEntry::from_row,
                )
                .optional()?;
            raw.ok_or(JournalError::UnknownEntry(id.0))?.into_entry()
        })
    }

    pub fn is_terminal(&self, source: &Path) -> Result<bool, JournalError> {
        Ok(self
            .lookup(source)?
            .map(|entry| entry.stage.is_terminal())
            .unwrap_or(false))
    }

    /// Whether an entry for a source other than `source` claims
    /// `destination`.
    pub fn destination_claimed(&self, destination: &Path, source: &Path) -> Result<bool, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let found: Option<i64> = inner
                .conn
                .query_row(
                    "SELECT id FROM entries WHERE destination = ?1 AND path != ?2 LIMIT 1",
                    [path_to_blob(destination), path_to_blob(source)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Replace a PERMANENTLY_FAILED entry with a fresh INIT entry for a
    /// source that reappeared.
    pub fn supersede(&self, item: &WorkItem) -> Result<EntryId, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let tx = inner.conn.transaction()?;
            let existing = select_by_path(&tx, &item.source)?;
            if let Some(entry) = existing {
                if entry.stage != Stage::PermanentlyFailed {
                    return Err(JournalError::InvalidTransition {
                        id: entry.id.0,
                        from: entry.stage,
                        to: Stage::Init,
                    });
                }
                tx.execute("DELETE FROM entries WHERE id = ?1", [entry.id.0])?;
            }
            let id = insert_item(&tx, item)?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn load_checkpoint(&self, pair_key: &str) -> Result<Option<Checkpoint>, JournalError> {
        self.with_retry(|inner| {
            let checkpoint = inner
                .conn
                .query_row(
                    "SELECT files_done, bytes_done, files_failed FROM checkpoints WHERE pair_key = ?1",
                    [pair_key],
                    |row| {
                        Ok(Checkpoint {
                            files_done: row.get::<_, i64>(0)? as u64,
                            bytes_done: row.get::<_, i64>(1)? as u64,
                            files_failed: row.get::<_, i64>(2)? as u64,
                        })
                    },
                )
                .optional()?;
            Ok(checkpoint)
        })
    }

    pub fn save_checkpoint(&self, pair_key: &str, checkpoint: &Checkpoint) -> Result<(), JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            inner.conn.execute(
                "INSERT INTO checkpoints (pair_key, files_done, bytes_done, files_failed, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(pair_key) DO UPDATE SET
                     files_done = excluded.files_done,
                     bytes_done = excluded.bytes_done,
                     files_failed = excluded.files_failed,
                     updated_at = excluded.updated_at",
                params![
                    pair_key,
                    checkpoint.files_done as i64,
                    checkpoint.bytes_done as i64,
                    checkpoint.files_failed as i64,
                    Utc::now().timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    /// Recompute checkpoint counters from the entries.
    pub fn recount(&self) -> Result<Checkpoint, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let checkpoint = inner.conn.query_row(
                "SELECT
                     COALESCE(SUM(stage = 'DONE'), 0),
                     COALESCE(SUM(CASE WHEN stage = 'DONE' THEN size ELSE 0 END), 0),
                     COALESCE(SUM(stage = 'PERMANENTLY_FAILED'), 0)
                 FROM entries",
                [],
                |row| {
                    Ok(Checkpoint {
                        files_done: row.get::<_, i64>(0)? as u64,
                        bytes_done: row.get::<_, i64>(1)? as u64,
                        files_failed: row.get::<_, i64>(2)? as u64,
                    })
                },
            )?;
            Ok(checkpoint)
        })
    }

    /// Number of entries that are not terminal.
    pub fn remaining(&self) -> Result<u64, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let count: i64 = inner.conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE stage NOT IN ('DONE', 'PERMANENTLY_FAILED')",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn page(&self, listing: Listing, after: i64) -> Result<Vec<JournalEntry>, JournalError> {
        self.with_retry(|inner| {
            flush_queue(inner)?;
            let filter = match listing {
                Listing::Pending => "stage NOT IN ('DONE', 'PERMANENTLY_FAILED')",
                Listing::Completed => "stage = 'DONE'",
            };
            let mut stmt = inner.conn.prepare_cached(&format!(
                "SELECT {} FROM entries WHERE id > ?1 AND {} ORDER BY id LIMIT ?2",
                ENTRY_COLUMNS, filter
            ))?;
            let rows = stmt.query_map(params![after, PAGE_SIZE as i64], RawEntry::from_row)?;
            let mut entries = Vec::with_capacity(PAGE_SIZE);
            for raw in rows {
                entries.push(raw?.into_entry()?);
            }
            Ok(entries)
        })
    }

    /// Run `op` under the lock, retrying SQLite failures with exponential
    /// backoff. Other journal errors are returned immediately.
    fn with_retry<T>(
        &self,
        mut op: impl FnMut(&mut Inner) -> Result<T, JournalError>,
    ) -> Result<T, JournalError> {
        let mut delay = RETRY_BASE;
        let mut attempt = 1;
        loop {
            let result = {
                let mut inner = self.inner.lock();
                op(&mut *inner)
            };
            match result {
                Err(JournalError::Sqlite(e)) if attempt < RETRY_ATTEMPTS => {
                    warn!(attempt, error = %e, "journal operation failed, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Paged iterator over journal entries; holds no lock between pages.
pub struct EntryPages<'a> {
    journal: &'a Journal,
    listing: Listing,
    after: i64,
    buffer: VecDeque<JournalEntry>,
    exhausted: bool,
}

impl<'a> EntryPages<'a> {
    fn new(journal: &'a Journal, listing: Listing) -> Self {
        EntryPages {
            journal,
            listing,
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl Iterator for EntryPages<'_> {
    type Item = Result<JournalEntry, JournalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.journal.page(self.listing, self.after) {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    if let Some(last) = page.last() {
                        self.after = last.id.0;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn flush_queue(inner: &mut Inner) -> Result<(), JournalError> {
    if inner.queue.is_empty() {
        return Ok(());
    }
    let tx = inner.conn.transaction()?;
    write_commits(&tx, inner.queue.iter())?;
    tx.commit()?;
    debug!(commits = inner.queue.len(), "batched journal commits flushed");
    inner.queue.clear();
    inner.queued_since = None;
    Ok(())
}

fn write_commits<'a>(
    tx: &Transaction<'_>,
    commits: impl Iterator<Item = &'a QueuedCommit>,
) -> Result<(), JournalError> {
    let mut stmt = tx.prepare_cached(UPDATE_STAGE)?;
    for commit in commits {
        let fields = &commit.fields;
        let changed = stmt.execute(params![
            commit.stage.as_str(),
            fields.bytes_copied.map(|b| b as i64),
            fields.content_digest.as_ref().map(ChecksumValue::to_string_with_algo),
            fields.clear_digest,
            fields.retry_count.map(i64::from),
            fields.last_error.as_deref(),
            fields.destination.as_deref().map(path_to_blob),
            fields.narrowed,
            commit.at.timestamp_millis(),
            commit.id.0,
        ])?;
        if changed != 1 {
            return Err(JournalError::UnknownEntry(commit.id.0));
        }
    }
    Ok(())
}

/// Validate against the newest queued stage, else the stored one.
fn check_transition(inner: &Inner, id: EntryId, next: Stage) -> Result<(), JournalError> {
    let current = match inner.queue.iter().rev().find(|c| c.id == id) {
        Some(queued) => queued.stage,
        None => {
            let stage: Option<String> = inner
                .conn
                .query_row("SELECT stage FROM entries WHERE id = ?1", [id.0], |row| {
                    row.get(0)
                })
                .optional()?;
            parse_stage(&stage.ok_or(JournalError::UnknownEntry(id.0))?)?
        }
    };
    if !current.can_advance_to(next) {
        return Err(JournalError::InvalidTransition {
            id: id.0,
            from: current,
            to: next,
        });
    }
    Ok(())
}

fn insert_item(tx: &Transaction<'_>, item: &WorkItem) -> Result<EntryId, JournalError> {
    let source = path_to_blob(&item.source);
    tx.prepare_cached(
        "INSERT OR IGNORE INTO entries
             (path, destination, size, source_mtime, stage, expected_digest, discovered_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
    )?
    .execute(params![
        source,
        path_to_blob(&item.destination),
        item.size as i64,
        item.source_mtime_ms,
        Stage::Init.as_str(),
        item.expected_digest.as_ref().map(ChecksumValue::to_string_with_algo),
        item.discovered_at.timestamp_millis(),
    ])?;
    let id: i64 = tx.query_row("SELECT id FROM entries WHERE path = ?1", [source], |row| {
        row.get(0)
    })?;
    Ok(EntryId(id))
}

fn select_by_path(conn: &Connection, source: &Path) -> Result<Option<JournalEntry>, JournalError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM entries WHERE path = ?1", ENTRY_COLUMNS),
            [path_to_blob(source)],
            RawEntry::from_row,
        )
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

/// Row as stored, before text columns are parsed.
struct RawEntry {
    id: i64,
    path: Vec<u8>,
    destination: Vec<u8>,
    size: i64,
    source_mtime: i64,
    stage: String,
    bytes_copied: i64,
    content_digest: Option<String>,
    expected_digest: Option<String>,
    retry_count: i64,
    last_error: Option<String>,
    narrowed: bool,
    discovered_at: i64,
    updated_at: i64,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawEntry {
            id: row.get(0)?,
            path: row.get(1)?,
            destination: row.get(2)?,
            size: row.get(3)?,
            source_mtime: row.get(4)?,
            stage: row.get(5)?,
            bytes_copied: row.get(6)?,
            content_digest: row.get(7)?,
            expected_digest: row.get(8)?,
            retry_count: row.get(9)?,
            last_error: row.get(10)?,
            narrowed: row.get(11)?,
            discovered_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_entry(self) -> Result<JournalEntry, JournalError> {
        Ok(JournalEntry {
            id: EntryId(self.id),
            source: blob_to_path(self.path),
            destination: blob_to_path(self.destination),
            size: self.size as u64,
            source_mtime_ms: self.source_mtime,
            stage: parse_stage(&self.stage)?,
            bytes_copied: self.bytes_copied as u64,
            content_digest: parse_digest(self.content_digest)?,
            expected_digest: parse_digest(self.expected_digest)?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| JournalError::Corrupt(format!("retry_count {}", self.retry_count)))?,
            last_error: self.last_error,
            narrowed: self.narrowed,
            discovered_at: timestamp(self.discovered_at)?,
            updated_at: timestamp(self.updated_at)?,
        })
    }
}

fn parse_stage(s: &str) -> Result<Stage, JournalError> {
    s.parse().map_err(JournalError::Corrupt)
}

fn parse_digest(s: Option<String>) -> Result<Option<ChecksumValue>, JournalError> {
    s.map(|s| ChecksumValue::parse_with_algo(&s).map_err(JournalError::Corrupt))
        .transpose()
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, JournalError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| JournalError::Corrupt(format!("timestamp {}", ms)))
}

#[cfg(unix)]
fn path_to_blob(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn blob_to_path(blob: Vec<u8>) -> PathBuf {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(OsString::from_vec(blob))
}

#[cfg(not(unix))]
fn path_to_blob(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(not(unix))]
fn blob_to_path(blob: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&blob).into_owned())
}
