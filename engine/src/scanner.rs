//! Work discovery.
//!
//! Pending journal entries are drained first, so interrupted items resume
//! before anything new starts. A differential walk of the source tree then
//! adds files the journal does not know about yet. Both phases stream; the
//! walk registers new items in fixed-size batches so memory stays bounded
//! however large the tree is.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::cancel::CancellationToken;
use crate::checksums::ChecksumValue;
use crate::config::MigrationConfig;
use crate::error::MigrateError;
use crate::fs_ops;
use crate::journal::Journal;
use crate::model::{JournalEntry, ScanReport, Stage, TreeLayout, WorkItem};

/// What the walk decided about one source file.
enum Known {
    /// No entry yet
    New,
    /// PERMANENTLY_FAILED entry whose file has since changed
    Reappeared,
    /// DONE, or PERMANENTLY_FAILED with an unchanged file
    Finished,
    /// Non-terminal entry, already emitted by the pending drain
    InFlight,
}

pub struct Scanner<'a> {
    journal: &'a Journal,
    layout: &'a TreeLayout,
    config: &'a MigrationConfig,
    expected: &'a HashMap<PathBuf, ChecksumValue>,
    extensions: Vec<String>,
}

impl<'a> Scanner<'a> {
    /// `expected` maps paths relative to the source root to manifest digests.
    pub fn new(
        journal: &'a Journal,
        layout: &'a TreeLayout,
        config: &'a MigrationConfig,
        expected: &'a HashMap<PathBuf, ChecksumValue>,
    ) -> Self {
        Scanner {
            journal,
            layout,
            config,
            expected,
            extensions: config.normalized_extensions(),
        }
    }

    /// Feed every entry that needs work to `emit`, pending entries first.
    ///
    /// Stops quietly once `cancel` fires.
    pub fn run(
        &self,
        cancel: &CancellationToken,
        mut emit: impl FnMut(JournalEntry) -> Result<(), MigrateError>,
    ) -> Result<(), MigrateError> {
        let mut resumed = 0u64;
        for entry in self.journal.pending() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let entry = entry?;
            resumed += 1;
            emit(entry)?;
        }
        if resumed > 0 {
            info!(entries = resumed, "resuming journaled entries");
        }

        if self.config.resume_only {
            debug!("resume only, skipping source walk");
            return Ok(());
        }

        let mut batch: Vec<WorkItem> = Vec::with_capacity(self.config.scan_batch_size);
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut discovered = 0u64;

        for file in self.walk() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let (path, metadata) = match file {
                Some(found) => found,
                None => continue,
            };

            match self.classify(&path, &metadata)? {
                Known::Finished | Known::InFlight => continue,
                Known::Reappeared => {
                    let item = self.work_item(path, &metadata, &claimed)?;
                    info!(source = %item.source.display(), "source reappeared after permanent failure");
                    let id = self.journal.supersede(&item)?;
                    emit(self.journal.get(id)?)?;
                    discovered += 1;
                }
                Known::New => {
                    let item = self.work_item(path, &metadata, &claimed)?;
                    claimed.insert(item.destination.clone());
                    batch.push(item);
                    if batch.len() >= self.config.scan_batch_size {
                        discovered += batch.len() as u64;
                        self.register(&mut batch, &mut emit)?;
                        claimed.clear();
                    }
                }
            }
        }
        discovered += batch.len() as u64;
        self.register(&mut batch, &mut emit)?;

        info!(files = discovered, "source walk complete");
        Ok(())
    }

    /// Count what a run would do without touching the journal.
    pub fn plan(&self) -> Result<ScanReport, MigrateError> {
        let mut report = ScanReport::default();
        for entry in self.journal.pending() {
            let entry = entry?;
            report.resumable_files += 1;
            report.resumable_bytes += entry.size.saturating_sub(entry.bytes_copied);
        }
        if self.config.resume_only {
            return Ok(report);
        }

        for (path, metadata) in self.walk().flatten() {
            match self.classify(&path, &metadata)? {
                Known::New | Known::Reappeared => {
                    report.new_files += 1;
                    report.new_bytes += metadata.len();
                }
                Known::Finished => report.already_done += 1,
                Known::InFlight => {}
            }
        }
        Ok(report)
    }

    fn register(
        &self,
        batch: &mut Vec<WorkItem>,
        emit: &mut impl FnMut(JournalEntry) -> Result<(), MigrateError>,
    ) -> Result<(), MigrateError> {
        if batch.is_empty() {
            return Ok(());
        }
        let ids = self.journal.begin_batch(batch)?;
        debug!(items = ids.len(), "registered scan batch");
        batch.clear();
        for id in ids {
            emit(self.journal.get(id)?)?;
        }
        Ok(())
    }

    fn classify(&self, path: &Path, metadata: &std::fs::Metadata) -> Result<Known, MigrateError> {
        let entry = match self.journal.lookup(path)? {
            Some(entry) => entry,
            None => return Ok(Known::New),
        };
        Ok(match entry.stage {
            Stage::Done => Known::Finished,
            Stage::PermanentlyFailed => {
                if entry.size != metadata.len()
                    || entry.source_mtime_ms != fs_ops::mtime_ms(metadata)
                {
                    Known::Reappeared
                } else {
                    Known::Finished
                }
            }
            _ => Known::InFlight,
        })
    }

    fn work_item(
        &self,
        source: PathBuf,
        metadata: &std::fs::Metadata,
        claimed: &HashSet<PathBuf>,
    ) -> Result<WorkItem, MigrateError> {
        let mirrored = self
            .layout
            .destination_for(&source)
            .ok_or_else(|| MigrateError::InvalidPath {
                path: source.clone(),
                reason: "outside the source root".to_string(),
            })?;

        // the source's own superseded entry does not occupy its mirrored path
        let journal = self.journal;
        let mut lookup_error = None;
        let destination = fs_ops::unique_path(&mirrored, |candidate| {
            claimed.contains(candidate)
                || candidate.exists()
                || journal.destination_claimed(candidate, &source).unwrap_or_else(|e| {
                    lookup_error = Some(e);
                    false
                })
        });
        if let Some(e) = lookup_error {
            return Err(e.into());
        }
        if destination != mirrored {
            debug!(source = %source.display(), destination = %destination.display(),
                "destination occupied, renamed");
        }

        let expected_digest = self
            .layout
            .relative_source(&source)
            .and_then(|rel| self.expected.get(rel))
            .cloned();

        Ok(WorkItem {
            size: metadata.len(),
            source_mtime_ms: fs_ops::mtime_ms(metadata),
            discovered_at: Utc::now(),
            expected_digest,
            destination,
            source,
        })
    }

    /// Regular files under the source root in file-name order, skipping
    /// engine-owned paths. Unreadable entries yield `None` after a warning.
    fn walk(&self) -> impl Iterator<Item = Option<(PathBuf, std::fs::Metadata)>> + '_ {
        WalkDir::new(&self.layout.source_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !self.excluded(entry))
            .map(move |entry| match entry {
                Ok(entry) if entry.file_type().is_file() && self.wanted(entry.path()) => {
                    match entry.metadata() {
                        Ok(metadata) => Some((entry.into_path(), metadata)),
                        Err(e) => {
                            warn!(path = %entry.path().display(), error = %e, "cannot stat file, skipping");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "cannot read directory entry, skipping");
                    None
                }
            })
    }

    fn excluded(&self, entry: &DirEntry) -> bool {
        let path = entry.path();
        if entry.depth() == 0 {
            return false;
        }
        // pruning the directory itself skips its whole subtree
        if entry.file_type().is_dir() {
            return path == self.layout.state_dir || path == self.layout.destination_root;
        }
        fs_ops::is_temp_path(path)
    }

    fn wanted(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                self.extensions.iter().any(|wanted| *wanted == ext)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use crate::journal::BatchPolicy;
    use crate::model::StageFields;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: TreeLayout,
        journal: Journal,
        config: MigrationConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            let root = dir.path().canonicalize().expect("Failed to canonicalize temp dir");
            let src = root.join("src");
            let dst = root.join("dst");
            fs::create_dir_all(&src).expect("Failed to create source dir");
            fs::create_dir_all(&dst).expect("Failed to create destination dir");
            let journal = Journal::open(
                &root.join("journal.sqlite3"),
                DurabilityLevel::None,
                BatchPolicy::default(),
            )
            .expect("Failed to open journal");
            let mut config = MigrationConfig::new(&src, &dst);
            config.scan_batch_size = 2;
            Fixture {
                layout: TreeLayout {
                    source_root: src.clone(),
                    destination_root: dst.clone(),
                    mirror_root: dst.clone(),
                    state_dir: dst.join(".safemove"),
                },
                _dir: dir,
                journal,
                config,
            }
        }

        fn touch(&self, rel: &str, content: &[u8]) -> PathBuf {
            let path = self.layout.source_root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("Failed to create parent dir");
            }
            fs::write(&path, content).expect("Failed to write file");
            path
        }

        fn collect(&self, expected: &HashMap<PathBuf, ChecksumValue>) -> Vec<JournalEntry> {
            let scanner = Scanner::new(&self.journal, &self.layout, &self.config, expected);
            let mut seen = Vec::new();
            scanner
                .run(&CancellationToken::new(), |entry| {
                    seen.push(entry);
                    Ok(())
                })
                .expect("Scan failed");
            seen
        }
    }

    fn names(entries: &[JournalEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.source.file_name().unwrap_or_default().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_cold_walk_is_sorted_and_filtered() {
        let mut fx = Fixture::new();
        fx.config.extensions = vec![".MKV".to_string(), "mp4".to_string()];
        fx.touch("b.mkv", b"b");
        fx.touch("a.MP4", b"a");
        fx.touch("c.txt", b"c");
        fx.touch("sub/d.mkv", b"d");
        fx.touch("e.mkv.safemove-part", b"partial");

        let entries = fx.collect(&HashMap::new());
        assert_eq!(names(&entries), vec!["a.MP4", "b.mkv", "d.mkv"]);
        assert_eq!(entries[2].destination, fx.layout.mirror_root.join("sub/d.mkv"));
        assert!(entries.iter().all(|e| e.stage == Stage::Init));
    }

    #[test]
    fn test_nested_destination_and_state_dir_are_skipped() {
        let mut fx = Fixture::new();
        let nested = fx.layout.source_root.join("out");
        fx.layout.destination_root = nested.clone();
        fx.layout.mirror_root = nested.clone();
        fx.layout.state_dir = fx.layout.source_root.join("state");
        fx.touch("keep.bin", b"k");
        fx.touch("out/copied.bin", b"c");
        fx.touch("state/journal.sqlite3", b"j");

        let entries = fx.collect(&HashMap::new());
        assert_eq!(names(&entries), vec!["keep.bin"]);
    }

    #[test]
    fn test_done_entries_are_not_rescanned() {
        let fx = Fixture::new();
        fx.touch("one.bin", b"1");
        fx.touch("two.bin", b"2");

        let first = fx.collect(&HashMap::new());
        assert_eq!(first.len(), 2);
        let done = &first[0];
        for stage in [
            Stage::OpenTemp,
            Stage::Verified,
            Stage::SourceDirSynced,
            Stage::Done,
        ] {
            fx.journal
                .commit_stage(done.id, stage, StageFields::new())
                .expect("Failed to commit stage");
        }

        // the DONE file is still on disk, as if its removal were undone
        let second = fx.collect(&HashMap::new());
        assert_eq!(names(&second), vec!["two.bin"]);
        assert_eq!(second[0].id, first[1].id);
    }

    #[test]
    fn test_reappeared_file_supersedes_permanent_failure() {
        let fx = Fixture::new();
        let path = fx.touch("flaky.bin", b"short");
        let first = fx.collect(&HashMap::new());
        fx.journal
            .commit_stage(first[0].id, Stage::PermanentlyFailed, StageFields::new().error("boom"))
            .expect("Failed to commit failure");

        assert!(fx.collect(&HashMap::new()).is_empty());

        fs::write(&path, b"a longer body").expect("Failed to rewrite file");
        let again = fx.collect(&HashMap::new());
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].stage, Stage::Init);
        assert_eq!(again[0].size, 13);
        assert_ne!(again[0].id, first[0].id);
        assert_eq!(again[0].destination, first[0].destination);
        assert_eq!(again[0].destination, fx.layout.mirror_root.join("flaky.bin"));
    }

    #[test]
    fn test_occupied_destination_gets_unique_name() {
        let fx = Fixture::new();
        fx.touch("movie.mkv", b"m");
        fs::write(fx.layout.mirror_root.join("movie.mkv"), b"other").expect("Failed to write file");

        let entries = fx.collect(&HashMap::new());
        assert_eq!(entries[0].destination, fx.layout.mirror_root.join("movie_1.mkv"));
    }

    #[test]
    fn test_manifest_digest_attached_by_relative_path() {
        let fx = Fixture::new();
        fx.touch("dir/x.bin", b"x");
        let digest = ChecksumValue::new(fx.config.digest, "ab".repeat(32));
        let mut expected = HashMap::new();
        expected.insert(PathBuf::from("dir/x.bin"), digest.clone());

        let entries = fx.collect(&expected);
        assert_eq!(entries[0].expected_digest, Some(digest));
    }

    #[test]
    fn test_plan_counts_without_registering() {
        let fx = Fixture::new();
        fx.touch("a.bin", b"aaaa");
        fx.touch("b.bin", b"bb");

        let expected = HashMap::new();
        let scanner = Scanner::new(&fx.journal, &fx.layout, &fx.config, &expected);
        let report = scanner.plan().expect("Plan failed");
        assert_eq!(report.new_files, 2);
        assert_eq!(report.new_bytes, 6);
        assert_eq!(report.resumable_files, 0);
        assert_eq!(fx.journal.remaining().expect("Failed to count"), 0);
    }

    #[test]
    fn test_resume_only_skips_walk() {
        let mut fx = Fixture::new();
        fx.touch("a.bin", b"a");
        fx.collect(&HashMap::new());
        fx.touch("b.bin", b"b");

        fx.config.resume_only = true;
        let entries = fx.collect(&HashMap::new());
        assert_eq!(names(&entries), vec!["a.bin"]);
    }
}
