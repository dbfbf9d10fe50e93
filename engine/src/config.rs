//! Typed run configuration.
//!
//! `MigrationConfig` is loaded from TOML (every field optional, defaults
//! applied by serde) and then overridden by command-line flags. `validate()`
//! must pass before a job is created.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::MigrateError;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// How hard a journal commit pushes data to stable storage before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityLevel {
    /// Leave flushing to the OS
    None,
    /// Durable against process crash; WAL synced at checkpoints only
    Flushed,
    /// Every commit synced to disk
    #[default]
    Fsynced,
}

impl std::str::FromStr for DurabilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "flushed" => Ok(Self::Flushed),
            "fsynced" => Ok(Self::Fsynced),
            other => Err(format!("unknown durability level '{}'", other)),
        }
    }
}

/// A pipeline stage reference: registry name plus free-form parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub params: toml::Table,
}

impl StageSpec {
    pub fn named(name: &str) -> Self {
        StageSpec {
            name: name.to_string(),
            params: toml::Table::new(),
        }
    }
}

/// Full configuration for one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Journal and lock directory; `<destination>/.safemove` when unset
    pub state_dir: Option<PathBuf>,
    /// Mirror under `<destination>/<source leaf name>`
    pub keep_root_dir: bool,
    /// Target extensions, case-insensitive, with or without the dot; empty = all
    pub extensions: Vec<String>,

    pub workers: usize,
    pub pin_workers_per_device: bool,
    pub queue_depth: usize,

    pub chunk_size: u64,
    pub digest: ChecksumAlgorithm,
    pub durability: DurabilityLevel,
    pub max_retries: u32,
    pub dry_run: bool,
    /// Skip the differential walk; only finish what the journal knows about
    pub resume_only: bool,
    pub scan_batch_size: usize,

    pub journal_batch_size: usize,
    pub journal_batch_interval_ms: u64,
    pub checkpoint_every_items: u64,
    pub checkpoint_interval_ms: u64,
    pub progress_commit_bytes: u64,

    pub stall_timeout_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Bytes that must stay free on the destination
    pub min_free_space: u64,

    pub zero_copy: bool,
    pub preserve_sparse: bool,

    /// Checksum manifest supplying expected digests
    pub manifest: Option<PathBuf>,
    /// Where to write a manifest of migrated files
    pub write_manifest: Option<PathBuf>,

    pub stages: Vec<StageSpec>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            source: PathBuf::new(),
            destination: PathBuf::new(),
            state_dir: None,
            keep_root_dir: false,
            extensions: Vec::new(),
            workers: 1,
            pin_workers_per_device: true,
            queue_depth: 64,
            chunk_size: 4 * MIB,
            digest: ChecksumAlgorithm::Blake3,
            durability: DurabilityLevel::Fsynced,
            max_retries: 3,
            dry_run: false,
            resume_only: false,
            scan_batch_size: 1000,
            journal_batch_size: 64,
            journal_batch_interval_ms: 1000,
            checkpoint_every_items: 100,
            checkpoint_interval_ms: 5000,
            progress_commit_bytes: 256 * MIB,
            stall_timeout_ms: 120_000,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
            min_free_space: 5 * GIB,
            zero_copy: true,
            preserve_sparse: true,
            manifest: None,
            write_manifest: None,
            stages: vec![StageSpec::named("migrate"), StageSpec::named("prune")],
        }
    }
}

impl MigrationConfig {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        MigrationConfig {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, MigrateError> {
        toml::from_str(content).map_err(|e| MigrateError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, MigrateError> {
        let content = std::fs::read_to_string(path).map_err(|e| MigrateError::io(path, e))?;
        Self::from_toml_str(&content)
            .map_err(|e| MigrateError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), MigrateError> {
        let fail = |msg: &str| Err(MigrateError::Config(msg.to_string()));

        if self.source.as_os_str().is_empty() {
            return fail("source path is required");
        }
        if self.destination.as_os_str().is_empty() {
            return fail("destination path is required");
        }
        if self.workers == 0 {
            return fail("workers must be at least 1");
        }
        if self.queue_depth == 0 {
            return fail("queue_depth must be at least 1");
        }
        if self.chunk_size == 0 || self.chunk_size > GIB {
            return fail("chunk_size must be between 1 byte and 1 GiB");
        }
        if self.progress_commit_bytes == 0 {
            return fail("progress_commit_bytes must be positive");
        }
        if self.scan_batch_size == 0 {
            return fail("scan_batch_size must be at least 1");
        }
        if self.journal_batch_size == 0 {
            return fail("journal_batch_size must be at least 1");
        }
        if self.checkpoint_every_items == 0 {
            return fail("checkpoint_every_items must be at least 1");
        }
        if self.stall_timeout_ms == 0 {
            return fail("stall_timeout_ms must be positive");
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return fail("retry_backoff_base_ms exceeds retry_backoff_max_ms");
        }
        if self.stages.is_empty() {
            return fail("at least one pipeline stage is required");
        }
        for ext in &self.extensions {
            let ext = ext.trim_start_matches('.');
            if ext.is_empty() || ext.contains(['/', '\\']) {
                return Err(MigrateError::Config(format!("invalid extension '{}'", ext)));
            }
        }
        Ok(())
    }

    /// Extensions lowercased without their leading dot.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect()
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn journal_batch_interval(&self) -> Duration {
        Duration::from_millis(self.journal_batch_interval_ms)
    }

    /// Exponential backoff before retry `attempt` (1-based), capped.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
