//! # SafeMove Engine - Crash-Safe File Migration Library
//!
//! A headless engine that moves large file trees from a source root to a
//! destination root without losing data across crashes, power loss or
//! concurrent invocations. Designed as the foundation for multiple front-ends
//! (CLI, automation).
//!
//! ## Overview
//!
//! Every file goes through a journaled state machine: copy into a temp file,
//! make the data durable, verify it, rename it into place, make the rename
//! durable, and only then remove the source. The journal (SQLite) records the
//! last completed step of every file, so a restarted run resumes each file
//! exactly where it stopped.
//!
//! - Resumable copies: partial temp files are re-verified, not re-copied
//! - Content verification with CRC32, MD5, SHA-256 or BLAKE3
//! - One run per root pair, enforced by an advisory lock
//! - Cooperative stop at transition boundaries (SIGINT/SIGTERM)
//! - Device-pinned worker pool
//! - Progress reporting via callbacks (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use safemove_engine::{create_job, plan_job, run_job, MigrationConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MigrationConfig::new("/mnt/old", "/mnt/new");
//! let mut job = create_job(config)?;
//!
//! // Dry run: what would be moved
//! let report = plan_job(&job)?;
//! println!("Will move {} files", report.total_files());
//!
//! // Move everything
//! let summary = run_job(&mut job, None)?;
//! for failed in &summary.permanently_failed {
//!     println!("{}: {}", failed.source.display(), failed.error);
//! }
//! std::process::exit(summary.exit_code());
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (stages, journal entries, summaries)
//! - **error**: Error taxonomy
//! - **config**: Typed configuration, loadable from TOML
//! - **journal**: Durable per-file state store
//! - **scanner**: Work discovery (journal drain + differential walk)
//! - **copier**: The per-file migration state machine
//! - **verifier**: Size and digest checks
//! - **job**: Job lifecycle (create, plan, run)
//! - **pool**: Device-pinned worker dispatch
//! - **pipeline**: Static stage registry
//! - **lock**: Run lock per root pair
//! - **cancel**: Cancellation token and signal wiring
//! - **fs_ops**: Low-level filesystem operations
//! - **watchdog**: Deadline for I/O calls that may hang
//! - **progress**: Progress callback trait
//! - **checksums**: Digest algorithms and checksum manifests

pub mod model;
pub mod error;
pub mod config;
pub mod checksums;
pub mod fs_ops;
pub mod journal;
pub mod lock;
pub mod cancel;
pub mod verifier;
pub mod watchdog;
pub mod scanner;
pub mod copier;
pub mod pool;
pub mod job;
pub mod pipeline;
pub mod progress;
pub(crate) mod failpoint;

// Re-export main types and functions
pub use model::{
    Checkpoint, EntryId, FailedItem, ItemOutcome, JournalEntry, RunSummary, ScanReport, Stage,
    StageFields, TreeLayout, WorkItem,
};
pub use error::{JournalError, MigrateError};
pub use config::{DurabilityLevel, MigrationConfig, StageSpec};
pub use journal::{BatchPolicy, Journal};
pub use lock::RunLock;
pub use cancel::{install_signal_handlers, CancellationToken};
pub use job::{create_job, plan_job, run_job, MigrationJob};
pub use pipeline::{run_pipeline, Context};
pub use progress::ProgressCallback;
pub use checksums::{ChecksumAlgorithm, ChecksumValue, compute_file_checksum};
