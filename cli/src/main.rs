//! SafeMove - Command-line interface for the migration engine.
//!
//! Parses arguments (optionally on top of a TOML config file), wires
//! SIGINT/SIGTERM to a cooperative stop, runs the configured pipeline and
//! reports progress and the final summary on stderr.
//!
//! Exit codes: 0 everything migrated, 1 failures or unfinished items remain,
//! 2 fatal error (lock held, journal unavailable, bad configuration).

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _};
use clap::Parser;
use engine::{
    install_signal_handlers, run_pipeline, CancellationToken, Checkpoint, ChecksumAlgorithm,
    DurabilityLevel, ItemOutcome, JournalEntry, MigrationConfig, ProgressCallback, RunSummary,
    ScanReport,
};
use tracing::{error, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// SafeMove - crash-safe, resumable file migration
#[derive(Parser, Debug)]
#[command(name = "safemove")]
#[command(version)]
#[command(about = "Move a file tree to a new root, resuming safely after any interruption")]
struct Args {
    /// Source directory
    #[arg(long, value_name = "PATH")]
    src: Option<PathBuf>,

    /// Destination directory
    #[arg(long, value_name = "PATH")]
    dst: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only finish what the journal already knows about
    #[arg(long)]
    resume: bool,

    /// Number of copy workers
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Copy chunk size in bytes
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<u64>,

    /// Digest algorithm: crc32, md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<String>,

    /// Report what would be moved without touching anything
    #[arg(long)]
    dry_run: bool,

    /// Retries per file before it is given up
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Journal durability: none, flushed, fsynced
    #[arg(long, value_name = "LEVEL")]
    durability: Option<String>,

    /// Journal and lock directory (default: <dst>/.safemove)
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Only migrate files with this extension (repeatable)
    #[arg(long = "ext", value_name = "EXT")]
    extensions: Vec<String>,

    /// Mirror under <dst>/<source dir name>
    #[arg(long)]
    keep_root_dir: bool,

    /// Checksum manifest with expected digests
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Write a checksum manifest of migrated files
    #[arg(long, value_name = "FILE")]
    write_manifest: Option<PathBuf>,

    /// Bytes to keep free on the destination
    #[arg(long, value_name = "BYTES")]
    min_free: Option<u64>,

    /// Log file
    #[arg(long, value_name = "PATH", default_value = "safemove.log")]
    log_file: PathBuf,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// CLI implementation of ProgressCallback for displaying migration progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_ms: AtomicU64,
    files_finished: AtomicU64,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_ms: AtomicU64::new(0),
            files_finished: AtomicU64::new(0),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn name(path: &Path) -> &str {
        path.file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("(unknown)")
    }
}

impl ProgressCallback for CliProgress {
    fn on_run_started(&self, checkpoint: &Checkpoint) {
        if checkpoint.files_done > 0 || checkpoint.files_failed > 0 {
            eprintln!(
                "Resuming: {} files ({}) already migrated, {} failed",
                checkpoint.files_done,
                Self::format_bytes(checkpoint.bytes_done),
                checkpoint.files_failed
            );
        }
    }

    fn on_scan_completed(&self, report: &ScanReport) {
        eprintln!("Plan:");
        eprintln!(
            "  Resumable: {} files ({})",
            report.resumable_files,
            Self::format_bytes(report.resumable_bytes)
        );
        eprintln!(
            "  New: {} files ({})",
            report.new_files,
            Self::format_bytes(report.new_bytes)
        );
        eprintln!("  Already migrated: {}", report.already_done);
        eprintln!(
            "  Total: {} across {} files",
            Self::format_bytes(report.total_bytes()),
            report.total_files()
        );
    }

    fn on_item_started(&self, entry: &JournalEntry) {
        if self.verbose {
            eprintln!("Starting: {} ({})", Self::name(&entry.source), entry.stage);
        }
    }

    fn on_item_progress(&self, source: &Path, bytes_copied: u64, size: u64) {
        // at most one update per 200ms
        let now_ms = self.start_time.elapsed().as_millis() as u64;
        let last = self.last_progress_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < 200 && bytes_copied < size {
            return;
        }
        self.last_progress_ms.store(now_ms, Ordering::Relaxed);

        let percent = if size == 0 {
            100
        } else {
            (bytes_copied as f64 / size as f64 * 100.0) as u32
        };
        eprint!(
            "\r{}: {} {}/{}",
            Self::name(source),
            Self::print_progress_bar(percent),
            Self::format_bytes(bytes_copied),
            Self::format_bytes(size)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_item_retry(&self, source: &Path, attempt: u32, error: &str) {
        eprintln!();
        eprintln!("Retry {} for {}: {}", attempt, Self::name(source), error);
    }

    fn on_item_finished(&self, source: &Path, outcome: &ItemOutcome) {
        self.files_finished.fetch_add(1, Ordering::Relaxed);
        if !self.verbose {
            return;
        }
        let status = match outcome {
            ItemOutcome::Done { narrowed: false, .. } => "Done".to_string(),
            ItemOutcome::Done { narrowed: true, .. } => "Done (copied across devices)".to_string(),
            ItemOutcome::PermanentlyFailed { error } => format!("Failed: {}", error),
            ItemOutcome::Deferred { error } => format!("Deferred: {}", error),
            ItemOutcome::Interrupted => "Interrupted".to_string(),
        };
        eprintln!();
        eprintln!("{}: {}", Self::name(source), status);
    }

    fn on_run_completed(&self, summary: &RunSummary) {
        eprintln!();
        if summary.stopped {
            eprintln!("Migration stopped; run again to continue.");
        } else {
            eprintln!("Migration complete!");
        }

        eprintln!(
            "Summary: {} done, {} failed, {} deferred, {} interrupted ({} handled)",
            summary.files_done,
            summary.files_permanently_failed,
            summary.files_deferred,
            summary.files_interrupted,
            self.files_finished.load(Ordering::Relaxed)
        );
        eprintln!("Bytes moved: {}", Self::format_bytes(summary.bytes_done));
        eprintln!(
            "Overall: {} files ({}) migrated, {} remaining",
            summary.checkpoint.files_done,
            Self::format_bytes(summary.checkpoint.bytes_done),
            summary.remaining
        );
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if !summary.permanently_failed.is_empty() {
            eprintln!();
            eprintln!("Failed files:");
            for failed in &summary.permanently_failed {
                eprintln!(
                    "  {} (after {} attempts): {}",
                    failed.source.display(),
                    failed.retry_count,
                    failed.error
                );
            }
        }

        if !summary.narrowed.is_empty() {
            eprintln!();
            eprintln!("Copied across devices (rename was not atomic):");
            for path in &summary.narrowed {
                eprintln!("  {}", path.display());
            }
        }
    }
}

/// Parse arguments, set up logging and signals, then run the pipeline
fn main() -> ExitCode {
    let args = Args::parse();

    let log_guard = match init_logging(&args) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {:#}", e);
            None
        }
    };

    let cancel = CancellationToken::new();
    if let Err(e) = install_signal_handlers(cancel.clone()) {
        warn!(error = %e, "signal handlers not installed; stop with care");
    }

    let code = exit_code(run_cli(&args, cancel));
    // flushes the log file writer
    drop(log_guard);
    ExitCode::from(code)
}

fn exit_code(result: anyhow::Result<i32>) -> u8 {
    match result {
        Ok(code) => u8::try_from(code).unwrap_or(2),
        Err(e) => {
            error!(error = %format!("{:#}", e), "fatal");
            eprintln!("Error: {:#}", e);
            2
        }
    }
}

/// stderr plus a plain-text log file; `--verbose` forces debug level.
fn init_logging(args: &Args) -> anyhow::Result<WorkerGuard> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_name = args
        .log_file
        .file_name()
        .ok_or_else(|| anyhow!("invalid log file path {}", args.log_file.display()))?;
    let dir = args
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {}", e))?;
    Ok(guard)
}

/// Merge the config file (if any) with command-line overrides.
fn build_config(args: &Args) -> anyhow::Result<MigrationConfig> {
    let mut config = match &args.config {
        Some(path) => MigrationConfig::from_toml_file(path)?,
        None => MigrationConfig::default(),
    };

    if let Some(src) = &args.src {
        config.source = src.clone();
    }
    if let Some(dst) = &args.dst {
        config.destination = dst.clone();
    }
    if config.source.as_os_str().is_empty() || config.destination.as_os_str().is_empty() {
        bail!("both --src and --dst are required (or set them in --config)");
    }

    if args.resume {
        config.resume_only = true;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if args.keep_root_dir {
        config.keep_root_dir = true;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(hash) = &args.hash {
        config.digest = hash.parse::<ChecksumAlgorithm>().map_err(|e| {
            anyhow!("{}. Must be 'crc32', 'md5', 'sha256', or 'blake3'", e)
        })?;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(durability) = &args.durability {
        config.durability = durability.parse::<DurabilityLevel>().map_err(|e| {
            anyhow!("{}. Must be 'none', 'flushed', or 'fsynced'", e)
        })?;
    }
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = Some(state_dir.clone());
    }
    if !args.extensions.is_empty() {
        config.extensions = args.extensions.clone();
    }
    if let Some(manifest) = &args.manifest {
        config.manifest = Some(manifest.clone());
    }
    if let Some(write_manifest) = &args.write_manifest {
        config.write_manifest = Some(write_manifest.clone());
    }
    if let Some(min_free) = args.min_free {
        config.min_free_space = min_free;
    }

    config.validate()?;
    Ok(config)
}

/// Main CLI logic - separated for testability. Returns the exit code.
fn run_cli(args: &Args, cancel: CancellationToken) -> anyhow::Result<i32> {
    let config = build_config(args)?;
    let dry_run = config.dry_run;
    let progress = CliProgress::new(args.verbose);

    let ctx = run_pipeline(config, cancel, Some(&progress)).context("migration failed")?;

    if dry_run {
        return Ok(0);
    }
    Ok(ctx.summary.as_ref().map(RunSummary::exit_code).unwrap_or(0))
}
