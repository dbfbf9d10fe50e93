//! Static stage registry.
//!
//! A configuration names its stages (`[[stages]] name = "..."`); every name
//! is resolved against the fixed set below before any work starts, so a
//! typo fails the whole run up front instead of halfway through.

use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::config::{MigrationConfig, StageSpec};
use crate::error::MigrateError;
use crate::fs_ops;
use crate::job::{create_job, plan_job, run_job, MigrationJob};
use crate::model::{RunSummary, ScanReport, TreeLayout};
use crate::progress::ProgressCallback;

/// Shared state handed from stage to stage.
pub struct Context<'a> {
    pub config: MigrationConfig,
    pub cancel: CancellationToken,
    pub progress: Option<&'a dyn ProgressCallback>,
    pub layout: Option<TreeLayout>,
    pub scan_report: Option<ScanReport>,
    pub summary: Option<RunSummary>,
}

impl<'a> Context<'a> {
    pub fn new(
        config: MigrationConfig,
        cancel: CancellationToken,
        progress: Option<&'a dyn ProgressCallback>,
    ) -> Self {
        Context {
            config,
            cancel,
            progress,
            layout: None,
            scan_report: None,
            summary: None,
        }
    }

    fn job(&mut self) -> Result<MigrationJob, MigrateError> {
        let mut job = create_job(self.config.clone())?;
        job.cancel = self.cancel.clone();
        self.layout = Some(job.layout.clone());
        Ok(job)
    }

    fn layout(&mut self) -> Result<TreeLayout, MigrateError> {
        match &self.layout {
            Some(layout) => Ok(layout.clone()),
            None => Ok(self.job()?.layout),
        }
    }

    fn report_scan(&mut self, report: ScanReport) {
        if let Some(progress) = self.progress {
            progress.on_scan_completed(&report);
        }
        self.scan_report = Some(report);
    }
}

pub trait Stage {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &mut Context<'_>) -> Result<(), MigrateError>;
}

/// Dry-run scan; fills `scan_report`.
struct ScanStage;

impl Stage for ScanStage {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<(), MigrateError> {
        let job = ctx.job()?;
        let report = plan_job(&job)?;
        ctx.report_scan(report);
        Ok(())
    }
}

/// The migration itself; in dry-run mode only a scan report is produced.
struct MigrateStage;

impl Stage for MigrateStage {
    fn name(&self) -> &'static str {
        "migrate"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<(), MigrateError> {
        let mut job = ctx.job()?;
        if ctx.config.dry_run {
            let report = plan_job(&job)?;
            ctx.report_scan(report);
            return Ok(());
        }
        let summary = run_job(&mut job, ctx.progress)?;
        ctx.summary = Some(summary);
        Ok(())
    }
}

/// Remove source directories the migration emptied.
struct PruneStage {
    remove_root: bool,
}

impl Stage for PruneStage {
    fn name(&self) -> &'static str {
        "prune"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<(), MigrateError> {
        let clean = match &ctx.summary {
            Some(summary) => {
                !summary.stopped && summary.permanently_failed.is_empty() && summary.remaining == 0
            }
            None => false,
        };
        if !clean || ctx.config.dry_run {
            debug!("migration incomplete, source directories left in place");
            return Ok(());
        }

        let layout = ctx.layout()?;
        let removed = fs_ops::prune_empty_dirs(&layout.source_root, self.remove_root);
        info!(source = %layout.source_root.display(), removed, "pruned empty directories");
        Ok(())
    }
}

/// Map stage specs to implementations, rejecting unknown names and
/// parameters.
pub fn resolve(specs: &[StageSpec]) -> Result<Vec<Box<dyn Stage>>, MigrateError> {
    specs.iter().map(resolve_one).collect()
}

fn resolve_one(spec: &StageSpec) -> Result<Box<dyn Stage>, MigrateError> {
    let allowed: &[&str] = match spec.name.as_str() {
        "scan" | "migrate" => &[],
        "prune" => &["remove_root"],
        other => {
            return Err(MigrateError::Config(format!(
                "unknown pipeline stage '{}'",
                other
            )))
        }
    };
    if let Some(key) = spec.params.keys().find(|key| !allowed.contains(&key.as_str())) {
        return Err(MigrateError::Config(format!(
            "stage '{}' has no parameter '{}'",
            spec.name, key
        )));
    }

    Ok(match spec.name.as_str() {
        "scan" => Box::new(ScanStage),
        "migrate" => Box::new(MigrateStage),
        _ => {
            let remove_root = match spec.params.get("remove_root") {
                None => false,
                Some(toml::Value::Boolean(value)) => *value,
                Some(other) => {
                    return Err(MigrateError::Config(format!(
                        "prune: remove_root must be a boolean, got {}",
                        other.type_str()
                    )))
                }
            };
            Box::new(PruneStage { remove_root })
        }
    })
}

/// Resolve and run the configured stages in order.
pub fn run_pipeline<'a>(
    config: MigrationConfig,
    cancel: CancellationToken,
    progress: Option<&'a dyn ProgressCallback>,
) -> Result<Context<'a>, MigrateError> {
    let stages = resolve(&config.stages)?;
    let mut ctx = Context::new(config, cancel, progress);
    for stage in &stages {
        debug!(stage = stage.name(), "stage starting");
        stage.run(&mut ctx)?;
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(root: &std::path::Path) -> MigrationConfig {
        let mut config = MigrationConfig::new(root.join("src"), root.join("dst"));
        config.min_free_space = 0;
        config.retry_backoff_base_ms = 1;
        config.retry_backoff_max_ms = 1;
        config
    }

    #[test]
    fn test_unknown_stage_is_config_error() {
        let result = resolve(&[StageSpec::named("migrate"), StageSpec::named("transcode")]);
        assert!(matches!(result, Err(MigrateError::Config(msg)) if msg.contains("transcode")));
    }

    #[test]
    fn test_prune_params_are_checked() {
        let mut spec = StageSpec::named("prune");
        spec.params.insert("remove_root".to_string(), toml::Value::Boolean(true));
        let stages = resolve(&[spec.clone()]).expect("Valid prune spec rejected");
        assert_eq!(stages[0].name(), "prune");

        spec.params.insert("remove_root".to_string(), toml::Value::String("yes".to_string()));
        assert!(matches!(resolve(&[spec.clone()]), Err(MigrateError::Config(_))));

        let mut extra = StageSpec::named("migrate");
        extra.params.insert("speed".to_string(), toml::Value::Integer(3));
        assert!(matches!(resolve(&[extra]), Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_stages_parse_from_toml() {
        let config = MigrationConfig::from_toml_str(
            r#"
            source = "/a"
            destination = "/b"

            [[stages]]
            name = "migrate"

            [[stages]]
            name = "prune"
            params = { remove_root = true }
            "#,
        )
        .expect("Failed to parse config");
        let stages = resolve(&config.stages).expect("Failed to resolve stages");
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["migrate", "prune"]);
    }

    #[test]
    fn test_default_pipeline_migrates_and_prunes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("season1/extras")).expect("Failed to create dirs");
        fs::write(src.join("season1/ep1.mkv"), b"one").expect("Failed to write file");
        fs::write(src.join("season1/extras/bts.mkv"), b"two").expect("Failed to write file");

        let ctx = run_pipeline(config_for(temp_dir.path()), CancellationToken::new(), None)
            .expect("Pipeline failed");

        let summary = ctx.summary.expect("No summary recorded");
        assert_eq!(summary.files_done, 2);
        assert!(!src.join("season1").exists());
        assert!(src.exists());
        assert!(temp_dir.path().join("dst/season1/extras/bts.mkv").exists());
    }

    #[test]
    fn test_dry_run_pipeline_only_reports() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("d")).expect("Failed to create dirs");
        fs::write(src.join("d/a.bin"), b"abc").expect("Failed to write file");

        let mut config = config_for(temp_dir.path());
        config.dry_run = true;
        let ctx = run_pipeline(config, CancellationToken::new(), None).expect("Pipeline failed");

        let report = ctx.scan_report.expect("No scan report");
        assert_eq!(report.new_files, 1);
        assert_eq!(report.new_bytes, 3);
        assert!(ctx.summary.is_none());
        assert!(src.join("d/a.bin").exists());
    }
}
