//! Orchestration entry point.
//!
//! Wires the full flow: probe resources → scan inventory → load cache →
//! detect changes → plan concurrency → (dry-run returns here) → schedule
//! exports → aggregate results → commit successes → flush cache.
//!
//! Per-unit failures never abort the run; only inventory failure or an
//! unusable exporter can. A cache flush failure is a warning — the run's
//! results stay valid, the only cost is a rebuild next time.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use gdweb_platform::SystemResources;

use crate::cache::BuildCache;
use crate::detect::{DetectOptions, detect_dirty};
use crate::exporter::{DEFAULT_EXPORT_TIMEOUT, ExportError, Exporter};
use crate::inventory::{ScanError, ScanOptions, scan_projects};
use crate::planner::plan_jobs;
use crate::scheduler::{JobStatus, SchedulerConfig, run_jobs};
use crate::summary::{Aggregator, BuildSummary};

/// Default location of the persisted build cache.
pub const DEFAULT_CACHE_FILE: &str = ".gdweb/build_cache.json";

/// Options for one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunOptions {
  /// Root directory containing the projects.
  pub projects_dir: PathBuf,

  /// Path of the persisted build cache.
  pub cache_file: PathBuf,

  /// Explicit concurrency override (wins over the planner).
  pub jobs: Option<usize>,

  /// Rebuild everything regardless of fingerprints.
  pub force_rebuild: bool,

  /// Base reference for the VCS secondary change signal.
  pub base_ref: Option<String>,

  /// Run change detection and planning only; never invoke the exporter.
  pub dry_run: bool,

  /// Stop dispatching new jobs after the first fatal failure.
  pub strict: bool,

  /// Per-attempt export timeout.
  pub timeout: Duration,

  /// Permit an empty inventory (warning instead of error).
  pub allow_empty: bool,
}

impl RunOptions {
  pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
    Self {
      projects_dir: projects_dir.into(),
      cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
      jobs: None,
      force_rebuild: false,
      base_ref: None,
      dry_run: false,
      strict: false,
      timeout: DEFAULT_EXPORT_TIMEOUT,
      allow_empty: false,
    }
  }
}

/// Result of one orchestrated run.
#[derive(Debug)]
pub struct RunReport {
  /// The finalized summary; sole observable output of the core.
  pub summary: BuildSummary,

  /// Units discovered by the inventory.
  pub total_units: usize,

  /// Keys of units detected dirty, in stable order.
  pub dirty_units: Vec<String>,

  /// Planned worker-pool size.
  pub job_count: usize,

  /// Whether this was a dry run (no exports invoked).
  pub dry_run: bool,

  /// Set when the cache file could not be written at finalization.
  pub cache_write_failed: bool,
}

/// Errors that abort a run outright.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
  #[error(transparent)]
  Scan(#[from] ScanError),

  #[error(transparent)]
  Exporter(#[from] ExportError),
}

/// Execute one orchestrated build run.
pub async fn run_build<E>(exporter: Arc<E>, options: RunOptions) -> Result<RunReport, RunError>
where
  E: Exporter + 'static,
{
  let started = Instant::now();
  info!(projects_dir = %options.projects_dir.display(), "starting build run");

  // 1. Probe host resources
  let resources = SystemResources::probe();

  // 2. Enumerate build units
  let units = scan_projects(
    &options.projects_dir,
    &ScanOptions {
      allow_empty: options.allow_empty,
    },
  )?;

  // 3. Load prior state
  let mut cache = BuildCache::load(&options.cache_file);

  // 4. Decide what is dirty
  let detection = detect_dirty(
    &units,
    &cache,
    &DetectOptions {
      force_rebuild: options.force_rebuild,
      base_ref: options.base_ref.clone(),
      repo_dir: options.projects_dir.clone(),
    },
  );

  // 5. Size the worker pool
  let job_count = plan_jobs(detection.dirty.len(), &resources, options.jobs);
  let dirty_units: Vec<String> = detection.dirty.iter().map(|u| u.key.clone()).collect();

  info!(
    total = units.len(),
    dirty = detection.dirty.len(),
    skipped = detection.skipped.len(),
    jobs = job_count,
    "build plan computed"
  );

  // Dry run: detection and planning only
  if options.dry_run {
    info!("dry run, not invoking the exporter");
    let mut summary = BuildSummary {
      skipped: detection.skipped.len(),
      ..Default::default()
    };
    summary.wall_time_ms = started.elapsed().as_millis() as u64;
    return Ok(RunReport {
      summary,
      total_units: units.len(),
      dirty_units,
      job_count,
      dry_run: true,
      cache_write_failed: false,
    });
  }

  // 6. Verify the exporter before spending any scheduling effort
  let version = exporter.verify().await?;
  info!(version = %version, "exporter verified");

  // 7. Schedule exports; ingest results single-threaded
  let cancel = Arc::new(AtomicBool::new(false));
  let (tx, mut rx) = mpsc::unbounded_channel();
  let scheduler = tokio::spawn(run_jobs(
    detection.dirty.clone(),
    exporter,
    SchedulerConfig {
      jobs: job_count,
      timeout: options.timeout,
    },
    cancel.clone(),
    tx,
  ));

  let mut aggregator = Aggregator::new(detection.skipped.len(), started);
  while let Some(report) = rx.recv().await {
    if options.strict
      && report.result.status == JobStatus::Fatal
      && !cancel.swap(true, Ordering::SeqCst)
    {
      warn!(unit = %report.unit.key, "strict mode: cancelling remaining jobs");
    }
    aggregator.ingest(&report);
  }

  if let Err(e) = scheduler.await {
    error!(error = %e, "scheduler task failed");
  }

  // 8. Commit successes and flush the cache once
  let (summary, commits) = aggregator.finish();
  for (key, record) in commits {
    cache.commit(key, record);
  }
  let cache_write_failed = match cache.flush() {
    Ok(()) => false,
    Err(e) => {
      warn!(error = %e, "failed to write build cache; results of this run are unaffected");
      true
    }
  };

  info!(
    succeeded = summary.succeeded,
    failed = summary.failed,
    skipped = summary.skipped,
    cancelled = summary.cancelled,
    wall_time_ms = summary.wall_time_ms,
    "build run complete"
  );

  Ok(RunReport {
    summary,
    total_units: units.len(),
    dirty_units,
    job_count,
    dry_run: false,
    cache_write_failed,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::exporter::{ExportOutcome, FailureKind};
  use crate::inventory::BuildUnit;
  use std::fs;
  use std::future::Future;
  use std::path::Path;
  use tempfile::TempDir;

  /// Exporter double: succeeds by creating the output file, or fails
  /// fatally for keys matching `fail_key`.
  struct FakeExporter {
    fail_key: Option<String>,
  }

  impl FakeExporter {
    fn succeeding() -> Self {
      Self { fail_key: None }
    }

    fn failing_on(key: &str) -> Self {
      Self {
        fail_key: Some(key.to_string()),
      }
    }
  }

  impl Exporter for FakeExporter {
    fn export(&self, unit: &BuildUnit, _timeout: Duration) -> impl Future<Output = ExportOutcome> + Send {
      async move {
        if self.fail_key.as_deref() == Some(unit.key.as_str()) {
          return ExportOutcome::failed(
            FailureKind::Fatal,
            Some(1),
            Duration::from_millis(1),
            "Unknown export preset \"Web\"",
          );
        }
        // Small real delay so cancellation races resolve the same way the
        // slow real exporter makes them resolve.
        tokio::time::sleep(Duration::from_millis(10)).await;
        fs::create_dir_all(&unit.export_dir).unwrap();
        fs::write(unit.output_file(), "<html>exported</html>").unwrap();
        ExportOutcome::success(Duration::from_millis(1))
      }
    }

    fn verify(&self) -> impl Future<Output = Result<String, ExportError>> + Send {
      async move { Ok("fake".to_string()) }
    }
  }

  fn make_project(root: &Path, rel: &str) {
    let dir = root.join(rel);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("project.godot"), format!("[application]\n; {}\n", rel)).unwrap();
  }

  fn options(temp: &TempDir) -> RunOptions {
    let mut options = RunOptions::new(temp.path().join("projects"));
    options.cache_file = temp.path().join("cache/build_cache.json");
    options
  }

  #[tokio::test]
  async fn second_run_skips_everything() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    make_project(&root, "2d/pong");
    make_project(&root, "2d/breakout");
    make_project(&root, "3d/maze");

    let first = run_build(Arc::new(FakeExporter::succeeding()), options(&temp))
      .await
      .unwrap();
    assert_eq!(first.summary.succeeded, 3);
    assert_eq!(first.summary.skipped, 0);
    assert!(first.summary.is_success());

    let second = run_build(Arc::new(FakeExporter::succeeding()), options(&temp))
      .await
      .unwrap();
    assert_eq!(second.summary.succeeded, 0);
    assert_eq!(second.summary.skipped, 3);
    assert!(second.summary.is_success());
  }

  #[tokio::test]
  async fn changed_unit_rebuilds_alone() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    make_project(&root, "2d/pong");
    make_project(&root, "2d/breakout");

    run_build(Arc::new(FakeExporter::succeeding()), options(&temp))
      .await
      .unwrap();

    fs::write(root.join("2d/pong/main.gd"), "extends Node").unwrap();

    let report = run_build(Arc::new(FakeExporter::succeeding()), options(&temp))
      .await
      .unwrap();
    assert_eq!(report.dirty_units, vec!["2d/pong".to_string()]);
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.skipped, 1);
  }

  #[tokio::test]
  async fn fatal_unit_fails_run_but_not_siblings() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    for i in 1..=10 {
      make_project(&root, &format!("2d/unit{:02}", i));
    }

    let report = run_build(Arc::new(FakeExporter::failing_on("2d/unit03")), options(&temp))
      .await
      .unwrap();

    assert_eq!(report.summary.succeeded, 9);
    assert_eq!(report.summary.failed, 1);
    assert!(!report.summary.is_success());
    assert_eq!(report.summary.exit_code(), 1);
    assert_eq!(report.summary.failures[0].unit, "2d/unit03");

    // Exactly the nine successes are in the cache
    let cache = BuildCache::load(&temp.path().join("cache/build_cache.json"));
    assert_eq!(cache.len(), 9);
    assert!(cache.lookup("2d/unit03").is_none());
    assert!(cache.lookup("2d/unit04").is_some());
  }

  #[tokio::test]
  async fn failed_unit_is_retried_next_run() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    make_project(&root, "2d/pong");
    make_project(&root, "2d/breakout");

    run_build(Arc::new(FakeExporter::failing_on("2d/pong")), options(&temp))
      .await
      .unwrap();

    // Fingerprint unchanged, but pong has no cache record: built again
    let report = run_build(Arc::new(FakeExporter::succeeding()), options(&temp))
      .await
      .unwrap();
    assert_eq!(report.dirty_units, vec!["2d/pong".to_string()]);
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.skipped, 1);
  }

  #[tokio::test]
  async fn dry_run_never_exports() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    make_project(&root, "2d/pong");

    let mut opts = options(&temp);
    opts.dry_run = true;

    let report = run_build(Arc::new(FakeExporter::succeeding()), opts)
      .await
      .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.dirty_units, vec!["2d/pong".to_string()]);
    assert!(report.job_count >= 1);
    assert_eq!(report.summary.succeeded, 0);
    // No export artifact, no cache file
    assert!(!root.join("2d/pong/exports/web/index.html").exists());
    assert!(!temp.path().join("cache/build_cache.json").exists());
  }

  #[tokio::test]
  async fn force_rebuild_ignores_cache() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    make_project(&root, "2d/pong");

    run_build(Arc::new(FakeExporter::succeeding()), options(&temp))
      .await
      .unwrap();

    let mut opts = options(&temp);
    opts.force_rebuild = true;
    let report = run_build(Arc::new(FakeExporter::succeeding()), opts)
      .await
      .unwrap();

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.skipped, 0);
  }

  #[tokio::test]
  async fn missing_root_aborts() {
    let temp = TempDir::new().unwrap();
    let result = run_build(Arc::new(FakeExporter::succeeding()), options(&temp)).await;
    assert!(matches!(result, Err(RunError::Scan(ScanError::RootNotFound(_)))));
  }

  #[tokio::test]
  async fn empty_root_is_ok_when_permitted() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("projects")).unwrap();

    let mut opts = options(&temp);
    opts.allow_empty = true;

    let report = run_build(Arc::new(FakeExporter::succeeding()), opts)
      .await
      .unwrap();
    assert_eq!(report.total_units, 0);
    assert!(report.summary.is_success());
  }

  #[tokio::test]
  async fn strict_mode_cancels_remaining_jobs() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("projects");
    for i in 1..=8 {
      make_project(&root, &format!("2d/unit{:02}", i));
    }

    let mut opts = options(&temp);
    opts.strict = true;
    opts.jobs = Some(1);

    let report = run_build(Arc::new(FakeExporter::failing_on("2d/unit01")), opts)
      .await
      .unwrap();

    assert_eq!(report.summary.failed, 1);
    // With one worker the fatal lands first and the rest are cancelled;
    // scheduling order is not guaranteed, so only the sum is exact.
    assert_eq!(
      report.summary.succeeded + report.summary.cancelled,
      7,
      "summary: {:?}",
      report.summary
    );
    assert!(report.summary.cancelled >= 1);
  }
}
