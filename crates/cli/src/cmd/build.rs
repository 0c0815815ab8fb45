//! Implementation of the `gdweb build` command.
//!
//! Runs the full orchestration: scan, detect, plan, export, cache. The
//! process exit code comes from the build summary: zero only if no project
//! failed fatally.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use gdweb_core::run::{RunOptions, RunReport, run_build};
use gdweb_core::{BuildSummary, GodotExporter};

use crate::CommonArgs;
use crate::output::{format_duration, print_error, print_json, print_stat, print_success, print_warning};

#[derive(Serialize)]
struct ReportJson<'a> {
  summary: &'a BuildSummary,
  total_units: usize,
  dirty_units: &'a [String],
  job_count: usize,
  cache_write_failed: bool,
}

pub fn cmd_build(
  common: &CommonArgs,
  godot_binary: &Path,
  preset: &str,
  timeout_secs: u64,
  strict: bool,
) -> Result<i32> {
  let mut options = RunOptions::new(&common.projects_dir);
  options.cache_file = common.cache_file.clone();
  options.jobs = common.jobs;
  options.force_rebuild = common.force;
  options.base_ref = common.base_ref.clone();
  options.allow_empty = common.allow_empty;
  options.strict = strict;
  options.timeout = Duration::from_secs(timeout_secs);

  let exporter = Arc::new(GodotExporter::new(godot_binary, preset));

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(run_build(exporter, options)).context("Build failed")?;

  if common.format.is_json() {
    print_json(&ReportJson {
      summary: &report.summary,
      total_units: report.total_units,
      dirty_units: &report.dirty_units,
      job_count: report.job_count,
      cache_write_failed: report.cache_write_failed,
    })?;
  } else {
    print_report(&report);
  }

  Ok(report.summary.exit_code())
}

fn print_report(report: &RunReport) {
  let summary = &report.summary;
  let wall = format_duration(Duration::from_millis(summary.wall_time_ms));

  println!();
  if summary.is_success() {
    print_success(&format!("Build complete in {}", wall));
  } else {
    print_error(&format!("Build finished with failures in {}", wall));
  }

  print_stat("Projects", &report.total_units.to_string());
  print_stat("Exported", &summary.succeeded.to_string());
  print_stat("Skipped", &summary.skipped.to_string());
  print_stat("Failed", &summary.failed.to_string());
  if summary.cancelled > 0 {
    print_stat("Cancelled", &summary.cancelled.to_string());
  }
  print_stat("Jobs", &report.job_count.to_string());

  for failure in &summary.failures {
    println!();
    print_error(&format!(
      "{} ({}, {} attempt{})",
      failure.unit,
      failure.kind.map(|k| k.to_string()).unwrap_or_else(|| "unknown".to_string()),
      failure.attempts,
      if failure.attempts == 1 { "" } else { "s" }
    ));
    for line in failure.diagnostics.lines().take(12) {
      eprintln!("    {}", line);
    }
  }

  if report.cache_write_failed {
    println!();
    print_warning("build cache could not be written; the next run will rebuild these projects");
  }
}
