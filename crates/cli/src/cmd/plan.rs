//! Implementation of the `gdweb plan` command.
//!
//! Dry-run preview: change detection and resource planning only, the
//! exporter is never invoked.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use gdweb_core::run::{RunOptions, run_build};
use gdweb_core::GodotExporter;

use crate::CommonArgs;
use crate::output::{print_info, print_json, print_stat, print_success};

#[derive(Serialize)]
struct PlanJson<'a> {
  total_units: usize,
  dirty_units: &'a [String],
  job_count: usize,
}

pub fn cmd_plan(common: &CommonArgs) -> Result<i32> {
  let mut options = RunOptions::new(&common.projects_dir);
  options.cache_file = common.cache_file.clone();
  options.jobs = common.jobs;
  options.force_rebuild = common.force;
  options.base_ref = common.base_ref.clone();
  options.allow_empty = common.allow_empty;
  options.dry_run = true;

  // Never invoked on a dry run; the default binary is a placeholder.
  let exporter = Arc::new(GodotExporter::new("godot", "Web"));

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(run_build(exporter, options)).context("Plan failed")?;

  if common.format.is_json() {
    print_json(&PlanJson {
      total_units: report.total_units,
      dirty_units: &report.dirty_units,
      job_count: report.job_count,
    })?;
    return Ok(0);
  }

  if report.dirty_units.is_empty() {
    print_success(&format!("All {} project(s) are up to date", report.total_units));
    return Ok(0);
  }

  print_info(&format!(
    "Would export {} of {} project(s) with {} parallel job(s)",
    report.dirty_units.len(),
    report.total_units,
    report.job_count
  ));
  for unit in &report.dirty_units {
    print_stat("dirty", unit);
  }

  Ok(0)
}
