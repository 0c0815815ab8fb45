//! Resource-aware job planning.
//!
//! The exporter subprocess is resource-heavy: unbounded concurrency makes
//! the exporter runtime itself fail with platform-level exhaustion errors
//! (fd limits, allocation failures) instead of queueing cleanly. The planner
//! exists to prevent that, not to recover from it.

use gdweb_platform::SystemResources;
use tracing::{debug, info};

/// Worst-case memory footprint of one exporter subprocess (1.5 GiB).
pub const PER_JOB_MEMORY_BUDGET: u64 = 3 * 512 * 1024 * 1024;

/// File descriptors budgeted per exporter subprocess.
pub const PER_JOB_FD_BUDGET: u64 = 64;

/// Cores kept free for the rest of the machine outside CI.
const LOCAL_RESERVED_CORES: usize = 1;

/// Environment variable overriding the planned job count.
pub const MAX_JOBS_ENV: &str = "MAX_PARALLEL_JOBS";

/// Compute a safe parallel job count.
///
/// `min(cpu_bound, memory_bound, fd_bound, unit_count)`, always ≥ 1. The
/// reserved-core margin drops to zero in a recognized CI environment. An
/// explicit override (CLI flag or `MAX_PARALLEL_JOBS`) wins, clamped to ≥ 1.
pub fn plan_jobs(unit_count: usize, resources: &SystemResources, override_jobs: Option<usize>) -> usize {
  let requested = override_jobs.or_else(|| {
    std::env::var(MAX_JOBS_ENV)
      .ok()
      .and_then(|v| v.parse::<usize>().ok())
  });

  if let Some(jobs) = requested {
    let jobs = jobs.max(1);
    info!(jobs, "job count overridden");
    return jobs;
  }

  let margin = if resources.ci { 0 } else { LOCAL_RESERVED_CORES };
  let cpu_bound = resources.logical_cores.saturating_sub(margin).max(1);
  let memory_bound = ((resources.available_memory / PER_JOB_MEMORY_BUDGET) as usize).max(1);
  let fd_bound = ((resources.fd_soft_limit / PER_JOB_FD_BUDGET) as usize).max(1);

  let jobs = cpu_bound.min(memory_bound).min(fd_bound).min(unit_count.max(1));

  debug!(
    cpu_bound,
    memory_bound,
    fd_bound,
    unit_count,
    jobs,
    ci = resources.ci,
    "planned parallel jobs"
  );

  jobs
}
