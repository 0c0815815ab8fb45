//! System resource probing.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

/// Environment variables that identify a CI environment.
///
/// On CI the planner is allowed to use every core; locally one core is
/// reserved so the machine stays responsive during a large build.
const CI_ENV_VARS: &[&str] = &["CI", "GITHUB_ACTIONS", "GITLAB_CI", "JENKINS_URL", "BUILDKITE"];

/// Fallback core count when the OS refuses to tell us.
const DEFAULT_LOGICAL_CORES: usize = 4;

/// Fallback available memory (8 GiB) when probing fails.
const DEFAULT_AVAILABLE_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

/// Fallback soft file-descriptor limit.
const DEFAULT_FD_SOFT_LIMIT: u64 = 1024;

/// A snapshot of the host resources relevant to export scheduling.
///
/// Plain data so tests can construct arbitrary machines without probing.
#[derive(Debug, Clone)]
pub struct SystemResources {
  /// Logical CPU cores available to this process.
  pub logical_cores: usize,

  /// Available (not total) memory in bytes.
  pub available_memory: u64,

  /// Soft limit on open file descriptors for this process.
  pub fd_soft_limit: u64,

  /// Whether a recognized CI environment variable is set.
  pub ci: bool,
}

impl SystemResources {
  /// Probe the current host.
  ///
  /// Never fails: each probe falls back to a conservative default so the
  /// planner always has something to work with.
  pub fn probe() -> Self {
    let logical_cores = std::thread::available_parallelism()
      .map(|p| p.get())
      .unwrap_or(DEFAULT_LOGICAL_CORES);

    let sys = System::new_with_specifics(
      RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    let available_memory = match sys.available_memory() {
      0 => DEFAULT_AVAILABLE_MEMORY,
      bytes => bytes,
    };

    let resources = Self {
      logical_cores,
      available_memory,
      fd_soft_limit: fd_soft_limit(),
      ci: is_ci_environment(),
    };

    debug!(
      cores = resources.logical_cores,
      available_memory = resources.available_memory,
      fd_soft_limit = resources.fd_soft_limit,
      ci = resources.ci,
      "probed system resources"
    );

    resources
  }
}

/// Check whether any recognized CI environment variable is set.
pub fn is_ci_environment() -> bool {
  CI_ENV_VARS.iter().any(|var| std::env::var_os(var).is_some())
}

/// Soft limit on open file descriptors.
#[cfg(unix)]
fn fd_soft_limit() -> u64 {
  rustix::process::getrlimit(rustix::process::Resource::Nofile)
    .current
    .unwrap_or(DEFAULT_FD_SOFT_LIMIT)
}

/// Windows has no RLIMIT_NOFILE equivalent; the CRT handle table is large
/// enough that the fd bound never binds there.
#[cfg(not(unix))]
fn fd_soft_limit() -> u64 {
  DEFAULT_FD_SOFT_LIMIT
}

/// Best-effort memory-reclaim hint, called between export retries after a
/// resource-exhaustion failure.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub fn reclaim_memory() {
  // malloc_trim returns 1 if memory was actually released; either way the
  // retry proceeds.
  unsafe {
    libc::malloc_trim(0);
  }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn reclaim_memory() {}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn probe_returns_sane_values() {
    let resources = SystemResources::probe();
    assert!(resources.logical_cores >= 1);
    assert!(resources.available_memory > 0);
    assert!(resources.fd_soft_limit > 0);
  }

  #[test]
  #[serial]
  fn ci_detection_reads_environment() {
    temp_env::with_var("BUILDKITE", Some("1"), || {
      assert!(is_ci_environment());
    });
  }

  #[test]
  #[serial]
  fn ci_detection_false_when_unset() {
    temp_env::with_vars(
      [
        ("CI", None::<&str>),
        ("GITHUB_ACTIONS", None),
        ("GITLAB_CI", None),
        ("JENKINS_URL", None),
        ("BUILDKITE", None),
      ],
      || {
        assert!(!is_ci_environment());
      },
    );
  }

  #[test]
  fn reclaim_memory_does_not_panic() {
    reclaim_memory();
  }
}
