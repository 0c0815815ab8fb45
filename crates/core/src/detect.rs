//! Change detection: decides which units must be (re)built.
//!
//! Primary signal: the unit's content fingerprint against its cache record.
//! Secondary signal (when a base ref is supplied): a VCS diff between two
//! refs. History resolution failures are never errors — the detector falls
//! back to the earliest available commit, and past that to "everything is
//! dirty". A run that silently skips all units because history resolution
//! failed is the worst-case failure mode and is structurally impossible here.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::cache::BuildCache;
use crate::inventory::BuildUnit;

/// Options controlling change detection.
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
  /// Treat every unit as dirty regardless of fingerprints.
  pub force_rebuild: bool,

  /// Base reference for the VCS secondary signal (e.g. `HEAD~1`).
  pub base_ref: Option<String>,

  /// Directory to run VCS commands in; usually the projects root.
  pub repo_dir: PathBuf,
}

/// Partition of the inventory into dirty and clean units.
///
/// Order within each partition is stable (inventory order).
#[derive(Debug, Default)]
pub struct Detection {
  /// Units that must be built.
  pub dirty: Vec<BuildUnit>,

  /// Units found clean; counted as successes in the summary.
  pub skipped: Vec<BuildUnit>,
}

/// The VCS secondary signal.
enum VcsSignal {
  /// Paths changed between the resolved base and HEAD.
  Changed(Vec<PathBuf>),
  /// History could not be resolved at all: treat everything as dirty.
  AssumeAllDirty,
  /// No base ref requested.
  NotRequested,
}

/// Decide which units are dirty.
///
/// A unit is dirty if it has no cache record, its stored fingerprint differs
/// from the current one, the force flag is set, or the VCS signal touched
/// its directory.
pub fn detect_dirty(units: &[BuildUnit], cache: &BuildCache, options: &DetectOptions) -> Detection {
  if options.force_rebuild {
    info!(units = units.len(), "force rebuild requested, all units dirty");
    return Detection {
      dirty: units.to_vec(),
      skipped: Vec::new(),
    };
  }

  let signal = match &options.base_ref {
    Some(base) => vcs_signal(&options.repo_dir, base),
    None => VcsSignal::NotRequested,
  };

  if matches!(signal, VcsSignal::AssumeAllDirty) {
    warn!(units = units.len(), "history unresolvable, treating all units as dirty");
    return Detection {
      dirty: units.to_vec(),
      skipped: Vec::new(),
    };
  }

  let mut detection = Detection::default();

  for unit in units {
    let fingerprint_dirty = match cache.lookup(&unit.key) {
      None => true,
      Some(record) => record.fingerprint != unit.fingerprint.0,
    };

    let vcs_dirty = match &signal {
      VcsSignal::Changed(paths) => {
        // The toplevel from git is canonical; unit paths may not be.
        let unit_dir = fs::canonicalize(&unit.project_dir).unwrap_or_else(|_| unit.project_dir.clone());
        paths.iter().any(|p| p.starts_with(&unit_dir))
      }
      _ => false,
    };

    if fingerprint_dirty || vcs_dirty {
      debug!(
        unit = %unit.key,
        fingerprint_dirty,
        vcs_dirty,
        "unit is dirty"
      );
      detection.dirty.push(unit.clone());
    } else {
      detection.skipped.push(unit.clone());
    }
  }

  info!(
    dirty = detection.dirty.len(),
    skipped = detection.skipped.len(),
    "change detection complete"
  );

  detection
}

/// Resolve the VCS secondary signal for `base` in `repo_dir`.
///
/// Fallback chain: requested base → earliest available commit → assume all
/// dirty. Every step is recovered locally and logged, never surfaced as an
/// error.
fn vcs_signal(repo_dir: &Path, base: &str) -> VcsSignal {
  let resolved = if rev_exists(repo_dir, base) {
    base.to_string()
  } else {
    warn!(base = %base, "base ref unresolvable, falling back to earliest commit");
    match earliest_commit(repo_dir) {
      Some(root) => root,
      None => return VcsSignal::AssumeAllDirty,
    }
  };

  let toplevel = match git_stdout(repo_dir, &["rev-parse", "--show-toplevel"]) {
    Some(out) => PathBuf::from(out.trim()),
    None => return VcsSignal::AssumeAllDirty,
  };

  match git_stdout(repo_dir, &["diff", "--name-only", &resolved, "HEAD"]) {
    Some(out) => {
      let changed: Vec<PathBuf> = out.lines().filter(|l| !l.is_empty()).map(|l| toplevel.join(l)).collect();
      debug!(base = %resolved, changed = changed.len(), "vcs diff resolved");
      VcsSignal::Changed(changed)
    }
    None => VcsSignal::AssumeAllDirty,
  }
}

/// Whether `rev` resolves to a commit in `repo_dir`.
fn rev_exists(repo_dir: &Path, rev: &str) -> bool {
  Command::new("git")
    .args(["rev-parse", "--verify", "--quiet", rev])
    .current_dir(repo_dir)
    .output()
    .map(|out| out.status.success())
    .unwrap_or(false)
}

/// The earliest commit reachable from HEAD, if any.
fn earliest_commit(repo_dir: &Path) -> Option<String> {
  git_stdout(repo_dir, &["rev-list", "--max-parents=0", "HEAD"])
    .and_then(|out| out.lines().last().map(|l| l.trim().to_string()))
    .filter(|s| !s.is_empty())
}

/// Run a git command and return stdout on success.
fn git_stdout(repo_dir: &Path, args: &[&str]) -> Option<String> {
  match Command::new("git").args(args).current_dir(repo_dir).output() {
    Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).to_string()),
    Ok(out) => {
      debug!(
        args = ?args,
        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
        "git command failed"
      );
      None
    }
    Err(e) => {
      debug!(args = ?args, error = %e, "git not runnable");
      None
    }
  }
}
