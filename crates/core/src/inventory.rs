//! Project inventory: discovery of build units under a projects root.
//!
//! A build unit is one independently exportable Godot project, identified by
//! its `project.godot` marker file. Units are re-derived on every run and
//! returned in a deterministic order so logs are reproducible.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::fingerprint::{EXCLUDED_DIRS, Fingerprint, FingerprintError, fingerprint_project};

/// Marker file identifying a Godot project directory.
pub const PROJECT_MARKER: &str = "project.godot";

/// Relative path (inside a project) where web exports are written.
const EXPORT_SUBDIR: &str = "exports/web";

/// Name of the exported entry-point artifact.
const EXPORT_INDEX: &str = "index.html";

/// One independently buildable sub-project.
///
/// Immutable per scan; identity and fingerprint are re-derived every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildUnit {
  /// Stable path-derived key, e.g. `2d/pong`.
  pub key: String,

  /// Grouping tag: the first path component under the root (`2d`, `3d`, …),
  /// or `root` for projects sitting directly under the projects root.
  pub category: String,

  /// Absolute or root-relative path to the project directory.
  pub project_dir: PathBuf,

  /// Directory the export artifact is written to.
  pub export_dir: PathBuf,

  /// Content fingerprint over the project's significant files.
  pub fingerprint: Fingerprint,
}

impl BuildUnit {
  /// Path of the exported entry-point file.
  pub fn output_file(&self) -> PathBuf {
    self.export_dir.join(EXPORT_INDEX)
  }
}

/// Options for an inventory scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
  /// Permit an inventory with zero units (warning instead of error).
  pub allow_empty: bool,
}

/// Errors that can occur while enumerating build units.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
  #[error("projects root not found: {0}")]
  RootNotFound(PathBuf),

  #[error("no projects found under {0}")]
  NoProjects(PathBuf),

  #[error("failed to walk {path}: {message}")]
  Walk { path: String, message: String },

  #[error("fingerprint error for {unit}: {source}")]
  Fingerprint {
    unit: String,
    #[source]
    source: FingerprintError,
  },
}

/// Enumerate build units under `root`, sorted by key.
///
/// Fails with [`ScanError::RootNotFound`] if the root does not exist, and
/// with [`ScanError::NoProjects`] if it contains zero qualifying units —
/// unless `options.allow_empty` downgrades that to a warning.
pub fn scan_projects(root: &Path, options: &ScanOptions) -> Result<Vec<BuildUnit>, ScanError> {
  if !root.is_dir() {
    return Err(ScanError::RootNotFound(root.to_path_buf()));
  }

  let mut units = Vec::new();

  let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !EXCLUDED_DIRS.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| ScanError::Walk {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;

    if !entry.file_type().is_file() || entry.file_name().to_str() != Some(PROJECT_MARKER) {
      continue;
    }

    let project_dir = match entry.path().parent() {
      Some(dir) => dir.to_path_buf(),
      None => continue,
    };

    let rel = project_dir
      .strip_prefix(root)
      .unwrap_or(&project_dir)
      .to_string_lossy()
      .replace('\\', "/");

    let key = if rel.is_empty() {
      // project.godot directly under the root
      project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string())
    } else {
      rel
    };

    let category = match key.split_once('/') {
      Some((first, _)) => first.to_string(),
      None => "root".to_string(),
    };

    let fingerprint = fingerprint_project(&project_dir).map_err(|e| ScanError::Fingerprint {
      unit: key.clone(),
      source: e,
    })?;

    debug!(unit = %key, category = %category, "discovered project");

    units.push(BuildUnit {
      key,
      category,
      export_dir: project_dir.join(EXPORT_SUBDIR),
      project_dir,
      fingerprint,
    });
  }

  units.sort_by(|a, b| a.key.cmp(&b.key));

  if units.is_empty() {
    if options.allow_empty {
      warn!(root = %root.display(), "no projects found, continuing with empty inventory");
    } else {
      return Err(ScanError::NoProjects(root.to_path_buf()));
    }
  }

  Ok(units)
}
