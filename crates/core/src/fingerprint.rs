//! Content fingerprints for build units and output digests.
//!
//! A fingerprint is a deterministic SHA-256 over a sorted list of per-file
//! entries. Small files contribute a content hash; files at or above the
//! size threshold contribute a cheaper `(mtime, size)` signature to bound
//! scan cost on large binary assets. The trade-off is documented on
//! [`LARGE_FILE_THRESHOLD`].

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Files at or above this size are signed with `(mtime, size)` instead of a
/// content hash. This can miss a content change that preserves both, which
/// is accepted: export-relevant sources are small, and `--force` exists.
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Directory names excluded from scans and fingerprints.
///
/// `exports` and `build` hold prior build outputs; including them would make
/// every successful export invalidate its own unit on the next run.
pub const EXCLUDED_DIRS: &[&str] = &[".git", ".godot", ".import", "exports", "build"];

/// Everything excluded from a unit's own fingerprint: prior outputs, VCS and
/// editor metadata, plus `export_presets.cfg`, which the executor writes
/// into presetless projects — hashing it would make the first successful
/// export dirty its own unit.
const FINGERPRINT_EXCLUDES: &[&str] = &[
  ".git",
  ".godot",
  ".import",
  "exports",
  "build",
  "export_presets.cfg",
];

/// A stable signature summarizing a directory tree's relevant files.
///
/// Lowercase 64-character SHA-256 hex string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during fingerprint computation.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
  #[error("failed to walk directory: {message}")]
  Walk { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute the fingerprint of a project directory.
///
/// Excludes prior build outputs, VCS/editor metadata, and tool-managed
/// files (see [`FINGERPRINT_EXCLUDES`]) so a unit never invalidates itself.
pub fn fingerprint_project(dir: &Path) -> Result<Fingerprint, FingerprintError> {
  hash_tree(dir, FINGERPRINT_EXCLUDES)
}

/// Compute the digest of a populated export output directory.
///
/// Used to record what artifact a cache entry corresponds to; nothing is
/// excluded.
pub fn digest_directory(dir: &Path) -> Result<Fingerprint, FingerprintError> {
  hash_tree(dir, &[])
}

/// Deterministic hash of a directory tree.
///
/// Entries are sorted by relative path. Regular files below
/// [`LARGE_FILE_THRESHOLD`] are content-hashed; larger files use an
/// `(mtime, size)` signature. Directories and symlink targets participate so
/// structural changes are visible.
fn hash_tree(dir: &Path, exclude: &[&str]) -> Result<Fingerprint, FingerprintError> {
  let mut entries: Vec<String> = Vec::new();

  let walker = WalkDir::new(dir).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| FingerprintError::Walk { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(dir)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");

    // Skip the root directory itself
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    if file_type.is_file() {
      let metadata = entry.metadata().map_err(|e| FingerprintError::ReadFile {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;

      if metadata.len() < LARGE_FILE_THRESHOLD {
        let content_hash = hash_file(entry_path)?;
        entries.push(format!("F:{}:{}", rel_path, content_hash));
      } else {
        let mtime = metadata
          .modified()
          .ok()
          .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
          .map(|d| d.as_secs())
          .unwrap_or(0);
        entries.push(format!("S:{}:{}:{}", rel_path, mtime, metadata.len()));
      }
    } else if file_type.is_dir() {
      entries.push(format!("D:{}", rel_path));
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| FingerprintError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      entries.push(format!("L:{}:{}", rel_path, target.to_string_lossy()));
    }
    // Special files (sockets, devices) are skipped
  }

  entries.sort();

  let mut hasher = Sha256::new();
  for entry in entries {
    hasher.update(entry.as_bytes());
    hasher.update(b"\n");
  }

  Ok(Fingerprint(format!("{:x}", hasher.finalize())))
}

/// Hash a single file's contents.
fn hash_file(path: &Path) -> Result<String, FingerprintError> {
  let mut file = fs::File::open(path).map_err(|e| FingerprintError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| FingerprintError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(format!("{:x}", hasher.finalize()))
}
