//! Persisted build cache: fingerprint → last-success records.
//!
//! The cache is a single JSON file, read fully at run start and replaced
//! fully (temp file + atomic rename) at run end, never updated in place.
//! Commits during a run are buffered in memory and flushed once from the
//! single-threaded finalization path, so no locking is required.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// On-disk format version; bump when the record shape changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Last successful build of one unit.
///
/// Invariant: once written, `fingerprint` always corresponds to an artifact
/// that was present on disk at write time — `output_digest` is computed from
/// the real export directory, and commits only happen on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
  /// Fingerprint of the unit's inputs at the time of the successful build.
  pub fingerprint: String,

  /// Unix timestamp (seconds) of the successful build.
  pub built_at: u64,

  /// Digest of the export output directory.
  pub output_digest: String,
}

impl CacheRecord {
  /// Create a record stamped with the current time.
  pub fn new(fingerprint: String, output_digest: String) -> Self {
    Self {
      fingerprint,
      built_at: now_unix(),
      output_digest,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
  version: u32,
  records: BTreeMap<String, CacheRecord>,
}

/// Errors flushing the cache file at finalization.
///
/// Surfaced as a warning, never as a run failure: the build results of the
/// current run remain valid, the only cost is a rebuild next time.
#[derive(Debug, thiserror::Error)]
pub enum CacheWriteError {
  #[error("failed to serialize cache: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("failed to write cache file {path}: {message}")]
  Write { path: String, message: String },
}

/// The build cache: single writer, whole-file persistence.
#[derive(Debug)]
pub struct BuildCache {
  path: PathBuf,
  records: BTreeMap<String, CacheRecord>,
}

impl BuildCache {
  /// Load the cache from `path`.
  ///
  /// A missing file yields an empty cache. An unreadable, corrupt, or
  /// version-mismatched file also yields an empty cache with a warning —
  /// the safe failure direction, the worst case being a full rebuild.
  pub fn load(path: &Path) -> Self {
    let records = match fs::read_to_string(path) {
      Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
        Ok(file) if file.version == CACHE_FORMAT_VERSION => file.records,
        Ok(file) => {
          warn!(
            path = %path.display(),
            version = file.version,
            "unsupported cache version, starting with empty cache"
          );
          BTreeMap::new()
        }
        Err(e) => {
          warn!(path = %path.display(), error = %e, "corrupt cache file, starting with empty cache");
          BTreeMap::new()
        }
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "unreadable cache file, starting with empty cache");
        BTreeMap::new()
      }
    };

    debug!(path = %path.display(), records = records.len(), "loaded build cache");

    Self {
      path: path.to_path_buf(),
      records,
    }
  }

  /// Path of the backing file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Look up the last-success record for a unit key.
  pub fn lookup(&self, key: &str) -> Option<&CacheRecord> {
    self.records.get(key)
  }

  /// Record a successful build. Only called on Success.
  pub fn commit(&mut self, key: String, record: CacheRecord) {
    self.records.insert(key, record);
  }

  /// Number of records held.
  pub fn len(&self) -> usize {
    self.records.len()
  }

  /// Whether the cache holds no records.
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Iterate over all records.
  pub fn records(&self) -> impl Iterator<Item = (&String, &CacheRecord)> {
    self.records.iter()
  }

  /// Write the full cache file once, atomically (temp file + rename).
  pub fn flush(&self) -> Result<(), CacheWriteError> {
    let file = CacheFile {
      version: CACHE_FORMAT_VERSION,
      records: self.records.clone(),
    };
    let content = serde_json::to_string_pretty(&file)?;

    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      fs::create_dir_all(parent).map_err(|e| CacheWriteError::Write {
        path: self.path.display().to_string(),
        message: e.to_string(),
      })?;
    }

    let temp_path = self.path.with_extension("json.tmp");
    fs::write(&temp_path, &content).map_err(|e| CacheWriteError::Write {
      path: temp_path.display().to_string(),
      message: e.to_string(),
    })?;
    fs::rename(&temp_path, &self.path).map_err(|e| CacheWriteError::Write {
      path: self.path.display().to_string(),
      message: e.to_string(),
    })?;

    debug!(path = %self.path.display(), records = self.records.len(), "flushed build cache");
    Ok(())
  }
}

/// Current time as unix seconds.
fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
