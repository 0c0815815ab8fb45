//! Implementation of the `gdweb status` command.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;

use gdweb_core::BuildCache;

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat};

#[derive(Serialize)]
struct StatusJson {
  cache_file: String,
  records: usize,
  newest_built_at: Option<u64>,
}

pub fn cmd_status(cache_file: &Path, format: OutputFormat) -> Result<i32> {
  let cache = BuildCache::load(cache_file);
  let newest = cache.records().map(|(_, record)| record.built_at).max();

  if format.is_json() {
    print_json(&StatusJson {
      cache_file: cache_file.display().to_string(),
      records: cache.len(),
      newest_built_at: newest,
    })?;
    return Ok(0);
  }

  print_info(&format!("Build cache: {}", cache_file.display()));
  print_stat("Records", &cache.len().to_string());

  if let Ok(metadata) = std::fs::metadata(cache_file) {
    print_stat("File size", &format_bytes(metadata.len()));
  }

  if let Some(built_at) = newest {
    let now = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or(built_at);
    let age = Duration::from_secs(now.saturating_sub(built_at));
    print_stat("Last build", &format!("{} ago", format_duration(age)));
  } else {
    print_stat("Last build", "never");
  }

  Ok(0)
}
