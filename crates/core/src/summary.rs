//! Result aggregation and reporting.
//!
//! The aggregator is the single consumer of the scheduler's results channel:
//! it owns the summary outright, so no locking is needed anywhere on the
//! reporting path. Cache commits are buffered here and handed back to the
//! finalization path in one batch.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error};

use crate::cache::CacheRecord;
use crate::exporter::FailureKind;
use crate::scheduler::{JobReport, JobStatus};

/// Diagnostic excerpt kept per fatal failure (the tail, where exporters put
/// the actual error).
const FAILURE_EXCERPT_BYTES: usize = 2048;

/// One fatal failure in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
  pub unit: String,
  pub kind: Option<FailureKind>,
  pub attempts: u32,
  pub diagnostics: String,
}

/// Process-wide aggregate of a run.
///
/// Created empty at run start, mutated only by the aggregator, read-only
/// once finalized. Skipped units count as success, not as ignored.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildSummary {
  pub succeeded: usize,
  pub failed: usize,
  pub skipped: usize,
  pub cancelled: usize,

  /// Total wall time of the run in milliseconds.
  pub wall_time_ms: u64,

  /// Fatal failures with diagnostics.
  pub failures: Vec<FailureDetail>,
}

impl BuildSummary {
  /// Success iff there are zero fatal results.
  pub fn is_success(&self) -> bool {
    self.failed == 0
  }

  /// Process exit status derived from the summary.
  pub fn exit_code(&self) -> i32 {
    if self.is_success() { 0 } else { 1 }
  }

  /// Units accounted for.
  pub fn total(&self) -> usize {
    self.succeeded + self.failed + self.skipped + self.cancelled
  }
}

/// Single-threaded consumer of job reports.
pub struct Aggregator {
  summary: BuildSummary,
  commits: Vec<(String, CacheRecord)>,
  started: Instant,
}

impl Aggregator {
  /// Start aggregating; `skipped` is the clean-unit count from detection.
  pub fn new(skipped: usize, started: Instant) -> Self {
    Self {
      summary: BuildSummary {
        skipped,
        ..Default::default()
      },
      commits: Vec::new(),
      started,
    }
  }

  /// Fold one job report into the summary.
  ///
  /// Success additionally buffers a cache commit; the record's fingerprint
  /// is the one scanned this run, and its digest comes from the artifact
  /// that is on disk right now.
  pub fn ingest(&mut self, report: &JobReport) {
    match report.result.status {
      JobStatus::Success => {
        self.summary.succeeded += 1;
        self.commits.push((
          report.unit.key.clone(),
          CacheRecord::new(
            report.unit.fingerprint.0.clone(),
            report.result.output_digest.clone().unwrap_or_default(),
          ),
        ));
        debug!(
          unit = %report.unit.key,
          attempts = report.result.attempts,
          "recorded success"
        );
      }
      JobStatus::Fatal => {
        self.summary.failed += 1;
        self.summary.failures.push(FailureDetail {
          unit: report.unit.key.clone(),
          kind: report.result.failure,
          attempts: report.result.attempts,
          diagnostics: excerpt(&report.result.diagnostics),
        });
        error!(
          unit = %report.unit.key,
          kind = ?report.result.failure,
          attempts = report.result.attempts,
          "recorded fatal failure"
        );
      }
      JobStatus::Cancelled => {
        self.summary.cancelled += 1;
        debug!(unit = %report.unit.key, "recorded cancellation");
      }
    }
  }

  /// Finalize: the read-only summary plus the buffered cache commits.
  pub fn finish(mut self) -> (BuildSummary, Vec<(String, CacheRecord)>) {
    self.summary.wall_time_ms = self.started.elapsed().as_millis() as u64;
    (self.summary, self.commits)
  }
}

/// Tail excerpt of a diagnostic string.
fn excerpt(text: &str) -> String {
  if text.len() <= FAILURE_EXCERPT_BYTES {
    return text.to_string();
  }
  let start = text.len() - FAILURE_EXCERPT_BYTES;
  let start = (start..text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(start);
  format!("…{}", &text[start..])
}
