//! Job scheduler: bounded worker pool over dirty units.
//!
//! Per-job state machine: `Pending → Running → { Success | Retrying →
//! Pending | Fatal }`. Workers never share build state — each job touches
//! only its own unit, and results leave through a single channel consumed by
//! the aggregator, so summary mutation needs no lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::exporter::{Exporter, FailureKind};
use crate::fingerprint::digest_directory;
use crate::inventory::BuildUnit;

/// Maximum attempts per unit (first try included).
pub const MAX_ATTEMPTS: u32 = 3;

/// Timeouts escalate to fatal once a unit has timed out this many times —
/// a unit that keeps hitting the wall-clock limit will not succeed under the
/// same settings.
const MAX_TIMEOUTS: u32 = 2;

/// Exponential backoff before the retry following the n-th failed attempt:
/// 1 s, 2 s, 4 s.
fn backoff_delay(failed_attempts: u32) -> Duration {
  Duration::from_secs(1 << (failed_attempts - 1))
}

/// Lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Pending,
  Running,
  Retrying,
  Success,
  Fatal,
}

/// A pending or in-flight unit of work wrapping one [`BuildUnit`].
#[derive(Debug, Clone)]
pub struct Job {
  pub unit: BuildUnit,
  pub attempt: u32,
  pub timeouts: u32,
  pub state: JobState,
}

impl Job {
  fn new(unit: BuildUnit) -> Self {
    Self {
      unit,
      attempt: 0,
      timeouts: 0,
      state: JobState::Pending,
    }
  }
}

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
  Success,
  Fatal,
  /// Never dispatched because cancellation was signalled first.
  Cancelled,
}

/// Per-job outcome delivered to the aggregator.
#[derive(Debug, Clone)]
pub struct BuildResult {
  pub status: JobStatus,

  /// Exit code of the final attempt, if the exporter ran and exited.
  pub exit_code: Option<i32>,

  /// Wall-clock duration of the final attempt.
  pub duration: Duration,

  /// Failure classification of the final attempt.
  pub failure: Option<FailureKind>,

  /// Bounded diagnostic excerpt from the final attempt.
  pub diagnostics: String,

  /// Attempts consumed (0 for cancelled jobs).
  pub attempts: u32,

  /// Digest of the populated export directory; only on success.
  pub output_digest: Option<String>,
}

/// One (unit, result) pair on the results channel.
#[derive(Debug, Clone)]
pub struct JobReport {
  pub unit: BuildUnit,
  pub result: BuildResult,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Concurrent worker slots (from the resource planner).
  pub jobs: usize,

  /// Per-attempt wall-clock timeout.
  pub timeout: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      jobs: 4,
      timeout: crate::exporter::DEFAULT_EXPORT_TIMEOUT,
    }
  }
}

/// Run all jobs through the worker pool.
///
/// Spawns one task per unit; a semaphore bounds how many run concurrently.
/// Each report is sent over `results`; the sender is dropped when every job
/// has finished, closing the channel for the consumer.
///
/// `cancel` is checked before each dispatch (including retry re-dispatch):
/// once set, remaining Pending jobs are reported Cancelled while in-flight
/// exports finish or hit their own timeout.
pub async fn run_jobs<E>(
  units: Vec<BuildUnit>,
  exporter: Arc<E>,
  config: SchedulerConfig,
  cancel: Arc<AtomicBool>,
  results: mpsc::UnboundedSender<JobReport>,
) where
  E: Exporter + 'static,
{
  info!(units = units.len(), jobs = config.jobs, "starting export jobs");

  let semaphore = Arc::new(Semaphore::new(config.jobs.max(1)));
  let mut join_set = JoinSet::new();

  for unit in units {
    let exporter = exporter.clone();
    let semaphore = semaphore.clone();
    let cancel = cancel.clone();
    let results = results.clone();
    let timeout = config.timeout;

    join_set.spawn(async move {
      let _permit = semaphore.acquire().await.unwrap();
      let report = run_one(unit, exporter.as_ref(), timeout, &cancel).await;
      if results.send(report).is_err() {
        warn!("results channel closed before report delivery");
      }
    });
  }
  drop(results);

  while let Some(joined) = join_set.join_next().await {
    if let Err(e) = joined {
      error!(error = %e, "export worker panicked");
    }
  }

  info!("export jobs complete");
}

/// Drive one job to a terminal state.
///
/// Retries are strictly sequential for the unit: backoff sleep, then the
/// same worker re-attempts.
async fn run_one<E: Exporter>(
  unit: BuildUnit,
  exporter: &E,
  timeout: Duration,
  cancel: &AtomicBool,
) -> JobReport {
  let mut job = Job::new(unit);

  loop {
    if cancel.load(Ordering::SeqCst) {
      debug!(unit = %job.unit.key, "cancelled before dispatch");
      return JobReport {
        result: cancelled_result(job.attempt),
        unit: job.unit,
      };
    }

    job.state = JobState::Running;
    job.attempt += 1;
    info!(unit = %job.unit.key, attempt = job.attempt, "exporting");

    let outcome = exporter.export(&job.unit, timeout).await;

    match outcome.failure {
      None => {
        job.state = JobState::Success;
        let output_digest = match digest_directory(&job.unit.export_dir) {
          Ok(digest) => Some(digest.0),
          Err(e) => {
            warn!(unit = %job.unit.key, error = %e, "failed to digest export output");
            None
          }
        };
        return JobReport {
          result: BuildResult {
            status: JobStatus::Success,
            exit_code: outcome.exit_code,
            duration: outcome.duration,
            failure: None,
            diagnostics: outcome.diagnostics,
            attempts: job.attempt,
            output_digest,
          },
          unit: job.unit,
        };
      }

      Some(FailureKind::Fatal) => {
        job.state = JobState::Fatal;
        return fatal_report(job, outcome);
      }

      Some(FailureKind::Timeout) => {
        job.timeouts += 1;
        if job.timeouts >= MAX_TIMEOUTS {
          warn!(unit = %job.unit.key, "repeated timeout, giving up");
          job.state = JobState::Fatal;
          return fatal_report(job, outcome);
        }
        if !retry(&mut job).await {
          return fatal_report(job, outcome);
        }
      }

      Some(FailureKind::Transient) => {
        if !retry(&mut job).await {
          return fatal_report(job, outcome);
        }
      }
    }
  }
}

/// Transition a job through Retrying back to Pending, or report attempts
/// exhausted.
async fn retry(job: &mut Job) -> bool {
  if job.attempt >= MAX_ATTEMPTS {
    warn!(unit = %job.unit.key, attempts = job.attempt, "retries exhausted");
    job.state = JobState::Fatal;
    return false;
  }

  job.state = JobState::Retrying;
  let delay = backoff_delay(job.attempt);
  warn!(
    unit = %job.unit.key,
    attempt = job.attempt,
    delay_secs = delay.as_secs(),
    "transient failure, backing off"
  );

  // Give the allocator a chance to return memory before the next heavy
  // subprocess starts.
  gdweb_platform::reclaim_memory();
  tokio::time::sleep(delay).await;

  job.state = JobState::Pending;
  true
}

fn fatal_report(job: Job, outcome: crate::exporter::ExportOutcome) -> JobReport {
  JobReport {
    result: BuildResult {
      status: JobStatus::Fatal,
      exit_code: outcome.exit_code,
      duration: outcome.duration,
      failure: outcome.failure,
      diagnostics: outcome.diagnostics,
      attempts: job.attempt,
      output_digest: None,
    },
    unit: job.unit,
  }
}

fn cancelled_result(attempts: u32) -> BuildResult {
  BuildResult {
    status: JobStatus::Cancelled,
    exit_code: None,
    duration: Duration::ZERO,
    failure: None,
    diagnostics: String::new(),
    attempts,
    output_digest: None,
  }
}
