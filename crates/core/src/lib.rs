//! gdweb-core: build orchestration engine for web exports of Godot projects.
//!
//! This crate decides which projects need rebuilding, schedules their export
//! under resource-aware concurrency limits, retries transient failures,
//! caches results between runs, and reports aggregate status:
//! - `inventory`: discovers build units and their content fingerprints
//! - `detect`: decides which units are dirty, with a VCS secondary signal
//! - `planner`: sizes the worker pool from host resources
//! - `exporter`: runs the external exporter behind an opaque-tool seam
//! - `scheduler`: bounded worker pool with retry/backoff and cancellation
//! - `cache`: persisted fingerprint → last-success records
//! - `summary`: single-threaded result aggregation and exit status
//! - `run`: the orchestration entry point wiring the above together

pub mod cache;
pub mod detect;
pub mod exporter;
pub mod fingerprint;
pub mod inventory;
pub mod planner;
pub mod run;
pub mod scheduler;
pub mod summary;

pub use cache::{BuildCache, CacheRecord, CacheWriteError};
pub use detect::{DetectOptions, Detection, detect_dirty};
pub use exporter::{
  DEFAULT_EXPORT_TIMEOUT, ExportError, ExportOutcome, Exporter, FailureKind, GodotExporter,
};
pub use inventory::{BuildUnit, ScanError, ScanOptions, scan_projects};
pub use planner::plan_jobs;
pub use run::{RunError, RunOptions, RunReport, run_build};
pub use scheduler::{BuildResult, JobReport, JobStatus, SchedulerConfig};
pub use summary::{BuildSummary, FailureDetail};
