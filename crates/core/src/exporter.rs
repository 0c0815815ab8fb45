//! Export executor: runs the external exporter for one unit.
//!
//! The exporter is deliberately opaque to the rest of the engine: anything
//! that can take `(project, preset, output, timeout)` and produce an exit
//! code plus captured output fits behind the [`Exporter`] trait, so
//! scheduling logic never touches tool specifics.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::inventory::BuildUnit;

/// Hard wall-clock limit for one export attempt.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured diagnostic output is bounded to this many bytes.
pub const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// Timeout for the exporter version check.
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure text signatures classified as transient (retryable).
///
/// These are resource-exhaustion messages from the exporter runtime; the
/// condition clears once concurrent exports finish. Everything unmatched is
/// fatal: retrying a genuinely broken project only triples its cost.
const TRANSIENT_PATTERNS: &[&str] = &[
  "Too many open files",
  "Cannot allocate memory",
  "Resource temporarily unavailable",
  "Invalid argument",
  "out of memory",
];

/// Classified failure of one export attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
  /// Resource exhaustion or signal death; worth retrying.
  Transient,
  /// Configuration or corruption; retrying cannot help.
  Fatal,
  /// Wall-clock limit hit; transient once, fatal on repeat.
  Timeout,
}

impl std::fmt::Display for FailureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FailureKind::Transient => write!(f, "transient"),
      FailureKind::Fatal => write!(f, "fatal"),
      FailureKind::Timeout => write!(f, "timeout"),
    }
  }
}

/// Result of one export attempt.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
  /// Exit code of the exporter; `None` for signal death or timeout.
  pub exit_code: Option<i32>,

  /// Wall-clock duration of the attempt.
  pub duration: Duration,

  /// Failure classification; `None` means success.
  pub failure: Option<FailureKind>,

  /// Captured output excerpt, bounded to [`MAX_DIAGNOSTIC_BYTES`].
  pub diagnostics: String,
}

impl ExportOutcome {
  /// A successful attempt.
  pub fn success(duration: Duration) -> Self {
    Self {
      exit_code: Some(0),
      duration,
      failure: None,
      diagnostics: String::new(),
    }
  }

  /// A failed attempt.
  pub fn failed(
    kind: FailureKind,
    exit_code: Option<i32>,
    duration: Duration,
    diagnostics: impl Into<String>,
  ) -> Self {
    Self {
      exit_code,
      duration,
      failure: Some(kind),
      diagnostics: truncate_diagnostics(&diagnostics.into()),
    }
  }

  pub fn is_success(&self) -> bool {
    self.failure.is_none()
  }
}

/// Errors that make the exporter unusable as a whole (not per-unit).
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
  #[error("exporter binary not usable: {message}")]
  BinaryUnavailable { message: String },
}

/// The opaque-tool seam: any export tool can substitute for Godot without
/// touching scheduling logic.
pub trait Exporter: Send + Sync {
  /// Export one unit with a hard wall-clock timeout.
  ///
  /// Per-unit problems are encoded in the outcome, never as `Err`: a unit
  /// failure must not abort the run.
  fn export(&self, unit: &BuildUnit, timeout: Duration) -> impl Future<Output = ExportOutcome> + Send;

  /// Verify the tool is runnable; returns its version string.
  fn verify(&self) -> impl Future<Output = Result<String, ExportError>> + Send;
}

/// Godot headless exporter.
#[derive(Debug, Clone)]
pub struct GodotExporter {
  binary: PathBuf,
  preset: String,
}

impl GodotExporter {
  pub fn new(binary: impl Into<PathBuf>, preset: impl Into<String>) -> Self {
    Self {
      binary: binary.into(),
      preset: preset.into(),
    }
  }

}

impl Exporter for GodotExporter {
  fn export(&self, unit: &BuildUnit, timeout: Duration) -> impl Future<Output = ExportOutcome> + Send {
    async move {
      let started = Instant::now();

      if let Err(e) = tokio::fs::create_dir_all(&unit.export_dir).await {
        return ExportOutcome::failed(
          FailureKind::Fatal,
          None,
          started.elapsed(),
          format!("failed to create export directory: {}", e),
        );
      }

      if let Err(e) = ensure_preset(&unit.project_dir, &self.preset).await {
        return ExportOutcome::failed(
          FailureKind::Fatal,
          None,
          started.elapsed(),
          format!("failed to write export preset: {}", e),
        );
      }

      let output_file = unit.output_file();

      let mut command = Command::new(&self.binary);
      command
        .arg("--headless")
        .arg("--path")
        .arg(&unit.project_dir)
        .arg("--export-release")
        .arg(&self.preset)
        .arg(&output_file)
        .kill_on_drop(true);

      debug!(unit = %unit.key, binary = %self.binary.display(), "spawning exporter");

      let result = tokio::time::timeout(timeout, command.output()).await;
      let duration = started.elapsed();

      let output = match result {
        Err(_) => {
          warn!(unit = %unit.key, timeout_secs = timeout.as_secs(), "export timed out");
          return ExportOutcome::failed(
            FailureKind::Timeout,
            None,
            duration,
            format!("export timed out after {}s", timeout.as_secs()),
          );
        }
        Ok(Err(e)) => {
          return ExportOutcome::failed(
            FailureKind::Fatal,
            None,
            duration,
            format!("failed to spawn exporter: {}", e),
          );
        }
        Ok(Ok(output)) => output,
      };

      let mut combined = String::from_utf8_lossy(&output.stderr).to_string();
      if !output.stdout.is_empty() {
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stdout));
      }
      let diagnostics = truncate_diagnostics(&combined);

      if output.status.success() {
        if output_file.exists() {
          info!(unit = %unit.key, duration_ms = duration.as_millis() as u64, "export succeeded");
          return ExportOutcome::success(duration);
        }
        // Exit 0 without an artifact is a lie; treat as a broken project.
        return ExportOutcome::failed(
          FailureKind::Fatal,
          Some(0),
          duration,
          format!("exporter exited 0 but produced no output\n{}", diagnostics),
        );
      }

      let exit_code = output.status.code();
      let kind = classify_failure(exit_code, &diagnostics);
      warn!(
        unit = %unit.key,
        exit_code = ?exit_code,
        kind = %kind,
        "export failed"
      );
      ExportOutcome::failed(kind, exit_code, duration, diagnostics)
    }
  }

  fn verify(&self) -> impl Future<Output = Result<String, ExportError>> + Send {
    async move {
      let mut command = Command::new(&self.binary);
      command.arg("--version").kill_on_drop(true);

      let result = tokio::time::timeout(VERSION_CHECK_TIMEOUT, command.output()).await;
      match result {
        Err(_) => Err(ExportError::BinaryUnavailable {
          message: "version check timed out".to_string(),
        }),
        Ok(Err(e)) => Err(ExportError::BinaryUnavailable { message: e.to_string() }),
        Ok(Ok(output)) if output.status.success() => {
          Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(Ok(output)) => Err(ExportError::BinaryUnavailable {
          message: format!("version check exited with {:?}", output.status.code()),
        }),
      }
    }
  }
}

/// Classify a failed attempt from its exit code and captured output.
///
/// Signal-terminated processes (no exit code: killed, fatal runtime abort)
/// are transient unless they repeat. Text matching [`TRANSIENT_PATTERNS`]
/// is transient; everything else (missing template/preset, permission
/// denied, corrupt project descriptor) is fatal.
pub fn classify_failure(exit_code: Option<i32>, diagnostics: &str) -> FailureKind {
  if exit_code.is_none() {
    return FailureKind::Transient;
  }
  if TRANSIENT_PATTERNS.iter().any(|p| diagnostics.contains(p)) {
    FailureKind::Transient
  } else {
    FailureKind::Fatal
  }
}

/// Bound captured output, keeping the tail where exporters put the error.
fn truncate_diagnostics(text: &str) -> String {
  let trimmed = text.trim();
  if trimmed.len() <= MAX_DIAGNOSTIC_BYTES {
    return trimmed.to_string();
  }
  let start = trimmed.len() - MAX_DIAGNOSTIC_BYTES;
  // Stay on a char boundary
  let start = (start..trimmed.len()).find(|i| trimmed.is_char_boundary(*i)).unwrap_or(start);
  format!("…{}", &trimmed[start..])
}

/// Make sure the project has a web export preset.
///
/// Projects in the wild often ship without `export_presets.cfg`; a missing
/// preset is a fatal export error, so one is written up front. An existing
/// file without a web preset gets one appended under the next free index.
async fn ensure_preset(project_dir: &Path, preset: &str) -> std::io::Result<()> {
  let preset_file = project_dir.join("export_presets.cfg");

  let existing = match tokio::fs::read_to_string(&preset_file).await {
    Ok(content) => Some(content),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
    Err(e) => return Err(e),
  };

  match existing {
    None => {
      debug!(project = %project_dir.display(), "writing export preset");
      tokio::fs::write(&preset_file, web_preset_block(0, preset)).await
    }
    Some(content) if content.contains("platform=\"Web\"") => Ok(()),
    Some(content) => {
      let next_index = next_preset_index(&content);
      debug!(
        project = %project_dir.display(),
        index = next_index,
        "appending web export preset"
      );
      let mut updated = content;
      updated.push_str(&web_preset_block(next_index, preset));
      tokio::fs::write(&preset_file, updated).await
    }
  }
}

/// First unused `[preset.N]` index in an existing presets file.
fn next_preset_index(content: &str) -> u32 {
  let mut max_seen: Option<u32> = None;
  for line in content.lines() {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("[preset.")
      && let Some(number) = rest.split(&['.', ']'][..]).next()
      && let Ok(n) = number.parse::<u32>()
    {
      max_seen = Some(max_seen.map_or(n, |m| m.max(n)));
    }
  }
  max_seen.map_or(0, |m| m + 1)
}

/// Minimal web export preset block.
fn web_preset_block(index: u32, preset: &str) -> String {
  format!(
    r#"[preset.{index}]

name="{preset}"
platform="Web"
runnable=true
export_filter="all_resources"
include_filter=""
exclude_filter=""
export_path="exports/web/index.html"

[preset.{index}.options]

variant/extensions_support=false
vram_texture_compression/for_desktop=true
vram_texture_compression/for_mobile=false
html/export_icon=true
html/canvas_resize_policy=2
html/focus_canvas_on_start=true
"#
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fingerprint::Fingerprint;
  use std::fs;
  use tempfile::TempDir;

  fn make_unit(temp: &TempDir) -> BuildUnit {
    let project_dir = temp.path().join("2d/pong");
    fs::create_dir_all(&project_dir).unwrap();
    fs::write(project_dir.join("project.godot"), "[application]").unwrap();
    BuildUnit {
      key: "2d/pong".to_string(),
      category: "2d".to_string(),
      export_dir: project_dir.join("exports/web"),
      project_dir,
      fingerprint: Fingerprint("0".repeat(64)),
    }
  }

  #[cfg(unix)]
  fn write_stub_exporter(temp: &TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = temp.path().join("fake-godot");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  #[test]
  fn classify_transient_patterns() {
    assert_eq!(
      classify_failure(Some(1), "ERROR: Too many open files"),
      FailureKind::Transient
    );
    assert_eq!(
      classify_failure(Some(1), "malloc: Cannot allocate memory"),
      FailureKind::Transient
    );
    assert_eq!(
      classify_failure(Some(1), "read: Resource temporarily unavailable"),
      FailureKind::Transient
    );
    assert_eq!(classify_failure(Some(1), "ioctl: Invalid argument"), FailureKind::Transient);
  }

  #[test]
  fn classify_signal_death_as_transient() {
    assert_eq!(classify_failure(None, "killed"), FailureKind::Transient);
  }

  #[test]
  fn classify_configuration_errors_as_fatal() {
    assert_eq!(
      classify_failure(Some(1), "No export template found at expected path"),
      FailureKind::Fatal
    );
    assert_eq!(
      classify_failure(Some(1), "Unknown export preset \"Web\""),
      FailureKind::Fatal
    );
    assert_eq!(classify_failure(Some(1), "Permission denied"), FailureKind::Fatal);
    assert_eq!(
      classify_failure(Some(1), "Error parsing project.godot"),
      FailureKind::Fatal
    );
  }

  #[test]
  fn diagnostics_are_bounded_and_keep_the_tail() {
    let long = format!("{}THE-END", "x".repeat(MAX_DIAGNOSTIC_BYTES * 2));
    let bounded = truncate_diagnostics(&long);
    assert!(bounded.len() <= MAX_DIAGNOSTIC_BYTES + '…'.len_utf8());
    assert!(bounded.ends_with("THE-END"));
  }

  #[test]
  fn preset_index_parsing() {
    assert_eq!(next_preset_index(""), 0);
    assert_eq!(next_preset_index("[preset.0]\nname=\"Linux\"\n[preset.0.options]\n"), 1);
    assert_eq!(
      next_preset_index("[preset.0]\n[preset.0.options]\n[preset.3]\n[preset.3.options]\n"),
      4
    );
  }

  #[tokio::test]
  async fn ensure_preset_creates_file() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);

    ensure_preset(&unit.project_dir, "Web").await.unwrap();

    let content = fs::read_to_string(unit.project_dir.join("export_presets.cfg")).unwrap();
    assert!(content.contains("[preset.0]"));
    assert!(content.contains("platform=\"Web\""));
  }

  #[tokio::test]
  async fn ensure_preset_leaves_existing_web_preset_alone() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);
    let original = "[preset.0]\nname=\"Custom\"\nplatform=\"Web\"\n";
    fs::write(unit.project_dir.join("export_presets.cfg"), original).unwrap();

    ensure_preset(&unit.project_dir, "Web").await.unwrap();

    let content = fs::read_to_string(unit.project_dir.join("export_presets.cfg")).unwrap();
    assert_eq!(content, original);
  }

  #[tokio::test]
  async fn ensure_preset_appends_when_web_missing() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);
    fs::write(
      unit.project_dir.join("export_presets.cfg"),
      "[preset.0]\nname=\"Linux\"\nplatform=\"Linux\"\n",
    )
    .unwrap();

    ensure_preset(&unit.project_dir, "Web").await.unwrap();

    let content = fs::read_to_string(unit.project_dir.join("export_presets.cfg")).unwrap();
    assert!(content.contains("platform=\"Linux\""));
    assert!(content.contains("[preset.1]"));
    assert!(content.contains("platform=\"Web\""));
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn export_success_with_stub_binary() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);
    // $6 is the output path (after --headless --path DIR --export-release PRESET)
    let stub = write_stub_exporter(&temp, "mkdir -p \"$(dirname \"$6\")\" && echo ok > \"$6\"");

    let exporter = GodotExporter::new(stub, "Web");
    let outcome = exporter.export(&unit, Duration::from_secs(10)).await;

    assert!(outcome.is_success(), "diagnostics: {}", outcome.diagnostics);
    assert!(unit.output_file().exists());
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn export_failure_is_classified() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);
    let stub = write_stub_exporter(&temp, "echo 'ERROR: Cannot allocate memory' >&2; exit 1");

    let exporter = GodotExporter::new(stub, "Web");
    let outcome = exporter.export(&unit, Duration::from_secs(10)).await;

    assert_eq!(outcome.failure, Some(FailureKind::Transient));
    assert_eq!(outcome.exit_code, Some(1));
    assert!(outcome.diagnostics.contains("Cannot allocate memory"));
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn export_exit_zero_without_artifact_is_fatal() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);
    let stub = write_stub_exporter(&temp, "exit 0");

    let exporter = GodotExporter::new(stub, "Web");
    let outcome = exporter.export(&unit, Duration::from_secs(10)).await;

    assert_eq!(outcome.failure, Some(FailureKind::Fatal));
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn export_times_out() {
    let temp = TempDir::new().unwrap();
    let unit = make_unit(&temp);
    let stub = write_stub_exporter(&temp, "sleep 30");

    let exporter = GodotExporter::new(stub, "Web");
    let outcome = exporter.export(&unit, Duration::from_millis(200)).await;

    assert_eq!(outcome.failure, Some(FailureKind::Timeout));
  }

  #[tokio::test]
  async fn verify_missing_binary_fails() {
    let exporter = GodotExporter::new("/nonexistent/godot-binary", "Web");
    let result = exporter.verify().await;
    assert!(matches!(result, Err(ExportError::BinaryUnavailable { .. })));
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn verify_reports_version() {
    let temp = TempDir::new().unwrap();
    let stub = write_stub_exporter(&temp, "echo 4.4.1.stable.official");

    let exporter = GodotExporter::new(stub, "Web");
    let version = exporter.verify().await.unwrap();
    assert_eq!(version, "4.4.1.stable.official");
  }
}
