use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gdweb_core::run::DEFAULT_CACHE_FILE;

mod cmd;
mod output;

use output::OutputFormat;

/// gdweb - parallel web-export builder for Godot project collections
#[derive(Parser)]
#[command(name = "gdweb")]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

/// Arguments shared by build and plan.
#[derive(Args)]
struct CommonArgs {
  /// Root directory containing Godot projects
  #[arg(long, default_value = "godot-demo-projects")]
  projects_dir: PathBuf,

  /// Build cache file
  #[arg(long, default_value = DEFAULT_CACHE_FILE)]
  cache_file: PathBuf,

  /// Number of parallel export jobs (default: planned from host resources)
  #[arg(short, long)]
  jobs: Option<usize>,

  /// Rebuild all projects regardless of the cache
  #[arg(short, long)]
  force: bool,

  /// Base reference for VCS change detection (e.g. HEAD~1)
  #[arg(long)]
  base_ref: Option<String>,

  /// Permit a projects root with no projects in it
  #[arg(long)]
  allow_empty: bool,

  /// Output format
  #[arg(long, value_enum, default_value = "text")]
  format: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
  /// Export all dirty projects to web artifacts
  Build {
    #[command(flatten)]
    common: CommonArgs,

    /// Path to the Godot binary
    #[arg(long, default_value = "godot")]
    godot_binary: PathBuf,

    /// Export preset name
    #[arg(long, default_value = "Web")]
    preset: String,

    /// Per-project export timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Stop dispatching new exports after the first fatal failure
    #[arg(long)]
    strict: bool,
  },

  /// Show what would be built, without invoking the exporter
  Plan {
    #[command(flatten)]
    common: CommonArgs,
  },

  /// Show build cache statistics
  Status {
    /// Build cache file
    #[arg(long, default_value = DEFAULT_CACHE_FILE)]
    cache_file: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
  },
}

fn main() -> Result<()> {
  // Initialize logging
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();

  let exit_code = match cli.command {
    Commands::Build {
      common,
      godot_binary,
      preset,
      timeout,
      strict,
    } => cmd::cmd_build(&common, &godot_binary, &preset, timeout, strict)?,
    Commands::Plan { common } => cmd::cmd_plan(&common)?,
    Commands::Status { cache_file, format } => cmd::cmd_status(&cache_file, format)?,
  };

  if exit_code != 0 {
    std::process::exit(exit_code);
  }
  Ok(())
}
