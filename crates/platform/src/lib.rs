//! gdweb-platform: host resource probing for the export orchestrator.
//!
//! The exporter subprocess is resource-heavy; this crate answers the
//! questions the resource planner asks about the machine it runs on:
//! logical core count, available memory, the soft file-descriptor limit,
//! and whether we are running inside a recognized CI environment.

mod resources;

pub use resources::{SystemResources, is_ci_environment, reclaim_memory};
