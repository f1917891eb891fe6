//! # kopi-docka
//!
//! A cold-backup orchestrator for container workloads, backed by a
//! content-addressed, deduplicating, encrypted snapshot engine.
//!
//! Given a running container host, it discovers logical *backup units*
//! (compose stacks or standalone containers with their volumes and,
//! optionally, databases), and drives each unit through a sequential cold
//! backup: quiesce containers, capture recipes (compose manifests plus
//! redacted inspect data) and volumes as deterministic tar streams, stream
//! each artifact into the repository, then restart containers. Restore is
//! the inverse, guided interactively or by a scripted restore point.
//!
//! ## Architecture
//!
//! - `types`: value objects shared across every module
//! - `constants`: pinned labels, timeouts, retention defaults
//! - `error`: layered `thiserror` error enums
//! - `config`: layered TOML + environment configuration
//! - `process_runner`: the sole subprocess-execution boundary, mocked in tests
//! - `lock`: single-holder process-exclusion lock
//! - `safe_exit`: signal handling, subprocess tracking, ordered cleanup
//! - `system_utils` / `humanize`: environment probes and display formatting
//! - `backend_uri`: repository backend URI parsing
//! - `repository`: the snapshot-engine command façade
//! - `discovery`: container/volume enumeration and unit grouping
//! - `db_strategies`: per-DBMS dump/restore command construction
//! - `recipe_replay`: `docker run`-equivalent reconstruction from inspect data
//! - `hooks`: pre/post backup and restore script execution
//! - `policy`: retention policy application
//! - `worker_pool`: bounded-concurrency task execution
//! - `backup`: the per-unit cold-backup orchestrator
//! - `restore`: the per-unit restore orchestrator
//! - `dr_bundle`: disaster-recovery bundle export
//! - `dry_run`: plan-only traversal and reporting
//! - `notify` / `service`: the systemd-integrated daemon loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use kopi_docka::config::Settings;
//! use kopi_docka::process_runner::SystemProcessRunner;
//! use kopi_docka::discovery::DockerDiscovery;
//!
//! # async fn example() -> kopi_docka::error::Result<()> {
//! let settings = Settings::load(None)?;
//! let runner = SystemProcessRunner;
//! let discovery = DockerDiscovery::new(&runner);
//! let units = discovery.discover().await?;
//! println!("discovered {} backup units", units.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod backend_uri;
pub mod backup;
pub mod config;
pub mod constants;
pub mod db_strategies;
pub mod discovery;
pub mod dr_bundle;
pub mod dry_run;
pub mod error;
pub mod hooks;
pub mod humanize;
pub mod lock;
pub mod notify;
pub mod policy;
pub mod process_runner;
pub mod recipe_replay;
pub mod repository;
pub mod restore;
pub mod safe_exit;
pub mod service;
pub mod system_utils;
pub mod types;
pub mod worker_pool;

pub use backend_uri::Backend;
pub use backup::{BackupOrchestrator, BackupRunSettings};
pub use config::Settings;
pub use discovery::DockerDiscovery;
pub use dr_bundle::{DrBundleSettings, DrBundler};
pub use dry_run::{DryRunReport, DryRunReporter};
pub use error::{KopiError, Result};
pub use repository::Repository;
pub use restore::{RestoreOrchestrator, RestoreRunSettings};
pub use types::{BackupMetadata, BackupUnit, RestoreMetadata, RestorePoint};

/// Crate version, taken from `Cargo.toml` at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types and traits, re-exported for a single-line import.
pub mod prelude {
    pub use crate::backend_uri::Backend;
    pub use crate::backup::{BackupOrchestrator, BackupRunSettings};
    pub use crate::config::Settings;
    pub use crate::discovery::DockerDiscovery;
    pub use crate::error::{KopiError, Result};
    pub use crate::process_runner::{CommandSpec, ProcessRunner, SystemProcessRunner};
    pub use crate::repository::Repository;
    pub use crate::restore::{RestoreOrchestrator, RestoreRunSettings};
    pub use crate::types::{BackupMetadata, BackupUnit, RestoreMetadata, RestorePoint};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_a_non_empty_version() {
        assert!(!VERSION.is_empty());
    }
}
