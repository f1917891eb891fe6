//! Constants shared across modules.
//!
//! Values are pinned to the behavior of the system being reimplemented so
//! that filesystem layouts, label names, and timeouts remain stable across
//! upgrades.

use std::time::Duration;

/// `com.docker.compose.project` — marks the stack a container belongs to.
pub const DOCKER_COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// `com.docker.compose.project.config_files` — resolved compose file path(s).
pub const DOCKER_COMPOSE_CONFIG_LABEL: &str = "com.docker.compose.project.config_files";
/// `com.docker.compose.service` — service name within a stack.
pub const DOCKER_COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Virtual-path prefixes, stable identities for snapshot-engine dedup.
pub const RECIPE_BACKUP_DIR: &str = "recipes";
pub const VOLUME_BACKUP_DIR: &str = "volumes";
pub const DATABASE_BACKUP_DIR: &str = "databases";

/// Environment-variable key substrings (case-insensitive) that mark a
/// value as a secret subject to redaction in captured recipes.
pub const REDACTION_KEYS: &[&str] = &["PASS", "SECRET", "KEY", "TOKEN", "CREDENTIAL", "API", "AUTH"];
/// The literal value substituted for any redacted environment variable.
pub const REDACTED_VALUE: &str = "***REDACTED***";

/// Docker-injected environment variable prefixes excluded from recipe
/// replay (`docker run -e ...` reconstruction).
pub const DOCKER_INJECTED_ENV_PREFIXES: &[&str] =
    &["PATH=", "HOME=", "HOSTNAME=", "TERM=", "container="];

/// Default entrypoint considered "not custom" and therefore omitted from
/// recipe replay.
pub const DEFAULT_ENTRYPOINT: &[&str] = &["/docker-entrypoint.sh"];

/// `CpuShares` value Docker assigns by default; only non-default values
/// are replayed.
pub const DEFAULT_CPU_SHARES: i64 = 1024;

/// RAM-threshold (GiB, inclusive upper bound) → worker-count table used
/// to auto-size the bounded parallel pool, clamped to the CPU core count.
pub const RAM_WORKER_THRESHOLDS: &[(f64, usize)] = &[
    (2.0, 1),
    (4.0, 2),
    (8.0, 4),
    (16.0, 8),
    (f64::INFINITY, 12),
];

pub const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONTAINER_START_TIMEOUT: Duration = Duration::from_secs(60);
pub const BACKUP_OPERATION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Health-check polling cadence while waiting for a restarted container.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Settle time used when a container declares no health-check.
pub const HEALTH_SETTLE_TIME: Duration = Duration::from_secs(2);

/// Default hook execution timeout.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace window between SIGTERM and SIGKILL for a timed-out task's
/// process group.
pub const TASK_KILL_GRACE: Duration = Duration::from_secs(5);

/// Best-effort cap on the `du -sb` volume size estimate.
pub const VOLUME_SIZE_ESTIMATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Subdirectory (under the cache root) holding stable per-unit restore
/// staging directories, the restore-side counterpart of the backup
/// orchestrator's stable recipe-staging root.
pub const RESTORE_STAGING_SUBDIR: &str = "staging/restore";

/// Subdirectory (under the cache root) holding stable per-unit recipe
/// staging directories. Cleared and repopulated on each backup, never
/// recreated under a fresh random name, so the path handed to the
/// snapshot engine is byte-identical across runs of the same unit.
pub const RECIPE_STAGING_SUBDIR: &str = "staging/recipes";

/// Polling cadence and attempt budget for the database readiness wait
/// before a dump is imported, matching `restore-db.py`'s 2s/30-attempt loop.
pub const DB_READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DB_READY_MAX_ATTEMPTS: u32 = 30;

/// Default retention counts applied by the policy manager.
pub const DEFAULT_RETENTION_DAILY: u32 = 7;
pub const DEFAULT_RETENTION_WEEKLY: u32 = 4;
pub const DEFAULT_RETENTION_MONTHLY: u32 = 12;
pub const DEFAULT_RETENTION_YEARLY: u32 = 2;

/// Default number of rotated DR bundles to keep.
pub const DEFAULT_DR_BUNDLE_RETENTION: usize = 3;

/// Minimum entropy (bits) a generated DR passphrase must reach.
pub const DR_PASSPHRASE_MIN_ENTROPY_BITS: f64 = 128.0;

/// Chunk size the service loop sleeps in while waiting for the next
/// scheduled run or for a shutdown signal, matching `service.py`'s
/// `time.sleep(min(60, ...))` cadence.
pub const SCHEDULE_WAIT_CHUNK: Duration = Duration::from_secs(60);

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERAL_ERROR: i32 = 1;
pub const EXIT_INSUFFICIENT_PRIVILEGES: i32 = 13;
pub const EXIT_INTERRUPTED: i32 = 130;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
