//! Error types for the kopi-docka backup system.

use thiserror::Error;

/// Top-level error type covering every failure mode the orchestrator can
/// surface. Each variant corresponds to a row of the error-kind table: the
/// orchestrator consults [`KopiError::is_fatal`] to decide whether a
/// failure aborts the current unit or is recorded as a warning.
#[derive(Error, Debug)]
pub enum KopiError {
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("disaster recovery error: {0}")]
    DisasterRecovery(#[from] DrError),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("inspect failed for {kind} {id}: {reason}")]
    InspectFailure {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("failed to stop container {0}: {1}")]
    StopFailure(String, String),

    #[error("failed to start container {0}: {1}")]
    StartFailure(String, String),

    #[error("archiver failed for volume {volume}: {reason}")]
    ArchiverFailure { volume: String, reason: String },

    #[error("dumper failed for database container {container}: {reason}")]
    DumperFailure { container: String, reason: String },

    #[error("policy apply failed for {path}: {reason}")]
    PolicyApplyFailure { path: String, reason: String },

    #[error("another instance already holds the process lock")]
    LockHeld,

    #[error("operation interrupted by signal")]
    Interrupted,

    #[error("snapshot verification failed: {0}")]
    VerifyFailure(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl KopiError {
    /// True when the error must abort the *current unit* entirely (the
    /// "Fatal" rows of the error-kind table). Everything else is a
    /// warning recorded in `BackupMetadata` without stopping the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KopiError::RuntimeUnavailable(_)
                | KopiError::Repository(RepositoryError::EngineUnreachable(_))
                | KopiError::Repository(RepositoryError::BadPassword)
                | KopiError::Hook(HookError::PreHookFailed(_))
                | KopiError::Interrupted
        )
    }
}

/// Errors raised while discovering containers and volumes.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("container runtime not accessible: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to parse runtime output: {0}")]
    ParseFailure(String),

    #[error("container command failed: {0}")]
    CommandFailed(String),
}

/// Errors from the repository façade (the snapshot-engine command layer).
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("snapshot engine binary not found or unreachable: {0}")]
    EngineUnreachable(String),

    #[error("snapshot engine rejected the repository password")]
    BadPassword,

    #[error("failed to initialize repository: {0}")]
    InitFailed(String),

    #[error("failed to connect to repository: {0}")]
    ConnectFailed(String),

    #[error("snapshot creation failed: {0}")]
    SnapshotFailed(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("could not parse engine JSON output: {0}")]
    InvalidJson(String),

    #[error("unsupported or unparseable backend URI: {0}")]
    InvalidBackendUri(String),
}

/// Errors from the hooks manager.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("pre-hook failed: {0}")]
    PreHookFailed(String),

    #[error("post-hook failed: {0}")]
    PostHookFailed(String),

    #[error("hook script not found or not executable: {0}")]
    NotExecutable(String),

    #[error("hook timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from the disaster-recovery bundler.
#[derive(Error, Debug)]
pub enum DrError {
    #[error("bundle encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("passphrase generation failed: {0}")]
    PassphraseFailed(String),

    #[error("stream mode requires an explicit passphrase")]
    StreamRequiresPassphrase,

    #[error("bundle rotation failed: {0}")]
    RotationFailed(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KopiError>;
