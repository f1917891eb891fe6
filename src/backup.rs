//! Per-unit cold-backup orchestrator (§4.2), the core state machine:
//!
//! ```text
//! IDLE → POLICY_SET → PRE_HOOK → CONTAINERS_STOPPED → RECIPES_CAPTURED →
//!   (VOLUMES || DATABASES)_STREAMED →  // bounded parallel
//!   CONTAINERS_STARTED → POST_HOOK → METADATA_PERSISTED → DONE
//! ```
//!
//! Containers are always restarted on the way out, matching the original's
//! `try`/`finally` shape even though Rust has no `finally`: every exit path
//! through this function passes through [`BackupOrchestrator::start_containers`].
//! Grounded in `BackupManager`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::{DATABASE_BACKUP_DIR, RECIPE_STAGING_SUBDIR, REDACTED_VALUE, REDACTION_KEYS, VOLUME_BACKUP_DIR};
use crate::db_strategies;
use crate::hooks::{HookKind, HooksManager};
use crate::policy::{self, Retention};
use crate::process_runner::{CommandSpec, ProcessRunner};
use crate::repository::Repository;
use crate::safe_exit::{CleanupHandler, CleanupStack};
use crate::types::{BackupMetadata, BackupUnit, ContainerInfo, RunEvent, VolumeInfo};
use crate::worker_pool::{TaskOutcome, WorkerPool};

/// Runtime knobs for one backup run, resolved once from [`crate::config::Settings`].
#[derive(Debug, Clone)]
pub struct BackupRunSettings {
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub task_timeout: Duration,
    pub exclude_patterns: Vec<String>,
    pub database_backup: bool,
    pub retention: Retention,
    /// Root directory backing stable per-unit staging paths (the snapshot
    /// engine's cache directory). Recipe staging lives at
    /// `<cache_dir>/staging/recipes/<unit>/`.
    pub cache_dir: PathBuf,
}

pub struct BackupOrchestrator<'a> {
    runner: &'a dyn ProcessRunner,
    repo: Repository<'a>,
    hooks: HooksManager<'a>,
    pool: WorkerPool,
    settings: BackupRunSettings,
    cleanup: CleanupStack,
    cleanup_runner: Arc<dyn ProcessRunner>,
    in_flight_snapshot: Arc<Mutex<Option<String>>>,
}

impl<'a> BackupOrchestrator<'a> {
    /// `cleanup_runner` is an owned, independently-refcounted handle to the
    /// same process boundary as `runner`, needed because SafeExit handlers
    /// are stored in `cleanup` and may run from the signal-handling task
    /// long after this orchestrator's own borrow has gone out of scope.
    pub fn new(
        runner: &'a dyn ProcessRunner,
        repo: Repository<'a>,
        hooks: HooksManager<'a>,
        pool: WorkerPool,
        settings: BackupRunSettings,
        cleanup: CleanupStack,
        cleanup_runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        BackupOrchestrator {
            runner,
            repo,
            hooks,
            pool,
            settings,
            cleanup,
            cleanup_runner,
            in_flight_snapshot: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the full cold-backup sequence for one unit, always restarting
    /// its containers before returning regardless of where the run failed.
    pub async fn backup_unit(&self, unit: &BackupUnit) -> BackupMetadata {
        info!(unit = %unit.name, "starting backup");
        let start = Instant::now();
        let backup_id = Uuid::new_v4().simple().to_string();
        let started_at = Utc::now();
        let started_iso = started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut snapshot_ids = Vec::new();
        let mut volumes_backed_up = 0u32;
        let mut databases_backed_up = 0u32;

        policy::apply_unit_policies(&self.repo, &unit.name, self.settings.retention).await;

        let pre_hook_ok = self.hooks.run(HookKind::PreBackup, &unit.name).await;
        if !pre_hook_ok {
            errors.push(RunEvent { stage: "pre_hook".to_string(), message: "pre-backup hook failed".to_string() });
            error!(unit = %unit.name, "pre-backup hook failed, aborting before stopping containers");
        } else {
            let stop_targets: Vec<ContainerInfo> = unit.containers.iter().filter(|c| c.is_running()).cloned().collect();
            self.cleanup.register(Arc::new(ServiceContinuityHandler::new(self.cleanup_runner.clone(), stop_targets)));
            self.cleanup.register(Arc::new(DataSafetyHandler::new(unit.name.clone(), self.in_flight_snapshot.clone())));

            info!(unit = %unit.name, count = unit.containers.len(), "stopping containers");
            self.stop_containers(&unit.containers, &mut warnings).await;

            match self.backup_recipes(unit, &backup_id, &started_iso).await {
                Ok(id) => snapshot_ids.push(id),
                Err(e) => {
                    errors.push(RunEvent { stage: "recipes".to_string(), message: e.clone() });
                    error!(unit = %unit.name, error = %e, "recipe backup failed");
                }
            }

            let outcomes = self.backup_artifacts(unit, &backup_id, &started_iso).await;
            for (kind, name, outcome) in outcomes {
                match outcome {
                    TaskOutcome::Completed(id) => {
                        snapshot_ids.push(id);
                        match kind {
                            ArtifactKind::Volume => volumes_backed_up += 1,
                            ArtifactKind::Database => databases_backed_up += 1,
                        }
                    }
                    TaskOutcome::Failed(reason) => {
                        errors.push(RunEvent { stage: format!("{kind:?}").to_lowercase(), message: format!("{name}: {reason}") });
                    }
                    TaskOutcome::TimedOut => {
                        errors.push(RunEvent { stage: format!("{kind:?}").to_lowercase(), message: format!("{name}: task timed out") });
                    }
                }
            }
        }

        info!(unit = %unit.name, count = unit.containers.len(), "starting containers");
        self.start_containers(&unit.containers, &mut warnings).await;

        if pre_hook_ok {
            self.cleanup.deregister(ServiceContinuityHandler::NAME);
            self.cleanup.deregister(DataSafetyHandler::NAME);
        }

        let post_hook_ok = self.hooks.run(HookKind::PostBackup, &unit.name).await;
        if !post_hook_ok {
            warnings.push(RunEvent { stage: "post_hook".to_string(), message: "post-backup hook failed".to_string() });
        }

        let metadata = BackupMetadata {
            unit_name: unit.name.clone(),
            backup_id,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            snapshot_ids,
            volumes_backed_up,
            databases_backed_up,
            success: errors.is_empty(),
            errors,
            warnings,
        };

        if metadata.success {
            info!(unit = %unit.name, duration_ms = metadata.duration_ms, "backup completed successfully");
        } else {
            warn!(unit = %unit.name, duration_ms = metadata.duration_ms, error_count = metadata.errors.len(), "backup completed with errors");
        }

        metadata
    }

    async fn stop_containers(&self, containers: &[ContainerInfo], warnings: &mut Vec<RunEvent>) {
        for container in containers {
            if !container.is_running() {
                continue;
            }
            let spec = CommandSpec::new(
                "docker",
                vec!["stop".to_string(), "-t".to_string(), self.settings.stop_timeout.as_secs().to_string(), container.id.clone()],
            );
            match self.runner.run(spec).await {
                Ok(out) if out.success() => debug!(container = %container.name, "stopped container"),
                Ok(out) => {
                    warnings.push(RunEvent { stage: "stop".to_string(), message: format!("{}: {}", container.name, out.stderr_str()) });
                }
                Err(e) => {
                    warnings.push(RunEvent { stage: "stop".to_string(), message: format!("{}: {e}", container.name) });
                }
            }
        }
    }

    async fn start_containers(&self, containers: &[ContainerInfo], warnings: &mut Vec<RunEvent>) {
        for container in containers {
            let spec = CommandSpec::new("docker", vec!["start".to_string(), container.id.clone()]);
            match self.runner.run(spec).await {
                Ok(out) if out.success() => {
                    debug!(container = %container.name, "started container");
                    self.wait_container_healthy(container).await;
                }
                Ok(out) => {
                    warnings.push(RunEvent { stage: "start".to_string(), message: format!("{}: {}", container.name, out.stderr_str()) });
                }
                Err(e) => {
                    warnings.push(RunEvent { stage: "start".to_string(), message: format!("{}: {e}", container.name) });
                }
            }
        }
    }

    /// Poll `docker inspect .State.Health.Status` until healthy/unhealthy or
    /// `start_timeout` elapses; containers without a health check just get a
    /// short settle sleep.
    async fn wait_container_healthy(&self, container: &ContainerInfo) {
        let probe = CommandSpec::new(
            "docker",
            vec!["inspect".to_string(), "-f".to_string(), "{{json .State.Health}}".to_string(), container.id.clone()],
        );
        let has_health = match self.runner.run(probe).await {
            Ok(out) => {
                let text = out.stdout_str();
                let trimmed = text.trim();
                out.success() && trimmed != "null" && trimmed != "{}" && !trimmed.is_empty()
            }
            Err(_) => false,
        };

        if !has_health {
            tokio::time::sleep(crate::constants::HEALTH_SETTLE_TIME).await;
            return;
        }

        let deadline = Instant::now() + self.settings.start_timeout;
        while Instant::now() < deadline {
            let status_probe = CommandSpec::new(
                "docker",
                vec!["inspect".to_string(), "-f".to_string(), "{{.State.Health.Status}}".to_string(), container.id.clone()],
            );
            if let Ok(out) = self.runner.run(status_probe).await {
                match out.stdout_str().trim() {
                    "healthy" => {
                        debug!(container = %container.name, "container is healthy");
                        return;
                    }
                    "unhealthy" => {
                        warn!(container = %container.name, "container is unhealthy");
                        return;
                    }
                    _ => {}
                }
            }
            tokio::time::sleep(crate::constants::HEALTH_POLL_INTERVAL).await;
        }
        warn!(container = %container.name, "container not healthy after start_timeout");
    }

    /// Capture compose file + redacted inspect data for every container in
    /// the unit into the unit's stable staging directory, then snapshot it.
    /// The staging path must stay byte-identical across runs: it is the
    /// snapshot engine's dedup/retention source identity for this unit's
    /// recipe history, not just scratch space.
    async fn backup_recipes(&self, unit: &BackupUnit, backup_id: &str, started_iso: &str) -> Result<String, String> {
        let staging = StagingDir::stable(&self.settings.cache_dir, &unit.name).map_err(|e| e.to_string())?;

        if let Some(compose_path) = &unit.compose_file {
            if let Ok(contents) = std::fs::read_to_string(compose_path) {
                let _ = std::fs::write(staging.path().join("docker-compose.yml"), contents);
            }
        }

        for container in &unit.containers {
            let redacted = redact_inspect(&container.inspect_data);
            let pretty = serde_json::to_string_pretty(&redacted).map_err(|e| e.to_string())?;
            std::fs::write(staging.path().join(format!("{}_inspect.json", container.name)), pretty)
                .map_err(|e| e.to_string())?;
        }

        let mut tags = BTreeMap::new();
        tags.insert("type".to_string(), "recipe".to_string());
        tags.insert("unit".to_string(), unit.name.clone());
        tags.insert("timestamp".to_string(), started_iso.to_string());
        tags.insert("backup_id".to_string(), backup_id.to_string());

        let source_path = staging.path().display().to_string();
        *self.in_flight_snapshot.lock().unwrap() = Some(source_path.clone());
        let result = self.repo.create_snapshot(&source_path, &tags).await.map_err(|e| e.to_string());
        *self.in_flight_snapshot.lock().unwrap() = None;
        result
    }

    /// Back up every volume and (if enabled) every database container in
    /// the unit, concurrently under the bounded worker pool.
    async fn backup_artifacts(
        &self,
        unit: &BackupUnit,
        backup_id: &str,
        started_iso: &str,
    ) -> Vec<(ArtifactKind, String, TaskOutcome<String>)> {
        type BoxedFut<'b> = std::pin::Pin<Box<dyn std::future::Future<Output = (ArtifactKind, String, TaskOutcome<String>)> + 'b>>;

        let mut futures: Vec<BoxedFut<'_>> = unit
            .volumes
            .iter()
            .map(|volume| -> BoxedFut<'_> {
                let task_id = format!("volume:{}:{}", unit.name, volume.name);
                let label = volume.name.clone();
                Box::pin(async move {
                    let fut = self.backup_volume(volume, &unit.name, backup_id, started_iso);
                    (ArtifactKind::Volume, label, self.pool.run(task_id, self.settings.task_timeout, fut).await)
                })
            })
            .collect();

        if self.settings.database_backup {
            for container in unit.containers.iter().filter(|c| c.database_type.is_some()) {
                let task_id = format!("database:{}:{}", unit.name, container.name);
                let label = container.name.clone();
                futures.push(Box::pin(async move {
                    let fut = self.backup_database(container, &unit.name, backup_id, started_iso);
                    (ArtifactKind::Database, label, self.pool.run(task_id, self.settings.task_timeout, fut).await)
                }));
            }
        }

        futures::future::join_all(futures).await
    }

    async fn backup_volume(
        &self,
        volume: &VolumeInfo,
        unit_name: &str,
        backup_id: &str,
        started_iso: &str,
    ) -> Result<String, String> {
        let gnu = self.has_gnu_tar().await;
        let mut args = vec!["-cf".to_string(), "-".to_string(), "--numeric-owner".to_string()];
        if gnu {
            args.extend(
                ["--xattrs", "--acls", "--one-file-system", "--mtime=@0", "--clamp-mtime", "--sort=name"]
                    .map(String::from),
            );
        }
        for pattern in &self.settings.exclude_patterns {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args.push("-C".to_string());
        args.push(volume.mountpoint.display().to_string());
        args.push(".".to_string());

        let out = self.runner.run(CommandSpec::new("tar", args)).await.map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(out.stderr_str());
        }

        let mut tags = BTreeMap::new();
        tags.insert("type".to_string(), "volume".to_string());
        tags.insert("unit".to_string(), unit_name.to_string());
        tags.insert("volume".to_string(), volume.name.clone());
        tags.insert("timestamp".to_string(), started_iso.to_string());
        tags.insert("backup_id".to_string(), backup_id.to_string());
        tags.insert("size_bytes".to_string(), volume.size_bytes.unwrap_or(0).to_string());

        let source_path = format!("{VOLUME_BACKUP_DIR}/{unit_name}/{}", volume.name);
        *self.in_flight_snapshot.lock().unwrap() = Some(source_path.clone());
        let result = self.repo.create_snapshot_from_stdin(out.stdout, &source_path, &tags).await.map_err(|e| e.to_string());
        *self.in_flight_snapshot.lock().unwrap() = None;
        result
    }

    async fn has_gnu_tar(&self) -> bool {
        let spec = CommandSpec::new("tar", vec!["--version".to_string()]).timeout(Duration::from_secs(2));
        match self.runner.run(spec).await {
            Ok(out) => out.stdout_str().contains("GNU tar"),
            Err(_) => false,
        }
    }

    async fn backup_database(
        &self,
        container: &ContainerInfo,
        unit_name: &str,
        backup_id: &str,
        started_iso: &str,
    ) -> Result<String, String> {
        let Some(kind) = container.database_type else {
            return Err("container has no detected database type".to_string());
        };

        let version = match self.runner.run(db_strategies::version_probe(kind, &container.id)).await {
            Ok(out) if out.success() => db_strategies::parse_version(kind, &out.stdout_str()),
            _ => None,
        };

        let spec = db_strategies::backup_command(kind, container, version.as_deref());
        let out = self.runner.run(spec).await.map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(out.stderr_str());
        }

        let mut tags = BTreeMap::new();
        tags.insert("type".to_string(), "database".to_string());
        tags.insert("database_type".to_string(), kind.tag().to_string());
        tags.insert("unit".to_string(), unit_name.to_string());
        tags.insert("container".to_string(), container.name.clone());
        tags.insert("timestamp".to_string(), started_iso.to_string());
        tags.insert("backup_id".to_string(), backup_id.to_string());

        let source_path = format!("{DATABASE_BACKUP_DIR}/{unit_name}/{}", container.name);
        *self.in_flight_snapshot.lock().unwrap() = Some(source_path.clone());
        let result = self.repo.create_snapshot_from_stdin(out.stdout, &source_path, &tags).await.map_err(|e| e.to_string());
        *self.in_flight_snapshot.lock().unwrap() = None;
        result
    }
}

#[derive(Debug, Clone, Copy)]
enum ArtifactKind {
    Volume,
    Database,
}

/// Replace any environment value whose key contains one of
/// [`REDACTION_KEYS`] (case-insensitive) with [`REDACTED_VALUE`], matching
/// `backup.py`'s recipe-capture redaction exactly.
fn redact_inspect(data: &JsonValue) -> JsonValue {
    let mut cloned = data.clone();
    if let Some(env) = cloned.pointer_mut("/Config/Env").and_then(|v| v.as_array_mut()) {
        for entry in env.iter_mut() {
            if let Some(s) = entry.as_str() {
                if let Some((key, _)) = s.split_once('=') {
                    let upper = key.to_uppercase();
                    if REDACTION_KEYS.iter().any(|k| upper.contains(k)) {
                        *entry = JsonValue::String(format!("{key}={REDACTED_VALUE}"));
                    }
                }
            }
        }
    }
    cloned
}

/// Stable per-unit staging directory under the cache root, at
/// `<cache_dir>/staging/recipes/<unit>/`. Cleared and repopulated (never
/// recreated under a fresh random name) on each run: the path handed to
/// the snapshot engine is that engine's dedup/retention source identity,
/// so it must stay byte-identical across backups of the same unit.
struct StagingDir(PathBuf);

impl StagingDir {
    fn stable(cache_dir: &Path, unit_name: &str) -> std::io::Result<Self> {
        let path = cache_dir.join(RECIPE_STAGING_SUBDIR).join(crate::types::sanitize_for_filename(unit_name));
        if path.exists() {
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                let entry_path = entry.path();
                if entry.file_type()?.is_dir() {
                    std::fs::remove_dir_all(&entry_path)?;
                } else {
                    std::fs::remove_file(&entry_path)?;
                }
            }
        } else {
            std::fs::create_dir_all(&path)?;
        }
        Ok(StagingDir(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

/// Restarts the containers this unit stopped if the process is interrupted
/// before [`BackupOrchestrator::start_containers`] gets to run — the
/// "containers always come back, even on interrupt" guarantee. Registered
/// immediately before [`BackupOrchestrator::stop_containers`], deregistered
/// once `start_containers` returns.
struct ServiceContinuityHandler {
    runner: Arc<dyn ProcessRunner>,
    containers: Vec<ContainerInfo>,
}

impl ServiceContinuityHandler {
    const NAME: &'static str = "service_continuity";

    fn new(runner: Arc<dyn ProcessRunner>, containers: Vec<ContainerInfo>) -> Self {
        ServiceContinuityHandler { runner, containers }
    }
}

#[async_trait]
impl CleanupHandler for ServiceContinuityHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        for container in &self.containers {
            let spec = CommandSpec::new("docker", vec!["start".to_string(), container.id.clone()]);
            if let Err(e) = self.runner.run(spec).await {
                warn!(container = %container.name, error = %e, "failed to restart container during interrupt cleanup");
            }
        }
        Ok(())
    }
}

/// Guards the span between a unit's containers being stopped and its last
/// snapshot-create reaching the repository. The repository engine itself
/// guarantees a snapshot either completes or never existed (there is no
/// partial-write state to roll back), so this handler's job on interrupt is
/// purely diagnostic: record which virtual path, if any, was mid-create so
/// the operator knows that path may still reflect the previous run rather
/// than a half-written one.
struct DataSafetyHandler {
    unit_name: String,
    in_flight: Arc<Mutex<Option<String>>>,
}

impl DataSafetyHandler {
    const NAME: &'static str = "data_safety";

    fn new(unit_name: String, in_flight: Arc<Mutex<Option<String>>>) -> Self {
        DataSafetyHandler { unit_name, in_flight }
    }
}

#[async_trait]
impl CleanupHandler for DataSafetyHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(path) = self.in_flight.lock().unwrap().clone() {
            warn!(unit = %self.unit_name, path = %path, "interrupted with a snapshot-create in flight; the repository engine guarantees it either completed or never existed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_matching_env_keys_only() {
        let data = serde_json::json!({
            "Config": {
                "Env": ["PATH=/usr/bin", "MYSQL_ROOT_PASSWORD=secret", "APP_API_KEY=xyz", "FOO=bar"]
            }
        });
        let redacted = redact_inspect(&data);
        let env: Vec<&str> = redacted.pointer("/Config/Env").unwrap().as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(env[0], "PATH=/usr/bin");
        assert_eq!(env[1], "MYSQL_ROOT_PASSWORD=***REDACTED***");
        assert_eq!(env[2], "APP_API_KEY=***REDACTED***");
        assert_eq!(env[3], "FOO=bar");
    }

    #[test]
    fn staging_dir_path_is_stable_across_runs() {
        let cache_dir = tempfile::tempdir().unwrap();

        let first = StagingDir::stable(cache_dir.path(), "blog").unwrap();
        let first_path = first.path().to_path_buf();
        std::fs::write(first_path.join("stale_inspect.json"), b"old run").unwrap();

        let second = StagingDir::stable(cache_dir.path(), "blog").unwrap();
        assert_eq!(second.path(), first_path, "the staging path must stay byte-identical across runs of the same unit");
        assert!(!second.path().join("stale_inspect.json").exists(), "a new run must clear stale artifacts, not accumulate them");
    }

    #[test]
    fn staging_dir_survives_process_exit() {
        let cache_dir = tempfile::tempdir().unwrap();
        let path = {
            let staging = StagingDir::stable(cache_dir.path(), "web").unwrap();
            staging.path().to_path_buf()
        };
        assert!(path.exists(), "unlike ephemeral scratch space, the stable staging root is not removed when it goes out of scope");
    }
}
