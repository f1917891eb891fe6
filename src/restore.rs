//! Per-unit restore orchestrator (§4.3): recipes → volumes → start →
//! databases. Grounded in `cores/restore_manager.py` for the
//! recipe/volume/compose-vs-standalone flow and in `restore.py` +
//! `restore-db.py` for the live database-import steps the newer manager
//! only prints instructions for.
//!
//! `plan` returns an explicit [`RestoreStep`] list so the same sequence can
//! either be executed or rendered as operator-facing instructions, matching
//! `RestoreOrchestrator::plan`'s separation of construction from execution.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db_strategies::{self, RestoreMethod};
use crate::hooks::{HookKind, HooksManager};
use crate::process_runner::{CommandSpec, ProcessRunner};
use crate::recipe_replay::{self, ReplayCommand};
use crate::repository::Repository;
use crate::types::{DatabaseKind, RestoreMetadata, RestorePoint, RunEvent};

/// Runtime knobs for one restore run.
#[derive(Debug, Clone)]
pub struct RestoreRunSettings {
    pub start_timeout: std::time::Duration,
}

/// One planned action in a restore sequence. Kept as plain data rather than
/// a closure so a dry-run reporter and the live executor share one plan.
#[derive(Debug, Clone)]
pub enum RestoreStep {
    /// Stop a container with this name if it currently exists, since it
    /// will be replaced by the recreated one.
    StopExistingContainer { name: String },
    /// Remove a stopped container with this name, making way for the
    /// recreated one.
    RemoveExistingContainer { name: String },
    /// Atomic volume-replacement sequence: safety-archive whatever is
    /// currently in `volume` to `/tmp`, recreate the (empty) volume, then
    /// copy the snapshot's restored contents into it.
    RestoreVolume { volume: String, snapshot_id: String },
    /// `docker compose up -d` in `compose_dir`.
    StartComposeStack { compose_dir: PathBuf },
    /// Recreate a standalone container from a reconstructed `docker run`.
    RunContainer { command: ReplayCommand },
    /// Poll until the named container reports healthy or `start_timeout`
    /// elapses.
    WaitContainerHealthy { container: String },
    /// Import a database dump into an already-running container.
    RestoreDatabase { container: String, snapshot_id: String, kind: DatabaseKind },
}

pub struct RestoreOrchestrator<'a> {
    runner: &'a dyn ProcessRunner,
    repo: Repository<'a>,
    hooks: HooksManager<'a>,
    settings: RestoreRunSettings,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        repo: Repository<'a>,
        hooks: HooksManager<'a>,
        settings: RestoreRunSettings,
    ) -> Self {
        RestoreOrchestrator { runner, repo, hooks, settings }
    }

    /// Restore the recipe snapshot for `point` into `<staging>/recipes/<unit>`
    /// and report whether the restored tree is a compose stack.
    pub async fn restore_recipes(&self, point: &RestorePoint, staging: &Path) -> Result<(PathBuf, bool), String> {
        let recipe_dir = staging.join("recipes").join(&point.unit);
        std::fs::create_dir_all(&recipe_dir).map_err(|e| e.to_string())?;

        let Some(recipe_snapshot) = &point.recipe else {
            return Err("restore point has no recipe snapshot".to_string());
        };

        self.repo.restore_snapshot(&recipe_snapshot.id, &recipe_dir).await.map_err(|e| e.to_string())?;
        info!(unit = %point.unit, dir = %recipe_dir.display(), "recipes restored");

        let is_stack = recipe_dir.join("docker-compose.yml").exists();
        Ok((recipe_dir, is_stack))
    }

    /// Build the ordered action list for restoring `point`, given the
    /// already-restored recipe directory and whether it is a compose stack.
    pub fn plan(&self, point: &RestorePoint, recipe_dir: &Path, is_stack: bool) -> Vec<RestoreStep> {
        let mut steps = Vec::new();

        let replay_commands = if is_stack { Vec::new() } else { recipe_replay::build_all_commands(recipe_dir) };

        for cmd in &replay_commands {
            steps.push(RestoreStep::StopExistingContainer { name: cmd.container_name.clone() });
            steps.push(RestoreStep::RemoveExistingContainer { name: cmd.container_name.clone() });
        }

        for snap in &point.volumes {
            let volume = snap.tags.get("volume").cloned().unwrap_or_else(|| "unknown".to_string());
            steps.push(RestoreStep::RestoreVolume { volume, snapshot_id: snap.id.clone() });
        }

        if is_stack {
            steps.push(RestoreStep::StartComposeStack { compose_dir: recipe_dir.to_path_buf() });
        } else {
            for cmd in replay_commands {
                let name = cmd.container_name.clone();
                steps.push(RestoreStep::RunContainer { command: cmd });
                steps.push(RestoreStep::WaitContainerHealthy { container: name });
            }
        }

        for snap in &point.databases {
            let container = snap.tags.get("container").cloned().unwrap_or_else(|| "unknown".to_string());
            let kind = snap
                .tags
                .get("database_type")
                .and_then(|s| match s.as_str() {
                    "postgres" => Some(DatabaseKind::Postgres),
                    "mysql" => Some(DatabaseKind::Mysql),
                    "mariadb" => Some(DatabaseKind::MariaDb),
                    "mongo" => Some(DatabaseKind::Mongo),
                    "redis" => Some(DatabaseKind::Redis),
                    _ => None,
                });
            if let Some(kind) = kind {
                steps.push(RestoreStep::WaitContainerHealthy { container: container.clone() });
                steps.push(RestoreStep::RestoreDatabase { container, snapshot_id: snap.id.clone(), kind });
            } else {
                warn!(container = %container, "skipping database restore: unknown database type tag");
            }
        }

        steps
    }

    /// Render a plan as operator-facing instructions, for the dry-run /
    /// print-only mode.
    pub fn describe(&self, steps: &[RestoreStep]) -> Vec<String> {
        steps
            .iter()
            .map(|step| match step {
                RestoreStep::StopExistingContainer { name } => format!("docker stop {name}"),
                RestoreStep::RemoveExistingContainer { name } => format!("docker rm {name}"),
                RestoreStep::RestoreVolume { volume, snapshot_id } => format!(
                    "safety-archive, recreate, and restore volume {volume} from snapshot {snapshot_id}"
                ),
                RestoreStep::StartComposeStack { compose_dir } => format!("cd {} && docker compose up -d", compose_dir.display()),
                RestoreStep::RunContainer { command } => format!("docker {}", command.args.join(" ")),
                RestoreStep::WaitContainerHealthy { container } => format!("wait for {container} to become healthy"),
                RestoreStep::RestoreDatabase { container, snapshot_id, kind } => {
                    format!("import {snapshot_id} ({}) into {container}", kind.tag())
                }
            })
            .collect()
    }

    /// Restore one point end to end: recipes, plan, execute, pre/post hooks.
    pub async fn restore_point(&self, point: &RestorePoint, staging: &Path) -> RestoreMetadata {
        let start = Instant::now();
        let started_at = Utc::now();

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut volumes_restored = 0u32;
        let mut databases_restored = 0u32;

        let pre_hook_ok = self.hooks.run(HookKind::PreRestore, &point.unit).await;
        if !pre_hook_ok {
            errors.push(RunEvent { stage: "pre_hook".to_string(), message: "pre-restore hook failed".to_string() });
        } else {
            match self.restore_recipes(point, staging).await {
                Ok((recipe_dir, is_stack)) => {
                    let steps = self.plan(point, &recipe_dir, is_stack);
                    for step in steps {
                        match self.execute_step(&step, staging).await {
                            Ok(()) => {
                                if matches!(step, RestoreStep::RestoreVolume { .. }) {
                                    volumes_restored += 1;
                                }
                                if matches!(step, RestoreStep::RestoreDatabase { .. }) {
                                    databases_restored += 1;
                                }
                            }
                            Err(e) => {
                                errors.push(RunEvent { stage: step_stage(&step), message: e });
                            }
                        }
                    }
                }
                Err(e) => {
                    errors.push(RunEvent { stage: "recipes".to_string(), message: e });
                }
            }
        }

        let post_hook_ok = self.hooks.run(HookKind::PostRestore, &point.unit).await;
        if !post_hook_ok {
            warnings.push(RunEvent { stage: "post_hook".to_string(), message: "post-restore hook failed".to_string() });
        }

        let metadata = RestoreMetadata {
            unit_name: point.unit.clone(),
            backup_id: point.backup_id.clone(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            volumes_restored,
            databases_restored,
            success: errors.is_empty(),
            errors,
            warnings,
        };

        if metadata.success {
            info!(unit = %point.unit, duration_ms = metadata.duration_ms, "restore completed successfully");
        } else {
            warn!(unit = %point.unit, error_count = metadata.errors.len(), "restore completed with errors");
        }

        metadata
    }

    async fn execute_step(&self, step: &RestoreStep, staging: &Path) -> Result<(), String> {
        match step {
            RestoreStep::StopExistingContainer { name } => {
                if self.container_exists(name).await {
                    let _ = self.runner.run(CommandSpec::new("docker", vec!["stop".to_string(), name.clone()])).await;
                }
                Ok(())
            }
            RestoreStep::RemoveExistingContainer { name } => {
                if self.container_exists(name).await {
                    let _ = self.runner.run(CommandSpec::new("docker", vec!["rm".to_string(), name.clone()])).await;
                }
                Ok(())
            }
            RestoreStep::RestoreVolume { volume, snapshot_id } => self.restore_volume(volume, snapshot_id, staging).await,
            RestoreStep::StartComposeStack { compose_dir } => self.start_compose_stack(compose_dir).await,
            RestoreStep::RunContainer { command } => self.run_container(command).await,
            RestoreStep::WaitContainerHealthy { container } => {
                self.wait_container_healthy(container).await;
                Ok(())
            }
            RestoreStep::RestoreDatabase { container, snapshot_id, kind } => {
                self.restore_database(container, snapshot_id, *kind, staging).await
            }
        }
    }

    async fn container_exists(&self, name: &str) -> bool {
        let spec = CommandSpec::new(
            "docker",
            vec!["ps".to_string(), "-a".to_string(), "--filter".to_string(), format!("name=^{name}$"), "--format".to_string(), "{{.Names}}".to_string()],
        );
        match self.runner.run(spec).await {
            Ok(out) => out.success() && !out.stdout_str().trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Stop users of the volume, archive its current contents, recreate it
    /// empty, then copy the restored snapshot data in with ownership/ACLs
    /// preserved, matching `RestoreManager._restore_volumes`.
    async fn restore_volume(&self, volume: &str, snapshot_id: &str, staging: &Path) -> Result<(), String> {
        let volume_restore_dir = staging.join("volumes").join(volume);
        std::fs::create_dir_all(&volume_restore_dir).map_err(|e| e.to_string())?;

        self.repo.restore_snapshot(snapshot_id, &volume_restore_dir).await.map_err(|e| e.to_string())?;

        let consumers = self.runner.run(CommandSpec::new("docker", vec!["ps".to_string(), "-q".to_string(), "--filter".to_string(), format!("volume={volume}")])).await;
        if let Ok(out) = consumers {
            for id in out.stdout_str().lines().filter(|l| !l.trim().is_empty()) {
                let _ = self.runner.run(CommandSpec::new("docker", vec!["stop".to_string(), id.to_string()])).await;
            }
        }

        let safety_archive = format!("/tmp/{volume}-backup-{}.tar.gz", Utc::now().format("%Y%m%d-%H%M%S"));
        let safety = CommandSpec::new(
            "docker",
            vec![
                "run".to_string(), "--rm".to_string(),
                "-v".to_string(), format!("{volume}:/src"),
                "-v".to_string(), "/tmp:/backup".to_string(),
                "alpine".to_string(), "sh".to_string(), "-c".to_string(),
                format!("tar -czf {safety_archive} -C /src ."),
            ],
        );
        if let Ok(out) = self.runner.run(safety).await {
            if !out.success() {
                warn!(volume = %volume, stderr = %out.stderr_str(), "safety backup of existing volume failed, continuing");
            }
        }

        let exists = self.runner.run(CommandSpec::new("docker", vec!["volume".to_string(), "ls".to_string(), "--format".to_string(), "{{.Name}}".to_string()])).await;
        let already_present = exists.map(|o| o.stdout_str().lines().any(|l| l.trim() == volume)).unwrap_or(false);
        if already_present {
            let rm = self.runner.run(CommandSpec::new("docker", vec!["volume".to_string(), "rm".to_string(), "-f".to_string(), volume.to_string()])).await.map_err(|e| e.to_string())?;
            if !rm.success() {
                return Err(format!("could not remove existing volume {volume}: {}", rm.stderr_str()));
            }
        }

        let create = self.runner.run(CommandSpec::new("docker", vec!["volume".to_string(), "create".to_string(), volume.to_string()])).await.map_err(|e| e.to_string())?;
        if !create.success() {
            return Err(format!("could not create volume {volume}: {}", create.stderr_str()));
        }

        let copy = CommandSpec::new(
            "docker",
            vec![
                "run".to_string(), "--rm".to_string(),
                "-v".to_string(), format!("{volume}:/restore"),
                "-v".to_string(), format!("{}:/backup:ro", volume_restore_dir.display()),
                "alpine".to_string(), "sh".to_string(), "-c".to_string(), "cd /backup && cp -a . /restore/".to_string(),
            ],
        );
        let copy_out = self.runner.run(copy).await.map_err(|e| e.to_string())?;
        if !copy_out.success() {
            return Err(format!("could not copy restored data into volume {volume}: {}", copy_out.stderr_str()));
        }

        debug!(volume = %volume, "volume restored");
        Ok(())
    }

    async fn start_compose_stack(&self, compose_dir: &Path) -> Result<(), String> {
        let spec = CommandSpec::new("docker", vec!["compose".to_string(), "up".to_string(), "-d".to_string()]);
        let mut spec = spec;
        spec.cwd = Some(compose_dir.to_path_buf());
        let out = self.runner.run(spec).await.map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(format!("docker compose up failed: {}", out.stderr_str()));
        }
        Ok(())
    }

    async fn run_container(&self, command: &ReplayCommand) -> Result<(), String> {
        let spec = CommandSpec::new("docker", command.args.clone());
        let out = self.runner.run(spec).await.map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(format!("could not start {}: {}", command.container_name, out.stderr_str()));
        }
        Ok(())
    }

    /// Poll until healthy/unhealthy or `start_timeout` elapses, matching
    /// the backup orchestrator's health wait (shared cadence constants).
    async fn wait_container_healthy(&self, container_name: &str) {
        let deadline = Instant::now() + self.settings.start_timeout;
        let probe = CommandSpec::new("docker", vec!["inspect".to_string(), "-f".to_string(), "{{json .State.Health}}".to_string(), container_name.to_string()]);
        let has_health = match self.runner.run(probe).await {
            Ok(out) => {
                let trimmed = out.stdout_str();
                let trimmed = trimmed.trim();
                out.success() && trimmed != "null" && trimmed != "{}" && !trimmed.is_empty()
            }
            Err(_) => false,
        };
        if !has_health {
            tokio::time::sleep(crate::constants::HEALTH_SETTLE_TIME).await;
            return;
        }
        while Instant::now() < deadline {
            let probe = CommandSpec::new("docker", vec!["inspect".to_string(), "-f".to_string(), "{{.State.Health.Status}}".to_string(), container_name.to_string()]);
            if let Ok(out) = self.runner.run(probe).await {
                match out.stdout_str().trim() {
                    "healthy" => return,
                    "unhealthy" => {
                        warn!(container = %container_name, "container unhealthy after restore start");
                        return;
                    }
                    _ => {}
                }
            }
            tokio::time::sleep(crate::constants::HEALTH_POLL_INTERVAL).await;
        }
        warn!(container = %container_name, "container not healthy within start_timeout");
    }

    /// Import a database dump into `container`, waiting for readiness,
    /// delivering the dump per the engine's [`RestoreMethod`], and running a
    /// best-effort post-restore verification. Failure here is recorded as
    /// an error but never rolls back volumes already restored, per §4.3.
    async fn restore_database(&self, container: &str, snapshot_id: &str, kind: DatabaseKind, staging: &Path) -> Result<(), String> {
        if !self.wait_database_ready(container, kind).await {
            return Err(format!("{container} did not become ready for restore"));
        }

        let version = match self.runner.run(db_strategies::version_probe(kind, container)).await {
            Ok(out) if out.success() => db_strategies::parse_version(kind, &out.stdout_str()),
            _ => None,
        };

        let dump_dir = staging.join("databases");
        std::fs::create_dir_all(&dump_dir).map_err(|e| e.to_string())?;
        let dump_file = dump_dir.join(format!("{container}.dump"));
        self.repo.restore_snapshot_to_file(snapshot_id, &dump_file).await.map_err(|e| e.to_string())?;

        let container_env = self.inspect_env(container).await;

        match db_strategies::restore_command(kind, container, &container_env, version.as_deref(), &dump_file) {
            RestoreMethod::Stdin(spec) => {
                let bytes = std::fs::read(&dump_file).map_err(|e| e.to_string())?;
                let out = self.runner.run(spec.stdin(bytes)).await.map_err(|e| e.to_string())?;
                if !out.success() {
                    return Err(format!("restore into {container} failed: {}", out.stderr_str()));
                }
            }
            RestoreMethod::CreateDbThenStdin { create_db, restore } => {
                let _ = self.runner.run(create_db).await;
                let bytes = std::fs::read(&dump_file).map_err(|e| e.to_string())?;
                let out = self.runner.run(restore.stdin(bytes)).await.map_err(|e| e.to_string())?;
                if !out.success() {
                    return Err(format!("restore into {container} failed: {}", out.stderr_str()));
                }
            }
            RestoreMethod::CopyRdbAndRestart { local_dump } => {
                let cp = self.runner.run(CommandSpec::new("docker", vec!["cp".to_string(), local_dump.display().to_string(), format!("{container}:/data/dump.rdb")])).await.map_err(|e| e.to_string())?;
                if !cp.success() {
                    return Err(format!("could not copy dump into {container}: {}", cp.stderr_str()));
                }
                let _ = self.runner.run(CommandSpec::new("docker", vec!["exec".to_string(), container.to_string(), "chown".to_string(), "redis:redis".to_string(), "/data/dump.rdb".to_string()])).await;
                let restart = self.runner.run(CommandSpec::new("docker", vec!["restart".to_string(), container.to_string()])).await.map_err(|e| e.to_string())?;
                if !restart.success() {
                    return Err(format!("could not restart {container}: {}", restart.stderr_str()));
                }
                if !self.wait_database_ready(container, kind).await {
                    return Err(format!("{container} did not come back up after restoring the RDB file"));
                }
            }
        }

        let verify = self.runner.run(db_strategies::verify_command(kind, container)).await;
        match verify {
            Ok(out) if out.success() => debug!(container = %container, "restore verification passed"),
            _ => warn!(container = %container, "restore verification could not be confirmed"),
        }

        Ok(())
    }

    async fn wait_database_ready(&self, container: &str, kind: DatabaseKind) -> bool {
        for _ in 0..crate::constants::DB_READY_MAX_ATTEMPTS {
            let probe = db_strategies::readiness_probe(kind, container);
            if let Ok(out) = self.runner.run(probe).await {
                if out.success() {
                    return true;
                }
            }
            if let Some(fallback) = db_strategies::readiness_probe_fallback(kind, container) {
                if let Ok(out) = self.runner.run(fallback).await {
                    if out.success() {
                        return true;
                    }
                }
            }
            tokio::time::sleep(crate::constants::DB_READY_POLL_INTERVAL).await;
        }
        false
    }

    /// Re-inspect the target container's environment at restore time (it
    /// may differ from what was captured at backup time).
    async fn inspect_env(&self, container: &str) -> Vec<(String, String)> {
        let spec = CommandSpec::new("docker", vec!["inspect".to_string(), "-f".to_string(), "{{json .Config.Env}}".to_string(), container.to_string()]);
        let Ok(out) = self.runner.run(spec).await else { return Vec::new() };
        if !out.success() {
            return Vec::new();
        }
        let Ok(entries) = serde_json::from_str::<Vec<String>>(&out.stdout_str()) else { return Vec::new() };
        entries
            .into_iter()
            .filter_map(|e| e.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect()
    }
}

fn step_stage(step: &RestoreStep) -> String {
    match step {
        RestoreStep::StopExistingContainer { .. } | RestoreStep::RemoveExistingContainer { .. } => "precheck".to_string(),
        RestoreStep::RestoreVolume { .. } => "volume".to_string(),
        RestoreStep::StartComposeStack { .. } | RestoreStep::RunContainer { .. } | RestoreStep::WaitContainerHealthy { .. } => "start".to_string(),
        RestoreStep::RestoreDatabase { .. } => "database".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Snapshot;
    use std::collections::BTreeMap;

    fn snap(kind: &str, volume_or_container: &str, id: &str) -> Snapshot {
        let mut tags = BTreeMap::new();
        tags.insert("type".to_string(), kind.to_string());
        if kind == "volume" {
            tags.insert("volume".to_string(), volume_or_container.to_string());
        } else if kind == "database" {
            tags.insert("container".to_string(), volume_or_container.to_string());
            tags.insert("database_type".to_string(), "postgres".to_string());
        }
        Snapshot { id: id.to_string(), path: String::new(), timestamp: String::new(), tags, size_bytes: 0 }
    }

    #[test]
    fn plan_orders_volumes_before_start_before_databases() {
        use crate::process_runner::MockProcessRunner;
        let runner = MockProcessRunner::new();
        let repo = Repository::new(&runner, crate::backend_uri::Backend::Filesystem { path: "/tmp/repo".into() }, "pw", "test", None);
        let hooks = HooksManager::new(&runner, Default::default());
        let orchestrator = RestoreOrchestrator::new(&runner, repo, hooks, RestoreRunSettings { start_timeout: std::time::Duration::from_secs(1) });

        let point = RestorePoint {
            unit: "web".to_string(),
            backup_id: "abc".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            recipe: Some(snap("recipe", "", "r1")),
            volumes: vec![snap("volume", "webdata", "v1")],
            databases: vec![snap("database", "db1", "d1")],
        };

        let steps = orchestrator.plan(&point, Path::new("/tmp/does-not-exist"), true);
        let volume_idx = steps.iter().position(|s| matches!(s, RestoreStep::RestoreVolume { .. })).unwrap();
        let start_idx = steps.iter().position(|s| matches!(s, RestoreStep::StartComposeStack { .. })).unwrap();
        let db_idx = steps.iter().position(|s| matches!(s, RestoreStep::RestoreDatabase { .. })).unwrap();
        assert!(volume_idx < start_idx);
        assert!(start_idx < db_idx);
    }
}
