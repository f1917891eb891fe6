//! Repository façade over the content-addressed snapshot engine (§4.5).
//!
//! Every call shells out to the `kopia` binary via [`ProcessRunner`],
//! scoped to a dedicated profile config file so this system's repository
//! state never collides with an operator's own interactive kopia use.
//! Grounded in `KopiaRepository`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::backend_uri::Backend;
use crate::error::{RepositoryError, Result};
use crate::process_runner::{CommandOutput, CommandSpec, ProcessRunner};
use crate::types::Snapshot;

const STATUS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Repository façade bound to one profile (one config file, one password).
pub struct Repository<'a> {
    runner: &'a dyn ProcessRunner,
    backend: Backend,
    password: String,
    profile: String,
    cache_directory: Option<PathBuf>,
}

impl<'a> Repository<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        backend: Backend,
        password: impl Into<String>,
        profile: impl Into<String>,
        cache_directory: Option<PathBuf>,
    ) -> Self {
        Repository {
            runner,
            backend,
            password: password.into(),
            profile: profile.into(),
            cache_directory,
        }
    }

    /// `~/.config/kopia/repository-<profile>.config`, our isolated config
    /// file so we never touch an operator's own kopia profiles.
    fn config_file(&self) -> PathBuf {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/root"));
        home.join(".config/kopia").join(format!("repository-{}.config", self.profile))
    }

    fn base_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("KOPIA_PASSWORD".to_string(), self.password.clone())];
        if let Some(dir) = &self.cache_directory {
            env.push(("KOPIA_CACHE_DIRECTORY".to_string(), dir.display().to_string()));
        }
        env
    }

    fn spec(&self, args: Vec<String>) -> CommandSpec {
        let mut spec = CommandSpec::new("kopia", args);
        for (k, v) in self.base_env() {
            spec = spec.env(k, v);
        }
        spec
    }

    /// True iff our profile's config file already resolves to an
    /// accessible repository.
    pub async fn is_initialized(&self) -> bool {
        if !self.config_file().exists() {
            return false;
        }
        let mut args = vec!["repository".to_string(), "status".to_string(), "--json".to_string()];
        args.extend(["--config-file".to_string(), self.config_file().display().to_string()]);
        let out = match self.runner.run(self.spec(args).timeout(STATUS_TIMEOUT)).await {
            Ok(o) => o,
            Err(_) => return false,
        };
        out.success()
    }

    /// Connect to an existing repository, or create one if none exists yet
    /// at this location. Mirrors `initialize()`'s try-connect-then-create
    /// fallback, including the force-connect retry when `create` reports
    /// "existing data in storage location" (another profile/tool already
    /// initialized this location).
    pub async fn initialize(&self) -> Result<()> {
        info!(backend = self.backend.kind_name(), profile = %self.profile, "initializing repository");

        if self.try_connect(false).await? {
            info!("connected to existing repository");
            return Ok(());
        }

        if let Backend::Filesystem { path } = &self.backend {
            std::fs::create_dir_all(shellexpand_home(path))
                .map_err(|e| RepositoryError::InitFailed(e.to_string()))?;
        }

        let mut args = vec!["repository".to_string(), "create".to_string()];
        args.extend(self.backend.engine_args());
        args.extend([
            "--description".to_string(),
            format!("Kopi-Docka Backup Repository ({})", self.profile),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ]);

        let out = self
            .runner
            .run(self.spec(args))
            .await
            .map_err(|e| RepositoryError::InitFailed(e.to_string()))?;

        if !out.success() {
            let stderr = out.stderr_str();
            if stderr.contains("existing data in storage location") {
                info!("repository exists at location, attempting to connect");
                if self.try_connect(true).await? {
                    info!("connected to existing repository after create conflict");
                    return Ok(());
                }
                return Err(RepositoryError::InitFailed(
                    "repository exists but cannot connect; check password or use a different path".to_string(),
                )
                .into());
            }
            return Err(RepositoryError::InitFailed(stderr).into());
        }

        info!("repository created successfully");
        Ok(())
    }

    pub async fn connect(&self) -> Result<()> {
        if !self.try_connect(false).await? {
            return Err(RepositoryError::ConnectFailed("failed to connect to repository".to_string()).into());
        }
        Ok(())
    }

    async fn try_connect(&self, force: bool) -> Result<bool> {
        let mut args = vec!["repository".to_string(), "connect".to_string()];
        args.extend(self.backend.engine_args());
        args.extend(["--config-file".to_string(), self.config_file().display().to_string()]);
        if force {
            args.extend([
                "--no-check-for-updates".to_string(),
                "--override-hostname".to_string(),
                "--override-username".to_string(),
            ]);
        }

        let out = self
            .runner
            .run(self.spec(args))
            .await
            .map_err(|e| RepositoryError::ConnectFailed(e.to_string()))?;

        if out.success() {
            return Ok(true);
        }

        let stderr = out.stderr_str().to_lowercase();
        if stderr.contains("invalid password") {
            return Err(RepositoryError::BadPassword.into());
        }
        debug!(stderr = %stderr, "connect attempt did not succeed");
        Ok(false)
    }

    pub async fn disconnect(&self) {
        let args = vec![
            "repository".to_string(),
            "disconnect".to_string(),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ];
        let _ = self.runner.run(self.spec(args).timeout(STATUS_TIMEOUT)).await;
    }

    /// Apply the default compression and GFS retention policy, called once
    /// after a fresh `initialize()`.
    pub async fn set_default_policies(
        &self,
        compression: &str,
        daily: u32,
        weekly: u32,
        monthly: u32,
        yearly: u32,
    ) {
        let compression_args = vec![
            "policy".to_string(),
            "set".to_string(),
            "--global".to_string(),
            "--compression".to_string(),
            compression.to_string(),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ];
        if let Err(e) = self.runner.run(self.spec(compression_args)).await {
            warn!(error = %e, "failed to set compression policy");
        }

        let retention_args = vec![
            "policy".to_string(),
            "set".to_string(),
            "--global".to_string(),
            "--keep-latest".to_string(),
            "10".to_string(),
            "--keep-daily".to_string(),
            daily.to_string(),
            "--keep-weekly".to_string(),
            weekly.to_string(),
            "--keep-monthly".to_string(),
            monthly.to_string(),
            "--keep-yearly".to_string(),
            yearly.to_string(),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ];
        if let Err(e) = self.runner.run(self.spec(retention_args)).await {
            warn!(error = %e, "failed to set retention policy");
        }
    }

    /// Apply retention to a specific virtual path rather than globally,
    /// used by the policy manager when per-unit overrides exist.
    pub async fn set_path_policy(&self, path: &str, daily: u32, weekly: u32, monthly: u32, yearly: u32) -> Result<()> {
        let args = vec![
            "policy".to_string(),
            "set".to_string(),
            path.to_string(),
            "--keep-daily".to_string(),
            daily.to_string(),
            "--keep-weekly".to_string(),
            weekly.to_string(),
            "--keep-monthly".to_string(),
            monthly.to_string(),
            "--keep-yearly".to_string(),
            yearly.to_string(),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ];
        let out = self.runner.run(self.spec(args)).await.map_err(|e| {
            RepositoryError::SnapshotFailed(format!("policy set failed for {path}: {e}"))
        })?;
        if !out.success() {
            return Err(crate::error::KopiError::PolicyApplyFailure {
                path: path.to_string(),
                reason: out.stderr_str(),
            });
        }
        Ok(())
    }

    /// Snapshot a directory tree at `path`, tagged with `tags` plus the
    /// mandatory `profile:<name>` tag.
    pub async fn create_snapshot(&self, path: &str, tags: &BTreeMap<String, String>) -> Result<String> {
        let mut args = vec!["snapshot".to_string(), "create".to_string(), path.to_string(), "--json".to_string()];
        args.extend(["--config-file".to_string(), self.config_file().display().to_string()]);
        for (k, v) in tags {
            args.extend(["--tags".to_string(), format!("{k}:{v}")]);
        }
        args.extend(["--tags".to_string(), format!("profile:{}", self.profile)]);

        let out = self
            .runner
            .run(self.spec(args))
            .await
            .map_err(|e| RepositoryError::SnapshotFailed(e.to_string()))?;
        self.extract_snapshot_id(&out)
    }

    /// Snapshot a binary stream (a dump or archiver's stdout), recorded
    /// under the virtual path `path` even though no such path exists on
    /// disk — `path` is purely the dedup identity.
    pub async fn create_snapshot_from_stdin(
        &self,
        stdin: Vec<u8>,
        path: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut args = vec![
            "snapshot".to_string(),
            "create".to_string(),
            "--stdin".to_string(),
            "--stdin-file".to_string(),
            path.to_string(),
            "--json".to_string(),
        ];
        args.extend(["--config-file".to_string(), self.config_file().display().to_string()]);
        for (k, v) in tags {
            args.extend(["--tags".to_string(), format!("{k}:{v}")]);
        }
        args.extend(["--tags".to_string(), format!("profile:{}", self.profile)]);

        let out = self
            .runner
            .run(self.spec(args).stdin(stdin))
            .await
            .map_err(|e| RepositoryError::SnapshotFailed(e.to_string()))?;
        self.extract_snapshot_id(&out)
    }

    fn extract_snapshot_id(&self, out: &CommandOutput) -> Result<String> {
        if !out.success() {
            return Err(RepositoryError::SnapshotFailed(out.stderr_str()).into());
        }
        let data = parse_single_json_line(&out.stdout_str())
            .ok_or_else(|| RepositoryError::InvalidJson(out.stdout_str()))?;
        let id = data
            .get("snapshotID")
            .or_else(|| data.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        id.ok_or_else(|| RepositoryError::InvalidJson("missing snapshotID/id in engine output".to_string()).into())
    }

    /// List snapshots under our profile, optionally further filtered by
    /// `tag_filter`.
    pub async fn list_snapshots(&self, tag_filter: &BTreeMap<String, String>) -> Result<Vec<Snapshot>> {
        let mut args = vec!["snapshot".to_string(), "list".to_string(), "--json".to_string()];
        args.extend(["--config-file".to_string(), self.config_file().display().to_string()]);
        args.extend(["--tags".to_string(), format!("profile:{}", self.profile)]);
        for (k, v) in tag_filter {
            args.extend(["--tags".to_string(), format!("{k}:{v}")]);
        }

        let out = self
            .runner
            .run(self.spec(args))
            .await
            .map_err(|e| RepositoryError::SnapshotFailed(e.to_string()))?;
        if !out.success() {
            warn!(stderr = %out.stderr_str(), "failed to list snapshots");
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for line in out.stdout_str().lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(raw) = serde_json::from_str::<JsonValue>(line) else { continue };
            let tags: BTreeMap<String, String> = raw
                .get("tags")
                .and_then(|v| v.as_object())
                .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                .unwrap_or_default();
            snapshots.push(Snapshot {
                id: raw.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                path: raw.pointer("/source/path").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                timestamp: raw.get("startTime").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                tags,
                size_bytes: raw.pointer("/stats/totalSize").and_then(|v| v.as_u64()).unwrap_or(0),
            });
        }
        Ok(snapshots)
    }

    pub async fn restore_snapshot(&self, snapshot_id: &str, target_path: &std::path::Path) -> Result<()> {
        let args = vec![
            "snapshot".to_string(),
            "restore".to_string(),
            snapshot_id.to_string(),
            target_path.display().to_string(),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ];
        let out = self
            .runner
            .run(self.spec(args))
            .await
            .map_err(|e| RepositoryError::RestoreFailed(e.to_string()))?;
        if !out.success() {
            return Err(RepositoryError::RestoreFailed(out.stderr_str()).into());
        }
        Ok(())
    }

    /// Restore a stdin-origin snapshot (a database dump) to a local file,
    /// since `kopia restore` always materializes files on disk even for
    /// snapshots captured via `--stdin`.
    pub async fn restore_snapshot_to_file(&self, snapshot_id: &str, target_file: &std::path::Path) -> Result<()> {
        self.restore_snapshot(snapshot_id, target_file).await
    }

    /// Partial content verification (`--verify-files-percent=10`), a cheap
    /// post-backup sanity check rather than a full integrity scan.
    pub async fn verify_snapshot(&self, snapshot_id: &str) -> bool {
        let args = vec![
            "snapshot".to_string(),
            "verify".to_string(),
            "--verify-files-percent=10".to_string(),
            snapshot_id.to_string(),
            "--config-file".to_string(),
            self.config_file().display().to_string(),
        ];
        matches!(self.runner.run(self.spec(args)).await, Ok(out) if out.success())
    }

    pub async fn maintenance_run(&self, full: bool) -> Result<()> {
        let mut args = vec!["maintenance".to_string(), "run".to_string()];
        if full {
            args.push("--full".to_string());
        }
        args.extend(["--config-file".to_string(), self.config_file().display().to_string()]);
        let out = self
            .runner
            .run(self.spec(args))
            .await
            .map_err(|e| RepositoryError::SnapshotFailed(e.to_string()))?;
        if !out.success() {
            warn!(stderr = %out.stderr_str(), "maintenance run failed");
        }
        Ok(())
    }

    /// Scan recipe snapshots, grouped by `unit` tag, keeping the newest
    /// per unit — used to list what units have ever been backed up.
    pub async fn list_backup_units(&self) -> Result<Vec<(String, String, String)>> {
        let mut filter = BTreeMap::new();
        filter.insert("type".to_string(), "recipe".to_string());
        let recipe_snaps = self.list_snapshots(&filter).await?;

        let mut units: BTreeMap<String, (String, String)> = BTreeMap::new();
        for snap in recipe_snaps {
            let Some(unit) = snap.tags.get("unit").cloned() else { continue };
            let newer = units.get(&unit).map(|(ts, _)| snap.timestamp.as_str() > ts.as_str()).unwrap_or(true);
            if newer {
                units.insert(unit.clone(), (snap.timestamp.clone(), snap.id.clone()));
            }
        }
        Ok(units.into_iter().map(|(name, (ts, id))| (name, ts, id)).collect())
    }
}

fn parse_single_json_line(s: &str) -> Option<JsonValue> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(first_line) = s.lines().next() {
        if let Ok(v) = serde_json::from_str(first_line) {
            return Some(v);
        }
    }
    serde_json::from_str(s).ok()
}

fn shellexpand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/root"));
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_runner::{CommandOutput as Out, MockProcessRunner};

    #[tokio::test]
    async fn create_snapshot_extracts_id_from_json() {
        let mut mock = MockProcessRunner::new();
        mock.expect_run().returning(|_| {
            Ok(Out {
                status: 0,
                stdout: br#"{"id":"abc123","snapshotID":"abc123"}"#.to_vec(),
                stderr: vec![],
            })
        });

        let repo = Repository::new(&mock, Backend::Filesystem { path: "/backup".to_string() }, "pw", "kopi-docka", None);
        let id = repo.create_snapshot("recipes/web", &BTreeMap::new()).await.unwrap();
        assert_eq!(id, "abc123");
    }

    #[tokio::test]
    async fn create_snapshot_surfaces_engine_failure() {
        let mut mock = MockProcessRunner::new();
        mock.expect_run().returning(|_| Ok(Out { status: 1, stdout: vec![], stderr: b"boom".to_vec() }));

        let repo = Repository::new(&mock, Backend::Filesystem { path: "/backup".to_string() }, "pw", "kopi-docka", None);
        let result = repo.create_snapshot("recipes/web", &BTreeMap::new()).await;
        assert!(result.is_err());
    }

    #[test]
    fn parses_single_or_multiline_json() {
        assert!(parse_single_json_line("{}").is_some());
        assert!(parse_single_json_line("{\"a\":1}\n{\"b\":2}").is_some());
        assert!(parse_single_json_line("").is_none());
    }
}
