//! Container and volume discovery (§4.1).
//!
//! Talks to the Docker daemon exclusively through the CLI (`docker ps`,
//! `docker inspect`, `docker volume ls/inspect`) via [`ProcessRunner`],
//! mirroring the original `DockerDiscovery` class's shelling-out approach
//! rather than linking the daemon's HTTP API.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::constants::{
    DOCKER_COMPOSE_CONFIG_LABEL, DOCKER_COMPOSE_PROJECT_LABEL, DOCKER_COMPOSE_SERVICE_LABEL,
    VOLUME_SIZE_ESTIMATE_TIMEOUT,
};
use crate::error::{DiscoveryError, KopiError, Result};
use crate::process_runner::{CommandSpec, ProcessRunner};
use crate::types::{BackupUnit, ContainerInfo, DatabaseKind, UnitKind, VolumeInfo};

/// Discovers running containers, the volumes they use, and groups both into
/// [`BackupUnit`]s.
pub struct DockerDiscovery<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> DockerDiscovery<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        DockerDiscovery { runner }
    }

    /// Probe that the Docker daemon is reachable. Called eagerly by callers
    /// before any discovery work, matching `_validate_docker_access` being
    /// invoked from the original class's constructor.
    pub async fn validate_access(&self) -> Result<()> {
        let out = self
            .runner
            .run(CommandSpec::new("docker", vec!["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()]))
            .await
            .map_err(|e| KopiError::RuntimeUnavailable(e.to_string()))?;
        if !out.success() {
            return Err(KopiError::RuntimeUnavailable(out.stderr_str()));
        }
        Ok(())
    }

    /// Full discovery pass: containers, volumes, grouped into units.
    pub async fn discover(&self) -> Result<Vec<BackupUnit>> {
        let containers = self.discover_containers().await?;
        let volumes = self.discover_volumes().await?;
        Ok(group_into_units(containers, volumes))
    }

    async fn discover_containers(&self) -> Result<Vec<ContainerInfo>> {
        let ids_out = self
            .runner
            .run(CommandSpec::new("docker", vec!["ps".to_string(), "-q".to_string()]))
            .await
            .map_err(|e| DiscoveryError::CommandFailed(e.to_string()))?;
        if !ids_out.success() {
            return Err(DiscoveryError::CommandFailed(ids_out.stderr_str()).into());
        }

        let ids: Vec<String> = ids_out
            .stdout_str()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut containers = Vec::with_capacity(ids.len());
        for id in ids {
            match self.inspect_container(&id).await {
                Ok(info) => containers.push(info),
                Err(e) => warn!(container = %id, error = %e, "failed to inspect container, skipping"),
            }
        }
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let out = self
            .runner
            .run(CommandSpec::new(
                "docker",
                vec!["inspect".to_string(), id.to_string()],
            ))
            .await
            .map_err(|e| KopiError::InspectFailure {
                kind: "container",
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if !out.success() {
            return Err(KopiError::InspectFailure {
                kind: "container",
                id: id.to_string(),
                reason: out.stderr_str(),
            });
        }

        let parsed: Vec<JsonValue> = serde_json::from_slice(&out.stdout)?;
        let raw = parsed.into_iter().next().ok_or_else(|| KopiError::InspectFailure {
            kind: "container",
            id: id.to_string(),
            reason: "empty inspect array".to_string(),
        })?;

        Ok(parse_container_info(raw))
    }

    async fn discover_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let names_out = self
            .runner
            .run(CommandSpec::new(
                "docker",
                vec!["volume".to_string(), "ls".to_string(), "--format".to_string(), "{{.Name}}".to_string()],
            ))
            .await
            .map_err(|e| DiscoveryError::CommandFailed(e.to_string()))?;
        if !names_out.success() {
            return Err(DiscoveryError::CommandFailed(names_out.stderr_str()).into());
        }

        let names: Vec<String> = names_out
            .stdout_str()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut volumes = Vec::with_capacity(names.len());
        for name in names {
            match self.inspect_volume(&name).await {
                Ok(mut vol) => {
                    vol.size_bytes = self.estimate_volume_size(&vol.mountpoint).await;
                    volumes.push(vol);
                }
                Err(e) => warn!(volume = %name, error = %e, "failed to inspect volume, skipping"),
            }
        }
        Ok(volumes)
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo> {
        let out = self
            .runner
            .run(CommandSpec::new(
                "docker",
                vec!["volume".to_string(), "inspect".to_string(), name.to_string()],
            ))
            .await
            .map_err(|e| KopiError::InspectFailure {
                kind: "volume",
                id: name.to_string(),
                reason: e.to_string(),
            })?;
        if !out.success() {
            return Err(KopiError::InspectFailure {
                kind: "volume",
                id: name.to_string(),
                reason: out.stderr_str(),
            });
        }

        let parsed: Vec<JsonValue> = serde_json::from_slice(&out.stdout)?;
        let raw = parsed.into_iter().next().ok_or_else(|| KopiError::InspectFailure {
            kind: "volume",
            id: name.to_string(),
            reason: "empty inspect array".to_string(),
        })?;

        let labels = raw
            .get("Labels")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(VolumeInfo {
            name: raw.get("Name").and_then(|v| v.as_str()).unwrap_or(name).to_string(),
            driver: raw.get("Driver").and_then(|v| v.as_str()).unwrap_or("local").to_string(),
            mountpoint: raw
                .get("Mountpoint")
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_default(),
            labels,
            size_bytes: None,
            container_ids: Vec::new(),
        })
    }

    /// Best-effort size via `du -sb`, bounded by a short timeout; failures
    /// are swallowed (size is advisory, used only for progress reporting).
    async fn estimate_volume_size(&self, mountpoint: &PathBuf) -> Option<u64> {
        let out = self
            .runner
            .run(
                CommandSpec::new(
                    "du",
                    vec!["-sb".to_string(), mountpoint.display().to_string()],
                )
                .timeout(VOLUME_SIZE_ESTIMATE_TIMEOUT),
            )
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        out.stdout_str().split_whitespace().next()?.parse().ok()
    }
}

fn parse_container_info(raw: JsonValue) -> ContainerInfo {
    let id = raw.get("Id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let name = raw
        .get("Name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let image = raw
        .pointer("/Config/Image")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let status = raw
        .pointer("/State/Status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let labels: BTreeMap<String, String> = raw
        .pointer("/Config/Labels")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let environment: Vec<(String, String)> = raw
        .pointer("/Config/Env")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|entry| entry.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let volumes: Vec<String> = raw
        .pointer("/Mounts")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|m| m.get("Type").and_then(|t| t.as_str()) == Some("volume"))
                .filter_map(|m| m.get("Name").and_then(|n| n.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let compose_file = labels
        .get(DOCKER_COMPOSE_CONFIG_LABEL)
        .and_then(|files| files.split(',').next())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);

    let database_type = DatabaseKind::detect(&image);

    debug!(
        container = %name,
        image = %image,
        database_type = ?database_type,
        "parsed container"
    );

    ContainerInfo {
        id,
        name,
        image,
        status,
        labels,
        environment,
        volumes,
        compose_file,
        inspect_data: raw,
        database_type,
    }
}

/// Group containers and volumes into [`BackupUnit`]s: containers sharing a
/// compose project label form one `Stack` unit; everything else is its own
/// `Standalone` unit. Volumes attach to every unit whose containers mount
/// them. Units are sorted database-first, then by name, matching the
/// original grouping's final sort key.
fn group_into_units(containers: Vec<ContainerInfo>, volumes: Vec<VolumeInfo>) -> Vec<BackupUnit> {
    let volumes_by_name: HashMap<String, VolumeInfo> =
        volumes.into_iter().map(|v| (v.name.clone(), v)).collect();

    let mut units: BTreeMap<String, BackupUnit> = BTreeMap::new();
    let mut volume_map: HashMap<String, Vec<String>> = HashMap::new();

    for container in containers {
        let unit_name = container
            .stack_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| container.name.clone());
        let kind = if container.stack_name().is_some() {
            UnitKind::Stack
        } else {
            UnitKind::Standalone
        };

        for vol_name in &container.volumes {
            volume_map.entry(vol_name.clone()).or_default().push(unit_name.clone());
        }

        let entry = units.entry(unit_name.clone()).or_insert_with(|| BackupUnit {
            name: unit_name.clone(),
            kind,
            containers: Vec::new(),
            volumes: Vec::new(),
            compose_file: None,
        });
        if entry.compose_file.is_none() {
            entry.compose_file = container.compose_file.clone();
        }
        entry.containers.push(container);
    }

    for (vol_name, unit_names) in volume_map {
        if let Some(vol) = volumes_by_name.get(&vol_name) {
            for unit_name in unit_names {
                if let Some(unit) = units.get_mut(&unit_name) {
                    if !unit.volumes.iter().any(|v| v.name == vol_name) {
                        unit.volumes.push(vol.clone());
                    }
                }
            }
        }
    }

    let mut result: Vec<BackupUnit> = units.into_values().collect();
    result.sort_by_key(|u| (!u.has_databases(), u.name.clone()));
    result
}

#[allow(dead_code)]
fn compose_service_label_hint() -> &'static str {
    DOCKER_COMPOSE_SERVICE_LABEL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_runner::{CommandOutput, MockProcessRunner};
    use mockall::predicate::*;

    fn container_json(id: &str, name: &str, image: &str, project: Option<&str>) -> String {
        let labels = match project {
            Some(p) => format!(r#"{{"{}":"{}"}}"#, DOCKER_COMPOSE_PROJECT_LABEL, p),
            None => "{}".to_string(),
        };
        format!(
            r#"[{{"Id":"{id}","Name":"/{name}","Config":{{"Image":"{image}","Labels":{labels},"Env":["FOO=bar"]}},"State":{{"Status":"running"}},"Mounts":[]}}]"#
        )
    }

    #[tokio::test]
    async fn groups_standalone_and_stack_containers() {
        let mut mock = MockProcessRunner::new();

        mock.expect_run()
            .withf(|spec| spec.program == "docker" && spec.args == vec!["ps", "-q"])
            .returning(|_| {
                Ok(CommandOutput { status: 0, stdout: b"c1\nc2\n".to_vec(), stderr: vec![] })
            });

        mock.expect_run()
            .withf(|spec| spec.program == "docker" && spec.args.first().map(String::as_str) == Some("inspect") && spec.args.get(1).map(String::as_str) == Some("c1"))
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: container_json("c1", "web", "postgres:14", Some("blog")).into_bytes(),
                    stderr: vec![],
                })
            });
        mock.expect_run()
            .withf(|spec| spec.program == "docker" && spec.args.first().map(String::as_str) == Some("inspect") && spec.args.get(1).map(String::as_str) == Some("c2"))
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: container_json("c2", "standalone-nginx", "nginx:1.25", None).into_bytes(),
                    stderr: vec![],
                })
            });

        mock.expect_run()
            .withf(|spec| spec.program == "docker" && spec.args.first().map(String::as_str) == Some("volume") && spec.args.get(1).map(String::as_str) == Some("ls"))
            .returning(|_| Ok(CommandOutput { status: 0, stdout: vec![], stderr: vec![] }));

        let discovery = DockerDiscovery::new(&mock);
        let units = discovery.discover().await.unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "blog");
        assert!(units[0].has_databases());
        assert_eq!(units[1].name, "standalone-nginx");
        assert!(!units[1].has_databases());
    }

    #[test]
    fn parses_container_info_fields() {
        let raw: JsonValue = serde_json::from_str(&container_json("abc", "db", "mysql:8.0", Some("proj"))).unwrap();
        let raw = raw.as_array().unwrap()[0].clone();
        let info = parse_container_info(raw);
        assert_eq!(info.name, "db");
        assert_eq!(info.database_type, Some(DatabaseKind::Mysql));
        assert_eq!(info.stack_name(), Some("proj"));
        assert_eq!(info.environment, vec![("FOO".to_string(), "bar".to_string())]);
    }
}
