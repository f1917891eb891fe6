//! Value objects shared across discovery, the orchestrators, and the
//! repository façade.
//!
//! Containers and volumes form an M:N relation; per §9 Design Notes this is
//! modeled as two flat vectors plus name-based adjacency rather than owning
//! pointers in both directions. A [`BackupUnit`] owns *slices* (by value,
//! cloned at grouping time) of the containers and volumes it covers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Closed set of database engines the backup system understands. Per §9
/// ("dynamic dispatch on database kind... implement as a tagged variant")
/// this is an enum rather than a trait object, with strategy behavior
/// implemented in `db_strategies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Mysql,
    MariaDb,
    Mongo,
    Redis,
}

impl DatabaseKind {
    /// Tag value written into snapshot metadata (`database_type`).
    pub fn tag(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::MariaDb => "mariadb",
            DatabaseKind::Mongo => "mongo",
            DatabaseKind::Redis => "redis",
        }
    }

    /// Classify an image reference by matching fixed substrings,
    /// case-insensitively. Matches are exclusive: the first table entry
    /// that matches wins, mirroring `original_source`'s `DATABASE_IMAGES`
    /// lookup order (postgres, mysql/mariadb/percona, mongo, redis).
    pub fn detect(image: &str) -> Option<DatabaseKind> {
        let lower = image.to_lowercase();
        const TABLE: &[(DatabaseKind, &[&str])] = &[
            (DatabaseKind::Postgres, &["postgres:", "postgresql:", "postgis/"]),
            (DatabaseKind::MariaDb, &["mariadb:"]),
            (DatabaseKind::Mysql, &["mysql:", "percona:"]),
            (DatabaseKind::Mongo, &["mongo:", "mongodb:"]),
            (DatabaseKind::Redis, &["redis:", "redis/"]),
        ];
        for (kind, patterns) in TABLE {
            if patterns.iter().any(|p| lower.contains(p)) {
                return Some(*kind);
            }
        }
        None
    }
}

/// Immutable-after-discovery record of one running (or, briefly, stopped)
/// container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
    /// Ordered to match the container's declared `Env` array; order is
    /// preserved for faithful `docker run` replay.
    pub environment: Vec<(String, String)>,
    pub volumes: Vec<String>,
    pub compose_file: Option<PathBuf>,
    /// Opaque `docker inspect` payload, retained verbatim for recipe
    /// capture and recipe replay; redaction happens at capture time, never
    /// by mutating this field.
    pub inspect_data: JsonValue,
    pub database_type: Option<DatabaseKind>,
}

impl ContainerInfo {
    /// The compose project this container belongs to, if any.
    pub fn stack_name(&self) -> Option<&str> {
        self.labels
            .get(crate::constants::DOCKER_COMPOSE_PROJECT_LABEL)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Immutable-after-discovery record of one Docker volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub mountpoint: PathBuf,
    pub labels: BTreeMap<String, String>,
    /// Best-effort size estimate; `None` when `du` failed or timed out.
    pub size_bytes: Option<u64>,
    pub container_ids: Vec<String>,
}

/// The kind of grouping a [`BackupUnit`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Stack,
    Standalone,
}

/// The smallest grouping that is cold-backed-up atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupUnit {
    pub name: String,
    pub kind: UnitKind,
    /// Start order == discovery order, per §4.1.
    pub containers: Vec<ContainerInfo>,
    /// Deduplicated by name.
    pub volumes: Vec<VolumeInfo>,
    pub compose_file: Option<PathBuf>,
}

impl BackupUnit {
    pub fn has_databases(&self) -> bool {
        self.containers.iter().any(|c| c.database_type.is_some())
    }
}

/// A single recorded error or warning attached to a backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub stage: String,
    pub message: String,
}

/// Persisted result of one orchestrator run for one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub unit_name: String,
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub snapshot_ids: Vec<String>,
    pub volumes_backed_up: u32,
    pub databases_backed_up: u32,
    pub errors: Vec<RunEvent>,
    pub warnings: Vec<RunEvent>,
    pub success: bool,
}

impl BackupMetadata {
    /// Filename under the metadata directory:
    /// `<sanitized_unit>_<YYYYMMDD_HHMMSS>.json`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            sanitize_for_filename(&self.unit_name),
            self.started_at.format("%Y%m%d_%H%M%S")
        )
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`, matching
/// `original_source`'s metadata-filename sanitizer exactly.
pub fn sanitize_for_filename(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sub = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    out
}

/// Persisted result of one restore run for one unit, the restore-side
/// counterpart of [`BackupMetadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMetadata {
    pub unit_name: String,
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub volumes_restored: u32,
    pub databases_restored: u32,
    pub errors: Vec<RunEvent>,
    pub warnings: Vec<RunEvent>,
    pub success: bool,
}

/// Kind of artifact a snapshot represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Recipe,
    Volume,
    Database,
}

/// One snapshot as reported by the repository façade's `listSnapshots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub path: String,
    pub timestamp: String,
    pub tags: BTreeMap<String, String>,
    pub size_bytes: u64,
}

/// A restore point derived by grouping snapshots that share
/// `(unit, backup_id)` tags, partitioned by artifact kind.
#[derive(Debug, Clone)]
pub struct RestorePoint {
    pub unit: String,
    pub backup_id: String,
    pub timestamp: String,
    pub recipe: Option<Snapshot>,
    pub volumes: Vec<Snapshot>,
    pub databases: Vec<Snapshot>,
}

impl RestorePoint {
    /// Group a flat snapshot list into restore points keyed by
    /// `(unit, backup_id)`. Snapshots lacking either tag are ignored.
    pub fn group(snapshots: Vec<Snapshot>) -> Vec<RestorePoint> {
        let mut points: BTreeMap<(String, String), RestorePoint> = BTreeMap::new();
        for snap in snapshots {
            let unit = match snap.tags.get("unit") {
                Some(u) => u.clone(),
                None => continue,
            };
            let backup_id = match snap.tags.get("backup_id") {
                Some(b) => b.clone(),
                None => continue,
            };
            let key = (unit.clone(), backup_id.clone());
            let entry = points.entry(key).or_insert_with(|| RestorePoint {
                unit: unit.clone(),
                backup_id: backup_id.clone(),
                timestamp: snap.tags.get("timestamp").cloned().unwrap_or_default(),
                recipe: None,
                volumes: Vec::new(),
                databases: Vec::new(),
            });
            match snap.tags.get("type").map(|s| s.as_str()) {
                Some("recipe") => entry.recipe = Some(snap),
                Some("volume") => entry.volumes.push(snap),
                Some("database") => entry.databases.push(snap),
                _ => {}
            }
        }
        points.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_database_kind_by_image_substring() {
        assert_eq!(DatabaseKind::detect("postgres:14"), Some(DatabaseKind::Postgres));
        assert_eq!(DatabaseKind::detect("library/mariadb:10.6"), Some(DatabaseKind::MariaDb));
        assert_eq!(DatabaseKind::detect("mysql:8.0"), Some(DatabaseKind::Mysql));
        assert_eq!(DatabaseKind::detect("redis:7-alpine"), Some(DatabaseKind::Redis));
        assert_eq!(DatabaseKind::detect("nginx:1.25"), None);
    }

    #[test]
    fn sanitizes_unit_names_for_filenames() {
        assert_eq!(sanitize_for_filename("my app!!"), "my_app_");
        assert_eq!(sanitize_for_filename("web"), "web");
        assert_eq!(sanitize_for_filename("blog-stack_1.0"), "blog-stack_1.0");
    }

    #[test]
    fn groups_snapshots_into_restore_points() {
        let mut tags_a = BTreeMap::new();
        tags_a.insert("unit".to_string(), "web".to_string());
        tags_a.insert("backup_id".to_string(), "B1".to_string());
        tags_a.insert("type".to_string(), "recipe".to_string());
        tags_a.insert("timestamp".to_string(), "2026-01-01T00:00:00Z".to_string());

        let mut tags_b = tags_a.clone();
        tags_b.insert("type".to_string(), "volume".to_string());

        let snaps = vec![
            Snapshot { id: "a".into(), path: "recipes/web".into(), timestamp: "".into(), tags: tags_a, size_bytes: 0 },
            Snapshot { id: "b".into(), path: "volumes/web/data".into(), timestamp: "".into(), tags: tags_b, size_bytes: 0 },
        ];
        let points = RestorePoint::group(snaps);
        assert_eq!(points.len(), 1);
        assert!(points[0].recipe.is_some());
        assert_eq!(points[0].volumes.len(), 1);
    }
}
