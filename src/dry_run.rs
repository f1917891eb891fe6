//! Plan-only traversal of the backup orchestrator (§2 "Dry-run reporter"):
//! collects the same discovery and system-probe information a real backup
//! pass would use, and renders what would happen, without stopping a
//! single container or writing a single snapshot. Grounded in
//! `DryRunReport` from the original implementation's `dry-run.py`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Settings;
use crate::humanize::{format_bytes, format_duration};
use crate::process_runner::ProcessRunner;
use crate::system_utils;
use crate::types::{BackupUnit, UnitKind};

const BASE_UNIT_OVERHEAD: Duration = Duration::from_secs(30);
const PER_CONTAINER_OVERHEAD: Duration = Duration::from_secs(5);
const PER_DATABASE_OVERHEAD: Duration = Duration::from_secs(60);
/// Assumed sustained throughput used to estimate volume transfer time.
const ASSUMED_THROUGHPUT_BYTES_PER_SEC: f64 = 100.0 * 1024.0 * 1024.0;
/// Rough compression ratio used to estimate repository space required.
const ASSUMED_COMPRESSION_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct DependencyCheck {
    pub docker: bool,
    pub kopia: bool,
    pub tar: bool,
    pub docker_version: Option<String>,
    pub kopia_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub available_ram_gb: Option<f64>,
    pub cpu_cores: usize,
    pub parallel_workers: usize,
    pub backup_base_path: String,
    pub repository_path: String,
    pub available_repository_disk_gb: Option<f64>,
    pub dependencies: DependencyCheck,
}

#[derive(Debug, Clone)]
pub struct UnitAnalysis {
    pub unit_name: String,
    pub kind: UnitKind,
    pub container_count: usize,
    pub running_container_count: usize,
    pub volume_count: usize,
    pub total_volume_size_bytes: u64,
    pub database_count: usize,
    pub compose_file: Option<PathBuf>,
    pub estimated_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RecoveryBundleOutlook {
    pub would_update: bool,
    pub output_dir: PathBuf,
    pub retention: usize,
    pub existing_bundle_count: usize,
    pub oldest_name: Option<String>,
    pub newest_name: Option<String>,
    pub existing_total_bytes: u64,
    pub would_rotate: usize,
}

#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub generated_at: DateTime<Utc>,
    pub config_file: PathBuf,
    pub system: SystemSnapshot,
    pub units: Vec<UnitAnalysis>,
    pub estimated_total_duration: Duration,
    pub estimated_data_size_bytes: u64,
    pub estimated_repository_space_bytes: u64,
    pub insufficient_disk_space: bool,
    pub recovery_bundle: RecoveryBundleOutlook,
}

/// Builds a [`DryRunReport`] from already-discovered units and resolved
/// settings; performs read-only probes only (dependency checks, disk
/// space, directory listing), matching the "no side effects" contract.
pub struct DryRunReporter<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> DryRunReporter<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        DryRunReporter { runner }
    }

    pub async fn generate(
        &self,
        settings: &Settings,
        config_file: &Path,
        units: &[BackupUnit],
        update_recovery_bundle: Option<bool>,
    ) -> DryRunReport {
        let system = self.probe_system(settings).await;
        let unit_analyses: Vec<UnitAnalysis> = units.iter().map(analyze_unit).collect();

        let estimated_total_duration = unit_analyses
            .iter()
            .fold(Duration::ZERO, |acc, u| acc + u.estimated_duration);
        let estimated_data_size_bytes: u64 = unit_analyses.iter().map(|u| u.total_volume_size_bytes).sum();
        let estimated_repository_space_bytes =
            (estimated_data_size_bytes as f64 * ASSUMED_COMPRESSION_RATIO) as u64;
        let insufficient_disk_space = system
            .available_repository_disk_gb
            .map(|gb| gb * 1024.0 * 1024.0 * 1024.0 < estimated_repository_space_bytes as f64)
            .unwrap_or(false);

        let would_update = update_recovery_bundle.unwrap_or(settings.backup.update_recovery_bundle);
        let recovery_bundle = self.probe_recovery_bundle(settings, would_update);

        DryRunReport {
            generated_at: Utc::now(),
            config_file: config_file.to_path_buf(),
            system,
            units: unit_analyses,
            estimated_total_duration,
            estimated_data_size_bytes,
            estimated_repository_space_bytes,
            insufficient_disk_space,
            recovery_bundle,
        }
    }

    async fn probe_system(&self, settings: &Settings) -> SystemSnapshot {
        let repo_parent = Path::new(&settings.kopia.repository_path)
            .parent()
            .unwrap_or_else(|| Path::new("/"));

        SystemSnapshot {
            available_ram_gb: system_utils::available_ram_gb(),
            cpu_cores: system_utils::cpu_count(),
            parallel_workers: settings.resolved_parallel_workers(),
            backup_base_path: settings.backup.base_path.clone(),
            repository_path: settings.kopia.repository_path.clone(),
            available_repository_disk_gb: system_utils::available_disk_space_gb(repo_parent),
            dependencies: DependencyCheck {
                docker: system_utils::check_docker(self.runner).await,
                kopia: system_utils::check_kopia(self.runner).await,
                tar: system_utils::check_tar(self.runner).await,
                docker_version: system_utils::get_docker_version(self.runner).await,
                kopia_version: system_utils::get_kopia_version(self.runner).await,
            },
        }
    }

    fn probe_recovery_bundle(&self, settings: &Settings, would_update: bool) -> RecoveryBundleOutlook {
        let output_dir = PathBuf::from(&settings.backup.recovery_bundle_path);
        let retention = settings.backup.recovery_bundle_retention;

        if !would_update || !output_dir.exists() {
            return RecoveryBundleOutlook {
                would_update,
                output_dir,
                retention,
                existing_bundle_count: 0,
                oldest_name: None,
                newest_name: None,
                existing_total_bytes: 0,
                would_rotate: 0,
            };
        }

        let mut bundles: Vec<(String, u64)> = std::fs::read_dir(&output_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let name = e.file_name().to_string_lossy().into_owned();
                        if name.starts_with("kopi-docka-recovery-") && (name.ends_with(".tar.gz.enc") || name.ends_with(".zip")) {
                            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
                            Some((name, size))
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        bundles.sort_by(|a, b| a.0.cmp(&b.0));

        let existing_total_bytes = bundles.iter().map(|(_, size)| size).sum();
        let would_rotate = if bundles.len() >= retention { bundles.len() - retention + 1 } else { 0 };

        RecoveryBundleOutlook {
            would_update,
            output_dir,
            retention,
            existing_bundle_count: bundles.len(),
            oldest_name: bundles.first().map(|(n, _)| n.clone()),
            newest_name: bundles.last().map(|(n, _)| n.clone()),
            existing_total_bytes,
            would_rotate,
        }
    }
}

fn analyze_unit(unit: &BackupUnit) -> UnitAnalysis {
    let running_container_count = unit.containers.iter().filter(|c| c.is_running()).count();
    let total_volume_size_bytes: u64 = unit.volumes.iter().filter_map(|v| v.size_bytes).sum();
    let database_count = unit.containers.iter().filter(|c| c.database_type.is_some()).count();

    let volume_time = Duration::from_secs_f64(total_volume_size_bytes as f64 / ASSUMED_THROUGHPUT_BYTES_PER_SEC);
    let estimated_duration = BASE_UNIT_OVERHEAD
        + PER_CONTAINER_OVERHEAD * unit.containers.len() as u32
        + volume_time
        + PER_DATABASE_OVERHEAD * database_count as u32;

    UnitAnalysis {
        unit_name: unit.name.clone(),
        kind: unit.kind,
        container_count: unit.containers.len(),
        running_container_count,
        volume_count: unit.volumes.len(),
        total_volume_size_bytes,
        database_count,
        compose_file: unit.compose_file.clone(),
        estimated_duration,
    }
}

impl DryRunReport {
    /// Render the report as the fixed-width text block a CLI would print
    /// verbatim, mirroring the original's section ordering (system info,
    /// units summary, per-unit detail, estimates, config review, recovery
    /// bundle outlook).
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(70);

        out.push_str(&format!("\n{rule}\nKOPI-DOCKA DRY RUN REPORT\n{rule}\n"));
        out.push_str(&format!("\nSimulation Time: {}\n", self.generated_at.format("%Y-%m-%d %H:%M:%S")));
        out.push_str(&format!("Configuration File: {}\n", self.config_file.display()));

        self.render_system_info(&mut out);
        self.render_units_summary(&mut out);
        for unit in &self.units {
            render_unit_detail(&mut out, unit);
        }
        self.render_estimates(&mut out);
        self.render_recovery_bundle(&mut out);

        out.push_str(&format!("\n{rule}\nEND OF DRY RUN REPORT\n{rule}\n"));
        out.push_str("\nNo changes were made. Run without --dry-run to perform an actual backup.\n");
        out
    }

    fn render_system_info(&self, out: &mut String) {
        out.push_str("\n### SYSTEM INFORMATION ###\n");
        match self.system.available_ram_gb {
            Some(gb) => out.push_str(&format!("Available RAM: {gb:.2} GB\n")),
            None => out.push_str("Available RAM: unknown\n"),
        }
        out.push_str(&format!("CPU Cores: {}\n", self.system.cpu_cores));
        out.push_str(&format!("Parallel Workers: {}\n", self.system.parallel_workers));
        out.push_str(&format!("Backup Path: {}\n", self.system.backup_base_path));
        out.push_str(&format!("Repository Path: {}\n", self.system.repository_path));
        match self.system.available_repository_disk_gb {
            Some(gb) => out.push_str(&format!("Available Disk Space: {gb:.2} GB\n")),
            None => out.push_str("Available Disk Space: unknown\n"),
        }

        out.push_str("\n### DEPENDENCY CHECK ###\n");
        let deps = &self.system.dependencies;
        out.push_str(&format!("Docker: {}\n", if deps.docker { "available" } else { "missing" }));
        out.push_str(&format!("Kopia: {}\n", if deps.kopia { "available" } else { "missing" }));
        out.push_str(&format!("Tar: {}\n", if deps.tar { "available" } else { "missing" }));
        if let Some(v) = &deps.docker_version {
            out.push_str(&format!("Docker Version: {v}\n"));
        }
        if let Some(v) = &deps.kopia_version {
            out.push_str(&format!("Kopia Version: {v}\n"));
        }
    }

    fn render_units_summary(&self, out: &mut String) {
        out.push_str("\n### BACKUP UNITS SUMMARY ###\n");
        out.push_str(&format!("Total Units: {}\n", self.units.len()));
        let stacks = self.units.iter().filter(|u| u.kind == UnitKind::Stack).count();
        let standalone = self.units.len() - stacks;
        out.push_str(&format!("  - Stacks: {stacks}\n"));
        out.push_str(&format!("  - Standalone Containers: {standalone}\n"));
        let total_containers: usize = self.units.iter().map(|u| u.container_count).sum();
        let total_volumes: usize = self.units.iter().map(|u| u.volume_count).sum();
        out.push_str(&format!("Total Containers: {total_containers}\n"));
        out.push_str(&format!("Total Volumes: {total_volumes}\n"));
        let db_containers: usize = self.units.iter().map(|u| u.database_count).sum();
        if db_containers > 0 {
            out.push_str(&format!("Database Containers: {db_containers}\n"));
        }
    }

    fn render_estimates(&self, out: &mut String) {
        out.push_str("\n### TIME AND RESOURCE ESTIMATES ###\n");
        if self.estimated_data_size_bytes > 0 {
            out.push_str(&format!("Estimated Data Size: {}\n", format_bytes(self.estimated_data_size_bytes)));
        }
        out.push_str(&format!("Estimated Total Time: {}\n", format_duration(self.estimated_total_duration)));
        out.push_str("Estimated Downtime per Unit: ~30-60 seconds\n");
        if self.estimated_repository_space_bytes > 0 {
            out.push_str(&format!(
                "Estimated Repository Space Required: {}\n",
                format_bytes(self.estimated_repository_space_bytes)
            ));
        }
        if self.insufficient_disk_space {
            out.push_str("WARNING: insufficient disk space for this backup\n");
        }
    }

    fn render_recovery_bundle(&self, out: &mut String) {
        out.push_str("\n### DISASTER RECOVERY ###\n");
        let bundle = &self.recovery_bundle;
        if !bundle.would_update {
            out.push_str("Recovery Bundle: will not be updated\n");
            out.push_str("  To enable: set backup.update_recovery_bundle = true\n");
            return;
        }

        out.push_str("Recovery Bundle: will be updated\n");
        out.push_str(&format!("  Location: {}\n", bundle.output_dir.display()));
        out.push_str(&format!("  Retention: keep last {} bundle(s)\n", bundle.retention));

        if !bundle.output_dir.exists() {
            out.push_str("  Bundle directory does not exist yet; will be created during backup\n");
            return;
        }

        out.push_str(&format!("  Existing Bundles: {}\n", bundle.existing_bundle_count));
        if let (Some(oldest), Some(newest)) = (&bundle.oldest_name, &bundle.newest_name) {
            out.push_str(&format!("    Oldest: {oldest}\n"));
            out.push_str(&format!("    Newest: {newest}\n"));
            out.push_str(&format!("    Total Size: {}\n", format_bytes(bundle.existing_total_bytes)));
        }
        if bundle.would_rotate > 0 {
            out.push_str(&format!("  Rotation: {} old bundle(s) will be removed\n", bundle.would_rotate));
        }
    }
}

fn render_unit_detail(out: &mut String, unit: &UnitAnalysis) {
    out.push_str(&format!("\n### UNIT: {} ###\n", unit.unit_name));
    out.push_str(&format!("Type: {:?}\n", unit.kind));
    out.push_str(&format!("Containers: {}\n", unit.container_count));
    if let Some(compose) = &unit.compose_file {
        out.push_str(&format!("Compose File: {}\n", compose.display()));
    }
    if unit.volume_count > 0 {
        out.push_str(&format!("Volumes: {}\n", unit.volume_count));
        if unit.total_volume_size_bytes > 0 {
            out.push_str(&format!("Total Volume Size: {}\n", format_bytes(unit.total_volume_size_bytes)));
        }
    }
    out.push_str("Operations:\n");
    out.push_str(&format!("  1. Stop {} container(s)\n", unit.running_container_count));
    out.push_str("  2. Backup recipes (compose + inspect data)\n");
    out.push_str(&format!("  3. Backup {} volume(s)\n", unit.volume_count));
    if unit.database_count > 0 {
        out.push_str(&format!("  4. Backup {} database(s)\n", unit.database_count));
    }
    out.push_str(&format!("  5. Start {} container(s)\n", unit.running_container_count));
    out.push_str(&format!("Estimated duration: {}\n", format_duration(unit.estimated_duration)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerInfo, DatabaseKind, VolumeInfo};
    use std::collections::BTreeMap;

    fn sample_unit() -> BackupUnit {
        BackupUnit {
            name: "web".to_string(),
            kind: UnitKind::Stack,
            containers: vec![
                ContainerInfo {
                    id: "c1".into(),
                    name: "web_app_1".into(),
                    image: "nginx:1.25".into(),
                    status: "running".into(),
                    labels: BTreeMap::new(),
                    environment: Vec::new(),
                    volumes: vec!["web_data".into()],
                    compose_file: None,
                    inspect_data: serde_json::json!({}),
                    database_type: None,
                },
                ContainerInfo {
                    id: "c2".into(),
                    name: "web_db_1".into(),
                    image: "postgres:14".into(),
                    status: "running".into(),
                    labels: BTreeMap::new(),
                    environment: Vec::new(),
                    volumes: vec!["web_pgdata".into()],
                    compose_file: None,
                    inspect_data: serde_json::json!({}),
                    database_type: Some(DatabaseKind::Postgres),
                },
            ],
            volumes: vec![VolumeInfo {
                name: "web_data".into(),
                driver: "local".into(),
                mountpoint: PathBuf::from("/var/lib/docker/volumes/web_data/_data"),
                labels: BTreeMap::new(),
                size_bytes: Some(1024 * 1024 * 1024),
                container_ids: vec!["c1".into()],
            }],
            compose_file: Some(PathBuf::from("/srv/web/docker-compose.yml")),
        }
    }

    #[test]
    fn analyzes_a_unit_with_a_database_and_a_volume() {
        let unit = sample_unit();
        let analysis = analyze_unit(&unit);
        assert_eq!(analysis.container_count, 2);
        assert_eq!(analysis.database_count, 1);
        assert_eq!(analysis.total_volume_size_bytes, 1024 * 1024 * 1024);
        assert!(analysis.estimated_duration >= BASE_UNIT_OVERHEAD);
    }

    #[test]
    fn renders_a_report_without_panicking_on_empty_input() {
        let report = DryRunReport {
            generated_at: Utc::now(),
            config_file: PathBuf::from("/etc/kopi-docka.toml"),
            system: SystemSnapshot {
                available_ram_gb: None,
                cpu_cores: 4,
                parallel_workers: 2,
                backup_base_path: "/backup".into(),
                repository_path: "/backup/repo".into(),
                available_repository_disk_gb: None,
                dependencies: DependencyCheck { docker: true, kopia: true, tar: true, docker_version: None, kopia_version: None },
            },
            units: Vec::new(),
            estimated_total_duration: Duration::ZERO,
            estimated_data_size_bytes: 0,
            estimated_repository_space_bytes: 0,
            insufficient_disk_space: false,
            recovery_bundle: RecoveryBundleOutlook {
                would_update: false,
                output_dir: PathBuf::from("/backup/recovery"),
                retention: 3,
                existing_bundle_count: 0,
                oldest_name: None,
                newest_name: None,
                existing_total_bytes: 0,
                would_rotate: 0,
            },
        };
        let rendered = report.render();
        assert!(rendered.contains("KOPI-DOCKA DRY RUN REPORT"));
        assert!(rendered.contains("Total Units: 0"));
    }
}
