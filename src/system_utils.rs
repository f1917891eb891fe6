//! System/environment probes (§9 ambient additions): runtime availability
//! checks, optimal worker-count derivation, and privilege checks. Grounded
//! in `SystemUtils`.

use std::path::Path;

use tracing::debug;

use crate::constants::RAM_WORKER_THRESHOLDS;
use crate::process_runner::{CommandSpec, ProcessRunner};

/// True iff the current process is running as root (euid 0).
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Total system RAM in gibibytes, read from `/proc/meminfo`'s `MemTotal`
/// line (kB). Returns `None` on non-Linux or if the file is unreadable.
pub fn available_ram_gb() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = contents.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0 / 1024.0)
}

/// Number of logical CPUs available, clamping worker counts so small
/// machines never oversubscribe.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// RAM-tiered worker count, clamped to the CPU core count, per the
/// `RAM_WORKER_THRESHOLDS` table in `constants`.
pub fn get_optimal_workers() -> usize {
    let ram_gb = available_ram_gb().unwrap_or(2.0);
    let from_ram = RAM_WORKER_THRESHOLDS
        .iter()
        .find(|(threshold, _)| ram_gb <= *threshold)
        .map(|(_, workers)| *workers)
        .unwrap_or(1);
    from_ram.min(cpu_count()).max(1)
}

/// Ensure `path` exists as a directory, creating parents as needed.
pub fn ensure_directory(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Available disk space at `path` in gibibytes, via `statvfs`. Walks up
/// to the nearest existing ancestor first, matching callers that probe a
/// not-yet-created backup or repository directory's parent.
pub fn available_disk_space_gb(path: &Path) -> Option<f64> {
    let mut probe = path;
    while !probe.exists() {
        probe = probe.parent()?;
    }
    let c_path = std::ffi::CString::new(probe.to_str()?.as_bytes()).ok()?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return None;
        }
        let bytes = stat.f_bavail as f64 * stat.f_frsize as f64;
        Some(bytes / 1024.0 / 1024.0 / 1024.0)
    }
}

/// Probe engine/tool availability: `docker`, the snapshot engine binary,
/// and `tar`, all via `which` rather than version probes (cheap, no
/// subprocess spawn beyond a `$PATH` scan).
pub async fn check_docker(runner: &dyn ProcessRunner) -> bool {
    runner.which("docker").await
}

pub async fn check_kopia(runner: &dyn ProcessRunner) -> bool {
    runner.which("kopia").await
}

pub async fn check_tar(runner: &dyn ProcessRunner) -> bool {
    runner.which("tar").await
}

/// Parse `docker version --format '{{.Server.Version}}'`.
pub async fn get_docker_version(runner: &dyn ProcessRunner) -> Option<String> {
    let out = runner
        .run(CommandSpec::new(
            "docker",
            vec!["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()],
        ))
        .await
        .ok()?;
    out.success().then(|| out.stdout_str().trim().to_string())
}

/// Parse the `VERSION:` line out of `kopia version`'s output (e.g.
/// `"kopia 0.17.0 build: ..."`  contains a `VERSION:` prefixed line in
/// some builds; fall back to the first whitespace-separated token that
/// looks like a version number).
pub async fn get_kopia_version(runner: &dyn ProcessRunner) -> Option<String> {
    let out = runner.run(CommandSpec::new("kopia", vec!["version".to_string()])).await.ok()?;
    if !out.success() {
        return None;
    }
    let text = out.stdout_str();
    if let Some(line) = text.lines().find(|l| l.to_uppercase().starts_with("VERSION:")) {
        return line.split_once(':').map(|(_, v)| v.trim().to_string());
    }
    text.split_whitespace()
        .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(|s| s.to_string())
}

/// Best-effort directory size via `du -sb`, used for pre-backup size
/// estimation shown in progress output.
pub async fn estimate_backup_size(runner: &dyn ProcessRunner, path: &Path) -> Option<u64> {
    let out = runner
        .run(CommandSpec::new("du", vec!["-sb".to_string(), path.display().to_string()]))
        .await
        .ok()?;
    if !out.success() {
        debug!(path = %path.display(), "du failed while estimating backup size");
        return None;
    }
    out.stdout_str().split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_never_exceeds_cpu_count() {
        let workers = get_optimal_workers();
        assert!(workers <= cpu_count());
        assert!(workers >= 1);
    }
}
