//! Long-lived service loop (§6): acquire the process-exclusion lock,
//! notify systemd, then either run a single backup pass or loop on a
//! single-process "once a day at HH:MM" schedule, delegating each pass to
//! [`BackupOrchestrator`]. Grounded in `ServiceManager` from the original
//! implementation's `service.py`.
//!
//! Durable scheduling (cron-like expressions, multi-host coordination) is
//! out of scope; operators who need more than a daily trigger run the
//! one-shot mode from a host timer instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, TimeZone};
use tracing::{error, info, warn};

use crate::backend_uri::Backend;
use crate::backup::{BackupOrchestrator, BackupRunSettings};
use crate::config::Settings;
use crate::constants::{
    CONTAINER_START_TIMEOUT, CONTAINER_STOP_TIMEOUT, BACKUP_OPERATION_TIMEOUT, SCHEDULE_WAIT_CHUNK,
};
use crate::discovery::DockerDiscovery;
use crate::error::Result;
use crate::hooks::HooksManager;
use crate::lock::ProcessLock;
use crate::notify::Notifier;
use crate::policy::Retention;
use crate::process_runner::ProcessRunner;
use crate::repository::Repository;
use crate::safe_exit::{CleanupStack, SignalListener, SubprocessRegistry};
use crate::types::BackupMetadata;
use crate::worker_pool::WorkerPool;

/// Wires one orchestrator run from resolved [`Settings`]. Shared by the
/// daemon loop, the one-shot path, and the CLI binary's `backup`/`dry-run`
/// subcommands so all three build the exact same pipeline.
///
/// `cleanup_runner` must be an `Arc` wrapping the same underlying process
/// boundary as `runner`, so that SafeExit handlers registered via `cleanup`
/// act on the real process boundary even if they run after this
/// orchestrator's own borrow has gone out of scope.
pub fn build_orchestrator<'a>(
    runner: &'a dyn ProcessRunner,
    cleanup_runner: Arc<dyn ProcessRunner>,
    settings: &Settings,
    registry: SubprocessRegistry,
    cleanup: CleanupStack,
) -> Result<BackupOrchestrator<'a>> {
    let backend = Backend::parse(&settings.kopia.repository_path)?;
    let cache_dir = PathBuf::from(shellexpand_home(&settings.kopia.cache_directory));
    let repo = Repository::new(
        runner,
        backend,
        settings.resolved_password(),
        settings.kopia.profile.clone(),
        Some(cache_dir.clone()),
    );
    let hooks = HooksManager::new(runner, settings.hooks.to_hook_paths());
    let pool = WorkerPool::new(settings.resolved_parallel_workers(), registry);
    let run_settings = BackupRunSettings {
        stop_timeout: CONTAINER_STOP_TIMEOUT,
        start_timeout: CONTAINER_START_TIMEOUT,
        task_timeout: BACKUP_OPERATION_TIMEOUT,
        exclude_patterns: settings.backup.exclude_patterns.clone(),
        database_backup: settings.backup.database_backup,
        retention: Retention::default(),
        cache_dir,
    };
    Ok(BackupOrchestrator::new(runner, repo, hooks, pool, run_settings, cleanup, cleanup_runner))
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

/// Discover every backup unit and run a cold backup of each in turn,
/// matching `run_scheduled_backup`'s sequential-loop-over-units shape
/// (parallelism lives *inside* each unit's own orchestrator run, not
/// across units). Checked for a pending stop signal between units, so an
/// interrupt mid-pass does not run every remaining unit to completion
/// before the caller's own loop notices.
async fn run_backup_pass(runner: Arc<dyn ProcessRunner>, settings: &Settings, cleanup: CleanupStack, signals: &SignalListener) -> Vec<BackupMetadata> {
    let discovery = DockerDiscovery::new(runner.as_ref());
    let units = match discovery.discover().await {
        Ok(units) => units,
        Err(e) => {
            error!(error = %e, "discovery failed, skipping this backup pass");
            return Vec::new();
        }
    };
    info!(count = units.len(), "starting scheduled backup");

    let registry = SubprocessRegistry::new();
    let orchestrator = match build_orchestrator(runner.as_ref(), runner.clone(), settings, registry, cleanup) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "failed to build backup orchestrator");
            return Vec::new();
        }
    };

    let mut results = Vec::with_capacity(units.len());
    let mut success_count = 0usize;
    for unit in &units {
        if signals.is_stopping() {
            warn!(remaining = units.len() - results.len(), "stop signal received, skipping remaining units in this pass");
            break;
        }
        let metadata = orchestrator.backup_unit(unit).await;
        if metadata.success {
            success_count += 1;
            info!(unit = %unit.name, "backup succeeded");
        } else {
            warn!(unit = %unit.name, "backup failed");
        }
        results.push(metadata);
    }
    info!(success_count, total = units.len(), "scheduled backup complete");
    results
}

/// Run one backup pass under the process-exclusion lock and exit,
/// matching `run_oneshot`'s `with self.lock:` block. Intended to be
/// invoked by a host timer (systemd `OnCalendar`, cron) rather than left
/// running. Installs its own signal listener so a single `docker start`
/// wired into [`crate::backup::ServiceContinuityHandler`] still happens
/// if the one-shot invocation itself is interrupted.
pub async fn run_oneshot(runner: Arc<dyn ProcessRunner>, settings: &Settings, lock_path: PathBuf) -> Result<Vec<BackupMetadata>> {
    let _lock = ProcessLock::acquire(lock_path)?;
    info!("running one-shot backup");
    let registry = SubprocessRegistry::new();
    let cleanup = CleanupStack::new();
    let signals = SignalListener::install(registry, cleanup.clone());
    let results = run_backup_pass(runner, settings, cleanup, &signals).await;
    info!("one-shot backup complete");
    Ok(results)
}

/// Run the daemon loop: acquire the lock first (before any other side
/// effect), notify systemd `READY`, then either idle forever (schedule
/// disabled, matching `run_daemon`'s "keep running for manual triggers"
/// branch) or wait for the next `daily_at` occurrence and run a backup
/// pass each time, until a stop signal arrives.
pub async fn run_daemon(runner: Arc<dyn ProcessRunner>, settings: &Settings, lock_path: PathBuf) -> Result<()> {
    let lock = ProcessLock::acquire(lock_path)?;
    info!("kopi-docka daemon starting");

    let notifier = Notifier::from_env();
    let registry = SubprocessRegistry::new();
    let cleanup = CleanupStack::new();
    let signals = SignalListener::install(registry, cleanup.clone());

    notifier.ready_with_status("waiting for scheduled backup");

    if !settings.schedule.enabled {
        warn!("scheduled backups are disabled in configuration, idling for manual triggers");
        while !signals.is_stopping() {
            tokio::time::sleep(SCHEDULE_WAIT_CHUNK).await;
        }
        notifier.stopping();
        drop(lock);
        info!("kopi-docka daemon stopped");
        return Ok(());
    }

    let (hour, minute) = settings.schedule.daily_at_parts();

    while !signals.is_stopping() {
        let wait = match next_run_wait(hour, minute) {
            Some(d) => d,
            None => {
                warn!("could not compute next scheduled run, retrying in one chunk");
                SCHEDULE_WAIT_CHUNK
            }
        };
        info!(wait_secs = wait.as_secs(), hour, minute, "next backup scheduled");

        let mut waited = Duration::ZERO;
        while waited < wait && !signals.is_stopping() {
            let chunk = SCHEDULE_WAIT_CHUNK.min(wait - waited);
            tokio::time::sleep(chunk).await;
            waited += chunk;
        }

        if signals.is_stopping() {
            break;
        }

        notifier.busy("running scheduled backup");
        let results = run_backup_pass(runner.clone(), settings, cleanup.clone(), &signals).await;
        let failures = results.iter().filter(|m| !m.success).count();
        if failures == 0 {
            notifier.ready_with_status(&format!("last backup: {} units", results.len()));
        } else {
            notifier.ready_with_status(&format!("last backup had {failures} failure(s)"));
        }
    }

    notifier.stopping();
    drop(lock);
    info!("kopi-docka daemon stopped");
    Ok(())
}

/// Seconds until the next `hour:minute` occurrence, rolling to tomorrow if
/// that time has already passed today. Mirrors `run_daemon`'s
/// `next_run <= now: next_run += timedelta(days=1)` arithmetic.
fn next_run_wait(hour: u32, minute: u32) -> Option<Duration> {
    let now = Local::now();
    let today_candidate = Local
        .with_ymd_and_hms(now.year(), now.month(), now.day(), hour, minute, 0)
        .single()?;

    let next_run = if today_candidate <= now {
        today_candidate + chrono::Duration::days(1)
    } else {
        today_candidate
    };

    (next_run - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_a_positive_wait_for_a_future_time_today_or_tomorrow() {
        let wait = next_run_wait(23, 59).expect("should resolve a wait");
        assert!(wait.as_secs() > 0);
        assert!(wait.as_secs() <= 24 * 3600);
    }

    #[test]
    fn rejects_an_impossible_time_gracefully() {
        // Hour 24 never forms a valid local datetime; callers are expected
        // to have validated `daily_at` via `ScheduleSettings::daily_at_parts`
        // first, which never returns an out-of-range pair, but the
        // computation itself must still degrade to `None` rather than panic.
        assert!(Local.with_ymd_and_hms(2026, 1, 1, 24, 0, 0).single().is_none());
    }
}
