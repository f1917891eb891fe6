//! Scenario 6: a manual backup holding the process-exclusion lock causes a
//! concurrent scheduled invocation to fail acquisition quietly, without
//! touching the repository.

mod support;

use std::sync::Arc;

use kopi_docka::config::{BackupSettings, KopiaSettings, Settings};
use kopi_docka::error::KopiError;
use kopi_docka::service;

use support::{ok, ScriptedRunner};

fn settings() -> Settings {
    Settings {
        kopia: KopiaSettings {
            repository_path: "/backup/repo".to_string(),
            password: "correct horse battery staple".to_string(),
            ..Default::default()
        },
        backup: BackupSettings { database_backup: false, ..Default::default() },
        ..Default::default()
    }
}

#[tokio::test]
async fn second_oneshot_run_fails_acquisition_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("kopi-docka.lock");
    let settings = settings();

    let runner = Arc::new(ScriptedRunner::new().on(|s| s.program == "docker" || s.program == "kopia", |_| ok(Vec::new())));

    let _held = kopi_docka::lock::ProcessLock::acquire(&lock_path).expect("first run acquires the lock");

    let result = service::run_oneshot(runner.clone(), &settings, lock_path.clone()).await;
    assert!(matches!(result, Err(KopiError::LockHeld)), "a concurrent run must fail acquisition, not run a backup pass");
    assert!(runner.calls().is_empty(), "a failed acquisition must never reach the process-execution boundary");
}

#[tokio::test]
async fn lock_is_reacquirable_once_the_holder_exits() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("kopi-docka.lock");

    {
        let _first = kopi_docka::lock::ProcessLock::acquire(&lock_path).unwrap();
    }
    let _second = kopi_docka::lock::ProcessLock::acquire(&lock_path).expect("lock must be reacquirable after release");
}
