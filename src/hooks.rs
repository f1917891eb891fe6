//! Pre/post backup and restore hook execution (§4.6), a Rust-native
//! addition with no direct counterpart in the original implementation —
//! modeled on how the teacher wraps optional external collaborators
//! through [`ProcessRunner`] rather than calling `Command` ad hoc.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::HOOK_TIMEOUT;
use crate::process_runner::{CommandSpec, ProcessRunner};

/// Which lifecycle point a hook fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreBackup,
    PostBackup,
    PreRestore,
    PostRestore,
}

impl HookKind {
    fn env_value(&self) -> &'static str {
        match self {
            HookKind::PreBackup => "pre_backup",
            HookKind::PostBackup => "post_backup",
            HookKind::PreRestore => "pre_restore",
            HookKind::PostRestore => "post_restore",
        }
    }
}

/// Configured hook script paths, any of which may be absent.
#[derive(Debug, Clone, Default)]
pub struct HookPaths {
    pub pre_backup: Option<PathBuf>,
    pub post_backup: Option<PathBuf>,
    pub pre_restore: Option<PathBuf>,
    pub post_restore: Option<PathBuf>,
}

impl HookPaths {
    fn path_for(&self, kind: HookKind) -> Option<&Path> {
        match kind {
            HookKind::PreBackup => self.pre_backup.as_deref(),
            HookKind::PostBackup => self.post_backup.as_deref(),
            HookKind::PreRestore => self.pre_restore.as_deref(),
            HookKind::PostRestore => self.post_restore.as_deref(),
        }
    }
}

/// Resolves and runs hook scripts under the fixed environment contract.
pub struct HooksManager<'a> {
    runner: &'a dyn ProcessRunner,
    paths: HookPaths,
}

impl<'a> HooksManager<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, paths: HookPaths) -> Self {
        HooksManager { runner, paths }
    }

    /// Run the hook for `kind` scoped to `unit_name`. Returns `true` when no
    /// hook is configured, or when the hook exits zero; `false` on
    /// non-zero exit, timeout, a missing path, or a non-executable file.
    /// The orchestrator is responsible for treating `false` as fatal
    /// (pre-hooks) or as a recorded warning (post-hooks).
    pub async fn run(&self, kind: HookKind, unit_name: &str) -> bool {
        let Some(path) = self.paths.path_for(kind) else {
            return true;
        };

        if !path.exists() {
            warn!(path = %path.display(), "hook script not found");
            return false;
        }
        if !is_executable(path) {
            warn!(path = %path.display(), "hook script is not executable");
            return false;
        }

        let spec = CommandSpec::new(path.display().to_string(), Vec::new())
            .env("KOPI_DOCKA_HOOK_TYPE", kind.env_value())
            .env("KOPI_DOCKA_UNIT_NAME", unit_name)
            .timeout(HOOK_TIMEOUT);

        match self.runner.run(spec).await {
            Ok(out) if out.success() => {
                debug!(path = %path.display(), "hook completed successfully");
                true
            }
            Ok(out) => {
                warn!(path = %path.display(), stderr = %out.stderr_str(), "hook exited non-zero");
                false
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hook failed to run or timed out");
                false
            }
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_runner::{CommandOutput as Out, MockProcessRunner};

    #[tokio::test]
    async fn returns_true_when_no_hook_configured() {
        let mock = MockProcessRunner::new();
        let manager = HooksManager::new(&mock, HookPaths::default());
        assert!(manager.run(HookKind::PreBackup, "web").await);
    }

    #[tokio::test]
    async fn returns_false_for_missing_script() {
        let mock = MockProcessRunner::new();
        let paths = HookPaths { pre_backup: Some(PathBuf::from("/nonexistent/hook.sh")), ..Default::default() };
        let manager = HooksManager::new(&mock, paths);
        assert!(!manager.run(HookKind::PreBackup, "web").await);
    }

    #[tokio::test]
    async fn returns_true_on_zero_exit() {
        let mut mock = MockProcessRunner::new();
        mock.expect_run().returning(|_| Ok(Out { status: 0, stdout: vec![], stderr: vec![] }));

        let tmp = tempfile::NamedTempFile::new().unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let paths = HookPaths { pre_backup: Some(tmp.path().to_path_buf()), ..Default::default() };
        let manager = HooksManager::new(&mock, paths);
        assert!(manager.run(HookKind::PreBackup, "web").await);
    }

    #[tokio::test]
    async fn returns_false_on_nonzero_exit() {
        let mut mock = MockProcessRunner::new();
        mock.expect_run().returning(|_| Ok(Out { status: 1, stdout: vec![], stderr: b"bad".to_vec() }));

        let tmp = tempfile::NamedTempFile::new().unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let paths = HookPaths { post_backup: Some(tmp.path().to_path_buf()), ..Default::default() };
        let manager = HooksManager::new(&mock, paths);
        assert!(!manager.run(HookKind::PostBackup, "web").await);
    }
}
