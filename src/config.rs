//! Layered configuration (§6, §9 ambient additions).
//!
//! Settings load in three layers, each overriding the last: built-in
//! defaults, a TOML file (`/etc/kopi-docka.toml` when running as root,
//! `~/.config/kopi-docka/config.toml` otherwise, or an explicit path), and
//! environment variables prefixed `KOPI_DOCKA__` (double underscore as the
//! section separator, e.g. `KOPI_DOCKA__KOPIA__PASSWORD`). This replaces
//! the original `configparser`-based `Config` class; the `config` crate
//! plays the same "defaults then file then env" role the teacher's own
//! `config`+`toml` dependencies play for its service configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KopiError, Result};
use crate::system_utils::get_optimal_workers;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KopiaSettings {
    pub repository_path: String,
    pub password: String,
    pub profile: String,
    pub cache_directory: String,
}

impl Default for KopiaSettings {
    fn default() -> Self {
        KopiaSettings {
            repository_path: String::new(),
            password: String::new(),
            profile: "kopi-docka".to_string(),
            cache_directory: "~/.cache/kopia".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub base_path: String,
    /// `None` means "auto" (RAM/CPU-derived, see [`get_optimal_workers`]).
    pub parallel_workers: Option<usize>,
    pub database_backup: bool,
    pub exclude_patterns: Vec<String>,
    pub update_recovery_bundle: bool,
    pub recovery_bundle_path: String,
    pub recovery_bundle_retention: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        BackupSettings {
            base_path: "/backup/kopi-docka".to_string(),
            parallel_workers: None,
            database_backup: true,
            exclude_patterns: Vec::new(),
            update_recovery_bundle: false,
            recovery_bundle_path: "/backup/recovery".to_string(),
            recovery_bundle_retention: crate::constants::DEFAULT_DR_BUNDLE_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DockerSettings {
    pub socket: String,
}

/// Optional hook script paths, a Rust-native addition with no counterpart
/// in the original configuration (hooks themselves have no counterpart
/// there either, see [`crate::hooks`]).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HooksSettings {
    pub pre_backup: Option<String>,
    pub post_backup: Option<String>,
    pub pre_restore: Option<String>,
    pub post_restore: Option<String>,
}

impl HooksSettings {
    pub fn to_hook_paths(&self) -> crate::hooks::HookPaths {
        crate::hooks::HookPaths {
            pre_backup: self.pre_backup.as_ref().map(PathBuf::from),
            post_backup: self.post_backup.as_ref().map(PathBuf::from),
            pre_restore: self.pre_restore.as_ref().map(PathBuf::from),
            post_restore: self.post_restore.as_ref().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSettings {
    pub file: Option<String>,
    pub level: Option<String>,
}

/// The single-process scheduling loop the service binary is allowed to
/// run on its own; anything beyond "once a day at a fixed time" is
/// delegated to a host timer (systemd, cron) invoking the one-shot mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    /// `HH:MM`, 24-hour, local time.
    pub daily_at: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        ScheduleSettings { enabled: false, daily_at: "02:00".to_string() }
    }
}

impl ScheduleSettings {
    /// Parse `daily_at` into `(hour, minute)`. Falls back to `02:00` on a
    /// malformed value rather than failing the whole config load, matching
    /// the original's bare `map(int, daily_time.split(':'))` which the
    /// service loop is expected to have validated ahead of time.
    pub fn daily_at_parts(&self) -> (u32, u32) {
        let mut parts = self.daily_at.splitn(2, ':');
        let hour = parts.next().and_then(|s| s.parse().ok());
        let minute = parts.next().and_then(|s| s.parse().ok());
        match (hour, minute) {
            (Some(h), Some(m)) if h < 24 && m < 60 => (h, m),
            _ => (2, 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub kopia: KopiaSettings,
    pub backup: BackupSettings,
    pub docker: DockerSettings,
    pub logging: LoggingSettings,
    pub schedule: ScheduleSettings,
    pub hooks: HooksSettings,
}

impl Settings {
    /// Resolve the default config file path for the current effective
    /// user, matching the original root-vs-user split.
    pub fn default_path() -> PathBuf {
        if is_root() {
            PathBuf::from("/etc/kopi-docka.toml")
        } else {
            dirs_home().join(".config/kopi-docka/config.toml")
        }
    }

    /// Load settings, layering defaults, an optional TOML file, and
    /// `KOPI_DOCKA__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let resolved_path = path.map(Path::to_path_buf).unwrap_or_else(Settings::default_path);

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default()).map_err(config_err)?);

        if resolved_path.exists() {
            builder = builder.add_source(config::File::from(resolved_path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("KOPI_DOCKA")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build().map_err(config_err)?.try_deserialize().map_err(config_err)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject an unset or still-templated repository password, and an
    /// empty repository path, matching `_ensure_required_values`.
    fn validate(&self) -> Result<()> {
        if self.kopia.password.is_empty() || self.kopia.password == "CHANGE_ME_TO_A_SECURE_PASSWORD" {
            return Err(KopiError::Configuration(
                "kopia repository password is not set or still has the placeholder value".to_string(),
            ));
        }
        if self.kopia.repository_path.is_empty() {
            return Err(KopiError::Configuration("kopia repository_path is not set".to_string()));
        }
        Ok(())
    }

    /// Password resolution order: `KOPIA_PASSWORD` env var first, then the
    /// configured value, matching the repository façade's precedence.
    pub fn resolved_password(&self) -> String {
        std::env::var("KOPIA_PASSWORD").unwrap_or_else(|_| self.kopia.password.clone())
    }

    pub fn resolved_parallel_workers(&self) -> usize {
        self.backup.parallel_workers.unwrap_or_else(get_optimal_workers)
    }
}

fn config_err(e: config::ConfigError) -> KopiError {
    KopiError::Configuration(e.to_string())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/root"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_placeholder_password() {
        let settings = Settings {
            kopia: KopiaSettings { password: "CHANGE_ME_TO_A_SECURE_PASSWORD".to_string(), repository_path: "/backup".to_string(), ..Default::default() },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn accepts_fully_specified_settings() {
        let settings = Settings {
            kopia: KopiaSettings { password: "correct horse battery staple".to_string(), repository_path: "/backup".to_string(), ..Default::default() },
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn env_var_takes_precedence_for_password() {
        std::env::set_var("KOPIA_PASSWORD", "from-env");
        let settings = Settings {
            kopia: KopiaSettings { password: "from-file".to_string(), ..Default::default() },
            ..Default::default()
        };
        assert_eq!(settings.resolved_password(), "from-env");
        std::env::remove_var("KOPIA_PASSWORD");
    }
}
