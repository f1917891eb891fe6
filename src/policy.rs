//! Per-unit retention policy application (§4.7), grounded in
//! `BackupManager._ensure_policies`.

use tracing::warn;

use crate::constants::{
    DATABASE_BACKUP_DIR, DEFAULT_RETENTION_DAILY, DEFAULT_RETENTION_MONTHLY,
    DEFAULT_RETENTION_WEEKLY, DEFAULT_RETENTION_YEARLY, RECIPE_BACKUP_DIR, VOLUME_BACKUP_DIR,
};
use crate::repository::Repository;

/// GFS retention counts, one set per unit (with config-supplied overrides
/// falling back to the crate defaults).
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            daily: DEFAULT_RETENTION_DAILY,
            weekly: DEFAULT_RETENTION_WEEKLY,
            monthly: DEFAULT_RETENTION_MONTHLY,
            yearly: DEFAULT_RETENTION_YEARLY,
        }
    }
}

/// Applies `retention` to the three virtual paths that belong to `unit_name`.
/// Applied before that run's snapshots are created, so the new snapshots are
/// already covered by the policy the moment they land. A missing engine or
/// transient failure is logged and never aborts the backup.
pub async fn apply_unit_policies(repo: &Repository<'_>, unit_name: &str, retention: Retention) {
    let targets = [
        format!("{RECIPE_BACKUP_DIR}/{unit_name}"),
        format!("{VOLUME_BACKUP_DIR}/{unit_name}"),
        format!("{DATABASE_BACKUP_DIR}/{unit_name}"),
    ];

    for target in targets {
        if let Err(e) = repo
            .set_path_policy(&target, retention.daily, retention.weekly, retention.monthly, retention.yearly)
            .await
        {
            warn!(target = %target, error = %e, "could not apply retention policy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retention_matches_crate_constants() {
        let r = Retention::default();
        assert_eq!(r.daily, 7);
        assert_eq!(r.weekly, 4);
        assert_eq!(r.monthly, 12);
        assert_eq!(r.yearly, 2);
    }
}
