//! Per-database-engine dump and restore command construction (§4.4).
//!
//! Modeled as a closed [`DatabaseKind`](crate::types::DatabaseKind) match
//! rather than a trait-object strategy table, per the design notes'
//! guidance to avoid dynamic dispatch for a fixed, small set of variants.
//! Each function is pure: it builds an argv or [`CommandSpec`], it never
//! runs one. Execution and the ready-wait retry loop belong to the backup
//! and restore orchestrators, which already own comparable polling loops
//! for container health.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{ContainerInfo, DatabaseKind};
use crate::process_runner::CommandSpec;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn env_lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn parse_major_int(version: Option<&str>) -> Option<i64> {
    let v = version?;
    let head = v.split(['-', '.']).next()?;
    head.parse().ok()
}

fn parse_major_minor(version: Option<&str>) -> Option<f64> {
    let v = version?;
    let clean = v.split('-').next().unwrap_or(v);
    let mut parts = clean.split('.');
    let major = parts.next()?;
    match parts.next() {
        Some(minor) => format!("{major}.{minor}").parse().ok(),
        None => major.parse().ok(),
    }
}

/// MySQL/MariaDB-family credential resolution: prefer a root password, else
/// fall back to an application user, matching `backup-db.py`'s lookup
/// order exactly (including MariaDB's dual `MYSQL_*`/`MARIADB_*` env names).
struct MysqlLikeCredentials {
    user: String,
    password: Option<String>,
}

fn resolve_mysql_credentials(env: &[(String, String)]) -> MysqlLikeCredentials {
    let password = env_lookup(env, "MYSQL_ROOT_PASSWORD").map(str::to_string);
    match password {
        Some(p) if !p.is_empty() => MysqlLikeCredentials { user: "root".to_string(), password: Some(p) },
        _ => MysqlLikeCredentials {
            user: env_lookup(env, "MYSQL_USER").unwrap_or("root").to_string(),
            password: env_lookup(env, "MYSQL_PASSWORD").map(str::to_string).filter(|p| !p.is_empty()),
        },
    }
}

fn resolve_mariadb_credentials(env: &[(String, String)]) -> MysqlLikeCredentials {
    let password = env_lookup(env, "MYSQL_ROOT_PASSWORD")
        .or_else(|| env_lookup(env, "MARIADB_ROOT_PASSWORD"))
        .map(str::to_string);
    match password {
        Some(p) if !p.is_empty() => MysqlLikeCredentials { user: "root".to_string(), password: Some(p) },
        _ => {
            let user = env_lookup(env, "MYSQL_USER")
                .or_else(|| env_lookup(env, "MARIADB_USER"))
                .unwrap_or("root")
                .to_string();
            let password = env_lookup(env, "MYSQL_PASSWORD")
                .or_else(|| env_lookup(env, "MARIADB_PASSWORD"))
                .map(str::to_string)
                .filter(|p| !p.is_empty());
            MysqlLikeCredentials { user, password }
        }
    }
}

/// The on-disk/on-wire format a dump produces, recorded in backup metadata.
pub fn dump_format(kind: DatabaseKind) -> &'static str {
    match kind {
        DatabaseKind::Postgres => "sql",
        DatabaseKind::Mysql | DatabaseKind::MariaDb => "sql",
        DatabaseKind::Mongo => "archive",
        DatabaseKind::Redis => "rdb",
    }
}

/// `docker exec <id> <version flag>` probe for each engine.
pub fn version_probe(kind: DatabaseKind, container_id: &str) -> CommandSpec {
    let args = match kind {
        DatabaseKind::Postgres => vec!["exec", container_id, "postgres", "--version"],
        DatabaseKind::Mysql => vec!["exec", container_id, "mysql", "--version"],
        DatabaseKind::MariaDb => vec!["exec", container_id, "mariadb", "--version"],
        DatabaseKind::Mongo => vec!["exec", container_id, "mongod", "--version"],
        DatabaseKind::Redis => vec!["exec", container_id, "redis-server", "--version"],
    };
    CommandSpec::new("docker", args.into_iter().map(String::from).collect()).timeout(VERSION_PROBE_TIMEOUT)
}

/// Parse the version-probe's stdout into a bare version string, per engine.
pub fn parse_version(kind: DatabaseKind, stdout: &str) -> Option<String> {
    match kind {
        DatabaseKind::Postgres => {
            // "postgres (PostgreSQL) 14.5"
            stdout.split_whitespace().find(|p| p.chars().next().is_some_and(|c| c.is_ascii_digit())).map(String::from)
        }
        DatabaseKind::Mysql => {
            // "mysql  Ver 8.0.33 for Linux"
            let parts: Vec<&str> = stdout.split_whitespace().collect();
            parts.iter().position(|p| *p == "Ver").and_then(|i| parts.get(i + 1)).map(|s| s.to_string())
        }
        DatabaseKind::MariaDb => {
            if stdout.contains("MariaDB") {
                stdout.split_whitespace().find(|p| p.contains("-MariaDB")).and_then(|p| p.split('-').next()).map(String::from)
            } else {
                None
            }
        }
        DatabaseKind::Mongo => stdout
            .lines()
            .find(|l| l.contains("db version"))
            .and_then(|l| l.split_whitespace().find(|p| p.starts_with('v')))
            .map(|p| p[1..].to_string()),
        DatabaseKind::Redis => stdout
            .split_whitespace()
            .find(|p| p.starts_with("v="))
            .map(|p| p[2..].to_string()),
    }
}

/// Build the dump subprocess spec, streamed (via stdout) into the
/// snapshot-from-stdin path. `version` is the already-detected engine
/// version, or `None` if detection failed (the older/safer code path is
/// used in that case, matching the original's `version_major and ...`
/// short-circuit).
pub fn backup_command(kind: DatabaseKind, container: &ContainerInfo, version: Option<&str>) -> CommandSpec {
    let id = container.id.as_str();
    match kind {
        DatabaseKind::Postgres => {
            let user = env_lookup(&container.environment, "POSTGRES_USER").unwrap_or("postgres");
            let major = parse_major_int(version);
            let mut args = vec!["exec".to_string(), id.to_string()];
            if major.is_some_and(|m| m >= 12) {
                args.extend(["pg_dumpall", "-U", user, "--no-role-passwords"].map(String::from));
            } else {
                args.extend(["pg_dumpall", "-U", user].map(String::from));
            }
            args.push("--clean".to_string());
            CommandSpec::new("docker", args)
        }
        DatabaseKind::Mysql => {
            let creds = resolve_mysql_credentials(&container.environment);
            let major = parse_major_int(version);
            let mut args = Vec::new();
            if major.is_some_and(|m| m >= 8) {
                if let Some(pw) = &creds.password {
                    args.extend(
                        [
                            "exec".to_string(), "-e".to_string(), format!("MYSQL_PWD={pw}"),
                            id.to_string(), "mysqldump".to_string(), "--all-databases".to_string(),
                            "--single-transaction".to_string(), "-u".to_string(), creds.user.clone(),
                        ],
                    );
                } else {
                    args.extend(
                        ["exec".to_string(), id.to_string(), "mysqldump".to_string(), "--all-databases".to_string(), "--single-transaction".to_string(), "-u".to_string(), creds.user.clone()],
                    );
                }
                args.push("--column-statistics=0".to_string());
            } else {
                args.extend(["exec".to_string(), id.to_string(), "mysqldump".to_string(), "--all-databases".to_string(), "--single-transaction".to_string()]);
                if let Some(pw) = &creds.password {
                    args.push(format!("-u{}", creds.user));
                    args.push(format!("-p{pw}"));
                } else {
                    args.push(format!("-u{}", creds.user));
                }
            }
            args.extend(["--routines".to_string(), "--events".to_string()]);
            CommandSpec::new("docker", args)
        }
        DatabaseKind::MariaDb => {
            let creds = resolve_mariadb_credentials(&container.environment);
            let major = parse_major_minor(version).unwrap_or(10.3);
            let dump_cmd = if major >= 10.3 { "mariadb-dump" } else { "mysqldump" };
            let mut args = if let Some(pw) = &creds.password {
                vec![
                    "exec".to_string(), "-e".to_string(), format!("MYSQL_PWD={pw}"),
                    id.to_string(), dump_cmd.to_string(), "--all-databases".to_string(),
                    "--single-transaction".to_string(), "-u".to_string(), creds.user.clone(),
                ]
            } else {
                vec!["exec".to_string(), id.to_string(), dump_cmd.to_string(), "--all-databases".to_string(), "--single-transaction".to_string(), format!("-u{}", creds.user)]
            };
            args.extend(["--routines".to_string(), "--events".to_string()]);
            if major >= 10.0 {
                args.push("--skip-log-queries".to_string());
            }
            CommandSpec::new("docker", args)
        }
        DatabaseKind::Mongo => {
            let mut args = vec!["exec".to_string(), id.to_string(), "mongodump".to_string(), "--archive".to_string()];
            let username = env_lookup(&container.environment, "MONGO_INITDB_ROOT_USERNAME");
            let password = env_lookup(&container.environment, "MONGO_INITDB_ROOT_PASSWORD");
            if let (Some(u), Some(p)) = (username, password) {
                args.extend(["--username".to_string(), u.to_string(), "--password".to_string(), p.to_string(), "--authenticationDatabase".to_string(), "admin".to_string()]);
            }
            if parse_major_int(version).is_some_and(|m| m >= 4) {
                args.push("--oplog".to_string());
            }
            CommandSpec::new("docker", args)
        }
        DatabaseKind::Redis => {
            let password = env_lookup(&container.environment, "REDIS_PASSWORD").filter(|p| !p.is_empty());
            let save_cmd = match password {
                Some(pw) => format!("redis-cli -a {pw} --no-auth-warning --rdb -"),
                None => "redis-cli --rdb -".to_string(),
            };
            CommandSpec::new("docker", vec!["exec".to_string(), id.to_string(), "sh".to_string(), "-c".to_string(), save_cmd])
        }
    }
}

/// `docker exec <name> <ping-equivalent>` used in the readiness poll loop;
/// the caller retries this on a fixed interval until it succeeds or a
/// max-attempts budget is exhausted.
pub fn readiness_probe(kind: DatabaseKind, container_name: &str) -> CommandSpec {
    let args: Vec<String> = match kind {
        DatabaseKind::Postgres => vec!["exec", container_name, "pg_isready", "-U", "postgres"],
        DatabaseKind::Mysql => vec!["exec", container_name, "mysqladmin", "ping", "-h", "localhost"],
        DatabaseKind::MariaDb => vec!["exec", container_name, "mariadb-admin", "ping"],
        DatabaseKind::Mongo => vec!["exec", container_name, "mongosh", "--eval", "db.adminCommand(\"ping\")"],
        DatabaseKind::Redis => vec!["exec", container_name, "redis-cli", "ping"],
    }
    .into_iter()
    .map(String::from)
    .collect();
    CommandSpec::new("docker", args).timeout(READINESS_PROBE_TIMEOUT)
}

/// Fallback readiness probe tried when the primary one exits non-zero
/// (MariaDB's `mariadb-admin` may be absent on pre-10.3 images; Mongo's
/// `mongosh` may be absent on pre-5.0 images).
pub fn readiness_probe_fallback(kind: DatabaseKind, container_name: &str) -> Option<CommandSpec> {
    match kind {
        DatabaseKind::MariaDb => Some(CommandSpec::new(
            "docker",
            vec!["exec".to_string(), container_name.to_string(), "mysqladmin".to_string(), "ping".to_string()],
        ).timeout(READINESS_PROBE_TIMEOUT)),
        DatabaseKind::Mongo => Some(CommandSpec::new(
            "docker",
            vec!["exec".to_string(), container_name.to_string(), "mongo".to_string(), "--eval".to_string(), "db.adminCommand(\"ping\")".to_string()],
        ).timeout(READINESS_PROBE_TIMEOUT)),
        _ => None,
    }
}

/// How a restore is physically delivered: most engines accept the dump on
/// stdin of a client process; Redis instead requires the RDB file to be
/// copied into the container's data directory followed by a restart.
pub enum RestoreMethod {
    /// Run this command with the dump bytes as stdin.
    Stdin(CommandSpec),
    /// Run `create_db` first and ignore its result, then run `restore` with
    /// the dump bytes as stdin. Used for a single-database Postgres dump,
    /// which (unlike a `pg_dumpall` cluster dump) has no database of its
    /// own to connect to.
    CreateDbThenStdin { create_db: CommandSpec, restore: CommandSpec },
    /// Copy `local_dump` into the container at `/data/dump.rdb`, chown it
    /// to `redis`, then restart the container.
    CopyRdbAndRestart { local_dump: PathBuf },
}

/// The marker `pg_dumpall` writes at the top of a cluster dump. Its absence
/// means `local_dump` is a single-database `pg_dump`, which restores into a
/// named target database rather than directly via `psql`.
const POSTGRES_CLUSTER_DUMP_MARKER: &[u8] = b"-- PostgreSQL database cluster dump";

/// Peek the first kilobyte of `local_dump` for the cluster-dump marker.
/// A missing or unreadable file is treated as a single-database dump, the
/// safer of the two restore paths.
fn is_postgres_cluster_dump(local_dump: &std::path::Path) -> bool {
    use std::io::Read;
    let Ok(mut file) = std::fs::File::open(local_dump) else {
        return false;
    };
    let mut header = [0u8; 1024];
    let Ok(n) = file.read(&mut header) else {
        return false;
    };
    header[..n].windows(POSTGRES_CLUSTER_DUMP_MARKER.len()).any(|w| w == POSTGRES_CLUSTER_DUMP_MARKER)
}

/// Build the restore delivery for `kind` against an already-running target
/// container. `container_env` is the *target* container's environment
/// (re-inspected at restore time, since it may differ from what was
/// captured at backup time).
pub fn restore_command(
    kind: DatabaseKind,
    container_name: &str,
    container_env: &[(String, String)],
    version: Option<&str>,
    local_dump: &std::path::Path,
) -> RestoreMethod {
    match kind {
        DatabaseKind::Postgres => {
            if is_postgres_cluster_dump(local_dump) {
                RestoreMethod::Stdin(CommandSpec::new(
                    "docker",
                    vec!["exec".to_string(), "-i".to_string(), container_name.to_string(), "psql".to_string(), "-U".to_string(), "postgres".to_string()],
                ))
            } else {
                let create_db = CommandSpec::new(
                    "docker",
                    vec!["exec".to_string(), container_name.to_string(), "createdb".to_string(), "-U".to_string(), "postgres".to_string(), "restored_db".to_string()],
                );
                let restore = CommandSpec::new(
                    "docker",
                    vec![
                        "exec".to_string(), "-i".to_string(), container_name.to_string(), "psql".to_string(),
                        "-U".to_string(), "postgres".to_string(), "-d".to_string(), "restored_db".to_string(),
                    ],
                );
                RestoreMethod::CreateDbThenStdin { create_db, restore }
            }
        }
        DatabaseKind::Mysql => {
            let creds = resolve_mysql_credentials(container_env);
            let mut args = vec!["exec".to_string(), "-i".to_string()];
            if let Some(pw) = &creds.password {
                args.extend(["-e".to_string(), format!("MYSQL_PWD={pw}")]);
            }
            args.extend([container_name.to_string(), "mysql".to_string(), format!("-u{}", creds.user)]);
            RestoreMethod::Stdin(CommandSpec::new("docker", args))
        }
        DatabaseKind::MariaDb => {
            let creds = resolve_mariadb_credentials(container_env);
            let major = parse_major_minor(version).unwrap_or(10.3);
            let client = if major >= 10.3 { "mariadb" } else { "mysql" };
            let mut args = vec!["exec".to_string(), "-i".to_string()];
            if let Some(pw) = &creds.password {
                args.extend(["-e".to_string(), format!("MYSQL_PWD={pw}")]);
            }
            args.extend([container_name.to_string(), client.to_string(), format!("-u{}", creds.user)]);
            RestoreMethod::Stdin(CommandSpec::new("docker", args))
        }
        DatabaseKind::Mongo => {
            let username = env_lookup(container_env, "MONGO_INITDB_ROOT_USERNAME");
            let password = env_lookup(container_env, "MONGO_INITDB_ROOT_PASSWORD");
            let mut args = vec!["exec".to_string(), "-i".to_string(), container_name.to_string(), "mongorestore".to_string()];
            if let (Some(u), Some(p)) = (username, password) {
                args.extend(["--username".to_string(), u.to_string(), "--password".to_string(), p.to_string(), "--authenticationDatabase".to_string(), "admin".to_string()]);
            }
            args.push("--archive".to_string());
            RestoreMethod::Stdin(CommandSpec::new("docker", args))
        }
        DatabaseKind::Redis => RestoreMethod::CopyRdbAndRestart { local_dump: local_dump.to_path_buf() },
    }
}

/// `docker exec <name> <list-databases-or-keys>` used to sanity-check a
/// restore landed real data, not just an empty/default instance.
pub fn verify_command(kind: DatabaseKind, container_name: &str) -> CommandSpec {
    let args: Vec<String> = match kind {
        DatabaseKind::Postgres => vec!["exec", container_name, "psql", "-U", "postgres", "-c", "\\l"],
        DatabaseKind::Mysql => vec!["exec", container_name, "mysql", "-uroot", "-e", "SHOW DATABASES;"],
        DatabaseKind::MariaDb => vec!["exec", container_name, "mariadb", "-uroot", "-e", "SHOW DATABASES;"],
        DatabaseKind::Mongo => vec!["exec", container_name, "mongosh", "--eval", "show dbs", "--quiet"],
        DatabaseKind::Redis => vec!["exec", container_name, "redis-cli", "DBSIZE"],
    }
    .into_iter()
    .map(String::from)
    .collect();
    CommandSpec::new("docker", args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn container(env: Vec<(&str, &str)>) -> ContainerInfo {
        ContainerInfo {
            id: "c1".to_string(),
            name: "db".to_string(),
            image: "postgres:14".to_string(),
            status: "running".to_string(),
            labels: BTreeMap::new(),
            environment: env.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            volumes: vec![],
            compose_file: None,
            inspect_data: serde_json::Value::Null,
            database_type: Some(DatabaseKind::Postgres),
        }
    }

    #[test]
    fn postgres_12_plus_drops_role_passwords() {
        let c = container(vec![("POSTGRES_USER", "app")]);
        let spec = backup_command(DatabaseKind::Postgres, &c, Some("14.5"));
        assert_eq!(
            spec.args,
            vec!["exec", "c1", "pg_dumpall", "-U", "app", "--no-role-passwords", "--clean"]
        );
    }

    #[test]
    fn postgres_below_12_omits_flag() {
        let c = container(vec![]);
        let spec = backup_command(DatabaseKind::Postgres, &c, Some("9.6"));
        assert_eq!(spec.args, vec!["exec", "c1", "pg_dumpall", "-U", "postgres", "--clean"]);
    }

    #[test]
    fn mysql_8_uses_pwd_env_var_not_argv() {
        let c = container(vec![("MYSQL_ROOT_PASSWORD", "hunter2")]);
        let spec = backup_command(DatabaseKind::Mysql, &c, Some("8.0.33"));
        assert!(spec.args.contains(&"MYSQL_PWD=hunter2".to_string()));
        assert!(!spec.args.iter().any(|a| a.contains("hunter2") && a.starts_with("-p")));
        assert!(spec.args.contains(&"--column-statistics=0".to_string()));
    }

    #[test]
    fn mariadb_picks_dump_binary_by_version() {
        let c = container(vec![]);
        let new_spec = backup_command(DatabaseKind::MariaDb, &c, Some("10.6.12"));
        assert!(new_spec.args.contains(&"mariadb-dump".to_string()));

        let old_spec = backup_command(DatabaseKind::MariaDb, &c, Some("10.1.2"));
        assert!(old_spec.args.contains(&"mysqldump".to_string()));
    }

    #[test]
    fn redis_builds_auth_aware_save_command() {
        let with_pw = container(vec![("REDIS_PASSWORD", "s3cr3t")]);
        let spec = backup_command(DatabaseKind::Redis, &with_pw, None);
        assert!(spec.args.last().unwrap().contains("-a s3cr3t"));

        let without_pw = container(vec![]);
        let spec2 = backup_command(DatabaseKind::Redis, &without_pw, None);
        assert_eq!(spec2.args.last().unwrap(), "redis-cli --rdb -");
    }

    #[test]
    fn redis_restore_uses_copy_and_restart() {
        let method = restore_command(DatabaseKind::Redis, "redis1", &[], None, std::path::Path::new("/tmp/dump.rdb"));
        assert!(matches!(method, RestoreMethod::CopyRdbAndRestart { .. }));
    }

    #[test]
    fn postgres_cluster_dump_restores_directly() {
        let dir = tempfile::tempdir().unwrap();
        let dump_path = dir.path().join("dump.sql");
        std::fs::write(&dump_path, b"-- PostgreSQL database cluster dump\n\\connect postgres\n").unwrap();

        let method = restore_command(DatabaseKind::Postgres, "db1", &[], None, &dump_path);
        match method {
            RestoreMethod::Stdin(spec) => {
                assert_eq!(spec.args, vec!["exec", "-i", "db1", "psql", "-U", "postgres"]);
            }
            _ => panic!("a cluster dump must restore directly via psql, with no target database"),
        }
    }

    #[test]
    fn postgres_single_db_dump_creates_target_database_first() {
        let dir = tempfile::tempdir().unwrap();
        let dump_path = dir.path().join("dump.sql");
        std::fs::write(&dump_path, b"-- PostgreSQL database dump\nCREATE TABLE widgets (id int);\n").unwrap();

        let method = restore_command(DatabaseKind::Postgres, "db1", &[], None, &dump_path);
        match method {
            RestoreMethod::CreateDbThenStdin { create_db, restore } => {
                assert_eq!(create_db.args, vec!["exec", "db1", "createdb", "-U", "postgres", "restored_db"]);
                assert_eq!(restore.args, vec!["exec", "-i", "db1", "psql", "-U", "postgres", "-d", "restored_db"]);
            }
            _ => panic!("a single-database dump must createdb then restore into it"),
        }
    }

    #[test]
    fn postgres_missing_dump_file_treated_as_single_database() {
        let method = restore_command(DatabaseKind::Postgres, "db1", &[], None, std::path::Path::new("/nonexistent/dump.sql"));
        assert!(matches!(method, RestoreMethod::CreateDbThenStdin { .. }));
    }

    #[test]
    fn parses_versions_per_engine() {
        assert_eq!(parse_version(DatabaseKind::Postgres, "postgres (PostgreSQL) 14.5"), Some("14.5".to_string()));
        assert_eq!(parse_version(DatabaseKind::Mysql, "mysql  Ver 8.0.33 for Linux"), Some("8.0.33".to_string()));
        assert_eq!(parse_version(DatabaseKind::Redis, "Redis server v=6.2.6"), Some("6.2.6".to_string()));
    }
}
