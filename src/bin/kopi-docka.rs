//! Thin CLI entry point: argument parsing and wiring only. The actual
//! orchestration logic lives in the `kopi_docka` library; this binary's
//! job is to resolve settings, pick a `ProcessRunner`, and dispatch to the
//! right library call. Modeled on the teacher's `meridian-cli` binary
//! shape (one `Cli`/`Commands` pair, `tokio::main`, `tracing-subscriber`
//! wired from a verbosity flag), condensed into a single file since this
//! binary carries no feature surface of its own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kopi_docka::backend_uri::Backend;
use kopi_docka::config::Settings;
use kopi_docka::constants::{CONTAINER_START_TIMEOUT, EXIT_GENERAL_ERROR, EXIT_SUCCESS};
use kopi_docka::discovery::DockerDiscovery;
use kopi_docka::dr_bundle::{BundleMode, DrBundleSettings, DrBundler, PassphraseStyle};
use kopi_docka::dry_run::DryRunReporter;
use kopi_docka::hooks::HooksManager;
use kopi_docka::lock::ProcessLock;
use kopi_docka::process_runner::{ProcessRunner, SystemProcessRunner};
use kopi_docka::repository::Repository;
use kopi_docka::restore::{RestoreOrchestrator, RestoreRunSettings};
use kopi_docka::service;
use kopi_docka::system_utils::is_root;
use kopi_docka::types::RestorePoint;

#[derive(Parser)]
#[command(name = "kopi-docka")]
#[command(version, about = "Cold-backup orchestrator for container workloads", long_about = None)]
struct Cli {
    /// Path to an explicit TOML config file; defaults to the root/user path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backup pass of every discovered unit and exit.
    Backup,
    /// Preview what a backup pass would do without making any changes.
    DryRun {
        /// Override the configured recovery-bundle-update setting.
        #[arg(long)]
        update_recovery: Option<bool>,
    },
    /// Restore one unit from a selected restore point.
    Restore {
        /// Backup unit name to restore.
        unit: String,
        /// backup_id to restore; defaults to the most recent for the unit.
        #[arg(long)]
        backup_id: Option<String>,
        /// Print the planned steps instead of executing them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Build a disaster-recovery bundle and write it to `--output`.
    DisasterRecovery {
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Stream the archive to stdout instead of writing a file.
        #[arg(long)]
        stream: bool,
        /// Use the legacy tar.gz+openssl format instead of the single zip.
        #[arg(long)]
        legacy: bool,
    },
    /// Run as a long-lived daemon (systemd `Type=notify` contract).
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose { "kopi_docka=debug".into() } else { "kopi_docka=info".into() }
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(cli.config.as_deref())?;
    let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
    let lock_path = ProcessLock::default_path();

    let exit_code = match cli.command {
        Commands::Backup => run_backup(runner.clone(), &settings, lock_path).await,
        Commands::DryRun { update_recovery } => run_dry_run(runner.as_ref(), &settings, cli.config, update_recovery).await,
        Commands::Restore { unit, backup_id, dry_run } => run_restore(runner.as_ref(), &settings, &unit, backup_id.as_deref(), dry_run).await,
        Commands::DisasterRecovery { output, stream, legacy } => run_disaster_recovery(runner.as_ref(), &settings, output, stream, legacy).await,
        Commands::Daemon => run_daemon(runner, &settings, lock_path).await,
    };

    std::process::exit(exit_code);
}

async fn run_backup(runner: Arc<dyn ProcessRunner>, settings: &Settings, lock_path: PathBuf) -> i32 {
    match service::run_oneshot(runner, settings, lock_path).await {
        Ok(results) => {
            if results.iter().all(|m| m.success) {
                EXIT_SUCCESS
            } else {
                EXIT_GENERAL_ERROR
            }
        }
        Err(e) => {
            eprintln!("backup failed: {e}");
            EXIT_GENERAL_ERROR
        }
    }
}

async fn run_daemon(runner: Arc<dyn ProcessRunner>, settings: &Settings, lock_path: PathBuf) -> i32 {
    if !is_root() {
        eprintln!("warning: running daemon mode without root; bind-mounted volume ownership fixups may fail");
    }
    match service::run_daemon(runner, settings, lock_path).await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("daemon exited with error: {e}");
            EXIT_GENERAL_ERROR
        }
    }
}

async fn run_dry_run(runner: &dyn ProcessRunner, settings: &Settings, config_path: Option<PathBuf>, update_recovery: Option<bool>) -> i32 {
    let discovery = DockerDiscovery::new(runner);
    let units = match discovery.discover().await {
        Ok(units) => units,
        Err(e) => {
            eprintln!("discovery failed: {e}");
            return EXIT_GENERAL_ERROR;
        }
    };

    let reporter = DryRunReporter::new(runner);
    let config_file = config_path.unwrap_or_else(Settings::default_path);
    let report = reporter.generate(settings, &config_file, &units, update_recovery).await;
    println!("{}", report.render());
    EXIT_SUCCESS
}

async fn run_restore(runner: &dyn ProcessRunner, settings: &Settings, unit: &str, backup_id: Option<&str>, dry_run: bool) -> i32 {
    let repo = match build_repository(runner, settings) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_GENERAL_ERROR;
        }
    };

    let mut tags = BTreeMap::new();
    tags.insert("unit".to_string(), unit.to_string());
    let snapshots = match repo.list_snapshots(&tags).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to list snapshots for {unit}: {e}");
            return EXIT_GENERAL_ERROR;
        }
    };

    let mut points = RestorePoint::group(snapshots);
    points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let point = match backup_id {
        Some(id) => points.into_iter().find(|p| p.backup_id == id),
        None => points.into_iter().next(),
    };
    let Some(point) = point else {
        eprintln!("no restore point found for unit {unit}");
        return EXIT_GENERAL_ERROR;
    };

    let hooks = HooksManager::new(runner, settings.hooks.to_hook_paths());
    let orchestrator = RestoreOrchestrator::new(
        runner,
        repo,
        hooks,
        RestoreRunSettings { start_timeout: CONTAINER_START_TIMEOUT },
    );

    let staging = std::env::temp_dir().join("kopi-docka").join("staging").join("restore");
    if dry_run {
        let (recipe_dir, is_stack) = match orchestrator.restore_recipes(&point, &staging).await {
            Ok(r) => r,
            Err(e) => {
                eprintln!("failed to inspect recipe for dry-run: {e}");
                return EXIT_GENERAL_ERROR;
            }
        };
        let steps = orchestrator.plan(&point, &recipe_dir, is_stack);
        for line in orchestrator.describe(&steps) {
            println!("{line}");
        }
        return EXIT_SUCCESS;
    }

    let metadata = orchestrator.restore_point(&point, &staging).await;
    if metadata.success {
        EXIT_SUCCESS
    } else {
        eprintln!("restore completed with {} error(s)", metadata.errors.len());
        EXIT_GENERAL_ERROR
    }
}

async fn run_disaster_recovery(runner: &dyn ProcessRunner, settings: &Settings, output: PathBuf, stream: bool, legacy: bool) -> i32 {
    let repo = match build_repository(runner, settings) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_GENERAL_ERROR;
        }
    };

    let bundler = DrBundler::new(runner, repo, settings.clone());
    let opts = DrBundleSettings {
        mode: if legacy { BundleMode::Legacy } else { BundleMode::SingleZip },
        output_dir: output,
        stream,
        passphrase_style: PassphraseStyle::Words,
        ..Default::default()
    };

    match bundler.create_bundle(&opts).await {
        Ok(Some(path)) => {
            println!("disaster-recovery bundle written to {}", path.display());
            EXIT_SUCCESS
        }
        Ok(None) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("disaster-recovery bundle failed: {e}");
            EXIT_GENERAL_ERROR
        }
    }
}

fn build_repository<'a>(runner: &'a dyn ProcessRunner, settings: &Settings) -> anyhow::Result<Repository<'a>> {
    let backend = Backend::parse(&settings.kopia.repository_path)?;
    Ok(Repository::new(
        runner,
        backend,
        settings.resolved_password(),
        settings.kopia.profile.clone(),
        Some(PathBuf::from(expand_home(&settings.kopia.cache_directory))),
    ))
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

