/*!
zbackup CLI - Command-line interface for incremental ZFS snapshot backups.

Takes snapshots of primary filesystems, mirrors them into an archive pool,
prunes old snapshots and compares primaries against their mirrors.
*/

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};
use zbackup_core::{
    backup_targets, check_privileges, diff_target, observability, validate_targets, BackupConfig,
    DiffOutcome, Filesystem, PurgeReport, RetentionPolicy, RunContext, Snapshot, TargetOutcome,
    Transfer, Zfs,
};

#[derive(Parser)]
#[command(name = "zbackup")]
#[command(about = "Incremental snapshot backups for ZFS filesystems")]
#[command(version)]
struct Cli {
    /// Show what would be done without changing any filesystem
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Enable verbose logging and transfer progress
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "ZBACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Emit log records as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Print Prometheus counters on exit
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot each target and send it to the archive
    Backup {
        /// Primary filesystems to back up
        #[arg(required = true)]
        targets: Vec<String>,
        /// Archive root that mirrors each target under its own name
        #[arg(short, long)]
        archive: String,
        /// Apply the retention policy after each successful backup
        #[arg(long)]
        prune: bool,
    },
    /// Compare each target's files with its archive mirror
    Diff {
        /// Primary filesystems to compare
        #[arg(required = true)]
        targets: Vec<String>,
        /// Archive root that mirrors each target under its own name
        #[arg(short, long)]
        archive: String,
    },
    /// Take a snapshot of each target, or list existing ones
    Snapshot {
        /// Filesystems to snapshot
        #[arg(required = true)]
        targets: Vec<String>,
        /// List snapshots instead of taking one
        #[arg(short, long)]
        list: bool,
    },
    /// Destroy snapshots that fall outside the retention schedule
    Prune {
        /// Filesystems to prune
        #[arg(required = true)]
        targets: Vec<String>,
    },
}

impl Commands {
    fn targets(&self) -> &[String] {
        match self {
            Commands::Backup { targets, .. }
            | Commands::Diff { targets, .. }
            | Commands::Snapshot { targets, .. }
            | Commands::Prune { targets } => targets,
        }
    }

    fn mutates(&self) -> bool {
        match self {
            Commands::Backup { .. } | Commands::Prune { .. } => true,
            Commands::Snapshot { list, .. } => !list,
            Commands::Diff { .. } => false,
        }
    }
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Filesystem")]
    filesystem: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
    #[tabled(rename = "Created")]
    created: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();

    observability::init_logging(cli.verbose, cli.log_json)?;

    let config = BackupConfig::load(cli.config.as_deref())?;
    config.validate()?;
    validate_targets(cli.command.targets())?;

    if cli.command.mutates() && !cli.dry_run {
        check_privileges()?;
    }

    let ctx = RunContext::new(config, cli.dry_run, cli.verbose);
    let zfs = Zfs::new(&ctx);

    let failures = match &cli.command {
        Commands::Backup {
            targets,
            archive,
            prune,
        } => run_backup(&ctx, &zfs, targets, archive, *prune).await,
        Commands::Diff { targets, archive } => run_diff(&zfs, targets, archive).await,
        Commands::Snapshot { targets, list: true } => list_snapshots(&zfs, targets).await,
        Commands::Snapshot { targets, list: false } => take_snapshots(&zfs, targets).await,
        Commands::Prune { targets } => run_prune(&ctx, &zfs, targets).await,
    };

    if ctx.dry_run {
        info!(
            "dry run: {} command(s) were not executed",
            ctx.dry_run_log().recorded().len()
        );
    }

    if cli.metrics {
        match observability::metrics_text()? {
            Some(text) => print!("{text}"),
            None => warn!("zbackup was built without the metrics feature"),
        }
    }

    if failures > 0 {
        error!("{failures} target(s) failed");
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn run_backup(
    ctx: &RunContext,
    zfs: &Zfs,
    targets: &[String],
    archive: &str,
    prune: bool,
) -> usize {
    let outcomes = backup_targets(ctx, zfs, targets, archive, prune).await;
    for outcome in &outcomes {
        print_backup(outcome);
    }
    outcomes.iter().filter(|o| !o.is_success()).count()
}

fn print_backup(outcome: &TargetOutcome) {
    let report = match &outcome.backup {
        Ok(report) => report,
        Err(e) => {
            eprintln!("✗ {}: {e}", outcome.target);
            return;
        }
    };

    if report.is_up_to_date() {
        println!(
            "✓ {}: {} is up to date at {}",
            report.primary, report.mirror, report.snapshot
        );
    }
    for transfer in &report.transfers {
        match transfer {
            Transfer::Full { snapshot, size } => println!(
                "✓ {}: sent {snapshot} to {} ({})",
                report.primary,
                report.mirror,
                size.as_deref().unwrap_or("size not estimated")
            ),
            Transfer::Incremental { from, to, size } => println!(
                "✓ {}: sent {from}..{to} to {} ({})",
                report.primary,
                report.mirror,
                size.as_deref().unwrap_or("size not estimated")
            ),
        }
    }
    for purge in &outcome.purges {
        print_purge(&outcome.target, purge);
    }
}

fn print_purge(target: &str, purge: &zbackup_core::Result<PurgeReport>) {
    match purge {
        Ok(report) => {
            println!(
                "✓ {}: pruned {} snapshot(s)",
                report.filesystem,
                report.destroyed.len()
            );
            for (snapshot, e) in &report.failed {
                eprintln!("✗ {}@{snapshot}: {e}", report.filesystem);
            }
        }
        Err(e) => eprintln!("✗ {target}: prune failed: {e}"),
    }
}

async fn run_diff(zfs: &Zfs, targets: &[String], archive: &str) -> usize {
    let mut failures = 0;
    for target in targets {
        match diff_target(zfs, target, archive).await {
            Ok(DiffOutcome::NotArchived { mirror }) => {
                println!("{target}: not yet archived ({mirror} does not exist)");
            }
            Ok(outcome) => {
                if !print_diff(target, &outcome) {
                    failures += 1;
                }
            }
            Err(e) => {
                error!(target = %target, "diff failed: {e}");
                eprintln!("✗ {target}: {e}");
                failures += 1;
            }
        }
    }
    failures
}

/// Print a comparison; false when nothing could be compared
fn print_diff(target: &str, outcome: &DiffOutcome) -> bool {
    let DiffOutcome::Compared { entries, skipped, .. } = outcome else {
        return true;
    };
    for name in skipped {
        eprintln!("✗ {target}: skipped {name} (not mounted on both sides)");
    }
    for entry in entries {
        println!("{entry}");
    }

    if outcome.compared_nothing() {
        error!(target = %target, "no filesystem could be compared");
        return false;
    }
    if outcome.is_clean() {
        println!("{target}: No differences");
    } else if entries.is_empty() {
        println!("{target}: No differences in the filesystems that were compared");
    }
    true
}

async fn take_snapshots(zfs: &Zfs, targets: &[String]) -> usize {
    let mut failures = 0;
    for target in targets {
        let mut filesystem = Filesystem::new(zfs, target.as_str());
        let result = match filesystem.ensure_exists().await {
            Ok(()) => filesystem.take_snapshot().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(snapshot) => println!("✓ {target}@{snapshot}"),
            Err(e) => {
                error!(target = %target, "snapshot failed: {e}");
                eprintln!("✗ {target}: {e}");
                failures += 1;
            }
        }
    }
    failures
}

async fn list_snapshots(zfs: &Zfs, targets: &[String]) -> usize {
    let mut failures = 0;
    let mut rows = Vec::new();
    for target in targets {
        let filesystem = Filesystem::new(zfs, target.as_str());
        let result = match filesystem.ensure_exists().await {
            Ok(()) => filesystem.snapshot_list(false).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(list) => rows.extend(list.names().iter().map(|name| SnapshotRow {
                filesystem: target.clone(),
                snapshot: name.clone(),
                created: format_created(name, zfs.snapshot_prefix()),
            })),
            Err(e) => {
                eprintln!("✗ {target}: {e}");
                failures += 1;
            }
        }
    }

    if rows.is_empty() {
        println!("No snapshots found");
    } else {
        println!("{}", Table::new(rows));
    }
    failures
}

/// Local creation time for snapshots this tool named, empty otherwise
fn format_created(name: &str, prefix: &str) -> String {
    match Snapshot::parse(name) {
        Ok(snapshot) if snapshot.prefix() == prefix => snapshot
            .created_local()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        _ => String::new(),
    }
}

async fn run_prune(ctx: &RunContext, zfs: &Zfs, targets: &[String]) -> usize {
    let policy = RetentionPolicy::from_config(&ctx.config);
    let mut failures = 0;
    for target in targets {
        let filesystem = Filesystem::new(zfs, target.as_str());
        let purge = match filesystem.ensure_exists().await {
            Ok(()) => policy.purge(&filesystem, zfs.now()).await,
            Err(e) => Err(e),
        };
        if !matches!(&purge, Ok(report) if report.failed.is_empty()) {
            failures += 1;
        }
        print_purge(target, &purge);
    }
    failures
}
