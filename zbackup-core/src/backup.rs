/*!
Backup orchestration.

For every (primary, archive root) pair the orchestrator:
1. resolves or creates the archive mirror `<archive root>/<primary>`,
2. takes a new snapshot on the primary,
3. lists both sides and looks for the latest common snapshot,
4. sends the primary's earliest snapshot as a full baseline if there is none,
5. stops if the common snapshot is already the primary's latest,
6. otherwise sends the range `common..latest` incrementally.

Targets are processed one at a time, in the order given.
*/

use crate::config::RunContext;
use crate::filesystem::Filesystem;
use crate::retention::{PurgeReport, RetentionPolicy};
use crate::zfs::Zfs;
use crate::{BackupError, Result};
use tracing::{error, info};

/// One transfer performed (or simulated) for a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// A single snapshot sent as a baseline
    Full { snapshot: String, size: Option<String> },
    /// The inclusive range `from..to`
    Incremental {
        from: String,
        to: String,
        size: Option<String>,
    },
}

/// What a backup did for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub primary: String,
    pub mirror: String,
    pub snapshot: String,
    pub transfers: Vec<Transfer>,
}

impl BackupReport {
    pub fn is_up_to_date(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Backup of one primary filesystem into an archive root
pub struct BackupTask<'a> {
    zfs: &'a Zfs,
    primary: String,
    archive_root: String,
}

impl<'a> BackupTask<'a> {
    pub fn new(zfs: &'a Zfs, primary: impl Into<String>, archive_root: impl Into<String>) -> Self {
        Self {
            zfs,
            primary: primary.into(),
            archive_root: archive_root.into(),
        }
    }

    /// Both filesystems must exist before anything is changed
    pub async fn precheck(&self) -> Result<()> {
        Filesystem::new(self.zfs, self.primary.as_str())
            .ensure_exists()
            .await?;
        Filesystem::new(self.zfs, self.archive_root.as_str())
            .ensure_exists()
            .await
    }

    pub async fn run(&self) -> Result<BackupReport> {
        self.precheck().await?;

        let mut primary = Filesystem::new(self.zfs, self.primary.as_str());
        let archive_root = Filesystem::new(self.zfs, self.archive_root.as_str());
        let mirror = archive_root.open_child(primary.name()).await?;
        if !mirror.exists().await? {
            mirror.create().await?;
        }

        let taken = primary.take_snapshot().await?;

        let primary_snapshots = primary.snapshot_list(true).await?;
        let mirror_snapshots = mirror.snapshot_list(false).await?;
        let mut transfers = Vec::new();

        let common = match primary_snapshots.find_latest_common(&mirror_snapshots) {
            Some(common) => common.to_string(),
            None => {
                let earliest = primary_snapshots.earliest().ok_or_else(|| {
                    BackupError::parse(format!("{} lists no snapshots after snapshotting", primary.name()))
                })?;
                info!(primary = %primary.name(), "no common snapshot with {}, sending baseline", mirror.name());
                let size = primary.estimate_transfer_size(earliest, None).await?;
                log_size(&size);
                primary.transfer(&mirror, earliest, None).await?;
                transfers.push(Transfer::Full {
                    snapshot: earliest.to_string(),
                    size,
                });
                earliest.to_string()
            }
        };

        let latest = primary_snapshots.latest().unwrap_or(common.as_str());
        if latest == common {
            info!(primary = %primary.name(), "{} is up to date", mirror.name());
        } else {
            let size = primary.estimate_transfer_size(&common, Some(latest)).await?;
            log_size(&size);
            primary.transfer(&mirror, &common, Some(latest)).await?;
            transfers.push(Transfer::Incremental {
                from: common.clone(),
                to: latest.to_string(),
                size,
            });
        }

        Ok(BackupReport {
            primary: primary.name().to_string(),
            mirror: mirror.name().to_string(),
            snapshot: taken.name().to_string(),
            transfers,
        })
    }
}

fn log_size(size: &Option<String>) {
    match size {
        Some(size) => info!("estimated transfer size: {size}"),
        None => info!("estimated transfer size: unknown (dry run)"),
    }
}

/// Outcome for one target of a multi-target run
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: String,
    pub backup: Result<BackupReport>,
    pub purges: Vec<Result<PurgeReport>>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.backup.is_ok()
            && self
                .purges
                .iter()
                .all(|p| matches!(p, Ok(report) if report.failed.is_empty()))
    }
}

/// Back up every target in order; a failing target does not stop the others
///
/// With `prune`, a successful backup is followed by the retention policy on
/// the primary and on its mirror.
pub async fn backup_targets(
    ctx: &RunContext,
    zfs: &Zfs,
    targets: &[String],
    archive_root: &str,
    prune: bool,
) -> Vec<TargetOutcome> {
    let policy = RetentionPolicy::from_config(&ctx.config);
    let mut outcomes = Vec::with_capacity(targets.len());

    for target in targets {
        let backup = BackupTask::new(zfs, target.as_str(), archive_root).run().await;
        let mut purges = Vec::new();
        match &backup {
            Ok(report) if prune => {
                for name in [&report.primary, &report.mirror] {
                    let filesystem = Filesystem::new(zfs, name.as_str());
                    purges.push(policy.purge(&filesystem, zfs.now()).await);
                }
            }
            Ok(_) => {}
            Err(e) => error!(target = %target, "backup failed: {e}"),
        }
        outcomes.push(TargetOutcome {
            target: target.clone(),
            backup,
            purges,
        });
    }
    outcomes
}
