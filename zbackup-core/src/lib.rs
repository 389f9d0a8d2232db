/*!
# zbackup core engine

Incremental snapshot backups for a ZFS-style copy-on-write storage engine.

This crate drives the engine's command-line interface to:

- Take timestamped recursive snapshots of primary filesystems
- Mirror them into an archive pool with full and incremental send/receive
- Thin old snapshots on an hourly/daily/weekly schedule
- Compare a primary's mounted content against its archive mirror

## Architecture

Every engine call goes through the [`Executor`] capability. The real
[`ProcessExecutor`] spawns piped child processes; the [`DryRunExecutor`]
only records what would have run. A [`RunContext`] built once at the entry
point decides which executor handles mutations.

## Usage

```rust,no_run
use zbackup_core::{backup_targets, BackupConfig, RunContext, Zfs};

# async fn run() -> zbackup_core::Result<()> {
let ctx = RunContext::new(BackupConfig::default(), false, false);
let zfs = Zfs::new(&ctx);
let targets = vec!["tank/home".to_string()];
for outcome in backup_targets(&ctx, &zfs, &targets, "backup", true).await {
    println!("{}: {}", outcome.target, outcome.is_success());
}
# Ok(())
# }
```
*/

pub mod backup;
pub mod clock;
pub mod config;
pub mod diff;
pub mod error;
pub mod filesystem;
pub mod observability;
pub mod pipeline;
pub mod retention;
pub mod snapshot;
pub mod zfs;

#[cfg(test)]
mod testing;

pub use backup::{backup_targets, BackupReport, BackupTask, TargetOutcome, Transfer};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{BackupConfig, RetentionConfig, RunContext};
pub use diff::{compare_trees, diff_target, DiffEntry, DiffKind, DiffOutcome};
pub use error::{BackupError, Result};
pub use filesystem::{validate_name, validate_targets, Filesystem};
pub use pipeline::{DryRunExecutor, Executor, Pipeline, ProcessExecutor, Stage, StderrPolicy};
pub use retention::{PurgeReport, RetentionPolicy};
pub use snapshot::{Generations, Snapshot, SnapshotList};
pub use zfs::Zfs;

/// Fail unless the process may mutate the storage engine
///
/// The engine only accepts snapshot, send/receive and destroy requests from
/// the superuser.
pub fn check_privileges() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(BackupError::Privilege(
            "zbackup must run as root to modify filesystems; use --dry-run to preview".to_string(),
        ))
    }
}
