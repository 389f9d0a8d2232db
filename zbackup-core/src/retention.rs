/*!
Generational snapshot retention.

Snapshots younger than the hour window are all kept. Between the hour and
day windows, at most one snapshot per day survives. Beyond the day window,
at most one snapshot per week survives, and only the newest `max_weeks` of
those. Snapshots that do not carry this system's prefix are never touched.
*/

use crate::config::BackupConfig;
use crate::filesystem::Filesystem;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// Keep schedule derived from the retention configuration
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    prefix: String,
    hour_window: Duration,
    day_window: Duration,
    max_weeks: usize,
}

/// What one purge sweep did on a filesystem
#[derive(Debug)]
pub struct PurgeReport {
    pub filesystem: String,
    pub destroyed: Vec<String>,
    pub failed: Vec<(String, BackupError)>,
}

/// Keep the first snapshot of every `interval`, oldest first
///
/// Returns `(kept, expired)`. The watermark restarts from each kept
/// snapshot, so decimating an already decimated sequence expires nothing.
fn decimate(snapshots: Vec<Snapshot>, interval: Duration) -> (Vec<Snapshot>, Vec<Snapshot>) {
    let mut kept = Vec::new();
    let mut expired = Vec::new();
    let mut next_keep: Option<DateTime<Utc>> = None;

    for snapshot in snapshots {
        match next_keep {
            Some(watermark) if snapshot.created() < watermark => expired.push(snapshot),
            _ => {
                next_keep = Some(snapshot.created() + interval);
                kept.push(snapshot);
            }
        }
    }
    (kept, expired)
}

impl RetentionPolicy {
    pub fn new(prefix: impl Into<String>, hour_window: Duration, day_window: Duration, max_weeks: usize) -> Self {
        Self {
            prefix: prefix.into(),
            hour_window,
            day_window,
            max_weeks,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(
            config.snapshot_prefix.clone(),
            config.retention.hour_window(),
            config.retention.day_window(),
            config.retention.max_weeks as usize,
        )
    }

    /// Snapshots to destroy, oldest first
    pub fn plan(&self, snapshots: &SnapshotList, now: DateTime<Utc>) -> Vec<Snapshot> {
        let generations =
            snapshots.bucket_by_age(now, &self.prefix, self.hour_window, self.day_window);

        let (_, mut expired) = decimate(generations.middle, Duration::days(1));
        let (weekly, mut old_expired) = decimate(generations.old, Duration::weeks(1));

        // The cap applies to weekly survivors, never to the decimated input.
        let excess = weekly.len().saturating_sub(self.max_weeks);
        old_expired.extend(weekly.into_iter().take(excess));
        old_expired.sort_by_key(Snapshot::created);

        debug!(
            filesystem = snapshots.filesystem(),
            young = generations.young.len(),
            expired = expired.len() + old_expired.len(),
            "planned retention"
        );
        old_expired.append(&mut expired);
        old_expired
    }

    /// Destroy every planned snapshot of `filesystem`
    ///
    /// Each destroy is attempted even if an earlier one failed; failures are
    /// collected in the report.
    pub async fn purge(&self, filesystem: &Filesystem<'_>, now: DateTime<Utc>) -> Result<PurgeReport> {
        let snapshots = filesystem.snapshot_list(false).await?;
        let plan = self.plan(&snapshots, now);
        let mut report = PurgeReport {
            filesystem: filesystem.name().to_string(),
            destroyed: Vec::new(),
            failed: Vec::new(),
        };
        if plan.is_empty() {
            info!(filesystem = %filesystem.name(), "nothing to prune");
            return Ok(report);
        }

        info!(filesystem = %filesystem.name(), count = plan.len(), "pruning snapshots");
        for snapshot in plan {
            match filesystem.destroy_snapshot(snapshot.name()).await {
                Ok(()) => report.destroyed.push(snapshot.name().to_string()),
                Err(e) => {
                    warn!(filesystem = %filesystem.name(), snapshot = %snapshot, "destroy failed: {e}");
                    report.failed.push((snapshot.name().to_string(), e));
                }
            }
        }
        Ok(report)
    }
}
