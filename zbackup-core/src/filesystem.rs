/*!
Filesystem nodes of the storage engine's hierarchical namespace.

A [`Filesystem`] is a name plus a borrowed engine session. Nodes are built
fresh for each logical operation; the parent of a node is derived from its
name, never stored.
*/

use crate::snapshot::{Snapshot, SnapshotList};
use crate::zfs::{Zfs, NOT_APPLICABLE};
use crate::{BackupError, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Reject target names repeated within one invocation
///
/// Malformed names are left to each target's own precheck so that one bad
/// name does not stop the others.
pub fn validate_targets(targets: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.as_str()) {
            return Err(BackupError::duplicate_target(target));
        }
    }
    Ok(())
}

/// Reject names that cannot denote a filesystem
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('@')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.contains("//")
    {
        return Err(BackupError::validation(format!(
            "invalid filesystem name '{name}'"
        )));
    }
    Ok(())
}

/// One node of the filesystem tree
pub struct Filesystem<'a> {
    zfs: &'a Zfs,
    name: String,
    mountpoint: Option<Option<PathBuf>>,
    provisional: Option<Snapshot>,
}

impl<'a> Filesystem<'a> {
    pub fn new<S: Into<String>>(zfs: &'a Zfs, name: S) -> Self {
        Self {
            zfs,
            name: name.into(),
            mountpoint: None,
            provisional: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Whether the node is in the run-scoped filesystem listing
    pub async fn exists(&self) -> Result<bool> {
        self.zfs.filesystem_exists(&self.name).await
    }

    /// Fail with `Validation` for a malformed name, `NotFound` unless the node exists
    pub async fn ensure_exists(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.exists().await? {
            Ok(())
        } else {
            Err(BackupError::filesystem_not_found(&self.name))
        }
    }

    /// Create this node and its missing parents; callers check `exists()` first
    pub async fn create(&self) -> Result<()> {
        info!(filesystem = %self.name, "creating filesystem");
        self.zfs.create(&self.name).await
    }

    /// The node `<self>/<name>`; this node must exist
    pub async fn open_child(&self, name: &str) -> Result<Filesystem<'a>> {
        validate_name(name)?;
        self.ensure_exists().await?;
        Ok(Filesystem::new(self.zfs, format!("{}/{name}", self.name)))
    }

    /// This node followed by every filesystem below it, parents first
    pub async fn descendants(&self) -> Result<Vec<Filesystem<'a>>> {
        Ok(self
            .zfs
            .list_filesystems(Some(&self.name), true)
            .await?
            .into_iter()
            .map(|name| Filesystem::new(self.zfs, name))
            .collect())
    }

    /// Snapshots of this node, oldest first
    ///
    /// A node that does not exist has no snapshots. With
    /// `include_provisional`, a snapshot taken by this node during a dry run
    /// is appended as if it had been created.
    pub async fn snapshot_list(&self, include_provisional: bool) -> Result<SnapshotList> {
        let mut snapshots = if self.exists().await? {
            self.zfs.list_snapshots(&self.name).await?
        } else {
            SnapshotList::new(self.name.clone(), Vec::new())
        };
        if include_provisional {
            if let Some(provisional) = &self.provisional {
                if !snapshots.contains(provisional.name()) {
                    snapshots.push(provisional.name().to_string());
                }
            }
        }
        Ok(snapshots)
    }

    /// Take a recursive snapshot named after the current time
    ///
    /// If a snapshot with the computed name already exists (two calls within
    /// one clock second), it is reused instead of created.
    pub async fn take_snapshot(&mut self) -> Result<Snapshot> {
        let snapshot = Snapshot::new(self.zfs.snapshot_prefix(), self.zfs.now())?;
        let existing = self.snapshot_list(true).await?;
        if existing.contains(snapshot.name()) {
            warn!(
                filesystem = %self.name,
                snapshot = %snapshot,
                "snapshot already exists, reusing it"
            );
            return Ok(snapshot);
        }

        info!(filesystem = %self.name, snapshot = %snapshot, "taking snapshot");
        self.zfs.snapshot(&self.name, snapshot.name()).await?;
        if self.zfs.is_dry_run() {
            self.provisional = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    /// Destroy one of this node's snapshots, recursively
    pub async fn destroy_snapshot(&self, snapshot: &str) -> Result<()> {
        info!(filesystem = %self.name, snapshot, "destroying snapshot");
        self.zfs.destroy(&self.name, snapshot).await
    }

    /// Size of sending `first` (or `first..last`), as reported by the engine
    pub async fn estimate_transfer_size(&self, first: &str, last: Option<&str>) -> Result<Option<String>> {
        self.zfs.estimate_send_size(&self.name, first, last).await
    }

    /// Send `first` alone, or the inclusive range `first..last`, into `target`
    pub async fn transfer(&self, target: &Filesystem<'_>, first: &str, last: Option<&str>) -> Result<()> {
        match last {
            Some(last) => info!(
                source = %self.name,
                target = %target.name,
                "sending incremental {first}..{last}"
            ),
            None => info!(source = %self.name, target = %target.name, "sending full {first}"),
        }
        self.zfs
            .send_receive(&self.name, first, last, &target.name)
            .await
    }

    /// Where the node's content is exposed, if it has a path mount point
    pub async fn mountpoint(&mut self) -> Result<Option<PathBuf>> {
        if let Some(cached) = &self.mountpoint {
            return Ok(cached.clone());
        }
        let values = self.zfs.get_property(&self.name, "mountpoint", false).await?;
        let value = values.first().ok_or_else(|| {
            BackupError::parse(format!("no mountpoint value for {}", self.name))
        })?;
        let resolved = value.starts_with('/').then(|| PathBuf::from(value));
        self.mountpoint = Some(resolved.clone());
        Ok(resolved)
    }

    /// True iff every mount state row, snapshots excluded, reads mounted
    pub async fn mounted(&self, recursive: bool) -> Result<bool> {
        let values = self.zfs.get_property(&self.name, "mounted", recursive).await?;
        let states: Vec<&String> = values.iter().filter(|v| *v != NOT_APPLICABLE).collect();
        if states.is_empty() {
            return Err(BackupError::parse(format!(
                "no mount state reported for {}",
                self.name
            )));
        }
        Ok(states.iter().all(|v| v.as_str() == "yes"))
    }
}
