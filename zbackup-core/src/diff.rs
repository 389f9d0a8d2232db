/*!
Content comparison between a primary filesystem tree and its archive mirror.

Each filesystem node of the primary is compared against its counterpart
under the mirror by walking both mount points. Regular files are compared
by SHA-256 digest of their full content, symbolic links by target.
*/

use crate::filesystem::Filesystem;
use crate::zfs::Zfs;
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fmt;
use std::fs::FileType;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
}

impl DiffKind {
    fn marker(self) -> char {
        match self {
            DiffKind::Added => '+',
            DiffKind::Removed => '-',
            DiffKind::Modified => '~',
        }
    }
}

/// One difference, located by its path on the primary side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub kind: DiffKind,
    pub path: PathBuf,
}

impl DiffEntry {
    fn new(kind: DiffKind, path: PathBuf) -> Self {
        Self { kind, path }
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.marker(), self.path.display())
    }
}

/// Result of diffing one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// The mirror does not exist yet
    NotArchived { mirror: String },
    /// Differences found, plus nodes that could not be compared
    Compared {
        entries: Vec<DiffEntry>,
        skipped: Vec<String>,
        /// Filesystems whose trees were actually walked
        compared: usize,
    },
}

impl DiffOutcome {
    /// Every filesystem was compared and none differed
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            DiffOutcome::Compared { entries, skipped, .. } if entries.is_empty() && skipped.is_empty()
        )
    }

    /// The mirror exists but no filesystem could be walked
    pub fn compared_nothing(&self) -> bool {
        matches!(self, DiffOutcome::Compared { compared: 0, skipped, .. } if !skipped.is_empty())
    }
}

/// SHA-256 of a file's content as lowercase hex
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn read_entries(dir: &Path) -> Result<BTreeMap<OsString, FileType>> {
    let mut entries = BTreeMap::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        entries.insert(entry.file_name(), entry.file_type().await?);
    }
    Ok(entries)
}

async fn same_content(primary: &Path, archive: &Path, kind: FileType) -> Result<bool> {
    if kind.is_symlink() {
        let (a, b) = futures::try_join!(tokio::fs::read_link(primary), tokio::fs::read_link(archive))?;
        return Ok(a == b);
    }
    let (a, b) = futures::try_join!(hash_file(primary), hash_file(archive))?;
    Ok(a == b)
}

/// Walk two directory trees and report how `primary_root` differs from
/// `archive_root`
///
/// Paths in `excluded` are relative to both roots and are not entered on
/// either side. Reported paths are under `primary_root`. A directory present
/// on one side only is reported once, without its content.
pub async fn compare_trees(
    primary_root: &Path,
    archive_root: &Path,
    excluded: &HashSet<PathBuf>,
) -> Result<Vec<DiffEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let primary_dir = primary_root.join(&relative);
        let archive_dir = archive_root.join(&relative);
        let mut primary = read_entries(&primary_dir).await?;
        let archive = read_entries(&archive_dir).await?;

        let mut subdirs = Vec::new();
        for (name, archive_type) in archive {
            let path = relative.join(&name);
            if excluded.contains(&path) {
                primary.remove(&name);
                continue;
            }
            let Some(primary_type) = primary.remove(&name) else {
                entries.push(DiffEntry::new(DiffKind::Removed, primary_root.join(&path)));
                continue;
            };

            if primary_type.is_dir() && archive_type.is_dir() {
                subdirs.push(path);
            } else if primary_type.is_dir() != archive_type.is_dir()
                || primary_type.is_symlink() != archive_type.is_symlink()
            {
                entries.push(DiffEntry::new(DiffKind::Modified, primary_root.join(&path)));
            } else if (primary_type.is_file() || primary_type.is_symlink())
                && !same_content(&primary_dir.join(&name), &archive_dir.join(&name), primary_type).await?
            {
                entries.push(DiffEntry::new(DiffKind::Modified, primary_root.join(&path)));
            }
        }

        for name in primary.into_keys() {
            let path = relative.join(&name);
            if !excluded.contains(&path) {
                entries.push(DiffEntry::new(DiffKind::Added, primary_root.join(&path)));
            }
        }

        // Reverse so the lexicographically first directory is walked next.
        pending.extend(subdirs.into_iter().rev());
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));
    Ok(entries)
}

/// Compare every filesystem of `primary` with its mirror under `archive_root`
pub async fn diff_target(zfs: &Zfs, primary: &str, archive_root: &str) -> Result<DiffOutcome> {
    let primary_node = Filesystem::new(zfs, primary);
    primary_node.ensure_exists().await?;
    let archive_node = Filesystem::new(zfs, archive_root);
    let mirror = archive_node.open_child(primary).await?;
    if !mirror.exists().await? {
        info!(primary, "{} is not yet archived", mirror.name());
        return Ok(DiffOutcome::NotArchived {
            mirror: mirror.name().to_string(),
        });
    }

    let mut nodes = Vec::new();
    for mut node in primary_node.descendants().await? {
        let mountpoint = node.mountpoint().await?;
        nodes.push((node, mountpoint));
    }

    let mut entries = Vec::new();
    let mut skipped = Vec::new();
    let mut added: Vec<String> = Vec::new();
    let mut compared = 0;

    for (node, mountpoint) in &nodes {
        if added
            .iter()
            .any(|parent| node.name().starts_with(&format!("{parent}/")))
        {
            continue;
        }

        let relative = node.name()[primary.len()..].to_string();
        let mut counterpart = Filesystem::new(zfs, format!("{}{relative}", mirror.name()));
        if !counterpart.exists().await? {
            let path = mountpoint
                .clone()
                .unwrap_or_else(|| PathBuf::from(node.name()));
            entries.push(DiffEntry::new(DiffKind::Added, path));
            added.push(node.name().to_string());
            continue;
        }

        let Some(primary_root) = mountpoint else {
            debug!(filesystem = %node.name(), "no mount point, skipping");
            skipped.push(node.name().to_string());
            continue;
        };
        let archive_mount = counterpart.mountpoint().await?;
        let both_mounted = node.mounted(false).await? && counterpart.mounted(false).await?;
        let archive_root = match archive_mount {
            Some(path) if both_mounted => path,
            _ => {
                warn!(filesystem = %node.name(), "not mounted on both sides, skipping");
                skipped.push(node.name().to_string());
                continue;
            }
        };

        // Child filesystems are compared on their own.
        let excluded: HashSet<PathBuf> = nodes
            .iter()
            .filter_map(|(_, other)| other.as_deref())
            .filter_map(|other| other.strip_prefix(primary_root).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();

        debug!(
            filesystem = %node.name(),
            primary = %primary_root.display(),
            archive = %archive_root.display(),
            "comparing trees"
        );
        entries.extend(compare_trees(primary_root, &archive_root, &excluded).await?);
        compared += 1;
    }

    Ok(DiffOutcome::Compared {
        entries,
        skipped,
        compared,
    })
}
