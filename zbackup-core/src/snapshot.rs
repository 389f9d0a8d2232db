/*!
Snapshot identifiers and per-filesystem snapshot lists.

Every snapshot this system creates is named
`<prefix>-<YYYY>-<MM>-<DD>-<HHMMSS>`, the timestamp being the UTC creation
time. [`Snapshot`] is the only way to hold such a name; it validates on
construction. Listings from the storage engine may also contain foreign
snapshots, so [`SnapshotList`] keeps the raw names and only yields
[`Snapshot`] values for entries that follow the grammar.
*/

use crate::{BackupError, Result};
use chrono::{DateTime, Duration, Local, NaiveDateTime, Timelike, Utc};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// chrono format of the timestamp suffix
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Length of `YYYY-MM-DD-HHMMSS`
const SUFFIX_LEN: usize = 17;

pub(crate) fn is_prefix_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

fn is_suffix_shape(suffix: &[u8]) -> bool {
    suffix.len() == SUFFIX_LEN
        && suffix.iter().enumerate().all(|(i, b)| match i {
            4 | 7 | 10 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// A validated snapshot name with its embedded creation time
#[derive(Debug, Clone)]
pub struct Snapshot {
    name: String,
    prefix_len: usize,
    created: DateTime<Utc>,
}

impl Snapshot {
    /// Build the canonical snapshot for `prefix` taken at `at` (truncated to whole seconds)
    pub fn new(prefix: &str, at: DateTime<Utc>) -> Result<Self> {
        if prefix.is_empty() || !prefix.chars().all(is_prefix_char) {
            return Err(BackupError::validation(format!(
                "invalid snapshot prefix '{prefix}'"
            )));
        }
        let created = at.with_nanosecond(0).unwrap_or(at);
        Ok(Self {
            name: format!("{prefix}-{}", created.format(TIMESTAMP_FORMAT)),
            prefix_len: prefix.len(),
            created,
        })
    }

    /// Parse a snapshot name, failing on anything outside the naming grammar
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || BackupError::validation(format!("invalid snapshot name '{name}'"));

        let bytes = name.as_bytes();
        if bytes.len() < SUFFIX_LEN + 2 {
            return Err(invalid());
        }
        let split = bytes.len() - SUFFIX_LEN;
        let (head, suffix) = bytes.split_at(split);
        if !is_suffix_shape(suffix) || head.last() != Some(&b'-') {
            return Err(invalid());
        }
        let prefix = &name[..split - 1];
        if !prefix.chars().all(is_prefix_char) {
            return Err(invalid());
        }

        let created = NaiveDateTime::parse_from_str(&name[split..], TIMESTAMP_FORMAT)
            .map_err(|_| invalid())?
            .and_utc();

        Ok(Self {
            name: name.to_string(),
            prefix_len: prefix.len(),
            created,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.name[..self.prefix_len]
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Creation time in the operator's timezone
    pub fn created_local(&self) -> DateTime<Local> {
        self.created.with_timezone(&Local)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Snapshot {}

impl Hash for Snapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for Snapshot {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Snapshots of one filesystem split by age
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generations {
    pub young: Vec<Snapshot>,
    pub middle: Vec<Snapshot>,
    pub old: Vec<Snapshot>,
}

/// Snapshot names of one filesystem in ascending creation order
///
/// The order comes from the storage engine's listing and is never re-sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotList {
    filesystem: String,
    names: Vec<String>,
}

impl SnapshotList {
    pub fn new<S: Into<String>>(filesystem: S, names: Vec<String>) -> Self {
        Self {
            filesystem: filesystem.into(),
            names,
        }
    }

    pub fn filesystem(&self) -> &str {
        &self.filesystem
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub(crate) fn push(&mut self, name: String) {
        self.names.push(name);
    }

    pub fn earliest(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn latest(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// The last name in this list's own order that `other` also contains
    pub fn find_latest_common(&self, other: &SnapshotList) -> Option<&str> {
        let theirs: HashSet<&str> = other.names.iter().map(String::as_str).collect();
        self.names
            .iter()
            .rev()
            .map(String::as_str)
            .find(|name| theirs.contains(name))
    }

    /// Entries that follow the naming grammar with the given prefix, in list order
    pub fn owned_snapshots<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = Snapshot> + 'a {
        self.names
            .iter()
            .filter_map(|name| Snapshot::parse(name).ok())
            .filter(move |snapshot| snapshot.prefix() == prefix)
    }

    /// Split this system's own snapshots into young, middle and old generations
    ///
    /// young: age < `hour_window`; middle: `hour_window` <= age < `day_window`;
    /// old: age >= `day_window`. Foreign names land in no generation.
    pub fn bucket_by_age(
        &self,
        now: DateTime<Utc>,
        prefix: &str,
        hour_window: Duration,
        day_window: Duration,
    ) -> Generations {
        let mut generations = Generations::default();
        for snapshot in self.owned_snapshots(prefix) {
            let age = snapshot.age(now);
            if age < hour_window {
                generations.young.push(snapshot);
            } else if age < day_window {
                generations.middle.push(snapshot);
            } else {
                generations.old.push(snapshot);
            }
        }
        generations
    }
}
