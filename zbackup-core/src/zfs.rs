/*!
Client for the external snapshot-capable storage engine.

Each method maps one request of the engine's line-oriented text protocol to
a fixed argument template and parses what comes back. Read-only requests go
through the query executor; requests that change engine state go through
the mutation executor, which is the dry-run recorder when the run is a dry
run.
*/

use crate::clock::Clock;
use crate::config::RunContext;
use crate::observability::{self, MetricEvent};
use crate::pipeline::{Executor, Pipeline, Stage, StderrPolicy};
use crate::snapshot::SnapshotList;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Value reported for properties that do not apply, e.g. `mounted` on a snapshot
pub const NOT_APPLICABLE: &str = "-";

/// Split engine output into lines; empty output yields an empty list
pub fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Last whitespace-delimited token of a dry-run send, e.g. `1.22K`
pub fn parse_size_token(output: &str) -> Result<String> {
    output
        .split_whitespace()
        .last()
        .map(str::to_string)
        .ok_or_else(|| BackupError::parse("transfer size estimate produced no output"))
}

/// Parse `filesystem@snapshot` rows belonging to `filesystem`
pub fn parse_snapshot_rows(filesystem: &str, output: &str) -> Result<SnapshotList> {
    let mut names = Vec::new();
    for line in parse_lines(output) {
        match line.split_once('@') {
            Some((owner, name)) if owner == filesystem && !name.is_empty() => {
                names.push(name.to_string())
            }
            _ => {
                return Err(BackupError::parse(format!(
                    "unexpected snapshot row '{line}' while listing {filesystem}"
                )))
            }
        }
    }
    Ok(SnapshotList::new(filesystem, names))
}

/// Session with the storage engine for one run
pub struct Zfs {
    command: String,
    prefix: String,
    dry_run: bool,
    verbose: bool,
    query: Arc<dyn Executor>,
    mutate: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    known: Mutex<Option<HashSet<String>>>,
}

impl Zfs {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            command: ctx.config.engine_command.clone(),
            prefix: ctx.config.snapshot_prefix.clone(),
            dry_run: ctx.dry_run,
            verbose: ctx.verbose,
            query: ctx.query_executor(),
            mutate: ctx.mutation_executor(),
            clock: ctx.clock(),
            known: Mutex::new(None),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn snapshot_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn stage<I, S>(&self, args: I) -> Stage
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Stage::new(self.command.clone(), args)
    }

    async fn query(&self, stage: Stage) -> Result<String> {
        self.query.run(&Pipeline::single(stage)).await
    }

    /// Run a state-changing request and count it once it has really happened
    async fn mutate(&self, pipeline: Pipeline, event: Option<MetricEvent>) -> Result<String> {
        let result = self.mutate.run(&pipeline).await;
        match &result {
            Ok(_) => {
                if let Some(event) = self.counted(event) {
                    observability::record(event);
                }
            }
            Err(_) => observability::record(MetricEvent::CommandFailed),
        }
        result
    }

    /// Dry runs change nothing, so they count nothing
    fn counted(&self, event: Option<MetricEvent>) -> Option<MetricEvent> {
        event.filter(|_| !self.dry_run)
    }

    /// List filesystem names, optionally below `root` and optionally recursive
    pub async fn list_filesystems(&self, root: Option<&str>, recursive: bool) -> Result<Vec<String>> {
        let mut args = vec!["list", "-H", "-o", "name", "-t", "filesystem,volume"];
        if recursive {
            args.push("-r");
        }
        args.extend(root);
        Ok(parse_lines(&self.query(self.stage(args)).await?))
    }

    /// Whether `name` is in the run-scoped listing of all filesystems
    ///
    /// The listing is fetched once per session so that every check in a run
    /// sees the same view of the engine.
    pub async fn filesystem_exists(&self, name: &str) -> Result<bool> {
        if let Some(known) = self.known.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(known.contains(name));
        }
        let listed: HashSet<String> = self.list_filesystems(None, false).await?.into_iter().collect();
        debug!(count = listed.len(), "cached filesystem listing");
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        Ok(known.get_or_insert(listed).contains(name))
    }

    fn remember(&self, name: &str) {
        if let Some(known) = self.known.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            let mut current = name;
            known.insert(current.to_string());
            while let Some((parent, _)) = current.rsplit_once('/') {
                known.insert(parent.to_string());
                current = parent;
            }
        }
    }

    /// All snapshots of one filesystem, oldest first
    pub async fn list_snapshots(&self, filesystem: &str) -> Result<SnapshotList> {
        let output = self
            .query(self.stage([
                "list", "-H", "-o", "name", "-t", "snapshot", "-s", "creation", "-d", "1",
                filesystem,
            ]))
            .await?;
        parse_snapshot_rows(filesystem, &output)
    }

    /// Create a filesystem and any missing parents
    pub async fn create(&self, filesystem: &str) -> Result<()> {
        self.mutate(Pipeline::single(self.stage(["create", "-p", filesystem])), None)
            .await?;
        if !self.dry_run {
            self.remember(filesystem);
        }
        Ok(())
    }

    /// Recursively snapshot a filesystem tree
    pub async fn snapshot(&self, filesystem: &str, snapshot: &str) -> Result<()> {
        let target = format!("{filesystem}@{snapshot}");
        self.mutate(
            Pipeline::single(self.stage(["snapshot", "-r", target.as_str()])),
            Some(MetricEvent::SnapshotTaken),
        )
        .await?;
        Ok(())
    }

    /// Recursively destroy one snapshot
    pub async fn destroy(&self, filesystem: &str, snapshot: &str) -> Result<()> {
        let target = format!("{filesystem}@{snapshot}");
        self.mutate(
            Pipeline::single(self.stage(["destroy", "-r", target.as_str()])),
            Some(MetricEvent::SnapshotDestroyed),
        )
        .await?;
        Ok(())
    }

    fn send_args(&self, filesystem: &str, first: &str, last: Option<&str>, plan_only: bool) -> Vec<String> {
        let mut args = vec!["send".to_string()];
        if plan_only {
            args.push("-n".to_string());
        }
        if plan_only || self.verbose {
            args.push("-v".to_string());
        }
        args.push("-R".to_string());
        match last {
            Some(last) => {
                args.push("-I".to_string());
                args.push(format!("{filesystem}@{first}"));
                args.push(format!("{filesystem}@{last}"));
            }
            None => args.push(format!("{filesystem}@{first}")),
        }
        args
    }

    /// Human-readable size of a planned transfer, `None` in dry-run mode
    pub async fn estimate_send_size(
        &self,
        filesystem: &str,
        first: &str,
        last: Option<&str>,
    ) -> Result<Option<String>> {
        if self.dry_run {
            return Ok(None);
        }
        let output = self
            .query(self.stage(self.send_args(filesystem, first, last, true)))
            .await?;
        parse_size_token(&output).map(Some)
    }

    /// Stream a snapshot, or the inclusive range `first..last`, into `target`
    pub async fn send_receive(
        &self,
        filesystem: &str,
        first: &str,
        last: Option<&str>,
        target: &str,
    ) -> Result<()> {
        let send = self
            .stage(self.send_args(filesystem, first, last, false))
            .with_stderr(if self.verbose {
                StderrPolicy::Forward
            } else {
                StderrPolicy::Log
            });
        let receive = self
            .stage(["receive", "-F", "-x", "mountpoint", target])
            .with_stderr(StderrPolicy::Log)
            .with_echo(self.verbose);
        self.mutate(Pipeline::new(vec![send, receive]), Some(MetricEvent::Transfer))
            .await?;
        Ok(())
    }

    /// Values of one property, one row per matched object
    pub async fn get_property(&self, filesystem: &str, property: &str, recursive: bool) -> Result<Vec<String>> {
        let mut args = vec!["get", "-H", "-o", "value"];
        if recursive {
            args.push("-r");
        }
        args.extend([property, filesystem]);
        Ok(parse_lines(&self.query(self.stage(args)).await?))
    }
}
