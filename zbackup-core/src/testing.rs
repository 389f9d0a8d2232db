/*!
In-memory stand-in for the storage engine.

[`FakeZfs`] is an [`Executor`] that interprets the argument templates used by
[`crate::zfs::Zfs`] against a map of datasets, and records every command line
it receives.
*/

use crate::clock::FixedClock;
use crate::config::{BackupConfig, RunContext};
use crate::pipeline::{Executor, Pipeline, Stage};
use crate::{BackupError, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Dataset {
    snapshots: Vec<String>,
    mounted: bool,
    mountpoint: String,
}

impl Dataset {
    fn new(name: &str) -> Self {
        Self {
            snapshots: Vec::new(),
            mounted: true,
            mountpoint: format!("/{name}"),
        }
    }
}

pub struct FakeZfs {
    datasets: Mutex<BTreeMap<String, Dataset>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    clock: Arc<FixedClock>,
}

fn process_error(command: &str, message: impl Into<String>) -> BackupError {
    BackupError::Process {
        command: command.to_string(),
        status: "exit status: 1".to_string(),
        stderr: vec![message.into()],
    }
}

fn is_within(name: &str, root: &str) -> bool {
    name == root || name.starts_with(&format!("{root}/"))
}

fn split_target(target: &str) -> Option<(&str, &str)> {
    target.split_once('@')
}

impl FakeZfs {
    pub fn new() -> Self {
        Self {
            datasets: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            clock: Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            )),
        }
    }

    /// Run context wired to this fake and its clock
    pub fn context(self: &Arc<Self>, dry_run: bool) -> RunContext {
        self.context_with(BackupConfig::default(), dry_run)
    }

    pub fn context_with(self: &Arc<Self>, config: BackupConfig, dry_run: bool) -> RunContext {
        RunContext::with_parts(
            config,
            dry_run,
            false,
            self.clone(),
            self.clock.clone(),
        )
    }

    pub fn clock(&self) -> &FixedClock {
        &self.clock
    }

    pub fn add_filesystem(&self, name: &str) {
        self.datasets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Dataset::new(name));
    }

    pub fn add_snapshots(&self, name: &str, snapshots: &[&str]) {
        let mut datasets = self.datasets.lock().unwrap();
        let dataset = datasets
            .entry(name.to_string())
            .or_insert_with(|| Dataset::new(name));
        dataset
            .snapshots
            .extend(snapshots.iter().map(|s| s.to_string()));
    }

    pub fn set_mounted(&self, name: &str, mounted: bool) {
        if let Some(dataset) = self.datasets.lock().unwrap().get_mut(name) {
            dataset.mounted = mounted;
        }
    }

    pub fn set_mountpoint(&self, name: &str, mountpoint: &str) {
        if let Some(dataset) = self.datasets.lock().unwrap().get_mut(name) {
            dataset.mountpoint = mountpoint.to_string();
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.datasets.lock().unwrap().contains_key(name)
    }

    pub fn snapshots(&self, name: &str) -> Vec<String> {
        self.datasets
            .lock()
            .unwrap()
            .get(name)
            .map(|d| d.snapshots.clone())
            .unwrap_or_default()
    }

    /// Make every command line containing `pattern` fail
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls that would change engine state
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                let mut words = call.split_whitespace().skip(1);
                match words.next() {
                    Some("create" | "snapshot" | "destroy" | "receive") => true,
                    Some("send") => !words.any(|w| w == "-n") || call.contains("receive"),
                    _ => false,
                }
            })
            .collect()
    }

    /// Recorded send|receive pipelines
    pub fn transfers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(" receive "))
            .collect()
    }

    fn list(&self, line: &str, args: &[String]) -> Result<String> {
        let mut kind = "filesystem,volume".to_string();
        let mut recursive = false;
        let mut positional = Vec::new();
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-o" | "-s" | "-d" => {
                    iter.next();
                }
                "-t" => kind = iter.next().cloned().unwrap_or_default(),
                "-r" => recursive = true,
                "-H" => {}
                other => positional.push(other.to_string()),
            }
        }

        let datasets = self.datasets.lock().unwrap();
        let mut out = String::new();
        if kind == "snapshot" {
            let name = positional.first().cloned().unwrap_or_default();
            let dataset = datasets
                .get(&name)
                .ok_or_else(|| process_error(line, format!("cannot open '{name}': dataset does not exist")))?;
            for snapshot in &dataset.snapshots {
                out.push_str(&format!("{name}@{snapshot}\n"));
            }
            return Ok(out);
        }

        match positional.first() {
            Some(root) => {
                if !datasets.contains_key(root) {
                    return Err(process_error(line, format!("cannot open '{root}': dataset does not exist")));
                }
                for name in datasets.keys() {
                    if name == root || (recursive && is_within(name, root)) {
                        out.push_str(&format!("{name}\n"));
                    }
                }
            }
            None => {
                for name in datasets.keys() {
                    out.push_str(&format!("{name}\n"));
                }
            }
        }
        Ok(out)
    }

    fn create(&self, args: &[String]) -> Result<String> {
        let name = args.last().cloned().unwrap_or_default();
        let mut datasets = self.datasets.lock().unwrap();
        let mut current = name.as_str();
        loop {
            datasets
                .entry(current.to_string())
                .or_insert_with(|| Dataset::new(current));
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => break,
            }
        }
        Ok(String::new())
    }

    fn snapshot(&self, line: &str, args: &[String]) -> Result<String> {
        let target = args.last().cloned().unwrap_or_default();
        let (root, snapshot) = split_target(&target)
            .ok_or_else(|| process_error(line, "invalid snapshot name"))?;
        let mut datasets = self.datasets.lock().unwrap();
        if !datasets.contains_key(root) {
            return Err(process_error(line, format!("cannot open '{root}': dataset does not exist")));
        }
        if datasets[root].snapshots.iter().any(|s| s == snapshot) {
            return Err(process_error(line, format!("cannot create snapshot '{target}': dataset already exists")));
        }
        for (name, dataset) in datasets.iter_mut() {
            if is_within(name, root) {
                dataset.snapshots.push(snapshot.to_string());
            }
        }
        Ok(String::new())
    }

    fn destroy(&self, line: &str, args: &[String]) -> Result<String> {
        let target = args.last().cloned().unwrap_or_default();
        let (root, snapshot) = split_target(&target)
            .ok_or_else(|| process_error(line, "invalid snapshot name"))?;
        let mut datasets = self.datasets.lock().unwrap();
        let present = datasets
            .get(root)
            .map(|d| d.snapshots.iter().any(|s| s == snapshot))
            .unwrap_or(false);
        if !present {
            return Err(process_error(line, "could not find any snapshots to destroy; check snapshot names."));
        }
        for (name, dataset) in datasets.iter_mut() {
            if is_within(name, root) {
                dataset.snapshots.retain(|s| s != snapshot);
            }
        }
        Ok(String::new())
    }

    fn get(&self, line: &str, args: &[String]) -> Result<String> {
        let recursive = args.iter().any(|a| a == "-r");
        let name = args.last().cloned().unwrap_or_default();
        let property = args[args.len() - 2].clone();
        let datasets = self.datasets.lock().unwrap();
        if !datasets.contains_key(&name) {
            return Err(process_error(line, format!("cannot open '{name}': dataset does not exist")));
        }
        let mut out = String::new();
        for (dataset_name, dataset) in datasets.iter() {
            if dataset_name != &name && !(recursive && is_within(dataset_name, &name)) {
                continue;
            }
            let value = match property.as_str() {
                "mounted" if dataset.mounted => "yes".to_string(),
                "mounted" => "no".to_string(),
                "mountpoint" => dataset.mountpoint.clone(),
                _ => "-".to_string(),
            };
            out.push_str(&format!("{value}\n"));
            if recursive {
                for _ in &dataset.snapshots {
                    out.push_str("-\n");
                }
            }
        }
        Ok(out)
    }

    fn send_receive(&self, line: &str, send: &Stage, receive: &Stage) -> Result<String> {
        let send_args = send.args();
        let (first, last) = match send_args.iter().position(|a| a == "-I") {
            Some(i) => (send_args[i + 1].clone(), Some(send_args[i + 2].clone())),
            None => (send_args.last().cloned().unwrap_or_default(), None),
        };
        let (source, first) = split_target(&first)
            .map(|(fs, s)| (fs.to_string(), s.to_string()))
            .ok_or_else(|| process_error(line, "invalid send source"))?;
        let last = last.and_then(|l| split_target(&l).map(|(_, s)| s.to_string()));
        let target = receive.args().last().cloned().unwrap_or_default();

        let mut datasets = self.datasets.lock().unwrap();
        let sources: Vec<(String, Vec<String>)> = datasets
            .iter()
            .filter(|(name, _)| is_within(name, &source))
            .map(|(name, d)| (name.clone(), d.snapshots.clone()))
            .collect();
        if sources.is_empty() {
            return Err(process_error(line, format!("cannot open '{source}': dataset does not exist")));
        }

        for (name, snapshots) in sources {
            let target_name = format!("{target}{}", &name[source.len()..]);
            let start = snapshots
                .iter()
                .position(|s| *s == first)
                .ok_or_else(|| process_error(line, format!("snapshot '{name}@{first}' does not exist")))?;
            match &last {
                None => {
                    let dataset = datasets
                        .entry(target_name.clone())
                        .or_insert_with(|| Dataset::new(&target_name));
                    dataset.snapshots = vec![first.clone()];
                }
                Some(last) => {
                    let end = snapshots
                        .iter()
                        .position(|s| s == last)
                        .filter(|end| *end >= start)
                        .ok_or_else(|| process_error(line, format!("snapshot '{name}@{last}' does not follow '{first}'")))?;
                    let dataset = datasets.get_mut(&target_name).ok_or_else(|| {
                        process_error(line, format!("cannot receive incremental stream: destination '{target_name}' does not exist"))
                    })?;
                    let keep = dataset.snapshots.iter().position(|s| *s == first).ok_or_else(|| {
                        process_error(line, "cannot receive incremental stream: most recent snapshot does not match incremental source")
                    })?;
                    dataset.snapshots.truncate(keep + 1);
                    dataset
                        .snapshots
                        .extend(snapshots[start + 1..=end].iter().cloned());
                }
            }
        }
        Ok(String::new())
    }
}

#[async_trait]
impl Executor for FakeZfs {
    async fn run(&self, pipeline: &Pipeline) -> Result<String> {
        let line = pipeline.to_string();
        self.calls.lock().unwrap().push(line.clone());

        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| line.contains(pattern.as_str()))
        {
            return Err(process_error(&line, "injected failure"));
        }

        match pipeline.stages() {
            [send, receive] => self.send_receive(&line, send, receive),
            [stage] => {
                let args = stage.args();
                match args.first().map(String::as_str) {
                    Some("list") => self.list(&line, args),
                    Some("create") => self.create(args),
                    Some("snapshot") => self.snapshot(&line, args),
                    Some("destroy") => self.destroy(&line, args),
                    Some("get") => self.get(&line, args),
                    Some("send") if args.iter().any(|a| a == "-n") => {
                        Ok("total estimated size is 1.22K\n".to_string())
                    }
                    _ => Err(process_error(&line, "unsupported command")),
                }
            }
            _ => Err(process_error(&line, "unsupported pipeline")),
        }
    }
}
