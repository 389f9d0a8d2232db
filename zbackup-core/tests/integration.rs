/*!
Integration tests for the zbackup core, driven through the public API.
*/

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zbackup_core::{
    backup_targets, compare_trees, BackupConfig, DiffKind, Executor, FixedClock, Pipeline,
    ProcessExecutor, RetentionPolicy, RunContext, Snapshot, SnapshotList, Stage, Transfer, Zfs,
};

/// Answers read-only engine queries from canned output and records every call
struct CannedEngine {
    calls: Mutex<Vec<String>>,
}

impl CannedEngine {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for CannedEngine {
    async fn run(&self, pipeline: &Pipeline) -> zbackup_core::Result<String> {
        let line = pipeline.to_string();
        self.calls.lock().unwrap().push(line.clone());
        let output = if line.contains("-t filesystem,volume") {
            "tank\ntank/home\nbackup\nbackup/tank\n"
        } else if line.ends_with("-t snapshot -s creation -d 1 tank") {
            "tank@zbackup-2024-05-01-000000\ntank@zbackup-2024-05-02-000000\n"
        } else if line.ends_with("-t snapshot -s creation -d 1 backup/tank") {
            "backup/tank@zbackup-2024-05-01-000000\n"
        } else {
            panic!("unexpected engine call: {line}");
        };
        Ok(output.to_string())
    }
}

#[tokio::test]
async fn test_dry_run_backup_only_queries_the_engine() {
    let engine = Arc::new(CannedEngine::new());
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()));
    let ctx = RunContext::with_parts(BackupConfig::default(), true, false, engine.clone(), clock);
    let zfs = Zfs::new(&ctx);

    let outcomes = backup_targets(&ctx, &zfs, &["tank".to_string()], "backup", false).await;
    let report = outcomes[0].backup.as_ref().unwrap();

    assert_eq!(report.snapshot, "zbackup-2024-06-01-083000");
    assert_eq!(
        report.transfers,
        vec![Transfer::Incremental {
            from: "zbackup-2024-05-01-000000".to_string(),
            to: "zbackup-2024-06-01-083000".to_string(),
            size: None,
        }]
    );
    assert!(engine
        .calls()
        .iter()
        .all(|call| call.starts_with("zfs list ")));
    assert_eq!(
        ctx.dry_run_log().recorded(),
        vec![
            "zfs snapshot -r tank@zbackup-2024-06-01-083000".to_string(),
            "zfs send -R -I tank@zbackup-2024-05-01-000000 tank@zbackup-2024-06-01-083000 | zfs receive -F -x mountpoint backup/tank".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_process_pipeline_chains_real_processes() {
    let executor = ProcessExecutor::new();
    let pipeline = Pipeline::new(vec![
        Stage::new("sh", ["-c", "printf 'b\\na\\nc\\n'"]),
        Stage::new("sort", Vec::<String>::new()),
    ]);
    assert_eq!(executor.run(&pipeline).await.unwrap(), "a\nb\nc\n");

    let failing = Pipeline::single(Stage::new("sh", ["-c", "echo nope >&2; exit 3"]));
    let err = executor.run(&failing).await.unwrap_err();
    assert!(err.is_process());
    assert!(err.to_string().contains("nope"));
}

#[test]
fn test_snapshot_names_round_trip_through_listings() {
    let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
    let snapshot = Snapshot::new("nightly", at).unwrap();
    assert_eq!(snapshot.name(), "nightly-2023-12-31-235959");

    let parsed: Snapshot = snapshot.name().parse().unwrap();
    assert_eq!(parsed.created(), at);
    assert_eq!(parsed.prefix(), "nightly");

    let primary = SnapshotList::new(
        "tank",
        vec!["a".to_string(), "b".to_string(), snapshot.name().to_string()],
    );
    let mirror = SnapshotList::new("backup/tank", vec!["a".to_string(), "b".to_string()]);
    assert_eq!(primary.find_latest_common(&mirror), Some("b"));
}

#[test]
fn test_retention_keeps_one_snapshot_per_day() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let start = now - Duration::days(12);
    let names: Vec<String> = (0..40)
        .map(|i| {
            Snapshot::new("zbackup", start + Duration::hours(6) * i)
                .unwrap()
                .name()
                .to_string()
        })
        .collect();
    let list = SnapshotList::new("tank", names);

    let policy = RetentionPolicy::from_config(&BackupConfig::default());
    let plan = policy.plan(&list, now);
    assert_eq!(list.len() - plan.len(), 10);
    assert!(plan.iter().all(|s| s.created().format("%H").to_string() != "00"));
}

#[tokio::test]
async fn test_compare_trees_reports_added_and_modified() {
    let primary = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    std::fs::write(primary.path().join("kept.txt"), "same").unwrap();
    std::fs::write(archive.path().join("kept.txt"), "same").unwrap();
    std::fs::write(primary.path().join("edited.txt"), "after").unwrap();
    std::fs::write(archive.path().join("edited.txt"), "before").unwrap();
    std::fs::write(primary.path().join("created.txt"), "new").unwrap();

    let entries = compare_trees(primary.path(), archive.path(), &HashSet::new())
        .await
        .unwrap();
    let summary: Vec<(DiffKind, String)> = entries
        .iter()
        .map(|e| (e.kind, e.path.file_name().unwrap().to_string_lossy().into_owned()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (DiffKind::Added, "created.txt".to_string()),
            (DiffKind::Modified, "edited.txt".to_string()),
        ]
    );
    assert_eq!(entries[0].to_string(), format!("+ {}", primary.path().join("created.txt").display()));
}
