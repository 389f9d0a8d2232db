//! Configuration and run context
//!
//! This module provides the configuration structures loaded once at the
//! entry point and the [`RunContext`] that carries them, together with the
//! selected executor and clock, into every component of a run.

use crate::clock::{Clock, SystemClock};
use crate::pipeline::{DryRunExecutor, Executor, ProcessExecutor};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Generational keep schedule applied by the retention policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Snapshots younger than this many hours are never touched
    pub hour_window_hours: u32,
    /// Snapshots younger than this many days keep one per day; older keep one per week
    pub day_window_days: u32,
    /// Maximum number of weekly snapshots kept in the old generation
    pub max_weeks: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hour_window_hours: 24,
            day_window_days: 30,
            max_weeks: 104,
        }
    }
}

impl RetentionConfig {
    pub fn hour_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hour_window_hours))
    }

    pub fn day_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.day_window_days))
    }
}

/// Top-level configuration, optionally loaded from a JSON file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Executable of the snapshot-capable storage engine
    pub engine_command: String,
    /// Prefix of every snapshot name this system creates and prunes
    pub snapshot_prefix: String,
    pub retention: RetentionConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            engine_command: "zfs".to_string(),
            snapshot_prefix: "zbackup".to_string(),
            retention: RetentionConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Load configuration from a JSON file, or return the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine_command.trim().is_empty() {
            return Err(BackupError::validation("engine command must not be empty"));
        }
        if self.snapshot_prefix.is_empty() {
            return Err(BackupError::validation("snapshot prefix must not be empty"));
        }
        if let Some(c) = self
            .snapshot_prefix
            .chars()
            .find(|c| !crate::snapshot::is_prefix_char(*c))
        {
            return Err(BackupError::validation(format!(
                "snapshot prefix '{}' contains invalid character '{c}'",
                self.snapshot_prefix
            )));
        }
        let hours_in_day_window = u64::from(self.retention.day_window_days) * 24;
        if hours_in_day_window <= u64::from(self.retention.hour_window_hours) {
            return Err(BackupError::validation(
                "retention day window must be longer than the hour window",
            ));
        }
        if self.retention.max_weeks == 0 {
            return Err(BackupError::validation(
                "retention week cap must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Everything one invocation needs, constructed once at the entry point
pub struct RunContext {
    pub config: BackupConfig,
    pub dry_run: bool,
    pub verbose: bool,
    executor: Arc<dyn Executor>,
    dry_run_executor: Arc<DryRunExecutor>,
    clock: Arc<dyn Clock>,
}

impl RunContext {
    /// Context that runs real processes against the system clock
    pub fn new(config: BackupConfig, dry_run: bool, verbose: bool) -> Self {
        Self::with_parts(
            config,
            dry_run,
            verbose,
            Arc::new(ProcessExecutor::new()),
            Arc::new(SystemClock),
        )
    }

    /// Context with an injected executor and clock
    pub fn with_parts(
        config: BackupConfig,
        dry_run: bool,
        verbose: bool,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            dry_run,
            verbose,
            executor,
            dry_run_executor: Arc::new(DryRunExecutor::new()),
            clock,
        }
    }

    /// Executor for read-only queries; these run even in dry-run mode
    pub fn query_executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    /// Executor for commands that mutate the storage engine
    pub fn mutation_executor(&self) -> Arc<dyn Executor> {
        if self.dry_run {
            let recorder: Arc<dyn Executor> = self.dry_run_executor.clone();
            recorder
        } else {
            Arc::clone(&self.executor)
        }
    }

    /// The recorder behind the dry-run path
    pub fn dry_run_log(&self) -> &DryRunExecutor {
        &self.dry_run_executor
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}
