/*!
Observability infrastructure for zbackup.

This module provides:
- Structured logging setup through `tracing-subscriber`
- Prometheus counters for snapshots, transfers, prunes and failed commands
  (behind the `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::{BackupError, Result};

/// Events counted by the metrics registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    SnapshotTaken,
    Transfer,
    SnapshotDestroyed,
    CommandFailed,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Counters for engine operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub snapshots_taken_total: IntCounter,
    pub transfers_total: IntCounter,
    pub snapshots_destroyed_total: IntCounter,
    pub command_failures_total: IntCounter,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(|e| {
                BackupError::validation(format!("Failed to create {name} metric: {e}"))
            })?;
            registry.register(Box::new(counter.clone())).map_err(|e| {
                BackupError::validation(format!("Failed to register {name}: {e}"))
            })?;
            Ok(counter)
        };

        Ok(Self {
            snapshots_taken_total: counter(
                "zbackup_snapshots_taken_total",
                "Snapshots created on primary filesystems",
            )?,
            transfers_total: counter(
                "zbackup_transfers_total",
                "Send/receive transfers completed",
            )?,
            snapshots_destroyed_total: counter(
                "zbackup_snapshots_destroyed_total",
                "Snapshots destroyed by the retention policy",
            )?,
            command_failures_total: counter(
                "zbackup_command_failures_total",
                "Mutating engine commands that failed",
            )?,
            registry,
        })
    }

    /// Get or initialize the metrics registry
    pub fn global() -> &'static BackupMetrics {
        METRICS.get_or_init(|| match Self::new() {
            Ok(metrics) => metrics,
            Err(e) => panic!("Failed to initialize zbackup metrics: {e}"),
        })
    }

    pub fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::SnapshotTaken => self.snapshots_taken_total.inc(),
            MetricEvent::Transfer => self.transfers_total.inc(),
            MetricEvent::SnapshotDestroyed => self.snapshots_destroyed_total.inc(),
            MetricEvent::CommandFailed => self.command_failures_total.inc(),
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| BackupError::validation(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| BackupError::parse(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Count an event; a no-op without the `metrics` feature
pub fn record(event: MetricEvent) {
    #[cfg(feature = "metrics")]
    BackupMetrics::global().record(event);
    #[cfg(not(feature = "metrics"))]
    let _ = event;
}

/// Prometheus exposition of all counters, if metrics are compiled in
pub fn metrics_text() -> Result<Option<String>> {
    #[cfg(feature = "metrics")]
    return BackupMetrics::global().gather_metrics().map(Some);
    #[cfg(not(feature = "metrics"))]
    Ok(None)
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise `debug` when `verbose`, `info`
/// when not. With `json` set, events are emitted as JSON lines.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| BackupError::validation(format!("Failed to set global tracing subscriber: {e}")))?;

    tracing::debug!("zbackup logging initialized");
    Ok(())
}
