//! Store configuration.
//!
//! Controls where the tlog and snapshots live and how aggressively the
//! tlog writer flushes and truncates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Flush policy for the transaction log writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// fsync after every committed action, before subscribers run.
    Immediate,
    /// Buffered writes, flushed at `flush_interval_ms` cadence and on close.
    Periodic,
}

/// Configuration for a [`ConfigStore`](crate::store::ConfigStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the tlog and snapshot artefacts.
    pub root_dir: PathBuf,
    /// File name of the primary tlog inside `root_dir`.
    pub tlog_name: String,
    /// File name of the YAML snapshot inside `root_dir`.
    pub snapshot_name: String,
    pub flush: FlushMode,
    /// Cadence for `FlushMode::Periodic`.
    pub flush_interval_ms: u64,
    /// Auto-truncate once the tlog holds this many records.
    pub max_tlog_entries: Option<usize>,
    /// Auto-truncate once the tlog exceeds this many bytes.
    pub max_tlog_bytes: Option<u64>,
    /// Bounded deadline for `close`; past it the worker is aborted and
    /// waiting callers see `ShuttingDown`.
    pub close_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: dirs::data_local_dir()
                .map_or_else(|| PathBuf::from(".canopy"), |d| d.join("canopy")),
            tlog_name: "config.tlog".to_string(),
            snapshot_name: "config.yaml".to_string(),
            flush: FlushMode::Immediate,
            flush_interval_ms: 5_000,
            max_tlog_entries: Some(15_000),
            max_tlog_bytes: None,
            close_timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    /// Config rooted at a specific directory, otherwise defaults.
    pub fn at(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn tlog_path(&self) -> PathBuf {
        self.root_dir.join(&self.tlog_name)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(&self.snapshot_name)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
