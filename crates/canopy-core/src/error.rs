//! Error types shared across the store.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A value write landed where an interior node exists, or a child
    /// lookup descended through an existing leaf.
    #[error("node kind conflict at {path}: {detail}")]
    NodeKindConflict { path: String, detail: String },

    /// Submission after `close`, or the worker was force-aborted.
    #[error("store is shutting down")]
    ShuttingDown,

    /// A queued action panicked or its completion was dropped before
    /// the waiting caller could observe a result.
    #[error("queued action aborted before completion")]
    ActionAborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A tlog record failed to parse. The reader stops at the first bad
    /// record.
    #[error("corrupt tlog record at line {line}: {reason}")]
    Decode { line: usize, reason: String },

    /// An existing tlog with no records is treated as corrupt.
    #[error("tlog is empty: {0}")]
    EmptyLog(PathBuf),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn kind_conflict(path: &[String], detail: impl Into<String>) -> Self {
        Self::NodeKindConflict {
            path: path.join("."),
            detail: detail.into(),
        }
    }
}
