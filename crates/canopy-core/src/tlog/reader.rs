//! Streaming transaction log replay and validation.
//!
//! Replay applies each record at the record's own timestamp, so a
//! faithful reconstruction falls out of the leaf write rules
//! (equal-or-newer timestamps win). Skeleton mode recreates paths but
//! writes null values, for structural inspection without secrets.

use crate::error::{Result, StoreError};
use crate::events::Batch;
use crate::merge::MapEntry;
use crate::node::Node;
use crate::tlog::{TlogAction, TlogRecord};
use crate::value::ConfigValue;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

/// Predicate over a record's path; `true` skips the record.
pub type PathFilter = dyn Fn(&[String]) -> bool + Send + Sync;

/// Options for a replay pass.
#[derive(Clone, Default)]
pub struct ReplayOptions {
    /// Apply records even when older than the current tree.
    pub force: bool,
    /// Create paths but write null at every leaf.
    pub skeleton: bool,
    pub filter: Option<Arc<PathFilter>>,
}

impl ReplayOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for ReplayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOptions")
            .field("force", &self.force)
            .field("skeleton", &self.skeleton)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Read every record, stopping at the first undecodable line.
pub(crate) fn read_records(path: &Path) -> Result<Vec<TlogRecord>> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(TlogRecord::parse(&line, index + 1)?);
    }
    Ok(records)
}

/// Check a tlog without applying it: corrupt on I/O error, decode
/// error, or an empty file.
pub fn validate(path: &Path) -> Result<()> {
    let records = read_records(path)?;
    if records.is_empty() {
        return Err(StoreError::EmptyLog(path.to_path_buf()));
    }
    Ok(())
}

/// Apply records to a tree on the worker. Case-variant collisions
/// against existing nodes surface a diagnostic through the batch's
/// replay flag.
pub(crate) fn apply_records(
    root: &Node,
    records: &[TlogRecord],
    options: &ReplayOptions,
    batch: &mut Batch,
) -> Result<()> {
    let was_diagnosing = batch.replay_diagnostics;
    batch.replay_diagnostics = true;
    let outcome = apply_records_inner(root, records, options, batch);
    batch.replay_diagnostics = was_diagnosing;
    outcome
}

fn apply_records_inner(
    root: &Node,
    records: &[TlogRecord],
    options: &ReplayOptions,
    batch: &mut Batch,
) -> Result<()> {
    for record in records {
        if let Some(filter) = &options.filter {
            if filter(&record.path) {
                continue;
            }
        }
        match record.action {
            TlogAction::WriteLeaf => {
                let leaf = root.lookup(&record.path, batch)?;
                let value = if options.skeleton {
                    ConfigValue::Null
                } else {
                    record.value.clone().unwrap_or(ConfigValue::Null)
                };
                leaf.write_leaf(record.timestamp, value, options.force, batch)?;
            }
            TlogAction::RemoveNode => {
                if let Some(node) = root.find_node(&record.path) {
                    node.remove(record.timestamp, batch)?;
                }
            }
            TlogAction::InteriorTimestamp => {
                let node = root.lookup_topics(&record.path, batch)?;
                node.apply_interior_stamp(record.timestamp, options.force);
            }
        }
    }
    Ok(())
}

/// Accumulate a tlog into a scratch map for a behaviour-tree merge.
/// Later records win; removals drop the accumulated subtree. Leaf
/// timestamps are preserved so the merge re-applies each value at its
/// original time.
pub(crate) fn scratch_from_records(records: &[TlogRecord]) -> MapEntry {
    let mut scratch = MapEntry::empty_map();
    for record in records {
        match record.action {
            TlogAction::WriteLeaf => {
                let value = record.value.clone().unwrap_or(ConfigValue::Null);
                scratch.set_at(&record.path, value, record.timestamp);
            }
            TlogAction::RemoveNode => {
                scratch.remove_at(&record.path);
            }
            TlogAction::InteriorTimestamp => {}
        }
    }
    scratch
}
