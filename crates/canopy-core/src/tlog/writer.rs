//! Append-only transaction log writer.
//!
//! Owned exclusively by the publish-queue worker. Records buffer through
//! a `BufWriter`; before any subscriber sees an action's events the
//! buffer is pushed to the OS, and under `FlushMode::Immediate` fsynced
//! as well. When the log outgrows its configured limits the writer
//! swaps it for a snapshot of the current tree, keeping the previous
//! log as `*.tlog.old`; if the swap fails at any step it keeps
//! appending to the existing log instead.

use crate::config::FlushMode;
use crate::error::Result;
use crate::node::Node;
use crate::tlog::TlogRecord;
use crate::value::ConfigValue;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub(crate) struct TlogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    flush_mode: FlushMode,
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
    entries: usize,
    bytes: u64,
    dirty: bool,
}

impl TlogWriter {
    /// Open for append, creating parent directories as needed. Existing
    /// records count toward the truncation limits.
    pub(crate) fn open(
        path: &Path,
        flush_mode: FlushMode,
        max_entries: Option<usize>,
        max_bytes: Option<u64>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (entries, bytes) = existing_extent(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            flush_mode,
            max_entries,
            max_bytes,
            entries,
            bytes,
            dirty: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries
    }

    pub(crate) fn append(&mut self, record: &TlogRecord) -> Result<()> {
        let line = record.to_line();
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.entries += 1;
        self.bytes += line.len() as u64 + 1;
        self.dirty = true;
        Ok(())
    }

    /// Push buffered records to the OS, and to disk under `Immediate`.
    /// Runs after every committed action, before its events dispatch.
    pub(crate) fn sync_for_dispatch(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.file.flush()?;
        if self.flush_mode == FlushMode::Immediate {
            self.file.get_ref().sync_data()?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Periodic-cadence flush.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.dirty = false;
        Ok(())
    }

    pub(crate) fn should_truncate(&self) -> bool {
        self.max_entries.is_some_and(|max| self.entries >= max)
            || self.max_bytes.is_some_and(|max| self.bytes >= max)
    }

    /// Swap the log for a snapshot of `root`. On any failure the
    /// original log is left (or put back) in place and appending
    /// continues against it.
    pub(crate) fn truncate(&mut self, root: &Node) -> Result<()> {
        let fresh = self.path.with_extension("tlog.new");
        let backup = self.path.with_extension("tlog.old");

        let records = snapshot_records(root);
        let outcome = self.swap_in_snapshot(&fresh, &backup, &records);
        if let Err(e) = &outcome {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "tlog truncation failed; continuing on the existing log"
            );
            let _ = fs::remove_file(&fresh);
            // If the primary was already renamed away, restore it.
            if !self.path.exists() && backup.exists() {
                let _ = fs::rename(&backup, &self.path);
            }
            self.reopen()?;
        }
        outcome
    }

    fn swap_in_snapshot(&mut self, fresh: &Path, backup: &Path, records: &[TlogRecord]) -> Result<()> {
        {
            let mut out = BufWriter::new(File::create(fresh)?);
            for record in records {
                out.write_all(record.to_line().as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        self.file.flush()?;
        fs::rename(&self.path, backup)?;
        fs::rename(fresh, &self.path)?;
        self.reopen()?;
        tracing::info!(
            path = %self.path.display(),
            records = records.len(),
            "tlog truncated to snapshot"
        );
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        let (entries, bytes) = existing_extent(&self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = BufWriter::new(file);
        self.entries = entries;
        self.bytes = bytes;
        self.dirty = false;
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for TlogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlogWriter")
            .field("path", &self.path)
            .field("entries", &self.entries)
            .field("bytes", &self.bytes)
            .finish()
    }
}

fn existing_extent(path: &Path) -> Result<(usize, u64)> {
    match File::open(path) {
        Ok(file) => {
            let bytes = file.metadata()?.len();
            let entries = BufReader::new(file).lines().count();
            Ok((entries, bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((0, 0)),
        Err(e) => Err(e.into()),
    }
}

/// Serialise the effective tree as replayable records: one leaf write
/// per leaf at its own modtime (never-written leaves persist as null),
/// plus interior stamps for childless interiors so structure survives.
pub(crate) fn snapshot_records(root: &Node) -> Vec<TlogRecord> {
    let mut records = Vec::new();
    collect(root, &mut records);
    records
}

fn collect(node: &Node, records: &mut Vec<TlogRecord>) {
    if node.is_leaf() {
        let value = node
            .value()
            .map_or(ConfigValue::Null, |v| (*v).clone());
        records.push(TlogRecord::write(node.modtime(), node.path(), value));
        return;
    }
    let names = node.child_names();
    if names.is_empty() && !node.path().is_empty() {
        records.push(TlogRecord::interior(node.modtime(), node.path()));
        return;
    }
    for name in names {
        if let Some(child) = node.child(&name) {
            collect(&child, records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Batch;
    use tempfile::TempDir;

    fn write_tree(root: &Node) {
        let mut batch = Batch::default();
        root.lookup(&["a", "x"], &mut batch)
            .unwrap()
            .write_leaf(3, ConfigValue::Int(1), false, &mut batch)
            .unwrap();
        root.lookup_topics(&["empty"], &mut batch).unwrap();
    }

    #[test]
    fn append_counts_entries_and_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.tlog");
        let mut writer = TlogWriter::open(&path, FlushMode::Immediate, None, None).unwrap();

        writer
            .append(&TlogRecord::write(1, vec!["k".to_string()], ConfigValue::Int(1)))
            .unwrap();
        writer.sync_for_dispatch().unwrap();
        assert_eq!(writer.entry_count(), 1);

        // Reopening picks the existing extent back up.
        drop(writer);
        let writer = TlogWriter::open(&path, FlushMode::Immediate, None, None).unwrap();
        assert_eq!(writer.entry_count(), 1);
    }

    #[test]
    fn truncation_swaps_in_a_snapshot_and_keeps_a_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.tlog");
        let mut writer = TlogWriter::open(&path, FlushMode::Immediate, Some(2), None).unwrap();
        let root = Node::new_root();
        write_tree(&root);

        writer
            .append(&TlogRecord::write(1, vec!["a".to_string(), "x".to_string()], ConfigValue::Int(0)))
            .unwrap();
        writer
            .append(&TlogRecord::write(3, vec!["a".to_string(), "x".to_string()], ConfigValue::Int(1)))
            .unwrap();
        writer.sync_for_dispatch().unwrap();
        assert!(writer.should_truncate());

        writer.truncate(&root).unwrap();
        assert!(!writer.should_truncate());
        assert!(path.with_extension("tlog.old").exists());

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        // Snapshot: one leaf write plus the empty interior stamp.
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l.contains("\"a\"") && l.contains("1")));
        assert!(lines.iter().any(|l| l.contains("\"empty\"")));
    }

    #[test]
    fn snapshot_preserves_unwritten_leaves_as_null() {
        let root = Node::new_root();
        let mut batch = Batch::default();
        root.lookup(&["bare"], &mut batch).unwrap();
        let records = snapshot_records(&root);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Some(ConfigValue::Null));
    }
}
