//! The configuration store façade.
//!
//! Owns the root node, the publish queue, and the store configuration.
//! On open, an existing tlog is replayed into a fresh tree before the
//! queue and writer start, so startup replay never re-logs records.
//! All mutating calls route through the queue; `find*` reads go
//! straight to the tree and return point-in-time snapshots.

use crate::config::{FlushMode, StoreConfig};
use crate::error::{Result, StoreError};
use crate::events::{Batch, Event, SubscriberFn, SubscriptionHandle};
use crate::merge::{self, MapEntry, UpdateBehaviorTree};
use crate::node::{Node, ValidatorFn, ValidatorHandle};
use crate::queue::PublishQueue;
use crate::tlog::reader::{self, ReplayOptions};
use crate::tlog::writer::{snapshot_records, TlogWriter};
use crate::value::{now_millis, ConfigValue, Timestamp};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-process hierarchical configuration store with a transactional
/// change log. Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct ConfigStore {
    root: Node,
    queue: Arc<PublishQueue>,
    config: Arc<StoreConfig>,
}

impl ConfigStore {
    /// Open a store rooted at `config.root_dir`, replaying any existing
    /// tlog so the tree comes back exactly as last persisted.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_dir)?;
        let root = Node::new_root();
        let tlog_path = config.tlog_path();

        let existing_len = fs::metadata(&tlog_path).map(|m| m.len()).unwrap_or(0);
        if existing_len > 0 {
            let records = reader::read_records(&tlog_path)?;
            let mut batch = Batch::default();
            reader::apply_records(&root, &records, &ReplayOptions::default(), &mut batch)?;
            tracing::info!(
                path = %tlog_path.display(),
                records = records.len(),
                "replayed transaction log"
            );
        }

        let writer = TlogWriter::open(
            &tlog_path,
            config.flush,
            config.max_tlog_entries,
            config.max_tlog_bytes,
        )?;
        let flush_interval =
            (config.flush == FlushMode::Periodic).then(|| config.flush_interval());
        let queue = Arc::new(PublishQueue::spawn(
            root.clone(),
            writer,
            flush_interval,
            config.close_timeout(),
        ));
        Ok(Self {
            root,
            queue,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> Node {
        self.root.clone()
    }

    // --- Reads (any thread, point-in-time) ---

    /// Non-creating leaf lookup.
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<Node> {
        self.root.find(path)
    }

    /// Non-creating interior lookup.
    pub fn find_topics<S: AsRef<str>>(&self, path: &[S]) -> Option<Node> {
        self.root.find_topics(path)
    }

    // --- Tree operations (serialised through the publish queue) ---

    /// Creating leaf lookup.
    pub async fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Result<Node> {
        let path = own_path(path);
        self.queue
            .submit_and_wait(move |ctx| ctx.root.lookup(&path, &mut ctx.batch))
            .await
    }

    /// Creating interior lookup.
    pub async fn lookup_topics<S: AsRef<str>>(&self, path: &[S]) -> Result<Node> {
        let path = own_path(path);
        self.queue
            .submit_and_wait(move |ctx| ctx.root.lookup_topics(&path, &mut ctx.batch))
            .await
    }

    /// Timestamped write to the leaf at `path`, creating it as needed.
    pub async fn write<S: AsRef<str>>(
        &self,
        path: &[S],
        timestamp: Timestamp,
        value: impl Into<ConfigValue>,
    ) -> Result<()> {
        let path = own_path(path);
        let value = value.into();
        self.queue
            .submit_and_wait(move |ctx| {
                let leaf = ctx.root.lookup(&path, &mut ctx.batch)?;
                leaf.write_leaf(timestamp, value, false, &mut ctx.batch)
            })
            .await
    }

    /// Timestamped write through a leaf handle. `force` bypasses the
    /// timestamp-monotonicity rule and may move the leaf's clock
    /// backwards.
    pub async fn write_leaf(
        &self,
        leaf: &Node,
        timestamp: Timestamp,
        value: impl Into<ConfigValue>,
        force: bool,
    ) -> Result<()> {
        let leaf = leaf.clone();
        let value = value.into();
        self.queue
            .submit_and_wait(move |ctx| leaf.write_leaf(timestamp, value, force, &mut ctx.batch))
            .await
    }

    /// Remove a node and all its descendants, stamped with the current
    /// wall clock.
    pub async fn remove(&self, node: &Node) -> Result<()> {
        let node = node.clone();
        let timestamp = now_millis();
        self.queue
            .submit_and_wait(move |ctx| node.remove(timestamp, &mut ctx.batch))
            .await
    }

    /// Append a validator to a leaf; immediately invoked with the
    /// current value.
    pub async fn add_validator(
        &self,
        leaf: &Node,
        validator: impl Fn(&ConfigValue, Option<&ConfigValue>) -> ConfigValue + Send + Sync + 'static,
    ) -> Result<ValidatorHandle> {
        let leaf = leaf.clone();
        let validator: Arc<ValidatorFn> = Arc::new(validator);
        self.queue
            .submit_and_wait(move |ctx| leaf.add_validator(validator, &mut ctx.batch))
            .await
    }

    /// Idempotent validator removal.
    pub async fn remove_validator(&self, handle: ValidatorHandle) -> Result<()> {
        self.queue
            .submit_and_wait(move |_ctx| {
                if let Some(node) = handle.node.upgrade() {
                    node.remove_validator(handle.id);
                }
                Ok(())
            })
            .await
    }

    /// Register a subscriber on any node. An `initialized` event with
    /// the current state is delivered before this returns.
    pub async fn subscribe(
        &self,
        node: &Node,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let node = node.clone();
        let callback: Arc<SubscriberFn> = Arc::new(callback);
        self.queue
            .submit_and_wait(move |ctx| Ok(node.subscribe_entry(callback, &mut ctx.batch)))
            .await
    }

    /// Idempotent unsubscription; ordered before the next action runs.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.queue
            .submit_and_wait(move |_ctx| {
                if let Some(node) = handle.node.upgrade() {
                    node.unsubscribe_entry(handle.id);
                }
                Ok(())
            })
            .await
    }

    // --- Structural updates ---

    /// Apply a nested map at the root, guided by a behaviour tree.
    pub async fn update_map(
        &self,
        timestamp: Timestamp,
        map: serde_json::Value,
        behavior: UpdateBehaviorTree,
    ) -> Result<()> {
        let MapEntry::Map(source) = MapEntry::from_json(&map, timestamp)? else {
            return Err(StoreError::NodeKindConflict {
                path: String::new(),
                detail: "top-level update input must be a map".to_string(),
            });
        };
        self.queue
            .submit_and_wait(move |ctx| {
                merge::apply_map(
                    &ctx.root,
                    &source,
                    Some(&behavior),
                    behavior.behavior,
                    timestamp,
                    false,
                    &mut ctx.batch,
                )
            })
            .await
    }

    /// Shorthand for a whole-tree MERGE.
    pub async fn merge_map(&self, timestamp: Timestamp, map: serde_json::Value) -> Result<()> {
        self.update_map(timestamp, map, UpdateBehaviorTree::merge()).await
    }

    /// Replay a tlog into a scratch map, then apply it with the given
    /// behaviour tree. Leaf writes keep their per-record timestamps;
    /// `force` applies them even when older than the current tree.
    pub async fn update_from_tlog(
        &self,
        path: &Path,
        force: bool,
        behavior: UpdateBehaviorTree,
    ) -> Result<()> {
        let records = reader::read_records(path)?;
        let scratch = reader::scratch_from_records(&records);
        let timestamp = scratch.max_timestamp();
        let MapEntry::Map(source) = scratch else {
            return Ok(());
        };
        self.queue
            .submit_and_wait(move |ctx| {
                merge::apply_map(
                    &ctx.root,
                    &source,
                    Some(&behavior),
                    behavior.behavior,
                    timestamp,
                    force,
                    &mut ctx.batch,
                )
            })
            .await
    }

    // --- Loader inputs ---

    /// Load a document whose content type is determined by suffix:
    /// `.yaml`/`.yml`/`.json` merge at one timestamp, `.tlog` replays
    /// record by record, anything else loads as empty.
    pub async fn read(&self, path: &Path, use_source_timestamp: bool) -> Result<()> {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match suffix.as_str() {
            "yaml" | "yml" => {
                let doc: serde_json::Value = serde_yaml::from_str(&fs::read_to_string(path)?)?;
                self.merge_document(path, doc, use_source_timestamp).await
            }
            "json" => {
                let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;
                self.merge_document(path, doc, use_source_timestamp).await
            }
            "tlog" => self.read_tlog(path, ReplayOptions::default()).await,
            other => {
                tracing::debug!(path = %path.display(), suffix = other, "unrecognised suffix; loading nothing");
                Ok(())
            }
        }
    }

    /// Replay a tlog record by record with explicit options: `force`
    /// to override newer state, `skeleton` to recreate paths with null
    /// values, and a path filter to preserve namespaces.
    pub async fn read_tlog(&self, path: &Path, options: ReplayOptions) -> Result<()> {
        let records = reader::read_records(path)?;
        self.queue
            .submit_and_wait(move |ctx| {
                reader::apply_records(&ctx.root, &records, &options, &mut ctx.batch)
            })
            .await
    }

    async fn merge_document(
        &self,
        path: &Path,
        doc: serde_json::Value,
        use_source_timestamp: bool,
    ) -> Result<()> {
        if doc.is_null() {
            return Ok(());
        }
        let timestamp = if use_source_timestamp {
            source_mtime_millis(path)?
        } else {
            now_millis()
        };
        self.merge_map(timestamp, doc).await
    }

    // --- Snapshots ---

    /// Effective configuration as a JSON document, captured at a single
    /// instant on the worker.
    pub async fn dump(&self) -> Result<serde_json::Value> {
        self.queue
            .submit_and_wait(|ctx| Ok(node_to_json(&ctx.root)))
            .await
    }

    /// Write the effective configuration as YAML.
    pub async fn write_effective_config<W: Write>(&self, writer: W) -> Result<()> {
        let doc = self.dump().await?;
        serde_yaml::to_writer(writer, &doc)?;
        Ok(())
    }

    /// Write the YAML snapshot to its configured location.
    pub async fn write_snapshot(&self) -> Result<PathBuf> {
        let path = self.config.snapshot_path();
        let file = File::create(&path)?;
        self.write_effective_config(BufWriter::new(file)).await?;
        Ok(path)
    }

    /// Serialise the effective configuration as a replayable tlog.
    pub async fn write_effective_config_as_tlog(&self, path: &Path) -> Result<()> {
        let records = self
            .queue
            .submit_and_wait(|ctx| Ok(snapshot_records(&ctx.root)))
            .await?;
        let mut out = BufWriter::new(File::create(path)?);
        for record in &records {
            writeln!(out, "{}", record.to_line())?;
        }
        out.flush()?;
        Ok(())
    }

    // --- Lifecycle ---

    /// Wait until the queue is empty, including actions submitted by
    /// running actions.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    /// Reject further submissions, drain, and stop the worker.
    pub async fn close(&self) -> Result<()> {
        self.queue.close().await
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("root_dir", &self.config.root_dir)
            .finish()
    }
}

fn own_path<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    path.iter().map(|s| s.as_ref().to_string()).collect()
}

fn source_mtime_millis(path: &Path) -> Result<Timestamp> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(chrono::DateTime::<chrono::Utc>::from(modified).timestamp_millis())
}

/// Effective-tree rendering: interiors become objects keyed by their
/// case-preserving names, leaves become their values (null when never
/// written).
fn node_to_json(node: &Node) -> serde_json::Value {
    if node.is_leaf() {
        return node
            .value()
            .map_or(serde_json::Value::Null, |v| v.to_json());
    }
    let mut object = serde_json::Map::new();
    for name in node.child_names() {
        if let Some(child) = node.child(&name) {
            object.insert(name, node_to_json(&child));
        }
    }
    serde_json::Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::open(StoreConfig::at(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn write_then_find_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;

        store.write(&["services", "web", "port"], 1, 8080_i64).await.unwrap();
        let leaf = store.find(&["services", "web", "port"]).unwrap();
        assert_eq!(leaf.value().unwrap().as_int(), Some(8080));
        assert!(store.find(&["services", "web", "missing"]).is_none());

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn dump_renders_case_preserving_names() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;

        store.write(&["Services", "Web", "Port"], 1, 80_i64).await.unwrap();
        let doc = store.dump().await.unwrap();
        assert_eq!(doc["Services"]["Web"]["Port"], serde_json::json!(80));

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn read_dispatches_on_suffix() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;

        let yaml = dir.path().join("input.yaml");
        fs::write(&yaml, "svc:\n  enabled: true\n").unwrap();
        store.read(&yaml, false).await.unwrap();
        assert_eq!(
            store.find(&["svc", "enabled"]).unwrap().value().unwrap().as_bool(),
            Some(true)
        );

        let json = dir.path().join("input.json");
        fs::write(&json, r#"{"svc": {"count": 3}}"#).unwrap();
        store.read(&json, false).await.unwrap();
        assert_eq!(
            store.find(&["svc", "count"]).unwrap().value().unwrap().as_int(),
            Some(3)
        );

        // Unknown suffixes load as empty.
        let other = dir.path().join("input.properties");
        fs::write(&other, "a=1").unwrap();
        store.read(&other, false).await.unwrap();
        assert!(store.find(&["a"]).is_none());

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_files_land_in_the_store_directory() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        store.write(&["k"], 1, "v").await.unwrap();

        let snapshot = store.write_snapshot().await.unwrap();
        let text = fs::read_to_string(snapshot).unwrap();
        assert!(text.contains("k"));
        assert!(text.contains("v"));

        let tlog_copy = dir.path().join("copy.tlog");
        store.write_effective_config_as_tlog(&tlog_copy).await.unwrap();
        crate::tlog::reader::validate(&tlog_copy).unwrap();

        store.close().await.unwrap();
    }
}
