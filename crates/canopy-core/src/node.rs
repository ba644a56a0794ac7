//! The configuration tree.
//!
//! Nodes are reference-counted handles; the parent link is weak, so a
//! detached subtree drops once the last external handle goes away. All
//! mutation happens on the publish-queue worker, which threads a
//! [`Batch`] through every mutating call; readers on other threads see
//! point-in-time snapshots through the leaf's atomic value pointer and
//! read locks on child maps.

use crate::error::{Result, StoreError};
use crate::events::{Batch, Event, EventKind, SubscriberFn, SubscriptionHandle};
use crate::tlog::TlogRecord;
use crate::value::{canonical_eq, ConfigValue, Timestamp};
use arc_swap::ArcSwapOption;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Validator signature: `(new, old) -> accepted`. Validators are total;
/// returning a different value substitutes it, which is not an error.
pub type ValidatorFn = dyn Fn(&ConfigValue, Option<&ConfigValue>) -> ConfigValue + Send + Sync;

/// Stable handle returned by `add_validator`, consumed by
/// `remove_validator`.
#[derive(Debug)]
pub struct ValidatorHandle {
    pub(crate) node: WeakNode,
    pub(crate) id: u64,
}

/// Handle to a node in the configuration tree. Cheap to clone; clones
/// refer to the same node.
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct WeakNode {
    inner: Weak<NodeInner>,
}

struct NodeInner {
    /// Case-preserving spelling. `None` only for the root.
    name: Option<String>,
    parent: Option<WeakNode>,
    modtime: AtomicI64,
    removed: AtomicBool,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    body: NodeBody,
}

enum NodeBody {
    Leaf {
        value: ArcSwapOption<ConfigValue>,
        validators: Mutex<Vec<ValidatorEntry>>,
    },
    Interior {
        /// Keyed by lower-cased name; the child keeps its spelling.
        children: RwLock<BTreeMap<String, Node>>,
    },
}

struct SubscriberEntry {
    id: u64,
    callback: Arc<SubscriberFn>,
}

struct ValidatorEntry {
    id: u64,
    f: Arc<ValidatorFn>,
}

/// What a creating lookup expects at a given path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildKind {
    Leaf,
    Interior,
}

impl Node {
    pub(crate) fn new_root() -> Self {
        Self {
            inner: Arc::new(NodeInner {
                name: None,
                parent: None,
                modtime: AtomicI64::new(0),
                removed: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                body: NodeBody::Interior {
                    children: RwLock::new(BTreeMap::new()),
                },
            }),
        }
    }

    fn new_child(parent: &Node, name: &str, kind: ChildKind) -> Self {
        let body = match kind {
            ChildKind::Leaf => NodeBody::Leaf {
                value: ArcSwapOption::from(None),
                validators: Mutex::new(Vec::new()),
            },
            ChildKind::Interior => NodeBody::Interior {
                children: RwLock::new(BTreeMap::new()),
            },
        };
        Self {
            inner: Arc::new(NodeInner {
                name: Some(name.to_string()),
                parent: Some(parent.downgrade()),
                modtime: AtomicI64::new(0),
                removed: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                body,
            }),
        }
    }

    /// True when both handles refer to the same node.
    pub fn same(a: &Node, b: &Node) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // --- Readers (any thread) ---

    /// Case-preserving name; `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Child names from the root down to this node.
    pub fn path(&self) -> Vec<String> {
        let mut segments = Vec::new();
        let mut cursor = Some(self.clone());
        while let Some(node) = cursor {
            if let Some(name) = node.name() {
                segments.push(name.to_string());
            }
            cursor = node.parent();
        }
        segments.reverse();
        segments
    }

    pub fn parent(&self) -> Option<Node> {
        self.inner.parent.as_ref().and_then(WeakNode::upgrade)
    }

    pub fn modtime(&self) -> Timestamp {
        self.inner.modtime.load(Ordering::Acquire)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.inner.body, NodeBody::Leaf { .. })
    }

    pub fn is_interior(&self) -> bool {
        matches!(self.inner.body, NodeBody::Interior { .. })
    }

    /// True once the node has been detached from the tree.
    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// Lock-free snapshot of a leaf's value. `None` for interiors and
    /// for leaves that have never been written.
    pub fn value(&self) -> Option<Arc<ConfigValue>> {
        match &self.inner.body {
            NodeBody::Leaf { value, .. } => value.load_full(),
            NodeBody::Interior { .. } => None,
        }
    }

    /// Case-preserving child names, in case-insensitive sorted order.
    pub fn child_names(&self) -> Vec<String> {
        match &self.inner.body {
            NodeBody::Interior { children } => children
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .filter_map(|c| c.name().map(str::to_string))
                .collect(),
            NodeBody::Leaf { .. } => Vec::new(),
        }
    }

    /// Case-insensitive single-level child lookup.
    pub fn child(&self, name: &str) -> Option<Node> {
        match &self.inner.body {
            NodeBody::Interior { children } => children
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&name.to_ascii_lowercase())
                .cloned(),
            NodeBody::Leaf { .. } => None,
        }
    }

    pub(crate) fn find_node<S: AsRef<str>>(&self, path: &[S]) -> Option<Node> {
        let mut node = self.clone();
        for segment in path {
            let next = node.child(segment.as_ref());
            match next {
                Some(n) => node = n,
                None => return None,
            }
        }
        Some(node)
    }

    /// Non-creating leaf lookup: absent if any segment is missing or of
    /// the wrong kind.
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<Node> {
        self.find_node(path).filter(Node::is_leaf)
    }

    /// Non-creating interior lookup.
    pub fn find_topics<S: AsRef<str>>(&self, path: &[S]) -> Option<Node> {
        self.find_node(path).filter(Node::is_interior)
    }

    /// Structural equality: same case-insensitive child-name sets with
    /// recursive per-child equality; leaves compare values through the
    /// canonicalising coercion.
    pub fn children_equal(&self, other: &Node) -> bool {
        match (&self.inner.body, &other.inner.body) {
            (NodeBody::Leaf { value: a, .. }, NodeBody::Leaf { value: b, .. }) => {
                match (a.load_full(), b.load_full()) {
                    (None, None) => true,
                    (Some(x), Some(y)) => canonical_eq(&x, &y),
                    _ => false,
                }
            }
            (NodeBody::Interior { children: a }, NodeBody::Interior { children: b }) => {
                let a = a.read().unwrap_or_else(|e| e.into_inner());
                let b = b.read().unwrap_or_else(|e| e.into_inner());
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, va)| b.get(key).is_some_and(|vb| va.children_equal(vb)))
            }
            _ => false,
        }
    }

    pub(crate) fn subscriber_snapshot(&self) -> Vec<Arc<SubscriberFn>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| Arc::clone(&entry.callback))
            .collect()
    }

    // --- Mutators (publish-queue worker only) ---

    /// Creating lookup: missing interior segments are created, the final
    /// segment is created as a leaf. Re-lookup under a case-variant
    /// spelling returns the existing node.
    pub(crate) fn lookup<S: AsRef<str>>(&self, path: &[S], batch: &mut Batch) -> Result<Node> {
        if path.is_empty() {
            return Err(StoreError::kind_conflict(
                &self.path(),
                "empty path cannot name a value",
            ));
        }
        let mut node = self.clone();
        for (i, segment) in path.iter().enumerate() {
            let want = if i + 1 == path.len() {
                ChildKind::Leaf
            } else {
                ChildKind::Interior
            };
            node = node.ensure_child(segment.as_ref(), want, batch)?;
        }
        Ok(node)
    }

    /// Creating lookup of an interior node; fails if a leaf sits
    /// anywhere on the path.
    pub(crate) fn lookup_topics<S: AsRef<str>>(&self, path: &[S], batch: &mut Batch) -> Result<Node> {
        let mut node = self.clone();
        for segment in path {
            node = node.ensure_child(segment.as_ref(), ChildKind::Interior, batch)?;
        }
        Ok(node)
    }

    pub(crate) fn ensure_child(&self, name: &str, want: ChildKind, batch: &mut Batch) -> Result<Node> {
        let NodeBody::Interior { children } = &self.inner.body else {
            return Err(StoreError::kind_conflict(
                &self.path(),
                format!("cannot descend through a value to reach {name:?}"),
            ));
        };
        let key = name.to_ascii_lowercase();
        {
            let children = children.read().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = children.get(&key) {
                match (want, existing.is_leaf()) {
                    (ChildKind::Leaf, false) => {
                        return Err(StoreError::kind_conflict(
                            &existing.path(),
                            "an interior node exists where a value was expected",
                        ));
                    }
                    (ChildKind::Interior, true) => {
                        return Err(StoreError::kind_conflict(
                            &existing.path(),
                            "a value exists where a container was expected",
                        ));
                    }
                    _ => {}
                }
                if batch.replay_diagnostics {
                    if let Some(stored) = existing.name() {
                        if stored != name {
                            tracing::warn!(
                                stored,
                                incoming = name,
                                path = existing.path().join("."),
                                "case-variant name collision during replay; coalescing onto existing node"
                            );
                        }
                    }
                }
                return Ok(existing.clone());
            }
        }
        let child = Node::new_child(self, name, want);
        children
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, child.clone());
        batch.push_direct(Event {
            kind: EventKind::ChildAdded,
            node: self.clone(),
            child: Some(child.clone()),
        });
        Ok(child)
    }

    /// Timestamped leaf write. Stale writes (timestamp older than the
    /// leaf's modtime) are skipped unless `force`; equal timestamps are
    /// accepted so replay re-applies the terminal state. The accepted
    /// value may be substituted by validators. A write whose accepted
    /// value equals the current one still advances the modtime but
    /// emits no event.
    pub(crate) fn write_leaf(
        &self,
        timestamp: Timestamp,
        value: ConfigValue,
        force: bool,
        batch: &mut Batch,
    ) -> Result<()> {
        let NodeBody::Leaf { value: slot, validators } = &self.inner.body else {
            return Err(StoreError::kind_conflict(
                &self.path(),
                "cannot write a value onto an interior node",
            ));
        };
        let current_mod = self.inner.modtime.load(Ordering::Acquire);
        if !force && timestamp < current_mod {
            tracing::debug!(
                path = self.path().join("."),
                timestamp,
                current_mod,
                "stale write skipped"
            );
            return Ok(());
        }

        let previous = slot.load_full();
        let mut accepted = value;
        {
            let validators = validators.lock().unwrap_or_else(|e| e.into_inner());
            for entry in validators.iter() {
                accepted = (entry.f)(&accepted, previous.as_deref());
            }
        }

        let changed = previous
            .as_deref()
            .map_or(true, |prev| !canonical_eq(prev, &accepted));
        slot.store(Some(Arc::new(accepted.clone())));
        self.inner.modtime.store(timestamp, Ordering::Release);
        self.bump_ancestors(timestamp);
        batch.record(TlogRecord::write(timestamp, self.path(), accepted));

        if changed {
            let kind = if previous.is_none() {
                EventKind::Initialized
            } else {
                EventKind::Changed
            };
            batch.push_direct(Event {
                kind,
                node: self.clone(),
                child: None,
            });
            let mut cursor = self.parent();
            while let Some(ancestor) = cursor {
                batch.note_child_changed(ancestor.clone(), self.clone());
                cursor = ancestor.parent();
            }
        }
        Ok(())
    }

    /// Advance an interior node's modtime after a structural update and
    /// log the bump so replay reproduces it.
    pub(crate) fn touch_interior(&self, timestamp: Timestamp, batch: &mut Batch) {
        let prev = self.inner.modtime.fetch_max(timestamp, Ordering::AcqRel);
        if prev < timestamp {
            batch.record(TlogRecord::interior(timestamp, self.path()));
        }
    }

    /// Replay-side interior stamp. `force` may move the clock backwards.
    pub(crate) fn apply_interior_stamp(&self, timestamp: Timestamp, force: bool) {
        if force {
            self.inner.modtime.store(timestamp, Ordering::Release);
        } else {
            self.inner.modtime.fetch_max(timestamp, Ordering::AcqRel);
        }
    }

    fn bump_ancestors(&self, timestamp: Timestamp) {
        let mut cursor = self.parent();
        while let Some(node) = cursor {
            node.inner.modtime.fetch_max(timestamp, Ordering::AcqRel);
            cursor = node.parent();
        }
    }

    /// Detach this node from its parent. Every node in the removed
    /// subtree fires a terminal `removed` event to its own subscribers;
    /// the parent hears `childRemoved`. Removing the root is refused.
    pub(crate) fn remove(&self, timestamp: Timestamp, batch: &mut Batch) -> Result<()> {
        let Some(parent) = self.parent() else {
            tracing::warn!("ignoring removal of the root node");
            return Ok(());
        };
        if self.is_removed() {
            return Ok(());
        }
        let Some(name) = self.name() else {
            return Ok(());
        };
        let path = self.path();
        let NodeBody::Interior { children } = &parent.inner.body else {
            return Ok(());
        };
        let detached = children
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name.to_ascii_lowercase());
        if detached.is_none() {
            return Ok(());
        }

        batch.record(TlogRecord::remove(timestamp, path));
        parent.inner.modtime.fetch_max(timestamp, Ordering::AcqRel);
        parent.bump_ancestors(timestamp);
        self.mark_removed(batch);
        batch.push_direct(Event {
            kind: EventKind::ChildRemoved,
            node: parent,
            child: Some(self.clone()),
        });
        Ok(())
    }

    fn mark_removed(&self, batch: &mut Batch) {
        self.inner.removed.store(true, Ordering::Release);
        batch.push_direct(Event {
            kind: EventKind::Removed,
            node: self.clone(),
            child: None,
        });
        if let NodeBody::Interior { children } = &self.inner.body {
            for child in children.read().unwrap_or_else(|e| e.into_inner()).values() {
                child.mark_removed(batch);
            }
        }
    }

    /// Append a validator. It is immediately invoked with the current
    /// value and `None` for the old one; a substituted result is
    /// committed at the leaf's current modtime.
    pub(crate) fn add_validator(&self, f: Arc<ValidatorFn>, batch: &mut Batch) -> Result<ValidatorHandle> {
        let NodeBody::Leaf { value, validators } = &self.inner.body else {
            return Err(StoreError::kind_conflict(
                &self.path(),
                "validators attach to value nodes",
            ));
        };
        let id = next_handle_id();
        if let Some(current) = value.load_full() {
            let accepted = f(&current, None);
            if !canonical_eq(&current, &accepted) {
                value.store(Some(Arc::new(accepted.clone())));
                batch.record(TlogRecord::write(self.modtime(), self.path(), accepted));
                batch.push_direct(Event {
                    kind: EventKind::Changed,
                    node: self.clone(),
                    child: None,
                });
            }
        }
        validators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ValidatorEntry { id, f });
        Ok(ValidatorHandle {
            node: self.downgrade(),
            id,
        })
    }

    pub(crate) fn remove_validator(&self, id: u64) {
        if let NodeBody::Leaf { validators, .. } = &self.inner.body {
            validators
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|entry| entry.id != id);
        }
    }

    /// Register a subscriber; an `initialized` event with the current
    /// state is delivered as part of the same action.
    pub(crate) fn subscribe_entry(&self, callback: Arc<SubscriberFn>, batch: &mut Batch) -> SubscriptionHandle {
        let id = next_handle_id();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SubscriberEntry { id, callback });
        batch.push_direct(Event {
            kind: EventKind::Initialized,
            node: self.clone(),
            child: None,
        });
        SubscriptionHandle {
            node: self.downgrade(),
            id,
        }
    }

    pub(crate) fn unsubscribe_entry(&self, id: u64) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|entry| entry.id != id);
    }

    #[cfg(test)]
    pub(crate) fn new_leaf_for_tests(parent: &Node, name: &str) -> Node {
        Node::new_child(parent, name, ChildKind::Leaf)
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.path();
        let label = if path.is_empty() {
            "<root>".to_string()
        } else {
            path.join(".")
        };
        f.debug_struct("Node")
            .field("path", &label)
            .field("leaf", &self.is_leaf())
            .field("modtime", &self.modtime())
            .finish()
    }
}

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

impl std::fmt::Debug for WeakNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakNode")
    }
}
