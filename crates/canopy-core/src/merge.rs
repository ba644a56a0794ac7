//! Structural updates driven by an update behaviour tree.
//!
//! A merge walks a scratch map and the configuration tree together. At
//! each position the effective behaviour is the explicit entry if one
//! exists, else the wildcard entry, else the nearest ancestor's. MERGE
//! leaves siblings alone; REPLACE removes existing children absent from
//! the incoming map unless their own override is MERGE. Application is
//! deliberately per-sibling: a kind conflict aborts at that point and
//! earlier siblings stay applied.

use crate::error::{Result, StoreError};
use crate::events::Batch;
use crate::node::{ChildKind, Node};
use crate::value::{ConfigValue, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Per-position merge behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateBehavior {
    Merge,
    Replace,
}

/// A parallel tree of behaviours with per-child overrides. Override
/// keys are case-insensitive, like the tree itself; `"*"` matches any
/// child without an explicit entry.
#[derive(Debug, Clone)]
pub struct UpdateBehaviorTree {
    pub behavior: UpdateBehavior,
    children: HashMap<String, UpdateBehaviorTree>,
}

impl UpdateBehaviorTree {
    pub const WILDCARD: &'static str = "*";

    pub fn new(behavior: UpdateBehavior) -> Self {
        Self {
            behavior,
            children: HashMap::new(),
        }
    }

    pub fn merge() -> Self {
        Self::new(UpdateBehavior::Merge)
    }

    pub fn replace() -> Self {
        Self::new(UpdateBehavior::Replace)
    }

    /// Builder-style child override.
    pub fn with_child(mut self, name: &str, subtree: UpdateBehaviorTree) -> Self {
        self.children.insert(name.to_ascii_lowercase(), subtree);
        self
    }

    /// Override position for a child: explicit entry first, then the
    /// wildcard.
    pub fn child(&self, name: &str) -> Option<&UpdateBehaviorTree> {
        self.children
            .get(&name.to_ascii_lowercase())
            .or_else(|| self.children.get(Self::WILDCARD))
    }
}

/// Scratch source for a merge. Leaves carry their own timestamps so a
/// uniform-timestamp map merge and a per-record tlog merge share one
/// engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEntry {
    Leaf {
        value: ConfigValue,
        timestamp: Timestamp,
    },
    Map(BTreeMap<String, MapEntry>),
}

impl MapEntry {
    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Build a scratch tree from a JSON document, stamping every leaf
    /// with one timestamp.
    pub fn from_json(value: &serde_json::Value, timestamp: Timestamp) -> Result<Self> {
        match value {
            serde_json::Value::Object(fields) => {
                let mut map = BTreeMap::new();
                for (key, sub) in fields {
                    map.insert(key.clone(), Self::from_json(sub, timestamp)?);
                }
                Ok(Self::Map(map))
            }
            other => {
                let value = ConfigValue::from_json(other).ok_or_else(|| StoreError::Decode {
                    line: 0,
                    reason: format!("unrepresentable leaf value: {other}"),
                })?;
                Ok(Self::Leaf { value, timestamp })
            }
        }
    }

    /// Insert a leaf at a path, materialising maps along the way. An
    /// existing entry of either shape at any point is overwritten, as a
    /// later record wins during tlog accumulation.
    pub fn set_at(&mut self, path: &[String], value: ConfigValue, timestamp: Timestamp) {
        let Self::Map(map) = self else {
            *self = Self::empty_map();
            return self.set_at(path, value, timestamp);
        };
        match path {
            [] => {}
            [last] => {
                map.insert(last.clone(), Self::Leaf { value, timestamp });
            }
            [head, rest @ ..] => {
                let entry = map
                    .entry(head.clone())
                    .or_insert_with(Self::empty_map);
                if let Self::Leaf { .. } = entry {
                    *entry = Self::empty_map();
                }
                entry.set_at(rest, value, timestamp);
            }
        }
    }

    /// Drop whatever sits at a path, if anything.
    pub fn remove_at(&mut self, path: &[String]) {
        let Self::Map(map) = self else {
            return;
        };
        match path {
            [] => {}
            [last] => {
                map.remove(last);
            }
            [head, rest @ ..] => {
                if let Some(entry) = map.get_mut(head) {
                    entry.remove_at(rest);
                }
            }
        }
    }

    /// Largest leaf timestamp in the subtree; 0 when empty.
    pub fn max_timestamp(&self) -> Timestamp {
        match self {
            Self::Leaf { timestamp, .. } => *timestamp,
            Self::Map(map) => map.values().map(Self::max_timestamp).max().unwrap_or(0),
        }
    }
}

/// Apply a scratch map onto an interior node, guided by the behaviour
/// tree. `timestamp` stamps interiors and REPLACE removals; each leaf
/// write uses the leaf's own scratch timestamp.
pub(crate) fn apply_map(
    node: &Node,
    source: &BTreeMap<String, MapEntry>,
    position: Option<&UpdateBehaviorTree>,
    inherited: UpdateBehavior,
    timestamp: Timestamp,
    force: bool,
    batch: &mut Batch,
) -> Result<()> {
    let effective = position.map_or(inherited, |p| p.behavior);

    if effective == UpdateBehavior::Replace {
        let incoming: std::collections::HashSet<String> =
            source.keys().map(|k| k.to_ascii_lowercase()).collect();
        for name in node.child_names() {
            if incoming.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            let keep = position
                .and_then(|p| p.child(&name))
                .is_some_and(|sub| sub.behavior == UpdateBehavior::Merge);
            if keep {
                continue;
            }
            if let Some(child) = node.child(&name) {
                child.remove(timestamp, batch)?;
            }
        }
    }

    for (key, entry) in source {
        let child_position = position.and_then(|p| p.child(key));
        match entry {
            MapEntry::Map(sub) => {
                let child = node.ensure_child(key, ChildKind::Interior, batch)?;
                apply_map(&child, sub, child_position, effective, timestamp, force, batch)?;
            }
            MapEntry::Leaf { value, timestamp: leaf_ts } => {
                let child = node.ensure_child(key, ChildKind::Leaf, batch)?;
                child.write_leaf(*leaf_ts, value.clone(), force, batch)?;
            }
        }
    }

    node.touch_interior(timestamp, batch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(json: serde_json::Value, timestamp: Timestamp) -> BTreeMap<String, MapEntry> {
        match MapEntry::from_json(&json, timestamp).unwrap() {
            MapEntry::Map(map) => map,
            MapEntry::Leaf { .. } => panic!("test source must be a map"),
        }
    }

    fn leaf_int(node: &Node, path: &[&str]) -> Option<i64> {
        node.find(path).and_then(|n| n.value()).and_then(|v| v.as_int())
    }

    #[test]
    fn merge_adds_without_disturbing_siblings() {
        let root = Node::new_root();
        let mut batch = Batch::default();
        let source = scratch(serde_json::json!({"a": {"x": 1}}), 5);
        apply_map(&root, &source, None, UpdateBehavior::Merge, 5, false, &mut batch).unwrap();

        let more = scratch(serde_json::json!({"a": {"y": 2}}), 6);
        apply_map(&root, &more, None, UpdateBehavior::Merge, 6, false, &mut batch).unwrap();

        assert_eq!(leaf_int(&root, &["a", "x"]), Some(1));
        assert_eq!(leaf_int(&root, &["a", "y"]), Some(2));
        assert_eq!(root.find_topics(&["a"]).unwrap().modtime(), 6);
    }

    #[test]
    fn replace_removes_absent_children() {
        let root = Node::new_root();
        let mut batch = Batch::default();
        let source = scratch(serde_json::json!({"a": {"x": 1, "y": 2}}), 5);
        apply_map(&root, &source, None, UpdateBehavior::Merge, 5, false, &mut batch).unwrap();

        let replacement = scratch(serde_json::json!({"a": {"y": 9}}), 8);
        let ubt = UpdateBehaviorTree::merge()
            .with_child("a", UpdateBehaviorTree::replace());
        apply_map(&root, &replacement, Some(&ubt), UpdateBehavior::Merge, 8, false, &mut batch)
            .unwrap();

        assert_eq!(leaf_int(&root, &["a", "x"]), None);
        assert_eq!(leaf_int(&root, &["a", "y"]), Some(9));
    }

    #[test]
    fn replace_spares_children_with_merge_override() {
        let root = Node::new_root();
        let mut batch = Batch::default();
        let source = scratch(serde_json::json!({"keep": 1, "drop": 2}), 5);
        apply_map(&root, &source, None, UpdateBehavior::Merge, 5, false, &mut batch).unwrap();

        let replacement = scratch(serde_json::json!({"new": 3}), 8);
        let ubt = UpdateBehaviorTree::replace()
            .with_child("keep", UpdateBehaviorTree::merge());
        apply_map(&root, &replacement, Some(&ubt), UpdateBehavior::Merge, 8, false, &mut batch)
            .unwrap();

        assert_eq!(leaf_int(&root, &["keep"]), Some(1));
        assert_eq!(leaf_int(&root, &["drop"]), None);
        assert_eq!(leaf_int(&root, &["new"]), Some(3));
    }

    #[test]
    fn wildcard_override_applies_to_unnamed_children() {
        let root = Node::new_root();
        let mut batch = Batch::default();
        let source = scratch(serde_json::json!({"s1": {"a": 1, "b": 2}, "s2": {"c": 3}}), 5);
        apply_map(&root, &source, None, UpdateBehavior::Merge, 5, false, &mut batch).unwrap();

        // Replace every service subtree via the wildcard.
        let replacement = scratch(serde_json::json!({"s1": {"a": 10}, "s2": {"d": 4}}), 9);
        let ubt = UpdateBehaviorTree::merge()
            .with_child(UpdateBehaviorTree::WILDCARD, UpdateBehaviorTree::replace());
        apply_map(&root, &replacement, Some(&ubt), UpdateBehavior::Merge, 9, false, &mut batch)
            .unwrap();

        assert_eq!(leaf_int(&root, &["s1", "a"]), Some(10));
        assert_eq!(leaf_int(&root, &["s1", "b"]), None);
        assert_eq!(leaf_int(&root, &["s2", "c"]), None);
        assert_eq!(leaf_int(&root, &["s2", "d"]), Some(4));
    }

    #[test]
    fn kind_conflict_aborts_at_that_sibling_only() {
        let root = Node::new_root();
        let mut batch = Batch::default();
        let source = scratch(serde_json::json!({"a": {"x": 1}}), 5);
        apply_map(&root, &source, None, UpdateBehavior::Merge, 5, false, &mut batch).unwrap();

        // "a" is interior; writing a scalar onto it must fail. BTreeMap
        // ordering applies "aa" after the failure point is never reached,
        // while "_first" lands before it.
        let bad = scratch(serde_json::json!({"_first": 7, "a": 3}), 6);
        let err = apply_map(&root, &bad, None, UpdateBehavior::Merge, 6, false, &mut batch);
        assert!(matches!(err, Err(StoreError::NodeKindConflict { .. })));
        assert_eq!(leaf_int(&root, &["_first"]), Some(7));
        assert_eq!(leaf_int(&root, &["a", "x"]), Some(1));
    }

    #[test]
    fn scratch_accumulation_last_record_wins() {
        let mut scratch = MapEntry::empty_map();
        let path = vec!["a".to_string(), "b".to_string()];
        scratch.set_at(&path, ConfigValue::Int(1), 3);
        scratch.set_at(&path, ConfigValue::Int(2), 9);
        scratch.remove_at(&["a".to_string(), "missing".to_string()]);

        assert_eq!(scratch.max_timestamp(), 9);
        let MapEntry::Map(top) = &scratch else { panic!() };
        let MapEntry::Map(inner) = &top["a"] else { panic!() };
        assert_eq!(
            inner["b"],
            MapEntry::Leaf { value: ConfigValue::Int(2), timestamp: 9 }
        );
    }
}
