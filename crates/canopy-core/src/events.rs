//! Change events and their delivery.
//!
//! Subscribers register on any node and are invoked on the publish-queue
//! worker, after the mutation that produced the event has been applied
//! and its tlog records flushed. Within one queued action, direct events
//! dispatch in mutation order and `childChanged` notifications coalesce
//! to one per ancestor, carrying the most recent changed descendant.

use crate::node::{Node, WeakNode};
use crate::tlog::TlogRecord;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Delivered once at registration with the current state.
    Initialized,
    /// The leaf's value changed.
    Changed,
    /// Some descendant leaf changed. Coalesced per ancestor per action.
    ChildChanged,
    ChildAdded,
    ChildRemoved,
    /// The node itself was removed. Terminal.
    Removed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Changed => "changed",
            Self::ChildChanged => "childChanged",
            Self::ChildAdded => "childAdded",
            Self::ChildRemoved => "childRemoved",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// The node the subscriber registered on.
    pub node: Node,
    /// The affected child for the `child*` kinds.
    pub child: Option<Node>,
}

/// Callback signature for subscribers. Runs on the worker; must not
/// block on the queue it is being delivered from.
pub type SubscriberFn = dyn Fn(&Event) + Send + Sync;

/// Stable handle returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub(crate) node: WeakNode,
    pub(crate) id: u64,
}

/// Everything one queued action produced: tlog records and pending
/// events. Committed by the worker after the action body returns.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub(crate) records: Vec<TlogRecord>,
    direct: Vec<Event>,
    child_changed: Vec<(Node, Node)>,
    /// Set by tlog replay so case-variant collisions get a diagnostic.
    pub(crate) replay_diagnostics: bool,
}

impl Batch {
    pub(crate) fn record(&mut self, record: TlogRecord) {
        self.records.push(record);
    }

    pub(crate) fn push_direct(&mut self, event: Event) {
        self.direct.push(event);
    }

    /// Coalesce: keep first-occurrence ancestor order, latest child.
    pub(crate) fn note_child_changed(&mut self, ancestor: Node, child: Node) {
        for (existing, latest) in &mut self.child_changed {
            if Node::same(existing, &ancestor) {
                *latest = child;
                return;
            }
        }
        self.child_changed.push((ancestor, child));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty() && self.direct.is_empty() && self.child_changed.is_empty()
    }
}

/// Deliver all events collected by one action. Direct events first, in
/// mutation order, then the coalesced `childChanged` notifications, so
/// a leaf's own subscribers always hear `changed` before any ancestor
/// hears `childChanged` for the same action.
pub(crate) fn dispatch(batch: Batch) {
    for event in &batch.direct {
        deliver(event);
    }
    for (ancestor, child) in batch.child_changed {
        deliver(&Event {
            kind: EventKind::ChildChanged,
            node: ancestor,
            child: Some(child),
        });
    }
}

fn deliver(event: &Event) {
    // Snapshot under the lock so callbacks may subscribe/unsubscribe
    // without deadlocking. Entries removed mid-action still see this
    // action's events; removal is ordered before the next action.
    for callback in event.node.subscriber_snapshot() {
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
        if outcome.is_err() {
            tracing::error!(
                kind = event.kind.as_str(),
                path = event.node.path().join("."),
                "subscriber panicked; peers unaffected"
            );
        }
    }
}
