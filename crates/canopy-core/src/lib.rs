//! canopy-core - in-process hierarchical configuration store.
//!
//! A tree of named nodes whose leaves carry timestamped, validated
//! values. Every mutation is serialised through a single-writer publish
//! queue, appended to a durable transaction log, and fanned out to
//! subscribers as ordered, coalesced change events. Structural updates
//! merge or replace subtrees under an update behaviour tree, and
//! platform-multiplexed inputs reduce to a single variant before
//! merging.

pub mod config;
pub mod error;
pub mod events;
pub mod merge;
pub mod node;
pub mod platform;
mod queue;
pub mod store;
pub mod tlog;
pub mod value;

pub use config::{FlushMode, StoreConfig};
pub use error::{Result, StoreError};
pub use events::{Event, EventKind, SubscriptionHandle};
pub use merge::{MapEntry, UpdateBehavior, UpdateBehaviorTree};
pub use node::{Node, ValidatorHandle};
pub use platform::{PlatformResolver, DEFAULT_KEYWORDS};
pub use store::ConfigStore;
pub use tlog::reader::{validate, ReplayOptions};
pub use tlog::{TlogAction, TlogRecord};
pub use value::{canonical_eq, now_millis, ConfigValue, Timestamp};
