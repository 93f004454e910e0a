//! Rill Reactive - collections, sync and live queries.
//!
//! This crate holds the stateful side of Rill. A `Collection` receives rows
//! from a `SyncSource` through transactional sync batches, layers optimistic
//! local mutations on top, and notifies subscriptions with coalesced change
//! sets. A `LiveQueryCollection` keeps the result of a query over other
//! collections incrementally up to date.
//!
//! # Core Concepts
//!
//! - `ChangeSet`: ordered insert/update/delete messages for one transition
//! - `Collection`: synced rows plus the optimistic overlay
//! - `SyncHandle`: `begin` / `write` / `truncate` / `commit` / `mark_ready`
//! - `CollectionSubscription`: filtered delivery, snapshots, truncate buffering
//! - `LiveQueryCollection`: optimized, compiled query fed by subscriptions
//!
//! # Example
//!
//! ```ignore
//! use rill_query::ast::{Expr, QueryIr};
//! use rill_reactive::{LiveQueryCollection, LiveQueryConfig};
//!
//! let query = QueryIr::from_collection("todos", "t")
//!     .with_where(Expr::eq(Expr::field("t", "done"), Expr::val(false)));
//! let open = LiveQueryCollection::new(LiveQueryConfig::new("open-todos", query).with_collection(&todos))?;
//! let rows = open.to_vec();
//! ```

#![no_std]

extern crate alloc;

pub mod change_set;
pub mod collection;
pub mod live_query;
pub mod subscription;
pub mod transaction;

pub use change_set::{ChangeKind, ChangeMessage, ChangeSet};
pub use collection::{
    Collection, CollectionConfig, CollectionStatus, KeyFn, RowUpdateMode, StatusListener, SyncHandle,
    SyncOperation, SyncSource,
};
pub use live_query::{LiveQueryCollection, LiveQueryConfig};
pub use subscription::{ChangeCallback, CollectionSubscription, SubscribeOptions, SubscriptionId};
pub use transaction::{Mutation, MutationFn, MutationKind, Transaction, TransactionId, TransactionState};

// Re-export commonly used types from dependencies
pub use rill_core::{Completion, Error, Key, Result, Value};
pub use rill_incremental::Delta;
