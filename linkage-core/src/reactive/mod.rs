//! Reactive Collections
//!
//! Array views over resource keys that stay in sync with the graph
//! without eagerly copying membership.
//!
//! # Concepts
//!
//! ## Signals
//!
//! Every array owns a [`Signal`]: a dirty flag plus subscribers. A change
//! to the underlying relationship or record set marks the signal stale.
//!
//! ## Lazy synchronization
//!
//! A stale array pulls its membership from its [`ArrayManager`] on the
//! next length, index or iteration read and is clean again afterwards.
//! Many changes between two reads cost a single pull.
//!
//! ## Mutation
//!
//! [`ManyArray`] accepts array-style edits (`push`, `splice`, `set`, ...).
//! They are decomposed into local relationship operations and forwarded
//! to the manager. [`LiveArray`] and [`QueryArray`] are read-only.

mod array;
mod live;
mod manager;
mod many;
mod query;
mod signal;

pub use array::ReactiveResourceArray;
pub use live::LiveArray;
pub use manager::{ArrayManager, ArraySnapshot, ArraySource};
pub use many::ManyArray;
pub use query::QueryArray;
pub use signal::{Signal, SubscriberId};
