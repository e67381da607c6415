//! Client-side query cache.
//!
//! This module is independent of the wellness API. It provides:
//! - Structural query keys with prefix matching
//! - A shared cache with staleness, single-flight fetching and GC
//! - Retry policy with capped exponential backoff
//! - Optimistic mutations with snapshot rollback
//! - Invalidation of dependent queries after confirmed mutations

mod entry;
mod invalidation;
mod key;
mod mutation;
mod retry;
mod store;

pub use entry::{CacheEntry, QueryOptions};
pub use invalidation::{Invalidates, InvalidationRouter};
pub use key::{QueryKey, Segment};
pub use mutation::{MutationController, OptimisticUpdate};
pub use retry::RetryPolicy;
pub use store::{CacheStats, QueryCache, Subscription};
