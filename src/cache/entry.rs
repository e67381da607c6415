//! Cache entries and their freshness rules.

use std::time::Duration;
use tokio::time::Instant;

use crate::error::ErrorInfo;

use super::key::QueryKey;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
  /// Known key, never fetched
  Idle,
  /// A fetch is in flight; previous data (if any) is still readable
  Loading,
  /// The last fetch succeeded
  Success,
  /// The last fetch failed; previous data (if any) is still readable
  Error,
}

/// Staleness and retention windows for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// How long fetched data counts as fresh
  pub stale_after: Duration,
  /// How long an untouched, unsubscribed entry survives garbage collection
  pub gc_after: Duration,
}

impl QueryOptions {
  pub const fn new(stale_after: Duration, gc_after: Duration) -> Self {
    Self {
      stale_after,
      gc_after,
    }
  }
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self::new(Duration::from_secs(5 * 60), Duration::from_secs(30 * 60))
  }
}

/// Cached state for one query key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
  pub key: QueryKey,
  pub data: Option<V>,
  pub status: QueryStatus,
  /// When data was last confirmed by a fetch
  pub last_fetched_at: Option<Instant>,
  /// Set by invalidation; cleared by the next confirmed fetch
  pub invalidated: bool,
  pub stale_after: Duration,
  pub gc_after: Duration,
  pub error: Option<ErrorInfo>,
}

impl<V> CacheEntry<V> {
  pub fn idle(key: QueryKey, options: QueryOptions) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      last_fetched_at: None,
      invalidated: false,
      stale_after: options.stale_after,
      gc_after: options.gc_after,
      error: None,
    }
  }

  /// Fresh means: confirmed by a fetch less than `stale_after` ago and not
  /// invalidated since.
  pub fn is_fresh(&self, now: Instant) -> bool {
    if self.invalidated || self.data.is_none() {
      return false;
    }
    match self.last_fetched_at {
      Some(at) => now.saturating_duration_since(at) < self.stale_after,
      None => false,
    }
  }

  pub fn is_stale(&self, now: Instant) -> bool {
    !self.is_fresh(now)
  }

  pub fn apply_options(&mut self, options: QueryOptions) {
    self.stale_after = options.stale_after;
    self.gc_after = options.gc_after;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;

  fn fetched_entry(at: Instant) -> CacheEntry<u32> {
    let mut entry = CacheEntry::idle(
      query_key!["plan", "today"],
      QueryOptions::new(Duration::from_secs(60), Duration::from_secs(600)),
    );
    entry.data = Some(1);
    entry.status = QueryStatus::Success;
    entry.last_fetched_at = Some(at);
    entry
  }

  #[test]
  fn test_idle_entry_is_stale() {
    let entry: CacheEntry<u32> = CacheEntry::idle(query_key!["plan"], QueryOptions::default());
    assert!(entry.is_stale(Instant::now()));
  }

  #[test]
  fn test_staleness_boundary() {
    let at = Instant::now();
    let entry = fetched_entry(at);

    assert!(entry.is_fresh(at + Duration::from_secs(59)));
    // Exactly at the boundary the entry is stale
    assert!(entry.is_stale(at + Duration::from_secs(60)));
  }

  #[test]
  fn test_invalidated_entry_is_stale() {
    let at = Instant::now();
    let mut entry = fetched_entry(at);
    entry.invalidated = true;

    assert!(entry.is_stale(at));
  }
}
