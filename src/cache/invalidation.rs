//! Post-mutation invalidation.

use std::collections::BTreeSet;
use tracing::debug;

use super::key::QueryKey;
use super::mutation::MutationOutcome;
use super::store::QueryCache;

/// A kind of mutation together with the key prefixes it makes stale.
pub trait Invalidates {
  fn name(&self) -> &'static str;

  fn invalidated_prefixes(&self) -> Vec<QueryKey>;
}

/// Marks dependent queries stale once a mutation is confirmed.
pub struct InvalidationRouter<V>
where
  V: Clone + Send + Sync + 'static,
{
  cache: QueryCache<V>,
}

impl<V> Clone for InvalidationRouter<V>
where
  V: Clone + Send + Sync + 'static,
{
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
    }
  }
}

impl<V> InvalidationRouter<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new(cache: QueryCache<V>) -> Self {
    Self { cache }
  }

  /// Invalidate everything `mutation` affects and return the cached keys
  /// that were marked stale.
  pub fn after_mutation<M: Invalidates>(&self, mutation: &M) -> BTreeSet<QueryKey> {
    let invalidated: BTreeSet<QueryKey> = mutation
      .invalidated_prefixes()
      .iter()
      .flat_map(|prefix| self.cache.invalidate(prefix))
      .collect();
    debug!(
      mutation = mutation.name(),
      count = invalidated.len(),
      "invalidated after mutation"
    );
    invalidated
  }

  /// Like [`InvalidationRouter::after_mutation`], but only for confirmed
  /// outcomes. A rolled back mutation invalidates nothing.
  pub fn after_outcome<M: Invalidates, T>(
    &self,
    mutation: &M,
    outcome: &MutationOutcome<T>,
  ) -> BTreeSet<QueryKey> {
    if outcome.is_confirmed() {
      self.after_mutation(mutation)
    } else {
      BTreeSet::new()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorInfo, ErrorKind};
  use crate::query_key;

  struct Complete;

  impl Invalidates for Complete {
    fn name(&self) -> &'static str {
      "complete"
    }

    fn invalidated_prefixes(&self) -> Vec<QueryKey> {
      vec![query_key!["plan", "today"], query_key!["progress"]]
    }
  }

  fn seeded() -> QueryCache<u32> {
    let cache = QueryCache::new();
    for key in [
      query_key!["plan", "today"],
      query_key!["plan", "date", "2026-10-20"],
      query_key!["progress", "overview", "30d"],
      query_key!["progress", "history", "7d"],
      query_key!["user", "profile"],
    ] {
      cache.write_confirmed(&key, 1);
    }
    cache
  }

  #[test]
  fn test_only_matching_prefixes_are_invalidated() {
    let cache = seeded();
    let router = InvalidationRouter::new(cache.clone());

    let invalidated = router.after_mutation(&Complete);

    let expected: BTreeSet<QueryKey> = [
      query_key!["plan", "today"],
      query_key!["progress", "history", "7d"],
      query_key!["progress", "overview", "30d"],
    ]
    .into_iter()
    .collect();
    assert_eq!(invalidated, expected);
    assert!(!cache.read(&query_key!["plan", "date", "2026-10-20"]).invalidated);
    assert!(!cache.read(&query_key!["user", "profile"]).invalidated);
    // Soft invalidation keeps data
    assert_eq!(cache.data(&query_key!["plan", "today"]), Some(1));
  }

  #[test]
  fn test_rolled_back_outcome_invalidates_nothing() {
    let cache = seeded();
    let router = InvalidationRouter::new(cache.clone());
    let outcome: MutationOutcome<()> =
      MutationOutcome::RolledBack(ErrorInfo::new(ErrorKind::ServerError, "boom"));

    assert!(router.after_outcome(&Complete, &outcome).is_empty());
    assert!(!cache.read(&query_key!["plan", "today"]).invalidated);
  }
}
