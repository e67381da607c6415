//! Optimistic mutations with snapshot rollback.
//!
//! A mutation moves through `Pending -> Applying -> InFlight` and settles as
//! either `Confirmed` or `RolledBack`. The optimistic writes are visible to
//! every reader before the remote call is first polled, and a rollback is
//! complete before the failure is handed back to the caller.

use std::collections::BTreeSet;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::ErrorInfo;

use super::key::QueryKey;
use super::store::{QueryCache, Snapshot};

/// Speculative change to one cache entry.
pub struct OptimisticUpdate<V> {
  key: QueryKey,
  transform: Box<dyn FnOnce(&V) -> V + Send>,
}

impl<V> OptimisticUpdate<V> {
  pub fn new<F>(key: QueryKey, transform: F) -> Self
  where
    F: FnOnce(&V) -> V + Send + 'static,
  {
    Self {
      key,
      transform: Box::new(transform),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Pending,
  Applying,
  InFlight,
  Confirmed,
  RolledBack,
}

/// What a mutation needs to undo itself.
#[derive(Debug)]
pub struct MutationContext<V> {
  pub previous_snapshot: Snapshot<V>,
  /// Values written optimistically; keys without cached data are skipped
  pub applied: Vec<(QueryKey, V)>,
  pub affected_keys: BTreeSet<QueryKey>,
}

/// Settled result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
  Confirmed(T),
  RolledBack(ErrorInfo),
}

impl<T> MutationOutcome<T> {
  pub fn is_confirmed(&self) -> bool {
    matches!(self, MutationOutcome::Confirmed(_))
  }

  pub fn into_result(self) -> Result<T, ErrorInfo> {
    match self {
      MutationOutcome::Confirmed(value) => Ok(value),
      MutationOutcome::RolledBack(error) => Err(error),
    }
  }
}

/// One mutation invocation.
pub struct Mutation<V>
where
  V: Clone + Send + Sync + 'static,
{
  name: String,
  cache: QueryCache<V>,
  phase: MutationPhase,
  context: Option<MutationContext<V>>,
}

impl<V> Mutation<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new(name: impl Into<String>, cache: QueryCache<V>) -> Self {
    Self {
      name: name.into(),
      cache,
      phase: MutationPhase::Pending,
      context: None,
    }
  }

  pub fn phase(&self) -> MutationPhase {
    self.phase
  }

  pub fn context(&self) -> Option<&MutationContext<V>> {
    self.context.as_ref()
  }

  fn transition(&mut self, to: MutationPhase) {
    debug!(mutation = %self.name, from = ?self.phase, to = ?to, "mutation transition");
    self.phase = to;
  }

  /// Snapshot every affected entry, then apply the optimistic transforms.
  /// Fetches already running for those keys are detached first so they
  /// cannot overwrite the optimistic values.
  pub fn apply(&mut self, updates: Vec<OptimisticUpdate<V>>) {
    debug_assert_eq!(self.phase, MutationPhase::Pending);
    self.transition(MutationPhase::Applying);

    let keys: Vec<QueryKey> = updates.iter().map(|u| u.key.clone()).collect();
    self.cache.cancel_fetches(&keys);
    let previous_snapshot = self.cache.snapshot(&keys);

    let mut applied = Vec::new();
    for update in updates {
      if let Some(value) = self.cache.update(&update.key, update.transform) {
        applied.push((update.key, value));
      }
    }

    self.context = Some(MutationContext {
      previous_snapshot,
      applied,
      affected_keys: keys.into_iter().collect(),
    });
    self.transition(MutationPhase::InFlight);
  }

  /// Accept the mutation, optionally replacing optimistic values with the
  /// server's.
  pub fn confirm(&mut self, authoritative: Vec<(QueryKey, V)>) {
    debug_assert_eq!(self.phase, MutationPhase::InFlight);
    for (key, value) in authoritative {
      self.cache.write_confirmed(&key, value);
    }
    self.context = None;
    self.transition(MutationPhase::Confirmed);
    info!(mutation = %self.name, "mutation confirmed");
  }

  /// Put every affected entry back the way it was before `apply`.
  pub fn roll_back(&mut self, error: &ErrorInfo) {
    debug_assert_eq!(self.phase, MutationPhase::InFlight);
    if let Some(context) = self.context.take() {
      self.cache.restore(context.previous_snapshot);
    }
    self.transition(MutationPhase::RolledBack);
    warn!(mutation = %self.name, kind = %error.kind, message = %error.message, "mutation rolled back");
  }
}

/// Runs mutations against a shared cache.
pub struct MutationController<V>
where
  V: Clone + Send + Sync + 'static,
{
  cache: QueryCache<V>,
}

impl<V> Clone for MutationController<V>
where
  V: Clone + Send + Sync + 'static,
{
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
    }
  }
}

impl<V> MutationController<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new(cache: QueryCache<V>) -> Self {
    Self { cache }
  }

  /// Apply `updates`, run `call`, then confirm or roll back.
  ///
  /// `call` is not polled until the optimistic writes are in place. On
  /// success, `authoritative` maps the response to entries that should be
  /// overwritten with server data.
  pub async fn execute<T, Fut, A>(
    &self,
    name: &str,
    updates: Vec<OptimisticUpdate<V>>,
    call: Fut,
    authoritative: A,
  ) -> MutationOutcome<T>
  where
    Fut: Future<Output = Result<T, ErrorInfo>>,
    A: FnOnce(&T) -> Vec<(QueryKey, V)>,
  {
    let mut mutation = Mutation::new(name, self.cache.clone());
    mutation.apply(updates);

    match call.await {
      Ok(response) => {
        mutation.confirm(authoritative(&response));
        MutationOutcome::Confirmed(response)
      }
      Err(error) => {
        mutation.roll_back(&error);
        MutationOutcome::RolledBack(error)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryOptions;
  use crate::error::ErrorKind;
  use crate::query_key;
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq)]
  struct Ritual {
    id: i64,
    completed: bool,
  }

  fn cache_with_ritual(id: i64) -> (QueryCache<Ritual>, QueryKey) {
    let cache = QueryCache::new();
    let key = query_key!["rituals", "detail", id];
    cache.write_confirmed(&key, Ritual { id, completed: false });
    (cache, key)
  }

  fn complete(key: &QueryKey) -> OptimisticUpdate<Ritual> {
    OptimisticUpdate::new(key.clone(), |r: &Ritual| Ritual {
      completed: true,
      ..r.clone()
    })
  }

  #[tokio::test]
  async fn test_optimistic_write_visible_before_call() {
    let (cache, key) = cache_with_ritual(42);
    let controller = MutationController::new(cache.clone());

    let observer = cache.clone();
    let observed_key = key.clone();
    let call = async move {
      // Runs only once the mutation has dispatched
      Ok::<_, ErrorInfo>(observer.data(&observed_key).map(|r| r.completed))
    };

    let outcome = controller
      .execute("complete", vec![complete(&key)], call, |_| Vec::new())
      .await;

    assert_eq!(outcome, MutationOutcome::Confirmed(Some(true)));
    assert_eq!(cache.data(&key).map(|r| r.completed), Some(true));
  }

  #[tokio::test]
  async fn test_failure_restores_exact_snapshot() {
    let (cache, key) = cache_with_ritual(42);
    let untouched = query_key!["rituals", "detail", 1000i64];
    let before = cache.peek(&key);
    let controller = MutationController::new(cache.clone());

    let outcome: MutationOutcome<()> = controller
      .execute(
        "complete",
        vec![complete(&key), complete(&untouched)],
        async { Err(ErrorInfo::new(ErrorKind::ServerError, "boom")) },
        |_| Vec::new(),
      )
      .await;

    match outcome {
      MutationOutcome::RolledBack(error) => assert_eq!(error.kind, ErrorKind::ServerError),
      other => panic!("expected rollback, got {:?}", other),
    }
    assert_eq!(cache.peek(&key), before);
    assert!(cache.peek(&untouched).is_none());
  }

  #[tokio::test]
  async fn test_confirm_writes_authoritative_data() {
    let (cache, key) = cache_with_ritual(7);
    let controller = MutationController::new(cache.clone());
    let response_key = key.clone();

    let outcome = controller
      .execute(
        "complete",
        vec![complete(&key)],
        async { Ok::<_, ErrorInfo>(Ritual { id: 7, completed: true }) },
        move |ritual| vec![(response_key, ritual.clone())],
      )
      .await;

    assert!(outcome.is_confirmed());
    let entry = cache.read(&key);
    assert_eq!(entry.data, Some(Ritual { id: 7, completed: true }));
    assert!(entry.last_fetched_at.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_running_fetch_cannot_overwrite_optimistic_value() {
    let (cache, key) = cache_with_ritual(5);
    let stale = QueryOptions::new(Duration::ZERO, Duration::from_secs(60));
    let refetch = || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(Ritual { id: 5, completed: false })
    };
    cache.revalidate(&key, refetch, stale);

    let controller = MutationController::new(cache.clone());
    let outcome = controller
      .execute("complete", vec![complete(&key)], async { Ok::<_, ErrorInfo>(()) }, |_| Vec::new())
      .await;
    assert!(outcome.is_confirmed());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.data(&key).map(|r| r.completed), Some(true));
  }

  #[test]
  fn test_phases() {
    let (cache, key) = cache_with_ritual(1);
    let mut mutation = Mutation::new("complete", cache);
    assert_eq!(mutation.phase(), MutationPhase::Pending);

    mutation.apply(vec![complete(&key)]);
    assert_eq!(mutation.phase(), MutationPhase::InFlight);
    let context = mutation.context().unwrap();
    assert_eq!(context.applied.len(), 1);
    assert!(context.affected_keys.contains(&key));

    mutation.roll_back(&ErrorInfo::new(ErrorKind::Network, "offline"));
    assert_eq!(mutation.phase(), MutationPhase::RolledBack);
    assert!(mutation.context().is_none());
  }
}
