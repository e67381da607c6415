//! The process-wide query cache: staleness, single-flight fetching,
//! stale-while-revalidate reads and garbage collection.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ErrorInfo, ErrorKind};

use super::entry::{CacheEntry, QueryOptions, QueryStatus};
use super::key::QueryKey;

/// Outcome of a fetch as seen by the cache and its callers.
pub type FetchResult<V> = Result<V, ErrorInfo>;

type InFlight<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

/// Prior state of a set of entries, used to undo optimistic writes.
/// `None` means the key had no entry.
pub type Snapshot<V> = Vec<(QueryKey, Option<CacheEntry<V>>)>;

/// A running fetch attached to a slot.
struct Fetch<V> {
  id: u64,
  /// Status to fall back to if the fetch is detached before it settles
  prior_status: QueryStatus,
  future: InFlight<V>,
}

struct Slot<V> {
  entry: CacheEntry<V>,
  in_flight: Option<Fetch<V>>,
  last_accessed: Instant,
  subscribers: usize,
}

impl<V> Slot<V> {
  fn new(key: QueryKey, options: QueryOptions, now: Instant) -> Self {
    Self {
      entry: CacheEntry::idle(key, options),
      in_flight: None,
      last_accessed: now,
      subscribers: 0,
    }
  }

  /// Stop recording the running fetch. Callers already awaiting it still
  /// get its result, but `settle` drops it and the next read starts anew.
  fn detach(&mut self) -> bool {
    match self.in_flight.take() {
      Some(fetch) => {
        if self.entry.status == QueryStatus::Loading {
          self.entry.status = fetch.prior_status;
        }
        true
      }
      None => false,
    }
  }

  fn is_collectable(&self, now: Instant) -> bool {
    self.subscribers == 0
      && self.in_flight.is_none()
      && now.saturating_duration_since(self.last_accessed) >= self.entry.gc_after
  }
}

struct State<V> {
  slots: HashMap<QueryKey, Slot<V>>,
  next_fetch_id: u64,
  defaults: QueryOptions,
}

impl<V> State<V> {
  fn slot_mut(&mut self, key: &QueryKey, now: Instant) -> &mut Slot<V> {
    let defaults = self.defaults;
    self
      .slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), defaults, now))
  }
}

/// Counters describing the cache contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub idle: usize,
  pub loading: usize,
  pub success: usize,
  pub error: usize,
  pub in_flight: usize,
  pub subscribers: usize,
}

/// Keyed store of query results.
///
/// Cloning is cheap and every clone addresses the same storage. All
/// read-modify-write sequences run under one mutex which is never held
/// across an `.await`.
pub struct QueryCache<V> {
  inner: Arc<Mutex<State<V>>>,
}

impl<V> Clone for QueryCache<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V> Default for QueryCache<V>
where
  V: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<V> QueryCache<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::with_defaults(QueryOptions::default())
  }

  /// Create a cache whose implicitly created entries use `defaults`.
  pub fn with_defaults(defaults: QueryOptions) -> Self {
    Self {
      inner: Arc::new(Mutex::new(State {
        slots: HashMap::new(),
        next_fetch_id: 0,
        defaults,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State<V>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Current entry for `key`, creating an idle one if absent. Never fetches.
  pub fn read(&self, key: &QueryKey) -> CacheEntry<V> {
    let now = Instant::now();
    let mut state = self.lock();
    let slot = state.slot_mut(key, now);
    slot.last_accessed = now;
    slot.entry.clone()
  }

  /// Current entry for `key` without creating or touching it.
  pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
    self.lock().slots.get(key).map(|slot| slot.entry.clone())
  }

  /// Cached data for `key`, if any.
  pub fn data(&self, key: &QueryKey) -> Option<V> {
    self.lock().slots.get(key).and_then(|slot| slot.entry.data.clone())
  }

  /// Return fresh data for `key`, fetching it when stale or missing.
  ///
  /// A fresh entry answers without suspending. Otherwise the caller joins
  /// the key's in-flight fetch or starts one; concurrent callers for the
  /// same key all receive the result of a single `fetcher` invocation.
  ///
  /// `fetcher` is called with the cache lock held and must only build the
  /// future, not touch the cache.
  pub async fn ensure_fresh<F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: QueryOptions,
  ) -> FetchResult<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = FetchResult<V>> + Send + 'static,
  {
    let in_flight = {
      let now = Instant::now();
      let mut state = self.lock();
      let slot = state.slot_mut(key, now);
      slot.entry.apply_options(options);
      slot.last_accessed = now;

      if slot.entry.is_fresh(now) {
        if let Some(data) = &slot.entry.data {
          trace!(%key, "cache hit");
          return Ok(data.clone());
        }
      }

      self.join_or_start(&mut state, key, fetcher)
    };

    in_flight.await
  }

  /// Stale-while-revalidate read.
  ///
  /// Returns the current entry immediately. When it is stale, a background
  /// refetch is started unless one is already running for the key.
  pub fn revalidate<F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions) -> CacheEntry<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = FetchResult<V>> + Send + 'static,
  {
    let now = Instant::now();
    let mut state = self.lock();
    let slot = state.slot_mut(key, now);
    slot.entry.apply_options(options);
    slot.last_accessed = now;
    let snapshot = slot.entry.clone();

    if snapshot.is_stale(now) {
      debug!(%key, "stale entry, revalidating in background");
      let _ = self.join_or_start(&mut state, key, fetcher);
    }

    snapshot
  }

  /// Join the running fetch for `key` or spawn a new one. Requires the slot
  /// to exist.
  fn join_or_start<F, Fut>(&self, state: &mut State<V>, key: &QueryKey, fetcher: F) -> InFlight<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = FetchResult<V>> + Send + 'static,
  {
    let fetch_id = state.next_fetch_id;
    let now = Instant::now();
    let slot = state.slot_mut(key, now);

    if let Some(fetch) = &slot.in_flight {
      trace!(%key, "joining in-flight fetch");
      return fetch.future.clone();
    }

    debug!(%key, fetch_id, "starting fetch");
    let prior_status = slot.entry.status;
    slot.entry.status = QueryStatus::Loading;

    let fetch = fetcher();
    let cache = Arc::downgrade(&self.inner);
    let settle_key = key.clone();
    // The fetch runs on its own task so that it completes even when every
    // caller has gone away.
    let handle = tokio::spawn(async move {
      let result = fetch.await;
      settle(&cache, &settle_key, fetch_id, &result);
      result
    });

    let task_key = key.clone();
    let in_flight = async move {
      handle.await.unwrap_or_else(|e| {
        warn!(key = %task_key, error = %e, "fetch task failed");
        Err(ErrorInfo::new(
          ErrorKind::Unknown,
          format!("fetch task failed: {}", e),
        ))
      })
    }
    .boxed()
    .shared();

    slot.in_flight = Some(Fetch {
      id: fetch_id,
      prior_status,
      future: in_flight.clone(),
    });
    state.next_fetch_id += 1;
    in_flight
  }

  /// Overwrite cached data without touching freshness.
  pub fn write(&self, key: &QueryKey, data: V) {
    let now = Instant::now();
    let mut state = self.lock();
    let slot = state.slot_mut(key, now);
    slot.entry.data = Some(data);
    slot.last_accessed = now;
  }

  /// Overwrite cached data as if it had just been fetched.
  pub fn write_confirmed(&self, key: &QueryKey, data: V) {
    let now = Instant::now();
    let mut state = self.lock();
    let slot = state.slot_mut(key, now);
    slot.entry.data = Some(data);
    slot.entry.status = QueryStatus::Success;
    slot.entry.last_fetched_at = Some(now);
    slot.entry.invalidated = false;
    slot.entry.error = None;
    slot.last_accessed = now;
  }

  /// Atomically transform existing data for `key`. Returns the new value, or
  /// `None` when there was nothing to transform.
  pub fn update<F>(&self, key: &QueryKey, transform: F) -> Option<V>
  where
    F: FnOnce(&V) -> V,
  {
    let mut state = self.lock();
    let slot = state.slots.get_mut(key)?;
    let next = transform(slot.entry.data.as_ref()?);
    slot.entry.data = Some(next.clone());
    Some(next)
  }

  /// Mark every entry under `prefix` as expired. Data stays readable until
  /// the next fetch replaces it. Fetches that started before the call are
  /// detached, so their results cannot clear the flag. Returns the affected
  /// keys.
  pub fn invalidate(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    let mut state = self.lock();
    let mut keys: Vec<QueryKey> = state
      .slots
      .iter_mut()
      .filter(|(key, _)| prefix.is_prefix_of(key))
      .map(|(key, slot)| {
        if slot.detach() {
          debug!(%key, "detached in-flight fetch");
        }
        slot.entry.invalidated = true;
        key.clone()
      })
      .collect();
    keys.sort();
    debug!(%prefix, count = keys.len(), "invalidated");
    keys
  }

  pub fn invalidate_all(&self) -> Vec<QueryKey> {
    self.invalidate(&QueryKey::default())
  }

  /// Remove an entry entirely.
  pub fn evict(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
    self.lock().slots.remove(key).map(|slot| slot.entry)
  }

  /// Detach the running fetches for `keys` so that their results are not
  /// recorded. Used before optimistic writes.
  pub fn cancel_fetches(&self, keys: &[QueryKey]) {
    let mut state = self.lock();
    for key in keys {
      if let Some(slot) = state.slots.get_mut(key) {
        if slot.detach() {
          debug!(%key, "cancelled in-flight fetch");
        }
      }
    }
  }

  /// Remove every entry.
  pub fn clear(&self) {
    self.lock().slots.clear();
  }

  /// Capture the current state of `keys`.
  pub fn snapshot(&self, keys: &[QueryKey]) -> Snapshot<V> {
    let state = self.lock();
    keys
      .iter()
      .map(|key| (key.clone(), state.slots.get(key).map(|slot| slot.entry.clone())))
      .collect()
  }

  /// Put entries back exactly as captured by [`QueryCache::snapshot`].
  pub fn restore(&self, snapshot: Snapshot<V>) {
    let now = Instant::now();
    let mut state = self.lock();
    for (key, previous) in snapshot {
      match previous {
        Some(mut entry) => {
          let slot = state.slot_mut(&key, now);
          // A fetch captured as running may have settled since
          if entry.status == QueryStatus::Loading && slot.in_flight.is_none() {
            entry.status = match slot.entry.status {
              QueryStatus::Loading => QueryStatus::Idle,
              settled => settled,
            };
          }
          slot.entry = entry;
        }
        None => {
          let keep = state
            .slots
            .get(&key)
            .is_some_and(|slot| slot.in_flight.is_some() || slot.subscribers > 0);
          if keep {
            let slot = state.slot_mut(&key, now);
            let options = QueryOptions::new(slot.entry.stale_after, slot.entry.gc_after);
            slot.entry = CacheEntry::idle(key.clone(), options);
          } else {
            state.slots.remove(&key);
          }
        }
      }
    }
  }

  /// Register interest in `key`. The entry is exempt from garbage
  /// collection while any subscription is alive.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription<V> {
    let now = Instant::now();
    let mut state = self.lock();
    let slot = state.slot_mut(key, now);
    slot.subscribers += 1;
    slot.last_accessed = now;
    Subscription {
      key: key.clone(),
      cache: self.clone(),
      cancelled: Arc::new(AtomicBool::new(false)),
    }
  }

  fn unsubscribe(&self, key: &QueryKey) {
    let now = Instant::now();
    let mut state = self.lock();
    if let Some(slot) = state.slots.get_mut(key) {
      slot.subscribers = slot.subscribers.saturating_sub(1);
      slot.last_accessed = now;
    }
  }

  /// Evict entries that are unsubscribed, idle and untouched for longer
  /// than their `gc_after`. Returns the number of evicted entries.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut state = self.lock();
    let before = state.slots.len();
    state.slots.retain(|_, slot| !slot.is_collectable(now));
    let evicted = before - state.slots.len();
    if evicted > 0 {
      debug!(evicted, "garbage collected cache entries");
    }
    evicted
  }

  /// Run [`QueryCache::sweep`] every `every` until the cache is dropped.
  pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
    let cache: Weak<Mutex<State<V>>> = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match cache.upgrade() {
          Some(inner) => {
            QueryCache { inner }.sweep();
          }
          None => break,
        }
      }
    })
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.lock();
    let mut stats = CacheStats {
      entries: state.slots.len(),
      ..CacheStats::default()
    };
    for slot in state.slots.values() {
      match slot.entry.status {
        QueryStatus::Idle => stats.idle += 1,
        QueryStatus::Loading => stats.loading += 1,
        QueryStatus::Success => stats.success += 1,
        QueryStatus::Error => stats.error += 1,
      }
      if slot.in_flight.is_some() {
        stats.in_flight += 1;
      }
      stats.subscribers += slot.subscribers;
    }
    stats
  }
}

/// Record a finished fetch, unless the entry was evicted or a newer fetch
/// replaced this one in the meantime.
fn settle<V: Clone>(
  cache: &Weak<Mutex<State<V>>>,
  key: &QueryKey,
  fetch_id: u64,
  result: &FetchResult<V>,
) {
  let Some(inner) = cache.upgrade() else {
    return;
  };
  let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
  let Some(slot) = state.slots.get_mut(key) else {
    debug!(%key, "entry evicted before fetch settled");
    return;
  };
  if !matches!(&slot.in_flight, Some(fetch) if fetch.id == fetch_id) {
    trace!(%key, fetch_id, "dropping result of detached fetch");
    return;
  }
  slot.in_flight = None;

  match result {
    Ok(data) => {
      debug!(%key, "fetch succeeded");
      slot.entry.data = Some(data.clone());
      slot.entry.status = QueryStatus::Success;
      slot.entry.last_fetched_at = Some(Instant::now());
      slot.entry.invalidated = false;
      slot.entry.error = None;
    }
    Err(error) => {
      // Previous data stays readable next to the error
      warn!(%key, kind = %error.kind, message = %error.message, "fetch failed");
      slot.entry.status = QueryStatus::Error;
      slot.entry.error = Some(error.clone());
    }
  }
}

/// A consumer's interest in one key.
///
/// Cancelling a subscription does not abort the network call; the fetch
/// still completes and updates the cache, but the cancelled consumer never
/// sees the result.
pub struct Subscription<V>
where
  V: Clone + Send + Sync + 'static,
{
  key: QueryKey,
  cache: QueryCache<V>,
  cancelled: Arc<AtomicBool>,
}

impl<V> Subscription<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// Like [`QueryCache::ensure_fresh`], but yields `None` if the
  /// subscription was cancelled before the result arrived.
  pub async fn ensure_fresh<F, Fut>(&self, fetcher: F, options: QueryOptions) -> Option<FetchResult<V>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = FetchResult<V>> + Send + 'static,
  {
    let result = self.cache.ensure_fresh(&self.key, fetcher, options).await;
    if self.is_cancelled() {
      trace!(key = %self.key, "dropping result for cancelled subscription");
      return None;
    }
    Some(result)
  }
}

impl<V> Drop for Subscription<V>
where
  V: Clone + Send + Sync + 'static,
{
  fn drop(&mut self) {
    self.cache.unsubscribe(&self.key);
  }
}
