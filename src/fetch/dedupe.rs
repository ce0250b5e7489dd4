//! Merges concurrent identical fetches into one network call.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::cache::CacheKey;
use crate::error::ApiError;

pub type FetchResult = Result<Arc<Value>, ApiError>;

/// A fetch every waiter can await; all of them see the same result.
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
  generation: u64,
  fetch: SharedFetch,
}

#[derive(Default)]
struct State {
  in_flight: HashMap<CacheKey, InFlight>,
  next_generation: u64,
}

/// Tracks in-flight fetches by cache key.
///
/// The window is the lifetime of the request: anything issued before it
/// settles joins it, anything after starts a new one.
#[derive(Clone, Default)]
pub struct Deduplicator {
  state: Arc<Mutex<State>>,
}

impl Deduplicator {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Join the in-flight fetch for `key`, or start one with `fetcher`.
  ///
  /// `fetcher` runs under the deduplicator's lock and must not block. The
  /// second value is `true` when a new fetch was started.
  pub fn fetch<F>(&self, key: &CacheKey, fetcher: F) -> (SharedFetch, bool)
  where
    F: FnOnce() -> BoxFuture<'static, FetchResult>,
  {
    let mut state = self.lock();
    if let Some(existing) = state.in_flight.get(key) {
      trace!(key = %key, "joining in-flight fetch");
      return (existing.fetch.clone(), false);
    }

    let generation = state.next_generation;
    state.next_generation += 1;

    let inner = fetcher();
    let registry = Arc::clone(&self.state);
    let settled_key = key.clone();
    let fetch = async move {
      let result = inner.await;
      let mut state = registry.lock().unwrap_or_else(PoisonError::into_inner);
      // A reset may have replaced the record in the meantime
      if state
        .in_flight
        .get(&settled_key)
        .is_some_and(|f| f.generation == generation)
      {
        state.in_flight.remove(&settled_key);
      }
      result
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.clone(),
      InFlight {
        generation,
        fetch: fetch.clone(),
      },
    );
    (fetch, true)
  }

  /// Start a fetch that is never shared, for endpoints that opt out.
  pub fn fetch_uncached<F>(&self, fetcher: F) -> SharedFetch
  where
    F: FnOnce() -> BoxFuture<'static, FetchResult>,
  {
    fetcher().shared()
  }

  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    self.lock().in_flight.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().in_flight.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Forget every in-flight record. Running fetches still complete.
  pub fn clear(&self) {
    self.lock().in_flight.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn counting_fetcher(
    calls: &Arc<AtomicU32>,
  ) -> impl FnOnce() -> BoxFuture<'static, FetchResult> {
    let calls = Arc::clone(calls);
    move || {
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Arc::new(json!({ "call": n })))
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_call() {
    let dedupe = Deduplicator::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = CacheKey::new("getClasses", &Value::Null);

    let (first, started) = dedupe.fetch(&key, counting_fetcher(&calls));
    assert!(started);
    let waiters: Vec<_> = (0..4)
      .map(|_| {
        let (fetch, started) = dedupe.fetch(&key, counting_fetcher(&calls));
        assert!(!started);
        fetch
      })
      .collect();

    let first = first.await.unwrap();
    for waiter in waiters {
      assert!(Arc::ptr_eq(&waiter.await.unwrap(), &first));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(dedupe.is_empty());
  }

  #[tokio::test]
  async fn test_fetch_after_settle_starts_new_call() {
    let dedupe = Deduplicator::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = CacheKey::new("getClasses", &Value::Null);

    let (fetch, _) = dedupe.fetch(&key, counting_fetcher(&calls));
    fetch.await.unwrap();
    let (fetch, started) = dedupe.fetch(&key, counting_fetcher(&calls));
    assert!(started);
    assert_eq!(*fetch.await.unwrap(), json!({ "call": 1 }));
  }

  #[tokio::test]
  async fn test_errors_are_shared_and_cleared() {
    let dedupe = Deduplicator::new();
    let key = CacheKey::new("getClasses", &Value::Null);

    let (a, _) = dedupe.fetch(&key, || {
      async { Err(ApiError::from_response(500, None)) }.boxed()
    });
    let (b, started) = dedupe.fetch(&key, || async { Ok(Arc::new(json!(1))) }.boxed());
    assert!(!started);

    assert_eq!(a.await.unwrap_err().status, Some(500));
    assert_eq!(b.await.unwrap_err().status, Some(500));
    assert!(!dedupe.is_in_flight(&key));
  }

  #[tokio::test]
  async fn test_uncached_fetch_is_not_registered() {
    let dedupe = Deduplicator::new();
    let calls = Arc::new(AtomicU32::new(0));

    let a = dedupe.fetch_uncached(counting_fetcher(&calls));
    let b = dedupe.fetch_uncached(counting_fetcher(&calls));
    assert!(dedupe.is_empty());

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
