//! The query client.
//!
//! `QueryClient` is the explicit context every cache operation goes through:
//! it owns the store, the tag index, the optimistic patch logs, in-flight
//! fetches and polling. Cloning is cheap and all clones share state.
//!
//! All synchronous state lives behind one mutex that is never held across
//! an `.await`. When both are needed the deduplicator's lock is taken before
//! the state lock.

use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::{
  CacheEntry, CacheKey, CacheStore, EntryStatus, SubscriberId, SubscriptionHandle, Tag, TagIndex,
  TagRelations,
};
use crate::endpoint::{Endpoint, Mutation, OptimisticUpdate};
use crate::error::{ApiError, ClientError};
use crate::fetch::{send_once, send_with_retry, Deduplicator, FetchResult, RetryPolicy, SharedFetch, Transport};
use crate::mutation::{MutationId, OptimisticCoordinator};
use crate::notify::{Notification, NotificationSink};
use crate::polling::{PollingIntervals, PollingScheduler};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientOptions {
  /// Max age of fetched data, and how long unused entries are kept
  pub keep_unused_data_for: Duration,
  pub request_timeout: Duration,
  pub retry: RetryPolicy,
  pub polling: PollingIntervals,
  /// Field optimistic patches match records on
  pub id_field: String,
  pub notification_capacity: usize,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      keep_unused_data_for: Duration::from_secs(300),
      request_timeout: Duration::from_secs(15),
      retry: RetryPolicy::default(),
      polling: PollingIntervals::default(),
      id_field: "id".to_string(),
      notification_capacity: 64,
    }
  }
}

/// Sent on [`QueryClient::updates`] after every write to an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
  pub key: CacheKey,
  pub subscribers: Vec<SubscriberId>,
}

/// Returned by [`QueryClient::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
  pub handle: SubscriptionHandle,
  /// Whatever was cached at subscription time, possibly stale
  pub data: Option<Arc<Value>>,
}

struct State {
  store: CacheStore,
  tags: TagIndex,
  optimistic: OptimisticCoordinator,
}

struct Inner {
  state: Mutex<State>,
  dedupe: Deduplicator,
  polling: Mutex<PollingScheduler>,
  transport: Arc<dyn Transport>,
  endpoints: HashMap<String, Endpoint>,
  relations: TagRelations,
  options: ClientOptions,
  notifications: NotificationSink,
  updates: broadcast::Sender<CacheUpdate>,
  next_mutation: AtomicU64,
  next_temp_id: AtomicU64,
  /// Bumped by `reset` so fetches started before it are dropped
  generation: AtomicU64,
}

pub struct ClientBuilder {
  transport: Arc<dyn Transport>,
  endpoints: HashMap<String, Endpoint>,
  relations: TagRelations,
  options: ClientOptions,
}

impl ClientBuilder {
  pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
    self.endpoints.insert(endpoint.name().to_string(), endpoint);
    self
  }

  pub fn endpoints(self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
    endpoints.into_iter().fold(self, Self::endpoint)
  }

  pub fn relations(mut self, relations: TagRelations) -> Self {
    self.relations = relations;
    self
  }

  pub fn options(mut self, options: ClientOptions) -> Self {
    self.options = options;
    self
  }

  pub fn build(self) -> QueryClient {
    let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
    let state = State {
      store: CacheStore::new(self.options.keep_unused_data_for),
      tags: TagIndex::default(),
      optimistic: OptimisticCoordinator::new(self.options.id_field.clone()),
    };

    QueryClient {
      inner: Arc::new(Inner {
        state: Mutex::new(state),
        dedupe: Deduplicator::new(),
        polling: Mutex::new(PollingScheduler::new()),
        transport: self.transport,
        endpoints: self.endpoints,
        relations: self.relations,
        notifications: NotificationSink::new(self.options.notification_capacity),
        options: self.options,
        updates,
        next_mutation: AtomicU64::new(1),
        next_temp_id: AtomicU64::new(1),
        generation: AtomicU64::new(0),
      }),
    }
  }
}

#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
}

impl QueryClient {
  pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
    ClientBuilder {
      transport,
      endpoints: HashMap::new(),
      relations: TagRelations::default(),
      options: ClientOptions::default(),
    }
  }

  /// An empty client with no endpoints registered.
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self::builder(transport).build()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn polling(&self) -> MutexGuard<'_, PollingScheduler> {
    self
      .inner
      .polling
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn options(&self) -> &ClientOptions {
    &self.inner.options
  }

  pub fn endpoint(&self, name: &str) -> Result<&Endpoint, ClientError> {
    self
      .inner
      .endpoints
      .get(name)
      .ok_or_else(|| ClientError::UnknownEndpoint(name.to_string()))
  }

  /// Subscribe to `(endpoint, args)`.
  ///
  /// Cached data is returned right away, even when stale. A missing or
  /// stale entry gets one background fetch; the first subscriber of a polled
  /// resource class also starts its poll. Background work is only driven
  /// when called inside a tokio runtime.
  pub fn subscribe(&self, endpoint: &str, args: Value) -> Result<Subscription, ClientError> {
    let endpoint = self.endpoint(endpoint)?.clone();
    let key = endpoint.key_for(&args);
    let now = Instant::now();
    let max_age = self.inner.options.keep_unused_data_for;

    let (handle, data, needs_fetch, first) = {
      let mut state = self.lock();
      let handle = state.store.subscribe(&key, endpoint.name(), &args, now);
      let (data, needs_fetch, first) = state
        .store
        .read(&key)
        .map(|entry| {
          // Endpoints that opt out of deduplication always reach the server
          let needs_fetch = !endpoint.is_deduplicated()
            || (entry.is_stale(now, max_age) && entry.status != EntryStatus::Pending);
          (entry.data.clone(), needs_fetch, entry.subscriber_count == 1)
        })
        .unwrap_or((None, false, false));
      (handle, data, needs_fetch, first)
    };
    debug!(key = %key, subscriber = handle.id, cached = data.is_some(), "subscribed");

    if needs_fetch {
      self.start_fetch(&key);
    }
    if first {
      let interval = endpoint
        .class()
        .and_then(|class| self.inner.options.polling.get(class));
      if let Some(interval) = interval {
        self.start_polling(&key, interval);
      }
    }

    Ok(Subscription { handle, data })
  }

  /// Drop a subscription. The last one out stops polling and schedules the
  /// entry for collection after the grace period. In-flight fetches keep
  /// running.
  pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
    let remaining = self.lock().store.unsubscribe(handle, Instant::now());
    debug!(key = %handle.key, subscriber = handle.id, ?remaining, "unsubscribed");

    if remaining == Some(0) {
      self.polling().unregister_poll(&handle.key);
      self.schedule_gc(&handle.key);
    }
  }

  /// Fresh cached data, or the result of a (possibly shared) fetch.
  /// Endpoints without deduplication are always fetched.
  pub async fn query(&self, endpoint: &str, args: Value) -> Result<Arc<Value>, ClientError> {
    let endpoint = self.endpoint(endpoint)?.clone();
    let key = endpoint.key_for(&args);
    let now = Instant::now();
    let max_age = self.inner.options.keep_unused_data_for;

    let (fresh, epoch, created) = {
      let mut state = self.lock();
      let created = !state.store.contains(&key);
      let entry = state.store.ensure(&key, endpoint.name(), &args, now);
      let fresh = entry
        .data
        .clone()
        .filter(|_| endpoint.is_deduplicated() && !entry.is_stale(now, max_age));
      (fresh, entry.invalidation_epoch, created)
    };
    // Created unused; later unsubscribes schedule their own collection
    if created {
      self.schedule_gc(&key);
    }
    if let Some(data) = fresh {
      trace!(key = %key, "cache hit");
      return Ok(data);
    }

    let fetch = self.launch(&key, endpoint, args, epoch);
    Ok(fetch.await?)
  }

  pub fn read(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().store.read(key).cloned()
  }

  pub fn data_for(&self, endpoint: &str, args: &Value) -> Option<Arc<Value>> {
    let key = CacheKey::new(endpoint, args);
    self.lock().store.read(&key).and_then(|e| e.data.clone())
  }

  pub fn has_subscribers(&self, key: &CacheKey) -> bool {
    self
      .lock()
      .store
      .read(key)
      .is_some_and(|e| e.subscriber_count > 0)
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.inner.dedupe.is_in_flight(key)
  }

  /// Mark every entry providing `tags` (expanded through the relations) as
  /// stale. Subscribed entries are refetched now, the rest on their next
  /// subscription. Returns the affected keys.
  pub fn invalidate(&self, tags: impl IntoIterator<Item = Tag>) -> BTreeSet<CacheKey> {
    let expanded = self.inner.relations.expand(tags);
    let mut refetch = Vec::new();
    let mut updates = Vec::new();

    let affected = {
      let mut state = self.lock();
      let affected = state.tags.keys_for(&expanded);
      for key in &affected {
        let Some(subscribers) = state.store.write(key, CacheEntry::invalidate) else {
          continue;
        };
        // An in-flight fetch is followed up once it settles
        let pending = state
          .store
          .read(key)
          .is_some_and(|e| e.status == EntryStatus::Pending);
        if !subscribers.is_empty() && !pending {
          refetch.push(key.clone());
        }
        updates.push((key.clone(), subscribers));
      }
      affected
    };

    info!(
      tags = ?expanded,
      affected = affected.len(),
      refetching = refetch.len(),
      "invalidated"
    );
    for (key, subscribers) in updates {
      self.publish(&key, subscribers);
    }
    for key in &refetch {
      self.start_fetch(key);
    }
    affected
  }

  /// Keys whose entries would be refetched on their next subscription.
  pub fn stale_keys(&self) -> BTreeSet<CacheKey> {
    let now = Instant::now();
    let max_age = self.inner.options.keep_unused_data_for;
    self
      .lock()
      .store
      .entries()
      .filter(|e| e.is_stale(now, max_age))
      .map(|e| e.key.clone())
      .collect()
  }

  /// Run `mutation` with optional speculative edits.
  ///
  /// Every update whose target holds data is applied at once, before the
  /// request is sent. On success the edits are folded into the server's
  /// answer and the mutation's tags are invalidated; on failure they are
  /// rolled back, an error notification is emitted and the error returned.
  /// Mutations are not retried.
  pub async fn mutate(
    &self,
    mutation: &Mutation,
    args: Value,
    updates: Vec<OptimisticUpdate>,
  ) -> Result<Value, ApiError> {
    let id = self.inner.next_mutation.fetch_add(1, Ordering::SeqCst);
    let pending = PendingMutation {
      client: self,
      id,
      targets: self.apply_optimistic(id, updates),
      settled: false,
    };
    let request = mutation.request_for(&args);
    info!(
      mutation = mutation.name(),
      id,
      patched = pending.targets.len(),
      "mutation started"
    );

    let result = send_once(
      self.inner.transport.as_ref(),
      &request,
      self.inner.options.request_timeout,
    )
    .await;

    match result {
      Ok(response) => {
        pending.commit(&response);
        info!(mutation = mutation.name(), id, "mutation committed");

        let tags = mutation.tags_for(&args, &response);
        if !tags.is_empty() {
          self.invalidate(tags);
        }
        if let Some(message) = mutation.message() {
          self.inner.notifications.success(message);
        }
        Ok(response)
      }
      Err(err) => {
        pending.rollback();
        warn!(mutation = mutation.name(), id, kind = ?err.kind, error = %err, "mutation rolled back");
        self.inner.notifications.error(&err);
        Err(err)
      }
    }
  }

  /// Client-side id for records inserted before the server assigns one.
  pub fn temp_id(&self) -> String {
    format!("temp-{}", self.inner.next_temp_id.fetch_add(1, Ordering::SeqCst))
  }

  /// Evict every entry unused for the whole grace period.
  pub fn collect_garbage(&self) -> Vec<CacheKey> {
    let evicted = {
      let mut state = self.lock();
      let evicted = state.store.collect_garbage(Instant::now());
      for key in &evicted {
        state.tags.remove(key);
        state.optimistic.forget(key);
      }
      evicted
    };

    let mut polling = self.polling();
    for key in &evicted {
      polling.unregister_poll(key);
    }
    if !evicted.is_empty() {
      debug!(count = evicted.len(), "collected unused entries");
    }
    evicted
  }

  /// Drop everything: entries, tags, patch logs, in-flight records and
  /// polls. Fetches already running finish but their results are discarded.
  pub fn reset(&self) {
    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    self.polling().clear();
    self.inner.dedupe.clear();

    let mut state = self.lock();
    state.store.clear();
    state.tags.clear();
    state.optimistic.clear();
    info!("query cache reset");
  }

  pub fn len(&self) -> usize {
    self.lock().store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn notifications(&self) -> broadcast::Receiver<Notification> {
    self.inner.notifications.subscribe()
  }

  pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
    self.inner.updates.subscribe()
  }

  // Fetching

  /// Refetch an existing entry, joining an in-flight fetch if there is one.
  pub(crate) fn start_fetch(&self, key: &CacheKey) -> Option<SharedFetch> {
    let (endpoint, args, epoch) = {
      let state = self.lock();
      let entry = state.store.read(key)?;
      let endpoint = self.inner.endpoints.get(&entry.endpoint)?.clone();
      (endpoint, entry.args.clone(), entry.invalidation_epoch)
    };
    Some(self.launch(key, endpoint, args, epoch))
  }

  fn launch(&self, key: &CacheKey, endpoint: Endpoint, args: Value, epoch: u64) -> SharedFetch {
    let generation = self.inner.generation.load(Ordering::SeqCst);
    let deduplicated = endpoint.is_deduplicated();
    let client = self.clone();
    let fetch_key = key.clone();
    let fetcher = move || {
      client.mark_pending(&fetch_key);
      client
        .run_fetch(fetch_key, endpoint, args, epoch, generation)
        .boxed()
    };

    let (fetch, started) = if deduplicated {
      self.inner.dedupe.fetch(key, fetcher)
    } else {
      (self.inner.dedupe.fetch_uncached(fetcher), true)
    };
    if started {
      self.drive(key, fetch.clone(), epoch, generation);
    }
    fetch
  }

  async fn run_fetch(
    self,
    key: CacheKey,
    endpoint: Endpoint,
    args: Value,
    epoch: u64,
    generation: u64,
  ) -> FetchResult {
    let request = endpoint.request_for(&args);
    debug!(key = %key, path = %request.path, "fetch started");

    let result = send_with_retry(
      self.inner.transport.as_ref(),
      &request,
      &self.inner.options.retry,
      self.inner.options.request_timeout,
    )
    .await;

    match result {
      Ok(value) => {
        let data = Arc::new(value);
        let tags = endpoint.tags_for(&args, &data);
        Ok(self.store_result(&key, data, tags, epoch, generation))
      }
      Err(err) => {
        warn!(key = %key, kind = ?err.kind, error = %err, "fetch failed");
        self.store_error(&key, &err, generation);
        Err(err)
      }
    }
  }

  /// Spawn a task that polls `fetch` to completion and follows up on
  /// invalidations that arrived meanwhile.
  fn drive(&self, key: &CacheKey, fetch: SharedFetch, epoch: u64, generation: u64) {
    let Ok(runtime) = Handle::try_current() else {
      warn!(key = %key, "no tokio runtime, fetch only runs when awaited");
      return;
    };
    let client = self.clone();
    let key = key.clone();
    runtime.spawn(async move {
      let _ = fetch.await;
      client.after_settle(&key, epoch, generation);
    });
  }

  fn after_settle(&self, key: &CacheKey, epoch: u64, generation: u64) {
    if self.inner.generation.load(Ordering::SeqCst) != generation {
      return;
    }
    let refetch = self.lock().store.read(key).is_some_and(|entry| {
      entry.invalidation_epoch != epoch
        && entry.subscriber_count > 0
        && entry.status != EntryStatus::Pending
    });
    if refetch {
      debug!(key = %key, "invalidated during fetch, refetching");
      self.start_fetch(key);
    }
  }

  fn mark_pending(&self, key: &CacheKey) {
    let subscribers = self.lock().store.write(key, CacheEntry::mark_pending);
    if let Some(subscribers) = subscribers {
      self.publish(key, subscribers);
    }
  }

  fn store_result(
    &self,
    key: &CacheKey,
    data: Arc<Value>,
    tags: BTreeSet<Tag>,
    epoch: u64,
    generation: u64,
  ) -> Arc<Value> {
    let now = Instant::now();
    let mut state = self.lock();
    if self.inner.generation.load(Ordering::SeqCst) != generation {
      debug!(key = %key, "discarding fetch result from before reset");
      return data;
    }

    // Pending optimistic patches are replayed on top of the fresh data
    let visible = state.optimistic.rebase(key, data);
    let indexed = tags.clone();
    let subscribers = state.store.write(key, |entry| {
      let still_valid = entry.invalidation_epoch == epoch;
      entry.fulfill(Arc::clone(&visible), tags, now, still_valid);
    });
    if subscribers.is_some() {
      state.tags.index_entry(key, indexed);
    }
    drop(state);

    debug!(key = %key, "fetch settled");
    if let Some(subscribers) = subscribers {
      self.publish(key, subscribers);
    }
    visible
  }

  fn store_error(&self, key: &CacheKey, error: &ApiError, generation: u64) {
    let subscribers = {
      let mut state = self.lock();
      if self.inner.generation.load(Ordering::SeqCst) != generation {
        return;
      }
      state.store.write(key, |entry| entry.reject(error.clone()))
    };
    if let Some(subscribers) = subscribers {
      self.publish(key, subscribers);
    }
    self.inner.notifications.error(error);
  }

  fn publish(&self, key: &CacheKey, subscribers: Vec<SubscriberId>) {
    trace!(key = %key, subscribers = subscribers.len(), "cache updated");
    // No receivers is fine
    let _ = self.inner.updates.send(CacheUpdate {
      key: key.clone(),
      subscribers,
    });
  }

  // Polling and collection

  fn start_polling(&self, key: &CacheKey, interval: Duration) {
    if Handle::try_current().is_err() {
      return;
    }
    let client = Arc::downgrade(&self.inner);
    let poll_key = key.clone();
    self.polling().register_poll(key, interval, move || {
      let client = client.upgrade().map(|inner| QueryClient { inner });
      let key = poll_key.clone();
      async move {
        match client {
          Some(client) if client.has_subscribers(&key) => {
            trace!(key = %key, "poll tick");
            client.start_fetch(&key);
            true
          }
          _ => false,
        }
      }
    });
  }

  fn schedule_gc(&self, key: &CacheKey) {
    let Ok(runtime) = Handle::try_current() else {
      return;
    };
    let client = Arc::downgrade(&self.inner);
    let key = key.clone();
    let grace = self.inner.options.keep_unused_data_for;
    runtime.spawn(async move {
      tokio::time::sleep(grace).await;
      if let Some(inner) = client.upgrade() {
        QueryClient { inner }.evict(&key);
      }
    });
  }

  fn evict(&self, key: &CacheKey) -> bool {
    let mut state = self.lock();
    if !state.store.evict_if_unused(key, Instant::now()) {
      return false;
    }
    state.tags.remove(key);
    state.optimistic.forget(key);
    true
  }

  // Optimistic patches

  /// Patch every target holding data under one lock. Returns the patched
  /// keys.
  fn apply_optimistic(&self, id: MutationId, updates: Vec<OptimisticUpdate>) -> Vec<CacheKey> {
    let now = Instant::now();
    let mut patched: Vec<CacheKey> = Vec::new();
    let mut notify = Vec::new();
    {
      let mut state = self.lock();
      for update in updates {
        let current = state
          .store
          .read(&update.target)
          .and_then(|e| e.data.clone());
        let Some(current) = current else {
          debug!(key = %update.target, mutation = id, "nothing cached to patch");
          continue;
        };

        let next = state
          .optimistic
          .apply(id, &update.target, &current, update.op, now);
        if let Some(subscribers) = state.store.write(&update.target, |e| e.set_data(next)) {
          notify.push((update.target.clone(), subscribers));
        }
        if !patched.contains(&update.target) {
          patched.push(update.target);
        }
      }
    }

    for (key, subscribers) in notify {
      self.publish(&key, subscribers);
    }
    patched
  }

  fn settle_optimistic<F>(&self, targets: &[CacheKey], mut settle: F)
  where
    F: FnMut(&mut OptimisticCoordinator, &CacheKey) -> Option<Arc<Value>>,
  {
    let mut notify = Vec::new();
    {
      let mut state = self.lock();
      for key in targets {
        // Evicted meanwhile: nothing to restore
        let Some(visible) = settle(&mut state.optimistic, key) else {
          continue;
        };
        if let Some(subscribers) = state.store.write(key, |e| e.set_data(visible)) {
          notify.push((key.clone(), subscribers));
        }
      }
    }

    for (key, subscribers) in notify {
      self.publish(&key, subscribers);
    }
  }
}

/// A mutation's applied patches. Dropping it unsettled (the mutation future
/// was cancelled) rolls the patches back.
struct PendingMutation<'a> {
  client: &'a QueryClient,
  id: MutationId,
  targets: Vec<CacheKey>,
  settled: bool,
}

impl PendingMutation<'_> {
  fn commit(mut self, response: &Value) {
    self.settled = true;
    let id = self.id;
    self
      .client
      .settle_optimistic(&self.targets, |coordinator, key| {
        coordinator.commit(id, key, response)
      });
  }

  fn rollback(mut self) {
    self.settled = true;
    let id = self.id;
    self
      .client
      .settle_optimistic(&self.targets, |coordinator, key| coordinator.rollback(id, key));
  }
}

impl Drop for PendingMutation<'_> {
  fn drop(&mut self) {
    if self.settled {
      return;
    }
    debug!(mutation = self.id, "mutation dropped before settling");
    let id = self.id;
    self
      .client
      .settle_optimistic(&self.targets, |coordinator, key| coordinator.rollback(id, key));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use crate::fetch::ApiRequest;
  use crate::mutation::PatchOp;
  use crate::notify::NotificationLevel;
  use crate::testing::ScriptedTransport;
  use serde_json::json;
  use std::collections::BTreeMap;

  const CLASSES: &str = "GET /classes";
  const MESSAGES: &str = "GET /messages";

  fn list_tags(kind: &str, data: &Value) -> Vec<Tag> {
    let mut tags = vec![Tag::kind(kind)];
    for item in data.as_array().into_iter().flatten() {
      if let Some(id) = item.get("id").and_then(Value::as_i64) {
        tags.push(Tag::id(kind, id));
      }
    }
    tags
  }

  fn endpoints() -> Vec<Endpoint> {
    vec![
      Endpoint::new("getClasses", |_| ApiRequest::get("/classes"))
        .provides(|_, data| list_tags("Class", data)),
      Endpoint::new("getMessages", |_| ApiRequest::get("/messages"))
        .provides(|_, data| list_tags("Message", data))
        .resource_class("messages"),
      Endpoint::new("getDashboard", |_| ApiRequest::get("/dashboard"))
        .provides(|_, _| vec![Tag::kind("Dashboard")]),
    ]
  }

  fn relations() -> TagRelations {
    TagRelations::new(BTreeMap::from([(
      Tag::kind("Class"),
      vec![Tag::kind("Dashboard")],
    )]))
    .unwrap()
  }

  fn client_with(transport: &Arc<ScriptedTransport>, options: ClientOptions) -> QueryClient {
    QueryClient::builder(transport.clone())
      .endpoints(endpoints())
      .relations(relations())
      .options(options)
      .build()
  }

  fn client(transport: &Arc<ScriptedTransport>) -> QueryClient {
    client_with(transport, ClientOptions::default())
  }

  fn classes() -> Value {
    json!([
      { "id": 1, "name": "Algebra" },
      { "id": 2, "name": "Biology" },
      { "id": 3, "name": "Chemistry" },
    ])
  }

  /// Let spawned fetch tasks run to completion.
  async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_queries_share_one_call() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(100)));
    transport.respond(CLASSES, classes());
    let client = client(&transport);

    let results =
      futures::future::join_all((0..5).map(|_| client.query("getClasses", json!({})))).await;

    assert_eq!(transport.calls(CLASSES), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
      assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert!(!client.is_fetching(&CacheKey::new("getClasses", &json!({}))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribe_fetches_once_and_notifies() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    let mut updates = client.updates();

    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    assert!(sub.data.is_none());
    let entry = client.read(&sub.handle.key).unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.is_loading());

    // Joins the pending fetch
    client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;

    assert_eq!(transport.calls(CLASSES), 1);
    let entry = client.read(&sub.handle.key).unwrap();
    assert_eq!(entry.status, EntryStatus::Fulfilled);
    assert_eq!(entry.subscriber_count, 2);
    assert!(entry.tags.contains(&Tag::id("Class", 2)));

    let mut last = None;
    while let Ok(update) = updates.try_recv() {
      last = Some(update);
    }
    let last = last.unwrap();
    assert_eq!(last.key, sub.handle.key);
    assert_eq!(last.subscribers.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_while_revalidate() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let client = client(&transport);

    let first = client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;
    let old = client.data_for("getClasses", &Value::Null).unwrap();

    tokio::time::sleep(Duration::from_secs(301)).await;
    transport.respond(CLASSES, json!([{ "id": 4, "name": "Drama" }]));

    let second = client.subscribe("getClasses", Value::Null).unwrap();
    assert!(Arc::ptr_eq(second.data.as_ref().unwrap(), &old));
    // A third subscriber while revalidating does not fetch again
    let third = client.subscribe("getClasses", Value::Null).unwrap();
    assert!(Arc::ptr_eq(third.data.as_ref().unwrap(), &old));
    settle().await;

    assert_eq!(transport.calls(CLASSES), 2);
    let fresh = client.data_for("getClasses", &Value::Null).unwrap();
    assert_eq!(fresh[0]["name"], "Drama");
    client.unsubscribe(&first.handle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_is_idempotent_and_commutative() {
    async fn seeded() -> QueryClient {
      let transport = Arc::new(ScriptedTransport::new());
      transport.respond(CLASSES, classes());
      transport.respond(MESSAGES, json!([{ "id": 9 }]));
      transport.respond("GET /dashboard", json!({ "unread": 1 }));
      let client = client(&transport);
      for endpoint in ["getClasses", "getMessages", "getDashboard"] {
        client.query(endpoint, Value::Null).await.unwrap();
      }
      client
    }

    let once = seeded().await;
    once.invalidate([Tag::kind("Class"), Tag::id("Message", 9)]);

    let twice = seeded().await;
    twice.invalidate([Tag::kind("Class"), Tag::id("Message", 9)]);
    twice.invalidate([Tag::id("Message", 9), Tag::kind("Class")]);

    assert_eq!(once.stale_keys(), twice.stale_keys());
    // Class cascades to Dashboard
    assert_eq!(once.stale_keys().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_id_tag_only_hits_its_providers() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    transport.respond(MESSAGES, json!([{ "id": 9 }]));
    let client = client(&transport);
    client.query("getClasses", Value::Null).await.unwrap();
    client.query("getMessages", Value::Null).await.unwrap();

    let hit = client.invalidate([Tag::id("Message", 10)]);
    assert!(hit.is_empty());

    let hit = client.invalidate([Tag::id("Message", 9)]);
    assert_eq!(hit, BTreeSet::from([CacheKey::new("getMessages", &Value::Null)]));
    // Data is kept while stale
    assert!(client.data_for("getMessages", &Value::Null).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_refetches_subscribed_entries() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;

    client.invalidate([Tag::kind("Class")]);
    settle().await;

    assert_eq!(transport.calls(CLASSES), 2);
    assert!(!client.read(&sub.handle.key).unwrap().invalidated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_during_fetch_refetches_after_settle() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(100)));
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.calls(CLASSES), 1);

    // Starts a refetch, then lands while it is in flight
    client.invalidate([Tag::kind("Class")]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.invalidate([Tag::kind("Class")]);
    assert_eq!(transport.calls(CLASSES), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.calls(CLASSES), 3);
    let entry = client.read(&sub.handle.key).unwrap();
    assert!(!entry.invalidated);
    assert_eq!(entry.status, EntryStatus::Fulfilled);
  }

  #[tokio::test(start_paused = true)]
  async fn test_503_backoff_then_error() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail(CLASSES, ApiError::from_response(503, None));
    let client = client(&transport);
    let mut notes = client.notifications();

    let err = client.query("getClasses", Value::Null).await.unwrap_err();
    let err = match err {
      ClientError::Api(err) => err,
      other => panic!("expected api error, got {other:?}"),
    };
    assert_eq!(err.kind, ErrorKind::Server);
    assert_eq!(err.status, Some(503));

    let times = transport.call_times(CLASSES);
    assert_eq!(times.len(), 4);
    let gaps: Vec<u64> = times
      .windows(2)
      .map(|w| (w[1] - w[0]).as_millis() as u64)
      .collect();
    for (gap, expected) in gaps.iter().zip([1000, 2000, 4000]) {
      assert!(gap.abs_diff(expected) <= 10, "gap {gap}ms, expected {expected}ms");
    }

    let entry = client
      .read(&CacheKey::new("getClasses", &Value::Null))
      .unwrap();
    assert_eq!(entry.status, EntryStatus::Rejected);
    assert_eq!(notes.try_recv().unwrap().kind, Some(ErrorKind::Server));
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_errors_are_not_retried() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail(CLASSES, ApiError::from_response(422, None));
    let client = client(&transport);

    assert!(client.query("getClasses", Value::Null).await.is_err());
    assert_eq!(transport.calls(CLASSES), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_a_network_error() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(20)));
    transport.respond(CLASSES, classes());
    let options = ClientOptions {
      retry: RetryPolicy::none(),
      ..ClientOptions::default()
    };
    let client = client_with(&transport, options);

    let err = client.query("getClasses", Value::Null).await.unwrap_err();
    let err = match err {
      ClientError::Api(err) => err,
      other => panic!("expected api error, got {other:?}"),
    };
    assert_eq!(err.kind, ErrorKind::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refetch_keeps_previous_data() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let options = ClientOptions {
      retry: RetryPolicy::none(),
      ..ClientOptions::default()
    };
    let client = client_with(&transport, options);
    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;

    transport.fail(CLASSES, ApiError::network("offline"));
    client.invalidate([Tag::kind("Class")]);
    settle().await;

    let entry = client.read(&sub.handle.key).unwrap();
    assert_eq!(entry.status, EntryStatus::Rejected);
    assert_eq!(entry.data.as_deref(), Some(&classes()));
    assert_eq!(entry.error.unwrap().kind, ErrorKind::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_restores_exact_prior_state() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(50)));
    transport.respond(CLASSES, classes());
    transport.fail("DELETE /classes/2", ApiError::from_response(500, None));
    let client = client(&transport);
    let before = client.query("getClasses", Value::Null).await.unwrap();

    let delete = Mutation::new("deleteClass", |args| {
      ApiRequest::delete(format!("/classes/{}", args["id"]))
    });
    let target = CacheKey::new("getClasses", &Value::Null);
    let client2 = client.clone();
    let update = OptimisticUpdate {
      target: target.clone(),
      op: PatchOp::Delete { id: json!(2) },
    };
    let task = tokio::spawn(async move {
      client2.mutate(&delete, json!({ "id": 2 }), vec![update]).await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let during = client.read(&target).unwrap().data.unwrap();
    assert_eq!(*during, json!([
      { "id": 1, "name": "Algebra" },
      { "id": 3, "name": "Chemistry" },
    ]));

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Server);
    let after = client.read(&target).unwrap().data.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    // Mutations are not retried
    assert_eq!(transport.calls("DELETE /classes/2"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_keeps_later_mutation() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(50)));
    transport.respond(CLASSES, classes());
    transport.fail("PATCH /classes/1", ApiError::from_response(500, None));
    transport.respond("PATCH /classes/2", json!({ "id": 2, "name": "Botany" }));
    let client = client(&transport);
    client.query("getClasses", Value::Null).await.unwrap();
    let target = CacheKey::new("getClasses", &Value::Null);

    let rename = Mutation::new("updateClass", |args| {
      ApiRequest::patch(format!("/classes/{}", args["id"]), args.clone())
    });
    let patch = |id: i64, name: &str| OptimisticUpdate {
      target: target.clone(),
      op: PatchOp::Update {
        id: json!(id),
        changes: json!({ "name": name }),
      },
    };

    let (first, second) = tokio::join!(
      client.mutate(&rename, json!({ "id": 1, "name": "Arithmetic" }), vec![patch(1, "Arithmetic")]),
      client.mutate(&rename, json!({ "id": 2, "name": "Botany" }), vec![patch(2, "Botany")]),
    );
    assert!(first.is_err());
    assert!(second.is_ok());

    let data = client.read(&target).unwrap().data.unwrap();
    assert_eq!(data[0]["name"], "Algebra");
    assert_eq!(data[1]["name"], "Botany");
    assert_eq!(data[2]["name"], "Chemistry");
  }

  #[tokio::test(start_paused = true)]
  async fn test_commit_invalidates_and_notifies() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    transport.respond("POST /classes", json!({ "id": 4, "name": "Drama" }));
    let client = client(&transport);
    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;
    let mut notes = client.notifications();

    let create = Mutation::new("createClass", |args| ApiRequest::post("/classes", args.clone()))
      .invalidates(|_, _| vec![Tag::kind("Class")])
      .success_message("Class created");
    let record = json!({ "id": client.temp_id(), "name": "Drama" });
    let update = OptimisticUpdate {
      target: sub.handle.key.clone(),
      op: PatchOp::Insert {
        record,
        at: Default::default(),
      },
    };

    let response = client
      .mutate(&create, json!({ "name": "Drama" }), vec![update])
      .await
      .unwrap();
    assert_eq!(response["id"], 4);

    let data = client.read(&sub.handle.key).unwrap().data.unwrap();
    assert_eq!(data[3], json!({ "id": 4, "name": "Drama" }));

    let note = notes.try_recv().unwrap();
    assert_eq!(note.level, NotificationLevel::Success);
    assert_eq!(note.message, "Class created");

    settle().await;
    assert_eq!(transport.calls(CLASSES), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unused_entry_collected_after_grace() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    let key = CacheKey::new("getClasses", &Value::Null);

    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;
    client.unsubscribe(&sub.handle);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert!(client.read(&key).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(client.read(&key).is_none());
    assert!(client.invalidate([Tag::kind("Class")]).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_queries_schedule_one_collection() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    let metrics = Handle::current().metrics();

    client.query("getClasses", Value::Null).await.unwrap();
    settle().await;
    let alive = metrics.num_alive_tasks();

    for _ in 0..100 {
      client.query("getClasses", Value::Null).await.unwrap();
    }
    settle().await;
    assert_eq!(metrics.num_alive_tasks(), alive);
    assert_eq!(transport.calls(CLASSES), 1);

    // The single pending collection still evicts the entry
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(client.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribe_within_grace_keeps_entry() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    let key = CacheKey::new("getClasses", &Value::Null);

    let sub = client.subscribe("getClasses", Value::Null).unwrap();
    settle().await;
    client.unsubscribe(&sub.handle);
    tokio::time::sleep(Duration::from_secs(100)).await;
    let _again = client.subscribe("getClasses", Value::Null).unwrap();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(client.read(&key).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_stops_on_unsubscribe() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(MESSAGES, json!([]));
    let mut options = ClientOptions::default();
    options
      .polling
      .insert("messages", Duration::from_secs(30));
    let client = client_with(&transport, options);

    let sub = client.subscribe("getMessages", Value::Null).unwrap();
    settle().await;
    assert_eq!(transport.calls(MESSAGES), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(transport.calls(MESSAGES), 3);

    client.unsubscribe(&sub.handle);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.calls(MESSAGES), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_clears_everything() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(100)));
    transport.respond(CLASSES, classes());
    let client = client(&transport);
    client.query("getClasses", Value::Null).await.unwrap();
    client.subscribe("getDashboard", Value::Null).unwrap();

    client.reset();
    assert!(client.is_empty());
    assert!(client.stale_keys().is_empty());

    // The dashboard fetch that was in flight is discarded
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_empty());
  }

  #[tokio::test]
  async fn test_unknown_endpoint() {
    let client = QueryClient::new(Arc::new(ScriptedTransport::new()));
    assert!(matches!(
      client.subscribe("getNothing", Value::Null),
      Err(ClientError::UnknownEndpoint(name)) if name == "getNothing"
    ));
  }
}
