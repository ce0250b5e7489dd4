//! In-memory table of cache entries and their subscribers.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::entry::CacheEntry;
use super::key::CacheKey;

pub type SubscriberId = u64;

/// Returned by [`CacheStore::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
  pub id: SubscriberId,
  pub key: CacheKey,
}

/// The cache entries plus who is watching them.
///
/// The store never fetches anything itself; callers decide what to do with
/// stale entries and with the subscriber lists returned by writes.
#[derive(Debug)]
pub struct CacheStore {
  entries: HashMap<CacheKey, CacheEntry>,
  subscribers: HashMap<CacheKey, BTreeSet<SubscriberId>>,
  next_subscriber: SubscriberId,
  /// Max age of fetched data and grace period for unused entries
  keep_unused_data_for: Duration,
}

impl CacheStore {
  pub fn new(keep_unused_data_for: Duration) -> Self {
    Self {
      entries: HashMap::new(),
      subscribers: HashMap::new(),
      next_subscriber: 1,
      keep_unused_data_for,
    }
  }

  /// Get or create the entry for `key`.
  ///
  /// A freshly created entry counts as unused from `now` so it is collected
  /// if nobody ever subscribes.
  pub fn ensure(&mut self, key: &CacheKey, endpoint: &str, args: &Value, now: Instant) -> &CacheEntry {
    self.entries.entry(key.clone()).or_insert_with(|| {
      let mut entry = CacheEntry::new(key.clone(), endpoint, args.clone());
      entry.unused_since = Some(now);
      entry
    })
  }

  pub fn subscribe(
    &mut self,
    key: &CacheKey,
    endpoint: &str,
    args: &Value,
    now: Instant,
  ) -> SubscriptionHandle {
    self.ensure(key, endpoint, args, now);

    let id = self.next_subscriber;
    self.next_subscriber += 1;
    self.subscribers.entry(key.clone()).or_default().insert(id);

    if let Some(entry) = self.entries.get_mut(key) {
      entry.subscriber_count += 1;
      entry.unused_since = None;
    }

    SubscriptionHandle {
      id,
      key: key.clone(),
    }
  }

  /// Drop a subscription. Returns the remaining subscriber count, or `None`
  /// if the handle was unknown (already unsubscribed or entry evicted).
  pub fn unsubscribe(&mut self, handle: &SubscriptionHandle, now: Instant) -> Option<usize> {
    let subscribers = self.subscribers.get_mut(&handle.key)?;
    if !subscribers.remove(&handle.id) {
      return None;
    }
    if subscribers.is_empty() {
      self.subscribers.remove(&handle.key);
    }

    let entry = self.entries.get_mut(&handle.key)?;
    entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
    if entry.subscriber_count == 0 {
      entry.unused_since = Some(now);
    }
    Some(entry.subscriber_count)
  }

  pub fn read(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.entries.contains_key(key)
  }

  /// Apply `patch` to the entry and return the subscribers to notify.
  ///
  /// Returns `None` if there is no entry for `key`.
  pub fn write(
    &mut self,
    key: &CacheKey,
    patch: impl FnOnce(&mut CacheEntry),
  ) -> Option<Vec<SubscriberId>> {
    let entry = self.entries.get_mut(key)?;
    patch(entry);
    Some(self.subscribers_of(key))
  }

  pub fn subscribers_of(&self, key: &CacheKey) -> Vec<SubscriberId> {
    self
      .subscribers
      .get(key)
      .map(|s| s.iter().copied().collect())
      .unwrap_or_default()
  }

  pub fn is_stale(&self, key: &CacheKey, now: Instant) -> bool {
    self
      .entries
      .get(key)
      .map(|e| e.is_stale(now, self.keep_unused_data_for))
      .unwrap_or(true)
  }

  /// Remove `key` if it has been unused for the whole grace period.
  pub fn evict_if_unused(&mut self, key: &CacheKey, now: Instant) -> bool {
    let evictable = self
      .entries
      .get(key)
      .map(|e| e.is_evictable(now, self.keep_unused_data_for))
      .unwrap_or(false);

    if evictable {
      self.entries.remove(key);
      self.subscribers.remove(key);
      debug!(key = %key, "evicted unused cache entry");
    }
    evictable
  }

  /// Evict every entry past its grace period.
  pub fn collect_garbage(&mut self, now: Instant) -> Vec<CacheKey> {
    let grace = self.keep_unused_data_for;
    let expired: Vec<CacheKey> = self
      .entries
      .values()
      .filter(|e| e.is_evictable(now, grace))
      .map(|e| e.key.clone())
      .collect();

    for key in &expired {
      self.entries.remove(key);
      self.subscribers.remove(key);
    }
    expired
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
    self.entries.values()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.subscribers.clear();
  }
}
