//! A single cached `(endpoint, args)` result.

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::key::CacheKey;
use super::tags::Tag;
use crate::error::ApiError;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  /// Created but never fetched
  Uninitialized,
  /// A fetch is running; previous data, if any, is still served
  Pending,
  /// Last fetch succeeded
  Fulfilled,
  /// Last fetch failed; previous data, if any, is kept as fallback
  Rejected,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub endpoint: String,
  pub args: Value,
  pub status: EntryStatus,
  /// Current data. The `Arc` identity is what derived views memoize on.
  pub data: Option<Arc<Value>>,
  pub error: Option<ApiError>,
  pub fetched_at: Option<Instant>,
  pub subscriber_count: usize,
  pub tags: BTreeSet<Tag>,
  /// Explicitly invalidated since the last successful fetch
  pub invalidated: bool,
  /// When the subscriber count last dropped to zero
  pub unused_since: Option<Instant>,
  pub(crate) invalidation_epoch: u64,
}

impl CacheEntry {
  pub fn new(key: CacheKey, endpoint: &str, args: Value) -> Self {
    Self {
      key,
      endpoint: endpoint.to_string(),
      args,
      status: EntryStatus::Uninitialized,
      data: None,
      error: None,
      fetched_at: None,
      subscriber_count: 0,
      tags: BTreeSet::new(),
      invalidated: false,
      unused_since: None,
      invalidation_epoch: 0,
    }
  }

  /// Stale entries are refetched on the next subscription.
  pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
    if self.invalidated {
      return true;
    }
    match self.fetched_at {
      Some(at) => now.saturating_duration_since(at) > max_age,
      None => true,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == EntryStatus::Pending && self.data.is_none()
  }

  /// Unsubscribed for at least `grace`.
  pub fn is_evictable(&self, now: Instant, grace: Duration) -> bool {
    self.subscriber_count == 0
      && self
        .unused_since
        .map(|since| now.saturating_duration_since(since) >= grace)
        .unwrap_or(false)
  }

  pub(crate) fn mark_pending(&mut self) {
    self.status = EntryStatus::Pending;
  }

  /// Store a successful fetch result.
  ///
  /// `still_valid` is false when the entry was invalidated after the fetch
  /// started, in which case it stays stale.
  pub(crate) fn fulfill(
    &mut self,
    data: Arc<Value>,
    tags: BTreeSet<Tag>,
    now: Instant,
    still_valid: bool,
  ) {
    self.status = EntryStatus::Fulfilled;
    self.data = Some(data);
    self.error = None;
    self.fetched_at = Some(now);
    self.tags = tags;
    if still_valid {
      self.invalidated = false;
    }
  }

  pub(crate) fn reject(&mut self, error: ApiError) {
    self.status = EntryStatus::Rejected;
    self.error = Some(error);
  }

  /// Replace the visible data without touching fetch metadata.
  pub(crate) fn set_data(&mut self, data: Arc<Value>) {
    self.data = Some(data);
  }

  pub(crate) fn invalidate(&mut self) {
    self.invalidated = true;
    self.invalidation_epoch += 1;
  }
}
