//! Interval refetching for subscribed entries.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::cache::CacheKey;

/// Poll interval per resource class (e.g. `messages` → 30s).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollingIntervals(BTreeMap<String, Duration>);

impl PollingIntervals {
  pub fn new(intervals: BTreeMap<String, Duration>) -> Self {
    Self(intervals)
  }

  pub fn get(&self, resource_class: &str) -> Option<Duration> {
    self
      .0
      .get(resource_class)
      .copied()
      .filter(|d| !d.is_zero())
  }

  pub fn insert(&mut self, resource_class: impl Into<String>, interval: Duration) {
    self.0.insert(resource_class.into(), interval);
  }
}

struct Poll {
  interval: Duration,
  task: JoinHandle<()>,
}

/// One background task per polled key.
///
/// Each tick calls the registered closure; returning `false` stops the poll
/// (e.g. when the entry lost its last subscriber).
#[derive(Default)]
pub struct PollingScheduler {
  polls: HashMap<CacheKey, Poll>,
}

impl PollingScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start polling `key` every `interval`. Re-registering with the same
  /// interval keeps the running poll.
  pub fn register_poll<F, Fut>(&mut self, key: &CacheKey, interval: Duration, mut tick: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
  {
    if let Some(existing) = self.polls.get(key) {
      if existing.interval == interval && !existing.task.is_finished() {
        return;
      }
    }
    self.unregister_poll(key);

    let task_key = key.clone();
    let task = tokio::spawn(async move {
      let mut ticker = time::interval_at(Instant::now() + interval, interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if !tick().await {
          debug!(key = %task_key, "polling stopped");
          break;
        }
      }
    });

    debug!(key = %key, interval_ms = interval.as_millis() as u64, "polling registered");
    self.polls.insert(key.clone(), Poll { interval, task });
  }

  pub fn unregister_poll(&mut self, key: &CacheKey) -> bool {
    match self.polls.remove(key) {
      Some(poll) => {
        poll.task.abort();
        true
      }
      None => false,
    }
  }

  pub fn is_polling(&self, key: &CacheKey) -> bool {
    self
      .polls
      .get(key)
      .is_some_and(|poll| !poll.task.is_finished())
  }

  pub fn clear(&mut self) {
    for (_, poll) in self.polls.drain() {
      poll.task.abort();
    }
  }
}

impl Drop for PollingScheduler {
  fn drop(&mut self) {
    self.clear();
  }
}
