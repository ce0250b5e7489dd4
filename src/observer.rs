//! Per-view handle on one cache entry.
//!
//! An `Observer` is what a screen holds: it subscribes on creation, turns
//! cache updates into a [`QueryState`] and unsubscribes when dropped.
//!
//! ```ignore
//! let mut classes = Observer::new(&client, "getClasses", Value::Null)?;
//!
//! // In event loop tick
//! if classes.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match classes.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Fallback { data, error } => render_with_banner(data, error),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::cache::{CacheEntry, CacheKey, EntryStatus, SubscriptionHandle};
use crate::client::{CacheUpdate, QueryClient};
use crate::error::{ApiError, ClientError};

/// What a view should render for an entry.
#[derive(Debug, Clone)]
pub enum QueryState {
  /// Nothing cached and nothing in flight
  Idle,
  /// First fetch in flight
  Loading,
  Success(Arc<Value>),
  /// Last fetch failed but earlier data is still available
  Fallback { data: Arc<Value>, error: ApiError },
  /// Failed with nothing to fall back to
  Error(ApiError),
}

impl QueryState {
  fn from_entry(entry: Option<&CacheEntry>) -> Self {
    let Some(entry) = entry else {
      return Self::Idle;
    };
    match (entry.status, &entry.data, &entry.error) {
      (EntryStatus::Rejected, Some(data), Some(error)) => Self::Fallback {
        data: Arc::clone(data),
        error: error.clone(),
      },
      (EntryStatus::Rejected, None, Some(error)) => Self::Error(error.clone()),
      (_, Some(data), _) => Self::Success(Arc::clone(data)),
      (EntryStatus::Pending, None, _) => Self::Loading,
      _ => Self::Idle,
    }
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_) | QueryState::Fallback { .. })
  }

  /// Data to render, including fallback data.
  pub fn data(&self) -> Option<&Arc<Value>> {
    match self {
      QueryState::Success(data) | QueryState::Fallback { data, .. } => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error(e) | QueryState::Fallback { error: e, .. } => Some(e),
      _ => None,
    }
  }
}

pub struct Observer {
  client: QueryClient,
  handle: SubscriptionHandle,
  state: QueryState,
  updates: broadcast::Receiver<CacheUpdate>,
}

impl Observer {
  /// Subscribe to `(endpoint, args)`, starting a fetch if needed.
  pub fn new(client: &QueryClient, endpoint: &str, args: Value) -> Result<Self, ClientError> {
    // Listen before subscribing so the first write is not missed
    let updates = client.updates();
    let subscription = client.subscribe(endpoint, args)?;
    let state = QueryState::from_entry(client.read(&subscription.handle.key).as_ref());

    Ok(Self {
      client: client.clone(),
      handle: subscription.handle,
      state,
      updates,
    })
  }

  pub fn key(&self) -> &CacheKey {
    &self.handle.key
  }

  pub fn state(&self) -> &QueryState {
    &self.state
  }

  pub fn data(&self) -> Option<&Arc<Value>> {
    self.state.data()
  }

  /// Drain pending cache updates without blocking.
  ///
  /// Returns `true` if this entry was written since the last call.
  pub fn poll(&mut self) -> bool {
    let mut dirty = false;
    loop {
      match self.updates.try_recv() {
        Ok(update) => dirty |= update.key == self.handle.key,
        // Missed updates may include ours
        Err(TryRecvError::Lagged(_)) => dirty = true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
      }
    }
    if dirty {
      self.refresh();
    }
    dirty
  }

  /// Wait for the next write to this entry. Returns `false` once the client
  /// is gone.
  pub async fn changed(&mut self) -> bool {
    loop {
      match self.updates.recv().await {
        Ok(update) if update.key == self.handle.key => break,
        Ok(_) => continue,
        Err(RecvError::Lagged(_)) => break,
        Err(RecvError::Closed) => return false,
      }
    }
    self.refresh();
    true
  }

  /// Fetch again regardless of freshness.
  pub fn refetch(&mut self) {
    self.client.start_fetch(&self.handle.key);
    self.refresh();
  }

  fn refresh(&mut self) {
    self.state = QueryState::from_entry(self.client.read(&self.handle.key).as_ref());
  }
}

impl Drop for Observer {
  fn drop(&mut self) {
    self.client.unsubscribe(&self.handle);
  }
}

impl std::fmt::Debug for Observer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Observer")
      .field("key", &self.handle.key)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
