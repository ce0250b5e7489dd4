//! Success/error events for the toast layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ApiError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
  Success,
  Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
  pub level: NotificationLevel,
  pub message: String,
  /// Set for errors
  #[serde(skip_serializing_if = "Option::is_none")]
  pub kind: Option<ErrorKind>,
  pub at: DateTime<Utc>,
}

/// Broadcasts notifications to whoever renders them.
#[derive(Debug, Clone)]
pub struct NotificationSink {
  tx: broadcast::Sender<Notification>,
}

impl NotificationSink {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }

  pub fn success(&self, message: impl Into<String>) {
    self.emit(Notification {
      level: NotificationLevel::Success,
      message: message.into(),
      kind: None,
      at: Utc::now(),
    });
  }

  /// Emit `error` unless its kind is handled elsewhere. Returns whether a
  /// notification was sent.
  pub fn error(&self, error: &ApiError) -> bool {
    if !error.kind.is_notified() {
      debug!(kind = ?error.kind, "notification suppressed");
      return false;
    }
    self.emit(Notification {
      level: NotificationLevel::Error,
      message: error.message.clone(),
      kind: Some(error.kind),
      at: Utc::now(),
    });
    true
  }

  fn emit(&self, notification: Notification) {
    // Nobody listening is fine
    let _ = self.tx.send(notification);
  }
}

impl Default for NotificationSink {
  fn default() -> Self {
    Self::new(64)
  }
}
