//! Error taxonomy shared by fetches, mutations and notifications.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::cache::TagGraphError;

/// Status codes that are worth another attempt.
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Coarse classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Transport failure or timeout
  Network,
  /// 401 / 403
  Auth,
  /// 400 / 422 and other client errors
  Validation,
  /// 5xx and rate limiting
  Server,
  /// 404
  NotFound,
}

impl ErrorKind {
  /// Classify an HTTP status code.
  pub fn from_status(status: u16) -> Self {
    match status {
      401 | 403 => Self::Auth,
      404 => Self::NotFound,
      408 => Self::Network,
      429 | 500..=599 => Self::Server,
      _ => Self::Validation,
    }
  }

  /// Message used when the response body carries nothing useful.
  pub fn default_message(self) -> &'static str {
    match self {
      Self::Network => "Network error. Check your connection and try again.",
      Self::Auth => "Your session has expired. Please sign in again.",
      Self::Validation => "The request was invalid. Please check the form and try again.",
      Self::Server => "Something went wrong on our side. Please try again later.",
      Self::NotFound => "The requested resource was not found.",
    }
  }

  /// Whether errors of this kind reach the generic notification stream.
  ///
  /// Auth errors are handled by the refresh/redirect flow and not-found is
  /// left to the caller.
  pub fn is_notified(self) -> bool {
    matches!(self, Self::Network | Self::Validation | Self::Server)
  }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
  pub field: String,
  pub message: String,
}

/// Normalized error for anything that went wrong talking to the API.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
  pub kind: ErrorKind,
  /// HTTP status, `None` for transport failures
  pub status: Option<u16>,
  pub message: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub field_errors: Vec<FieldError>,
}

impl ApiError {
  /// Transport-level failure (connection refused, DNS, reset...).
  pub fn network(message: impl Into<String>) -> Self {
    Self {
      kind: ErrorKind::Network,
      status: None,
      message: message.into(),
      field_errors: Vec::new(),
    }
  }

  /// The request did not settle within `after`.
  pub fn timeout(after: Duration) -> Self {
    Self::network(format!("Request timed out after {}s", after.as_secs()))
  }

  /// Build an error from a non-success HTTP response.
  ///
  /// The message is taken from `message`, then `detail` (string or list of
  /// field errors), then `error`, falling back to a per-kind default.
  pub fn from_response(status: u16, body: Option<&Value>) -> Self {
    let kind = ErrorKind::from_status(status);
    let field_errors = body.map(field_errors_from).unwrap_or_default();
    let message = body
      .and_then(|b| message_from(b, &field_errors))
      .unwrap_or_else(|| kind.default_message().to_string());

    Self {
      kind,
      status: Some(status),
      message,
      field_errors,
    }
  }

  /// Transport failures, timeouts and a fixed set of statuses are retried.
  pub fn is_retryable(&self) -> bool {
    match self.status {
      None => self.kind == ErrorKind::Network,
      Some(status) => RETRYABLE_STATUSES.contains(&status),
    }
  }
}

fn non_empty_str(value: &Value) -> Option<&str> {
  value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn message_from(body: &Value, field_errors: &[FieldError]) -> Option<String> {
  if let Some(message) = body.get("message").and_then(non_empty_str) {
    return Some(message.to_string());
  }

  match body.get("detail") {
    Some(detail) if detail.is_string() => {
      if let Some(message) = non_empty_str(detail) {
        return Some(message.to_string());
      }
    }
    Some(detail) if detail.is_array() && !field_errors.is_empty() => {
      let joined = field_errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ");
      return Some(joined);
    }
    _ => {}
  }

  body
    .get("error")
    .and_then(non_empty_str)
    .map(String::from)
}

/// Parse `detail: [{loc: ["body", "email"], msg: "..."}]` style errors.
fn field_errors_from(body: &Value) -> Vec<FieldError> {
  let Some(items) = body.get("detail").and_then(Value::as_array) else {
    return Vec::new();
  };

  items
    .iter()
    .filter_map(|item| {
      let message = item.get("msg").and_then(Value::as_str)?;
      let field = item
        .get("loc")
        .and_then(Value::as_array)
        .map(|loc| {
          loc
            .iter()
            .filter(|part| part.as_str() != Some("body"))
            .map(|part| match part {
              Value::String(s) => s.clone(),
              other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
        })
        .unwrap_or_default();
      Some(FieldError {
        field,
        message: message.to_string(),
      })
    })
    .collect()
}

/// Errors raised by the client itself rather than by the API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  #[error("unknown endpoint: {0}")]
  UnknownEndpoint(String),

  #[error("invalid base url: {0}")]
  InvalidBaseUrl(#[from] url::ParseError),

  #[error("failed to build http client: {0}")]
  Http(#[from] reqwest::Error),

  #[error(transparent)]
  TagGraph(#[from] TagGraphError),

  #[error(transparent)]
  Api(#[from] ApiError),
}
