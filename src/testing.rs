//! In-memory transport for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ApiError;
use crate::fetch::{ApiRequest, Method, Transport};

/// Replies keyed by `"METHOD /path"`. Unknown routes answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
  standing: Mutex<HashMap<String, Result<Value, ApiError>>>,
  calls: Mutex<Vec<(String, Instant)>>,
  delay: Duration,
}

pub fn route(method: Method, path: &str) -> String {
  let verb = match method {
    Method::Get => "GET",
    Method::Post => "POST",
    Method::Put => "PUT",
    Method::Patch => "PATCH",
    Method::Delete => "DELETE",
  };
  format!("{} {}", verb, path)
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every request takes `delay` before answering.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn respond(&self, route: &str, value: Value) {
    self
      .standing
      .lock()
      .unwrap()
      .insert(route.to_string(), Ok(value));
  }

  pub fn fail(&self, route: &str, error: ApiError) {
    self
      .standing
      .lock()
      .unwrap()
      .insert(route.to_string(), Err(error));
  }

  pub fn calls(&self, route: &str) -> usize {
    self.call_times(route).len()
  }

  pub fn call_times(&self, route: &str) -> Vec<Instant> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(r, _)| r == route)
      .map(|(_, at)| *at)
      .collect()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
    let route = route(request.method, &request.path);
    self
      .calls
      .lock()
      .unwrap()
      .push((route.clone(), Instant::now()));

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    self
      .standing
      .lock()
      .unwrap()
      .get(&route)
      .cloned()
      .unwrap_or_else(|| Err(ApiError::from_response(404, None)))
  }
}
