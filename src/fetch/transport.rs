//! The raw HTTP capability the cache is built on.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ApiError, ClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  fn as_reqwest(self) -> reqwest::Method {
    match self {
      Self::Get => reqwest::Method::GET,
      Self::Post => reqwest::Method::POST,
      Self::Put => reqwest::Method::PUT,
      Self::Patch => reqwest::Method::PATCH,
      Self::Delete => reqwest::Method::DELETE,
    }
  }
}

/// A request relative to the API base url.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Post, path).with_body(body)
  }

  pub fn patch(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Patch, path).with_body(body)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.query.push((name.into(), value.to_string()));
    self
  }
}

/// Sends requests and normalizes failures into [`ApiError`].
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

/// Obtains a fresh access token after a 401.
///
/// Implementations own the "redirect to login" behavior when refreshing
/// fails.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
  async fn refresh(&self) -> Result<String, ApiError>;
}

/// reqwest-backed transport with bearer auth.
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: RwLock<Option<String>>,
  refresher: Option<Arc<dyn TokenRefresher>>,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ClientError> {
    // Keep the trailing slash so joins stay under the base path
    let mut base = base_url.trim_end_matches('/').to_string();
    base.push('/');
    let base_url = Url::parse(&base)?;

    let client = reqwest::Client::builder().gzip(true).build()?;

    Ok(Self {
      client,
      base_url,
      token: RwLock::new(token),
      refresher: None,
    })
  }

  pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
    self.refresher = Some(refresher);
    self
  }

  fn url_for(&self, request: &ApiRequest) -> Result<Url, ApiError> {
    let mut url = self
      .base_url
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| ApiError::network(format!("Invalid request path {}: {}", request.path, e)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(&request.query);
    }
    Ok(url)
  }

  fn current_token(&self) -> Option<String> {
    self
      .token
      .read()
      .map(|t| t.clone())
      .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
  }

  fn store_token(&self, token: String) {
    match self.token.write() {
      Ok(mut slot) => *slot = Some(token),
      Err(poisoned) => *poisoned.into_inner() = Some(token),
    }
  }

  async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError> {
    let url = self.url_for(request)?;
    debug!(method = ?request.method, %url, "sending request");

    let mut builder = self.client.request(request.method.as_reqwest(), url);
    if let Some(token) = self.current_token() {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(transport_error)?;
    let body: Option<Value> = if bytes.is_empty() {
      None
    } else {
      serde_json::from_slice(&bytes).ok()
    };

    if status.is_success() {
      return Ok(body.unwrap_or(Value::Null));
    }
    Err(ApiError::from_response(status.as_u16(), body.as_ref()))
  }
}

fn transport_error(err: reqwest::Error) -> ApiError {
  if err.is_timeout() {
    ApiError::network(format!("Request timed out: {}", err))
  } else {
    ApiError::network(format!("Failed to reach the server: {}", err))
  }
}

/// Run `execute`; on a 401, refresh the token once and replay once.
///
/// When the refresh itself fails the original 401 is returned.
async fn send_with_refresh<E, Fut>(
  path: &str,
  refresher: Option<&dyn TokenRefresher>,
  mut execute: E,
  store_token: impl FnOnce(String),
) -> Result<Value, ApiError>
where
  E: FnMut() -> Fut,
  Fut: Future<Output = Result<Value, ApiError>>,
{
  let result = execute().await;

  let unauthorized = matches!(
    &result,
    Err(err) if err.status == Some(StatusCode::UNAUTHORIZED.as_u16())
  );
  let Some(refresher) = refresher.filter(|_| unauthorized) else {
    return result;
  };

  match refresher.refresh().await {
    Ok(token) => {
      debug!(path, "token refreshed, replaying request");
      store_token(token);
      execute().await
    }
    Err(refresh_err) => {
      warn!(path, error = %refresh_err, "token refresh failed");
      result
    }
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
    let transport = self;
    send_with_refresh(
      &request.path,
      self.refresher.as_deref(),
      move || transport.execute(request),
      move |token| transport.store_token(token),
    )
    .await
  }
}
