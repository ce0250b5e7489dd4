//! Query and mutation definitions consumed by the client.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheKey, Tag};
use crate::fetch::ApiRequest;
use crate::mutation::PatchOp;

type RequestFn = dyn Fn(&Value) -> ApiRequest + Send + Sync;
type ProvidesFn = dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync;
type InvalidatesFn = dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync;

/// A cacheable read.
///
/// `provides` maps `(args, data)` to the tags the resulting entry depends on.
#[derive(Clone)]
pub struct Endpoint {
  name: String,
  request: Arc<RequestFn>,
  provides: Arc<ProvidesFn>,
  resource_class: Option<String>,
  dedupe: bool,
}

impl Endpoint {
  pub fn new<F>(name: impl Into<String>, request: F) -> Self
  where
    F: Fn(&Value) -> ApiRequest + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      request: Arc::new(request),
      provides: Arc::new(|_: &Value, _: &Value| Vec::<Tag>::new()),
      resource_class: None,
      dedupe: true,
    }
  }

  pub fn provides<F>(mut self, provides: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.provides = Arc::new(provides);
    self
  }

  /// Resource class used to look up the poll interval.
  pub fn resource_class(mut self, class: impl Into<String>) -> Self {
    self.resource_class = Some(class.into());
    self
  }

  /// Opt out of request deduplication.
  pub fn dedupe(mut self, dedupe: bool) -> Self {
    self.dedupe = dedupe;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn class(&self) -> Option<&str> {
    self.resource_class.as_deref()
  }

  pub fn is_deduplicated(&self) -> bool {
    self.dedupe
  }

  pub fn key_for(&self, args: &Value) -> CacheKey {
    CacheKey::new(&self.name, args)
  }

  pub fn request_for(&self, args: &Value) -> ApiRequest {
    (self.request)(args)
  }

  pub fn tags_for(&self, args: &Value, data: &Value) -> BTreeSet<Tag> {
    (self.provides)(args, data).into_iter().collect()
  }
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
      .field("name", &self.name)
      .field("resource_class", &self.resource_class)
      .field("dedupe", &self.dedupe)
      .finish_non_exhaustive()
  }
}

/// A write.
///
/// `invalidates` maps `(args, response)` to the tags to refetch once the
/// server confirms.
#[derive(Clone)]
pub struct Mutation {
  name: String,
  request: Arc<RequestFn>,
  invalidates: Arc<InvalidatesFn>,
  success_message: Option<String>,
}

impl Mutation {
  pub fn new<F>(name: impl Into<String>, request: F) -> Self
  where
    F: Fn(&Value) -> ApiRequest + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      request: Arc::new(request),
      invalidates: Arc::new(|_: &Value, _: &Value| Vec::<Tag>::new()),
      success_message: None,
    }
  }

  pub fn invalidates<F>(mut self, invalidates: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.invalidates = Arc::new(invalidates);
    self
  }

  pub fn success_message(mut self, message: impl Into<String>) -> Self {
    self.success_message = Some(message.into());
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn request_for(&self, args: &Value) -> ApiRequest {
    (self.request)(args)
  }

  pub fn tags_for(&self, args: &Value, response: &Value) -> Vec<Tag> {
    (self.invalidates)(args, response)
  }

  pub fn message(&self) -> Option<&str> {
    self.success_message.as_deref()
  }
}

impl fmt::Debug for Mutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("name", &self.name)
      .field("success_message", &self.success_message)
      .finish_non_exhaustive()
  }
}

/// A speculative edit a mutation applies to one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticUpdate {
  pub target: CacheKey,
  pub op: PatchOp,
}

impl OptimisticUpdate {
  pub fn new(endpoint: &Endpoint, args: &Value, op: PatchOp) -> Self {
    Self {
      target: endpoint.key_for(args),
      op,
    }
  }
}
