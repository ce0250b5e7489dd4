//! Optimistic patches for in-flight mutations.
//!
//! Each patched entry keeps its last authoritative value (the base) plus an
//! ordered log of pending patches. The visible value is always the base with
//! the log replayed on top, so:
//! - a rollback drops only its own patches and later edits survive
//! - a commit folds its patches into the base using the server response
//! - a fetch that lands mid-flight replaces the base and the log is replayed

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::CacheKey;

pub type MutationId = u64;

/// Where an inserted record goes in a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertAt {
  Start,
  #[default]
  End,
}

/// A speculative edit to a list of records or a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
  /// Add a record (usually carrying a temporary id) to a list
  Insert { record: Value, at: InsertAt },
  /// Shallow-merge `changes` into the record with this id
  Update { id: Value, changes: Value },
  /// Remove the record with this id from a list
  Delete { id: Value },
}

/// One applied patch, kept until its mutation settles.
#[derive(Debug, Clone)]
pub struct OptimisticPatch {
  pub mutation: MutationId,
  pub target: CacheKey,
  pub op: PatchOp,
  pub applied_at: Instant,
}

#[derive(Debug)]
struct PatchLog {
  base: Arc<Value>,
  patches: Vec<OptimisticPatch>,
}

/// Per-entry logs of pending optimistic patches.
#[derive(Debug)]
pub struct OptimisticCoordinator {
  logs: HashMap<CacheKey, PatchLog>,
  id_field: String,
}

impl Default for OptimisticCoordinator {
  fn default() -> Self {
    Self::new("id")
  }
}

impl OptimisticCoordinator {
  /// `id_field` names the field records are matched on.
  pub fn new(id_field: impl Into<String>) -> Self {
    Self {
      logs: HashMap::new(),
      id_field: id_field.into(),
    }
  }

  /// Apply `op` on top of `current` and record it. Returns the new value.
  pub fn apply(
    &mut self,
    mutation: MutationId,
    target: &CacheKey,
    current: &Arc<Value>,
    op: PatchOp,
    now: Instant,
  ) -> Arc<Value> {
    let next = Arc::new(apply_op(current, &op, &self.id_field));
    let log = self.logs.entry(target.clone()).or_insert_with(|| PatchLog {
      base: Arc::clone(current),
      patches: Vec::new(),
    });
    log.patches.push(OptimisticPatch {
      mutation,
      target: target.clone(),
      op,
      applied_at: now,
    });
    debug!(key = %target, mutation, pending = log.patches.len(), "applied optimistic patch");
    next
  }

  /// Fold `mutation`'s patches into the base using the server `response`.
  ///
  /// Returns the new visible value, or `None` if the mutation had no patch
  /// on `target`.
  pub fn commit(&mut self, mutation: MutationId, target: &CacheKey, response: &Value) -> Option<Arc<Value>> {
    let id_field = self.id_field.clone();
    let log = self.logs.get_mut(target)?;
    let (own, rest): (Vec<_>, Vec<_>) = log
      .patches
      .drain(..)
      .partition(|p| p.mutation == mutation);
    log.patches = rest;
    if own.is_empty() {
      return None;
    }

    let mut base = (*log.base).clone();
    for patch in &own {
      let resolved = resolve(&patch.op, response, &id_field);
      base = apply_op(&base, &upsert(&base, resolved, &id_field), &id_field);
    }
    log.base = Arc::new(base);
    debug!(key = %target, mutation, "committed optimistic patch");
    self.settle_log(target)
  }

  /// Drop `mutation`'s patches and recompute from the base.
  ///
  /// When no patches remain the original base `Arc` is returned untouched.
  pub fn rollback(&mut self, mutation: MutationId, target: &CacheKey) -> Option<Arc<Value>> {
    let log = self.logs.get_mut(target)?;
    let before = log.patches.len();
    log.patches.retain(|p| p.mutation != mutation);
    if log.patches.len() == before {
      return None;
    }
    debug!(key = %target, mutation, remaining = log.patches.len(), "rolled back optimistic patch");
    self.settle_log(target)
  }

  /// A fetch landed for `target`: make it the base and replay pending patches.
  pub fn rebase(&mut self, target: &CacheKey, fresh: Arc<Value>) -> Arc<Value> {
    let Some(log) = self.logs.get_mut(target) else {
      return fresh;
    };
    log.base = Arc::clone(&fresh);
    self.settle_log(target).unwrap_or(fresh)
  }

  fn settle_log(&mut self, target: &CacheKey) -> Option<Arc<Value>> {
    let log = self.logs.get(target)?;
    if log.patches.is_empty() {
      return self.logs.remove(target).map(|log| log.base);
    }
    let replayed = log
      .patches
      .iter()
      .fold((*log.base).clone(), |value, patch| {
        apply_op(&value, &patch.op, &self.id_field)
      });
    Some(Arc::new(replayed))
  }

  #[cfg(test)]
  fn has_pending(&self, target: &CacheKey) -> bool {
    self.logs.contains_key(target)
  }

  /// Drop the log of an evicted entry.
  pub fn forget(&mut self, target: &CacheKey) {
    self.logs.remove(target);
  }

  pub fn clear(&mut self) {
    self.logs.clear();
  }
}

/// Replace speculative content with what the server returned, when it
/// returned the record.
fn resolve(op: &PatchOp, response: &Value, id_field: &str) -> PatchOp {
  let returned_record = response.is_object() && response.get(id_field).is_some();
  match op {
    PatchOp::Insert { at, .. } if returned_record => PatchOp::Insert {
      record: response.clone(),
      at: *at,
    },
    PatchOp::Update { id, .. } if returned_record && same_id(response, id, id_field) => {
      PatchOp::Update {
        id: id.clone(),
        changes: response.clone(),
      }
    }
    other => other.clone(),
  }
}

/// An insert of a record the base already holds (a fetch brought it in
/// while the mutation was in flight) becomes an in-place update.
fn upsert(base: &Value, op: PatchOp, id_field: &str) -> PatchOp {
  match op {
    PatchOp::Insert { record, at } => {
      let existing = record.get(id_field).cloned().filter(|id| {
        base
          .as_array()
          .is_some_and(|items| items.iter().any(|item| same_id(item, id, id_field)))
      });
      match existing {
        Some(id) => PatchOp::Update {
          id,
          changes: record,
        },
        None => PatchOp::Insert { record, at },
      }
    }
    other => other,
  }
}

fn same_id(record: &Value, id: &Value, id_field: &str) -> bool {
  record.get(id_field).is_some_and(|own| ids_equal(own, id))
}

/// `1` and `"1"` identify the same record.
fn ids_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::String(s), other) | (other, Value::String(s)) if !other.is_string() => {
      other.to_string() == *s
    }
    _ => a == b,
  }
}

fn merge(record: &Value, changes: &Value) -> Value {
  match (record, changes) {
    (Value::Object(base), Value::Object(changes)) => {
      let mut merged: Map<String, Value> = base.clone();
      for (field, value) in changes {
        merged.insert(field.clone(), value.clone());
      }
      Value::Object(merged)
    }
    _ => record.clone(),
  }
}

/// Apply one patch to a list of records or to a single record.
pub fn apply_op(value: &Value, op: &PatchOp, id_field: &str) -> Value {
  match (value, op) {
    (Value::Array(items), PatchOp::Insert { record, at }) => {
      let mut items = items.clone();
      match at {
        InsertAt::Start => items.insert(0, record.clone()),
        InsertAt::End => items.push(record.clone()),
      }
      Value::Array(items)
    }
    (Value::Array(items), PatchOp::Update { id, changes }) => Value::Array(
      items
        .iter()
        .map(|item| {
          if same_id(item, id, id_field) {
            merge(item, changes)
          } else {
            item.clone()
          }
        })
        .collect(),
    ),
    (Value::Array(items), PatchOp::Delete { id }) => Value::Array(
      items
        .iter()
        .filter(|item| !same_id(item, id, id_field))
        .cloned()
        .collect(),
    ),
    (Value::Object(_), PatchOp::Update { id, changes }) if same_id(value, id, id_field) => {
      merge(value, changes)
    }
    // Single records are not inserted into or deleted from; the mutation's
    // invalidation refetches them.
    _ => value.clone(),
  }
}
