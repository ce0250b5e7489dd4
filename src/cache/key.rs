//! Cache key derivation.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for a cached `(endpoint, args)` pair.
///
/// Structurally equal args always produce the same key, regardless of the
/// order object fields were inserted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(endpoint: &str, args: &Value) -> Self {
    let mut canonical = String::new();
    write_canonical(args, &mut canonical);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0]);
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Self(format!("{}:{}", endpoint, &digest[..16]))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The endpoint part of the key.
  pub fn endpoint(&self) -> &str {
    self.0.split_once(':').map(|(e, _)| e).unwrap_or(&self.0)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Serialize a JSON value with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut fields: Vec<_> = map.iter().collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));

      out.push('{');
      for (i, (name, field)) in fields.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(name.clone()).to_string());
        out.push(':');
        write_canonical(field, out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}
