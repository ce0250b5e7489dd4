use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Record id as sent by the API: numeric, or a string (temporary ids are
/// always strings).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
  Num(i64),
  Text(String),
}

impl fmt::Display for Id {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Id::Num(n) => write!(f, "{}", n),
      Id::Text(s) => f.write_str(s),
    }
  }
}

/// Class summary for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
  pub id: Id,
  pub name: String,
  #[serde(default)]
  pub subject: Option<String>,
  #[serde(default)]
  pub teacher_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
  pub id: Id,
  pub class_id: Id,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
  pub id: Id,
  pub class_id: Id,
  pub title: String,
  /// Average score in percent, absent until graded
  #[serde(default)]
  pub average_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: Id,
  pub subject: String,
  #[serde(default)]
  pub sender_id: Option<Id>,
  #[serde(default)]
  pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
  pub user_id: Id,
  pub name: String,
  pub points: i64,
}

/// Class joined with how many lessons it has
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassOverview {
  pub class: Class,
  pub lesson_count: usize,
}

/// Decode a list response. Accepts a bare array or `{ "items": [...] }`.
pub fn parse_list<T: DeserializeOwned>(value: &Value) -> Result<Vec<T>, serde_json::Error> {
  let items = value.get("items").unwrap_or(value);
  Vec::<T>::deserialize(items)
}

/// Render a JSON id the way it appears in paths and tags.
pub fn id_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
