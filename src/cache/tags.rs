//! Resource tags, the static invalidation graph and the key ↔ tag index.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use super::key::CacheKey;

/// A logical resource (`Class:42`) or resource family (`Class`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Tag {
  kind: String,
  id: Option<String>,
}

impl Tag {
  /// Tag covering every resource of `kind`.
  pub fn kind(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      id: None,
    }
  }

  /// Tag for a single resource.
  pub fn id(kind: impl Into<String>, id: impl fmt::Display) -> Self {
    Self {
      kind: kind.into(),
      id: Some(id.to_string()),
    }
  }

  pub fn kind_name(&self) -> &str {
    &self.kind
  }

  pub fn resource_id(&self) -> Option<&str> {
    self.id.as_deref()
  }

  /// The family this tag belongs to (`Class:42` → `Class`).
  pub fn family(&self) -> Tag {
    Tag::kind(self.kind.clone())
  }

  /// Whether invalidating `self` hits an entry that provides `provided`.
  ///
  /// A family tag hits every tag of its kind; an id tag only hits itself.
  pub fn matches(&self, provided: &Tag) -> bool {
    self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.id {
      Some(id) => write!(f, "{}:{}", self.kind, id),
      None => f.write_str(&self.kind),
    }
  }
}

impl FromStr for Tag {
  type Err = Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s.trim().split_once(':') {
      Some((kind, id)) => Tag::id(kind, id),
      None => Tag::kind(s.trim()),
    })
  }
}

impl From<String> for Tag {
  fn from(s: String) -> Self {
    match s.parse() {
      Ok(tag) => tag,
      Err(never) => match never {},
    }
  }
}

impl From<&str> for Tag {
  fn from(s: &str) -> Self {
    Tag::from(s.to_string())
  }
}

impl From<Tag> for String {
  fn from(tag: Tag) -> Self {
    tag.to_string()
  }
}

/// Rejected invalidation graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagGraphError {
  #[error("cyclic tag relation: {}", format_path(.path))]
  Cycle { path: Vec<Tag> },
}

fn format_path(path: &[Tag]) -> String {
  path
    .iter()
    .map(Tag::to_string)
    .collect::<Vec<_>>()
    .join(" -> ")
}

/// Static `Tag → [Tag]` cascade applied on invalidation.
///
/// An id tag also cascades through the relations of its family, so
/// invalidating `Class:42` reaches whatever `Class` reaches. The graph is
/// checked for cycles on construction.
#[derive(Debug, Clone, Default)]
pub struct TagRelations {
  edges: BTreeMap<Tag, Vec<Tag>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
  Visiting,
  Done,
}

impl TagRelations {
  pub fn new(edges: BTreeMap<Tag, Vec<Tag>>) -> Result<Self, TagGraphError> {
    let relations = Self { edges };
    relations.check_acyclic()?;
    Ok(relations)
  }

  fn successors(&self, tag: &Tag) -> impl Iterator<Item = &Tag> {
    let own = self.edges.get(tag).into_iter().flatten();
    let family = tag
      .resource_id()
      .and_then(|_| self.edges.get(&tag.family()))
      .into_iter()
      .flatten();
    own.chain(family)
  }

  fn check_acyclic(&self) -> Result<(), TagGraphError> {
    let mut marks: HashMap<Tag, Mark> = HashMap::new();
    for start in self.edges.keys() {
      let mut path = Vec::new();
      self.visit(start, &mut marks, &mut path)?;
    }
    Ok(())
  }

  fn visit(
    &self,
    tag: &Tag,
    marks: &mut HashMap<Tag, Mark>,
    path: &mut Vec<Tag>,
  ) -> Result<(), TagGraphError> {
    match marks.get(tag) {
      Some(Mark::Done) => return Ok(()),
      Some(Mark::Visiting) => {
        let start = path.iter().position(|t| t == tag).unwrap_or(0);
        let mut cycle = path[start..].to_vec();
        cycle.push(tag.clone());
        return Err(TagGraphError::Cycle { path: cycle });
      }
      None => {}
    }

    marks.insert(tag.clone(), Mark::Visiting);
    path.push(tag.clone());
    for next in self.successors(tag) {
      self.visit(next, marks, path)?;
    }
    path.pop();
    marks.insert(tag.clone(), Mark::Done);
    Ok(())
  }

  /// Transitive closure of `tags` through the relation table.
  pub fn expand(&self, tags: impl IntoIterator<Item = Tag>) -> BTreeSet<Tag> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<Tag> = tags.into_iter().collect();

    while let Some(tag) = stack.pop() {
      if !seen.insert(tag.clone()) {
        continue;
      }
      stack.extend(self.successors(&tag).filter(|t| !seen.contains(*t)).cloned());
    }
    seen
  }

  pub fn is_empty(&self) -> bool {
    self.edges.is_empty()
  }
}

/// Bidirectional index between cache keys and the tags they provide.
#[derive(Debug, Default)]
pub struct TagIndex {
  by_key: HashMap<CacheKey, BTreeSet<Tag>>,
  by_tag: HashMap<Tag, BTreeSet<CacheKey>>,
}

impl TagIndex {
  /// Replace the tags provided by `key`.
  pub fn index_entry(&mut self, key: &CacheKey, tags: BTreeSet<Tag>) {
    self.remove(key);
    for tag in &tags {
      self
        .by_tag
        .entry(tag.clone())
        .or_default()
        .insert(key.clone());
    }
    if !tags.is_empty() {
      self.by_key.insert(key.clone(), tags);
    }
  }

  pub fn remove(&mut self, key: &CacheKey) {
    let Some(tags) = self.by_key.remove(key) else {
      return;
    };
    for tag in tags {
      if let Some(keys) = self.by_tag.get_mut(&tag) {
        keys.remove(key);
        if keys.is_empty() {
          self.by_tag.remove(&tag);
        }
      }
    }
  }

  #[cfg(test)]
  fn tags_of(&self, key: &CacheKey) -> Option<&BTreeSet<Tag>> {
    self.by_key.get(key)
  }

  /// Every key providing a tag hit by one of `tags`.
  pub fn keys_for(&self, tags: &BTreeSet<Tag>) -> BTreeSet<CacheKey> {
    let mut keys = BTreeSet::new();
    for tag in tags {
      if tag.resource_id().is_some() {
        if let Some(hit) = self.by_tag.get(tag) {
          keys.extend(hit.iter().cloned());
        }
      } else {
        for (provided, hit) in &self.by_tag {
          if tag.matches(provided) {
            keys.extend(hit.iter().cloned());
          }
        }
      }
    }
    keys
  }

  pub fn clear(&mut self) {
    self.by_key.clear();
    self.by_tag.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn relations(pairs: &[(&str, &[&str])]) -> BTreeMap<Tag, Vec<Tag>> {
    pairs
      .iter()
      .map(|(from, to)| (Tag::from(*from), to.iter().map(|t| Tag::from(*t)).collect()))
      .collect()
  }

  fn set(tags: &[&str]) -> BTreeSet<Tag> {
    tags.iter().map(|t| Tag::from(*t)).collect()
  }

  #[test]
  fn test_parse_and_display() {
    let tag: Tag = "Class:42".parse().unwrap();
    assert_eq!(tag, Tag::id("Class", 42));
    assert_eq!(tag.to_string(), "Class:42");
    assert_eq!(Tag::from("Dashboard").to_string(), "Dashboard");
    assert_eq!(tag.family(), Tag::kind("Class"));
  }

  #[test]
  fn test_matching() {
    assert!(Tag::kind("Class").matches(&Tag::id("Class", 1)));
    assert!(Tag::kind("Class").matches(&Tag::kind("Class")));
    assert!(Tag::id("Class", 1).matches(&Tag::id("Class", 1)));
    assert!(!Tag::id("Class", 1).matches(&Tag::id("Class", 2)));
    assert!(!Tag::id("Class", 1).matches(&Tag::kind("Class")));
    assert!(!Tag::kind("Lesson").matches(&Tag::id("Class", 1)));
  }

  #[test]
  fn test_expand_is_transitive() {
    let rel = TagRelations::new(relations(&[
      ("Lesson", &["Class"]),
      ("Class", &["Dashboard", "Analytics"]),
    ]))
    .unwrap();

    assert_eq!(
      rel.expand([Tag::kind("Lesson")]),
      set(&["Lesson", "Class", "Dashboard", "Analytics"])
    );
    // Id tags cascade through their family
    assert_eq!(
      rel.expand([Tag::id("Class", 7)]),
      set(&["Class:7", "Dashboard", "Analytics"])
    );
  }

  #[test]
  fn test_diamond_is_not_a_cycle() {
    let rel = TagRelations::new(relations(&[
      ("A", &["B", "C"]),
      ("B", &["D"]),
      ("C", &["D"]),
    ]));
    assert!(rel.is_ok());
    assert_eq!(rel.unwrap().expand([Tag::kind("A")]).len(), 4);
  }

  #[test]
  fn test_cycle_rejected() {
    let err = TagRelations::new(relations(&[
      ("A", &["B"]),
      ("B", &["C"]),
      ("C", &["A"]),
    ]))
    .unwrap_err();

    let TagGraphError::Cycle { path } = err;
    assert_eq!(path.first(), path.last());
    assert_eq!(path.len(), 4);
  }

  #[test]
  fn test_cycle_through_family_rejected() {
    let result = TagRelations::new(relations(&[("Class", &["Lesson:1"]), ("Lesson", &["Class"])]));
    assert!(result.is_err());
  }

  #[test]
  fn test_self_loop_rejected() {
    assert!(TagRelations::new(relations(&[("A", &["A"])])).is_err());
  }

  #[test]
  fn test_index_lookup() {
    let list = CacheKey::new("getClasses", &json!(null));
    let one = CacheKey::new("getClass", &json!({"id": 1}));
    let two = CacheKey::new("getClass", &json!({"id": 2}));

    let mut index = TagIndex::default();
    index.index_entry(&list, set(&["Class", "Class:1", "Class:2"]));
    index.index_entry(&one, set(&["Class:1"]));
    index.index_entry(&two, set(&["Class:2"]));

    assert_eq!(index.keys_for(&set(&["Class:1"])), BTreeSet::from([list.clone(), one.clone()]));
    assert_eq!(index.keys_for(&set(&["Class"])).len(), 3);
    assert!(index.keys_for(&set(&["Lesson"])).is_empty());

    // Re-indexing replaces previous tags
    index.index_entry(&list, set(&["Class"]));
    assert_eq!(index.keys_for(&set(&["Class:1"])), BTreeSet::from([one.clone()]));

    index.remove(&one);
    assert!(index.keys_for(&set(&["Class:1"])).is_empty());
    assert!(index.tags_of(&one).is_none());
  }

  #[test]
  fn test_tag_deserializes_from_string() {
    let tags: Vec<Tag> = serde_json::from_value(json!(["Class", "Class:3"])).unwrap();
    assert_eq!(tags, vec![Tag::kind("Class"), Tag::id("Class", 3)]);
  }
}
