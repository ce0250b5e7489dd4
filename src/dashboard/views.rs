//! Derived views the dashboard screens render.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use super::types::{
  parse_list, Assessment, Class, ClassOverview, Id, LeaderboardEntry, Lesson, Message,
};
use crate::selectors::Selector;

/// Decode input `index` as a list. Missing inputs and bad shapes yield an
/// empty list.
fn list_or_empty<T: DeserializeOwned>(view: &str, inputs: &[&Value], index: usize) -> Vec<T> {
  let Some(value) = inputs.get(index) else {
    warn!(view, index, "missing selector input");
    return Vec::new();
  };
  parse_list(value).unwrap_or_else(|err| {
    warn!(view, error = %err, "unexpected response shape");
    Vec::new()
  })
}

/// Inputs: classes, lessons.
pub fn classes_with_lesson_counts() -> Selector<Vec<ClassOverview>> {
  Selector::new("classes_with_lesson_counts", |inputs| {
    let classes: Vec<Class> = list_or_empty("classes", inputs, 0);
    let lessons: Vec<Lesson> = list_or_empty("lessons", inputs, 1);

    let mut counts: HashMap<&Id, usize> = HashMap::new();
    for lesson in &lessons {
      *counts.entry(&lesson.class_id).or_default() += 1;
    }

    classes
      .into_iter()
      .map(|class| ClassOverview {
        lesson_count: counts.get(&class.id).copied().unwrap_or(0),
        class,
      })
      .collect()
  })
}

/// Inputs: messages.
pub fn unread_message_count() -> Selector<usize> {
  Selector::new("unread_message_count", |inputs| {
    list_or_empty::<Message>("messages", inputs, 0)
      .iter()
      .filter(|m| !m.is_read)
      .count()
  })
}

/// Inputs: leaderboard. Highest points first, ties by name.
pub fn leaderboard() -> Selector<Vec<LeaderboardEntry>> {
  Selector::new("leaderboard", |inputs| {
    let mut entries: Vec<LeaderboardEntry> = list_or_empty("leaderboard", inputs, 0);
    entries.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.name.cmp(&b.name)));
    entries
  })
}

/// Inputs: assessments. Mean of graded assessments per class id; classes
/// without grades are left out.
pub fn average_score_by_class() -> Selector<BTreeMap<Id, f64>> {
  Selector::new("average_score_by_class", |inputs| {
    let mut sums: BTreeMap<Id, (f64, u32)> = BTreeMap::new();
    for assessment in list_or_empty::<Assessment>("assessments", inputs, 0) {
      if let Some(score) = assessment.average_score {
        let (sum, count) = sums.entry(assessment.class_id).or_default();
        *sum += score;
        *count += 1;
      }
    }
    sums
      .into_iter()
      .map(|(class, (sum, count))| (class, sum / f64::from(count)))
      .collect()
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;

  #[test]
  fn test_lesson_counts() {
    let classes = Arc::new(json!([
      { "id": 1, "name": "Algebra" },
      { "id": 2, "name": "Biology" },
    ]));
    let lessons = Arc::new(json!([
      { "id": 10, "class_id": 1, "title": "Equations" },
      { "id": 11, "class_id": 1, "title": "Graphs" },
    ]));

    let view = classes_with_lesson_counts();
    let overview = view.select(&[Some(classes), Some(lessons)]).unwrap();
    let counts: Vec<usize> = overview.iter().map(|o| o.lesson_count).collect();
    assert_eq!(counts, vec![2, 0]);
  }

  #[test]
  fn test_unread_count_recomputes_only_on_change() {
    let view = unread_message_count();
    let messages = Arc::new(json!([
      { "id": 1, "subject": "Hi", "is_read": false },
      { "id": 2, "subject": "Re: Hi", "is_read": true },
    ]));

    assert_eq!(*view.select(&[Some(messages.clone())]).unwrap(), 1);
    assert_eq!(*view.select(&[Some(messages)]).unwrap(), 1);
    assert_eq!(view.recomputations(), 1);
  }

  #[test]
  fn test_leaderboard_order() {
    let board = Arc::new(json!([
      { "user_id": 1, "name": "Cam", "points": 10 },
      { "user_id": 2, "name": "Ada", "points": 30 },
      { "user_id": 3, "name": "Bea", "points": 10 },
    ]));
    let names: Vec<String> = leaderboard()
      .select(&[Some(board)])
      .unwrap()
      .iter()
      .map(|e| e.name.clone())
      .collect();
    assert_eq!(names, vec!["Ada", "Bea", "Cam"]);
  }

  #[test]
  fn test_average_score() {
    let assessments = Arc::new(json!([
      { "id": 1, "class_id": 1, "title": "Quiz", "average_score": 80.0 },
      { "id": 2, "class_id": 1, "title": "Test", "average_score": 90.0 },
      { "id": 3, "class_id": 2, "title": "Quiz" },
    ]));
    let averages = average_score_by_class()
      .select(&[Some(assessments)])
      .unwrap();
    assert_eq!(averages.get(&Id::Num(1)), Some(&85.0));
    assert!(!averages.contains_key(&Id::Num(2)));
  }

  #[test]
  fn test_missing_input_yields_empty_counts() {
    let classes = Arc::new(json!([{ "id": 1, "name": "Algebra" }]));
    let overview = classes_with_lesson_counts()
      .select(&[Some(classes)])
      .unwrap();
    assert_eq!(overview.len(), 1);
    assert_eq!(overview[0].lesson_count, 0);

    assert!(leaderboard().select(&[]).unwrap().is_empty());
  }

  #[test]
  fn test_bad_shape_yields_empty_view() {
    let view = unread_message_count();
    assert_eq!(*view.select(&[Some(Arc::new(json!("oops")))]).unwrap(), 0);
  }
}
