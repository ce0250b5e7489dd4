//! Endpoints, mutations and optimistic edits of the dashboard API.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::types::id_string;
use crate::cache::{CacheKey, Tag, TagGraphError, TagRelations};
use crate::endpoint::{Endpoint, Mutation, OptimisticUpdate};
use crate::fetch::ApiRequest;
use crate::mutation::{InsertAt, PatchOp};

// Tag kinds
pub const CLASS: &str = "Class";
pub const LESSON: &str = "Lesson";
pub const ASSESSMENT: &str = "Assessment";
pub const MESSAGE: &str = "Message";
pub const USER: &str = "User";
pub const POINTS: &str = "Points";
pub const LEADERBOARD: &str = "Leaderboard";
pub const DASHBOARD: &str = "Dashboard";
pub const ANALYTICS: &str = "Analytics";

// Endpoint names
pub const GET_CLASSES: &str = "getClasses";
pub const GET_CLASS: &str = "getClass";
pub const GET_LESSONS: &str = "getLessons";
pub const GET_ASSESSMENTS: &str = "getAssessments";
pub const GET_MESSAGES: &str = "getMessages";
pub const GET_MESSAGE: &str = "getMessage";
pub const GET_USERS: &str = "getUsers";
pub const GET_LEADERBOARD: &str = "getLeaderboard";
pub const GET_DASHBOARD: &str = "getDashboard";
pub const GET_ANALYTICS: &str = "getAnalytics";
pub const TRIGGER_REALTIME_EVENT: &str = "triggerRealtimeEvent";

/// Resource classes with their own poll interval
pub const MESSAGES_CLASS: &str = "messages";
pub const ANALYTICS_CLASS: &str = "analytics";

/// `args[field]` rendered for paths and tags, empty if missing.
fn arg(args: &Value, field: &str) -> String {
  args.get(field).and_then(id_string).unwrap_or_default()
}

/// `Kind` plus `Kind:id` for every record in a list response.
pub fn list_tags(kind: &str, data: &Value) -> Vec<Tag> {
  let items = data.get("items").unwrap_or(data);
  let mut tags = vec![Tag::kind(kind)];
  tags.extend(
    items
      .as_array()
      .into_iter()
      .flatten()
      .filter_map(|item| item.get("id").and_then(id_string))
      .map(|id| Tag::id(kind, id)),
  );
  tags
}

fn with_query_args(mut request: ApiRequest, args: &Value, fields: &[&str]) -> ApiRequest {
  for field in fields {
    if let Some(value) = args.get(*field).and_then(id_string) {
      request = request.with_query(*field, value);
    }
  }
  request
}

pub fn endpoints() -> Vec<Endpoint> {
  vec![
    Endpoint::new(GET_CLASSES, |_| ApiRequest::get("/classes"))
      .provides(|_, data| list_tags(CLASS, data)),
    Endpoint::new(GET_CLASS, |args| {
      ApiRequest::get(format!("/classes/{}", arg(args, "id")))
    })
    .provides(|args, _| vec![Tag::id(CLASS, arg(args, "id"))]),
    Endpoint::new(GET_LESSONS, |args| {
      with_query_args(ApiRequest::get("/lessons"), args, &["class_id"])
    })
    .provides(|args, data| {
      let mut tags = list_tags(LESSON, data);
      if let Some(class_id) = args.get("class_id").and_then(id_string) {
        tags.push(Tag::id(CLASS, class_id));
      }
      tags
    }),
    Endpoint::new(GET_ASSESSMENTS, |args| {
      with_query_args(ApiRequest::get("/assessments"), args, &["class_id"])
    })
    .provides(|_, data| list_tags(ASSESSMENT, data)),
    Endpoint::new(GET_MESSAGES, |args| {
      with_query_args(ApiRequest::get("/messages"), args, &["folder"])
    })
    .provides(|_, data| list_tags(MESSAGE, data))
    .resource_class(MESSAGES_CLASS),
    Endpoint::new(GET_MESSAGE, |args| {
      ApiRequest::get(format!("/messages/{}", arg(args, "id")))
    })
    .provides(|args, _| vec![Tag::id(MESSAGE, arg(args, "id"))]),
    Endpoint::new(GET_USERS, |args| {
      with_query_args(ApiRequest::get("/users"), args, &["role"])
    })
    .provides(|_, data| list_tags(USER, data)),
    Endpoint::new(GET_LEADERBOARD, |_| ApiRequest::get("/gamification/leaderboard"))
      .provides(|_, _| vec![Tag::kind(LEADERBOARD)]),
    Endpoint::new(GET_DASHBOARD, |_| ApiRequest::get("/dashboard"))
      .provides(|_, _| vec![Tag::kind(DASHBOARD)]),
    Endpoint::new(GET_ANALYTICS, |args| {
      with_query_args(ApiRequest::get("/analytics"), args, &["period", "class_id"])
    })
    .provides(|_, _| vec![Tag::kind(ANALYTICS)])
    .resource_class(ANALYTICS_CLASS),
    // Every call must reach the server
    Endpoint::new(TRIGGER_REALTIME_EVENT, |args| {
      ApiRequest::post("/realtime/trigger", args.clone())
    })
    .dedupe(false),
  ]
}

/// The default invalidation cascade.
pub fn default_relations() -> Result<TagRelations, TagGraphError> {
  TagRelations::new(default_relation_edges())
}

pub fn default_relation_edges() -> BTreeMap<Tag, Vec<Tag>> {
  BTreeMap::from([
    (Tag::kind(CLASS), vec![Tag::kind(DASHBOARD), Tag::kind(ANALYTICS)]),
    (Tag::kind(LESSON), vec![Tag::kind(CLASS)]),
    (Tag::kind(ASSESSMENT), vec![Tag::kind(ANALYTICS)]),
    (Tag::kind(MESSAGE), vec![Tag::kind(DASHBOARD)]),
    (Tag::kind(POINTS), vec![Tag::kind(LEADERBOARD)]),
    (Tag::kind(USER), vec![Tag::kind(DASHBOARD)]),
  ])
}

/// Request body without the path id.
fn body_without_id(args: &Value) -> Value {
  match args {
    Value::Object(fields) => {
      let body: Map<String, Value> = fields
        .iter()
        .filter(|(field, _)| field.as_str() != "id")
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect();
      Value::Object(body)
    }
    other => other.clone(),
  }
}

pub fn create_class() -> Mutation {
  Mutation::new("createClass", |args| ApiRequest::post("/classes", args.clone()))
    .invalidates(|_, _| vec![Tag::kind(CLASS)])
    .success_message("Class created")
}

pub fn update_class() -> Mutation {
  Mutation::new("updateClass", |args| {
    ApiRequest::patch(format!("/classes/{}", arg(args, "id")), body_without_id(args))
  })
  .invalidates(|args, _| vec![Tag::id(CLASS, arg(args, "id"))])
  .success_message("Class updated")
}

pub fn delete_class() -> Mutation {
  Mutation::new("deleteClass", |args| {
    ApiRequest::delete(format!("/classes/{}", arg(args, "id")))
  })
  .invalidates(|args, _| vec![Tag::id(CLASS, arg(args, "id"))])
  .success_message("Class deleted")
}

/// The list and detail are patched in place, only the unread counters on
/// the dashboard need a refetch.
pub fn mark_message_read() -> Mutation {
  Mutation::new("markMessageRead", |args| {
    ApiRequest::patch(
      format!("/messages/{}/read", arg(args, "id")),
      serde_json::json!({ "is_read": true }),
    )
  })
  .invalidates(|_, _| vec![Tag::kind(DASHBOARD)])
}

pub fn send_message() -> Mutation {
  Mutation::new("sendMessage", |args| ApiRequest::post("/messages", args.clone()))
    .invalidates(|_, _| vec![Tag::kind(MESSAGE)])
    .success_message("Message sent")
}

pub fn award_points() -> Mutation {
  Mutation::new("awardPoints", |args| {
    ApiRequest::post("/gamification/points", args.clone())
  })
  .invalidates(|args, _| {
    vec![Tag::kind(POINTS), Tag::id(USER, arg(args, "user_id"))]
  })
  .success_message("Points awarded")
}

fn classes_key() -> CacheKey {
  CacheKey::new(GET_CLASSES, &Value::Null)
}

fn id_args(id: &Value) -> Value {
  serde_json::json!({ "id": id })
}

/// Show a class being created at the top of the class list. `fields` must
/// not carry an id; `temp_id` stands in until the server answers.
pub fn optimistic_create_class(temp_id: &str, fields: &Value) -> Vec<OptimisticUpdate> {
  let mut record = fields.as_object().cloned().unwrap_or_default();
  record.insert("id".to_string(), Value::String(temp_id.to_string()));
  vec![OptimisticUpdate {
    target: classes_key(),
    op: PatchOp::Insert {
      record: Value::Object(record),
      at: InsertAt::Start,
    },
  }]
}

/// Patch a class in the list and in its detail entry.
pub fn optimistic_update_class(id: &Value, changes: &Value) -> Vec<OptimisticUpdate> {
  let op = PatchOp::Update {
    id: id.clone(),
    changes: changes.clone(),
  };
  vec![
    OptimisticUpdate {
      target: classes_key(),
      op: op.clone(),
    },
    OptimisticUpdate {
      target: CacheKey::new(GET_CLASS, &id_args(id)),
      op,
    },
  ]
}

pub fn optimistic_delete_class(id: &Value) -> Vec<OptimisticUpdate> {
  vec![OptimisticUpdate {
    target: classes_key(),
    op: PatchOp::Delete { id: id.clone() },
  }]
}

/// Flip `is_read` in both the message list and the message detail.
pub fn optimistic_mark_read(id: &Value) -> Vec<OptimisticUpdate> {
  let op = PatchOp::Update {
    id: id.clone(),
    changes: serde_json::json!({ "is_read": true }),
  };
  vec![
    OptimisticUpdate {
      target: CacheKey::new(GET_MESSAGES, &Value::Null),
      op: op.clone(),
    },
    OptimisticUpdate {
      target: CacheKey::new(GET_MESSAGE, &id_args(id)),
      op,
    },
  ]
}
