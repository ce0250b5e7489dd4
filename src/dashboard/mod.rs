//! The classroom dashboard API: endpoint catalog, typed records and views.

mod endpoints;
mod types;
mod views;

pub use endpoints::*;
pub use types::{
  id_string, parse_list, Assessment, Class, ClassOverview, Id, LeaderboardEntry, Lesson, Message,
};
pub use views::{
  average_score_by_class, classes_with_lesson_counts, leaderboard, unread_message_count,
};

use std::sync::Arc;
use std::time::Duration;

use crate::cache::TagRelations;
use crate::client::{ClientOptions, QueryClient};
use crate::fetch::Transport;
use crate::polling::PollingIntervals;

/// `messages` every 30s, `analytics` every 5 minutes.
pub fn default_polling() -> PollingIntervals {
  let mut intervals = PollingIntervals::default();
  intervals.insert(MESSAGES_CLASS, Duration::from_secs(30));
  intervals.insert(ANALYTICS_CLASS, Duration::from_secs(300));
  intervals
}

/// A client with every dashboard endpoint registered.
pub fn client(
  transport: Arc<dyn Transport>,
  relations: TagRelations,
  options: ClientOptions,
) -> QueryClient {
  QueryClient::builder(transport)
    .endpoints(endpoints())
    .relations(relations)
    .options(options)
    .build()
}
