//! Client-side query cache for the classroom dashboard API.
//!
//! Responses are cached per `(endpoint, args)`, shared between concurrent
//! readers, refreshed when a mutation invalidates one of their tags and
//! dropped once nobody has subscribed for a while. Mutations can patch the
//! cache optimistically and roll back on failure.

pub mod cache;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod endpoint;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod polling;
pub mod selectors;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheKey, EntryStatus, SubscriptionHandle, Tag, TagRelations};
pub use client::{CacheUpdate, ClientBuilder, ClientOptions, QueryClient, Subscription};
pub use endpoint::{Endpoint, Mutation, OptimisticUpdate};
pub use error::{ApiError, ClientError, ErrorKind};
pub use fetch::{ApiRequest, HttpTransport, Method, RetryPolicy, Transport};
pub use mutation::{InsertAt, PatchOp};
pub use notify::{Notification, NotificationLevel, NotificationSink};
pub use observer::{Observer, QueryState};
pub use selectors::Selector;
