//! Cache entries, keys and tag-based invalidation.
//!
//! This module is transport-agnostic and synchronous:
//! - `CacheKey` derives stable keys from `(endpoint, args)`
//! - `CacheStore` holds entries, subscriber counts and handles eviction
//! - `TagIndex` / `TagRelations` decide which entries an invalidation hits

mod entry;
mod key;
mod store;
mod tags;

pub use entry::{CacheEntry, EntryStatus};
pub use key::CacheKey;
pub use store::{CacheStore, SubscriberId, SubscriptionHandle};
pub use tags::{Tag, TagGraphError, TagIndex, TagRelations};
