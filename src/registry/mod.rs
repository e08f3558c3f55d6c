//! Subscription registry: deduplicated, self-evicting stream entries
//!
//! The registry maps keys to cache entries. Each entry owns one subscription to
//! a source stream and multiplexes it to any number of subscribers, keeping the
//! latest emission in a read cell for synchronous reads.
//!
//! # Architecture
//!
//! ```text
//!                     SubscriptionRegistry (Arc<Shared>)
//!                     ┌──────────────────────────────┐
//!                     │ entries: HashMap<Key,        │
//!                     │   [Slot { identity,          │
//!                     │           CacheEntry<T> }]   │
//!                     │ >                            │
//!                     └──────────────┬───────────────┘
//!                                    │  get_or_insert / attach
//!                                    ▼
//!    [Source stream] ──pump──► CacheEntry { cell, subscribers, timer }
//!                                    │
//!         ┌──────────────────────────┼──────────────────────────┐
//!         ▼                          ▼                          ▼
//!    [Subscriber]               [Subscriber]               entry.read()
//!    sub.recv()                 sub.recv()                 (no attach)
//! ```
//!
//! # Lifetime
//!
//! An entry with no subscribers runs a grace-period timer. Attaching cancels
//! it; when it fires, the entry closes its subscription and removes itself
//! from the registry, but only if the registry still maps the key to that
//! same instance.

pub mod config;
pub mod entry;
pub mod key;
pub mod store;
pub mod subscriber;

pub use config::{
    RegistryConfig, SubscribePolicy, DEFAULT_GRACE_PERIOD, DEFAULT_UPDATE_CAPACITY,
};
pub use entry::{CacheEntry, EntryId, EntryState, EntryStats, Termination};
pub use key::CacheKey;
pub use store::SubscriptionRegistry;
pub use subscriber::{Subscriber, SubscriberId, Update};
