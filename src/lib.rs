//! stream-cache: one live subscription per key, many synchronous readers
//!
//! Turns push-based streams into cells that any number of consumers can poll
//! without blocking. A [`SubscriptionRegistry`] deduplicates requests by key so
//! each logical request subscribes to its source at most once; the resulting
//! [`CacheEntry`] fans every emission out to its subscribers, keeps the latest
//! one readable, and tears itself down after a grace period once nobody is
//! attached.
//!
//! # Example
//!
//! ```no_run
//! use futures_util::stream;
//! use stream_cache::{BoxError, CacheKey, SubscriptionRegistry};
//!
//! # async fn example() -> stream_cache::Result<()> {
//! let registry = SubscriptionRegistry::new();
//! let key = CacheKey::new("counter").part("home").option("skipCache", false);
//!
//! let subscriber = registry.attach(key, || {
//!     stream::iter(vec![Ok::<u32, BoxError>(1), Ok(2)])
//! })?;
//!
//! match subscriber.read() {
//!     Ok(value) => println!("latest: {}", value),
//!     Err(e) if e.is_not_ready() => println!("still loading"),
//!     Err(e) => println!("failed: {}", e),
//! }
//!
//! let first = subscriber.entry().wait_first().await;
//! println!("first: {:?}", first.ok());
//! # Ok(())
//! # }
//! ```

pub mod cell;
pub mod error;
pub mod registry;
pub mod request;

#[cfg(test)]
mod testing;

pub use cell::{CellState, FirstSettlement, ReadCell, ReadError, WaitError, WaitHandle};
pub use error::{BoxError, CacheError, EmptyStream, Result, SourceError};
pub use registry::{
    CacheEntry, CacheKey, EntryId, EntryState, EntryStats, RegistryConfig, SubscribePolicy,
    Subscriber, SubscriberId, SubscriptionRegistry, Termination, Update, DEFAULT_GRACE_PERIOD,
    DEFAULT_UPDATE_CAPACITY,
};
pub use request::{ActiveRequest, RequestCache};
