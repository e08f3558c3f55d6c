//! Subscription registry implementation
//!
//! Maps keys to live cache entries. Lookups and inserts happen under one lock,
//! so concurrent requests for the same key never subscribe twice. Entries are
//! never removed from the outside: an entry whose grace period ran out calls
//! back into `remove_if_current` itself.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use futures_util::Stream;
use parking_lot::Mutex;

use super::config::RegistryConfig;
use super::entry::{ensure_runtime, into_source, CacheEntry, EntryId, EntryStats};
use super::subscriber::Subscriber;
use crate::error::{BoxError, CacheError, Result};

/// Type-erased view of an entry, enough for bookkeeping
trait ErasedEntry: Send + Sync {
    fn is_torn_down(&self) -> bool;
    fn stats(&self) -> EntryStats;
}

impl<T: Clone + Send + Sync + 'static> ErasedEntry for CacheEntry<T> {
    fn is_torn_down(&self) -> bool {
        CacheEntry::is_torn_down(self)
    }

    fn stats(&self) -> EntryStats {
        CacheEntry::stats(self)
    }
}

/// One entry within a key's bucket
struct Slot {
    id: EntryId,
    /// Semantic identity within the key family; `()` for plain keys
    identity: Box<dyn Any + Send + Sync>,
    value_type: &'static str,
    entry: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedEntry>,
}

impl Slot {
    fn new<T, I>(entry: &Arc<CacheEntry<T>>, identity: I) -> Self
    where
        T: Clone + Send + Sync + 'static,
        I: PartialEq + Send + Sync + 'static,
    {
        Self {
            id: entry.id(),
            identity: Box::new(identity),
            value_type: type_name::<T>(),
            entry: Arc::clone(entry) as Arc<dyn Any + Send + Sync>,
            erased: Arc::clone(entry) as Arc<dyn ErasedEntry>,
        }
    }

    /// Typed entry if this slot matches `identity` and is still live
    fn matches<T, I>(&self, key: &str, identity: &I) -> Option<Result<Arc<CacheEntry<T>>>>
    where
        T: Clone + Send + Sync + 'static,
        I: PartialEq + 'static,
    {
        if self.erased.is_torn_down() {
            return None;
        }
        if self.identity.downcast_ref::<I>() != Some(identity) {
            return None;
        }

        Some(
            Arc::clone(&self.entry)
                .downcast::<CacheEntry<T>>()
                .map_err(|_| CacheError::KeyMisuse {
                    key: key.to_string(),
                    expected: type_name::<T>(),
                    found: self.value_type,
                }),
        )
    }
}

/// State shared between a registry and the entries it created
pub(crate) struct Shared {
    entries: Mutex<HashMap<String, Vec<Slot>>>,
    config: RegistryConfig,
}

impl Shared {
    /// Drop the slot for `key` only if it still holds entry `id` and that entry is torn down
    pub(crate) fn remove_if_current(&self, key: &str, id: EntryId) -> bool {
        let mut entries = self.entries.lock();

        let Some(bucket) = entries.get_mut(key) else {
            tracing::warn!(key = %key, entry = %id, "Stale removal ignored (no entry)");
            return false;
        };

        if bucket
            .iter()
            .any(|slot| slot.id == id && !slot.erased.is_torn_down())
        {
            tracing::warn!(key = %key, entry = %id, "Removal of live entry refused");
            return false;
        }

        let (removed, kept): (Vec<Slot>, Vec<Slot>) =
            mem::take(bucket).into_iter().partition(|slot| slot.id == id);
        *bucket = kept;
        if bucket.is_empty() {
            entries.remove(key);
        }
        let remaining = entries.len();
        drop(entries);

        if removed.is_empty() {
            tracing::warn!(key = %key, entry = %id, "Stale removal ignored (superseded)");
            return false;
        }

        tracing::info!(key = %key, entry = %id, keys = remaining, "Entry removed");
        true
    }
}

/// Registry of deduplicated stream subscriptions
///
/// Cheap to clone; clones share the same entries. Must be used from within a
/// Tokio runtime, which drives source streams and grace-period timers.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl SubscriptionRegistry {
    /// Create a new registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Get the entry for `key`, creating it from `factory` if there is none
    ///
    /// `factory` runs at most once per key until the entry is evicted. It is
    /// called while the registry is locked and must not call back into it.
    /// Fails if `key` is bound to an entry of a different value type, or with
    /// [`CacheError::NoRuntime`] when a new entry is needed outside a Tokio runtime.
    pub fn get_or_insert<T, S, E, F>(
        &self,
        key: impl Into<String>,
        factory: F,
    ) -> Result<Arc<CacheEntry<T>>>
    where
        T: Clone + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> S,
    {
        self.get_or_insert_with_identity(key, (), factory)
    }

    /// Like [`get_or_insert`](Self::get_or_insert), with a semantic identity
    ///
    /// `key` selects a family bucket; within it, the entry whose identity is
    /// equal to `identity` is reused. Use this when a string key alone cannot
    /// tell two requests apart.
    pub fn get_or_insert_with_identity<T, I, S, E, F>(
        &self,
        key: impl Into<String>,
        identity: I,
        factory: F,
    ) -> Result<Arc<CacheEntry<T>>>
    where
        T: Clone + Send + Sync + 'static,
        I: PartialEq + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> S,
    {
        let key = key.into();
        let mut entries = self.shared.entries.lock();

        if let Some(found) = Self::find::<T, I>(&entries, &key, &identity) {
            let entry = found?;
            tracing::debug!(key = %key, entry = %entry.id(), "Entry reused");
            return Ok(entry);
        }

        ensure_runtime(&key)?;
        let entry = self.create(&mut entries, key, identity, factory);
        drop(entries);

        entry.activate();
        Ok(entry)
    }

    /// Get or create the entry for `key` and attach to it in one step
    ///
    /// No eviction can happen between the lookup and the attach.
    pub fn attach<T, S, E, F>(&self, key: impl Into<String>, factory: F) -> Result<Subscriber<T>>
    where
        T: Clone + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> S,
    {
        self.attach_with_identity(key, (), factory)
    }

    /// [`attach`](Self::attach) with a semantic identity
    pub fn attach_with_identity<T, I, S, E, F>(
        &self,
        key: impl Into<String>,
        identity: I,
        factory: F,
    ) -> Result<Subscriber<T>>
    where
        T: Clone + Send + Sync + 'static,
        I: PartialEq + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> S,
    {
        let key = key.into();
        let mut entries = self.shared.entries.lock();

        if let Some(found) = Self::find::<T, I>(&entries, &key, &identity) {
            match found?.attach() {
                Ok(subscriber) => return Ok(subscriber),
                // Torn down between the liveness check and the attach
                Err(CacheError::Evicted(_)) => {}
                Err(err) => return Err(err),
            }
        }

        ensure_runtime(&key)?;
        let entry = self.create(&mut entries, key, identity, factory);
        let subscriber = entry.attach()?;
        drop(entries);

        entry.activate();
        Ok(subscriber)
    }

    fn find<T, I>(
        entries: &HashMap<String, Vec<Slot>>,
        key: &str,
        identity: &I,
    ) -> Option<Result<Arc<CacheEntry<T>>>>
    where
        T: Clone + Send + Sync + 'static,
        I: PartialEq + 'static,
    {
        entries
            .get(key)
            .and_then(|bucket| bucket.iter().find_map(|slot| slot.matches::<T, I>(key, identity)))
    }

    fn create<T, I, S, E, F>(
        &self,
        entries: &mut HashMap<String, Vec<Slot>>,
        key: String,
        identity: I,
        factory: F,
    ) -> Arc<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
        I: PartialEq + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> S,
    {
        let stream = into_source(factory());
        let entry = CacheEntry::create(
            key.clone(),
            stream,
            self.shared.config.clone(),
            Arc::downgrade(&self.shared),
        );

        tracing::info!(
            key = %key,
            entry = %entry.id(),
            value_type = type_name::<T>(),
            "Entry created"
        );

        entries
            .entry(key)
            .or_default()
            .push(Slot::new(&entry, identity));

        entry
    }

    /// Get the live entry for `key`, if any
    ///
    /// Never creates. Returns `None` if the key is bound to another value type.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<Arc<CacheEntry<T>>> {
        self.get_strict(key).ok()
    }

    /// Get the live entry for `key`, failing if there is none
    pub fn get_strict<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Result<Arc<CacheEntry<T>>> {
        let entries = self.shared.entries.lock();

        Self::find::<T, ()>(&entries, key, &())
            .unwrap_or_else(|| Err(CacheError::NotFound(key.to_string())))
    }

    /// Drop the mapping for `key` only if it still points at entry `id`
    ///
    /// Entries call this themselves when their grace period runs out; a stale
    /// call from a superseded entry leaves a newer entry for the same key alone.
    /// A live entry is never removed: it still owns its subscription.
    pub fn remove_if_current(&self, key: &str, id: EntryId) -> bool {
        self.shared.remove_if_current(key, id)
    }

    /// Number of live entries (across all identities)
    pub fn len(&self) -> usize {
        self.shared
            .entries
            .lock()
            .values()
            .flatten()
            .filter(|slot| !slot.erased.is_torn_down())
            .count()
    }

    /// Whether the registry holds no live entries
    pub fn is_empty(&self) -> bool {
        self.shared
            .entries
            .lock()
            .values()
            .flatten()
            .all(|slot| slot.erased.is_torn_down())
    }

    /// Whether a live entry exists for `key`
    pub fn contains_key(&self, key: &str) -> bool {
        self.shared
            .entries
            .lock()
            .get(key)
            .is_some_and(|bucket| bucket.iter().any(|slot| !slot.erased.is_torn_down()))
    }

    /// Keys with at least one entry
    pub fn keys(&self) -> Vec<String> {
        self.shared.entries.lock().keys().cloned().collect()
    }

    /// Statistics for every entry under `key`
    pub fn stats(&self, key: &str) -> Vec<EntryStats> {
        self.shared
            .entries
            .lock()
            .get(key)
            .map(|bucket| bucket.iter().map(|slot| slot.erased.stats()).collect())
            .unwrap_or_default()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
