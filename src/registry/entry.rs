//! Cache entry: one source subscription shared by many subscribers
//!
//! An entry owns exactly one subscription to its source stream. A pump task
//! drives the stream, writes every emission into the entry's [`ReadCell`] and
//! fans it out over a bounded broadcast channel, which keeps per-subscriber
//! delivery in emission order.
//!
//! When the last subscriber detaches the entry arms a grace-period timer.
//! Attaching again before it fires cancels it; otherwise the entry closes its
//! subscription and asks its registry to drop it.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{Stream, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cell::{CellState, ReadCell, ReadError, WaitError, WaitHandle};
use crate::error::{BoxError, CacheError, EmptyStream, Result, SourceError};

use super::config::{RegistryConfig, SubscribePolicy};
use super::store::Shared;
use super::subscriber::{Subscriber, SubscriberId, Update};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Boxed source stream with errors already wrapped
pub(crate) type SourceStream<T> =
    Pin<Box<dyn Stream<Item = std::result::Result<T, SourceError>> + Send + 'static>>;

/// Box a producer stream
pub(crate) fn into_source<T, S, E>(stream: S) -> SourceStream<T>
where
    T: 'static,
    S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
{
    stream.map(|item| item.map_err(SourceError::new)).boxed()
}

/// Unique identity of an entry instance
///
/// Two entries created for the same key in different epochs never share an ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        Self(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// At least one subscriber is attached
    Active,
    /// No subscribers, teardown timer running
    GracePeriod,
    /// Subscription closed, entry no longer served by its registry
    TornDown,
}

/// How the source ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source signalled completion
    Completed,
    /// The source emitted an error (or completed without emitting)
    Failed,
}

/// Statistics for an entry
#[derive(Debug, Clone)]
pub struct EntryStats {
    /// Entry key
    pub key: String,
    /// Entry instance ID
    pub id: EntryId,
    /// Current lifecycle state
    pub state: EntryState,
    /// Number of attached subscribers
    pub subscriber_count: usize,
    /// Emissions received from the source
    pub emissions: u64,
    /// Whether the source has been subscribed
    pub subscribed: bool,
    /// How the source ended, if it has
    pub termination: Option<Termination>,
    /// Whether the read cell currently holds a value
    pub has_value: bool,
}

enum Source<T> {
    /// Not subscribed yet (lazy policy, or no runtime at creation)
    Idle(SourceStream<T>),
    /// Pump task is driving the stream
    Running(JoinHandle<()>),
    /// Stream ended on its own
    Finished,
    /// Subscription closed by teardown
    Closed,
}

impl<T> Source<T> {
    fn is_subscribed(&self) -> bool {
        !matches!(self, Source::Idle(_))
    }
}

struct EntryInner<T> {
    cell: ReadCell<T>,
    source: Source<T>,
    subscribers: HashSet<SubscriberId>,
    /// Replaced on teardown, which closes every receiver
    updates: broadcast::Sender<Update<T>>,
    next_subscriber_id: u64,
    teardown: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is cancelled or re-armed; stale timers compare unequal
    timer_generation: u64,
    termination: Option<Termination>,
    emissions: u64,
    torn_down: bool,
}

impl<T: Clone> EntryInner<T> {
    fn broadcast(&self, update: Update<T>) {
        // Fails only when nobody is subscribed
        let _ = self.updates.send(update);
    }

    fn cancel_teardown(&mut self) -> bool {
        self.timer_generation += 1;
        match self.teardown.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Updates a late subscriber needs to catch up with the current state
    fn catchup(&self) -> VecDeque<Update<T>> {
        let mut updates = VecDeque::with_capacity(2);

        match self.cell.state() {
            CellState::Fulfilled(value) => updates.push_back(Update::Value(value.clone())),
            CellState::Rejected(err) => updates.push_back(Update::Error(err.clone())),
            CellState::Pending => {}
        }
        if self.termination == Some(Termination::Completed) {
            updates.push_back(Update::Completed);
        }

        updates
    }
}

/// Entry for a single key
pub struct CacheEntry<T: Clone + Send + Sync + 'static> {
    key: Arc<str>,
    id: EntryId,
    config: RegistryConfig,
    /// Non-owning back-reference; dangling for standalone entries
    registry: Weak<Shared>,
    inner: Mutex<EntryInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> CacheEntry<T> {
    /// Create a standalone entry that is not tracked by any registry
    ///
    /// Fails with [`CacheError::NoRuntime`] outside a Tokio runtime, which
    /// drives the source and the grace-period timer.
    pub fn new<S, E>(key: impl Into<String>, stream: S, config: RegistryConfig) -> Result<Arc<Self>>
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let key = key.into();
        ensure_runtime(&key)?;

        let entry = Self::create(key, into_source(stream), config, Weak::new());
        entry.activate();
        Ok(entry)
    }

    pub(super) fn create(
        key: String,
        stream: SourceStream<T>,
        config: RegistryConfig,
        registry: Weak<Shared>,
    ) -> Arc<Self> {
        let key: Arc<str> = key.into();
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));

        Arc::new(Self {
            id: EntryId::next(),
            inner: Mutex::new(EntryInner {
                cell: ReadCell::new(Arc::clone(&key)),
                source: Source::Idle(stream),
                subscribers: HashSet::new(),
                updates,
                next_subscriber_id: 1,
                teardown: None,
                timer_generation: 0,
                termination: None,
                emissions: 0,
                torn_down: false,
            }),
            key,
            config,
            registry,
        })
    }

    /// Subscribe eagerly if configured, and start the grace period while nobody is attached
    pub(super) fn activate(self: &Arc<Self>) {
        let mut inner = self.inner.lock();

        if self.config.subscribe_policy == SubscribePolicy::Eager {
            self.start_source(&mut inner);
        }
        if inner.subscribers.is_empty() && inner.teardown.is_none() && !inner.torn_down {
            if let Some(inner) = self.arm_teardown(inner) {
                self.teardown(inner);
            }
        }
    }

    /// Entry key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Entry instance ID
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Configuration copied from the creating registry
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Whether the source has errored or completed
    pub fn is_terminal(&self) -> bool {
        self.inner.lock().termination.is_some()
    }

    /// Whether the entry has been torn down
    pub fn is_torn_down(&self) -> bool {
        self.inner.lock().torn_down
    }

    /// Whether the source stream has been subscribed
    pub fn is_subscribed(&self) -> bool {
        self.inner.lock().source.is_subscribed()
    }

    /// Current lifecycle state
    pub fn state(&self) -> EntryState {
        Self::state_of(&self.inner.lock())
    }

    fn state_of(inner: &EntryInner<T>) -> EntryState {
        if inner.torn_down {
            EntryState::TornDown
        } else if inner.subscribers.is_empty() {
            EntryState::GracePeriod
        } else {
            EntryState::Active
        }
    }

    /// Snapshot of the entry's statistics
    pub fn stats(&self) -> EntryStats {
        let inner = self.inner.lock();

        EntryStats {
            key: self.key.to_string(),
            id: self.id,
            state: Self::state_of(&inner),
            subscriber_count: inner.subscribers.len(),
            emissions: inner.emissions,
            subscribed: inner.source.is_subscribed(),
            termination: inner.termination,
            has_value: matches!(inner.cell.state(), CellState::Fulfilled(_)),
        }
    }

    /// Non-blocking read of the latest emission
    ///
    /// Fails with [`ReadError::NotReady`] until the source has emitted.
    pub fn read(&self) -> std::result::Result<T, ReadError> {
        self.inner.lock().cell.read()
    }

    /// Latest value, never blocks
    pub fn current_value(&self) -> Option<T> {
        self.inner.lock().cell.peek()
    }

    /// Handle resolving on the next emission
    pub fn wait_handle(&self) -> WaitHandle {
        self.inner.lock().cell.wait_handle()
    }

    /// Wait for the first emission
    ///
    /// Resolves immediately if the source has already emitted.
    pub async fn wait_first(&self) -> std::result::Result<T, WaitError> {
        let first = self.inner.lock().cell.first_settlement();
        first.wait().await
    }

    /// Attach a subscriber
    ///
    /// Cancels a pending teardown before returning, and subscribes to the source
    /// if it has not been subscribed yet. The new subscriber first receives the
    /// current state, then every later emission.
    pub fn attach(self: &Arc<Self>) -> Result<Subscriber<T>> {
        let mut inner = self.inner.lock();

        if inner.torn_down {
            return Err(CacheError::Evicted(self.key.to_string()));
        }

        let cancelled = inner.cancel_teardown();

        let id = SubscriberId(inner.next_subscriber_id);
        inner.next_subscriber_id += 1;

        let rx = inner.updates.subscribe();
        let catchup = inner.catchup();
        inner.subscribers.insert(id);

        self.start_source(&mut inner);

        tracing::debug!(
            key = %self.key,
            subscriber = %id,
            subscribers = inner.subscribers.len(),
            teardown_cancelled = cancelled,
            "Subscriber attached"
        );

        drop(inner);
        Ok(Subscriber::new(Arc::clone(self), id, rx, catchup))
    }

    /// Detach a subscriber
    ///
    /// Detaching an unknown or already-detached ID is a no-op and returns false;
    /// the subscriber count never goes below zero. If the last subscriber leaves
    /// outside a Tokio runtime no timer can run, and the entry is torn down at once.
    pub fn detach(self: &Arc<Self>, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();

        if !inner.subscribers.remove(&id) {
            tracing::warn!(key = %self.key, subscriber = %id, "Detach of unknown subscriber ignored");
            return false;
        }

        tracing::debug!(
            key = %self.key,
            subscriber = %id,
            subscribers = inner.subscribers.len(),
            "Subscriber detached"
        );

        if inner.subscribers.is_empty() && !inner.torn_down {
            if let Some(inner) = self.arm_teardown(inner) {
                self.teardown(inner);
            }
        }

        true
    }

    /// Subscribe to the source if still idle
    fn start_source(self: &Arc<Self>, inner: &mut EntryInner<T>) {
        if !matches!(inner.source, Source::Idle(_)) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(key = %self.key, "No runtime available, source subscription deferred");
                return;
            }
        };

        let stream = match mem::replace(&mut inner.source, Source::Finished) {
            Source::Idle(stream) => stream,
            other => {
                inner.source = other;
                return;
            }
        };

        let handle = runtime.spawn(pump(Arc::downgrade(self), stream));
        inner.source = Source::Running(handle);

        tracing::debug!(key = %self.key, entry = %self.id, "Source subscribed");
    }

    /// Arm the teardown timer
    ///
    /// The deadline is fixed here, not when the timer task first runs. Hands
    /// the guard back if no runtime is available to run the timer, in which
    /// case the caller tears down immediately.
    fn arm_teardown<'a>(
        self: &Arc<Self>,
        mut inner: MutexGuard<'a, EntryInner<T>>,
    ) -> Option<MutexGuard<'a, EntryInner<T>>> {
        inner.cancel_teardown();

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(key = %self.key, "No runtime for grace period, tearing down now");
                return Some(inner);
            }
        };

        let generation = inner.timer_generation;
        let grace_period = self.config.grace_period;
        let deadline = tokio::time::Instant::now() + grace_period;
        let entry = Arc::downgrade(self);

        inner.teardown = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(entry) = entry.upgrade() {
                entry.on_grace_elapsed(generation);
            }
        }));

        tracing::debug!(
            key = %self.key,
            grace_period_ms = grace_period.as_millis() as u64,
            "Teardown timer armed"
        );

        None
    }

    fn on_grace_elapsed(&self, generation: u64) {
        let mut inner = self.inner.lock();

        if inner.torn_down
            || inner.timer_generation != generation
            || !inner.subscribers.is_empty()
        {
            return;
        }

        // The timer task is the one running this; nothing to abort
        inner.teardown = None;
        self.teardown(inner);
    }

    /// Close the subscription and ask the registry to drop this entry
    fn teardown(&self, mut inner: MutexGuard<'_, EntryInner<T>>) {
        inner.torn_down = true;
        inner.cancel_teardown();

        if let Source::Running(handle) = mem::replace(&mut inner.source, Source::Closed) {
            handle.abort();
        }
        inner.cell.close();
        inner.subscribers.clear();
        inner.updates = broadcast::channel(1).0;
        drop(inner);

        tracing::info!(key = %self.key, entry = %self.id, "Entry torn down");

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_current(&self.key, self.id);
        }
    }

    fn on_value(&self, value: T) {
        let mut inner = self.inner.lock();
        if inner.torn_down {
            return;
        }

        inner.emissions += 1;
        let first = inner.cell.set_value(value.clone());
        inner.broadcast(Update::Value(value));

        tracing::trace!(
            key = %self.key,
            emissions = inner.emissions,
            first = first,
            subscribers = inner.subscribers.len(),
            "Value emitted"
        );
    }

    fn on_error(&self, err: SourceError) {
        let mut inner = self.inner.lock();
        if inner.torn_down {
            return;
        }

        inner.emissions += 1;
        inner.cell.set_error(err.clone());
        inner.termination = Some(Termination::Failed);
        inner.source = Source::Finished;
        inner.broadcast(Update::Error(err.clone()));

        tracing::info!(key = %self.key, error = %err, "Source failed");
    }

    fn on_complete(&self) {
        let mut inner = self.inner.lock();
        if inner.torn_down {
            return;
        }

        inner.source = Source::Finished;

        if inner.cell.is_settled() {
            inner.termination = Some(Termination::Completed);
            inner.broadcast(Update::Completed);
            tracing::info!(key = %self.key, emissions = inner.emissions, "Source completed");
        } else {
            let err = SourceError::new(EmptyStream);
            inner.cell.set_error(err.clone());
            inner.termination = Some(Termination::Failed);
            inner.broadcast(Update::Error(err));
            tracing::info!(key = %self.key, "Source completed without emitting");
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for CacheEntry<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(handle) = inner.teardown.take() {
            handle.abort();
        }
        if let Source::Running(handle) = mem::replace(&mut inner.source, Source::Closed) {
            handle.abort();
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("state", &Self::state_of(&inner))
            .field("cell", inner.cell.state())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

pub(crate) fn ensure_runtime(key: &str) -> Result<()> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| CacheError::NoRuntime(key.to_string()))
}

/// Drive a source stream into its entry
///
/// Holds only a weak reference so a dropped entry stops the pump on the next
/// emission; teardown aborts it directly.
fn pump<T: Clone + Send + Sync + 'static>(
    entry: Weak<CacheEntry<T>>,
    mut stream: SourceStream<T>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        while let Some(item) = stream.next().await {
            let Some(entry) = entry.upgrade() else {
                return;
            };
            match item {
                Ok(value) => entry.on_value(value),
                Err(err) => {
                    entry.on_error(err);
                    return;
                }
            }
        }

        if let Some(entry) = entry.upgrade() {
            entry.on_complete();
        }
    }
}
