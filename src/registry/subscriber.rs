//! Consumer-side handle to a cache entry
//!
//! A `Subscriber` is what `attach()` hands out. It receives the entry's
//! emissions in order and detaches itself when dropped. Updates are buffered in
//! the entry's bounded broadcast channel; a subscriber that never receives
//! (one that only calls `read()`) holds no backlog of its own.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::cell::ReadError;
use crate::error::SourceError;

use super::entry::CacheEntry;

/// Identifier of one attachment to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(super) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event delivered to subscribers
#[derive(Debug, Clone)]
pub enum Update<T> {
    /// The source emitted a value
    Value(T),
    /// The source failed; nothing follows
    Error(SourceError),
    /// The source completed; nothing follows
    Completed,
    /// This many updates were skipped because the subscriber fell behind
    Lagged(u64),
}

impl<T> Update<T> {
    /// Whether no further updates follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(self, Update::Error(_) | Update::Completed)
    }
}

type Recv<T> = BoxFuture<'static, (Result<Update<T>, RecvError>, broadcast::Receiver<Update<T>>)>;

fn recv_next<T: Clone + Send + Sync + 'static>(mut rx: broadcast::Receiver<Update<T>>) -> Recv<T> {
    async move {
        let result = rx.recv().await;
        (result, rx)
    }
    .boxed()
}

/// Attachment to a [`CacheEntry`]
///
/// Holds the entry alive and keeps its subscriber count above zero until
/// [`detach`](Subscriber::detach) is called or the handle is dropped.
pub struct Subscriber<T: Clone + Send + Sync + 'static> {
    entry: Arc<CacheEntry<T>>,
    id: SubscriberId,
    /// State the subscriber attached into, delivered before live updates
    catchup: VecDeque<Update<T>>,
    /// `None` once detached or the entry's channel is closed
    recv: Option<Recv<T>>,
    attached: bool,
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> {
    pub(super) fn new(
        entry: Arc<CacheEntry<T>>,
        id: SubscriberId,
        rx: broadcast::Receiver<Update<T>>,
        catchup: VecDeque<Update<T>>,
    ) -> Self {
        Self {
            entry,
            id,
            catchup,
            recv: Some(recv_next(rx)),
            attached: true,
        }
    }

    /// Attachment ID
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The entry this subscriber is attached to
    pub fn entry(&self) -> &Arc<CacheEntry<T>> {
        &self.entry
    }

    /// Key of the entry
    pub fn key(&self) -> &str {
        self.entry.key()
    }

    /// Whether `detach` has not been called yet
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Non-blocking read of the entry's current state
    pub fn read(&self) -> Result<T, ReadError> {
        self.entry.read()
    }

    /// Latest value, if any
    pub fn current_value(&self) -> Option<T> {
        self.entry.current_value()
    }

    /// Receive the next update
    ///
    /// Returns `None` once the subscriber is detached, or once the entry is
    /// torn down and every buffered update has been received.
    pub async fn recv(&mut self) -> Option<Update<T>> {
        self.next().await
    }

    /// Receive a buffered update without waiting
    pub fn try_recv(&mut self) -> Option<Update<T>> {
        self.next().now_or_never().flatten()
    }

    /// Release this attachment
    ///
    /// Calling it more than once is a no-op. Returns true if this call detached.
    pub fn detach(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        self.attached = false;
        self.catchup.clear();
        self.recv = None;
        self.entry.detach(self.id)
    }
}

// No field is structurally pinned: the in-flight receive is already boxed.
impl<T: Clone + Send + Sync + 'static> Unpin for Subscriber<T> {}

impl<T: Clone + Send + Sync + 'static> Stream for Subscriber<T> {
    type Item = Update<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(update) = self.catchup.pop_front() {
            return Poll::Ready(Some(update));
        }
        let Some(recv) = self.recv.as_mut() else {
            return Poll::Ready(None);
        };

        let (result, rx) = ready!(recv.poll_unpin(cx));
        let update = match result {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(key = %self.entry.key(), subscriber = %self.id, skipped, "Subscriber lagged");
                Update::Lagged(skipped)
            }
            Err(RecvError::Closed) => {
                self.recv = None;
                return Poll::Ready(None);
            }
        };

        self.recv = Some(recv_next(rx));
        Poll::Ready(Some(update))
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("key", &self.entry.key())
            .field("id", &self.id)
            .field("attached", &self.attached)
            .finish()
    }
}
