//! Controllable source streams for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{stream, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::BoxError;

/// Let spawned tasks run until they block
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Producer side of a test stream
///
/// The stream counts how often it is started (first polled) and records when
/// it is dropped, which is when its subscription is released.
pub(crate) struct TestSource<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<T, BoxError>>>>,
    subscribes: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl<T: Send + 'static> TestSource<T> {
    pub(crate) fn new() -> (Self, impl Stream<Item = Result<T, BoxError>> + Send + 'static) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribes = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));

        let state = (
            rx,
            ReleaseGuard(Arc::clone(&released)),
            Arc::clone(&subscribes),
            false,
        );
        let stream = stream::unfold(state, |(mut rx, guard, subscribes, started)| async move {
            if !started {
                subscribes.fetch_add(1, Ordering::SeqCst);
            }
            let item = rx.recv().await?;
            Some((item, (rx, guard, subscribes, true)))
        });

        let source = Self {
            tx: Mutex::new(Some(tx)),
            subscribes,
            released,
        };
        (source, stream)
    }

    pub(crate) fn emit(&self, value: T) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Ok(value));
        }
    }

    pub(crate) fn fail(&self, message: &str) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Err(message.into()));
        }
    }

    pub(crate) fn complete(&self) {
        self.tx.lock().take();
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
