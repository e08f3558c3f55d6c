//! Read cell: synchronous holder for the latest value of a live source
//!
//! A cell starts `Pending` and is replaced on every emission with a new
//! `Fulfilled` or `Rejected` state. Reading never blocks; a pending cell hands
//! back a [`WaitHandle`] the caller can await before trying again.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{CacheError, SourceError};

/// Current state of a read cell
#[derive(Debug, Clone)]
pub enum CellState<T> {
    /// Nothing emitted yet
    Pending,
    /// Latest emission was a value
    Fulfilled(T),
    /// Latest emission was an error
    Rejected(SourceError),
}

impl<T> CellState<T> {
    /// Whether the cell has settled at least once
    pub fn is_settled(&self) -> bool {
        !matches!(self, CellState::Pending)
    }
}

/// Why a read did not produce a value
#[derive(Debug)]
pub enum ReadError {
    /// Not an error: no emission yet. Await the handle, then read again.
    NotReady(WaitHandle),
    /// The source failed with this error
    Source(SourceError),
}

impl ReadError {
    /// Whether this is the not-ready signal rather than a failure
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ReadError::NotReady(_))
    }

    /// The source error, if this is one
    pub fn source_error(&self) -> Option<&SourceError> {
        match self {
            ReadError::Source(err) => Some(err),
            ReadError::NotReady(_) => None,
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NotReady(handle) => write!(f, "Value not ready: {}", handle.key),
            ReadError::Source(err) => write!(f, "Source error: {}", err),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Source(err) => Some(err),
            ReadError::NotReady(_) => None,
        }
    }
}

/// Why waiting for the first emission failed
#[derive(Debug, Clone)]
pub enum WaitError {
    /// The first emission was an error
    Source(SourceError),
    /// The cell was dropped before anything was emitted
    Closed(CacheError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Source(err) => write!(f, "Source error: {}", err),
            WaitError::Closed(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for WaitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WaitError::Source(err) => Some(err),
            WaitError::Closed(err) => Some(err),
        }
    }
}

/// Resolves when the cell it came from next settles
///
/// Holding a handle does not keep the cell alive.
pub struct WaitHandle {
    key: Arc<str>,
    rx: watch::Receiver<u64>,
}

impl WaitHandle {
    /// Wait until the cell settles again
    ///
    /// Fails with [`CacheError::Closed`] if the cell is dropped first.
    pub async fn settled(mut self) -> Result<(), CacheError> {
        self.rx
            .changed()
            .await
            .map_err(|_| CacheError::Closed(self.key.to_string()))
    }
}

impl fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandle")
            .field("key", &self.key)
            .field("seen", &*self.rx.borrow())
            .finish()
    }
}

/// Resolves with the first outcome a cell ever settled with
pub struct FirstSettlement<T> {
    key: Arc<str>,
    rx: watch::Receiver<Option<Result<T, SourceError>>>,
}

impl<T: Clone> FirstSettlement<T> {
    /// Wait for the first emission
    pub async fn wait(mut self) -> Result<T, WaitError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(first) => match first.as_ref() {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(err)) => Err(WaitError::Source(err.clone())),
                None => Err(WaitError::Closed(CacheError::Closed(self.key.to_string()))),
            },
            Err(_) => Err(WaitError::Closed(CacheError::Closed(self.key.to_string()))),
        }
    }
}

/// Settle-per-event value holder
pub struct ReadCell<T> {
    key: Arc<str>,
    state: CellState<T>,
    /// Bumped on every settlement; wait handles watch it
    version: watch::Sender<u64>,
    /// Written exactly once, on the first settlement
    first: watch::Sender<Option<Result<T, SourceError>>>,
    closed: bool,
}

impl<T: Clone> ReadCell<T> {
    /// Create a pending cell
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        let (version, _) = watch::channel(0);
        let (first, _) = watch::channel(None);

        Self {
            key: key.into(),
            state: CellState::Pending,
            version,
            first,
            closed: false,
        }
    }

    /// Key of the entry owning this cell
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state
    pub fn state(&self) -> &CellState<T> {
        &self.state
    }

    /// Whether the cell has settled at least once
    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    /// Number of settlements so far
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Non-blocking read
    pub fn read(&self) -> Result<T, ReadError> {
        match &self.state {
            CellState::Fulfilled(value) => Ok(value.clone()),
            CellState::Rejected(err) => Err(ReadError::Source(err.clone())),
            CellState::Pending => Err(ReadError::NotReady(self.wait_handle())),
        }
    }

    /// Latest value, if the latest emission was one
    pub fn peek(&self) -> Option<T> {
        match &self.state {
            CellState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether the owning entry has stopped feeding this cell
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle that resolves on the next settlement
    pub fn wait_handle(&self) -> WaitHandle {
        let rx = if self.closed {
            watch::channel(self.version()).1
        } else {
            self.version.subscribe()
        };

        WaitHandle {
            key: Arc::clone(&self.key),
            rx,
        }
    }

    /// Handle that resolves with the first settlement (immediately if it already happened)
    pub fn first_settlement(&self) -> FirstSettlement<T> {
        let rx = if self.closed {
            watch::channel(self.first.borrow().clone()).1
        } else {
            self.first.subscribe()
        };

        FirstSettlement {
            key: Arc::clone(&self.key),
            rx,
        }
    }

    /// Stop accepting settlements
    ///
    /// Outstanding and future waiters that could only be satisfied by a new
    /// settlement resolve with [`CacheError::Closed`]. The last state stays readable.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let version = self.version();
        let first = self.first.borrow().clone();
        self.version = watch::channel(version).0;
        self.first = watch::channel(first).0;
    }

    /// Replace the state with a value
    ///
    /// Returns true if this was the cell's first settlement.
    pub fn set_value(&mut self, value: T) -> bool {
        if self.closed {
            return false;
        }
        let first = self.record_first(|| Ok(value.clone()));
        self.state = CellState::Fulfilled(value);
        self.bump();
        first
    }

    /// Replace the state with an error
    ///
    /// Returns true if this was the cell's first settlement.
    pub fn set_error(&mut self, err: SourceError) -> bool {
        if self.closed {
            return false;
        }
        let first = self.record_first(|| Err(err.clone()));
        self.state = CellState::Rejected(err);
        self.bump();
        first
    }

    fn record_first(&self, outcome: impl FnOnce() -> Result<T, SourceError>) -> bool {
        if self.state.is_settled() {
            return false;
        }
        self.first.send_replace(Some(outcome()));
        true
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCell")
            .field("key", &self.key)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, assert_ready_err, assert_ready_ok, task};

    use super::*;

    #[test]
    fn test_pending_read_is_not_ready() {
        let cell: ReadCell<u32> = ReadCell::new("A");

        let err = cell.read().unwrap_err();
        assert!(err.is_not_ready());
        assert!(err.source_error().is_none());
        assert!(cell.peek().is_none());
        assert_eq!(cell.version(), 0);
    }

    #[test]
    fn test_value_replaces_previous() {
        let mut cell = ReadCell::new("A");

        assert!(cell.set_value(1));
        assert_eq!(cell.read().unwrap(), 1);

        assert!(!cell.set_value(2));
        assert_eq!(cell.read().unwrap(), 2);
        assert_eq!(cell.peek(), Some(2));
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn test_error_replaces_value() {
        let mut cell = ReadCell::new("B");
        cell.set_value(1);

        let boom = SourceError::new("boom");
        assert!(!cell.set_error(boom.clone()));

        match cell.read() {
            Err(ReadError::Source(err)) => assert!(err.ptr_eq(&boom)),
            other => panic!("expected source error, got {:?}", other),
        }
        // Only values are peekable
        assert!(cell.peek().is_none());
    }

    #[test]
    fn test_wait_handle_resolves_on_next_settlement() {
        let mut cell = ReadCell::new("A");
        let handle = match cell.read() {
            Err(ReadError::NotReady(handle)) => handle,
            other => panic!("expected not ready, got {:?}", other),
        };

        let mut wait = task::spawn(handle.settled());
        assert_pending!(wait.poll());

        cell.set_value(7u32);
        assert!(wait.is_woken());
        assert_ready_ok!(wait.poll());
    }

    #[test]
    fn test_wait_handle_closed_when_cell_dropped() {
        let cell: ReadCell<u32> = ReadCell::new("gone");
        let mut wait = task::spawn(cell.wait_handle().settled());
        assert_pending!(wait.poll());

        drop(cell);
        let err = assert_ready_err!(wait.poll());
        assert_eq!(err, CacheError::Closed("gone".into()));
    }

    #[test]
    fn test_first_settlement_keeps_first_value() {
        let mut cell = ReadCell::new("A");
        let mut first = task::spawn(cell.first_settlement().wait());
        assert_pending!(first.poll());

        cell.set_value(1u32);
        cell.set_value(2u32);

        assert_eq!(assert_ready_ok!(first.poll()), 1);

        // Late callers still see the first outcome, not the latest
        let mut late = task::spawn(cell.first_settlement().wait());
        assert_eq!(assert_ready_ok!(late.poll()), 1);
    }

    #[test]
    fn test_first_settlement_error() {
        let mut cell: ReadCell<u32> = ReadCell::new("B");
        let mut first = task::spawn(cell.first_settlement().wait());

        cell.set_error(SourceError::new("boom"));

        match assert_ready!(first.poll()) {
            Err(WaitError::Source(err)) => assert_eq!(err.to_string(), "boom"),
            other => panic!("expected source error, got {:?}", other),
        }
    }

    #[test]
    fn test_close_releases_waiters_and_keeps_state() {
        let mut cell = ReadCell::new("D");
        cell.set_value(5u32);

        let mut next = task::spawn(cell.wait_handle().settled());
        assert_pending!(next.poll());

        cell.close();
        assert!(cell.is_closed());
        assert_eq!(assert_ready_err!(next.poll()), CacheError::Closed("D".into()));

        // Settled state survives, and so does the first outcome
        assert_eq!(cell.read().unwrap(), 5);
        let mut first = task::spawn(cell.first_settlement().wait());
        assert_eq!(assert_ready_ok!(first.poll()), 5);

        // No further settlements are accepted
        assert!(!cell.set_value(6));
        assert_eq!(cell.read().unwrap(), 5);
    }

    #[test]
    fn test_close_pending_cell_fails_first_settlement() {
        let mut cell: ReadCell<u32> = ReadCell::new("E");
        let mut early = task::spawn(cell.first_settlement().wait());
        assert_pending!(early.poll());

        cell.close();
        assert!(matches!(assert_ready!(early.poll()), Err(WaitError::Closed(_))));

        let mut late = task::spawn(cell.first_settlement().wait());
        assert!(matches!(assert_ready!(late.poll()), Err(WaitError::Closed(_))));
    }

    #[test]
    fn test_first_settlement_closed() {
        let cell: ReadCell<u32> = ReadCell::new("C");
        let mut first = task::spawn(cell.first_settlement().wait());
        drop(cell);

        match assert_ready!(first.poll()) {
            Err(WaitError::Closed(CacheError::Closed(key))) => assert_eq!(key, "C"),
            other => panic!("expected closed, got {:?}", other),
        }
    }
}
