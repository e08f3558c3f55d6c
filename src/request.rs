//! One-shot request deduplication
//!
//! The single-value counterpart of the subscription registry: a future is
//! started once per key and its outcome is kept in a [`ReadCell`] that any
//! number of callers can read. Requests stay until explicitly removed.
//!
//! An [`ActiveRequest`] settles once and can be chained: [`map`](ActiveRequest::map),
//! [`and_then`](ActiveRequest::and_then), [`or_else`](ActiveRequest::or_else) and
//! [`finally`](ActiveRequest::finally) each return a new request that settles
//! after the one it was derived from.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cell::{ReadCell, ReadError, WaitError};
use crate::error::{BoxError, CacheError, Result, SourceError};
use crate::registry::entry::ensure_runtime;

/// A request whose outcome may not be known yet
pub struct ActiveRequest<T: Clone + Send + Sync + 'static> {
    key: Arc<str>,
    cell: Mutex<ReadCell<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> ActiveRequest<T> {
    fn pending(key: Arc<str>) -> Arc<Self> {
        Arc::new(Self {
            cell: Mutex::new(ReadCell::new(Arc::clone(&key))),
            key,
            task: Mutex::new(None),
        })
    }

    fn start<Fut, E>(key: &str, future: Fut) -> Arc<Self>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::spawn(key.into(), async move { future.await.map_err(SourceError::new) })
    }

    fn spawn<Fut>(key: Arc<str>, future: Fut) -> Arc<Self>
    where
        Fut: Future<Output = std::result::Result<T, SourceError>> + Send + 'static,
    {
        let request = Self::pending(key);

        let weak = Arc::downgrade(&request);
        let handle = tokio::spawn(async move {
            let outcome = future.await;
            if let Some(request) = weak.upgrade() {
                request.settle(outcome);
            }
        });
        *request.task.lock() = Some(handle);

        request
    }

    /// A request that already succeeded with `value`
    ///
    /// Needs no runtime.
    pub fn ready(key: impl Into<String>, value: T) -> Arc<Self> {
        let key: String = key.into();
        let request = Self::pending(key.into());
        request.settle(Ok(value));
        request
    }

    /// A request that already failed with `err`
    pub fn failed(key: impl Into<String>, err: impl Into<BoxError>) -> Arc<Self> {
        let key: String = key.into();
        let request = Self::pending(key.into());
        request.settle(Err(SourceError::new(err)));
        request
    }

    fn settle(&self, outcome: std::result::Result<T, SourceError>) {
        let mut cell = self.cell.lock();
        match outcome {
            Ok(value) => {
                cell.set_value(value);
                tracing::debug!(key = %self.key, "Request completed");
            }
            Err(err) => {
                tracing::debug!(key = %self.key, error = %err, "Request failed");
                cell.set_error(err);
            }
        }
    }

    /// Request key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the request has finished, successfully or not
    pub fn is_complete(&self) -> bool {
        self.cell.lock().is_settled()
    }

    /// Non-blocking read of the outcome
    pub fn read(&self) -> std::result::Result<T, ReadError> {
        self.cell.lock().read()
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> std::result::Result<T, WaitError> {
        let first = self.cell.lock().first_settlement();
        first.wait().await
    }

    async fn outcome(&self) -> std::result::Result<T, SourceError> {
        self.wait().await.map_err(|err| match err {
            WaitError::Source(err) => err,
            WaitError::Closed(err) => SourceError::new(err),
        })
    }

    /// Transform the value once this request succeeds
    ///
    /// Errors pass through unchanged. Like every chaining method, this must be
    /// called from within a Tokio runtime.
    pub fn map<U, F>(self: &Arc<Self>, f: F) -> Arc<ActiveRequest<U>>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let parent = Arc::clone(self);
        ActiveRequest::spawn(Arc::clone(&self.key), async move {
            parent.outcome().await.map(f)
        })
    }

    /// Continue with another fallible future once this request succeeds
    pub fn and_then<U, Fut, E, F>(self: &Arc<Self>, f: F) -> Arc<ActiveRequest<U>>
    where
        U: Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<U, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce(T) -> Fut + Send + 'static,
    {
        let parent = Arc::clone(self);
        ActiveRequest::spawn(Arc::clone(&self.key), async move {
            match parent.outcome().await {
                Ok(value) => f(value).await.map_err(SourceError::new),
                Err(err) => Err(err),
            }
        })
    }

    /// Recover from a failure
    ///
    /// `f` receives the original error and may succeed or fail with a new one.
    pub fn or_else<Fut, E, F>(self: &Arc<Self>, f: F) -> Arc<Self>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce(SourceError) -> Fut + Send + 'static,
    {
        let parent = Arc::clone(self);
        Self::spawn(Arc::clone(&self.key), async move {
            match parent.outcome().await {
                Ok(value) => Ok(value),
                Err(err) => f(err).await.map_err(SourceError::new),
            }
        })
    }

    /// Run `f` once this request settles either way, keeping its outcome
    pub fn finally<F>(self: &Arc<Self>, f: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let parent = Arc::clone(self);
        Self::spawn(Arc::clone(&self.key), async move {
            let outcome = parent.outcome().await;
            f();
            outcome
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for ActiveRequest<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for ActiveRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRequest")
            .field("key", &self.key)
            .field("state", self.cell.lock().state())
            .finish()
    }
}

struct StoredRequest {
    value_type: &'static str,
    request: Arc<dyn Any + Send + Sync>,
}

impl StoredRequest {
    fn typed<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Result<Arc<ActiveRequest<T>>> {
        Arc::clone(&self.request)
            .downcast::<ActiveRequest<T>>()
            .map_err(|_| CacheError::KeyMisuse {
                key: key.to_string(),
                expected: type_name::<T>(),
                found: self.value_type,
            })
    }
}

/// Cache of in-flight and finished one-shot requests
///
/// Request futures run as spawned tasks; starting one outside a Tokio runtime
/// fails with [`CacheError::NoRuntime`].
#[derive(Default)]
pub struct RequestCache {
    requests: Mutex<HashMap<String, StoredRequest>>,
}

impl RequestCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request under `key`
    ///
    /// Fails with [`CacheError::RequestExists`] if the key is already in use.
    pub fn create_request<T, Fut, E>(
        &self,
        key: impl Into<String>,
        future: Fut,
    ) -> Result<Arc<ActiveRequest<T>>>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let key = key.into();
        let mut requests = self.requests.lock();

        if requests.contains_key(&key) {
            return Err(CacheError::RequestExists(key));
        }
        ensure_runtime(&key)?;

        Ok(Self::insert(&mut requests, key, future))
    }

    /// Return the request under `key`, starting it from `factory` if there is none
    pub fn create_deduped_request<T, Fut, E, F>(
        &self,
        key: impl Into<String>,
        factory: F,
    ) -> Result<Arc<ActiveRequest<T>>>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> Fut,
    {
        let key = key.into();
        let mut requests = self.requests.lock();

        if let Some(stored) = requests.get(&key) {
            return stored.typed(&key);
        }
        ensure_runtime(&key)?;

        Ok(Self::insert(&mut requests, key, factory()))
    }

    fn insert<T, Fut, E>(
        requests: &mut HashMap<String, StoredRequest>,
        key: String,
        future: Fut,
    ) -> Arc<ActiveRequest<T>>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let request = ActiveRequest::start(&key, future);
        tracing::debug!(key = %key, "Request started");

        requests.insert(
            key,
            StoredRequest {
                value_type: type_name::<T>(),
                request: Arc::clone(&request) as Arc<dyn Any + Send + Sync>,
            },
        );
        request
    }

    /// Look up the request under `key`
    pub fn get_request<T: Clone + Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> Result<Arc<ActiveRequest<T>>> {
        self.requests
            .lock()
            .get(key)
            .ok_or_else(|| CacheError::RequestNotFound(key.to_string()))?
            .typed(key)
    }

    /// Forget the request under `key`
    ///
    /// Callers still holding the request can keep reading it.
    pub fn remove_request(&self, key: &str) -> bool {
        self.requests.lock().remove(key).is_some()
    }

    /// Number of tracked requests
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Whether no requests are tracked
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::testing::settle;

    #[tokio::test]
    async fn test_read_before_and_after_completion() {
        let cache = RequestCache::new();
        let (tx, rx) = oneshot::channel::<u32>();

        let request = cache.create_request("r", rx).unwrap();
        assert!(!request.is_complete());
        assert!(request.read().unwrap_err().is_not_ready());

        tx.send(42).unwrap();
        assert_eq!(request.wait().await.unwrap(), 42);
        assert!(request.is_complete());
        assert_eq!(request.read().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_failed_request() {
        let cache = RequestCache::new();

        let request = cache
            .create_request("denied", async { Err::<u32, _>("permission denied") })
            .unwrap();
        settle().await;

        assert!(request.is_complete());
        let err = request.read().unwrap_err();
        assert_eq!(err.source_error().unwrap().to_string(), "permission denied");
        assert!(matches!(request.wait().await, Err(WaitError::Source(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let cache = RequestCache::new();

        cache.create_request("r", async { Ok::<_, BoxError>(1u32) }).unwrap();
        let err = cache
            .create_request("r", async { Ok::<_, BoxError>(2u32) })
            .unwrap_err();

        assert_eq!(err, CacheError::RequestExists("r".into()));
    }

    #[tokio::test]
    async fn test_deduped_request_runs_once() {
        let cache = RequestCache::new();
        let calls = AtomicUsize::new(0);
        let factory = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BoxError>("user".to_string()) }
        };

        let a = cache.create_deduped_request("user:1", factory).unwrap();
        let b = cache.create_deduped_request("user:1", factory).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.wait().await.unwrap(), "user");
    }

    #[tokio::test]
    async fn test_get_and_remove() {
        let cache = RequestCache::new();

        assert_eq!(
            cache.get_request::<u32>("r").unwrap_err(),
            CacheError::RequestNotFound("r".into())
        );

        let created = cache.create_request("r", async { Ok::<_, BoxError>(1u32) }).unwrap();
        let fetched = cache.get_request::<u32>("r").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert!(matches!(
            cache.get_request::<String>("r"),
            Err(CacheError::KeyMisuse { .. })
        ));

        assert!(cache.remove_request("r"));
        assert!(!cache.remove_request("r"));
        assert!(cache.is_empty());

        // Removed requests stay readable to their holders
        assert_eq!(created.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));

        let request = ActiveRequest::ready("n", 8u32)
            .map(move |v| {
                a.lock().push("map");
                v + 1
            })
            .and_then(move |v| async move {
                b.lock().push("and_then");
                Ok::<_, BoxError>(v * 2)
            })
            .finally(move || c.lock().push("finally"));

        assert_eq!(request.wait().await.unwrap(), 18);
        assert_eq!(*log.lock(), vec!["map", "and_then", "finally"]);
        assert_eq!(request.key(), "n");
    }

    #[tokio::test]
    async fn test_or_else_recovers_from_error() {
        let request = ActiveRequest::<u32>::failed("n", "boom")
            .map(|_| -> u32 { panic!("map must not run on a failed request") })
            .or_else(|err| async move {
                assert_eq!(err.to_string(), "boom");
                Ok::<_, BoxError>(0)
            });

        assert_eq!(request.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_passes_through_chain_unmodified() {
        let failed = ActiveRequest::<u32>::failed("n", "boom");
        let original = failed.read().unwrap_err().source_error().cloned().unwrap();

        let mapped = failed.map(|v| v + 1).finally(|| {});
        assert!(matches!(mapped.wait().await, Err(WaitError::Source(_))));
        assert!(mapped.read().unwrap_err().source_error().unwrap().ptr_eq(&original));

        let rethrown = failed.or_else(|err| async move { Err::<u32, _>(format!("{} twice", err)) });
        match rethrown.wait().await {
            Err(WaitError::Source(err)) => assert_eq!(err.to_string(), "boom twice"),
            other => panic!("expected a new error, got {:?}", other),
        }
    }

    #[test]
    fn test_settled_requests_need_no_runtime() {
        let ready = ActiveRequest::ready("r", "done".to_string());
        assert!(ready.is_complete());
        assert_eq!(ready.read().unwrap(), "done");

        let failed = ActiveRequest::<u32>::failed("f", "nope");
        assert!(failed.is_complete());
        assert_eq!(failed.read().unwrap_err().source_error().unwrap().to_string(), "nope");
    }

    #[test]
    fn test_create_outside_runtime_fails() {
        let cache = RequestCache::new();

        let err = cache
            .create_request("r", async { Ok::<_, BoxError>(1u32) })
            .unwrap_err();

        assert_eq!(err, CacheError::NoRuntime("r".into()));
        assert!(cache.is_empty());
    }
}
