use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::cache::{CacheValue, TtlCache};
use crate::error::{Error, FetchError, Result};

type Settled<V> = Option<Result<V>>;

// The outstanding fetch for a key. Joiners subscribe to `rx`; `abort` cancels the fetch task.
struct PendingRequest<V> {
    rx:    watch::Receiver<Settled<V>>,
    abort: AbortHandle,
}

struct DedupInner<V>
where
    V: CacheValue,
{
    cache:   TtlCache<V>,
    pending: Mutex<HashMap<String, PendingRequest<V>>>,
}

// Removes the pending record of a fetch when the fetch task finishes, is aborted or panics.
struct PendingGuard<V>
where
    V: CacheValue,
{
    inner: Weak<DedupInner<V>>,
    key:   String,
    rx:    watch::Receiver<Settled<V>>,
}

impl<V> Drop for PendingGuard<V>
where
    V: CacheValue,
{
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade()
        else {
            return;
        };
        let mut pending = inner.pending.lock();
        // Only remove our own record; a cancelled key may already have a new fetch going.
        if pending.get(&self.key).is_some_and(|p| p.rx.same_channel(&self.rx)) {
            pending.remove(&self.key);
        }
    }
}

enum Joined<V> {
    Ready(V),
    Waiting(watch::Receiver<Settled<V>>),
}

/// At most one in-flight fetch per key.
///
/// Concurrent callers asking for the same missing key share a single fetch and all receive its result. A successful
/// result is stored in the cache. The pending record is dropped as soon as the fetch settles, whatever the outcome.
///
/// Pending state belongs to the instance: two deduplicators never share in-flight fetches.
pub struct Deduplicator<V>
where
    V: CacheValue,
{
    inner: Arc<DedupInner<V>>,
}

impl<V> Clone for Deduplicator<V>
where
    V: CacheValue,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Deduplicator<V>
where
    V: CacheValue,
{
    pub fn new(cache: TtlCache<V>) -> Self {
        Self {
            inner: Arc::new(DedupInner {
                cache,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &TtlCache<V> {
        &self.inner.cache
    }

    /// Cached value for `key` or the result of `fetch`, cached with the default TTL.
    ///
    /// `fetch` is only invoked when neither a live cache entry nor a pending fetch exists for the key.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Error> + Send + 'static,
    {
        self.get_or_fetch_with_ttl(key, None, fetch).await
    }

    pub async fn get_or_fetch_with_ttl<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Error> + Send + 'static,
    {
        if let Some(value) = self.inner.cache.get(key) {
            return Ok(value);
        }

        match self.join_or_start(key, ttl, fetch)? {
            Joined::Ready(value) => Ok(value),
            Joined::Waiting(rx) => Self::wait(rx).await,
        }
    }

    // Check-then-insert under one lock and without suspending, so two callers can never both become leaders.
    fn join_or_start<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Result<Joined<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<Error> + Send + 'static,
    {
        let mut pending = self.inner.pending.lock();

        if let Some(request) = pending.get(key) {
            debug!("[{}] joining pending fetch of {key}", self.inner.cache.name());
            return Ok(Joined::Waiting(request.rx.clone()));
        }

        // A fetch may have settled between the cache lookup and taking the lock.
        if let Some(value) = self.inner.cache.peek(key) {
            return Ok(Joined::Ready(value));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::Closed("async runtime"))?;

        let (tx, rx) = watch::channel(None);
        let guard = PendingGuard {
            inner: Arc::downgrade(&self.inner),
            key:   key.to_string(),
            rx:    rx.clone(),
        };
        let cache = self.inner.cache.clone();
        let owned_key = key.to_string();
        let fut = fetch();

        debug!("[{}] FETCH({key})", self.inner.cache.name());
        let task = runtime.spawn(async move {
            let result = fut.await.map_err(Into::into);
            if let Ok(value) = &result {
                match ttl {
                    Some(ttl) => cache.set_with_ttl(owned_key, value.clone(), ttl),
                    None => cache.set(owned_key, value.clone()),
                }
            }
            drop(guard);
            let _ = tx.send(Some(result));
        });

        pending.insert(
            key.to_string(),
            PendingRequest {
                rx:    rx.clone(),
                abort: task.abort_handle(),
            },
        );

        Ok(Joined::Waiting(rx))
    }

    async fn wait(mut rx: watch::Receiver<Settled<V>>) -> Result<V> {
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            // The fetch task went away without a result.
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(FetchError::Aborted.into()))
    }

    /// Number of fetches currently in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.lock().contains_key(key)
    }

    /// Abort the in-flight fetch for `key`. Every caller waiting on it receives [`FetchError::Aborted`].
    pub fn cancel(&self, key: &str) -> bool {
        let request = self.inner.pending.lock().remove(key);
        match request {
            Some(request) => {
                debug!("[{}] cancelling fetch of {key}", self.inner.cache.name());
                request.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, request) in drained.iter() {
            request.abort.abort();
        }
        drained.len()
    }
}

impl<V> std::fmt::Debug for Deduplicator<V>
where
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("cache", &self.inner.cache.name())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    fn dedup() -> Deduplicator<String> {
        Deduplicator::new(TtlCache::memory_only(CacheConfig::default()).unwrap())
    }

    fn slow_fetch(
        calls: &Arc<AtomicUsize>,
        result: Result<String, FetchError>,
    ) -> impl Future<Output = Result<String, FetchError>> + Send + 'static {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callers = JoinSet::new();

        for _ in 0..10 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            callers.spawn(async move {
                dedup
                    .get_or_fetch("tournament:1", || slow_fetch(&calls, Ok("Cup".to_string())))
                    .await
            });
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.pending_count(), 1);

        let mut results = Vec::new();
        while let Some(joined) = callers.join_next().await {
            results.push(joined.unwrap());
        }
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| matches!(r, Ok(v) if v == "Cup")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.pending_count(), 0);

        // Served from the cache now.
        let value = dedup
            .get_or_fetch("tournament:1", || slow_fetch(&calls, Ok("Other".to_string())))
            .await
            .unwrap();
        assert_eq!(value, "Cup");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_shared_and_cleared() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let dedup = dedup.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                dedup
                    .get_or_fetch("match:1", || slow_fetch(&calls, Err(FetchError::network("reset"))))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = dedup
            .get_or_fetch("match:1", || slow_fetch(&calls, Ok("never".to_string())))
            .await;

        assert!(matches!(second, Err(Error::Fetch(FetchError::Network(_)))));
        assert!(first.await.unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dedup.is_pending("match:1"));
        assert!(!dedup.cache().has("match:1"));

        // A new call starts a new fetch.
        let third = dedup
            .get_or_fetch("match:1", || slow_fetch(&calls, Ok("ok".to_string())))
            .await;
        assert_eq!(third.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reaches_joiners() {
        let dedup = dedup();
        let waiter = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .get_or_fetch("player:1", || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, FetchError>("late".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(dedup.cancel("player:1"));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(dedup.pending_count(), 0);
        assert!(!dedup.cancel("player:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn instances_do_not_share_pending() {
        let first = dedup();
        let second = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            first.get_or_fetch("k", || slow_fetch(&calls, Ok("a".to_string()))),
            second.get_or_fetch("k", || slow_fetch(&calls, Ok("b".to_string()))),
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_override() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = || slow_fetch(&calls, Ok("v".to_string()));
        dedup
            .get_or_fetch_with_ttl("k", Some(Duration::from_millis(500)), fetch)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(501)).await;
        dedup
            .get_or_fetch_with_ttl("k", Some(Duration::from_millis(500)), fetch)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
