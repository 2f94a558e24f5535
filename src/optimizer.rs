use fieldx::fxstruct;
use garde::Validate;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheValue, TtlCache};
use crate::dedup::Deduplicator;
use crate::error::{Error, FetchError, Result};
use crate::keys;
use crate::retry::{retry, RetryPolicy};
use crate::telemetry::Telemetry;
use crate::types::{MetricCategory, Priority};

pub type FetchFuture<V> = Pin<Box<dyn Future<Output = Result<V, FetchError>> + Send>>;

/// A reusable fetch operation. Called once per attempt.
pub type Fetcher<V> = Arc<dyn Fn() -> FetchFuture<V> + Send + Sync>;

#[derive(Debug, Clone, Validate)]
#[fxstruct(get(copy), builder)]
pub struct OptimizerConfig {
    #[fieldx(get(clone), builder(into), default(String::from("optimizer")))]
    #[garde(length(min = 1))]
    name: String,

    /// Bound on fetches in flight at once, high-priority requests excluded.
    #[fieldx(default(5))]
    #[garde(range(min = 1))]
    max_concurrent_requests: usize,
}

/// Per-request knobs.
#[derive(Debug, Clone, Validate)]
#[fxstruct(get(copy), builder)]
pub struct RequestOptions {
    /// A single attempt that takes longer is abandoned and counts as a retriable failure.
    #[fieldx(default(Duration::from_secs(10)))]
    #[garde(skip)]
    timeout: Duration,

    #[fieldx(default(3))]
    #[garde(range(max = 30))]
    retries: u32,

    /// Base delay of the exponential backoff between attempts.
    #[fieldx(default(Duration::from_millis(1000)))]
    #[garde(skip)]
    retry_delay: Duration,

    /// TTL of the cached result.
    #[fieldx(default(Duration::from_secs(300)))]
    #[garde(skip)]
    cache_time: Duration,

    #[fieldx(default(Priority::Normal))]
    #[garde(skip)]
    priority: Priority,
}

impl RequestOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.retries)
            .delay(self.retry_delay)
            .backoff(true)
            .build()
            .unwrap_or_default()
    }

    pub fn high_priority() -> Self {
        Self::builder()
            .priority(Priority::High)
            .build()
            .unwrap_or_default()
    }
}

/// One entry of [`RequestOptimizer::batch_requests`].
pub struct BatchRequest<V> {
    key:   String,
    fetch: Fetcher<V>,
}

impl<V> BatchRequest<V>
where
    V: CacheValue,
{
    pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let fetch: Fetcher<V> = Arc::new(move || -> FetchFuture<V> { Box::pin(fetch()) });
        Self {
            key: key.into(),
            fetch,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Per-key outcome of a batch. A failed request never prevents its siblings from completing.
#[derive(Debug)]
pub struct BatchOutcome<V> {
    pub results: HashMap<String, V>,
    pub errors:  HashMap<String, Error>,
}

impl<V> BatchOutcome<V> {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<V> Default for BatchOutcome<V> {
    fn default() -> Self {
        Self {
            results: HashMap::new(),
            errors:  HashMap::new(),
        }
    }
}

// Keeps a gauge raised for as long as it lives, cancellation included.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn raise(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct OptimizerInner<V>
where
    V: CacheValue,
{
    config:    OptimizerConfig,
    dedup:     Deduplicator<V>,
    slots:     Semaphore,
    in_flight: AtomicUsize,
    queued:    AtomicUsize,
    telemetry: Option<Telemetry>,
}

impl<V> OptimizerInner<V>
where
    V: CacheValue,
{
    // FIFO admission. `None` means the request skipped the queue.
    async fn admit(&self, key: &str, priority: Priority) -> Result<Option<SemaphorePermit<'_>>> {
        if priority == Priority::High {
            if self.slots.is_closed() {
                return Err(Error::Closed("request optimizer"));
            }
            debug!("[{}] BYPASS({key})", self.config.name);
            return Ok(None);
        }

        if let Ok(permit) = self.slots.try_acquire() {
            return Ok(Some(permit));
        }

        debug!("[{}] QUEUE({key})", self.config.name);
        let _queued = Gauge::raise(&self.queued);
        self.slots
            .acquire()
            .await
            .map(Some)
            .map_err(|_| Error::Closed("request optimizer"))
    }

    async fn execute<F, Fut>(&self, key: &str, options: &RequestOptions, fetch: F) -> Result<V>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, FetchError>>,
    {
        let _permit = self.admit(key, options.priority()).await?;
        let _in_flight = Gauge::raise(&self.in_flight);
        debug!("[{}] FETCH({key})", self.config.name);

        let timeout = options.timeout();
        let started = Instant::now();
        let result = retry(&options.retry_policy(), || {
            let attempt = fetch();
            async move {
                tokio::time::timeout(timeout, attempt)
                    .await
                    .unwrap_or(Err(FetchError::Timeout(timeout)))
            }
        })
        .await;

        if let Some(telemetry) = self.telemetry.as_ref() {
            telemetry.track_metric(
                keys::namespace_of(key),
                started.elapsed().as_secs_f64() * 1000.0,
                MetricCategory::Api,
                Some(serde_json::json!({ "key": key, "ok": result.is_ok() })),
            );
        }

        if let Err(err) = &result {
            if !err.is_aborted() {
                warn!(key, %err, "[{}] request failed", self.config.name);
            }
        }

        result
    }
}

/// Cache-aware request front end.
///
/// A request is served from the cache when possible. Otherwise it joins a pending fetch of the same key, or starts a
/// new one which waits for a free slot, runs under a timeout and is retried with backoff. Successful results are cached
/// for the request's `cache_time`.
pub struct RequestOptimizer<V>
where
    V: CacheValue,
{
    inner: Arc<OptimizerInner<V>>,
}

impl<V> Clone for RequestOptimizer<V>
where
    V: CacheValue,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> RequestOptimizer<V>
where
    V: CacheValue,
{
    pub fn new(config: OptimizerConfig, cache: TtlCache<V>, telemetry: Option<Telemetry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(OptimizerInner {
                slots: Semaphore::new(config.max_concurrent_requests),
                config,
                dedup: Deduplicator::new(cache),
                in_flight: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                telemetry,
            }),
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &TtlCache<V> {
        self.inner.dedup.cache()
    }

    pub fn dedup(&self) -> &Deduplicator<V> {
        &self.inner.dedup
    }

    /// Fetch `key` through the cache, the deduplicator and admission control.
    ///
    /// Priority applies to the fetch this call starts. A call for a key whose fetch is already pending joins it, so a
    /// `High` request for a key queued at `Normal` priority waits for that queued fetch.
    #[instrument(level = "trace", skip(self, options, fetch), fields(name = %self.inner.config.name))]
    pub async fn request<F, Fut>(&self, key: &str, options: &RequestOptions, fetch: F) -> Result<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed("request optimizer"));
        }

        let inner = Arc::clone(&self.inner);
        let options = options.clone();
        let owned_key = key.to_string();
        let cache_time = options.cache_time();

        self.inner
            .dedup
            .get_or_fetch_with_ttl(key, Some(cache_time), move || async move {
                inner.execute(&owned_key, &options, fetch).await
            })
            .await
    }

    pub async fn request_boxed(&self, key: &str, options: &RequestOptions, fetch: Fetcher<V>) -> Result<V> {
        self.request(key, options, move || fetch()).await
    }

    /// Run `requests` in consecutive batches of `max_concurrent`, each batch finishing before the next one starts.
    pub async fn batch_requests(
        &self,
        requests: Vec<BatchRequest<V>>,
        max_concurrent: usize,
        options: &RequestOptions,
    ) -> BatchOutcome<V> {
        let mut outcome = BatchOutcome::default();
        let mut requests = requests.into_iter().peekable();
        let batch_size = max_concurrent.max(1);

        while requests.peek().is_some() {
            let mut batch = JoinSet::new();
            for request in requests.by_ref().take(batch_size) {
                let optimizer = self.clone();
                let options = options.clone();
                batch.spawn(async move {
                    let result = optimizer.request_boxed(&request.key, &options, request.fetch).await;
                    (request.key, result)
                });
            }

            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok((key, Ok(value))) => {
                        outcome.results.insert(key, value);
                    }
                    Ok((key, Err(err))) => {
                        outcome.errors.insert(key, err);
                    }
                    Err(err) => {
                        warn!("[{}] batch request task failed: {err}", self.inner.config.name);
                    }
                }
            }
        }

        outcome
    }

    /// Warm the cache for `key` in the background. Does nothing if the value is already cached.
    pub fn prefetch<F, Fut>(&self, key: &str, options: &RequestOptions, fetch: F) -> Option<JoinHandle<()>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        if self.cache().has(key) {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let optimizer = self.clone();
        let options = options.clone();
        let key = key.to_string();
        Some(runtime.spawn(async move {
            if let Err(err) = optimizer.request(&key, &options, fetch).await {
                debug!("[{}] prefetch of {key} failed: {err}", optimizer.inner.config.name);
            }
        }))
    }

    /// Remove cached entries whose key contains `pattern`, or everything without a pattern.
    pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
        match pattern {
            Some(pattern) => self.cache().remove_matching(pattern),
            None => {
                let count = self.cache().len();
                self.cache().clear();
                count
            }
        }
    }

    /// Fetches currently running, high-priority ones included.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Fetches waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    /// Reject queued and future requests. Fetches already running are left to finish.
    pub fn close(&self) {
        debug!("[{}] closing", self.inner.config.name);
        self.inner.slots.close();
    }
}

impl<V> std::fmt::Debug for RequestOptimizer<V>
where
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptimizer")
            .field("name", &self.inner.config.name)
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish()
    }
}
