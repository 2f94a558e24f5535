use bey_cache::prelude::*;
use bey_cache::realtime::{LocalBroadcast, NoBroadcast};
use bey_cache::storage::FileStore;
use bey_cache::test::{CountingFetch, MockSource};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn file_cache(dir: &std::path::Path, name: &str) -> TtlCache<Value> {
    let config = CacheConfig::builder().name(name).build().unwrap();
    TtlCache::new(config, Arc::new(FileStore::open(dir).unwrap()), None).unwrap()
}

fn optimizer(max_concurrent: usize) -> RequestOptimizer<Value> {
    let cache = TtlCache::memory_only(CacheConfig::builder().build().unwrap()).unwrap();
    let config = OptimizerConfig::builder()
        .max_concurrent_requests(max_concurrent)
        .build()
        .unwrap();
    RequestOptimizer::new(config, cache, None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn persisted_entries_outlive_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let key = keys::tournament(7);

    let first = file_cache(dir.path(), "first");
    first.set_with_ttl(&key, json!({"name": "Spring Cup"}), Duration::from_secs(1));
    first.close();

    let second = file_cache(dir.path(), "second");
    assert_eq!(second.get(&key), Some(json!({"name": "Spring Cup"})));
    assert_eq!(second.stats().hits, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(second.get(&key), None);
    assert!(!file_cache(dir.path(), "third").has(&key));
}

#[tokio::test(start_paused = true)]
async fn concurrent_readers_share_one_fetch() {
    let optimizer = optimizer(5);
    let fetch = CountingFetch::ok(json!({"id": 3})).delay(Duration::from_millis(50));

    let mut readers = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let optimizer = optimizer.clone();
        let fetcher = fetch.fetcher();
        readers.spawn(async move {
            optimizer
                .request(&keys::tournament(3), &RequestOptions::default(), fetcher)
                .await
        });
    }

    while let Some(joined) = readers.join_next().await {
        assert_eq!(joined.unwrap().unwrap(), json!({"id": 3}));
    }
    assert_eq!(fetch.calls(), 1);
    assert_eq!(optimizer.dedup().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn admission_is_bounded() {
    let optimizer = optimizer(2);
    let fetch = CountingFetch::ok(Value::Null).delay(Duration::from_millis(100));
    let started = Instant::now();

    let mut requests = tokio::task::JoinSet::new();
    for id in 0..5 {
        let optimizer = optimizer.clone();
        let fetcher = fetch.fetcher();
        requests.spawn(async move {
            optimizer
                .request(&keys::player(id), &RequestOptions::default(), fetcher)
                .await
        });
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(optimizer.in_flight(), 2);
    assert_eq!(optimizer.queued(), 3);

    while let Some(joined) = requests.join_next().await {
        joined.unwrap().unwrap();
    }
    assert_eq!(fetch.calls(), 5);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(optimizer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn batch_reports_each_key() {
    let optimizer = optimizer(5);
    let options = RequestOptions::builder().retries(0).build().unwrap();
    let good = CountingFetch::ok(json!("ok"));
    let bad = CountingFetch::<Value>::err(FetchError::from_status(404, "no such match"));

    let mut requests: Vec<_> = (1..=3)
        .map(|id| BatchRequest::new(keys::match_(id), good.fetcher()))
        .collect();
    requests.push(BatchRequest::new(keys::match_(4), bad.fetcher()));

    let outcome = optimizer.batch_requests(requests, 2, &options).await;
    assert_eq!(outcome.results.len(), 3);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors.contains_key("match:4"));
    assert!(!outcome.is_complete());
    assert_eq!(bad.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_give_up_after_max_retries() {
    let source = Arc::new(MockSource::new());
    source.fail_connects(100);
    let config = RealtimeConfig::builder()
        .max_retries(3)
        .retry_delay(Duration::from_secs(1))
        .build()
        .unwrap();
    let realtime = RealtimeManager::new(config, source.clone(), Arc::new(NoBroadcast), None).unwrap();

    let subscription = realtime.subscribe(SubscriptionSpec::new("match")).unwrap();
    // 1s + 2s + 4s of backoff.
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snapshot = subscription.snapshot();
    assert_eq!(snapshot.state, SubscriptionState::Disconnected);
    assert_eq!(snapshot.retry_count, 3);
    assert!(snapshot.error.is_some());
    assert_eq!(source.subscribe_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn tabs_stay_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new().with_rows("match", vec![json!({"id": 1, "score": [0, 0]})]));
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let hub = LocalBroadcast::default();

    let tab = |n: usize| {
        let mut config = ServicesConfig::default();
        config.cache = CacheConfig::builder()
            .name(format!("tab-{n}"))
            .storage_prefix(format!("tab-{n}:"))
            .build()
            .unwrap();
        Services::<Value>::create(
            config,
            Capabilities::new(source.clone())
                .with_store(store.clone())
                .with_broadcast(Arc::new(hub.clone())),
        )
        .unwrap()
    };
    let tabs = [tab(0), tab(1)];

    let mut subscriptions = Vec::new();
    for services in &tabs {
        services.cache().set(keys::match_(1), json!({"stale": true}));
        let subscription = services.realtime().subscribe(SubscriptionSpec::new("match")).unwrap();
        subscription.wait_for_state(SubscriptionState::Connected).await.unwrap();
        subscriptions.push(subscription);
    }

    source.emit(
        ChangePayload::update("match", json!({"id": 1}), json!({"id": 1, "score": [2, 1]})).with_id("evt-1"),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    for (services, subscription) in tabs.iter().zip(&subscriptions) {
        assert_eq!(subscription.rows(), vec![json!({"id": 1, "score": [2, 1]})]);
        // The same event came over the network and from the sibling; it is delivered once.
        assert_eq!(subscription.snapshot().deliveries, 1);
        assert!(!services.cache().has(&keys::match_(1)));
    }

    drop(subscriptions);
    for services in tabs {
        services.destroy();
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(source.open_channels("match"), 0);
}
