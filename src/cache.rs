use fieldx::fxstruct;
use garde::Validate;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::storage::NullStore;
use crate::telemetry::Telemetry;
use crate::traits::{CacheInvalidation, PersistentStore};

/// Anything the cache can hold. The cache never looks inside a value; serde is only needed for the persistent tier.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, Validate)]
#[fxstruct(get(copy), builder)]
pub struct CacheConfig {
    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get(clone), builder(into), default(String::from("cache")))]
    #[garde(length(min = 1))]
    name: String,

    /// Memory tier capacity.
    #[fieldx(default(1000))]
    #[garde(range(min = 1))]
    max_size: usize,

    #[fieldx(default(Duration::from_secs(300)))]
    #[garde(skip)]
    default_ttl: Duration,

    /// Share of `max_size` evicted at once when the memory tier is full.
    #[fieldx(default(0.1))]
    #[garde(range(min = 0.0, max = 1.0))]
    eviction_ratio: f64,

    /// Period of the background sweep of expired memory entries. Zero disables the sweeper.
    #[fieldx(default(Duration::from_secs(60)))]
    #[garde(skip)]
    sweep_interval: Duration,

    /// Prefix of every key this cache writes into the persistent tier.
    #[fieldx(get(clone), builder(into), default(String::from("bey-cache:")))]
    #[garde(skip)]
    storage_prefix: String,
}

impl CacheConfig {
    fn eviction_batch(&self) -> usize {
        ((self.max_size as f64 * self.eviction_ratio).ceil() as usize).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the memory tier.
    pub entries:   usize,
    pub hits:      u64,
    pub misses:    u64,
    pub evictions: u64,
    /// Entries dropped because their TTL ran out, by lookups or sweeps.
    pub expired:   u64,
}

struct Slot<V> {
    entry: CacheEntry<V>,
    seq:   u64,
}

// Memory tier. `order` indexes entries by (created_at, insertion sequence) so that eviction always takes the strictly
// oldest ones.
struct MemoryTier<V> {
    entries:  HashMap<String, Slot<V>>,
    order:    BTreeMap<(u64, u64), String>,
    next_seq: u64,
}

impl<V> MemoryTier<V> {
    fn new() -> Self {
        Self {
            entries:  HashMap::new(),
            order:    BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn get(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key).map(|slot| &slot.entry)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, entry: CacheEntry<V>) {
        self.remove(entry.key());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((entry.created_at(), seq), entry.key().to_string());
        self.entries.insert(entry.key().to_string(), Slot { entry, seq });
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&(slot.entry.created_at(), slot.seq));
        Some(slot.entry)
    }

    fn evict_oldest(&mut self, count: usize) -> Vec<String> {
        let mut evicted = Vec::with_capacity(count);
        while evicted.len() < count {
            let Some((_, key)) = self.order.pop_first()
            else {
                break;
            };
            self.entries.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&CacheEntry<V>) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|slot| pred(&slot.entry))
            .map(|slot| slot.entry.key().to_string())
            .collect();
        for key in doomed.iter() {
            self.remove(key);
        }
        doomed.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

struct CacheInner<V> {
    config:    CacheConfig,
    clock:     Clock,
    memory:    Mutex<MemoryTier<V>>,
    store:     Arc<dyn PersistentStore>,
    telemetry: Option<Telemetry>,
    hits:      AtomicU64,
    misses:    AtomicU64,
    evictions: AtomicU64,
    expired:   AtomicU64,
    sweeper:   Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for CacheInner<V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

/// Two-tier TTL cache.
///
/// The memory tier is authoritative; the persistent tier is consulted on a memory miss and a live entry found there is
/// promoted back into memory. Persistent tier failures are logged and otherwise ignored: the cache degrades to
/// memory-only behavior but never fails a caller.
///
/// ```ignore
/// let cache = TtlCache::new(
///     CacheConfig::builder().name("tournaments").max_size(500).build()?,
///     Arc::new(MokaStore::default()),
///     None,
/// )?;
///
/// cache.set_with_ttl("tournament:1", tournament, Duration::from_secs(60));
/// if let Some(t) = cache.get("tournament:1") {
///     render(t);
/// }
/// cache.clear_namespace("tournament:");
/// ```
pub struct TtlCache<V>
where
    V: CacheValue,
{
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for TtlCache<V>
where
    V: CacheValue,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TtlCache<V>
where
    V: CacheValue,
{
    /// Create a cache. When called within an async runtime the periodic sweeper is started too.
    pub fn new(config: CacheConfig, store: Arc<dyn PersistentStore>, telemetry: Option<Telemetry>) -> Result<Self> {
        config.validate()?;
        let cache = Self {
            inner: Arc::new(CacheInner {
                config,
                clock: Clock::new(),
                memory: Mutex::new(MemoryTier::new()),
                store,
                telemetry,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        };
        cache.start_sweeper();
        Ok(cache)
    }

    /// A cache without a persistent tier.
    pub fn memory_only(config: CacheConfig) -> Result<Self> {
        Self::new(config, Arc::new(NullStore), None)
    }

    #[inline]
    pub fn name(&self) -> String {
        self.inner.config.name()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    #[inline]
    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    #[inline]
    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.inner.config.storage_prefix)
    }

    /// Store `value` with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.inner.config.default_ttl)
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        debug!("[{}] SET({key}, ttl={ttl:?})", self.inner.config.name);
        let entry = CacheEntry::new(key, value, self.now(), ttl);
        self.persist(&entry);
        self.insert_memory(entry);
    }

    /// Live value for `key`, if any. A miss is not an error.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.now();

        {
            let mut memory = self.inner.memory.lock();
            if let Some(entry) = memory.get(key) {
                if entry.is_live(now) {
                    let value = entry.value().clone();
                    drop(memory);
                    self.record_hit();
                    return Some(value);
                }
                memory.remove(key);
                self.inner.expired.fetch_add(1, Ordering::Relaxed);
                debug!("[{}] {key} expired in memory", self.inner.config.name);
            }
        }

        match self.load_persistent(key, now) {
            Some(entry) => {
                debug!("[{}] promoting {key} from {}", self.inner.config.name, self.inner.store.name());
                let value = entry.value().clone();
                self.insert_memory(entry);
                self.record_hit();
                Some(value)
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    // Memory-tier lookup that leaves statistics and the persistent tier alone.
    pub(crate) fn peek(&self, key: &str) -> Option<V> {
        let now = self.now();
        self.inner
            .memory
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value().clone())
    }

    #[inline]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key` from both tiers. Idempotent.
    pub fn delete(&self, key: &str) {
        self.inner.memory.lock().remove(key);
        self.forget_persistent(key);
    }

    /// Remove everything this cache holds, in both tiers.
    pub fn clear(&self) {
        self.inner.memory.lock().clear();
        self.remove_persistent_where(|_| true);
        info!("[{}] cleared", self.inner.config.name);
    }

    /// Remove every entry whose key starts with `prefix` (e.g. `"tournament:"`).
    pub fn clear_namespace(&self, prefix: &str) -> usize {
        self.remove_where(|key| key.starts_with(prefix))
    }

    /// Remove every entry whose key contains `pattern`.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        self.remove_where(|key| key.contains(pattern))
    }

    // Returns the number of entries removed from the memory tier.
    fn remove_where(&self, pred: impl Fn(&str) -> bool) -> usize {
        let removed = self.inner.memory.lock().remove_where(|entry| pred(entry.key()));
        let persisted = self.remove_persistent_where(&pred);
        debug!(
            "[{}] removed {removed} memory and {persisted} persisted entries",
            self.inner.config.name
        );
        removed
    }

    /// Delete expired entries from the memory tier.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let reaped = self.inner.memory.lock().remove_where(|entry| !entry.is_live(now));
        if reaped > 0 {
            self.inner.expired.fetch_add(reaped as u64, Ordering::Relaxed);
            info!("[{}] sweep reaped {reaped} expired entries", self.inner.config.name);
        }
        reaped
    }

    /// Entries currently in the memory tier, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.inner.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries:   self.len(),
            hits:      self.inner.hits.load(Ordering::Relaxed),
            misses:    self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expired:   self.inner.expired.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweeper and drop the memory tier. Persisted entries are left for the next instance.
    pub fn close(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        self.inner.memory.lock().clear();
        debug!("[{}] closed", self.inner.config.name);
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeper.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    fn insert_memory(&self, entry: CacheEntry<V>) {
        let mut memory = self.inner.memory.lock();
        if !memory.contains(entry.key()) && memory.len() >= self.inner.config.max_size {
            let evicted = memory.evict_oldest(self.inner.config.eviction_batch());
            self.inner.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(
                "[{}] capacity reached, evicted {} oldest entries",
                self.inner.config.name,
                evicted.len()
            );
        }
        memory.insert(entry);
    }

    fn persist(&self, entry: &CacheEntry<V>) {
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(err) => {
                warn!(cache = %self.inner.config.name, key = entry.key(), %err, "cannot serialize entry, keeping it in memory only");
                return;
            }
        };
        if let Err(err) = self.inner.store.set_item(&self.storage_key(entry.key()), &json) {
            warn!(
                cache = %self.inner.config.name,
                key = entry.key(),
                store = self.inner.store.name(),
                %err,
                "persistent write failed, keeping entry in memory only"
            );
        }
    }

    fn load_persistent(&self, key: &str, now: u64) -> Option<CacheEntry<V>> {
        let storage_key = self.storage_key(key);
        let json = match self.inner.store.get_item(&storage_key) {
            Ok(json) => json?,
            Err(err) => {
                warn!(cache = %self.inner.config.name, key, store = self.inner.store.name(), %err, "persistent read failed");
                return None;
            }
        };

        let entry: CacheEntry<V> = match serde_json::from_str(&json) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(cache = %self.inner.config.name, key, %err, "dropping corrupt persisted entry");
                self.forget_persistent(key);
                return None;
            }
        };

        if entry.key() != key {
            warn!(cache = %self.inner.config.name, key, stored = entry.key(), "persisted entry belongs to another key");
            self.forget_persistent(key);
            return None;
        }

        if entry.is_live(now) {
            Some(entry)
        }
        else {
            self.inner.expired.fetch_add(1, Ordering::Relaxed);
            self.forget_persistent(key);
            None
        }
    }

    fn forget_persistent(&self, key: &str) {
        if let Err(err) = self.inner.store.remove_item(&self.storage_key(key)) {
            warn!(cache = %self.inner.config.name, key, store = self.inner.store.name(), %err, "persistent delete failed");
        }
    }

    fn remove_persistent_where(&self, pred: impl Fn(&str) -> bool) -> usize {
        let keys = match self.inner.store.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(cache = %self.inner.config.name, store = self.inner.store.name(), %err, "cannot enumerate persisted keys");
                return 0;
            }
        };

        let prefix = &self.inner.config.storage_prefix;
        let mut removed = 0;
        for storage_key in keys {
            let Some(key) = storage_key.strip_prefix(prefix.as_str())
            else {
                continue;
            };
            if pred(key) {
                self.forget_persistent(key);
                removed += 1;
            }
        }
        removed
    }

    fn record_hit(&self) {
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(telemetry) = &self.inner.telemetry {
            telemetry.record_cache_hit();
        }
    }

    fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(telemetry) = &self.inner.telemetry {
            telemetry.record_cache_miss();
        }
    }

    fn start_sweeper(&self) {
        let period = self.inner.config.sweep_interval;
        if period.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current()
        else {
            debug!(
                "[{}] no async runtime, expired entries are only dropped on access",
                self.inner.config.name
            );
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        *self.inner.sweeper.lock() = Some(runtime.spawn(Self::sweep_periodically(weak, period)));
    }

    async fn sweep_periodically(weak: Weak<CacheInner<V>>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade()
            else {
                break;
            };
            TtlCache { inner }.sweep();
        }
    }
}

impl<V> CacheInvalidation for TtlCache<V>
where
    V: CacheValue,
{
    fn invalidate_namespace(&self, prefix: &str) -> usize {
        self.clear_namespace(prefix)
    }
}

impl<V> Debug for TtlCache<V>
where
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.inner.config.name)
            .field("store", &self.inner.store.name())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MokaStore;
    use crate::test::FailingStore;
    use serde_json::{json, Value};

    fn config(max_size: usize) -> CacheConfig {
        CacheConfig::builder()
            .name("test")
            .max_size(max_size)
            .build()
            .unwrap()
    }

    fn shared_pair(store: &MokaStore) -> (TtlCache<Value>, TtlCache<Value>) {
        (
            TtlCache::new(config(100), Arc::new(store.clone()), None).unwrap(),
            TtlCache::new(config(100), Arc::new(store.clone()), None).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_scenario() {
        let cache = TtlCache::<Value>::memory_only(config(10)).unwrap();
        cache.set_with_ttl("tournament:1", json!({"name": "Cup"}), Duration::from_millis(1000));
        assert_eq!(cache.get("tournament:1"), Some(json!({"name": "Cup"})));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cache.has("tournament:1"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("tournament:1"), None);
        // The expired entry is purged from the memory tier.
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_only() {
        let cache = TtlCache::<u32>::memory_only(
            CacheConfig::builder()
                .max_size(10)
                .eviction_ratio(0.3)
                .build()
                .unwrap(),
        )
        .unwrap();

        for i in 0..10 {
            cache.set(format!("k{i}"), i);
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        // Refreshing makes k0 the newest entry.
        cache.set("k0", 100);
        cache.set("k10", 10);

        assert_eq!(cache.len(), 8);
        for gone in ["k1", "k2", "k3"] {
            assert!(!cache.has(gone), "{gone} must have been evicted");
        }
        for kept in ["k0", "k4", "k9", "k10"] {
            assert!(cache.has(kept), "{kept} must survive");
        }
        assert_eq!(cache.get("k0"), Some(100));
        assert_eq!(cache.stats().evictions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_does_not_evict() {
        let cache = TtlCache::<u32>::memory_only(config(2)).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_tier_promotes() {
        let store = MokaStore::default();
        let (tab_a, tab_b) = shared_pair(&store);

        tab_a.set("match:3", json!({"score": [2, 1]}));
        assert!(tab_b.is_empty());
        assert_eq!(tab_b.get("match:3"), Some(json!({"score": [2, 1]})));
        assert_eq!(tab_b.len(), 1);
        assert_eq!(tab_b.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn live_memory_copy_wins() {
        let store = MokaStore::default();
        let (tab_a, tab_b) = shared_pair(&store);

        tab_a.set("k", json!(1));
        tab_b.set("k", json!(2));
        assert!(store.get_item("bey-cache:k").unwrap().is_some());

        assert_eq!(tab_a.get("k"), Some(json!(1)));
        assert_eq!(tab_b.get("k"), Some(json!(2)));

        // Once the memory copy is gone the persisted one is used.
        tab_a.close();
        assert_eq!(tab_a.get("k"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_persisted_entry_is_purged() {
        let store = MokaStore::default();
        let (tab_a, tab_b) = shared_pair(&store);

        tab_a.set_with_ttl("match:3", json!(1), Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(tab_b.get("match:3"), None);
        assert_eq!(store.get_item("bey-cache:match:3").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_persisted_entry_is_dropped() {
        let store = MokaStore::default();
        store.set_item("bey-cache:player:1", "{not json").unwrap();
        let cache = TtlCache::<Value>::new(config(10), Arc::new(store.clone()), None).unwrap();

        assert_eq!(cache.get("player:1"), None);
        assert_eq!(store.get_item("bey-cache:player:1").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_store_degrades_to_memory() {
        let cache = TtlCache::<u32>::new(config(10), Arc::new(FailingStore), None).unwrap();
        cache.set("tournament:9", 9);
        assert_eq!(cache.get("tournament:9"), Some(9));
        cache.delete("tournament:9");
        assert_eq!(cache.get("tournament:9"), None);
        cache.clear();
        assert_eq!(cache.clear_namespace("tournament:"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn namespaced_removal() {
        let store = MokaStore::default();
        let cache = TtlCache::<u32>::new(config(100), Arc::new(store.clone()), None).unwrap();
        store.set_item("foreign-key", "x").unwrap();

        cache.set("tournament:1", 1);
        cache.set("tournament:2", 2);
        cache.set("match:1", 3);
        cache.set("match:2", 4);

        assert_eq!(cache.clear_namespace("tournament:"), 2);
        assert!(!cache.has("tournament:1"));
        assert!(cache.has("match:1"));
        assert_eq!(store.get_item("bey-cache:tournament:2").unwrap(), None);

        assert_eq!(cache.remove_matching(":2"), 1);
        assert!(!cache.has("match:2"));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(store.keys().unwrap(), vec!["foreign-key".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_is_idempotent() {
        let store = MokaStore::default();
        let cache = TtlCache::<u32>::new(config(10), Arc::new(store.clone()), None).unwrap();
        cache.set("a", 1);
        cache.delete("a");
        cache.delete("a");
        assert!(!cache.has("a"));
        assert_eq!(store.get_item("bey-cache:a").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep() {
        let cache = TtlCache::<u32>::memory_only(
            CacheConfig::builder()
                .sweep_interval(Duration::from_secs(60))
                .default_ttl(Duration::from_secs(10))
                .build()
                .unwrap(),
        )
        .unwrap();
        assert!(cache.is_sweeping());

        cache.set("short", 1);
        cache.set_with_ttl("long", 2, Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expired, 1);

        cache.close();
        assert!(!cache.is_sweeping());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hit_rate_reaches_telemetry() {
        let telemetry = Telemetry::default();
        let cache = TtlCache::<u32>::new(config(10), Arc::new(NullStore), Some(telemetry.clone())).unwrap();
        cache.set("a", 1);
        cache.get("a");
        cache.get("b");
        let summary = telemetry.generate_report().summary;
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.cache_misses, 1);
        assert_eq!(summary.cache_hit_rate, 0.5);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CacheConfig::builder().max_size(0).build().unwrap();
        assert!(TtlCache::<u32>::memory_only(config).is_err());
    }
}
