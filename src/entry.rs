use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// A cached value together with its freshness information.
///
/// This is also the persisted form: the persistent tier stores the JSON encoding of the whole entry so that a sibling
/// instance can judge liveness without any extra bookkeeping.
#[derive(Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    key:        String,
    value:      V,
    /// Clock milliseconds of insertion or last refresh.
    created_at: u64,
    ttl_ms:     u64,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, value: V, created_at: u64, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            created_at,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Live while `now - created_at <= ttl`.
    #[inline]
    pub fn is_live(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) <= self.ttl_ms
    }

    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.ttl_ms)
    }
}

impl<V> Debug for CacheEntry<V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("created_at", &self.created_at)
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}
