use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use crate::error::Error;
use crate::traits::PersistentStore;

/// Bounded in-process key/value store.
///
/// Capacity is measured in bytes of key plus value. Writes over the quota push older items out silently, the same way
/// browser storage drops writes under quota pressure: the caller cannot rely on an item surviving.
///
/// The store is cheap to clone and clones share content, so several cache instances ("tabs") can share one persistent
/// tier.
#[derive(Clone)]
pub struct MokaStore {
    items: Cache<String, String>,
}

impl MokaStore {
    pub fn new(max_bytes: u64) -> Self {
        Self::with_name("bey-cache-storage", max_bytes)
    }

    pub fn with_name(name: &str, max_bytes: u64) -> Self {
        Self {
            items: Cache::builder()
                .name(name)
                .max_capacity(max_bytes)
                .weigher(|k: &String, v: &String| -> u32 { (k.len() + v.len()).try_into().unwrap_or(u32::MAX) })
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }

    /// Number of items currently held. Pending evictions are applied first.
    pub fn len(&self) -> u64 {
        self.items.run_pending_tasks();
        self.items.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MokaStore {
    // Roughly what browsers grant a single origin.
    fn default() -> Self {
        Self::new(5 * 1024 * 1024)
    }
}

impl std::fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStore")
            .field("name", &self.items.name())
            .field("entries", &self.items.entry_count())
            .finish()
    }
}

impl PersistentStore for MokaStore {
    fn name(&self) -> &'static str {
        "moka"
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.items.get(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), Error> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), Error> {
        self.items.invalidate(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.items.iter().map(|(k, _)| k.as_ref().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_operations() {
        let store = MokaStore::default();
        store.set_item("a", "1").unwrap();
        store.set_item("b", "2").unwrap();
        assert_eq!(store.get_item("a").unwrap().as_deref(), Some("1"));
        store.remove_item("a").unwrap();
        assert_eq!(store.get_item("a").unwrap(), None);

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["b".to_string()]);
    }

    #[test]
    fn clones_share_content() {
        let store = MokaStore::default();
        let sibling = store.clone();
        store.set_item("tournament:1", "{}").unwrap();
        assert!(sibling.get_item("tournament:1").unwrap().is_some());
    }

    #[test]
    fn quota_pressure_drops_items() {
        let store = MokaStore::new(64);
        let payload = "x".repeat(40);
        for i in 0..10 {
            store.set_item(&format!("k{i}"), &payload).unwrap();
        }
        assert!(store.len() < 10);
    }
}
