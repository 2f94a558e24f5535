use garde::Validate;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheConfig, CacheValue, TtlCache};
use crate::error::Result;
use crate::optimizer::{OptimizerConfig, RequestOptimizer};
use crate::realtime::{NoBroadcast, RealtimeConfig, RealtimeManager};
use crate::storage::NullStore;
use crate::telemetry::{Telemetry, TelemetryConfig};
use crate::traits::{BroadcastTransport, DataSource, PersistentStore};

/// Configuration of every component of a [`Services`] container.
#[derive(Debug, Clone, Default, Validate)]
pub struct ServicesConfig {
    #[garde(dive)]
    pub cache:     CacheConfig,
    #[garde(dive)]
    pub optimizer: OptimizerConfig,
    #[garde(dive)]
    pub realtime:  RealtimeConfig,
    #[garde(dive)]
    pub telemetry: TelemetryConfig,
}

/// What the environment provides. Persistence and cross-tab messaging default to their unavailable variants.
#[derive(Clone)]
pub struct Capabilities {
    pub source:    Arc<dyn DataSource>,
    pub store:     Arc<dyn PersistentStore>,
    pub broadcast: Arc<dyn BroadcastTransport>,
}

impl Capabilities {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            store: Arc::new(NullStore),
            broadcast: Arc::new(NoBroadcast),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn BroadcastTransport>) -> Self {
        self.broadcast = broadcast;
        self
    }
}

/// The data layer of one tab, wired together and handed down explicitly instead of living in globals.
///
/// Telemetry observes the cache, the optimizer and the real-time manager; delivered real-time events invalidate the
/// cache namespace of their table.
pub struct Services<V>
where
    V: CacheValue,
{
    telemetry: Telemetry,
    cache:     TtlCache<V>,
    optimizer: RequestOptimizer<V>,
    realtime:  RealtimeManager,
}

impl<V> Services<V>
where
    V: CacheValue,
{
    pub fn create(config: ServicesConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;

        let telemetry = Telemetry::new(config.telemetry)?;
        let cache = TtlCache::new(config.cache, capabilities.store, Some(telemetry.clone()))?;
        let optimizer = RequestOptimizer::new(config.optimizer, cache.clone(), Some(telemetry.clone()))?;
        let realtime = RealtimeManager::new(
            config.realtime,
            capabilities.source,
            capabilities.broadcast,
            Some(telemetry.clone()),
        )?;
        realtime.invalidate_on_change(Arc::new(cache.clone()));

        info!(cache = %cache.name(), tab = realtime.tab_id(), "services created");
        Ok(Self {
            telemetry,
            cache,
            optimizer,
            realtime,
        })
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn cache(&self) -> &TtlCache<V> {
        &self.cache
    }

    pub fn optimizer(&self) -> &RequestOptimizer<V> {
        &self.optimizer
    }

    pub fn realtime(&self) -> &RealtimeManager {
        &self.realtime
    }

    /// Tear everything down: subscriptions, queued and pending requests, the cache sweeper and report emission.
    pub fn destroy(self) {
        self.realtime.close();
        self.optimizer.close();
        let cancelled = self.optimizer.dedup().cancel_all();
        self.cache.close();
        self.telemetry.close();
        info!(cancelled, tab = self.realtime.tab_id(), "services destroyed");
    }
}

impl<V> std::fmt::Debug for Services<V>
where
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("cache", &self.cache)
            .field("optimizer", &self.optimizer)
            .field("realtime", &self.realtime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, FetchError};
    use crate::keys;
    use crate::optimizer::RequestOptions;
    use crate::realtime::SubscriptionSpec;
    use crate::test::MockSource;
    use crate::types::{ChangePayload, SubscriptionState};
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn wired_and_destroyed() {
        let source = Arc::new(MockSource::new());
        let services = Services::<Value>::create(ServicesConfig::default(), Capabilities::new(source.clone())).unwrap();

        let key = keys::match_(1);
        let value = services
            .optimizer()
            .request(&key, &RequestOptions::default(), || async {
                Ok::<_, FetchError>(json!({"id": 1, "score": 0}))
            })
            .await
            .unwrap();
        assert_eq!(value["score"], 0);
        assert!(services.cache().has(&key));
        assert!(services.cache().is_sweeping());

        let subscription = services
            .realtime()
            .subscribe(SubscriptionSpec::new("match"))
            .unwrap();
        subscription.wait_for_state(SubscriptionState::Connected).await.unwrap();
        assert_eq!(services.telemetry().active_subscriptions(), 1);

        // A delivered change drops the cached entries of its table.
        source.emit(ChangePayload::update("match", json!({"id": 1}), json!({"id": 1, "score": 3})));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!services.cache().has(&key));

        let optimizer = services.optimizer().clone();
        let cache = services.cache().clone();
        services.destroy();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(subscription.is_closed());
        assert!(!cache.is_sweeping());
        assert!(matches!(
            optimizer
                .request("match:2", &RequestOptions::default(), || async { Ok::<_, FetchError>(Value::Null) })
                .await,
            Err(Error::Closed(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = ServicesConfig::default();
        config.optimizer = OptimizerConfig::builder()
            .max_concurrent_requests(0)
            .build()
            .unwrap();
        let result = Services::<Value>::create(config, Capabilities::new(Arc::new(MockSource::new())));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
