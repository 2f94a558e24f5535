//! Real-time subscriptions.
//!
//! Each subscription runs as its own task which owns the change channel, the throttle timer and the reconnect timer.
//! The lifecycle is `disconnected -> connecting -> connected`; a failing channel goes to `reconnecting` and back to
//! `connecting` after `retry_delay * 2^retry_count`, or ends up `disconnected` once `max_retries` reconnects failed.
//!
//! Events are rate limited, applied to the subscription's rows right away and handed to consumers through a trailing
//! debounce, so a burst of changes produces a single delivery carrying the latest one. With cross-tab sync enabled,
//! accepted events are also published on a channel named by the table, and sibling tabs apply them as if they came
//! from their own channel.

pub mod broadcast;
pub mod subscription;
pub mod throttle;

use fieldx::fxstruct;
use garde::Validate;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::keys;
use crate::observer::Listeners;
use crate::telemetry::Telemetry;
use crate::traits::{BroadcastTransport, CacheInvalidation, DataSource};
use crate::types::{ChannelSpec, SubscriptionState};

pub use broadcast::{BroadcastMessage, LocalBroadcast, NoBroadcast};
pub use subscription::{apply_change, Subscription, SubscriptionSnapshot, SubscriptionSpec};
use subscription::Driver;

static NEXT_TAB: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Validate)]
#[fxstruct(get(copy), builder)]
pub struct RealtimeConfig {
    /// Debounce window of event delivery.
    #[fieldx(default(Duration::from_millis(100)))]
    #[garde(custom(at_most_a_day))]
    throttle: Duration,

    /// Events over this rate are dropped.
    #[fieldx(default(10))]
    #[garde(range(min = 1))]
    max_events_per_second: u32,

    /// Reconnect attempts after a channel failure before giving up.
    #[fieldx(default(3))]
    #[garde(range(max = 30))]
    max_retries: u32,

    #[fieldx(default(Duration::from_millis(1000)))]
    #[garde(custom(at_most_a_day))]
    retry_delay: Duration,

    #[fieldx(default(true))]
    #[garde(skip)]
    cross_tab_sync: bool,

    /// Cross-tab channel of a table is `broadcast_prefix + table`.
    #[fieldx(get(clone), builder(into), default(String::from("realtime-")))]
    #[garde(skip)]
    broadcast_prefix: String,

    /// Column identifying a row when applying updates and deletes.
    #[fieldx(get(clone), builder(into), default(String::from("id")))]
    #[garde(length(min = 1))]
    primary_key: String,

    /// Cache namespace of a table when it differs from the table name. Delivered events of the table invalidate
    /// `namespace:*`.
    #[fieldx(get(clone), builder(into), default(default_namespaces()))]
    #[garde(skip)]
    table_namespaces: HashMap<String, String>,
}

impl RealtimeConfig {
    /// Cache namespace invalidated by changes to `table`.
    pub fn namespace_of<'a>(&'a self, table: &'a str) -> &'a str {
        self.table_namespaces.get(table).map_or(table, String::as_str)
    }
}

fn default_namespaces() -> HashMap<String, String> {
    [
        ("tournaments", keys::TOURNAMENT),
        ("matches", keys::MATCH),
        ("players", keys::PLAYER),
        ("leaderboards", keys::LEADERBOARD),
    ]
    .into_iter()
    .map(|(table, namespace)| (table.to_string(), namespace.to_string()))
    .collect()
}

const A_DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn at_most_a_day(value: &Duration, _: &()) -> garde::Result {
    if *value > A_DAY {
        return Err(garde::Error::new(format!("{value:?} is longer than a day")));
    }
    Ok(())
}

struct Registered {
    snapshot: watch::Receiver<SubscriptionSnapshot>,
    abort:    AbortHandle,
}

pub(crate) struct RealtimeInner {
    config:       RealtimeConfig,
    tab_id:       String,
    source:       Arc<dyn DataSource>,
    broadcast:    Arc<dyn BroadcastTransport>,
    invalidation: RwLock<Vec<Arc<dyn CacheInvalidation>>>,
    telemetry:    Option<Telemetry>,
    visibility:   watch::Sender<bool>,
    next_id:      AtomicU64,
    closed:       AtomicBool,
    registry:     Mutex<HashMap<u64, Registered>>,
}

impl RealtimeInner {
    fn forget(&self, id: u64) {
        self.registry.lock().remove(&id);
    }
}

/// Creates and tracks the subscriptions of one tab.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<RealtimeInner>,
}

impl RealtimeManager {
    pub fn new(
        config: RealtimeConfig,
        source: Arc<dyn DataSource>,
        broadcast: Arc<dyn BroadcastTransport>,
        telemetry: Option<Telemetry>,
    ) -> Result<Self> {
        config.validate()?;
        let tab_id = format!("tab-{}", NEXT_TAB.fetch_add(1, Ordering::Relaxed));
        Ok(Self {
            inner: Arc::new(RealtimeInner {
                config,
                tab_id,
                source,
                broadcast,
                invalidation: RwLock::new(Vec::new()),
                telemetry,
                visibility: watch::channel(true).0,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Identity of this manager on the cross-tab channel.
    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    /// Drop cached entries of the table's namespace whenever an event of the table is delivered.
    pub fn invalidate_on_change(&self, target: Arc<dyn CacheInvalidation>) {
        self.inner.invalidation.write().push(target);
    }

    pub fn subscribe(&self, spec: SubscriptionSpec) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("realtime manager"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::Closed("async runtime"))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = ChannelSpec {
            name:   format!(
                "{}:{}:{}#{id}",
                spec.table(),
                spec.filter_str().unwrap_or("*"),
                self.inner.tab_id
            ),
            table:  spec.table().to_string(),
            filter: spec.filter_str().map(String::from),
            events: spec.event_mask(),
        };

        let peer_topic = format!("{}{}", self.inner.config.broadcast_prefix, spec.table());
        let peers = if self.inner.config.cross_tab_sync {
            match self.inner.broadcast.subscribe(&peer_topic) {
                Ok(rx) => Some(rx),
                Err(err) => {
                    warn!(table = spec.table(), %err, "cross-tab sync unavailable, running in single-tab mode");
                    None
                }
            }
        }
        else {
            None
        };

        let (snapshot_tx, snapshot_rx) = watch::channel(SubscriptionSnapshot {
            loading: true,
            ..Default::default()
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let listeners = Listeners::new();

        let driver = Driver::new(
            id,
            Arc::clone(&self.inner),
            spec.clone(),
            channel.clone(),
            snapshot_tx,
            listeners.clone(),
            command_rx,
            peers,
            peer_topic,
        );

        debug!(channel = %channel.name, "subscribing");
        let mut registry = self.inner.registry.lock();
        let task = runtime.spawn(driver.run());
        registry.insert(
            id,
            Registered {
                snapshot: snapshot_rx.clone(),
                abort:    task.abort_handle(),
            },
        );
        drop(registry);

        Ok(Subscription::new(
            id,
            channel.name,
            spec,
            snapshot_rx,
            listeners,
            command_tx,
            task,
        ))
    }

    /// Tell subscriptions whether the tab is visible. Hidden tabs hold back deliveries; a tab becoming visible
    /// reconnects the subscriptions that are not connected.
    pub fn set_visibility(&self, visible: bool) {
        self.inner.visibility.send_if_modified(|current| {
            if *current == visible {
                false
            }
            else {
                *current = visible;
                true
            }
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.inner.visibility.borrow()
    }

    /// Subscriptions currently connected.
    pub fn active_subscriptions(&self) -> usize {
        self.inner
            .registry
            .lock()
            .values()
            .filter(|r| r.snapshot.borrow().state == SubscriptionState::Connected)
            .count()
    }

    /// Subscriptions alive, whatever their state.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Stop every subscription and refuse new ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let registered: Vec<_> = self.inner.registry.lock().drain().collect();
        debug!(count = registered.len(), "closing realtime subscriptions");
        for (_, entry) in registered {
            entry.abort.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("tab_id", &self.inner.tab_id)
            .field("subscriptions", &self.subscription_count())
            .field("visible", &self.is_visible())
            .finish()
    }
}
