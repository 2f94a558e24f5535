//! # bey-cache
//!
//! Client-side data layer of a tournament tracking application: it sits between the UI and a hosted database backend
//! and keeps the number of round-trips down while the screens stay fresh.
//!
//! # What's In It
//!
//! | Component | What it does |
//! | --------- | ------------ |
//! | [`TtlCache`] | Two-tier key/value cache: bounded memory tier with per-entry TTL and a best-effort persistent tier. |
//! | [`Deduplicator`] | Concurrent requests for one key share a single in-flight fetch and its outcome. |
//! | [`RequestOptimizer`] | Admission control with priorities, retries with exponential backoff, per-attempt timeouts. |
//! | [`RealtimeManager`] | Throttled, rate-limited and de-duplicated change subscriptions with automatic reconnects. |
//! | [`Telemetry`] | Named metric samples, aggregates and periodic reports. |
//! | [`Services`] | All of the above wired together for one tab and torn down as one. |
//!
//! # The Basics
//!
//! The crate doesn't know how to talk to a backend or where to persist anything. The environment hands these in as
//! capabilities:
//!
//! - [`DataSource`](traits::DataSource) runs table queries and opens change channels.
//! - [`PersistentStore`](traits::PersistentStore) is the string key/value storage behind the cache. Any failure of it is
//!   logged and otherwise ignored; [`NullStore`](storage::NullStore) stands in when there is none.
//! - [`BroadcastTransport`](traits::BroadcastTransport) carries accepted change events to sibling tabs. Without it
//!   subscriptions work in single-tab mode.
//!
//! Keys are plain strings of the form `namespace:id`; see the [`keys`] module for the namespaces in use. Invalidation
//! works on prefixes and substrings of those keys.
//!
//! ```ignore
//! let services = Services::<serde_json::Value>::create(
//!     ServicesConfig::default(),
//!     Capabilities::new(source).with_store(Arc::new(MokaStore::default())),
//! )?;
//!
//! let tournament = services
//!     .optimizer()
//!     .request(&keys::tournament(42), &RequestOptions::default(), move || api.tournament(42))
//!     .await?;
//!
//! let matches = services.realtime().subscribe(SubscriptionSpec::new("match").filter("tournament_id=eq.42"))?;
//! matches.wait_for_state(SubscriptionState::Connected).await?;
//! ```
//!
//! # Time
//!
//! Every timer in the crate runs on the tokio clock, so tests can pause and advance time deterministically. Background
//! tasks (the cache sweeper, report emission, subscription drivers) are only started when a tokio runtime is present.
//!
//! # Simulation
//!
//! With the `simulation` feature the crate carries a load simulation of several tabs sharing one backend. Run it with
//!
//! ```text
//! cargo run --example tourney --features simulation -- --tabs 4
//! ```

pub mod cache;
pub mod clock;
pub mod dedup;
pub mod entry;
pub mod error;
pub mod keys;
pub mod observer;
pub mod optimizer;
pub mod realtime;
pub mod retry;
pub mod services;
#[cfg(feature = "simulation")]
pub mod simulation;
pub mod storage;
pub mod telemetry;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::TtlCache;
#[doc(inline)]
pub use dedup::Deduplicator;
#[doc(inline)]
pub use error::{Error, FetchError};
#[doc(inline)]
pub use optimizer::RequestOptimizer;
#[doc(inline)]
pub use realtime::RealtimeManager;
#[doc(inline)]
pub use services::Services;
#[doc(inline)]
pub use telemetry::Telemetry;

pub mod prelude {
    pub use crate::cache::{CacheConfig, TtlCache};
    pub use crate::dedup::Deduplicator;
    pub use crate::error::{Error, FetchError};
    pub use crate::keys;
    pub use crate::optimizer::{BatchRequest, OptimizerConfig, RequestOptimizer, RequestOptions};
    pub use crate::realtime::{RealtimeConfig, RealtimeManager, Subscription, SubscriptionSpec};
    pub use crate::services::{Capabilities, Services, ServicesConfig};
    pub use crate::telemetry::{Telemetry, TelemetryConfig};
    pub use crate::traits::*;
    pub use crate::types::*;
}
