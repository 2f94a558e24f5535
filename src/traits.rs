use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Error, FetchError};
use crate::types::{ChangeStream, ChannelSpec, Row};

/// Browser-local style key/value persistence.
///
/// Synchronous and best-effort: a write may be dropped under quota pressure and any call may fail. Callers never let
/// these failures escape.
pub trait PersistentStore: Send + Sync + 'static {
    /// Backend name, for logging.
    fn name(&self) -> &'static str;

    fn get_item(&self, key: &str) -> Result<Option<String>, Error>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), Error>;
    fn remove_item(&self, key: &str) -> Result<(), Error>;

    /// All keys currently held. Used for namespaced clears.
    fn keys(&self) -> Result<Vec<String>, Error>;
}

// For the remote backend which owns the tables.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// All current rows of `table` matching `filter`.
    async fn query(&self, table: &str, filter: Option<&str>) -> Result<Vec<Row>, FetchError>;

    /// Open a change channel. Connection status transitions arrive on the stream as
    /// [`ChannelMessage::Status`](crate::types::ChannelMessage::Status).
    async fn subscribe(&self, spec: &ChannelSpec) -> Result<ChangeStream, FetchError>;
}

/// Same-origin publish/subscribe of small JSON messages between sibling contexts (browser tabs).
///
/// No delivery or ordering guarantee. An implementation may be unavailable altogether; it then returns
/// [`Error::BroadcastUnavailable`] and the caller keeps working in single-tab mode.
pub trait BroadcastTransport: Send + Sync + 'static {
    fn publish(&self, channel: &str, message: String) -> Result<(), Error>;
    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, Error>;
}

/// Lets the real-time layer drop cached entries without knowing the cache's value type.
pub trait CacheInvalidation: Send + Sync + 'static {
    /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
    fn invalidate_namespace(&self, prefix: &str) -> usize;
}
