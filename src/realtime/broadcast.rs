use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};
use crate::traits::BroadcastTransport;
use crate::types::ChangePayload;

/// What one tab tells its siblings about a change it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Tab the event came from. A tab ignores its own messages.
    pub origin:  String,
    pub table:   String,
    #[serde(default)]
    pub filter:  Option<String>,
    pub payload: ChangePayload,
}

impl BroadcastMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// In-process hub: every clone shares the same set of named channels.
///
/// Stands in for a browser's broadcast channel when several "tabs" live in one process.
#[derive(Clone)]
pub struct LocalBroadcast {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for LocalBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroadcast")
            .field("capacity", &self.capacity)
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl BroadcastTransport for LocalBroadcast {
    fn publish(&self, channel: &str, message: String) -> Result<(), Error> {
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(channel) {
            // Nobody listening is not an error.
            if tx.send(message).is_err() {
                trace!(channel, "broadcast without receivers");
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, Error> {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }
}

/// The transport of an environment without cross-tab messaging.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBroadcast;

impl BroadcastTransport for NoBroadcast {
    fn publish(&self, _channel: &str, _message: String) -> Result<(), Error> {
        Err(Error::BroadcastUnavailable("no cross-tab transport".into()))
    }

    fn subscribe(&self, _channel: &str) -> Result<broadcast::Receiver<String>, Error> {
        Err(Error::BroadcastUnavailable("no cross-tab transport".into()))
    }
}
