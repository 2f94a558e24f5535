use serde::{Deserialize, Serialize};
use std::pin::Pin;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tokio_stream::Stream;

/// A row as delivered by the data source. The core never looks inside except for the primary key column.
pub type Row = serde_json::Value;

/// Stream of messages produced by an open change channel.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChannelMessage> + Send>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    /// Bypasses the admission queue. May push concurrency over the configured bound.
    High,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, AsRefStr, EnumString, EnumIter, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Api,
    Render,
    Memory,
    Cache,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which change kinds a subscription is interested in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum EventMask {
    Insert,
    Update,
    Delete,
    #[default]
    #[strum(to_string = "*")]
    #[serde(rename = "*")]
    Any,
}

impl EventMask {
    #[inline]
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            Self::Any => true,
            Self::Insert => kind == ChangeKind::Insert,
            Self::Update => kind == ChangeKind::Update,
            Self::Delete => kind == ChangeKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection status transitions reported by a change channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(ChangePayload),
}

/// A single change event, `{new, old}` shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Source-assigned event identifier. Used to drop an event that arrives both from the network and from a sibling
    /// tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id:    Option<String>,
    pub kind:  ChangeKind,
    pub table: String,
    #[serde(default)]
    pub new:   Option<Row>,
    #[serde(default)]
    pub old:   Option<Row>,
}

impl ChangePayload {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            id:    None,
            kind:  ChangeKind::Insert,
            table: table.into(),
            new:   Some(row),
            old:   None,
        }
    }

    pub fn update(table: impl Into<String>, old: Row, new: Row) -> Self {
        Self {
            id:    None,
            kind:  ChangeKind::Update,
            table: table.into(),
            new:   Some(new),
            old:   Some(old),
        }
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self {
            id:    None,
            kind:  ChangeKind::Delete,
            table: table.into(),
            new:   None,
            old:   Some(old),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Identifies the change channel to open on the data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Unique per subscription instance.
    pub name:   String,
    pub table:  String,
    pub filter: Option<String>,
    pub events: EventMask,
}
