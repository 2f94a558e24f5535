use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use super::broadcast::BroadcastMessage;
use super::throttle::{Debouncer, RateLimiter};
use super::RealtimeInner;
use crate::error::{Error, FetchError, Result};
use crate::keys;
use crate::observer::{ListenerHandle, Listeners};
use crate::types::{
    ChangeKind, ChangePayload, ChangeStream, ChannelMessage, ChannelSpec, ChannelStatus, EventMask, MetricCategory, Row,
    SubscriptionState,
};

// Events remembered for duplicate suppression.
const RECENT_EVENTS: usize = 512;
// A copy of an event arriving later than this is treated as a new event.
const DUPLICATE_HORIZON: Duration = Duration::from_secs(10);

/// What to subscribe to: a table, an optional opaque filter and the change kinds of interest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSpec {
    table:  String,
    filter: Option<String>,
    events: EventMask,
}

impl SubscriptionSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table:  table.into(),
            filter: None,
            events: EventMask::Any,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn events(mut self, events: EventMask) -> Self {
        self.events = events;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter_str(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn event_mask(&self) -> EventMask {
        self.events
    }
}

/// Consumer-facing state of a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSnapshot {
    pub rows:        Vec<Row>,
    /// True until the first full fetch completes.
    pub loading:     bool,
    pub error:       Option<Error>,
    pub state:       SubscriptionState,
    pub retry_count: u32,
    /// Latest delivered event.
    pub last_event:  Option<ChangePayload>,
    /// Number of deliveries so far. Coalesced events count once.
    pub deliveries:  u64,
}

#[derive(Debug)]
pub(super) enum Command {
    Refresh(oneshot::Sender<Result<()>>),
    Reconnect,
    Close,
}

/// Handle of one live subscription.
///
/// Dropping the handle, or calling [`Subscription::unsubscribe`], stops the subscription: the change channel is
/// released and no throttle or retry timer of it fires afterwards.
pub struct Subscription {
    id:        u64,
    channel:   String,
    spec:      SubscriptionSpec,
    snapshot:  watch::Receiver<SubscriptionSnapshot>,
    listeners: Listeners<ChangePayload>,
    commands:  mpsc::UnboundedSender<Command>,
    task:      Option<JoinHandle<()>>,
}

impl Subscription {
    pub(super) fn new(
        id: u64,
        channel: String,
        spec: SubscriptionSpec,
        snapshot: watch::Receiver<SubscriptionSnapshot>,
        listeners: Listeners<ChangePayload>,
        commands: mpsc::UnboundedSender<Command>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            channel,
            spec,
            snapshot,
            listeners,
            commands,
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the change channel, unique per subscription.
    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that sees every snapshot update.
    pub fn watch(&self) -> watch::Receiver<SubscriptionSnapshot> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> SubscriptionState {
        self.snapshot.borrow().state
    }

    pub fn rows(&self) -> Vec<Row> {
        self.snapshot.borrow().rows.clone()
    }

    /// Wait until the subscription reaches `state`.
    pub async fn wait_for_state(&self, state: SubscriptionState) -> Result<()> {
        let mut rx = self.snapshot.clone();
        rx.wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| Error::SubscriptionClosed)
    }

    /// Call `callback` with every delivered (throttled) event.
    pub fn on_event<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&ChangePayload) + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    /// Re-read all rows from the data source. Connection state is left alone.
    pub async fn refresh(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Refresh(tx))
            .map_err(|_| Error::SubscriptionClosed)?;
        rx.await.map_err(|_| Error::SubscriptionClosed)?
    }

    /// Drop the current channel and open a new one, cancelling any scheduled retry and resetting the retry count.
    pub fn reconnect(&self) -> Result<()> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| Error::SubscriptionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.commands.send(Command::Close);
            task.abort();
            self.listeners.clear();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}

// Bounded, short-lived memory of accepted events, oldest forgotten first.
struct RecentEvents {
    order: VecDeque<(String, Instant)>,
    keys:  HashSet<String>,
}

impl RecentEvents {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(RECENT_EVENTS),
            keys:  HashSet::with_capacity(RECENT_EVENTS),
        }
    }

    fn contains(&mut self, key: &str, now: Instant) -> bool {
        self.forget_older_than(now);
        self.keys.contains(key)
    }

    fn insert(&mut self, key: String, now: Instant) {
        self.forget_older_than(now);
        if self.keys.contains(&key) {
            return;
        }
        if self.order.len() >= RECENT_EVENTS {
            if let Some((old, _)) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back((key, now));
    }

    fn forget_older_than(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < DUPLICATE_HORIZON {
                break;
            }
            self.keys.remove(key);
            self.order.pop_front();
        }
    }
}

// Identity of an event for duplicate suppression: the backend id when there is one, otherwise its content.
fn event_key(payload: &ChangePayload, primary_key: &str) -> String {
    if let Some(id) = payload.id.as_deref() {
        return format!("id:{id}");
    }
    let row = |row: Option<&Row>| row.map(Row::to_string).unwrap_or_default();
    let row_id = payload
        .new
        .as_ref()
        .or(payload.old.as_ref())
        .and_then(|r| r.get(primary_key))
        .map(Row::to_string)
        .unwrap_or_default();
    format!(
        "{}|{}|{row_id}|{}|{}",
        payload.kind,
        payload.table,
        row(payload.new.as_ref()),
        row(payload.old.as_ref())
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Network,
    Peer,
}

/// The task behind a [`Subscription`]. It owns every timer of the subscription, so aborting the task cancels them all.
pub(super) struct Driver {
    id:         u64,
    shared:     Arc<RealtimeInner>,
    spec:       SubscriptionSpec,
    channel:    ChannelSpec,
    snapshot:   watch::Sender<SubscriptionSnapshot>,
    listeners:  Listeners<ChangePayload>,
    commands:   mpsc::UnboundedReceiver<Command>,
    visibility: watch::Receiver<bool>,
    peers:      Option<broadcast::Receiver<String>>,
    peer_topic: String,

    stream:      Option<ChangeStream>,
    rows:        Vec<Row>,
    loading:     bool,
    error:       Option<Error>,
    state:       SubscriptionState,
    retry_count: u32,
    retry_at:    Option<Instant>,
    counted:     bool,
    last_event:  Option<ChangePayload>,
    deliveries:  u64,
    debouncer:   Debouncer<ChangePayload>,
    limiter:     RateLimiter,
    seen:        RecentEvents,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: u64,
        shared: Arc<RealtimeInner>,
        spec: SubscriptionSpec,
        channel: ChannelSpec,
        snapshot: watch::Sender<SubscriptionSnapshot>,
        listeners: Listeners<ChangePayload>,
        commands: mpsc::UnboundedReceiver<Command>,
        peers: Option<broadcast::Receiver<String>>,
        peer_topic: String,
    ) -> Self {
        let config = &shared.config;
        let debouncer = Debouncer::new(config.throttle());
        let limiter = RateLimiter::per_second(config.max_events_per_second());
        let visibility = shared.visibility.subscribe();
        Self {
            id,
            spec,
            channel,
            snapshot,
            listeners,
            commands,
            visibility,
            peers,
            peer_topic,
            stream: None,
            rows: Vec::new(),
            loading: true,
            error: None,
            state: SubscriptionState::Disconnected,
            retry_count: 0,
            retry_at: None,
            counted: false,
            last_event: None,
            deliveries: 0,
            debouncer,
            limiter,
            seen: RecentEvents::new(),
            shared,
        }
    }

    pub(super) async fn run(mut self) {
        self.connect().await;

        let mut visibility_open = true;
        loop {
            let visible = *self.visibility.borrow();
            // Hidden tabs hold their queued deliveries.
            let flush_at = if visible { self.debouncer.deadline() } else { None };
            let retry_at = self.retry_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Refresh(reply)) => {
                        let result = self.refresh().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Reconnect) => self.reconnect().await,
                    Some(Command::Close) | None => break,
                },
                message = next_message(&mut self.stream), if self.stream.is_some() => self.on_channel_message(message),
                peer = next_peer(&mut self.peers), if self.peers.is_some() => self.on_peer_message(peer),
                _ = sleep_until(flush_at), if flush_at.is_some() => self.flush(),
                _ = sleep_until(retry_at), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.connect().await;
                }
                changed = self.visibility.changed(), if visibility_open => match changed {
                    Ok(()) => self.on_visibility_change().await,
                    Err(_) => visibility_open = false,
                },
            }
        }

        debug!(channel = %self.channel.name, "subscription closed");
    }

    async fn connect(&mut self) {
        self.release_channel();
        self.retry_at = None;
        self.state = SubscriptionState::Connecting;
        self.publish();
        debug!(
            table = %self.spec.table,
            filter = ?self.spec.filter,
            attempt = self.retry_count,
            "connecting"
        );

        // Full state first, then changes.
        if let Err(err) = self.load_rows().await {
            warn!(table = %self.spec.table, filter = ?self.spec.filter, %err, "initial fetch failed");
        }

        match self.shared.source.subscribe(&self.channel).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.publish();
            }
            Err(err) => self.connection_lost(err.into()),
        }
    }

    async fn reconnect(&mut self) {
        info!(table = %self.spec.table, filter = ?self.spec.filter, "manual reconnect");
        self.retry_count = 0;
        self.connect().await;
    }

    async fn load_rows(&mut self) -> Result<()> {
        let result = self
            .shared
            .source
            .query(&self.spec.table, self.spec.filter.as_deref())
            .await;
        self.loading = false;
        match result {
            Ok(rows) => {
                self.rows = rows;
                // A connection failure stays reported until the channel is back.
                if self.state == SubscriptionState::Connected {
                    self.error = None;
                }
                Ok(())
            }
            Err(err) => {
                let err = Error::from(err);
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn refresh(&mut self) -> Result<()> {
        let result = self.load_rows().await;
        self.publish();
        result
    }

    fn on_channel_message(&mut self, message: Option<ChannelMessage>) {
        match message {
            Some(ChannelMessage::Change(payload)) => self.on_change(payload, Origin::Network),
            Some(ChannelMessage::Status(ChannelStatus::Connected)) => self.connected(),
            Some(ChannelMessage::Status(ChannelStatus::Disconnected)) => {
                self.connection_lost(Error::from(FetchError::network("channel disconnected")))
            }
            Some(ChannelMessage::Status(ChannelStatus::Error(message))) => {
                self.connection_lost(Error::from(FetchError::network(message)))
            }
            None => self.connection_lost(Error::from(FetchError::network("channel closed"))),
        }
    }

    fn connected(&mut self) {
        if self.state == SubscriptionState::Connected {
            return;
        }
        info!(table = %self.spec.table, filter = ?self.spec.filter, channel = %self.channel.name, "subscribed");
        self.state = SubscriptionState::Connected;
        self.retry_count = 0;
        self.error = None;
        if !self.counted {
            self.counted = true;
            if let Some(telemetry) = self.shared.telemetry.as_ref() {
                telemetry.subscription_connected();
            }
        }
        self.publish();
    }

    fn connection_lost(&mut self, err: Error) {
        self.release_channel();
        let max_retries = self.shared.config.max_retries();

        let delay = self
            .shared
            .config
            .retry_delay()
            .saturating_mul(2u32.saturating_pow(self.retry_count));
        let retry_at = Instant::now().checked_add(delay).filter(|_| self.retry_count < max_retries);

        if let Some(retry_at) = retry_at {
            self.retry_count += 1;
            self.state = SubscriptionState::Reconnecting;
            self.retry_at = Some(retry_at);
            warn!(
                table = %self.spec.table,
                filter = ?self.spec.filter,
                attempt = self.retry_count,
                ?delay,
                %err,
                "channel failed, scheduling reconnect"
            );
        }
        else {
            self.state = SubscriptionState::Disconnected;
            self.retry_at = None;
            warn!(
                table = %self.spec.table,
                filter = ?self.spec.filter,
                attempts = self.retry_count + 1,
                %err,
                "channel failed, giving up"
            );
        }

        self.error = Some(err);
        self.publish();
    }

    fn release_channel(&mut self) {
        self.stream = None;
        if self.counted {
            self.counted = false;
            if let Some(telemetry) = self.shared.telemetry.as_ref() {
                telemetry.subscription_disconnected();
            }
        }
    }

    fn on_peer_message(&mut self, message: Result<String, broadcast::error::RecvError>) {
        let json = match message {
            Ok(json) => json,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(topic = %self.peer_topic, skipped, "fell behind on cross-tab messages");
                return;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(topic = %self.peer_topic, "cross-tab channel closed");
                self.peers = None;
                return;
            }
        };

        let message = match BroadcastMessage::from_json(&json) {
            Ok(message) => message,
            Err(err) => {
                debug!(topic = %self.peer_topic, %err, "ignoring malformed cross-tab message");
                return;
            }
        };

        if message.origin == self.shared.tab_id || message.table != self.spec.table || message.filter != self.spec.filter
        {
            return;
        }

        trace!(origin = %message.origin, "event from sibling tab");
        self.on_change(message.payload, Origin::Peer);
    }

    fn on_change(&mut self, payload: ChangePayload, origin: Origin) {
        if !self.spec.events.matches(payload.kind) {
            return;
        }

        let now = Instant::now();
        let primary_key = self.shared.config.primary_key();
        let key = event_key(&payload, &primary_key);
        if self.seen.contains(&key, now) {
            trace!(table = %self.spec.table, ?origin, "duplicate event");
            return;
        }

        // Only accepted events are remembered, so a copy dropped here may still come in from a sibling.
        if !self.limiter.try_acquire() {
            debug!(table = %self.spec.table, filter = ?self.spec.filter, ?origin, "event rate exceeded, dropping event");
            return;
        }
        self.seen.insert(key, now);

        apply_change(&mut self.rows, &payload, &primary_key);

        if origin == Origin::Network && self.peers.is_some() {
            self.share_with_peers(&payload);
        }

        self.debouncer.push(payload, now);
    }

    fn share_with_peers(&mut self, payload: &ChangePayload) {
        let message = BroadcastMessage {
            origin:  self.shared.tab_id.clone(),
            table:   self.spec.table.clone(),
            filter:  self.spec.filter.clone(),
            payload: payload.clone(),
        };
        let published = message
            .to_json()
            .and_then(|json| self.shared.broadcast.publish(&self.peer_topic, json));
        if let Err(err) = published {
            warn!(topic = %self.peer_topic, %err, "cross-tab publish failed");
        }
    }

    fn flush(&mut self) {
        let Some(settled) = self.debouncer.take(Instant::now())
        else {
            return;
        };

        self.deliveries += 1;
        self.last_event = Some(settled.value.clone());
        self.publish();
        self.listeners.emit(&settled.value);

        let prefix = keys::prefix(self.shared.config.namespace_of(&self.spec.table));
        for target in self.shared.invalidation.read().iter() {
            target.invalidate_namespace(&prefix);
        }

        if let Some(telemetry) = self.shared.telemetry.as_ref() {
            telemetry.track_metric(
                &self.spec.table,
                settled.lag.as_secs_f64() * 1000.0,
                MetricCategory::Realtime,
                Some(serde_json::json!({ "coalesced": settled.coalesced })),
            );
        }
    }

    async fn on_visibility_change(&mut self) {
        let visible = *self.visibility.borrow_and_update();
        if visible
            && !matches!(
                self.state,
                SubscriptionState::Connected | SubscriptionState::Connecting
            )
        {
            debug!(table = %self.spec.table, "visible again while not connected");
            self.reconnect().await;
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SubscriptionSnapshot {
            rows:        self.rows.clone(),
            loading:     self.loading,
            error:       self.error.clone(),
            state:       self.state,
            retry_count: self.retry_count,
            last_event:  self.last_event.clone(),
            deliveries:  self.deliveries,
        });
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.debouncer.cancel();
        self.release_channel();
        self.state = SubscriptionState::Disconnected;
        self.retry_at = None;
        self.publish();
        self.shared.forget(self.id);
    }
}

async fn next_message(stream: &mut Option<ChangeStream>) -> Option<ChannelMessage> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_peer(peers: &mut Option<broadcast::Receiver<String>>) -> Result<String, broadcast::error::RecvError> {
    match peers {
        Some(peers) => peers.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Apply a change to a row set keyed by `primary_key`: inserts append, updates replace, deletes remove.
pub fn apply_change(rows: &mut Vec<Row>, payload: &ChangePayload, primary_key: &str) {
    let position = |row: Option<&Row>, rows: &[Row]| {
        let id = row.and_then(|r| r.get(primary_key))?;
        rows.iter().position(|r| r.get(primary_key) == Some(id))
    };

    match payload.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(new) = payload.new.as_ref()
            else {
                return;
            };
            match position(Some(new), rows) {
                Some(index) => rows[index] = new.clone(),
                None => rows.push(new.clone()),
            }
        }
        ChangeKind::Delete => {
            if let Some(index) = position(payload.old.as_ref(), rows) {
                rows.remove(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_follow_changes() {
        let mut rows = vec![json!({"id": 1, "score": 0}), json!({"id": 2, "score": 0})];

        apply_change(&mut rows, &ChangePayload::insert("matches", json!({"id": 3, "score": 0})), "id");
        apply_change(
            &mut rows,
            &ChangePayload::update("matches", json!({"id": 1}), json!({"id": 1, "score": 2})),
            "id",
        );
        apply_change(&mut rows, &ChangePayload::delete("matches", json!({"id": 2})), "id");

        assert_eq!(rows, vec![json!({"id": 1, "score": 2}), json!({"id": 3, "score": 0})]);

        // A repeated insert does not duplicate the row.
        apply_change(&mut rows, &ChangePayload::insert("matches", json!({"id": 3, "score": 1})), "id");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], json!({"id": 3, "score": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_events_are_bounded() {
        let mut seen = RecentEvents::new();
        let now = Instant::now();
        assert!(!seen.contains("a", now));
        seen.insert("a".into(), now);
        assert!(seen.contains("a", now));
        for i in 0..RECENT_EVENTS {
            seen.insert(i.to_string(), now);
        }
        assert!(!seen.contains("a", now));
        assert_eq!(seen.order.len(), RECENT_EVENTS);

        seen.insert("b".into(), now);
        assert!(!seen.contains("b", now + DUPLICATE_HORIZON));
    }

    #[test]
    fn events_without_id_are_keyed_by_content() {
        let first = ChangePayload::insert("matches", json!({"id": 1, "score": 0}));
        let same = ChangePayload::insert("matches", json!({"id": 1, "score": 0}));
        let other = ChangePayload::insert("matches", json!({"id": 1, "score": 1}));

        assert_eq!(event_key(&first, "id"), event_key(&same, "id"));
        assert_ne!(event_key(&first, "id"), event_key(&other, "id"));
        assert_eq!(event_key(&first.clone().with_id("e1"), "id"), "id:e1");
    }
}
