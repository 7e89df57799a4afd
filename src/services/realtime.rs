//! Realtime feed: row-change notifications scoped to per-user channels.
//!
//! DESIGN
//! ======
//! `RealtimeFeed` is the contract the tracker subscribes through. A
//! subscription names a channel key and a topic (table + change kind) and
//! yields opaque `ChangeEvent`s. The tracker never reads the payload beyond
//! "something changed"; it always does a full refresh.
//!
//! `Hub` is the in-process implementation: a map of channel key to
//! subscribers, fan-out by exact channel match. `spawn_pg_bridge` feeds the
//! hub from `LISTEN chat_changes`, republishing each row change onto the
//! channel of every participant of the affected chat.
//!
//! ERROR HANDLING
//! ==============
//! Delivery is best-effort, same as the websocket fan-out it replaces: a
//! subscriber whose queue is full misses the event. The next event still
//! triggers a full refresh, so nothing is lost permanently. Malformed notify
//! payloads are logged and skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Postgres notify channel written by the migration triggers.
pub const CHANGE_CHANNEL: &str = "chat_changes";

const BRIDGE_ERROR_PAUSE: Duration = Duration::from_secs(1);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("realtime feed closed")]
    Closed,
    #[error("malformed change payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RealtimeError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "E_REALTIME_CLOSED",
            Self::Payload(_) => "E_REALTIME_PAYLOAD",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Chats,
    Messages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Which row changes a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    pub table: Table,
    pub kind: ChangeKind,
}

impl Topic {
    pub const MESSAGE_INSERTED: Self = Self { table: Table::Messages, kind: ChangeKind::Insert };
    pub const CHAT_UPDATED: Self = Self { table: Table::Chats, kind: ChangeKind::Update };
}

/// One row change, as emitted by the notify triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub chat_id: Uuid,
    /// Users whose channels should hear about this change.
    #[serde(default)]
    pub participants: Vec<Uuid>,
}

impl ChangeEvent {
    #[must_use]
    pub fn topic(&self) -> Topic {
        Topic { table: self.table, kind: self.kind }
    }
}

/// Channel key for a user's notification stream.
#[must_use]
pub fn channel_key(user_id: Uuid) -> String {
    format!("notifications:{user_id}")
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Receiving end of one topic on one channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    topic: Topic,
    rx: mpsc::Receiver<ChangeEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    #[must_use]
    pub fn new(channel: impl Into<String>, topic: Topic, rx: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { channel: channel.into(), topic, rx, on_drop: None }
    }

    /// Run `cleanup` when the subscription is dropped.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(cleanup));
        self
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event, or `None` once the feed side is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.on_drop.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// FEED CONTRACT
// =============================================================================

#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    /// Subscribe to `topic` changes on exactly `channel`.
    async fn subscribe(&self, channel: &str, topic: Topic) -> Result<Subscription, RealtimeError>;
}

// =============================================================================
// HUB
// =============================================================================

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<ChangeEvent>,
}

type Registry = HashMap<String, HashMap<Uuid, Subscriber>>;

/// In-process fan-out keyed by channel.
#[derive(Clone)]
pub struct Hub {
    channels: Arc<Mutex<Registry>>,
    capacity: usize,
}

impl Hub {
    /// `capacity` bounds each subscriber's queue.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { channels: Arc::new(Mutex::new(HashMap::new())), capacity: capacity.max(1) }
    }

    /// Deliver `event` to subscribers of exactly `channel` whose topic
    /// matches. Returns how many subscribers accepted it.
    pub fn publish(&self, channel: &str, event: &ChangeEvent) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = channels.get(channel) else {
            return 0;
        };

        let topic = event.topic();
        let mut delivered = 0;
        for (subscription_id, sub) in subscribers {
            if sub.topic != topic {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%channel, %subscription_id, chat_id = %event.chat_id, "subscriber queue full; dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel).map_or(0, HashMap::len)
    }

    fn register(&self, channel: &str, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let subscription_id = Uuid::new_v4();
        {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(channel.to_owned())
                .or_default()
                .insert(subscription_id, Subscriber { topic, tx });
        }
        debug!(%channel, %subscription_id, ?topic, "realtime subscribed");

        let registry: Weak<Mutex<Registry>> = Arc::downgrade(&self.channels);
        let owned_channel = channel.to_owned();
        Subscription::new(channel, topic, rx).with_cleanup(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut channels = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(subscribers) = channels.get_mut(&owned_channel) {
                subscribers.remove(&subscription_id);
                if subscribers.is_empty() {
                    channels.remove(&owned_channel);
                }
            }
            debug!(channel = %owned_channel, %subscription_id, "realtime unsubscribed");
        })
    }
}

#[async_trait]
impl RealtimeFeed for Hub {
    async fn subscribe(&self, channel: &str, topic: Topic) -> Result<Subscription, RealtimeError> {
        Ok(self.register(channel, topic))
    }
}

// =============================================================================
// POSTGRES BRIDGE
// =============================================================================

/// Parse one `chat_changes` payload and publish it to every participant's
/// channel. Returns the number of deliveries.
///
/// # Errors
///
/// Returns `Payload` if the JSON does not describe a change event.
pub fn route_notification(hub: &Hub, payload: &str) -> Result<usize, RealtimeError> {
    let event: ChangeEvent = serde_json::from_str(payload)?;

    let mut participants = event.participants.clone();
    participants.sort_unstable();
    participants.dedup();

    Ok(participants
        .into_iter()
        .map(|user_id| hub.publish(&channel_key(user_id), &event))
        .sum())
}

/// Start listening on [`CHANGE_CHANNEL`] and forward notifications into `hub`.
/// Returns a handle for shutdown.
///
/// # Errors
///
/// Returns a database error if the listener cannot connect or `LISTEN` fails.
pub async fn spawn_pg_bridge(pool: &PgPool, hub: Hub) -> Result<JoinHandle<()>, RealtimeError> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    info!(channel = CHANGE_CHANNEL, "realtime bridge listening");

    Ok(tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => match route_notification(&hub, notification.payload()) {
                    Ok(delivered) => debug!(delivered, "change notification routed"),
                    Err(e) => warn!(error = %e, "skipping malformed change notification"),
                },
                Err(e) => {
                    // PgListener reconnects on the next recv.
                    warn!(error = %e, "realtime bridge receive failed");
                    tokio::time::sleep(BRIDGE_ERROR_PAUSE).await;
                }
            }
        }
    }))
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod tests;
