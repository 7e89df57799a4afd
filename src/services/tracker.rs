//! Notification tracker: unread conversations for one signed-in user.
//!
//! DESIGN
//! ======
//! One tracker per session, with an explicit lifecycle: `bind(user)`
//! subscribes to the user's "message inserted" and "chat updated" streams
//! and runs an initial refresh; `unbind()` cancels both. Every event
//! triggers a full refetch: list the user's chats, and for each chat whose
//! side is unread, count the messages newer than that side's read cursor.
//! Count queries run concurrently; the resulting `NotificationState` is
//! swapped in as a whole through a `watch` channel.
//!
//! CONCURRENCY
//! ===========
//! Refreshes may overlap (explicit calls racing event-driven ones). Each
//! refresh takes a ticket from a monotonically increasing counter when it
//! starts and may only commit if no newer ticket has committed and the
//! binding it started under is still current. A `mark_read` that writes the
//! flag retires every ticket issued before the write returned, so a refresh
//! that read the old flag cannot bring the chat back. `unbind` bumps the binding epoch, which
//! retires everything still in flight.
//!
//! The control block is a plain mutex and is never held across an await.
//!
//! ERROR HANDLING
//! ==============
//! A failed query fails the whole refresh (one failed count is enough) and
//! the previous state stays visible. Errors from explicit calls are returned;
//! errors from event-driven refreshes are logged and pushed to the optional
//! error sink. Nothing here retries on its own.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::try_join_all;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::realtime::{RealtimeError, RealtimeFeed, Subscription, Topic, channel_key};
use crate::services::store::{ChatStore, StoreError};
use crate::state::NotificationState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker is not bound to a user")]
    NotBound,
    #[error("chat not found: {0}")]
    ChatNotFound(Uuid),
    #[error("user {user_id} is not a participant of chat {chat_id}")]
    NotParticipant { chat_id: Uuid, user_id: Uuid },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

impl TrackerError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotBound => "E_NOT_BOUND",
            Self::ChatNotFound(_) => "E_CHAT_NOT_FOUND",
            Self::NotParticipant { .. } => "E_NOT_PARTICIPANT",
            Self::Store(e) => e.error_code(),
            Self::Realtime(e) => e.error_code(),
        }
    }
}

/// What happened to a refresh that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The result replaced the published state.
    Committed,
    /// A newer result, a local `mark_read`, or an unbind superseded it.
    Stale,
}

struct Binding {
    user_id: Uuid,
    events: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    binding: Option<Binding>,
    /// Bumped on every bind and unbind.
    epoch: u64,
    /// Last ticket handed out.
    issued: u64,
    /// Tickets at or below this value may no longer commit.
    retired: u64,
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    user_id: Uuid,
    epoch: u64,
    seq: u64,
}

struct Inner {
    store: Arc<dyn ChatStore>,
    feed: Arc<dyn RealtimeFeed>,
    control: Mutex<Control>,
    state: watch::Sender<NotificationState>,
    errors: Option<mpsc::Sender<TrackerError>>,
}

// =============================================================================
// TRACKER
// =============================================================================

/// Per-session unread tracker. Dropping it unbinds.
pub struct NotificationTracker {
    inner: Arc<Inner>,
}

impl NotificationTracker {
    /// Create an unbound tracker with empty state. Errors from event-driven
    /// refreshes go to `error_sink` when one is given.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        feed: Arc<dyn RealtimeFeed>,
        error_sink: Option<mpsc::Sender<TrackerError>>,
    ) -> Self {
        let (state, _) = watch::channel(NotificationState::default());
        Self {
            inner: Arc::new(Inner { store, feed, control: Mutex::new(Control::default()), state, errors: error_sink }),
        }
    }

    /// Bind to `user_id`: subscribe to both event streams, then refresh.
    /// An existing binding is dropped first.
    ///
    /// # Errors
    ///
    /// Returns a realtime error if subscribing fails (the tracker stays
    /// unbound). If the initial refresh fails its error is returned, but the
    /// tracker stays bound and the next event or `refresh()` tries again.
    pub async fn bind(&self, user_id: Uuid) -> Result<(), TrackerError> {
        self.unbind().await;

        let channel = channel_key(user_id);
        let messages = self.inner.feed.subscribe(&channel, Topic::MESSAGE_INSERTED).await?;
        let chats = self.inner.feed.subscribe(&channel, Topic::CHAT_UPDATED).await?;

        let epoch = {
            let mut control = self.inner.lock_control();
            control.epoch += 1;
            let epoch = control.epoch;
            let events = tokio::spawn(run_events(Arc::downgrade(&self.inner), epoch, messages, chats));
            if let Some(previous) = control.binding.replace(Binding { user_id, events }) {
                previous.events.abort();
            }
            epoch
        };
        info!(%user_id, %channel, epoch, "notification tracker bound");

        self.inner.refresh(Some(epoch)).await.map(|_| ())
    }

    /// Cancel subscriptions and clear the state. Refreshes and `mark_read`
    /// calls still in flight are discarded when they finish.
    pub async fn unbind(&self) {
        let previous = {
            let mut control = self.inner.lock_control();
            control.epoch += 1;
            control.retired = control.issued;
            let previous = control.binding.take();
            if previous.is_some() {
                self.inner.state.send_replace(NotificationState::default());
            }
            previous
        };

        if let Some(binding) = previous {
            binding.events.abort();
            if let Err(e) = binding.events.await {
                if e.is_panic() {
                    warn!(user_id = %binding.user_id, error = %e, "notification event loop panicked");
                }
            }
            info!(user_id = %binding.user_id, "notification tracker unbound");
        }
    }

    /// Refetch chats and unread counts for the bound user.
    ///
    /// # Errors
    ///
    /// Returns `NotBound` when unbound, or the first store error. The
    /// published state is unchanged on error.
    pub async fn refresh(&self) -> Result<RefreshOutcome, TrackerError> {
        self.inner.refresh(None).await
    }

    /// Mark `chat_id` read for the bound user, then drop it from the local
    /// state. Marking an already-read chat skips the remote write.
    ///
    /// # Errors
    ///
    /// Returns `NotBound`, `ChatNotFound`, `NotParticipant`, or a store error.
    /// Local state is only touched after the remote write succeeded.
    pub async fn mark_read(&self, chat_id: Uuid) -> Result<(), TrackerError> {
        self.inner.mark_read(chat_id).await
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> NotificationState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<NotificationState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn bound_user(&self) -> Option<Uuid> {
        self.inner.lock_control().binding.as_ref().map(|b| b.user_id)
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound_user().is_some()
    }
}

impl Drop for NotificationTracker {
    fn drop(&mut self) {
        let mut control = self.inner.lock_control();
        control.epoch += 1;
        if let Some(binding) = control.binding.take() {
            binding.events.abort();
        }
    }
}

// =============================================================================
// REFRESH / MARK READ
// =============================================================================

impl Inner {
    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out a ticket for the current binding. With `expected_epoch`,
    /// refuse if the binding has changed since the caller looked.
    fn issue_ticket(&self, expected_epoch: Option<u64>) -> Result<Option<Ticket>, TrackerError> {
        let mut control = self.lock_control();
        let Some(user_id) = control.binding.as_ref().map(|b| b.user_id) else {
            return Err(TrackerError::NotBound);
        };
        if expected_epoch.is_some_and(|epoch| epoch != control.epoch) {
            return Ok(None);
        }
        control.issued += 1;
        Ok(Some(Ticket { user_id, epoch: control.epoch, seq: control.issued }))
    }

    fn commit(&self, ticket: Ticket, next: NotificationState) -> RefreshOutcome {
        let mut control = self.lock_control();
        if control.binding.is_none() || control.epoch != ticket.epoch || ticket.seq <= control.retired {
            return RefreshOutcome::Stale;
        }
        control.retired = ticket.seq;
        self.state.send_replace(next);
        RefreshOutcome::Committed
    }

    async fn refresh(&self, expected_epoch: Option<u64>) -> Result<RefreshOutcome, TrackerError> {
        let Some(ticket) = self.issue_ticket(expected_epoch)? else {
            return Ok(RefreshOutcome::Stale);
        };

        match self.fetch_state(ticket.user_id).await {
            Ok(next) => {
                let unread = next.unread_chat_ids.len();
                let outcome = self.commit(ticket, next);
                debug!(user_id = %ticket.user_id, seq = ticket.seq, unread, ?outcome, "refresh finished");
                Ok(outcome)
            }
            Err(e) => {
                warn!(user_id = %ticket.user_id, seq = ticket.seq, error = %e, "refresh failed; keeping previous state");
                Err(e)
            }
        }
    }

    async fn fetch_state(&self, user_id: Uuid) -> Result<NotificationState, TrackerError> {
        let chats = self.store.chats_for_user(user_id).await?;

        let unread_sides: Vec<(Uuid, Option<OffsetDateTime>)> = chats
            .iter()
            .filter_map(|chat| {
                let side = chat.side_of(user_id)?;
                (!chat.is_read_by(side)).then_some((chat.id, chat.read_at(side)))
            })
            .collect();

        let counts = try_join_all(unread_sides.into_iter().map(|(chat_id, since)| async move {
            let count = self.store.count_messages_after(chat_id, since).await?;
            Ok::<_, StoreError>((chat_id, count))
        }))
        .await?;

        Ok(NotificationState::from_counts(counts))
    }

    async fn mark_read(&self, chat_id: Uuid) -> Result<(), TrackerError> {
        let (user_id, epoch) = {
            let control = self.lock_control();
            let Some(binding) = control.binding.as_ref() else {
                return Err(TrackerError::NotBound);
            };
            (binding.user_id, control.epoch)
        };

        let chat = self.store.chat_by_id(chat_id).await?.ok_or(TrackerError::ChatNotFound(chat_id))?;
        let side = chat.side_of(user_id).ok_or(TrackerError::NotParticipant { chat_id, user_id })?;

        let wrote = !chat.is_read_by(side);
        if wrote {
            self.store
                .mark_read(chat_id, side, OffsetDateTime::now_utc())
                .await
                .map_err(|e| match e {
                    StoreError::NotFound(id) => TrackerError::ChatNotFound(id),
                    other => TrackerError::Store(other),
                })?;
        } else {
            debug!(%chat_id, %user_id, "chat already read; skipping remote update");
        }

        let mut control = self.lock_control();
        if control.binding.is_none() || control.epoch != epoch {
            debug!(%chat_id, %user_id, "binding changed during mark_read; local state untouched");
            return Ok(());
        }
        // Only refreshes issued before the write can have read the old flag.
        if wrote {
            control.retired = control.retired.max(control.issued);
        }
        let changed = self.state.send_if_modified(|state| state.clear_chat(chat_id));
        info!(%chat_id, %user_id, changed, "chat marked read");
        Ok(())
    }

    fn report(&self, error: TrackerError) {
        let Some(sink) = &self.errors else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(e)) = sink.try_send(error) {
            warn!(error = %e, "tracker error sink full; dropping error");
        }
    }
}

// =============================================================================
// EVENT LOOP
// =============================================================================

/// Refresh on every event from either stream. Events that pile up while a
/// refresh runs collapse into the next one.
async fn run_events(inner: Weak<Inner>, epoch: u64, mut messages: Subscription, mut chats: Subscription) {
    loop {
        let event = tokio::select! {
            event = messages.recv() => event,
            event = chats.recv() => event,
        };
        let Some(tracker) = inner.upgrade() else {
            return;
        };
        let Some(event) = event else {
            warn!(channel = %messages.channel(), "realtime subscription closed");
            tracker.report(TrackerError::Realtime(RealtimeError::Closed));
            return;
        };

        let mut coalesced = 0usize;
        while messages.try_recv().is_some() || chats.try_recv().is_some() {
            coalesced += 1;
        }
        debug!(chat_id = %event.chat_id, topic = ?event.topic(), coalesced, "change event; refreshing");

        match tracker.refresh(Some(epoch)).await {
            Ok(_) => {}
            Err(TrackerError::NotBound) => return,
            Err(e) => tracker.report(e),
        }
    }
}

#[cfg(test)]
#[path = "tracker_test.rs"]
mod tests;
