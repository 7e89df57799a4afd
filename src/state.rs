//! Shared chat types and the derived notification state.
//!
//! DESIGN
//! ======
//! `Chat` and `Message` mirror the `chats` and `messages` tables. Each chat
//! carries two independent read cursors, one per participant; `Side` picks
//! which one belongs to the user doing the evaluation. `NotificationState`
//! is the client-local projection the tracker publishes: never persisted,
//! always rebuilt from rows.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// CHAT
// =============================================================================

/// Which participant slot of a chat a user occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Stored as `user_1`.
    A,
    /// Stored as `user_2`.
    B,
}

impl Side {
    /// The opposite participant slot.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// A two-party conversation. Mirrors the `chats` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    pub participant_a_read: bool,
    pub participant_b_read: bool,
    pub participant_a_read_at: Option<OffsetDateTime>,
    pub participant_b_read_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Chat {
    /// Side occupied by `user_id`, or `None` if the user is not a participant.
    #[must_use]
    pub fn side_of(&self, user_id: Uuid) -> Option<Side> {
        if self.participant_a == user_id {
            Some(Side::A)
        } else if self.participant_b == user_id {
            Some(Side::B)
        } else {
            None
        }
    }

    #[must_use]
    pub fn participant(&self, side: Side) -> Uuid {
        match side {
            Side::A => self.participant_a,
            Side::B => self.participant_b,
        }
    }

    #[must_use]
    pub fn is_read_by(&self, side: Side) -> bool {
        match side {
            Side::A => self.participant_a_read,
            Side::B => self.participant_b_read,
        }
    }

    /// Read cursor for one side. `None` means the side has never read the chat.
    #[must_use]
    pub fn read_at(&self, side: Side) -> Option<OffsetDateTime> {
        match side {
            Side::A => self.participant_a_read_at,
            Side::B => self.participant_b_read_at,
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A single chat message. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// NOTIFICATION STATE
// =============================================================================

/// Unread conversations for one user.
///
/// Every key of `unread_count_by_chat` is also in `unread_chat_ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationState {
    pub unread_chat_ids: HashSet<Uuid>,
    pub unread_count_by_chat: HashMap<Uuid, u64>,
}

impl NotificationState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from `(chat_id, unread_count)` pairs. Pairs with a zero
    /// count are dropped: a chat with nothing newer than its cursor is not unread.
    #[must_use]
    pub fn from_counts<I>(counts: I) -> Self
    where
        I: IntoIterator<Item = (Uuid, u64)>,
    {
        let mut state = Self::new();
        for (chat_id, count) in counts {
            if count == 0 {
                continue;
            }
            state.unread_chat_ids.insert(chat_id);
            state.unread_count_by_chat.insert(chat_id, count);
        }
        state
    }

    #[must_use]
    pub fn is_unread(&self, chat_id: Uuid) -> bool {
        self.unread_chat_ids.contains(&chat_id)
    }

    /// Unread count for a chat, zero when the chat is not unread.
    #[must_use]
    pub fn unread_count(&self, chat_id: Uuid) -> u64 {
        self.unread_count_by_chat.get(&chat_id).copied().unwrap_or(0)
    }

    /// Sum of all per-chat counts, for badge display.
    #[must_use]
    pub fn total_unread(&self) -> u64 {
        self.unread_count_by_chat.values().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unread_chat_ids.is_empty()
    }

    /// Drop a chat from both the unread set and the count map.
    /// Returns whether the chat was unread.
    pub fn clear_chat(&mut self, chat_id: Uuid) -> bool {
        self.unread_count_by_chat.remove(&chat_id);
        self.unread_chat_ids.remove(&chat_id)
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// A chat between `a` and `b` where both sides are read and have no cursor.
    #[must_use]
    pub fn dummy_chat(a: Uuid, b: Uuid) -> Chat {
        let now = OffsetDateTime::now_utc();
        Chat {
            id: Uuid::new_v4(),
            participant_a: a,
            participant_b: b,
            participant_a_read: true,
            participant_b_read: true,
            participant_a_read_at: None,
            participant_b_read_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A message in `chat_id` from `sender_id` stamped at `created_at`.
    #[must_use]
    pub fn dummy_message(chat_id: Uuid, sender_id: Uuid, created_at: OffsetDateTime) -> Message {
        Message { id: Uuid::new_v4(), chat_id, sender_id, content: "hello".into(), created_at }
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
