//! Messaging service: start conversations, send and page messages.
//!
//! DESIGN
//! ======
//! These are the writes that move read cursors. Sending a message runs in
//! one transaction: the chat row is locked, the message inserted, the
//! recipient's read flag cleared and the sender's cursor advanced to the
//! message time. The notify triggers fire on commit, which is what wakes the
//! notification trackers of both participants.
//!
//! TRADE-OFFS
//! ==========
//! Replying counts as viewing the conversation: the sender's read flag is set
//! as part of the send. A user therefore never sees their own messages as
//! unread.

use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::services::store::{CHAT_COLUMNS, ChatTuple, chat_from_tuple};
use crate::state::{Chat, Message, Side};

pub const MAX_CONTENT_LEN: usize = 10_000;
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("chat not found: {0}")]
    ChatNotFound(Uuid),
    #[error("user {user_id} is not a participant of chat {chat_id}")]
    NotParticipant { chat_id: Uuid, user_id: Uuid },
    #[error("cannot start a chat with yourself")]
    SelfChat,
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {MAX_CONTENT_LEN} bytes")]
    ContentTooLong,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl MessagingError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ChatNotFound(_) => "E_CHAT_NOT_FOUND",
            Self::NotParticipant { .. } => "E_NOT_PARTICIPANT",
            Self::SelfChat => "E_SELF_CHAT",
            Self::EmptyContent => "E_EMPTY_CONTENT",
            Self::ContentTooLong => "E_CONTENT_TOO_LONG",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Trim and bound-check message content.
pub(crate) fn validate_content(content: &str) -> Result<&str, MessagingError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(MessagingError::EmptyContent);
    }
    if trimmed.len() > MAX_CONTENT_LEN {
        return Err(MessagingError::ContentTooLong);
    }
    Ok(trimmed)
}

pub(crate) fn clamp_page_size(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Current time at the precision Postgres stores, so the returned message
/// and the stamped read cursor compare equal to what is read back.
fn now_micros() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

/// Statement run after a send: clear the recipient, advance the sender.
fn after_send_sql(sender: Side) -> &'static str {
    match sender {
        Side::A => {
            "UPDATE chats SET user_2_read = FALSE, user_1_read = TRUE, user_1_read_at = $2, updated_at = $2 \
             WHERE id = $1"
        }
        Side::B => {
            "UPDATE chats SET user_1_read = FALSE, user_2_read = TRUE, user_2_read_at = $2, updated_at = $2 \
             WHERE id = $1"
        }
    }
}

// =============================================================================
// CHATS
// =============================================================================

/// Return the chat between two users, creating it if it does not exist.
/// The initiator lands on side A of a new chat.
///
/// # Errors
///
/// Returns `SelfChat` when both ids match, or a database error.
pub async fn start_chat(pool: &PgPool, initiator: Uuid, other: Uuid) -> Result<Chat, MessagingError> {
    if initiator == other {
        return Err(MessagingError::SelfChat);
    }

    let inserted = sqlx::query("INSERT INTO chats (id, user_1, user_2) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING")
        .bind(Uuid::new_v4())
        .bind(initiator)
        .bind(other)
        .execute(pool)
        .await?;

    let row = sqlx::query_as::<_, ChatTuple>(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats \
         WHERE (user_1 = $1 AND user_2 = $2) OR (user_1 = $2 AND user_2 = $1)"
    ))
    .bind(initiator)
    .bind(other)
    .fetch_one(pool)
    .await?;

    let chat = chat_from_tuple(row);
    if inserted.rows_affected() > 0 {
        info!(chat_id = %chat.id, %initiator, %other, "chat started");
    }
    Ok(chat)
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Send a message and move both read cursors in one transaction.
///
/// # Errors
///
/// Returns a validation error for empty or oversized content, `ChatNotFound`
/// or `NotParticipant` when the sender cannot post to the chat, or a
/// database error. Nothing is written on error.
pub async fn send_message(
    pool: &PgPool,
    chat_id: Uuid,
    sender_id: Uuid,
    content: &str,
) -> Result<Message, MessagingError> {
    let content = validate_content(content)?;

    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, ChatTuple>(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1 FOR UPDATE"))
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(chat) = row.map(chat_from_tuple) else {
        return Err(MessagingError::ChatNotFound(chat_id));
    };
    let Some(side) = chat.side_of(sender_id) else {
        return Err(MessagingError::NotParticipant { chat_id, user_id: sender_id });
    };

    let message = Message {
        id: Uuid::new_v4(),
        chat_id,
        sender_id,
        content: content.to_owned(),
        created_at: now_micros(),
    };

    sqlx::query("INSERT INTO messages (id, chat_id, sender_id, content, created_at) VALUES ($1, $2, $3, $4, $5)")
        .bind(message.id)
        .bind(message.chat_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

    sqlx::query(after_send_sql(side))
        .bind(chat_id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(%chat_id, message_id = %message.id, recipient = %chat.participant(side.other()), "message sent");
    Ok(message)
}

/// Page through a chat's messages, newest first. `before` excludes messages
/// at or after that instant; `limit` defaults to 50 and is capped at 200.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_messages(
    pool: &PgPool,
    chat_id: Uuid,
    limit: Option<i64>,
    before: Option<OffsetDateTime>,
) -> Result<Vec<Message>, MessagingError> {
    let rows = sqlx::query_as::<_, (Uuid, Uuid, Uuid, String, OffsetDateTime)>(
        "SELECT id, chat_id, sender_id, content, created_at FROM messages \
         WHERE chat_id = $1 AND ($2::timestamptz IS NULL OR created_at < $2) \
         ORDER BY created_at DESC, id DESC \
         LIMIT $3",
    )
    .bind(chat_id)
    .bind(before)
    .bind(clamp_page_size(limit))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, chat_id, sender_id, content, created_at)| Message { id, chat_id, sender_id, content, created_at })
        .collect())
}

#[cfg(test)]
#[path = "messaging_test.rs"]
mod tests;
