//! Chat store: the relational contract the notification tracker reads from.
//!
//! DESIGN
//! ======
//! `ChatStore` is the seam between the tracker and the hosted database. The
//! tracker only needs four operations: list a user's chats, fetch one chat,
//! stamp one side as read, and count messages newer than a cursor.
//! `PgChatStore` implements them with plain SQLx queries; tests substitute
//! in-memory stores.
//!
//! No retries live here. A failed query surfaces as `StoreError::Database`
//! and the caller decides whether to re-trigger.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::state::{Chat, Side};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat not found: {0}")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_CHAT_NOT_FOUND",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

/// Relational operations over the `chats` and `messages` tables.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// All chats where `user_id` is either participant.
    async fn chats_for_user(&self, user_id: Uuid) -> Result<Vec<Chat>, StoreError>;

    async fn chat_by_id(&self, chat_id: Uuid) -> Result<Option<Chat>, StoreError>;

    /// Set `side`'s read flag and stamp its read cursor with `at`.
    async fn mark_read(&self, chat_id: Uuid, side: Side, at: OffsetDateTime) -> Result<(), StoreError>;

    /// Messages in `chat_id` created strictly after `since`. `None` counts all.
    async fn count_messages_after(&self, chat_id: Uuid, since: Option<OffsetDateTime>) -> Result<u64, StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub(crate) const CHAT_COLUMNS: &str = "id, user_1, user_2, user_1_read, user_2_read, \
     user_1_read_at, user_2_read_at, created_at, updated_at";

pub(crate) type ChatTuple = (
    Uuid,
    Uuid,
    Uuid,
    bool,
    bool,
    Option<OffsetDateTime>,
    Option<OffsetDateTime>,
    OffsetDateTime,
    OffsetDateTime,
);

pub(crate) fn chat_from_tuple(row: ChatTuple) -> Chat {
    let (
        id,
        participant_a,
        participant_b,
        participant_a_read,
        participant_b_read,
        participant_a_read_at,
        participant_b_read_at,
        created_at,
        updated_at,
    ) = row;
    Chat {
        id,
        participant_a,
        participant_b,
        participant_a_read,
        participant_b_read,
        participant_a_read_at,
        participant_b_read_at,
        created_at,
        updated_at,
    }
}

/// Statement that marks one side of a chat read.
fn mark_read_sql(side: Side) -> &'static str {
    match side {
        Side::A => "UPDATE chats SET user_1_read = TRUE, user_1_read_at = $2 WHERE id = $1",
        Side::B => "UPDATE chats SET user_2_read = TRUE, user_2_read_at = $2 WHERE id = $1",
    }
}

/// [`ChatStore`] backed by a `PostgreSQL` pool.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn chats_for_user(&self, user_id: Uuid) -> Result<Vec<Chat>, StoreError> {
        let rows = sqlx::query_as::<_, ChatTuple>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE user_1 = $1 OR user_2 = $1 ORDER BY updated_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(chat_from_tuple).collect())
    }

    async fn chat_by_id(&self, chat_id: Uuid) -> Result<Option<Chat>, StoreError> {
        let row = sqlx::query_as::<_, ChatTuple>(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1"))
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(chat_from_tuple))
    }

    async fn mark_read(&self, chat_id: Uuid, side: Side, at: OffsetDateTime) -> Result<(), StoreError> {
        let result = sqlx::query(mark_read_sql(side))
            .bind(chat_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(chat_id));
        }
        Ok(())
    }

    async fn count_messages_after(&self, chat_id: Uuid, since: Option<OffsetDateTime>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages \
             WHERE chat_id = $1 AND ($2::timestamptz IS NULL OR created_at > $2)",
        )
        .bind(chat_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
