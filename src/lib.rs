//! Unread-conversation tracking for two-party chats.
//!
//! A [`NotificationTracker`] binds to one user, listens for message and chat
//! changes on that user's realtime channel and republishes a derived
//! [`NotificationState`]: which chats are unread and how many messages each
//! holds past the user's read cursor.

pub mod config;
pub mod db;
pub mod services;
pub mod state;

pub use services::realtime::{Hub, RealtimeFeed};
pub use services::store::{ChatStore, PgChatStore};
pub use services::tracker::{NotificationTracker, RefreshOutcome, TrackerError};
pub use state::NotificationState;
