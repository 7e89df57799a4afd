//! Domain services behind the notification tracker.
//!
//! ARCHITECTURE
//! ============
//! `store` and `realtime` are the two contracts the tracker depends on,
//! each with a Postgres-backed implementation. `messaging` owns the writes
//! that move read cursors. `tracker` composes the contracts into the
//! per-session unread view.

pub mod messaging;
pub mod realtime;
pub mod store;
pub mod tracker;
