//! Database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! The watcher and the live-db tests use this module to create the shared
//! SQLx pool and enforce schema migrations before any chat query runs. The
//! migrations also install the `chat_changes` notify triggers the realtime
//! bridge listens on.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}
