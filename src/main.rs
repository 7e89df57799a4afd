use std::sync::Arc;

use gigchat::config::{AppConfig, ConfigError};
use gigchat::services::realtime::{Hub, RealtimeError, spawn_pg_bridge};
use gigchat::services::store::PgChatStore;
use gigchat::services::tracker::{NotificationTracker, TrackerError};
use gigchat::{db, state::NotificationState};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum WatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("realtime bridge failed: {0}")]
    Realtime(#[from] RealtimeError),
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        error!(error = %e, "gigchat exited");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WatchError> {
    let config = AppConfig::from_env()?;

    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    let hub = Hub::new(config.realtime_subscriber_capacity);
    let bridge = spawn_pg_bridge(&pool, hub.clone()).await?;

    let (error_tx, mut error_rx) = mpsc::channel::<TrackerError>(config.tracker_error_capacity);
    let tracker = NotificationTracker::new(Arc::new(PgChatStore::new(pool)), Arc::new(hub), Some(error_tx));

    let mut updates = tracker.watch();
    match tracker.bind(config.user_id).await {
        Ok(()) => {}
        Err(TrackerError::Realtime(e)) => return Err(e.into()),
        // Still bound; the next change event retries.
        Err(e) => warn!(error = %e, code = e.error_code(), "initial refresh failed"),
    }
    log_state(&tracker.state());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                log_state(&snapshot);
            }
            Some(e) = error_rx.recv() => {
                warn!(error = %e, code = e.error_code(), "background refresh failed");
            }
            signal = &mut shutdown => {
                signal?;
                info!("shutdown requested");
                break;
            }
        }
    }

    tracker.unbind().await;
    bridge.abort();
    Ok(())
}

fn log_state(state: &NotificationState) {
    let mut unread: Vec<String> = state
        .unread_chat_ids
        .iter()
        .map(|id| format!("{id}={}", state.unread_count(*id)))
        .collect();
    unread.sort();
    info!(
        chats = state.unread_chat_ids.len(),
        total = state.total_unread(),
        unread = %unread.join(","),
        "notification state"
    );
}
