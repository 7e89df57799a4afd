//! Runtime configuration parsed from environment variables.
//!
//! A `.env` file is loaded first when present (see `main.rs`), so every key
//! below can also live there.

use uuid::Uuid;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_REALTIME_SUBSCRIBER_CAPACITY: usize = 64;
pub const DEFAULT_TRACKER_ERROR_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl ConfigError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "E_CONFIG_MISSING",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    /// User whose notifications the watcher tracks.
    pub user_id: Uuid,
    pub db_max_connections: u32,
    /// Queue depth per realtime subscriber before events are dropped.
    pub realtime_subscriber_capacity: usize,
    /// Queue depth of the tracker's background error channel.
    pub tracker_error_capacity: usize,
}

impl AppConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    /// - `GIGCHAT_USER_ID` (UUID)
    ///
    /// Optional:
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `REALTIME_SUBSCRIBER_CAPACITY`: default 64
    /// - `TRACKER_ERROR_CAPACITY`: default 16
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or the user id is
    /// not a UUID.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. `from_env` delegates here.
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let raw_user = lookup("GIGCHAT_USER_ID").ok_or(ConfigError::Missing("GIGCHAT_USER_ID"))?;
        let user_id = Uuid::parse_str(raw_user.trim())
            .map_err(|_| ConfigError::Invalid { var: "GIGCHAT_USER_ID", value: raw_user.clone() })?;

        Ok(Self {
            database_url,
            user_id,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            realtime_subscriber_capacity: parse_or(
                &lookup,
                "REALTIME_SUBSCRIBER_CAPACITY",
                DEFAULT_REALTIME_SUBSCRIBER_CAPACITY,
            )
            .max(1),
            tracker_error_capacity: parse_or(&lookup, "TRACKER_ERROR_CAPACITY", DEFAULT_TRACKER_ERROR_CAPACITY).max(1),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
