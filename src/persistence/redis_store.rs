use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use super::{PersistedState, StateStore, StatusSnapshot};
use crate::Result;

/// Redis persistence for bot state
///
/// State and status are JSON strings under `stackbot:{tag}:state` and
/// `stackbot:{tag}:status`.
pub struct RedisStateStore {
    conn: ConnectionManager,
    state_key: String,
    status_key: String,
}

impl RedisStateStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `tag` - Bot instance tag used in key names
    pub async fn new(redis_url: &str, tag: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow::anyhow!("Redis connection timeout after 5 seconds"))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            state_key: Self::state_key(tag),
            status_key: format!("stackbot:{}:status", tag),
        })
    }

    pub fn state_key(tag: &str) -> String {
        format!("stackbot:{}:state", tag)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        conn.set::<_, _, ()>(key, json).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        self.get_json(&self.state_key).await
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        self.set_json(&self.state_key, state).await?;
        tracing::debug!("State saved to {}", self.state_key);
        Ok(())
    }

    async fn save_status(&self, status: &StatusSnapshot) -> Result<()> {
        self.set_json(&self.status_key, status).await
    }

    async fn load_status(&self) -> Result<Option<StatusSnapshot>> {
        self.get_json(&self.status_key).await
    }
}
