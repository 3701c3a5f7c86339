//! bb8 connection pool

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::RedisConfig;

pub type RedisPool = Arc<Pool<RedisConnectionManager>>;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Build the pool and check the server answers PING
pub async fn connect(config: &RedisConfig) -> Result<RedisPool> {
    let manager = RedisConnectionManager::new(config.url.as_str())
        .context("Failed to create Redis connection manager")?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .connection_timeout(CONNECTION_TIMEOUT)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .build(manager)
        .await
        .context("Failed to build Redis connection pool")?;

    {
        let mut conn = pool
            .get()
            .await
            .context("Failed to get connection from pool for testing")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .context("Failed to ping Redis server")?;
    }

    info!("Connected to Redis at {}", config.url);
    Ok(Arc::new(pool))
}
