//! Persisted entity states, one hash per partition

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use voltage_alarm::{
    EntityId, PartitionResolver, PersistedEntityState, PersistedStateStore, ServiceType, TenantId,
    TopicPartitionInfo,
};

use super::{KeySpace, RedisPool};

pub struct RedisStateStore {
    pool: RedisPool,
    keys: KeySpace,
    resolver: Arc<dyn PartitionResolver>,
}

impl RedisStateStore {
    pub fn new(pool: RedisPool, keys: KeySpace, resolver: Arc<dyn PartitionResolver>) -> Self {
        Self {
            pool,
            keys,
            resolver,
        }
    }

    fn hash_key(&self, tenant_id: TenantId, entity_id: EntityId) -> String {
        let resolution = self
            .resolver
            .resolve(ServiceType::AlarmRulesExecutor, tenant_id, entity_id);
        self.keys.state(&resolution.tpi)
    }
}

#[async_trait]
impl PersistedStateStore for RedisStateStore {
    async fn get_all(&self, tpi: &TopicPartitionInfo) -> Result<Vec<PersistedEntityState>> {
        let key = self.keys.state(tpi);
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut *conn)
            .await
            .with_context(|| format!("Failed to HGETALL key: {}", key))?;

        Ok(raw
            .into_iter()
            .filter_map(|(field, json)| match serde_json::from_str(&json) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("[{}] Skipping corrupt alarm state {}: {}", tpi, field, e);
                    None
                },
            })
            .collect())
    }

    async fn put(&self, state: &PersistedEntityState) -> Result<()> {
        let key = self.hash_key(state.tenant_id, state.entity_id);
        let field = PersistedEntityState::key(state.tenant_id, state.entity_id);
        let json = serde_json::to_string(state).context("Failed to serialize alarm state")?;
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        redis::cmd("HSET")
            .arg(&key)
            .arg(&field)
            .arg(json)
            .query_async::<()>(&mut *conn)
            .await
            .with_context(|| format!("Failed to HSET field {} in key: {}", field, key))
    }

    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<()> {
        let key = self.hash_key(tenant_id, entity_id);
        let field = PersistedEntityState::key(tenant_id, entity_id);
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        redis::cmd("HDEL")
            .arg(&key)
            .arg(&field)
            .query_async::<()>(&mut *conn)
            .await
            .with_context(|| format!("Failed to HDEL field {} from key: {}", field, key))
    }
}
