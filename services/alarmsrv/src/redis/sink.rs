//! Alarm events published as JSON on `{prefix}:alarms`

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;
use voltage_alarm::{AlarmEvent, AlarmSink};

use super::{KeySpace, RedisPool};

pub struct RedisAlarmSink {
    pool: RedisPool,
    channel: String,
}

impl RedisAlarmSink {
    pub fn new(pool: RedisPool, keys: &KeySpace) -> Self {
        Self {
            pool,
            channel: keys.alarms(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl AlarmSink for RedisAlarmSink {
    async fn on_alarm_event(&self, event: &AlarmEvent) -> Result<()> {
        let message = serde_json::to_string(event).context("Failed to serialize alarm event")?;
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        let receivers: u32 = conn
            .publish(&self.channel, message)
            .await
            .with_context(|| format!("Failed to PUBLISH to channel: {}", self.channel))?;
        debug!(
            "[{}] [{}] Published {:?} alarm {} to {} subscribers",
            event.tenant_id, event.originator, event.kind, event.alarm_id, receivers
        );
        Ok(())
    }
}
