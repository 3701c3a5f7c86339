//! Partitioned alarm rules queue on Redis lists
//!
//! Records are LMOVEd from the partition list into a per-partition
//! in-flight list on poll. Commit deletes the in-flight lists; subscribing
//! or unsubscribing first moves uncommitted records back to the head of
//! their partition list, so delivery is at least once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use voltage_alarm::{AlarmRuleStateMsg, QueueConsumer, QueueRecord, TopicPartitionInfo};

use super::{KeySpace, RedisPool};

/// Idle wait between empty polls
const IDLE_BACKOFF: Duration = Duration::from_millis(20);

pub struct RedisQueueConsumer {
    pool: RedisPool,
    keys: KeySpace,
    max_poll_records: usize,
    subscribed: Mutex<HashSet<TopicPartitionInfo>>,
    touched: Mutex<HashSet<TopicPartitionInfo>>,
    stopped: AtomicBool,
}

impl RedisQueueConsumer {
    pub fn new(pool: RedisPool, keys: KeySpace, max_poll_records: usize) -> Self {
        Self {
            pool,
            keys,
            max_poll_records: max_poll_records.max(1),
            subscribed: Mutex::new(HashSet::new()),
            touched: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn subscribed_sorted(&self) -> Vec<TopicPartitionInfo> {
        let mut partitions: Vec<TopicPartitionInfo> = self.subscribed.lock().iter().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Move in-flight leftovers of `tpi` back to the head of its list
    async fn requeue(&self, tpi: &TopicPartitionInfo) -> Result<usize> {
        let (queue, in_flight) = (self.keys.queue(tpi), self.keys.in_flight(tpi));
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        let mut moved = 0;
        loop {
            let record: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&in_flight)
                .arg(&queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut *conn)
                .await
                .with_context(|| format!("Failed to LMOVE from key: {}", in_flight))?;
            if record.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            debug!("[{}] Re-queued {} uncommitted alarm rules records", tpi, moved);
        }
        Ok(moved)
    }

    async fn take_batch(&self, max: usize) -> Result<Vec<QueueRecord>> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        let mut batch = Vec::new();
        for tpi in self.subscribed_sorted() {
            let (queue, in_flight) = (self.keys.queue(&tpi), self.keys.in_flight(&tpi));
            while batch.len() < max {
                let record: Option<Vec<u8>> = redis::cmd("LMOVE")
                    .arg(&queue)
                    .arg(&in_flight)
                    .arg("LEFT")
                    .arg("RIGHT")
                    .query_async(&mut *conn)
                    .await
                    .with_context(|| format!("Failed to LMOVE from key: {}", queue))?;
                let Some(payload) = record else {
                    break;
                };
                self.touched.lock().insert(tpi.clone());
                batch.push(QueueRecord {
                    tpi: tpi.clone(),
                    payload: Bytes::from(payload),
                });
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl QueueConsumer for RedisQueueConsumer {
    async fn subscribe(&self, partitions: &HashSet<TopicPartitionInfo>) -> Result<()> {
        // Dropped partitions hand their leftovers to the next owner
        let mut affected: HashSet<TopicPartitionInfo> = self.subscribed.lock().clone();
        affected.extend(partitions.iter().cloned());
        for tpi in &affected {
            self.requeue(tpi).await?;
        }
        self.touched.lock().clear();
        *self.subscribed.lock() = partitions.clone();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        for tpi in self.subscribed_sorted() {
            self.requeue(&tpi).await?;
        }
        self.touched.lock().clear();
        self.subscribed.lock().clear();
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<QueueRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stopped() {
                anyhow::bail!("Queue consumer stopped");
            }
            let batch = self.take_batch(self.max_poll_records).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(IDLE_BACKOFF.min(deadline - now)).await;
        }
    }

    async fn commit(&self) -> Result<()> {
        let touched: Vec<TopicPartitionInfo> = self.touched.lock().drain().collect();
        if touched.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = touched.iter().map(|tpi| self.keys.in_flight(tpi)).collect();
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        redis::cmd("DEL")
            .arg(&keys)
            .query_async::<()>(&mut *conn)
            .await
            .context("Failed to DEL in-flight alarm rules records")
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Publishes alarm rules records onto their partition lists
pub struct RedisQueueProducer {
    pool: RedisPool,
    keys: KeySpace,
}

impl RedisQueueProducer {
    pub fn new(pool: RedisPool, keys: KeySpace) -> Self {
        Self { pool, keys }
    }

    pub async fn send(&self, tpi: &TopicPartitionInfo, msg: &AlarmRuleStateMsg) -> Result<()> {
        let payload = msg.encode().context("Failed to encode alarm rules record")?;
        let key = self.keys.queue(tpi);
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get connection from pool")?;
        redis::cmd("RPUSH")
            .arg(&key)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .with_context(|| format!("Failed to RPUSH to key: {}", key))
    }
}
