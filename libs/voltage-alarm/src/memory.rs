//! In-memory collaborator implementations
//!
//! Backends for tests and embedded single-process use. All of them are
//! safe to share across tasks.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

use crate::event::AlarmEvent;
use crate::ids::{AlarmRuleId, EntityId, TenantId};
use crate::partition::{PartitionOwnership, PartitionResolution, ServiceType, TopicPartitionInfo};
use crate::rule::AlarmRule;
use crate::state::PersistedEntityState;
use crate::traits::{
    AlarmSink, PageData, PageLink, PartitionResolver, PersistedStateStore, ProfileCache,
    QueueConsumer, QueueRecord, RuleSource,
};

// ========== Rule source ==========

/// Rule source backed by a map, with fetch counters
#[derive(Debug, Default)]
pub struct MemoryRuleSource {
    rules: DashMap<AlarmRuleId, AlarmRule>,
    find_by_id_calls: AtomicUsize,
    find_enabled_calls: AtomicUsize,
}

impl MemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, rule: AlarmRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn remove(&self, rule_id: &AlarmRuleId) -> Option<AlarmRule> {
        self.rules.remove(rule_id).map(|(_, rule)| rule)
    }

    pub fn set_enabled(&self, rule_id: &AlarmRuleId, enabled: bool) {
        if let Some(mut rule) = self.rules.get_mut(rule_id) {
            rule.enabled = enabled;
        }
    }

    pub fn find_by_id_calls(&self) -> usize {
        self.find_by_id_calls.load(Ordering::Relaxed)
    }

    /// Number of pages served
    pub fn find_enabled_calls(&self) -> usize {
        self.find_enabled_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RuleSource for MemoryRuleSource {
    async fn find_by_id(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<Option<AlarmRule>> {
        self.find_by_id_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .rules
            .get(&rule_id)
            .filter(|rule| rule.tenant_id == tenant_id)
            .map(|rule| rule.value().clone()))
    }

    async fn find_enabled(&self, tenant_id: TenantId, page: PageLink) -> Result<PageData<AlarmRule>> {
        self.find_enabled_calls.fetch_add(1, Ordering::Relaxed);
        if page.page_size == 0 {
            return Err(anyhow!("Page size must be positive"));
        }

        let mut enabled: Vec<AlarmRule> = self
            .rules
            .iter()
            .filter(|rule| rule.tenant_id == tenant_id && rule.enabled)
            .map(|rule| rule.value().clone())
            .collect();
        enabled.sort_by_key(|rule| rule.id);

        let start = page.page * page.page_size;
        let data: Vec<AlarmRule> = enabled.iter().skip(start).take(page.page_size).cloned().collect();
        Ok(PageData {
            has_next: start + data.len() < enabled.len(),
            data,
        })
    }
}

// ========== Profiles ==========

/// Entity → profile map
#[derive(Debug, Default)]
pub struct MemoryProfileCache {
    profiles: DashMap<(TenantId, EntityId), EntityId>,
}

impl MemoryProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tenant_id: TenantId, entity_id: EntityId, profile_id: EntityId) {
        self.profiles.insert((tenant_id, entity_id), profile_id);
    }

    pub fn remove(&self, tenant_id: TenantId, entity_id: EntityId) {
        self.profiles.remove(&(tenant_id, entity_id));
    }
}

#[async_trait]
impl ProfileCache for MemoryProfileCache {
    async fn get(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<Option<EntityId>> {
        Ok(self.profiles.get(&(tenant_id, entity_id)).map(|p| *p))
    }
}

// ========== Partitioning ==========

/// Hash partitioning over a fixed partition count
///
/// The partition is the FxHash of the entity UUID modulo the count;
/// "my partition" means the partition is in the shared ownership set.
pub struct HashPartitionResolver {
    topic: String,
    partitions: u32,
    ownership: Arc<PartitionOwnership>,
}

impl HashPartitionResolver {
    pub fn new(topic: impl Into<String>, partitions: u32, ownership: Arc<PartitionOwnership>) -> Self {
        Self {
            topic: topic.into(),
            partitions: partitions.max(1),
            ownership,
        }
    }

    pub fn partition_for(&self, entity_id: &EntityId) -> TopicPartitionInfo {
        let mut hasher = FxHasher::default();
        entity_id.id.hash(&mut hasher);
        let partition = (hasher.finish() % u64::from(self.partitions)) as u32;
        TopicPartitionInfo::new(self.topic.clone(), partition)
    }

    pub fn all_partitions(&self) -> HashSet<TopicPartitionInfo> {
        TopicPartitionInfo::all(&self.topic, self.partitions)
    }

    pub fn ownership(&self) -> &Arc<PartitionOwnership> {
        &self.ownership
    }
}

impl PartitionResolver for HashPartitionResolver {
    fn resolve(&self, _service_type: ServiceType, _tenant_id: TenantId, entity_id: EntityId) -> PartitionResolution {
        let tpi = self.partition_for(&entity_id);
        let my_partition = self.ownership.contains(&tpi);
        PartitionResolution { tpi, my_partition }
    }
}

// ========== Persisted state ==========

/// Snapshot store keyed by tenant and entity
///
/// `get_all` filters by partition through the resolver; an unpartitioned
/// store returns every snapshot.
#[derive(Default)]
pub struct MemoryStateStore {
    states: DashMap<(TenantId, EntityId), PersistedEntityState>,
    resolver: Option<Arc<dyn PartitionResolver>>,
    fail_writes: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new(resolver: Arc<dyn PartitionResolver>) -> Self {
        Self {
            resolver: Some(resolver),
            ..Self::default()
        }
    }

    pub fn unpartitioned() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: TenantId, entity_id: EntityId) -> Option<PersistedEntityState> {
        self.states.get(&(tenant_id, entity_id)).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of successful writes
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    /// Make subsequent `put` calls fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl PersistedStateStore for MemoryStateStore {
    async fn get_all(&self, tpi: &TopicPartitionInfo) -> Result<Vec<PersistedEntityState>> {
        Ok(self
            .states
            .iter()
            .filter(|s| match &self.resolver {
                Some(resolver) => {
                    &resolver
                        .resolve(ServiceType::AlarmRulesExecutor, s.tenant_id, s.entity_id)
                        .tpi
                        == tpi
                },
                None => true,
            })
            .map(|s| s.value().clone())
            .collect())
    }

    async fn put(&self, state: &PersistedEntityState) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(anyhow!("State store unavailable"));
        }
        self.states
            .insert((state.tenant_id, state.entity_id), state.clone());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<()> {
        self.states.remove(&(tenant_id, entity_id));
        Ok(())
    }
}

// ========== Queue ==========

#[derive(Default)]
struct QueueInner {
    partitions: HashMap<TopicPartitionInfo, VecDeque<Bytes>>,
    subscribed: HashSet<TopicPartitionInfo>,
    in_flight: Vec<QueueRecord>,
}

impl QueueInner {
    /// Put uncommitted records back at the head of their partitions
    fn requeue_in_flight(&mut self) {
        for record in self.in_flight.drain(..).rev() {
            self.partitions
                .entry(record.tpi)
                .or_default()
                .push_front(record.payload);
        }
    }

    fn take_batch(&mut self, max: usize) -> Vec<QueueRecord> {
        let mut subscribed: Vec<TopicPartitionInfo> = self.subscribed.iter().cloned().collect();
        subscribed.sort();

        let mut batch = Vec::new();
        for tpi in subscribed {
            let Some(queue) = self.partitions.get_mut(&tpi) else {
                continue;
            };
            while batch.len() < max {
                let Some(payload) = queue.pop_front() else {
                    break;
                };
                batch.push(QueueRecord {
                    tpi: tpi.clone(),
                    payload,
                });
            }
        }
        self.in_flight.extend(batch.iter().cloned());
        batch
    }
}

/// Partitioned in-memory queue
///
/// Polled records stay in flight until `commit`; subscribing or
/// unsubscribing first puts uncommitted records back.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    stopped: AtomicBool,
    max_poll_records: usize,
    commits: AtomicUsize,
}

impl MemoryQueue {
    pub fn new(max_poll_records: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            max_poll_records: max_poll_records.max(1),
            commits: AtomicUsize::new(0),
        }
    }

    pub fn send(&self, tpi: TopicPartitionInfo, payload: impl Into<Bytes>) {
        self.inner
            .lock()
            .partitions
            .entry(tpi)
            .or_default()
            .push_back(payload.into());
        self.notify.notify_waiters();
    }

    /// Records waiting in a partition, excluding in-flight ones
    pub fn pending(&self, tpi: &TopicPartitionInfo) -> usize {
        self.inner.lock().partitions.get(tpi).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn subscribed(&self) -> HashSet<TopicPartitionInfo> {
        self.inner.lock().subscribed.clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn subscribe(&self, partitions: &HashSet<TopicPartitionInfo>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.requeue_in_flight();
        inner.subscribed = partitions.clone();
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.requeue_in_flight();
        inner.subscribed.clear();
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<QueueRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return Err(anyhow!("Queue consumer stopped"));
            }
            let batch = self.inner.lock().take_batch(self.max_poll_records);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        self.inner.lock().in_flight.clear();
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

// ========== Sinks ==========

/// Collects alarm events in memory
#[derive(Debug, Default)]
pub struct MemoryAlarmSink {
    events: Mutex<Vec<AlarmEvent>>,
}

impl MemoryAlarmSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlarmEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl AlarmSink for MemoryAlarmSink {
    async fn on_alarm_event(&self, event: &AlarmEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Logs every alarm event at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlarmSink;

#[async_trait]
impl AlarmSink for LoggingAlarmSink {
    async fn on_alarm_event(&self, event: &AlarmEvent) -> Result<()> {
        info!(
            "[{}] [{}] Alarm {:?} {} ({}) severity {}",
            event.tenant_id, event.originator, event.kind, event.alarm_type, event.alarm_id, event.severity
        );
        Ok(())
    }
}
