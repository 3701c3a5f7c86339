//! Collaborator interfaces
//!
//! The engine consumes these traits only; backends return `anyhow::Result`
//! and the engine maps failures into [`AlarmError`](crate::AlarmError) at the
//! boundary.
//!
//! Implementations:
//! - `memory`: in-process backends for tests and embedded use
//! - `alarmsrv`: Redis state store, Redis queue consumer, YAML rule catalog

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;

use crate::event::AlarmEvent;
use crate::ids::{AlarmRuleId, EntityId, TenantId};
use crate::partition::{PartitionResolution, ServiceType, TopicPartitionInfo};
use crate::rule::AlarmRule;
use crate::state::PersistedEntityState;

// ========== Pagination ==========

/// Page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLink {
    pub page_size: usize,
    pub page: usize,
}

impl PageLink {
    pub fn new(page_size: usize) -> Self {
        Self { page_size, page: 0 }
    }

    pub fn next_page(&self) -> Self {
        Self {
            page_size: self.page_size,
            page: self.page + 1,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq)]
pub struct PageData<T> {
    pub data: Vec<T>,
    pub has_next: bool,
}

// ========== Rules and profiles ==========

/// Source of alarm rule definitions
#[async_trait]
pub trait RuleSource: Send + Sync + 'static {
    /// Fetch one rule, enabled or not
    async fn find_by_id(
        &self,
        tenant_id: TenantId,
        rule_id: AlarmRuleId,
    ) -> Result<Option<AlarmRule>>;

    /// Fetch one page of the tenant's enabled rules
    async fn find_enabled(&self, tenant_id: TenantId, page: PageLink)
        -> Result<PageData<AlarmRule>>;
}

/// Device or asset profile lookup
#[async_trait]
pub trait ProfileCache: Send + Sync + 'static {
    /// Profile id of the entity, `None` when unknown
    async fn get(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<Option<EntityId>>;
}

// ========== Persistence ==========

/// Durable per-entity snapshot storage
#[async_trait]
pub trait PersistedStateStore: Send + Sync + 'static {
    /// All snapshots of entities resolving to `tpi`
    async fn get_all(&self, tpi: &TopicPartitionInfo) -> Result<Vec<PersistedEntityState>>;

    /// Insert or replace an entity snapshot
    async fn put(&self, state: &PersistedEntityState) -> Result<()>;

    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<()>;
}

// ========== Partitioning ==========

/// Maps entities onto queue partitions
pub trait PartitionResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        service_type: ServiceType,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> PartitionResolution;
}

// ========== Queue ==========

/// One polled queue record
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub tpi: TopicPartitionInfo,
    pub payload: Bytes,
}

/// Inbound queue transport
///
/// Records returned by `poll` stay in flight until `commit`; re-subscribing
/// before commit redelivers them.
#[async_trait]
pub trait QueueConsumer: Send + Sync + 'static {
    /// Subscribe to exactly `partitions`
    async fn subscribe(&self, partitions: &HashSet<TopicPartitionInfo>) -> Result<()>;

    async fn unsubscribe(&self) -> Result<()>;

    /// Wait up to `timeout` for a batch, possibly empty
    async fn poll(&self, timeout: Duration) -> Result<Vec<QueueRecord>>;

    /// Acknowledge every record returned by previous polls
    async fn commit(&self) -> Result<()>;

    fn is_stopped(&self) -> bool;
}

// ========== Output ==========

/// Downstream receiver of alarm lifecycle events
#[async_trait]
pub trait AlarmSink: Send + Sync + 'static {
    async fn on_alarm_event(&self, event: &AlarmEvent) -> Result<()>;
}
