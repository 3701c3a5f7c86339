//! Partition ownership and rebalance handling
//!
//! The node owns a set of [`TopicPartitionInfo`]. Every live entity state
//! must resolve into that set; a [`PartitionChangeEvent`] moves the set and
//! the [`PartitionCoordinator`] brings the registry and the queue
//! subscription in line with it.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::service::AlarmRuleStateService;
use crate::traits::QueueConsumer;

/// One partition of a queue topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartitionInfo {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartitionInfo {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Every partition of a topic
    pub fn all(topic: &str, partitions: u32) -> HashSet<TopicPartitionInfo> {
        (0..partitions)
            .map(|p| TopicPartitionInfo::new(topic, p))
            .collect()
    }
}

impl fmt::Display for TopicPartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.topic, self.partition)
    }
}

/// Service whose partitions are being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    AlarmRulesExecutor,
}

/// Result of resolving an entity to its partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResolution {
    pub tpi: TopicPartitionInfo,
    pub my_partition: bool,
}

impl PartitionResolution {
    pub fn is_my_partition(&self) -> bool {
        self.my_partition
    }
}

/// Partition assignment change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionChangeEvent {
    pub service_type: ServiceType,
    pub partitions: HashSet<TopicPartitionInfo>,
}

impl PartitionChangeEvent {
    pub fn new(partitions: HashSet<TopicPartitionInfo>) -> Self {
        Self {
            service_type: ServiceType::AlarmRulesExecutor,
            partitions,
        }
    }
}

/// Partitions currently assigned to this node
#[derive(Debug, Default)]
pub struct PartitionOwnership {
    owned: RwLock<HashSet<TopicPartitionInfo>>,
}

impl PartitionOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tpi: &TopicPartitionInfo) -> bool {
        self.owned.read().contains(tpi)
    }

    pub fn snapshot(&self) -> HashSet<TopicPartitionInfo> {
        self.owned.read().clone()
    }

    /// Replace the owned set, returning `(added, removed)`
    pub fn replace(
        &self,
        partitions: HashSet<TopicPartitionInfo>,
    ) -> (HashSet<TopicPartitionInfo>, HashSet<TopicPartitionInfo>) {
        let mut owned = self.owned.write();
        let added = partitions.difference(&owned).cloned().collect();
        let removed = owned.difference(&partitions).cloned().collect();
        *owned = partitions;
        (added, removed)
    }
}

/// Summary of one handled partition change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub evicted: usize,
    pub restored: usize,
}

/// Applies partition change events
///
/// Events are handled one at a time; message processing for entities that
/// stay local is not blocked beyond their own per-entity lock.
pub struct PartitionCoordinator {
    service: Arc<AlarmRuleStateService>,
    consumer: Arc<dyn QueueConsumer>,
    serial: Mutex<()>,
}

impl PartitionCoordinator {
    pub fn new(service: Arc<AlarmRuleStateService>, consumer: Arc<dyn QueueConsumer>) -> Self {
        Self {
            service,
            consumer,
            serial: Mutex::new(()),
        }
    }

    pub async fn on_partition_change(&self, event: PartitionChangeEvent) -> PartitionChangeSummary {
        let _serial = self.serial.lock().await;

        if event.service_type != ServiceType::AlarmRulesExecutor {
            return PartitionChangeSummary::default();
        }

        let ctx = self.service.context();
        let (added, removed) = ctx.ownership.replace(event.partitions.clone());
        debug!(
            "Partition change: {} added, {} removed, {} owned",
            added.len(),
            removed.len(),
            event.partitions.len()
        );

        let evicted = self.service.evict_non_local_states().await;
        let restored = self.service.restore_partitions(&added).await;

        if let Err(e) = self.consumer.subscribe(&event.partitions).await {
            warn!("Failed to subscribe to alarm rule partitions: {}", e);
        }

        let summary = PartitionChangeSummary {
            added: added.len(),
            removed: removed.len(),
            evicted,
            restored,
        };
        info!(
            "Alarm rule partitions updated: +{} -{} (evicted {}, restored {})",
            summary.added, summary.removed, summary.evicted, summary.restored
        );
        summary
    }
}
