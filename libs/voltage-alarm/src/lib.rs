//! VoltageEMS alarm rule engine
//!
//! Partitioned, stateful alarm evaluation: every device/asset of every
//! tenant is evaluated against the tenant's enabled alarm rules, and each
//! rule's alarm moves through Created → Updated → Severity Updated →
//! Cleared. Progress is persisted per entity so it survives restarts and
//! partition moves.
//!
//! # Architecture
//!
//! ```text
//! queue ──► IngestLoop ──► AlarmRuleStateService ──► EntityState ──► AlarmSink
//!              │ (semaphore pool,          │  ▲             │
//!              │  pack timeout)            │  │             └──► PersistedStateStore
//!              ▼                           ▼  │
//!         PartitionCoordinator ───► EntityStateRegistry ◄─── Harvester (1 min)
//!                                          ▲
//!                 RuleCatalog ──► RuleMembershipIndex
//! ```
//!
//! All process-wide state lives in one [`AlarmEngineContext`] passed by
//! `Arc`; there are no globals. Mutation of an entity state always holds
//! that entity's lock.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voltage_alarm::memory::*;
//! use voltage_alarm::{
//!     AlarmEngine, AlarmEngineConfig, Collaborators, KeyFilterEvaluator, PartitionChangeEvent,
//!     PartitionOwnership, SystemTimeProvider,
//! };
//!
//! # async fn demo() {
//! let ownership = Arc::new(PartitionOwnership::new());
//! let resolver = Arc::new(HashPartitionResolver::new("tb_alarm_rules", 10, ownership.clone()));
//! let queue = Arc::new(MemoryQueue::new(500));
//! let collaborators = Collaborators {
//!     rule_source: Arc::new(MemoryRuleSource::new()),
//!     device_profiles: Arc::new(MemoryProfileCache::new()),
//!     asset_profiles: Arc::new(MemoryProfileCache::new()),
//!     store: Arc::new(MemoryStateStore::new(resolver.clone())),
//!     resolver: resolver.clone(),
//!     sink: Arc::new(LoggingAlarmSink),
//!     evaluator: Arc::new(KeyFilterEvaluator),
//!     clock: Arc::new(SystemTimeProvider),
//! };
//!
//! let engine = AlarmEngine::new(AlarmEngineConfig::default(), collaborators, ownership, queue);
//! engine
//!     .on_partition_change(PartitionChangeEvent::new(resolver.all_partitions()))
//!     .await;
//! engine.start();
//! // ...
//! engine.stop().await;
//! # }
//! ```

pub mod catalog;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod harvest;
pub mod ids;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod message;
pub mod partition;
pub mod registry;
pub mod rule;
pub mod service;
pub mod state;
pub mod time;
pub mod traits;

pub use catalog::RuleCatalog;
pub use condition::{
    AlarmCondition, AlarmConditionSpec, BooleanOperation, ConditionEvaluator, DataSnapshot,
    KeyFilter, KeyFilterEvaluator, KeyFilterPredicate, NumericOperation, StringOperation,
};
pub use context::{AlarmEngineContext, Collaborators};
pub use engine::{AlarmEngine, AlarmEngineConfig};
pub use error::{AlarmError, Result};
pub use event::{AlarmEvent, AlarmEventKind, AlarmRoutingResult};
pub use filter::EntityFilterMatcher;
pub use harvest::{HarvestStats, Harvester};
pub use ids::{AlarmRuleId, EntityId, EntityType, TenantId};
pub use index::RuleMembershipIndex;
pub use ingest::{IngestLoop, PackStats};
pub use message::{AlarmRuleRequestCtx, AlarmRuleStateMsg, EntityInfo, EntityKind, EntityMsg, MsgType};
pub use partition::{
    PartitionChangeEvent, PartitionChangeSummary, PartitionCoordinator, PartitionOwnership,
    PartitionResolution, ServiceType, TopicPartitionInfo,
};
pub use registry::EntityStateRegistry;
pub use rule::{
    AlarmRule, AlarmRuleConfiguration, AlarmRuleEntityFilter, AlarmRuleTargetEntity,
    AlarmSeverity, EntitySearchDirection,
};
pub use service::AlarmRuleStateService;
pub use state::{AlarmRuleProgress, EntityHarvest, EntityState, PersistedEntityState};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use traits::{
    AlarmSink, PageData, PageLink, PartitionResolver, PersistedStateStore, ProfileCache,
    QueueConsumer, QueueRecord, RuleSource,
};
