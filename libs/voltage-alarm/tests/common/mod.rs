//! Shared fixture for alarm engine integration tests
//!
//! Wires an `AlarmEngine` over the in-memory collaborators with a manual
//! clock and a small partition count.

#![allow(clippy::disallowed_methods)]
#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;
use voltage_alarm::memory::{
    HashPartitionResolver, MemoryAlarmSink, MemoryProfileCache, MemoryQueue, MemoryRuleSource,
    MemoryStateStore,
};
use voltage_alarm::{
    AlarmCondition, AlarmEngine, AlarmEngineConfig, AlarmEngineContext, AlarmRoutingResult,
    AlarmRule, AlarmRuleConfiguration, AlarmRuleEntityFilter, AlarmRuleId, AlarmRuleStateMsg,
    AlarmRuleStateService, AlarmRuleTargetEntity, AlarmSeverity, AlarmSink, Collaborators,
    EntityId, EntityMsg, KeyFilter, KeyFilterEvaluator, ManualTimeProvider, NumericOperation,
    PartitionChangeEvent, PartitionChangeSummary, PartitionOwnership, QueueConsumer, TenantId,
    TopicPartitionInfo,
};

pub const TOPIC: &str = "tb_alarm_rules";
pub const PARTITIONS: u32 = 4;
pub const START_TS: i64 = 1_700_000_000_000;

pub struct Harness {
    pub tenant: TenantId,
    pub ownership: Arc<PartitionOwnership>,
    pub resolver: Arc<HashPartitionResolver>,
    pub rules: Arc<MemoryRuleSource>,
    pub devices: Arc<MemoryProfileCache>,
    pub assets: Arc<MemoryProfileCache>,
    pub store: Arc<MemoryStateStore>,
    pub sink: Arc<MemoryAlarmSink>,
    pub queue: Arc<MemoryQueue>,
    pub clock: Arc<ManualTimeProvider>,
    pub engine: AlarmEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AlarmEngineConfig::default())
    }

    pub fn with_config(config: AlarmEngineConfig) -> Self {
        let sink = Arc::new(MemoryAlarmSink::new());
        Self::build(config, sink.clone(), sink, |queue| queue as Arc<dyn QueueConsumer>)
    }

    /// Harness whose engine publishes to `sink` instead of the recording sink
    pub fn with_sink(config: AlarmEngineConfig, sink: Arc<dyn AlarmSink>) -> Self {
        Self::build(config, sink, Arc::new(MemoryAlarmSink::new()), |queue| queue as Arc<dyn QueueConsumer>)
    }

    /// Harness whose engine consumes through a wrapper around the queue
    pub fn with_consumer(
        config: AlarmEngineConfig,
        wrap: impl FnOnce(Arc<MemoryQueue>) -> Arc<dyn QueueConsumer>,
    ) -> Self {
        let sink = Arc::new(MemoryAlarmSink::new());
        Self::build(config, sink.clone(), sink, wrap)
    }

    fn build(
        config: AlarmEngineConfig,
        engine_sink: Arc<dyn AlarmSink>,
        recording: Arc<MemoryAlarmSink>,
        wrap: impl FnOnce(Arc<MemoryQueue>) -> Arc<dyn QueueConsumer>,
    ) -> Self {
        let ownership = Arc::new(PartitionOwnership::new());
        let resolver = Arc::new(HashPartitionResolver::new(TOPIC, PARTITIONS, ownership.clone()));
        let rules = Arc::new(MemoryRuleSource::new());
        let devices = Arc::new(MemoryProfileCache::new());
        let assets = Arc::new(MemoryProfileCache::new());
        let store = Arc::new(MemoryStateStore::new(resolver.clone()));
        let queue = Arc::new(MemoryQueue::new(500));
        let clock = Arc::new(ManualTimeProvider::new(START_TS));

        let collaborators = Collaborators {
            rule_source: rules.clone(),
            device_profiles: devices.clone(),
            asset_profiles: assets.clone(),
            store: store.clone(),
            resolver: resolver.clone(),
            sink: engine_sink,
            evaluator: Arc::new(KeyFilterEvaluator),
            clock: clock.clone(),
        };
        let consumer = wrap(queue.clone());
        let engine = AlarmEngine::new(config, collaborators, ownership.clone(), consumer);

        Self {
            tenant: TenantId::random(),
            ownership,
            resolver,
            rules,
            devices,
            assets,
            store,
            sink: recording,
            queue,
            clock,
            engine,
        }
    }

    pub fn service(&self) -> &Arc<AlarmRuleStateService> {
        self.engine.service()
    }

    pub fn ctx(&self) -> &Arc<AlarmEngineContext> {
        self.engine.context()
    }

    pub async fn own(&self, partitions: HashSet<TopicPartitionInfo>) -> PartitionChangeSummary {
        self.engine
            .on_partition_change(PartitionChangeEvent::new(partitions))
            .await
    }

    pub async fn own_all(&self) -> PartitionChangeSummary {
        self.own(self.resolver.all_partitions()).await
    }

    /// Every partition except the one `entity` resolves to
    pub fn all_but(&self, entity: &EntityId) -> HashSet<TopicPartitionInfo> {
        let mut partitions = self.resolver.all_partitions();
        partitions.remove(&self.resolver.partition_for(entity));
        partitions
    }

    /// Store a rule in the rule source and return it
    pub fn add_rule(&self, rule: AlarmRule) -> AlarmRule {
        self.rules.put(rule.clone());
        rule
    }

    pub async fn telemetry(&self, entity: EntityId, data: Value) -> AlarmRoutingResult {
        let ts = self.clock.advance(1_000);
        self.service()
            .process(self.tenant, None, &EntityMsg::telemetry(entity, ts, data))
            .await
            .unwrap()
    }

    pub fn telemetry_record(&self, entity: EntityId, data: Value) -> AlarmRuleStateMsg {
        AlarmRuleStateMsg::Message {
            tenant_id: self.tenant,
            request_ctx: None,
            msg: EntityMsg::telemetry(entity, self.clock.advance(1_000), data),
        }
    }

    /// Publish a record on the partition its entity resolves to
    pub fn send(&self, msg: &AlarmRuleStateMsg) {
        let tpi = self.resolver.partition_for(&msg.entity_id());
        self.queue.send(tpi, msg.encode().unwrap());
    }

    /// Attached rule ids of a live entity state
    pub async fn attached(&self, entity: &EntityId) -> Option<Vec<AlarmRuleId>> {
        let state = self.ctx().registry.get(entity)?;
        let ids = state.lock().await.rule_ids();
        Some(ids)
    }

    /// Membership invariant for one entity: index and state agree
    pub async fn assert_membership_consistent(&self, entity: &EntityId, rule_ids: &[AlarmRuleId]) {
        let attached: HashSet<AlarmRuleId> =
            self.attached(entity).await.unwrap_or_default().into_iter().collect();
        for rule_id in rule_ids {
            assert_eq!(
                self.ctx().index.is_attached(rule_id, entity),
                attached.contains(rule_id),
                "index and state disagree on rule {} for {}",
                rule_id,
                entity
            );
        }
    }
}

pub fn device() -> EntityId {
    EntityId::device(Uuid::new_v4())
}

pub fn single(entity: EntityId) -> Vec<AlarmRuleEntityFilter> {
    vec![AlarmRuleEntityFilter::SingleEntity { entity_id: entity }]
}

/// MAJOR above 50, cleared below 30
pub fn temperature_rule(tenant_id: TenantId, filters: Vec<AlarmRuleEntityFilter>) -> AlarmRule {
    threshold_rule(tenant_id, filters, AlarmCondition::simple(vec![above(50.0)]))
}

pub fn threshold_rule(
    tenant_id: TenantId,
    filters: Vec<AlarmRuleEntityFilter>,
    create: AlarmCondition,
) -> AlarmRule {
    let mut create_rules = BTreeMap::new();
    create_rules.insert(AlarmSeverity::Major, create);
    AlarmRule {
        id: AlarmRuleId::random(),
        tenant_id,
        name: "High temperature".to_string(),
        alarm_type: "HighTemperature".to_string(),
        enabled: true,
        configuration: AlarmRuleConfiguration {
            source_entity_filters: filters,
            alarm_target_entity: AlarmRuleTargetEntity::Originator,
            create_rules,
            clear_rule: Some(AlarmCondition::simple(vec![KeyFilter::numeric(
                "temperature",
                NumericOperation::Less,
                30.0,
            )])),
        },
    }
}

pub fn above(threshold: f64) -> KeyFilter {
    KeyFilter::numeric("temperature", NumericOperation::Greater, threshold)
}

pub fn hot() -> Value {
    json!({"temperature": 75})
}

pub fn warm() -> Value {
    json!({"temperature": 40})
}

pub fn cold() -> Value {
    json!({"temperature": 10})
}
