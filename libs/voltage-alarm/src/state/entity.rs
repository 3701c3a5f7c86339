//! Per-entity alarm state
//!
//! `EntityState` is the unit of ownership and mutual exclusion. Every
//! mutation goes through [`EntityState::lock`], which returns a
//! [`LockedEntityState`] guard; the lock is released when the guard drops,
//! on every exit path. Ids and the emptiness flag are readable without the
//! lock.
//!
//! The lock is a `tokio::sync::Mutex` because the persistence write of a
//! mutation happens while it is held. Alarm events are published after the
//! guard is released, also when the write after an evaluation failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::persisted::PersistedEntityState;
use super::progress::AlarmRuleProgress;
use super::rules::{EntityRulesState, RulesEvaluation};
use crate::condition::{ConditionEvaluator, DataSnapshot};
use crate::error::{AlarmError, Result};
use crate::event::{AlarmEvent, AlarmRoutingResult};
use crate::ids::{AlarmRuleId, EntityId, TenantId};
use crate::message::{AlarmRuleRequestCtx, EntityMsg, MsgType};
use crate::rule::AlarmRule;
use crate::traits::{AlarmSink, PersistedStateStore};

/// Shared collaborators of every entity state
#[derive(Clone)]
pub struct EntityStateDeps {
    pub evaluator: Arc<dyn ConditionEvaluator>,
    pub store: Arc<dyn PersistedStateStore>,
    pub sink: Arc<dyn AlarmSink>,
}

struct EntityStateInner {
    profile_id: Option<EntityId>,
    rules: EntityRulesState,
    snapshot: DataSnapshot,
}

pub struct EntityState {
    tenant_id: TenantId,
    entity_id: EntityId,
    inner: Mutex<EntityStateInner>,
    empty: AtomicBool,
    retired: AtomicBool,
    store: Arc<dyn PersistedStateStore>,
    sink: Arc<dyn AlarmSink>,
}

impl std::fmt::Debug for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityState")
            .field("tenant_id", &self.tenant_id)
            .field("entity_id", &self.entity_id)
            .field("empty", &self.is_empty())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl EntityState {
    /// Create a state with rules already attached
    pub fn new(
        tenant_id: TenantId,
        entity_id: EntityId,
        profile_id: Option<EntityId>,
        rules: Vec<(Arc<AlarmRule>, AlarmRuleProgress)>,
        deps: &EntityStateDeps,
    ) -> Self {
        let mut rules_state = EntityRulesState::new(Arc::clone(&deps.evaluator));
        for (rule, progress) in rules {
            rules_state.insert(rule, progress);
        }
        let empty = rules_state.is_empty();

        Self {
            tenant_id,
            entity_id,
            inner: Mutex::new(EntityStateInner {
                profile_id,
                rules: rules_state,
                snapshot: DataSnapshot::new(),
            }),
            empty: AtomicBool::new(empty),
            retired: AtomicBool::new(false),
            store: Arc::clone(&deps.store),
            sink: Arc::clone(&deps.sink),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// No rules attached (lock-free read)
    pub fn is_empty(&self) -> bool {
        self.empty.load(Ordering::Acquire)
    }

    /// Evicted from the registry; accepts no further rules
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub async fn lock(&self) -> LockedEntityState<'_> {
        LockedEntityState {
            state: self,
            inner: self.inner.lock().await,
        }
    }

    /// Evaluate one message
    ///
    /// Returns `None` when the state was retired before the lock was taken.
    pub async fn process(
        &self,
        request_ctx: Option<&AlarmRuleRequestCtx>,
        msg: &EntityMsg,
    ) -> Result<Option<AlarmRoutingResult>> {
        let (result, events) = {
            let mut guard = self.lock().await;
            if guard.is_retired() {
                return Ok(None);
            }
            guard.process(request_ctx, msg).await?
        };
        self.publish(events).await;
        Ok(Some(result))
    }

    /// Advance time-based conditions and publish the resulting alarm events
    pub async fn harvest_alarms(&self, now: i64) -> EntityHarvest {
        let (events, persisted) = {
            let mut guard = self.lock().await;
            if guard.is_retired() {
                return EntityHarvest::default();
            }
            guard.harvest_alarms(now).await
        };
        let harvest = EntityHarvest {
            events: events.len(),
            persisted,
        };
        self.publish(events).await;
        harvest
    }

    pub async fn add_alarm_rule(&self, rule: Arc<AlarmRule>) -> Result<bool> {
        self.lock().await.add_alarm_rule(rule).await
    }

    pub async fn remove_alarm_rule(&self, rule_id: AlarmRuleId) -> Result<bool> {
        self.lock().await.remove_alarm_rule(rule_id).await
    }

    pub async fn alarm_rules(&self) -> Vec<Arc<AlarmRule>> {
        self.lock().await.alarm_rules()
    }

    async fn publish(&self, events: Vec<AlarmEvent>) {
        for event in events {
            if let Err(e) = self.sink.on_alarm_event(&event).await {
                warn!(
                    "[{}] [{}] Failed to publish alarm event {:?} of rule {}: {}",
                    self.tenant_id, self.entity_id, event.kind, event.rule_id, e
                );
            }
        }
    }
}

/// Outcome of one entity during a harvest sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityHarvest {
    pub events: usize,
    pub persisted: bool,
}

impl Default for EntityHarvest {
    fn default() -> Self {
        Self {
            events: 0,
            persisted: true,
        }
    }
}

/// Exclusive access to one entity state
pub struct LockedEntityState<'a> {
    state: &'a EntityState,
    inner: MutexGuard<'a, EntityStateInner>,
}

impl LockedEntityState<'_> {
    pub fn tenant_id(&self) -> TenantId {
        self.state.tenant_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.state.entity_id
    }

    pub fn profile_id(&self) -> Option<EntityId> {
        self.inner.profile_id
    }

    pub fn set_profile_id(&mut self, profile_id: Option<EntityId>) {
        self.inner.profile_id = profile_id;
    }

    pub fn alarm_rules(&self) -> Vec<Arc<AlarmRule>> {
        self.inner.rules.rules()
    }

    pub fn rule_ids(&self) -> Vec<AlarmRuleId> {
        self.inner.rules.rule_ids()
    }

    pub fn contains_rule(&self, rule_id: &AlarmRuleId) -> bool {
        self.inner.rules.contains(rule_id)
    }

    pub fn progress(&self, rule_id: &AlarmRuleId) -> Option<AlarmRuleProgress> {
        self.inner.rules.progress(rule_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rules.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.state.is_retired()
    }

    /// Mark the state as evicted; later rule additions are refused
    pub fn retire(&mut self) {
        self.state.retired.store(true, Ordering::Release);
    }

    /// Evaluate a message against every attached rule
    ///
    /// Returns the highest-priority routing result and the alarm events to
    /// publish once the lock is released.
    pub async fn process(
        &mut self,
        request_ctx: Option<&AlarmRuleRequestCtx>,
        msg: &EntityMsg,
    ) -> Result<(AlarmRoutingResult, Vec<AlarmEvent>)> {
        if !msg.msg_type.is_evaluated() {
            return Ok((AlarmRoutingResult::Success, Vec::new()));
        }

        let inner = &mut *self.inner;
        match msg.msg_type {
            MsgType::ActivityEvent => inner.snapshot.put("active", true.into(), msg.ts),
            MsgType::InactivityEvent => inner.snapshot.put("active", false.into(), msg.ts),
            _ => {},
        }
        inner.snapshot.merge(&msg.data, msg.ts);

        let evaluation = inner.rules.process(&inner.snapshot, msg.ts);
        let result = evaluation
            .transitions
            .iter()
            .map(|t| AlarmRoutingResult::from(t.transition.kind))
            .max()
            .unwrap_or_default();

        if evaluation.changed {
            self.persist_or_warn().await;
        }
        let events = self.events(evaluation, request_ctx);

        if let Some(ctx) = request_ctx.filter(|ctx| ctx.debug_mode) {
            info!(
                "[{}] [{}] Message {} routed as '{}' (rule chain {}, rule node {})",
                self.tenant_id(),
                self.entity_id(),
                msg.id,
                result,
                ctx.rule_chain_id,
                ctx.rule_node_id
            );
        }

        Ok((result, events))
    }

    /// Re-evaluate elapsed-time conditions at `now`
    ///
    /// Also returns whether the snapshot write, if one was needed, succeeded.
    pub async fn harvest_alarms(&mut self, now: i64) -> (Vec<AlarmEvent>, bool) {
        let evaluation = self.inner.rules.harvest(now);
        let persisted = !evaluation.changed || self.persist_or_warn().await;
        (self.events(evaluation, None), persisted)
    }

    /// Attach a newly matching rule with fresh progress
    ///
    /// Returns false when the state is retired. Attaching an already attached
    /// rule replaces its definition.
    pub async fn add_alarm_rule(&mut self, rule: Arc<AlarmRule>) -> Result<bool> {
        if self.is_retired() {
            return Ok(false);
        }
        if !self.inner.rules.update(Arc::clone(&rule)) {
            self.inner.rules.insert(rule, AlarmRuleProgress::default());
        }
        self.sync_empty();
        self.persist().await?;
        Ok(true)
    }

    /// Attach restored rules that are not attached yet
    ///
    /// Already attached rules keep their live progress. Returns the number of
    /// rules added.
    pub async fn add_restored_rules(
        &mut self,
        rules: Vec<(Arc<AlarmRule>, AlarmRuleProgress)>,
    ) -> Result<usize> {
        if self.is_retired() {
            return Ok(0);
        }
        let mut added = 0;
        for (rule, progress) in rules {
            if !self.inner.rules.contains(&rule.id) {
                self.inner.rules.insert(rule, progress);
                added += 1;
            }
        }
        if added > 0 {
            self.sync_empty();
            self.persist().await?;
        }
        Ok(added)
    }

    /// Detach one rule, returns whether it was attached
    pub async fn remove_alarm_rule(&mut self, rule_id: AlarmRuleId) -> Result<bool> {
        let removed = self.inner.rules.remove(&rule_id);
        if removed {
            self.sync_empty();
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Detach several rules, returns how many were attached
    pub async fn remove_alarm_rules(&mut self, rule_ids: &[AlarmRuleId]) -> Result<usize> {
        let removed = rule_ids
            .iter()
            .filter(|id| self.inner.rules.remove(id))
            .count();
        if removed > 0 {
            self.sync_empty();
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Replace an attached rule definition, keeping compatible progress
    pub async fn update_alarm_rule(&mut self, rule: Arc<AlarmRule>) -> Result<bool> {
        let updated = self.inner.rules.update(rule);
        if updated {
            self.persist().await?;
        }
        Ok(updated)
    }

    fn sync_empty(&self) {
        self.state
            .empty
            .store(self.inner.rules.is_empty(), Ordering::Release);
    }

    /// Persist after an evaluation; its alarm events are published either way
    async fn persist_or_warn(&self) -> bool {
        match self.persist().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[{}] [{}] Failed to persist alarm rule states: {}",
                    self.tenant_id(),
                    self.entity_id(),
                    e
                );
                false
            },
        }
    }

    /// Write the snapshot; an empty rule set is left to the evicting caller
    async fn persist(&self) -> Result<()> {
        if self.inner.rules.is_empty() {
            return Ok(());
        }
        let persisted = PersistedEntityState {
            tenant_id: self.tenant_id(),
            entity_id: self.entity_id(),
            alarm_states: self.inner.rules.to_persisted(),
        };
        debug!(
            "[{}] [{}] Persisting {} alarm rule states",
            persisted.tenant_id,
            persisted.entity_id,
            persisted.alarm_states.len()
        );
        self.state
            .store
            .put(&persisted)
            .await
            .map_err(AlarmError::store)
    }

    fn events(
        &self,
        evaluation: RulesEvaluation,
        request_ctx: Option<&AlarmRuleRequestCtx>,
    ) -> Vec<AlarmEvent> {
        evaluation
            .transitions
            .into_iter()
            .map(|t| AlarmEvent {
                alarm_id: t.transition.alarm.id,
                tenant_id: self.tenant_id(),
                originator: self.entity_id(),
                rule_id: t.rule.id,
                rule_name: t.rule.name.clone(),
                alarm_type: t.rule.alarm_type.clone(),
                kind: t.transition.kind,
                severity: t.transition.alarm.severity,
                previous_severity: t.transition.previous_severity,
                start_ts: t.transition.alarm.start_ts,
                end_ts: t.transition.alarm.end_ts,
                request_ctx: request_ctx.cloned(),
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::condition::{AlarmCondition, KeyFilter, KeyFilterEvaluator, NumericOperation};
    use crate::event::AlarmEventKind;
    use crate::memory::{MemoryAlarmSink, MemoryStateStore};
    use crate::rule::{
        AlarmRuleConfiguration, AlarmRuleEntityFilter, AlarmRuleTargetEntity, AlarmSeverity,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Fixture {
        deps: EntityStateDeps,
        store: Arc<MemoryStateStore>,
        sink: Arc<MemoryAlarmSink>,
        tenant: TenantId,
        device: EntityId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStateStore::unpartitioned());
        let sink = Arc::new(MemoryAlarmSink::new());
        Fixture {
            deps: EntityStateDeps {
                evaluator: Arc::new(KeyFilterEvaluator),
                store: store.clone(),
                sink: sink.clone(),
            },
            store,
            sink,
            tenant: TenantId::random(),
            device: EntityId::device(Uuid::new_v4()),
        }
    }

    fn rule(tenant: TenantId, device: EntityId, key: &str) -> Arc<AlarmRule> {
        let mut create_rules = BTreeMap::new();
        create_rules.insert(
            AlarmSeverity::Critical,
            AlarmCondition::simple(vec![KeyFilter::numeric(key, NumericOperation::Greater, 100.0)]),
        );
        Arc::new(AlarmRule {
            id: AlarmRuleId::random(),
            tenant_id: tenant,
            name: format!("{} high", key),
            alarm_type: format!("{}High", key),
            enabled: true,
            configuration: AlarmRuleConfiguration {
                source_entity_filters: vec![AlarmRuleEntityFilter::SingleEntity { entity_id: device }],
                alarm_target_entity: AlarmRuleTargetEntity::Originator,
                create_rules,
                clear_rule: Some(AlarmCondition::simple(vec![KeyFilter::numeric(
                    key,
                    NumericOperation::LessOrEqual,
                    100.0,
                )])),
            },
        })
    }

    #[tokio::test]
    async fn test_process_routes_highest_outcome_and_publishes() {
        let fx = fixture();
        let voltage = rule(fx.tenant, fx.device, "voltage");
        let current = rule(fx.tenant, fx.device, "current");
        let state = EntityState::new(
            fx.tenant,
            fx.device,
            None,
            vec![
                (voltage.clone(), AlarmRuleProgress::default()),
                (current.clone(), AlarmRuleProgress::default()),
            ],
            &fx.deps,
        );

        let msg = EntityMsg::telemetry(fx.device, 1_000, json!({"voltage": 120, "current": 10}));
        let result = state.process(None, &msg).await.unwrap();
        assert_eq!(result, Some(AlarmRoutingResult::Created));

        let msg = EntityMsg::telemetry(fx.device, 2_000, json!({"voltage": 90, "current": 150}));
        let result = state.process(None, &msg).await.unwrap();
        assert_eq!(result, Some(AlarmRoutingResult::Created));

        let events = fx.sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, AlarmEventKind::Created);
        assert!(events.iter().any(|e| e.kind == AlarmEventKind::Cleared && e.rule_id == voltage.id));

        let persisted = fx.store.get(fx.tenant, fx.device).unwrap();
        assert_eq!(persisted.alarm_states.len(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_lose_alarm_events() {
        let fx = fixture();
        let r = rule(fx.tenant, fx.device, "voltage");
        let state = EntityState::new(
            fx.tenant,
            fx.device,
            None,
            vec![(r.clone(), AlarmRuleProgress::default())],
            &fx.deps,
        );
        let msg = EntityMsg::telemetry(fx.device, 1_000, json!({"voltage": 50}));
        state.process(None, &msg).await.unwrap();

        fx.store.set_fail_writes(true);
        let msg = EntityMsg::telemetry(fx.device, 2_000, json!({"voltage": 120}));
        assert_eq!(
            state.process(None, &msg).await.unwrap(),
            Some(AlarmRoutingResult::Created)
        );

        fx.store.set_fail_writes(false);
        let msg = EntityMsg::telemetry(fx.device, 3_000, json!({"voltage": 130}));
        assert_eq!(
            state.process(None, &msg).await.unwrap(),
            Some(AlarmRoutingResult::Updated)
        );

        let kinds: Vec<_> = fx.sink.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AlarmEventKind::Created, AlarmEventKind::Updated]);
        let persisted = fx.store.get(fx.tenant, fx.device).unwrap();
        assert!(persisted.alarm_states.contains_key(&r.id.to_string()));
    }

    #[tokio::test]
    async fn test_unevaluated_message_type_is_success_without_persist() {
        let fx = fixture();
        let r = rule(fx.tenant, fx.device, "voltage");
        let state = EntityState::new(
            fx.tenant,
            fx.device,
            None,
            vec![(r, AlarmRuleProgress::default())],
            &fx.deps,
        );

        let msg = EntityMsg::telemetry(fx.device, 1, json!({"voltage": 500}))
            .with_type(MsgType::Other("RPC_CALL".to_string()));
        assert_eq!(
            state.process(None, &msg).await.unwrap(),
            Some(AlarmRoutingResult::Success)
        );
        assert!(fx.store.get(fx.tenant, fx.device).is_none());
        assert!(fx.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_remove_last_rule_marks_empty() {
        let fx = fixture();
        let r = rule(fx.tenant, fx.device, "voltage");
        let state = EntityState::new(
            fx.tenant,
            fx.device,
            None,
            vec![(r.clone(), AlarmRuleProgress::default())],
            &fx.deps,
        );
        assert!(!state.is_empty());
        assert!(state.remove_alarm_rule(r.id).await.unwrap());
        assert!(state.is_empty());
        assert!(!state.remove_alarm_rule(r.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retired_state_refuses_rules_and_messages() {
        let fx = fixture();
        let state = EntityState::new(fx.tenant, fx.device, None, vec![], &fx.deps);
        state.lock().await.retire();

        let r = rule(fx.tenant, fx.device, "voltage");
        assert!(!state.add_alarm_rule(r).await.unwrap());
        let msg = EntityMsg::telemetry(fx.device, 1, json!({"voltage": 500}));
        assert_eq!(state.process(None, &msg).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_activity_events_feed_active_flag() {
        let fx = fixture();
        let mut create_rules = BTreeMap::new();
        create_rules.insert(
            AlarmSeverity::Warning,
            AlarmCondition::simple(vec![KeyFilter::boolean(
                "active",
                crate::condition::BooleanOperation::Equal,
                false,
            )]),
        );
        let offline = Arc::new(AlarmRule {
            id: AlarmRuleId::random(),
            tenant_id: fx.tenant,
            name: "Offline".to_string(),
            alarm_type: "DeviceOffline".to_string(),
            enabled: true,
            configuration: AlarmRuleConfiguration {
                source_entity_filters: vec![AlarmRuleEntityFilter::SingleEntity {
                    entity_id: fx.device,
                }],
                alarm_target_entity: AlarmRuleTargetEntity::Originator,
                create_rules,
                clear_rule: None,
            },
        });
        let state = EntityState::new(
            fx.tenant,
            fx.device,
            None,
            vec![(offline, AlarmRuleProgress::default())],
            &fx.deps,
        );

        let msg = EntityMsg::telemetry(fx.device, 5, json!({})).with_type(MsgType::InactivityEvent);
        assert_eq!(
            state.process(None, &msg).await.unwrap(),
            Some(AlarmRoutingResult::Created)
        );
    }
}
