//! Alarm rule state service
//!
//! Entry point for every inbound event: telemetry messages, entity
//! updates/deletions, rule notifications and partition moves. Entity states
//! are created lazily on the first message for an entity that has at least
//! one matching rule and resolves into an owned partition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::RuleCatalog;
use crate::context::AlarmEngineContext;
use crate::error::Result;
use crate::event::AlarmRoutingResult;
use crate::ids::{AlarmRuleId, EntityId, TenantId};
use crate::message::{AlarmRuleRequestCtx, AlarmRuleStateMsg, EntityInfo, EntityMsg};
use crate::partition::{ServiceType, TopicPartitionInfo};
use crate::rule::AlarmRule;
use crate::state::{AlarmRuleProgress, EntityState, PersistedEntityState};

pub struct AlarmRuleStateService {
    ctx: Arc<AlarmEngineContext>,
    catalog: RuleCatalog,
}

impl AlarmRuleStateService {
    pub fn new(ctx: Arc<AlarmEngineContext>) -> Self {
        Self {
            catalog: RuleCatalog::new(Arc::clone(&ctx)),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<AlarmEngineContext> {
        &self.ctx
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Dispatch a decoded queue record
    pub async fn handle(&self, msg: AlarmRuleStateMsg) -> Result<AlarmRoutingResult> {
        match msg {
            AlarmRuleStateMsg::EntityUpdate {
                tenant_id, entity, ..
            } => {
                self.process_entity_updated(tenant_id, &entity).await?;
                Ok(AlarmRoutingResult::Success)
            },
            AlarmRuleStateMsg::EntityDelete {
                tenant_id,
                entity_id,
                ..
            } => {
                self.process_entity_deleted(tenant_id, entity_id).await;
                Ok(AlarmRoutingResult::Success)
            },
            AlarmRuleStateMsg::Message {
                tenant_id,
                request_ctx,
                msg,
            } => self.process(tenant_id, request_ctx.as_ref(), &msg).await,
        }
    }

    // ========== Messages ==========

    /// Evaluate one message for its originator
    pub async fn process(
        &self,
        tenant_id: TenantId,
        request_ctx: Option<&AlarmRuleRequestCtx>,
        msg: &EntityMsg,
    ) -> Result<AlarmRoutingResult> {
        let entity_id = msg.originator;

        // A state evicted between lookup and lock is retired; look it up once more
        for _ in 0..2 {
            let state = match self.ctx.registry.get(&entity_id) {
                Some(state) => state,
                None => match self.create_state(tenant_id, entity_id).await? {
                    Some(state) => state,
                    None => return Ok(AlarmRoutingResult::Success),
                },
            };
            if let Some(result) = state.process(request_ctx, msg).await? {
                return Ok(result);
            }
        }

        debug!(
            "[{}] [{}] Entity state retired while processing message {}",
            tenant_id, entity_id, msg.id
        );
        Ok(AlarmRoutingResult::Success)
    }

    /// Build a state for an entity seen for the first time
    ///
    /// Returns `None` when the entity is not local or no rule matches it.
    async fn create_state(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<Option<Arc<EntityState>>> {
        let resolution = self
            .ctx
            .resolver
            .resolve(ServiceType::AlarmRulesExecutor, tenant_id, entity_id);
        if !resolution.is_my_partition() {
            debug!(
                "[{}] [{}] Skipping message for partition {} not owned by this node",
                tenant_id, entity_id, resolution.tpi
            );
            return Ok(None);
        }

        let rules = self.catalog.get_or_fetch(tenant_id).await?;
        let profile_id = self.ctx.matcher.resolve_profile(tenant_id, entity_id).await;
        let matching = self.ctx.matcher.matching_rules(entity_id, profile_id, &rules);
        if matching.is_empty() {
            return Ok(None);
        }

        let fresh = Arc::new(EntityState::new(
            tenant_id,
            entity_id,
            profile_id,
            matching
                .iter()
                .map(|rule| (Arc::clone(rule), AlarmRuleProgress::default()))
                .collect(),
            &self.ctx.deps,
        ));
        let (state, inserted) = self.ctx.registry.insert_if_absent(fresh);
        if inserted {
            self.ctx.index.register_entity(tenant_id, entity_id);
            for rule in &matching {
                self.ctx.index.attach(rule.id, entity_id);
            }
            debug!(
                "[{}] [{}] Created entity state with {} alarm rules",
                tenant_id,
                entity_id,
                matching.len()
            );
        }
        Ok(Some(state))
    }

    // ========== Entity lifecycle ==========

    /// Re-match rules after a device/asset update
    ///
    /// Only acts when the profile changed. Rules are recomputed from the
    /// catalog and diffed against the attached set under the entity lock; a
    /// state left empty is evicted and its snapshot removed.
    pub async fn process_entity_updated(&self, tenant_id: TenantId, entity: &EntityInfo) -> Result<()> {
        let entity_id = entity.id;
        let Some(state) = self.ctx.registry.get(&entity_id) else {
            return Ok(());
        };
        let rules = self.catalog.get_or_fetch(tenant_id).await?;

        let mut guard = state.lock().await;
        if guard.is_retired() || guard.profile_id() == Some(entity.profile_id) {
            return Ok(());
        }
        guard.set_profile_id(Some(entity.profile_id));

        let matching = self
            .ctx
            .matcher
            .matching_rules(entity_id, Some(entity.profile_id), &rules);
        let matching_ids: HashSet<AlarmRuleId> = matching.iter().map(|r| r.id).collect();
        let attached: HashSet<AlarmRuleId> = guard.rule_ids().into_iter().collect();

        for rule in matching.iter().filter(|r| !attached.contains(&r.id)) {
            if guard.add_alarm_rule(Arc::clone(rule)).await? {
                self.ctx.index.attach(rule.id, entity_id);
            }
        }

        let stale: Vec<AlarmRuleId> = attached.difference(&matching_ids).copied().collect();
        if !stale.is_empty() {
            guard.remove_alarm_rules(&stale).await?;
            for rule_id in &stale {
                self.ctx.index.detach(rule_id, &entity_id);
            }
        }

        if guard.is_empty() {
            info!(
                "[{}] [{}] No alarm rules match the updated entity, evicting",
                tenant_id, entity_id
            );
            self.ctx.evict(&state, &mut guard, true).await;
        }
        Ok(())
    }

    /// Drop the state of a deleted entity together with its snapshot
    pub async fn process_entity_deleted(&self, tenant_id: TenantId, entity_id: EntityId) {
        let Some(state) = self.ctx.registry.get(&entity_id) else {
            return;
        };
        let mut guard = state.lock().await;
        if guard.is_retired() {
            return;
        }
        self.ctx.evict(&state, &mut guard, true).await;
        debug!("[{}] [{}] Entity deleted, state evicted", tenant_id, entity_id);
    }

    // ========== Rule notifications ==========

    pub async fn create_alarm_rule(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<usize> {
        self.catalog.create(tenant_id, rule_id).await
    }

    pub async fn update_alarm_rule(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<usize> {
        self.catalog.update(tenant_id, rule_id).await
    }

    pub async fn delete_alarm_rule(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<usize> {
        self.catalog.delete(tenant_id, rule_id).await
    }

    pub async fn delete_tenant(&self, tenant_id: TenantId) -> Result<usize> {
        self.catalog.delete_tenant(tenant_id).await
    }

    // ========== Partition moves ==========

    /// Evict every state no longer resolving into an owned partition
    ///
    /// In memory only: snapshots stay for the next owner.
    pub async fn evict_non_local_states(&self) -> usize {
        let mut evicted = 0;
        for state in self.ctx.registry.snapshot() {
            if self.ctx.is_local(&state) {
                continue;
            }
            let mut guard = state.lock().await;
            if guard.is_retired() {
                continue;
            }
            self.ctx.evict(&state, &mut guard, false).await;
            evicted += 1;
        }
        evicted
    }

    /// Restore persisted states of newly owned partitions
    ///
    /// Returns the number of entity states materialized or extended.
    pub async fn restore_partitions(&self, partitions: &HashSet<TopicPartitionInfo>) -> usize {
        let mut restored = 0;
        for tpi in partitions {
            let states = match self.ctx.store.get_all(tpi).await {
                Ok(states) => states,
                Err(e) => {
                    warn!("[{}] Failed to load persisted alarm states: {}", tpi, e);
                    continue;
                },
            };
            debug!("[{}] Restoring {} persisted alarm states", tpi, states.len());
            for persisted in states {
                if self.restore_state(persisted).await {
                    restored += 1;
                }
            }
        }
        restored
    }

    /// Materialize one persisted state
    ///
    /// Rules gone from the catalog are dropped. If none remain the stale
    /// snapshot is removed. For an already live state only missing rules are
    /// attached, so restoring twice is the same as restoring once.
    pub async fn restore_state(&self, persisted: PersistedEntityState) -> bool {
        let PersistedEntityState {
            tenant_id,
            entity_id,
            alarm_states,
        } = persisted;

        if !self
            .ctx
            .resolver
            .resolve(ServiceType::AlarmRulesExecutor, tenant_id, entity_id)
            .is_my_partition()
        {
            return false;
        }

        let rules = match self.catalog.get_or_fetch(tenant_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    "[{}] [{}] Failed to fetch alarm rules on restore: {}",
                    tenant_id, entity_id, e
                );
                return false;
            },
        };

        let restored_rules = restored_progress(tenant_id, entity_id, &rules, &alarm_states);
        if restored_rules.is_empty() {
            debug!(
                "[{}] [{}] No persisted alarm rules left, removing snapshot",
                tenant_id, entity_id
            );
            if let Err(e) = self.ctx.store.remove(tenant_id, entity_id).await {
                warn!(
                    "[{}] [{}] Failed to remove stale alarm state: {}",
                    tenant_id, entity_id, e
                );
            }
            return false;
        }
        let rule_ids: Vec<AlarmRuleId> = restored_rules.iter().map(|(r, _)| r.id).collect();

        let state = match self.ctx.registry.get(&entity_id) {
            Some(existing) => existing,
            None => {
                let profile_id = self.ctx.matcher.resolve_profile(tenant_id, entity_id).await;
                let fresh = Arc::new(EntityState::new(
                    tenant_id,
                    entity_id,
                    profile_id,
                    restored_rules.clone(),
                    &self.ctx.deps,
                ));
                let (state, inserted) = self.ctx.registry.insert_if_absent(fresh);
                if inserted {
                    self.register(tenant_id, entity_id, &rule_ids);
                    return true;
                }
                state
            },
        };

        let mut guard = state.lock().await;
        match guard.add_restored_rules(restored_rules).await {
            Ok(added) => {
                if !guard.is_retired() {
                    self.register(tenant_id, entity_id, &guard.rule_ids());
                }
                added > 0
            },
            Err(e) => {
                warn!(
                    "[{}] [{}] Failed to restore alarm rules: {}",
                    tenant_id, entity_id, e
                );
                false
            },
        }
    }

    fn register(&self, tenant_id: TenantId, entity_id: EntityId, rule_ids: &[AlarmRuleId]) {
        self.ctx.index.register_entity(tenant_id, entity_id);
        for rule_id in rule_ids {
            self.ctx.index.attach(*rule_id, entity_id);
        }
    }
}

/// Pair persisted progress with the rules that are still enabled
fn restored_progress(
    tenant_id: TenantId,
    entity_id: EntityId,
    rules: &[Arc<AlarmRule>],
    alarm_states: &HashMap<String, String>,
) -> Vec<(Arc<AlarmRule>, AlarmRuleProgress)> {
    rules
        .iter()
        .filter_map(|rule| {
            let raw = alarm_states.get(&rule.id.to_string())?;
            let progress = AlarmRuleProgress::from_json(raw).unwrap_or_else(|e| {
                warn!(
                    "[{}] [{}] Corrupt progress for alarm rule {}, starting over: {}",
                    tenant_id, entity_id, rule.id, e
                );
                AlarmRuleProgress::default()
            });
            Some((Arc::clone(rule), progress))
        })
        .collect()
}
