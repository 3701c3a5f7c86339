//! Rule membership index
//!
//! Three derived mappings kept in line with entity state membership:
//!
//! - `rules_by_tenant`: tenant → (rule id → rule), the rule catalog cache
//! - `entity_ids_by_rule`: rule id → entities that have the rule attached
//! - `entity_ids_by_tenant`: tenant → entities with a live state
//!
//! Only ids are stored, never entity states. Updates are not covered by the
//! entity lock, so readers (rule fan-out) must tolerate missing or stale
//! targets. Accessors return owned copies; no map guard escapes a call.

use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ids::{AlarmRuleId, EntityId, TenantId};
use crate::rule::AlarmRule;

#[derive(Debug, Default)]
pub struct RuleMembershipIndex {
    rules_by_tenant: DashMap<TenantId, BTreeMap<AlarmRuleId, Arc<AlarmRule>>>,
    entity_ids_by_rule: DashMap<AlarmRuleId, DashSet<EntityId>>,
    entity_ids_by_tenant: DashMap<TenantId, DashSet<EntityId>>,
}

impl RuleMembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Tenant rule cache ==========

    /// Cached rules of a tenant, `None` if the tenant is not loaded
    pub fn tenant_rules(&self, tenant_id: &TenantId) -> Option<Vec<Arc<AlarmRule>>> {
        self.rules_by_tenant
            .get(tenant_id)
            .map(|rules| rules.values().cloned().collect())
    }

    pub fn is_tenant_loaded(&self, tenant_id: &TenantId) -> bool {
        self.rules_by_tenant.contains_key(tenant_id)
    }

    /// Cache a freshly fetched tenant rule set
    ///
    /// A set cached concurrently by another caller wins; the cached content
    /// is returned either way.
    pub fn insert_tenant_rules(
        &self,
        tenant_id: TenantId,
        rules: BTreeMap<AlarmRuleId, Arc<AlarmRule>>,
    ) -> Vec<Arc<AlarmRule>> {
        self.rules_by_tenant
            .entry(tenant_id)
            .or_insert(rules)
            .values()
            .cloned()
            .collect()
    }

    /// Insert or replace one rule of a tenant's cached set
    ///
    /// Returns false (and caches nothing) when the tenant is not loaded.
    pub fn put_rule(&self, rule: Arc<AlarmRule>) -> bool {
        match self.rules_by_tenant.get_mut(&rule.tenant_id) {
            Some(mut rules) => {
                rules.insert(rule.id, rule);
                true
            },
            None => false,
        }
    }

    pub fn contains_rule(&self, tenant_id: &TenantId, rule_id: &AlarmRuleId) -> bool {
        self.rules_by_tenant
            .get(tenant_id)
            .is_some_and(|rules| rules.contains_key(rule_id))
    }

    pub fn remove_rule(&self, tenant_id: &TenantId, rule_id: &AlarmRuleId) -> Option<Arc<AlarmRule>> {
        self.rules_by_tenant
            .get_mut(tenant_id)
            .and_then(|mut rules| rules.remove(rule_id))
    }

    /// Drop the tenant's cached rule set
    pub fn remove_tenant(&self, tenant_id: &TenantId) {
        self.rules_by_tenant.remove(tenant_id);
    }

    // ========== Rule → entities ==========

    pub fn attach(&self, rule_id: AlarmRuleId, entity_id: EntityId) {
        self.entity_ids_by_rule
            .entry(rule_id)
            .or_default()
            .insert(entity_id);
    }

    pub fn detach(&self, rule_id: &AlarmRuleId, entity_id: &EntityId) {
        self.entity_ids_by_rule
            .remove_if(rule_id, |_, entities| {
                entities.remove(entity_id);
                entities.is_empty()
            });
    }

    pub fn entities_for_rule(&self, rule_id: &AlarmRuleId) -> Vec<EntityId> {
        self.entity_ids_by_rule
            .get(rule_id)
            .map(|entities| entities.iter().map(|e| *e).collect())
            .unwrap_or_default()
    }

    /// Remove and return the entity set of a rule
    pub fn take_rule(&self, rule_id: &AlarmRuleId) -> Vec<EntityId> {
        self.entity_ids_by_rule
            .remove(rule_id)
            .map(|(_, entities)| entities.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_attached(&self, rule_id: &AlarmRuleId, entity_id: &EntityId) -> bool {
        self.entity_ids_by_rule
            .get(rule_id)
            .is_some_and(|entities| entities.contains(entity_id))
    }

    // ========== Tenant → entities ==========

    pub fn register_entity(&self, tenant_id: TenantId, entity_id: EntityId) {
        self.entity_ids_by_tenant
            .entry(tenant_id)
            .or_default()
            .insert(entity_id);
    }

    pub fn unregister_entity(&self, tenant_id: &TenantId, entity_id: &EntityId) {
        self.entity_ids_by_tenant
            .remove_if(tenant_id, |_, entities| {
                entities.remove(entity_id);
                entities.is_empty()
            });
    }

    pub fn tenant_entities(&self, tenant_id: &TenantId) -> Vec<EntityId> {
        self.entity_ids_by_tenant
            .get(tenant_id)
            .map(|entities| entities.iter().map(|e| *e).collect())
            .unwrap_or_default()
    }

    /// Remove an evicted entity from every reverse mapping
    pub fn purge_entity(&self, tenant_id: &TenantId, entity_id: &EntityId, rule_ids: &[AlarmRuleId]) {
        for rule_id in rule_ids {
            self.detach(rule_id, entity_id);
        }
        self.unregister_entity(tenant_id, entity_id);
    }
}
