//! Tenant rule catalog
//!
//! Enabled rules are fetched per tenant on first access and cached in the
//! [`RuleMembershipIndex`](crate::index::RuleMembershipIndex). Rule
//! create/update/delete notifications adjust the cache one rule at a time
//! and push the change into every affected entity state.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::AlarmEngineContext;
use crate::error::{AlarmError, Result};
use crate::ids::{AlarmRuleId, TenantId};
use crate::rule::AlarmRule;
use crate::traits::PageLink;

/// Page size used when loading a tenant's rules
pub const RULES_PAGE_SIZE: usize = 1024;

pub struct RuleCatalog {
    ctx: Arc<AlarmEngineContext>,
}

impl RuleCatalog {
    pub fn new(ctx: Arc<AlarmEngineContext>) -> Self {
        Self { ctx }
    }

    /// Enabled rules of a tenant, fetched page by page on first access
    pub async fn get_or_fetch(&self, tenant_id: TenantId) -> Result<Vec<Arc<AlarmRule>>> {
        if let Some(rules) = self.ctx.index.tenant_rules(&tenant_id) {
            return Ok(rules);
        }

        let mut fetched = BTreeMap::new();
        let mut page = PageLink::new(RULES_PAGE_SIZE);
        loop {
            let data = self
                .ctx
                .rule_source
                .find_enabled(tenant_id, page)
                .await
                .map_err(AlarmError::rule_source)?;
            for rule in data.data {
                if !rule.enabled {
                    continue;
                }
                if let Err(e) = rule.validate() {
                    warn!("[{}] Skipping alarm rule {}: {}", tenant_id, rule.id, e);
                    continue;
                }
                fetched.insert(rule.id, Arc::new(rule));
            }
            if !data.has_next {
                break;
            }
            page = page.next_page();
        }

        debug!("[{}] Fetched {} alarm rules", tenant_id, fetched.len());
        Ok(self.ctx.index.insert_tenant_rules(tenant_id, fetched))
    }

    /// Handle a rule creation, returns the number of entities it attached to
    pub async fn create(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<usize> {
        let Some(rule) = self.fetch_rule(tenant_id, rule_id).await? else {
            debug!("[{}] Alarm rule {} not found on create", tenant_id, rule_id);
            return Ok(0);
        };
        if !rule.enabled {
            return Ok(0);
        }
        if let Err(e) = rule.validate() {
            warn!("[{}] Refusing alarm rule {}: {}", tenant_id, rule_id, e);
            return Ok(0);
        }

        // Loads the tenant if needed; the fetched set may already hold the rule
        self.get_or_fetch(tenant_id).await?;
        let rule = Arc::new(rule);
        self.ctx.index.put_rule(Arc::clone(&rule));

        let mut attached = 0;
        for entity_id in self.ctx.index.tenant_entities(&tenant_id) {
            if !self
                .ctx
                .matcher
                .matches_any_filter(tenant_id, entity_id, &rule)
                .await
            {
                continue;
            }
            let Some(state) = self.ctx.registry.get(&entity_id) else {
                continue;
            };
            match state.add_alarm_rule(Arc::clone(&rule)).await {
                Ok(true) => {
                    self.ctx.index.attach(rule.id, entity_id);
                    attached += 1;
                },
                Ok(false) => {},
                Err(e) => warn!(
                    "[{}] [{}] Failed to add alarm rule {}: {}",
                    tenant_id, entity_id, rule_id, e
                ),
            }
        }

        info!(
            "[{}] Alarm rule {} created, attached to {} entities",
            tenant_id, rule_id, attached
        );
        Ok(attached)
    }

    /// Handle a rule update
    ///
    /// A rule that disappeared or got disabled is deleted; a rule new to the
    /// tenant cache is created. Otherwise the definition is replaced in the
    /// cache and in every entity currently attached to it.
    pub async fn update(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<usize> {
        let rule = match self.fetch_rule(tenant_id, rule_id).await? {
            Some(rule) if rule.enabled => rule,
            _ => return self.delete(tenant_id, rule_id).await,
        };
        if let Err(e) = rule.validate() {
            warn!("[{}] Refusing alarm rule update {}: {}", tenant_id, rule_id, e);
            return Ok(0);
        }
        if !self.ctx.index.contains_rule(&tenant_id, &rule_id) {
            return self.create(tenant_id, rule_id).await;
        }

        let rule = Arc::new(rule);
        self.ctx.index.put_rule(Arc::clone(&rule));

        let mut updated = 0;
        for entity_id in self.ctx.index.entities_for_rule(&rule_id) {
            let Some(state) = self.ctx.registry.get(&entity_id) else {
                continue;
            };
            let mut guard = state.lock().await;
            match guard.update_alarm_rule(Arc::clone(&rule)).await {
                Ok(true) => updated += 1,
                Ok(false) => {},
                Err(e) => warn!(
                    "[{}] [{}] Failed to update alarm rule {}: {}",
                    tenant_id, entity_id, rule_id, e
                ),
            }
        }

        info!(
            "[{}] Alarm rule {} updated on {} entities",
            tenant_id, rule_id, updated
        );
        Ok(updated)
    }

    /// Handle a rule deletion, returns the number of entities detached
    ///
    /// Entity states left without rules are evicted and their snapshots
    /// removed.
    pub async fn delete(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<usize> {
        self.ctx.index.remove_rule(&tenant_id, &rule_id);

        let mut removed = 0;
        for entity_id in self.ctx.index.take_rule(&rule_id) {
            let Some(state) = self.ctx.registry.get(&entity_id) else {
                continue;
            };
            let mut guard = state.lock().await;
            match guard.remove_alarm_rule(rule_id).await {
                Ok(true) => removed += 1,
                Ok(false) => {},
                Err(e) => warn!(
                    "[{}] [{}] Failed to remove alarm rule {}: {}",
                    tenant_id, entity_id, rule_id, e
                ),
            }
            if guard.is_empty() && !guard.is_retired() {
                self.ctx.evict(&state, &mut guard, true).await;
            }
        }

        info!(
            "[{}] Alarm rule {} deleted from {} entities",
            tenant_id, rule_id, removed
        );
        Ok(removed)
    }

    /// Delete every rule of a tenant, then drop its cache entry
    pub async fn delete_tenant(&self, tenant_id: TenantId) -> Result<usize> {
        let mut removed = 0;
        for rule in self.ctx.index.tenant_rules(&tenant_id).unwrap_or_default() {
            removed += self.delete(tenant_id, rule.id).await?;
        }
        self.ctx.index.remove_tenant(&tenant_id);
        info!("[{}] Tenant alarm rules removed", tenant_id);
        Ok(removed)
    }

    async fn fetch_rule(&self, tenant_id: TenantId, rule_id: AlarmRuleId) -> Result<Option<AlarmRule>> {
        let rule = self
            .ctx
            .rule_source
            .find_by_id(tenant_id, rule_id)
            .await
            .map_err(AlarmError::rule_source)?;
        Ok(rule.filter(|r| r.tenant_id == tenant_id))
    }
}
