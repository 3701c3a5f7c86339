//! Source entity filter matching

use std::sync::Arc;
use tracing::warn;

use crate::ids::{EntityId, EntityType, TenantId};
use crate::rule::{AlarmRule, AlarmRuleEntityFilter};
use crate::traits::ProfileCache;

/// Decides whether an entity satisfies a rule's source entity filters
///
/// `SingleEntity`/`EntityList` compare ids directly. `DeviceType`/`AssetType`
/// test the entity's current profile: a wrong entity type or an unresolved
/// profile never matches. `Relation` never matches.
#[derive(Clone)]
pub struct EntityFilterMatcher {
    device_profiles: Arc<dyn ProfileCache>,
    asset_profiles: Arc<dyn ProfileCache>,
}

impl EntityFilterMatcher {
    pub fn new(device_profiles: Arc<dyn ProfileCache>, asset_profiles: Arc<dyn ProfileCache>) -> Self {
        Self {
            device_profiles,
            asset_profiles,
        }
    }

    /// Current profile of a device or asset
    ///
    /// Other entity types have no profile; lookup failures are logged and
    /// treated as unresolved.
    pub async fn resolve_profile(&self, tenant_id: TenantId, entity_id: EntityId) -> Option<EntityId> {
        let cache = match entity_id.entity_type {
            EntityType::Device => &self.device_profiles,
            EntityType::Asset => &self.asset_profiles,
            _ => return None,
        };
        match cache.get(tenant_id, entity_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("[{}] [{}] Failed to resolve entity profile: {}", tenant_id, entity_id, e);
                None
            },
        }
    }

    pub async fn matches(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        filter: &AlarmRuleEntityFilter,
    ) -> bool {
        let profile = if needs_profile(filter) {
            self.resolve_profile(tenant_id, entity_id).await
        } else {
            None
        };
        matches_with_profile(entity_id, profile, filter)
    }

    /// OR over every source filter of the rule
    pub async fn matches_any_filter(&self, tenant_id: TenantId, entity_id: EntityId, rule: &AlarmRule) -> bool {
        let filters = &rule.configuration.source_entity_filters;
        let profile = if filters.iter().any(needs_profile) {
            self.resolve_profile(tenant_id, entity_id).await
        } else {
            None
        };
        matches_rule(entity_id, profile, rule)
    }

    /// Rules among `rules` that match an entity whose profile is known
    pub fn matching_rules(
        &self,
        entity_id: EntityId,
        profile_id: Option<EntityId>,
        rules: &[Arc<AlarmRule>],
    ) -> Vec<Arc<AlarmRule>> {
        rules
            .iter()
            .filter(|rule| matches_rule(entity_id, profile_id, rule))
            .cloned()
            .collect()
    }
}

fn needs_profile(filter: &AlarmRuleEntityFilter) -> bool {
    matches!(
        filter,
        AlarmRuleEntityFilter::DeviceType { .. } | AlarmRuleEntityFilter::AssetType { .. }
    )
}

/// Match an entity whose profile is already known
pub fn matches_rule(entity_id: EntityId, profile_id: Option<EntityId>, rule: &AlarmRule) -> bool {
    rule.configuration
        .source_entity_filters
        .iter()
        .any(|filter| matches_with_profile(entity_id, profile_id, filter))
}

fn matches_with_profile(
    entity_id: EntityId,
    profile_id: Option<EntityId>,
    filter: &AlarmRuleEntityFilter,
) -> bool {
    match filter {
        AlarmRuleEntityFilter::SingleEntity { .. } | AlarmRuleEntityFilter::EntityList { .. } => {
            filter.is_entity_matches(&entity_id)
        },
        AlarmRuleEntityFilter::DeviceType { .. } => {
            entity_id.entity_type == EntityType::Device
                && profile_id.is_some_and(|profile| filter.is_entity_matches(&profile))
        },
        AlarmRuleEntityFilter::AssetType { .. } => {
            entity_id.entity_type == EntityType::Asset
                && profile_id.is_some_and(|profile| filter.is_entity_matches(&profile))
        },
        AlarmRuleEntityFilter::Relation { .. } => filter.is_entity_matches(&entity_id),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::memory::MemoryProfileCache;
    use crate::rule::EntitySearchDirection;
    use uuid::Uuid;

    fn matcher() -> (EntityFilterMatcher, Arc<MemoryProfileCache>, Arc<MemoryProfileCache>) {
        let devices = Arc::new(MemoryProfileCache::new());
        let assets = Arc::new(MemoryProfileCache::new());
        (
            EntityFilterMatcher::new(devices.clone(), assets.clone()),
            devices,
            assets,
        )
    }

    #[tokio::test]
    async fn test_id_filters() {
        let (m, _, _) = matcher();
        let tenant = TenantId::random();
        let a = EntityId::device(Uuid::new_v4());
        let b = EntityId::device(Uuid::new_v4());

        assert!(m.matches(tenant, a, &AlarmRuleEntityFilter::SingleEntity { entity_id: a }).await);
        assert!(!m.matches(tenant, b, &AlarmRuleEntityFilter::SingleEntity { entity_id: a }).await);
        let list = AlarmRuleEntityFilter::EntityList { entity_ids: vec![a, b] };
        assert!(m.matches(tenant, b, &list).await);
    }

    #[tokio::test]
    async fn test_device_type_filter_uses_profile_cache() {
        let (m, devices, _) = matcher();
        let tenant = TenantId::random();
        let profile = EntityId::device_profile(Uuid::new_v4());
        let device = EntityId::device(Uuid::new_v4());
        let filter = AlarmRuleEntityFilter::DeviceType {
            device_profile_id: profile,
        };

        // Unresolved profile
        assert!(!m.matches(tenant, device, &filter).await);

        devices.set(tenant, device, profile);
        assert!(m.matches(tenant, device, &filter).await);

        // An asset never matches a device type filter
        let asset = EntityId::asset(device.id);
        assert!(!m.matches(tenant, asset, &filter).await);
    }

    #[tokio::test]
    async fn test_asset_type_filter() {
        let (m, _, assets) = matcher();
        let tenant = TenantId::random();
        let profile = EntityId::asset_profile(Uuid::new_v4());
        let asset = EntityId::asset(Uuid::new_v4());
        assets.set(tenant, asset, profile);

        let filter = AlarmRuleEntityFilter::AssetType {
            asset_profile_id: profile,
        };
        assert!(m.matches(tenant, asset, &filter).await);
        let other = AlarmRuleEntityFilter::AssetType {
            asset_profile_id: EntityId::asset_profile(Uuid::new_v4()),
        };
        assert!(!m.matches(tenant, asset, &other).await);
    }

    #[tokio::test]
    async fn test_relation_filter_is_unsupported() {
        let (m, _, _) = matcher();
        let filter = AlarmRuleEntityFilter::Relation {
            direction: EntitySearchDirection::To,
            relation_type: "Contains".to_string(),
        };
        assert!(!m.matches(TenantId::random(), EntityId::device(Uuid::new_v4()), &filter).await);
    }

    #[test]
    fn test_known_profile_override() {
        let device = EntityId::device(Uuid::new_v4());
        let profile = EntityId::device_profile(Uuid::new_v4());
        let filter = AlarmRuleEntityFilter::DeviceType {
            device_profile_id: profile,
        };
        assert!(matches_with_profile(device, Some(profile), &filter));
        assert!(!matches_with_profile(device, None, &filter));
    }
}
