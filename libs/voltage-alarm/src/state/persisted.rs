//! Durable entity snapshot

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{EntityId, TenantId};

/// Snapshot written to the [`PersistedStateStore`](crate::traits::PersistedStateStore)
///
/// `alarm_states` maps the rule id string to the JSON-serialized
/// [`AlarmRuleProgress`](super::AlarmRuleProgress).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntityState {
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    #[serde(default)]
    pub alarm_states: HashMap<String, String>,
}

impl PersistedEntityState {
    pub fn new(tenant_id: TenantId, entity_id: EntityId) -> Self {
        Self {
            tenant_id,
            entity_id,
            alarm_states: HashMap::new(),
        }
    }

    /// Store key shared by every backend: `{tenant}:{entity}`
    pub fn key(tenant_id: TenantId, entity_id: EntityId) -> String {
        format!("{}:{}", tenant_id, entity_id)
    }
}
