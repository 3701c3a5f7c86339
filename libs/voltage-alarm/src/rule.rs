//! Alarm rule definitions
//!
//! Rules are immutable once fetched; an update replaces the whole definition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::condition::AlarmCondition;
use crate::error::{AlarmError, Result};
use crate::ids::{AlarmRuleId, EntityId, EntityType, TenantId};

/// Alarm severity, declared from most to least severe
///
/// The derived ordering puts `Critical` first, so iterating a
/// `BTreeMap<AlarmSeverity, _>` walks create rules from the most severe down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmSeverity {
    Critical,
    Major,
    Minor,
    Warning,
    Indeterminate,
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmSeverity::Critical => "CRITICAL",
            AlarmSeverity::Major => "MAJOR",
            AlarmSeverity::Minor => "MINOR",
            AlarmSeverity::Warning => "WARNING",
            AlarmSeverity::Indeterminate => "INDETERMINATE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitySearchDirection {
    From,
    To,
}

/// Source entity filter
///
/// Filters of one rule are OR-combined. `Relation` is accepted in rule
/// definitions but never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmRuleEntityFilter {
    SingleEntity {
        entity_id: EntityId,
    },
    EntityList {
        entity_ids: Vec<EntityId>,
    },
    DeviceType {
        device_profile_id: EntityId,
    },
    AssetType {
        asset_profile_id: EntityId,
    },
    Relation {
        direction: EntitySearchDirection,
        relation_type: String,
    },
}

impl AlarmRuleEntityFilter {
    /// Match against the filter's own id payload
    ///
    /// For `SingleEntity`/`EntityList` pass the entity id, for
    /// `DeviceType`/`AssetType` pass the entity's profile id.
    pub fn is_entity_matches(&self, id: &EntityId) -> bool {
        match self {
            AlarmRuleEntityFilter::SingleEntity { entity_id } => entity_id == id,
            AlarmRuleEntityFilter::EntityList { entity_ids } => entity_ids.contains(id),
            AlarmRuleEntityFilter::DeviceType { device_profile_id } => device_profile_id == id,
            AlarmRuleEntityFilter::AssetType { asset_profile_id } => asset_profile_id == id,
            AlarmRuleEntityFilter::Relation { .. } => false,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            AlarmRuleEntityFilter::SingleEntity { .. } => "SINGLE_ENTITY",
            AlarmRuleEntityFilter::EntityList { .. } => "ENTITY_LIST",
            AlarmRuleEntityFilter::DeviceType { .. } => "DEVICE_TYPE",
            AlarmRuleEntityFilter::AssetType { .. } => "ASSET_TYPE",
            AlarmRuleEntityFilter::Relation { .. } => "RELATION",
        }
    }
}

/// Which entity the alarm is raised on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmRuleTargetEntity {
    #[default]
    Originator,
    SingleEntity {
        entity_id: EntityId,
    },
    Relation {
        direction: EntitySearchDirection,
        relation_type: String,
    },
}

/// Rule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRuleConfiguration {
    pub source_entity_filters: Vec<AlarmRuleEntityFilter>,
    #[serde(default)]
    pub alarm_target_entity: AlarmRuleTargetEntity,
    /// Create conditions keyed by the severity they raise
    pub create_rules: BTreeMap<AlarmSeverity, AlarmCondition>,
    #[serde(default)]
    pub clear_rule: Option<AlarmCondition>,
}

/// Tenant-owned alarm rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: AlarmRuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub alarm_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub configuration: AlarmRuleConfiguration,
}

fn default_enabled() -> bool {
    true
}

impl AlarmRule {
    /// Validate the rule definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("Alarm rule name should be specified"));
        }
        if self.alarm_type.trim().is_empty() {
            return Err(invalid("Alarm rule type should be specified"));
        }

        let configuration = &self.configuration;
        if configuration.source_entity_filters.is_empty() {
            return Err(invalid("Alarm rule source entity filter should be specified"));
        }
        for filter in &configuration.source_entity_filters {
            validate_filter(filter)?;
        }

        if configuration.create_rules.is_empty() {
            return Err(invalid("Alarm create rule should be specified"));
        }

        Ok(())
    }

    /// Ids of the severities this rule can raise, most severe first
    pub fn severities(&self) -> impl Iterator<Item = AlarmSeverity> + '_ {
        self.configuration.create_rules.keys().copied()
    }
}

fn invalid(msg: &str) -> AlarmError {
    AlarmError::InvalidRule(msg.to_string())
}

fn validate_filter(filter: &AlarmRuleEntityFilter) -> Result<()> {
    let check = |id: &EntityId, allowed: &[EntityType]| {
        if allowed.contains(&id.entity_type) {
            Ok(())
        } else {
            Err(AlarmError::InvalidRule(format!(
                "{} entity type is not supported in alarm rule {} filter",
                id.entity_type,
                filter.type_name()
            )))
        }
    };

    match filter {
        AlarmRuleEntityFilter::SingleEntity { entity_id } => {
            check(entity_id, &[EntityType::Device, EntityType::Asset])
        },
        AlarmRuleEntityFilter::EntityList { entity_ids } => {
            if entity_ids.is_empty() {
                return Err(invalid(
                    "Entity ids should be specified in alarm rule ENTITY_LIST filter",
                ));
            }
            entity_ids
                .iter()
                .try_for_each(|id| check(id, &[EntityType::Device, EntityType::Asset]))
        },
        AlarmRuleEntityFilter::DeviceType { device_profile_id } => {
            check(device_profile_id, &[EntityType::DeviceProfile])
        },
        AlarmRuleEntityFilter::AssetType { asset_profile_id } => {
            check(asset_profile_id, &[EntityType::AssetProfile])
        },
        AlarmRuleEntityFilter::Relation { relation_type, .. } => {
            if relation_type.is_empty() {
                Err(invalid("Relation type should be specified in alarm rule RELATION filter"))
            } else {
                Ok(())
            }
        },
    }
}
