//! Entity alarm state
//!
//! - [`progress`]: per-rule alarm progress and the create/clear ladder
//! - [`rules`]: the rule set attached to one entity
//! - [`entity`]: the lock-guarded per-entity state
//! - [`persisted`]: the durable snapshot format

pub mod entity;
pub mod persisted;
pub mod progress;
pub mod rules;

pub use entity::{EntityHarvest, EntityState, EntityStateDeps, LockedEntityState};
pub use persisted::PersistedEntityState;
pub use progress::{ActiveAlarm, AlarmRuleProgress, AlarmRuleState, AlarmTransition, ConditionProgress};
pub use rules::{EntityRulesState, RuleTransition};
