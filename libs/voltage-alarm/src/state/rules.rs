//! Rule set attached to one entity

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

use super::progress::{AlarmRuleProgress, AlarmRuleState, AlarmTransition, RuleEvaluation};
use crate::condition::{ConditionEvaluator, DataSnapshot};
use crate::ids::AlarmRuleId;
use crate::rule::AlarmRule;

/// Transition raised by one attached rule
#[derive(Debug, Clone)]
pub struct RuleTransition {
    pub rule: Arc<AlarmRule>,
    pub transition: AlarmTransition,
}

/// Outcome of evaluating every attached rule
#[derive(Debug, Default)]
pub struct RulesEvaluation {
    pub transitions: Vec<RuleTransition>,
    pub changed: bool,
}

/// Per-entity mapping of rule id to rule progress
///
/// Owned by one `EntityState`; only mutated under its lock.
pub struct EntityRulesState {
    rules: BTreeMap<AlarmRuleId, AlarmRuleState>,
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl EntityRulesState {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self {
            rules: BTreeMap::new(),
            evaluator,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn contains(&self, rule_id: &AlarmRuleId) -> bool {
        self.rules.contains_key(rule_id)
    }

    pub fn rule_ids(&self) -> Vec<AlarmRuleId> {
        self.rules.keys().copied().collect()
    }

    pub fn rules(&self) -> Vec<Arc<AlarmRule>> {
        self.rules.values().map(|s| Arc::clone(s.rule())).collect()
    }

    pub fn progress(&self, rule_id: &AlarmRuleId) -> Option<&AlarmRuleProgress> {
        self.rules.get(rule_id).map(AlarmRuleState::progress)
    }

    /// Attach a rule with the given progress; replaces an existing entry
    pub fn insert(&mut self, rule: Arc<AlarmRule>, progress: AlarmRuleProgress) {
        self.rules
            .insert(rule.id, AlarmRuleState::with_progress(rule, progress));
    }

    pub fn remove(&mut self, rule_id: &AlarmRuleId) -> bool {
        self.rules.remove(rule_id).is_some()
    }

    /// Replace an attached rule definition, returns false if not attached
    pub fn update(&mut self, rule: Arc<AlarmRule>) -> bool {
        match self.rules.get_mut(&rule.id) {
            Some(state) => {
                state.update_rule(rule);
                true
            },
            None => false,
        }
    }

    pub fn process(&mut self, snapshot: &DataSnapshot, ts: i64) -> RulesEvaluation {
        let evaluator = Arc::clone(&self.evaluator);
        self.evaluate(|state| state.process(evaluator.as_ref(), snapshot, ts))
    }

    pub fn harvest(&mut self, now: i64) -> RulesEvaluation {
        self.evaluate(|state| state.harvest(now))
    }

    fn evaluate<F>(&mut self, mut eval: F) -> RulesEvaluation
    where
        F: FnMut(&mut AlarmRuleState) -> RuleEvaluation,
    {
        let mut result = RulesEvaluation::default();
        for state in self.rules.values_mut() {
            let evaluation = eval(state);
            result.changed |= evaluation.changed;
            if let Some(transition) = evaluation.transition {
                result.transitions.push(RuleTransition {
                    rule: Arc::clone(state.rule()),
                    transition,
                });
            }
        }
        result
    }

    /// Serialized progress per rule id
    pub fn to_persisted(&self) -> HashMap<String, String> {
        self.rules
            .iter()
            .filter_map(|(id, state)| match state.progress().to_json() {
                Ok(raw) => Some((id.to_string(), raw)),
                Err(e) => {
                    warn!("Failed to serialize progress of alarm rule {}: {}", id, e);
                    None
                },
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::condition::{AlarmCondition, KeyFilter, KeyFilterEvaluator, NumericOperation};
    use crate::ids::{EntityId, TenantId};
    use crate::rule::{
        AlarmRuleConfiguration, AlarmRuleEntityFilter, AlarmRuleTargetEntity, AlarmSeverity,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn rule(threshold: f64) -> Arc<AlarmRule> {
        let mut create_rules = BTreeMap::new();
        create_rules.insert(
            AlarmSeverity::Warning,
            AlarmCondition::simple(vec![KeyFilter::numeric(
                "soc",
                NumericOperation::Less,
                threshold,
            )]),
        );
        Arc::new(AlarmRule {
            id: AlarmRuleId::random(),
            tenant_id: TenantId::random(),
            name: format!("SOC below {}", threshold),
            alarm_type: "LowSoc".to_string(),
            enabled: true,
            configuration: AlarmRuleConfiguration {
                source_entity_filters: vec![AlarmRuleEntityFilter::SingleEntity {
                    entity_id: EntityId::device(Uuid::new_v4()),
                }],
                alarm_target_entity: AlarmRuleTargetEntity::Originator,
                create_rules,
                clear_rule: None,
            },
        })
    }

    #[test]
    fn test_evaluates_every_attached_rule() {
        let mut rules = EntityRulesState::new(Arc::new(KeyFilterEvaluator));
        let low = rule(20.0);
        let very_low = rule(10.0);
        rules.insert(Arc::clone(&low), AlarmRuleProgress::default());
        rules.insert(Arc::clone(&very_low), AlarmRuleProgress::default());

        let mut snapshot = DataSnapshot::new();
        snapshot.merge(&json!({"soc": 15}), 100);
        let result = rules.process(&snapshot, 100);

        assert!(result.changed);
        assert_eq!(result.transitions.len(), 1);
        assert_eq!(result.transitions[0].rule.id, low.id);
    }

    #[test]
    fn test_persisted_map_is_keyed_by_rule_id() {
        let mut rules = EntityRulesState::new(Arc::new(KeyFilterEvaluator));
        let r = rule(20.0);
        rules.insert(Arc::clone(&r), AlarmRuleProgress::default());

        let persisted = rules.to_persisted();
        assert_eq!(persisted.len(), 1);
        let raw = &persisted[&r.id.to_string()];
        assert_eq!(AlarmRuleProgress::from_json(raw).unwrap(), AlarmRuleProgress::default());
    }

    #[test]
    fn test_update_and_remove() {
        let mut rules = EntityRulesState::new(Arc::new(KeyFilterEvaluator));
        let r = rule(20.0);
        assert!(!rules.update(Arc::clone(&r)));
        rules.insert(Arc::clone(&r), AlarmRuleProgress::default());
        assert!(rules.update(Arc::clone(&r)));
        assert!(rules.remove(&r.id));
        assert!(rules.is_empty());
    }
}
