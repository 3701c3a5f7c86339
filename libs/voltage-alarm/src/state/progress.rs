//! Per-rule alarm progress
//!
//! Each attached rule keeps an [`AlarmRuleProgress`]: the active alarm (if
//! any), condition progress per create severity and for the clear rule.
//! Progress is persisted as JSON under the rule id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::condition::{AlarmCondition, AlarmConditionSpec, ConditionEvaluator, DataSnapshot};
use crate::event::AlarmEventKind;
use crate::rule::{AlarmRule, AlarmSeverity};

/// Alarm currently raised by a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAlarm {
    pub id: Uuid,
    pub severity: AlarmSeverity,
    pub start_ts: i64,
    pub end_ts: i64,
}

/// Progress of one duration/repeating condition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionProgress {
    /// Timestamp of the latest matching sample, `None` before the first one
    #[serde(default)]
    pub last_event_ts: Option<i64>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub event_count: u64,
}

impl ConditionProgress {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRuleProgress {
    #[serde(default)]
    pub current_alarm: Option<ActiveAlarm>,
    #[serde(default)]
    pub create_states: BTreeMap<AlarmSeverity, ConditionProgress>,
    #[serde(default)]
    pub clear_state: ConditionProgress,
    /// Timestamp of the last evaluation that changed progress
    #[serde(default)]
    pub last_eval_ts: i64,
}

impl AlarmRuleProgress {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalResult {
    True,
    False,
    NotYetTrue,
}

/// Alarm transition produced by one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmTransition {
    pub kind: AlarmEventKind,
    pub alarm: ActiveAlarm,
    pub previous_severity: Option<AlarmSeverity>,
}

/// Result of evaluating one rule
#[derive(Debug, Default)]
pub struct RuleEvaluation {
    pub transition: Option<AlarmTransition>,
    /// Progress differs from before the evaluation
    pub changed: bool,
}

fn eval_on_message(
    evaluator: &dyn ConditionEvaluator,
    condition: &AlarmCondition,
    progress: &mut ConditionProgress,
    snapshot: &DataSnapshot,
    ts: i64,
) -> EvalResult {
    if !evaluator.matches(condition, snapshot) {
        progress.clear();
        return EvalResult::False;
    }

    match condition.spec {
        AlarmConditionSpec::Simple => EvalResult::True,
        AlarmConditionSpec::Repeating { count } => {
            progress.event_count += 1;
            if progress.event_count >= count {
                EvalResult::True
            } else {
                EvalResult::NotYetTrue
            }
        },
        AlarmConditionSpec::Duration { duration_ms } => {
            match progress.last_event_ts {
                Some(last) if ts > last => {
                    progress.duration_ms += ts - last;
                    progress.last_event_ts = Some(ts);
                },
                Some(_) => {},
                None => progress.last_event_ts = Some(ts),
            }
            if progress.duration_ms >= duration_ms {
                EvalResult::True
            } else {
                EvalResult::NotYetTrue
            }
        },
    }
}

/// Time-only evaluation: only duration conditions can become true
fn eval_on_harvest(condition: &AlarmCondition, progress: &ConditionProgress, now: i64) -> EvalResult {
    match condition.spec {
        AlarmConditionSpec::Duration { duration_ms } => {
            let Some(last) = progress.last_event_ts else {
                return EvalResult::NotYetTrue;
            };
            let elapsed = progress.duration_ms + (now - last).max(0);
            if elapsed >= duration_ms {
                EvalResult::True
            } else {
                EvalResult::NotYetTrue
            }
        },
        _ => EvalResult::NotYetTrue,
    }
}

/// One rule attached to an entity together with its progress
#[derive(Debug, Clone)]
pub struct AlarmRuleState {
    rule: Arc<AlarmRule>,
    progress: AlarmRuleProgress,
}

impl AlarmRuleState {
    pub fn new(rule: Arc<AlarmRule>) -> Self {
        Self::with_progress(rule, AlarmRuleProgress::default())
    }

    pub fn with_progress(rule: Arc<AlarmRule>, progress: AlarmRuleProgress) -> Self {
        let mut state = Self { rule, progress };
        state.drop_unknown_severities();
        state
    }

    pub fn rule(&self) -> &Arc<AlarmRule> {
        &self.rule
    }

    pub fn progress(&self) -> &AlarmRuleProgress {
        &self.progress
    }

    /// Replace the rule definition
    ///
    /// Condition progress survives where the old and new condition specs are
    /// of the same kind; otherwise that severity starts over. The active
    /// alarm is kept.
    pub fn update_rule(&mut self, rule: Arc<AlarmRule>) {
        let old = &self.rule.configuration;
        let new = &rule.configuration;

        for (severity, progress) in self.progress.create_states.iter_mut() {
            let compatible = match (old.create_rules.get(severity), new.create_rules.get(severity)) {
                (Some(a), Some(b)) => a.spec.same_kind(&b.spec),
                _ => false,
            };
            if !compatible {
                progress.clear();
            }
        }

        let clear_compatible = match (&old.clear_rule, &new.clear_rule) {
            (Some(a), Some(b)) => a.spec.same_kind(&b.spec),
            _ => false,
        };
        if !clear_compatible {
            self.progress.clear_state.clear();
        }

        self.rule = rule;
        self.drop_unknown_severities();
    }

    fn drop_unknown_severities(&mut self) {
        let create_rules = &self.rule.configuration.create_rules;
        self.progress
            .create_states
            .retain(|severity, _| create_rules.contains_key(severity));
    }

    /// Evaluate against a freshly merged snapshot
    pub fn process(
        &mut self,
        evaluator: &dyn ConditionEvaluator,
        snapshot: &DataSnapshot,
        ts: i64,
    ) -> RuleEvaluation {
        let before = self.progress.clone();
        let rule = Arc::clone(&self.rule);

        let mut fired = None;
        for (severity, condition) in &rule.configuration.create_rules {
            let progress = self.progress.create_states.entry(*severity).or_default();
            if eval_on_message(evaluator, condition, progress, snapshot, ts) == EvalResult::True {
                fired = Some(*severity);
                break;
            }
        }

        let transition = match fired {
            Some(severity) => self.raise(severity, ts, false),
            None => self.try_clear(evaluator, snapshot, ts),
        };

        self.finish(before, transition, ts)
    }

    /// Evaluate elapsed-time conditions without new data
    pub fn harvest(&mut self, now: i64) -> RuleEvaluation {
        let before = self.progress.clone();
        let rule = Arc::clone(&self.rule);

        let fired = rule
            .configuration
            .create_rules
            .iter()
            .find(|(severity, condition)| {
                self.progress
                    .create_states
                    .get(severity)
                    .is_some_and(|progress| eval_on_harvest(condition, progress, now) == EvalResult::True)
            })
            .map(|(severity, _)| *severity);

        let transition = match fired {
            Some(severity) => self.raise(severity, now, true),
            None if self.progress.current_alarm.is_some() => match &rule.configuration.clear_rule {
                Some(clear_rule)
                    if eval_on_harvest(clear_rule, &self.progress.clear_state, now)
                        == EvalResult::True =>
                {
                    self.clear_alarm(now)
                },
                _ => None,
            },
            None => None,
        };

        self.finish(before, transition, now)
    }

    /// Raise or escalate the alarm to `severity`
    ///
    /// When harvesting, an alarm that already has this severity is left alone.
    fn raise(&mut self, severity: AlarmSeverity, ts: i64, harvesting: bool) -> Option<AlarmTransition> {
        self.progress.clear_state.clear();
        match self.progress.current_alarm.as_mut() {
            None => {
                let alarm = ActiveAlarm {
                    id: Uuid::new_v4(),
                    severity,
                    start_ts: ts,
                    end_ts: ts,
                };
                self.progress.current_alarm = Some(alarm.clone());
                Some(AlarmTransition {
                    kind: AlarmEventKind::Created,
                    alarm,
                    previous_severity: None,
                })
            },
            Some(alarm) if alarm.severity == severity => {
                if harvesting {
                    return None;
                }
                alarm.end_ts = alarm.end_ts.max(ts);
                Some(AlarmTransition {
                    kind: AlarmEventKind::Updated,
                    alarm: alarm.clone(),
                    previous_severity: None,
                })
            },
            Some(alarm) => {
                let previous = alarm.severity;
                alarm.severity = severity;
                alarm.end_ts = alarm.end_ts.max(ts);
                Some(AlarmTransition {
                    kind: AlarmEventKind::SeverityUpdated,
                    alarm: alarm.clone(),
                    previous_severity: Some(previous),
                })
            },
        }
    }

    fn try_clear(
        &mut self,
        evaluator: &dyn ConditionEvaluator,
        snapshot: &DataSnapshot,
        ts: i64,
    ) -> Option<AlarmTransition> {
        self.progress.current_alarm.as_ref()?;
        let rule = Arc::clone(&self.rule);
        let clear_rule = rule.configuration.clear_rule.as_ref()?;

        let result = eval_on_message(evaluator, clear_rule, &mut self.progress.clear_state, snapshot, ts);
        if result == EvalResult::True {
            self.clear_alarm(ts)
        } else {
            None
        }
    }

    fn clear_alarm(&mut self, ts: i64) -> Option<AlarmTransition> {
        let mut alarm = self.progress.current_alarm.take()?;
        alarm.end_ts = alarm.end_ts.max(ts);
        self.progress.create_states.values_mut().for_each(ConditionProgress::clear);
        self.progress.clear_state.clear();
        Some(AlarmTransition {
            kind: AlarmEventKind::Cleared,
            alarm,
            previous_severity: None,
        })
    }

    fn finish(
        &mut self,
        before: AlarmRuleProgress,
        transition: Option<AlarmTransition>,
        ts: i64,
    ) -> RuleEvaluation {
        let changed = self.progress != before;
        if changed {
            self.progress.last_eval_ts = self.progress.last_eval_ts.max(ts);
        }
        RuleEvaluation { transition, changed }
    }
}
