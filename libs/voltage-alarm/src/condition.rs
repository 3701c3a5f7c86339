//! Alarm conditions and their default evaluator
//!
//! A condition is a conjunction of key filters evaluated against the entity's
//! latest data snapshot, plus a spec that decides how long (or how often) the
//! filters must hold before the condition counts as satisfied.
//!
//! The engine only depends on the [`ConditionEvaluator`] trait; the
//! [`KeyFilterEvaluator`] shipped here is the default rule language.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How a matching condition turns into a satisfied condition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmConditionSpec {
    /// Satisfied as soon as the filters match
    #[default]
    Simple,
    /// Filters must hold continuously for `duration_ms`
    Duration { duration_ms: i64 },
    /// Filters must match on `count` consecutive events
    Repeating { count: u64 },
}

impl AlarmConditionSpec {
    /// Whether two specs keep compatible progress counters
    pub fn same_kind(&self, other: &AlarmConditionSpec) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumericOperation {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BooleanOperation {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StringOperation {
    Equal,
    NotEqual,
    StartsWith,
    EndsWith,
    Contains,
    NotContains,
}

/// Predicate applied to a single snapshot value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyFilterPredicate {
    Numeric {
        operation: NumericOperation,
        value: f64,
    },
    Boolean {
        operation: BooleanOperation,
        value: bool,
    },
    String {
        operation: StringOperation,
        value: String,
        #[serde(default)]
        ignore_case: bool,
    },
}

/// Filter on one data key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFilter {
    pub key: String,
    pub predicate: KeyFilterPredicate,
}

impl KeyFilter {
    pub fn numeric(key: impl Into<String>, operation: NumericOperation, value: f64) -> Self {
        Self {
            key: key.into(),
            predicate: KeyFilterPredicate::Numeric { operation, value },
        }
    }

    pub fn boolean(key: impl Into<String>, operation: BooleanOperation, value: bool) -> Self {
        Self {
            key: key.into(),
            predicate: KeyFilterPredicate::Boolean { operation, value },
        }
    }
}

/// Alarm create/clear condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmCondition {
    /// Key filters, AND-combined
    pub condition: Vec<KeyFilter>,
    #[serde(default)]
    pub spec: AlarmConditionSpec,
}

impl AlarmCondition {
    pub fn simple(condition: Vec<KeyFilter>) -> Self {
        Self {
            condition,
            spec: AlarmConditionSpec::Simple,
        }
    }

    pub fn with_spec(condition: Vec<KeyFilter>, spec: AlarmConditionSpec) -> Self {
        Self { condition, spec }
    }
}

/// Latest known values of an entity, merged from every evaluated message
#[derive(Debug, Clone, Default)]
pub struct DataSnapshot {
    values: HashMap<String, Value>,
    ts: i64,
}

impl DataSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge message data into the snapshot
    ///
    /// Accepts a flat object (`{"temperature": 42}`), a telemetry object with
    /// `values` (`{"ts": 1, "values": {...}}`) or an array of those.
    pub fn merge(&mut self, data: &Value, ts: i64) {
        match data {
            Value::Array(items) => {
                for item in items {
                    self.merge(item, ts);
                }
            },
            Value::Object(map) => {
                if let Some(Value::Object(values)) = map.get("values") {
                    let item_ts = map.get("ts").and_then(Value::as_i64).unwrap_or(ts);
                    for (key, value) in values {
                        self.values.insert(key.clone(), value.clone());
                    }
                    self.ts = self.ts.max(item_ts);
                } else {
                    for (key, value) in map {
                        self.values.insert(key.clone(), value.clone());
                    }
                    self.ts = self.ts.max(ts);
                }
            },
            _ => {},
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value, ts: i64) {
        self.values.insert(key.into(), value);
        self.ts = self.ts.max(ts);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Timestamp of the newest merged value
    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Decides whether a condition's filters match a snapshot
///
/// Spec handling (duration, repeating) is done by the engine; evaluators only
/// answer the instantaneous question.
pub trait ConditionEvaluator: Send + Sync + 'static {
    fn matches(&self, condition: &AlarmCondition, snapshot: &DataSnapshot) -> bool;
}

/// Default evaluator over [`KeyFilter`] predicates
///
/// A missing key, or a value of the wrong kind, never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFilterEvaluator;

impl KeyFilterEvaluator {
    fn matches_filter(filter: &KeyFilter, snapshot: &DataSnapshot) -> bool {
        let Some(value) = snapshot.get(&filter.key) else {
            return false;
        };

        match &filter.predicate {
            KeyFilterPredicate::Numeric { operation, value: expected } => {
                let Some(actual) = as_number(value) else {
                    return false;
                };
                match operation {
                    NumericOperation::Equal => (actual - expected).abs() < f64::EPSILON,
                    NumericOperation::NotEqual => (actual - expected).abs() >= f64::EPSILON,
                    NumericOperation::Greater => actual > *expected,
                    NumericOperation::GreaterOrEqual => actual >= *expected,
                    NumericOperation::Less => actual < *expected,
                    NumericOperation::LessOrEqual => actual <= *expected,
                }
            },
            KeyFilterPredicate::Boolean { operation, value: expected } => {
                let Some(actual) = as_bool(value) else {
                    return false;
                };
                match operation {
                    BooleanOperation::Equal => actual == *expected,
                    BooleanOperation::NotEqual => actual != *expected,
                }
            },
            KeyFilterPredicate::String {
                operation,
                value: expected,
                ignore_case,
            } => {
                let actual = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return false,
                };
                let (actual, expected) = if *ignore_case {
                    (actual.to_lowercase(), expected.to_lowercase())
                } else {
                    (actual, expected.clone())
                };
                match operation {
                    StringOperation::Equal => actual == expected,
                    StringOperation::NotEqual => actual != expected,
                    StringOperation::StartsWith => actual.starts_with(&expected),
                    StringOperation::EndsWith => actual.ends_with(&expected),
                    StringOperation::Contains => actual.contains(&expected),
                    StringOperation::NotContains => !actual.contains(&expected),
                }
            },
        }
    }
}

impl ConditionEvaluator for KeyFilterEvaluator {
    fn matches(&self, condition: &AlarmCondition, snapshot: &DataSnapshot) -> bool {
        !condition.condition.is_empty()
            && condition
                .condition
                .iter()
                .all(|filter| Self::matches_filter(filter, snapshot))
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}
