//! Alarm lifecycle events and message routing results

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ids::{AlarmRuleId, EntityId, TenantId};
use crate::message::AlarmRuleRequestCtx;
use crate::rule::AlarmSeverity;

/// Alarm lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmEventKind {
    Created,
    Updated,
    SeverityUpdated,
    Cleared,
}

/// Event emitted to the [`AlarmSink`](crate::traits::AlarmSink)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub alarm_id: Uuid,
    pub tenant_id: TenantId,
    pub originator: EntityId,
    pub rule_id: AlarmRuleId,
    pub rule_name: String,
    pub alarm_type: String,
    pub kind: AlarmEventKind,
    pub severity: AlarmSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_severity: Option<AlarmSeverity>,
    pub start_ts: i64,
    pub end_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ctx: Option<AlarmRuleRequestCtx>,
}

/// Outcome of processing one message
///
/// Declared in ascending priority; the highest outcome of all rules wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmRoutingResult {
    #[default]
    Success,
    Cleared,
    Updated,
    SeverityUpdated,
    Created,
}

impl AlarmRoutingResult {
    /// Relation name used for downstream routing
    pub fn relation_name(&self) -> &'static str {
        match self {
            AlarmRoutingResult::Success => "Success",
            AlarmRoutingResult::Cleared => "Alarm Cleared",
            AlarmRoutingResult::Updated => "Alarm Updated",
            AlarmRoutingResult::SeverityUpdated => "Alarm Severity Updated",
            AlarmRoutingResult::Created => "Alarm Created",
        }
    }
}

impl From<AlarmEventKind> for AlarmRoutingResult {
    fn from(kind: AlarmEventKind) -> Self {
        match kind {
            AlarmEventKind::Created => AlarmRoutingResult::Created,
            AlarmEventKind::Updated => AlarmRoutingResult::Updated,
            AlarmEventKind::SeverityUpdated => AlarmRoutingResult::SeverityUpdated,
            AlarmEventKind::Cleared => AlarmRoutingResult::Cleared,
        }
    }
}

impl fmt::Display for AlarmRoutingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relation_name())
    }
}
