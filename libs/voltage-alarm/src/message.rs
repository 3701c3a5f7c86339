//! Inbound queue messages
//!
//! Queue records are JSON `AlarmRuleStateMsg` values, internally tagged by
//! `type`:
//!
//! ```json
//! {"type": "message", "tenant_id": "...", "msg": {"msg_type": "POST_TELEMETRY_REQUEST", ...}}
//! {"type": "entity_update", "tenant_id": "...", "entity_kind": "DEVICE", "entity": {...}}
//! {"type": "entity_delete", "tenant_id": "...", "entity_type": "DEVICE", "entity_id": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{AlarmError, Result};
use crate::ids::{EntityId, EntityType, TenantId};

/// Message type
///
/// Serialized as its plain name. Unknown names are kept as `Other` so a
/// newer producer never breaks decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MsgType {
    PostTelemetryRequest,
    PostAttributesRequest,
    ActivityEvent,
    InactivityEvent,
    Other(String),
}

impl MsgType {
    pub fn as_str(&self) -> &str {
        match self {
            MsgType::PostTelemetryRequest => "POST_TELEMETRY_REQUEST",
            MsgType::PostAttributesRequest => "POST_ATTRIBUTES_REQUEST",
            MsgType::ActivityEvent => "ACTIVITY_EVENT",
            MsgType::InactivityEvent => "INACTIVITY_EVENT",
            MsgType::Other(name) => name,
        }
    }

    /// Whether messages of this type are evaluated against alarm rules
    pub fn is_evaluated(&self) -> bool {
        !matches!(self, MsgType::Other(_))
    }
}

impl From<String> for MsgType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "POST_TELEMETRY_REQUEST" => MsgType::PostTelemetryRequest,
            "POST_ATTRIBUTES_REQUEST" => MsgType::PostAttributesRequest,
            "ACTIVITY_EVENT" => MsgType::ActivityEvent,
            "INACTIVITY_EVENT" => MsgType::InactivityEvent,
            _ => MsgType::Other(value),
        }
    }
}

impl From<MsgType> for String {
    fn from(value: MsgType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry/attribute message addressed to one originator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMsg {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub msg_type: MsgType,
    pub originator: EntityId,
    /// Event time in milliseconds since the Unix epoch
    pub ts: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub data: Value,
}

impl EntityMsg {
    pub fn telemetry(originator: EntityId, ts: i64, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type: MsgType::PostTelemetryRequest,
            originator,
            ts,
            metadata: HashMap::new(),
            data,
        }
    }

    pub fn with_type(mut self, msg_type: MsgType) -> Self {
        self.msg_type = msg_type;
        self
    }
}

/// Rule engine context carried for trace/debug correlation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRuleRequestCtx {
    pub rule_chain_id: Uuid,
    pub rule_node_id: Uuid,
    #[serde(default)]
    pub debug_mode: bool,
}

/// Snapshot of an updated device or asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub id: EntityId,
    pub profile_id: EntityId,
    #[serde(default)]
    pub name: String,
}

/// Kind of entity carried by an update event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Device,
    Asset,
}

/// Queue record payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmRuleStateMsg {
    EntityUpdate {
        tenant_id: TenantId,
        entity_kind: EntityKind,
        entity: EntityInfo,
    },
    EntityDelete {
        tenant_id: TenantId,
        entity_type: EntityType,
        entity_id: EntityId,
    },
    Message {
        tenant_id: TenantId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_ctx: Option<AlarmRuleRequestCtx>,
        msg: EntityMsg,
    },
}

impl AlarmRuleStateMsg {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            AlarmRuleStateMsg::EntityUpdate { tenant_id, .. }
            | AlarmRuleStateMsg::EntityDelete { tenant_id, .. }
            | AlarmRuleStateMsg::Message { tenant_id, .. } => *tenant_id,
        }
    }

    /// Entity the record is routed by
    pub fn entity_id(&self) -> EntityId {
        match self {
            AlarmRuleStateMsg::EntityUpdate { entity, .. } => entity.id,
            AlarmRuleStateMsg::EntityDelete { entity_id, .. } => *entity_id,
            AlarmRuleStateMsg::Message { msg, .. } => msg.originator,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| AlarmError::Codec(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_telemetry_message() {
        let tenant = TenantId::random();
        let device = EntityId::device(Uuid::new_v4());
        let raw = json!({
            "type": "message",
            "tenant_id": tenant,
            "msg": {
                "msg_type": "POST_TELEMETRY_REQUEST",
                "originator": device,
                "ts": 1700000000000_i64,
                "data": {"temperature": 61.5}
            }
        });

        let decoded = AlarmRuleStateMsg::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(decoded.tenant_id(), tenant);
        assert_eq!(decoded.entity_id(), device);
        match decoded {
            AlarmRuleStateMsg::Message { request_ctx, msg, .. } => {
                assert!(request_ctx.is_none());
                assert_eq!(msg.msg_type, MsgType::PostTelemetryRequest);
                assert_eq!(msg.data["temperature"], 61.5);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_msg_type_is_kept_but_not_evaluated() {
        let msg_type: MsgType = serde_json::from_str("\"RPC_CALL_FROM_SERVER_TO_DEVICE\"").unwrap();
        assert!(!msg_type.is_evaluated());
        assert_eq!(
            serde_json::to_string(&msg_type).unwrap(),
            "\"RPC_CALL_FROM_SERVER_TO_DEVICE\""
        );
        assert!(MsgType::InactivityEvent.is_evaluated());
    }

    #[test]
    fn test_entity_update_encoding() {
        let msg = AlarmRuleStateMsg::EntityUpdate {
            tenant_id: TenantId::random(),
            entity_kind: EntityKind::Device,
            entity: EntityInfo {
                id: EntityId::device(Uuid::new_v4()),
                profile_id: EntityId::device_profile(Uuid::new_v4()),
                name: "pcs-01".to_string(),
            },
        };
        let bytes = msg.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "entity_update");
        assert_eq!(value["entity_kind"], "DEVICE");
        assert_eq!(AlarmRuleStateMsg::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = AlarmRuleStateMsg::decode(b"{not json").unwrap_err();
        assert!(matches!(err, AlarmError::Codec(_)));
    }
}
