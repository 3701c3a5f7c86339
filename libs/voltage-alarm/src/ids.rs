//! Identifier types
//!
//! All identifiers are UUID newtypes. `EntityId` additionally carries the
//! entity type tag used for profile lookups and filter dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AlarmError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Generate a random identifier
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = AlarmError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| AlarmError::Codec(format!("Invalid {}: {} ({})", stringify!($name), s, e)))
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier
    TenantId
);

uuid_id!(
    /// Alarm rule identifier
    AlarmRuleId
);

/// Entity type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Tenant,
    Customer,
    Device,
    Asset,
    DeviceProfile,
    AssetProfile,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Tenant => "TENANT",
            EntityType::Customer => "CUSTOMER",
            EntityType::Device => "DEVICE",
            EntityType::Asset => "ASSET",
            EntityType::DeviceProfile => "DEVICE_PROFILE",
            EntityType::AssetProfile => "ASSET_PROFILE",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TENANT" => Ok(EntityType::Tenant),
            "CUSTOMER" => Ok(EntityType::Customer),
            "DEVICE" => Ok(EntityType::Device),
            "ASSET" => Ok(EntityType::Asset),
            "DEVICE_PROFILE" => Ok(EntityType::DeviceProfile),
            "ASSET_PROFILE" => Ok(EntityType::AssetProfile),
            other => Err(AlarmError::UnsupportedEntityType(other.to_string())),
        }
    }
}

/// Typed entity identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityId {
    pub fn new(entity_type: EntityType, id: Uuid) -> Self {
        Self { entity_type, id }
    }

    pub fn device(id: Uuid) -> Self {
        Self::new(EntityType::Device, id)
    }

    pub fn asset(id: Uuid) -> Self {
        Self::new(EntityType::Asset, id)
    }

    pub fn device_profile(id: Uuid) -> Self {
        Self::new(EntityType::DeviceProfile, id)
    }

    pub fn asset_profile(id: Uuid) -> Self {
        Self::new(EntityType::AssetProfile, id)
    }
}

/// Rendered as `{ENTITY_TYPE}:{uuid}`
impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl FromStr for EntityId {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, id) = s
            .split_once(':')
            .ok_or_else(|| AlarmError::Codec(format!("Invalid entity id: {}", s)))?;
        let id = Uuid::parse_str(id)
            .map_err(|e| AlarmError::Codec(format!("Invalid entity id: {} ({})", s, e)))?;
        Ok(Self::new(entity_type.parse()?, id))
    }
}
