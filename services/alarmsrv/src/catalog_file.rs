//! YAML rules file
//!
//! One file holds the alarm rules of every tenant plus the device and
//! asset profile assignments the entity filters are matched against:
//!
//! ```yaml
//! rules:
//!   - id: 6f1c...
//!     tenant_id: 0b7e...
//!     name: High temperature
//!     alarm_type: HighTemperature
//!     configuration: { ... }
//! devices:
//!   - tenant_id: 0b7e...
//!     id: 11aa...
//!     profile_id: 22bb...
//! assets: []
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use voltage_alarm::memory::{MemoryProfileCache, MemoryRuleSource};
use voltage_alarm::{AlarmRule, AlarmRuleId, EntityId, TenantId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<AlarmRule>,
    #[serde(default)]
    pub devices: Vec<ProfileAssignment>,
    #[serde(default)]
    pub assets: Vec<ProfileAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileAssignment {
    pub tenant_id: TenantId,
    pub id: Uuid,
    pub profile_id: Uuid,
}

/// Counts reported by `alarmsrv check`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSummary {
    pub tenants: usize,
    pub rules: usize,
    pub enabled: usize,
    pub invalid: Vec<(AlarmRuleId, String)>,
    pub devices: usize,
    pub assets: usize,
}

/// Rule source and profile caches loaded from a rules file
pub struct FileCatalog {
    rules: Arc<MemoryRuleSource>,
    device_profiles: Arc<MemoryProfileCache>,
    asset_profiles: Arc<MemoryProfileCache>,
    summary: CatalogSummary,
}

impl FileCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid rules file: {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(raw).context("Failed to parse rules YAML")?;
        Self::from_rules_file(file)
    }

    pub fn from_rules_file(file: RulesFile) -> Result<Self> {
        let mut summary = CatalogSummary {
            rules: file.rules.len(),
            devices: file.devices.len(),
            assets: file.assets.len(),
            ..CatalogSummary::default()
        };

        let mut seen = HashSet::new();
        let mut tenants = HashSet::new();
        let rules = Arc::new(MemoryRuleSource::new());
        for rule in file.rules {
            if !seen.insert(rule.id) {
                bail!("Duplicate alarm rule id {}", rule.id);
            }
            tenants.insert(rule.tenant_id);
            match rule.validate() {
                Ok(()) if rule.enabled => summary.enabled += 1,
                Ok(()) => {},
                Err(e) => summary.invalid.push((rule.id, e.to_string())),
            }
            rules.put(rule);
        }
        summary.tenants = tenants.len();

        let device_profiles = Arc::new(MemoryProfileCache::new());
        for device in &file.devices {
            device_profiles.set(
                device.tenant_id,
                EntityId::device(device.id),
                EntityId::device_profile(device.profile_id),
            );
        }
        let asset_profiles = Arc::new(MemoryProfileCache::new());
        for asset in &file.assets {
            asset_profiles.set(
                asset.tenant_id,
                EntityId::asset(asset.id),
                EntityId::asset_profile(asset.profile_id),
            );
        }

        Ok(Self {
            rules,
            device_profiles,
            asset_profiles,
            summary,
        })
    }

    pub fn rule_source(&self) -> Arc<MemoryRuleSource> {
        Arc::clone(&self.rules)
    }

    pub fn device_profiles(&self) -> Arc<MemoryProfileCache> {
        Arc::clone(&self.device_profiles)
    }

    pub fn asset_profiles(&self) -> Arc<MemoryProfileCache> {
        Arc::clone(&self.asset_profiles)
    }

    pub fn summary(&self) -> &CatalogSummary {
        &self.summary
    }
}
