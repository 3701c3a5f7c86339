//! Alarm engine error types

use thiserror::Error;

/// Result type for alarm engine operations
pub type Result<T> = std::result::Result<T, AlarmError>;

/// Alarm engine errors
#[derive(Debug, Error)]
pub enum AlarmError {
    /// Alarm rule not found in the rule source
    #[error("Alarm rule not found: {0}")]
    RuleNotFound(String),

    /// Alarm rule failed validation
    #[error("Invalid alarm rule: {0}")]
    InvalidRule(String),

    /// Entity type cannot carry a device/asset profile
    #[error("Unsupported entity type: {0}")]
    UnsupportedEntityType(String),

    /// Queue record could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Persisted state store failure
    #[error("State store error: {0}")]
    Store(String),

    /// Rule source (fetch) failure
    #[error("Rule source error: {0}")]
    RuleSource(String),

    /// Queue transport failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AlarmError {
    /// Wrap a state store failure
    pub fn store(err: impl std::fmt::Display) -> Self {
        AlarmError::Store(err.to_string())
    }

    /// Wrap a rule source failure
    pub fn rule_source(err: impl std::fmt::Display) -> Self {
        AlarmError::RuleSource(err.to_string())
    }

    /// Wrap a queue transport failure
    pub fn queue(err: impl std::fmt::Display) -> Self {
        AlarmError::Queue(err.to_string())
    }
}

impl From<serde_json::Error> for AlarmError {
    fn from(err: serde_json::Error) -> Self {
        AlarmError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for AlarmError {
    fn from(err: anyhow::Error) -> Self {
        AlarmError::Internal(err.to_string())
    }
}
