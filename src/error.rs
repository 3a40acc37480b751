//! Error taxonomy shared by both execution modes.
//!
//! Every error that reaches a [`Router`](crate::router::Router) caller is an
//! [`AssistantError`], whether it was produced locally or deserialized from a
//! bridge frame. The enum is serde-serializable so the far side can ship it
//! back verbatim and the caller sees the same kind in either mode.

use crate::config::FeatureKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sub-kinds of network failures, classified once at the provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Unauthorized,
    RateLimited,
    Unreachable,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkErrorKind::Unauthorized => "unauthorized",
            NetworkErrorKind::RateLimited => "rate limited",
            NetworkErrorKind::Unreachable => "unreachable",
            NetworkErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Errors surfaced at the Router boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssistantError {
    #[error("Invalid configuration: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("Provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    #[error("Network error ({kind}): {message}")]
    Network {
        #[serde(rename = "network_kind")]
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("Quota exceeded: {message}. Start a new conversation to continue")]
    QuotaExceeded { message: String },

    #[error("Cross-context channel did not become ready within {waited_ms} ms")]
    ChannelUnavailable { waited_ms: u64 },

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Recording error: {message}")]
    Recording { message: String },

    #[error("Feature '{feature}' is not configured")]
    NotConfigured { feature: FeatureKind },

    #[error("Unknown execution scope {scope}")]
    UnknownScope { scope: u64 },

    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl AssistantError {
    pub fn validation(errors: Vec<String>) -> Self {
        AssistantError::Validation { errors }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        AssistantError::Timeout {
            operation: operation.into(),
            timeout_ms: after.as_millis() as u64,
        }
    }

    pub fn channel_unavailable(waited: Duration) -> Self {
        AssistantError::ChannelUnavailable {
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn recording(message: impl Into<String>) -> Self {
        AssistantError::Recording {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        AssistantError::Storage {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        AssistantError::Protocol {
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        AssistantError::Provider {
            message: message.into(),
        }
    }

    /// Short machine-friendly name of the error kind (matches the wire tag).
    pub fn kind_name(&self) -> &'static str {
        match self {
            AssistantError::Validation { .. } => "validation",
            AssistantError::ProviderUnavailable { .. } => "provider_unavailable",
            AssistantError::Network { .. } => "network",
            AssistantError::QuotaExceeded { .. } => "quota_exceeded",
            AssistantError::ChannelUnavailable { .. } => "channel_unavailable",
            AssistantError::Timeout { .. } => "timeout",
            AssistantError::Recording { .. } => "recording",
            AssistantError::NotConfigured { .. } => "not_configured",
            AssistantError::UnknownScope { .. } => "unknown_scope",
            AssistantError::Provider { .. } => "provider",
            AssistantError::Storage { .. } => "storage",
            AssistantError::Protocol { .. } => "protocol",
            AssistantError::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for AssistantError {
    fn from(e: serde_json::Error) -> Self {
        AssistantError::protocol(format!("serialization failed: {}", e))
    }
}

/// User-visible status of the most recent call of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Idle,
    InProgress,
    Succeeded,
    Failed(String),
}

impl FeatureStatus {
    pub fn from_result<T>(result: &Result<T, AssistantError>) -> Self {
        match result {
            Ok(_) => FeatureStatus::Succeeded,
            Err(AssistantError::Cancelled) => FeatureStatus::Idle,
            Err(e) => FeatureStatus::Failed(e.to_string()),
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureStatus::Idle => f.write_str("idle"),
            FeatureStatus::InProgress => f.write_str("in progress"),
            FeatureStatus::Succeeded => f.write_str("succeeded"),
            FeatureStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_error() {
        let err = AssistantError::validation(vec![
            "openai.api_key is required".to_string(),
            "openai.model is required".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("api_key"));
        assert!(msg.contains("model"));
    }

    #[test]
    fn test_error_survives_wire_round_trip() {
        let err = AssistantError::Network {
            kind: NetworkErrorKind::RateLimited,
            message: "slow down".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"network\""));
        assert!(json.contains("\"network_kind\":\"rate_limited\""));
        let back: AssistantError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);

        let cancelled: AssistantError =
            serde_json::from_str(&serde_json::to_string(&AssistantError::Cancelled).unwrap())
                .unwrap();
        assert_eq!(cancelled, AssistantError::Cancelled);
    }

    #[test]
    fn test_feature_status_text() {
        assert_eq!(FeatureStatus::InProgress.to_string(), "in progress");
        assert_eq!(FeatureStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(
            FeatureStatus::Failed("boom".to_string()).to_string(),
            "failed: boom"
        );

        let failed: Result<(), _> = Err(AssistantError::recording("mic denied"));
        assert_eq!(
            FeatureStatus::from_result(&failed).to_string(),
            "failed: Recording error: mic denied"
        );
    }
}
