//! Wire protocol between the page context and the background context.
//!
//! Every message is one JSON [`Frame`], tagged by `kind`. A request carries a
//! [`Command`]; the far side answers unary commands with one `response` frame
//! and streaming commands with zero or more `chunk` frames followed by
//! exactly one terminal `chunk` (`done: true` or `error`).

use crate::audio::WireBinary;
use crate::config::{FeatureConfig, FeatureKind};
use crate::error::AssistantError;
use crate::providers::ChatMessage;
use crate::scope::ExecutionScope;
use crate::storage::StorageCommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Default timeout for unary commands.
pub const UNARY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default deadline for a whole generative stream.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(120);
/// Default deadline for monitoring a model download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
/// How long the near side waits for the far side's `ready` frame.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-request chunk queue capacity on the near side.
pub const STREAM_CAPACITY: usize = 256;

/// The closed set of cross-context operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    CreateScope,
    DestroyScope,
    Configure {
        feature: FeatureKind,
        config: FeatureConfig,
    },
    IsConfigured {
        feature: FeatureKind,
    },
    Destroy {
        feature: FeatureKind,
    },
    CheckAvailability {
        feature: FeatureKind,
        config: FeatureConfig,
    },
    /// Streams `DownloadEvent`s.
    MonitorDownload {
        feature: FeatureKind,
        config: FeatureConfig,
    },
    /// Streams text deltas.
    Chat {
        messages: Vec<ChatMessage>,
    },
    Translate {
        text: String,
        source_language: Option<String>,
        target_language: String,
    },
    /// Streams text deltas when `stream` is set.
    Summarize {
        text: String,
        #[serde(default)]
        stream: bool,
    },
    Rewrite {
        text: String,
        instructions: Option<String>,
    },
    DetectLanguage {
        text: String,
    },
    Transcribe {
        audio: WireBinary,
    },
    Synthesize {
        text: String,
        lip_sync: bool,
    },
    Storage(StorageCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateScope => "create_scope",
            Command::DestroyScope => "destroy_scope",
            Command::Configure { .. } => "configure",
            Command::IsConfigured { .. } => "is_configured",
            Command::Destroy { .. } => "destroy",
            Command::CheckAvailability { .. } => "check_availability",
            Command::MonitorDownload { .. } => "monitor_download",
            Command::Chat { .. } => "chat",
            Command::Translate { .. } => "translate",
            Command::Summarize { .. } => "summarize",
            Command::Rewrite { .. } => "rewrite",
            Command::DetectLanguage { .. } => "detect_language",
            Command::Transcribe { .. } => "transcribe",
            Command::Synthesize { .. } => "synthesize",
            Command::Storage(_) => "storage",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Command::Chat { .. } | Command::MonitorDownload { .. } | Command::Summarize { stream: true, .. }
        )
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            Command::MonitorDownload { .. } => DOWNLOAD_TIMEOUT,
            Command::Chat { .. } | Command::Summarize { stream: true, .. } => STREAM_TIMEOUT,
            _ => UNARY_TIMEOUT,
        }
    }
}

/// Reply payload of [`Command::Synthesize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisReply {
    pub audio: WireBinary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<WireBinary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: Uuid,
    pub scope: ExecutionScope,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AssistantError>,
}

impl ResponseFrame {
    pub fn from_result(request_id: Uuid, result: Result<Value, AssistantError>) -> Self {
        match result {
            Ok(data) => Self {
                request_id,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                request_id,
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, AssistantError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| AssistantError::protocol("failed response without an error")))
        }
    }
}

/// One unit of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Value>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AssistantError>,
}

impl StreamEnvelope {
    pub fn chunk(request_id: Uuid, chunk: Value) -> Self {
        Self {
            request_id,
            chunk: Some(chunk),
            done: false,
            error: None,
        }
    }

    pub fn done(request_id: Uuid) -> Self {
        Self {
            request_id,
            chunk: None,
            done: true,
            error: None,
        }
    }

    pub fn failed(request_id: Uuid, error: AssistantError) -> Self {
        Self {
            request_id,
            chunk: None,
            done: false,
            error: Some(error),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Ready,
    Request(RequestFrame),
    Abort { request_id: Uuid },
    Response(ResponseFrame),
    Chunk(StreamEnvelope),
}

impl Frame {
    pub fn to_json(&self) -> Result<String, AssistantError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> Result<Self, AssistantError> {
        serde_json::from_str(raw).map_err(|e| AssistantError::protocol(format!("malformed frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let id = Uuid::nil();
        let frame = Frame::Request(RequestFrame {
            request_id: id,
            scope: ExecutionScope::new(3),
            command: Command::Translate {
                text: "hola".to_string(),
                source_language: None,
                target_language: "en".to_string(),
            },
            timeout_ms: Some(1000),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "request");
        assert_eq!(value["scope"], 3);
        assert_eq!(value["command"]["type"], "translate");
        assert_eq!(value["command"]["payload"]["target_language"], "en");
        assert_eq!(value["timeout_ms"], 1000);

        let back = Frame::parse(&frame.to_json().unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_unit_command_and_storage_command() {
        let frame = Frame::parse(
            r#"{"kind":"request","request_id":"00000000-0000-0000-0000-000000000000","scope":0,
                "command":{"type":"storage","payload":{"op":"clear","namespace":"cache"}}}"#,
        )
        .unwrap();
        let Frame::Request(request) = frame else {
            panic!("expected a request frame");
        };
        assert_eq!(request.timeout_ms, None);
        assert_eq!(
            request.command,
            Command::Storage(StorageCommand::Clear {
                namespace: crate::storage::Namespace::Cache
            })
        );

        let value = serde_json::to_value(Command::CreateScope).unwrap();
        assert_eq!(value, json!({"type": "create_scope"}));
    }

    #[test]
    fn test_stream_envelopes() {
        let id = Uuid::new_v4();
        let chunk = serde_json::to_value(StreamEnvelope::chunk(id, json!("Hel"))).unwrap();
        assert_eq!(chunk["done"], false);
        assert_eq!(chunk["chunk"], "Hel");

        let failed = StreamEnvelope::failed(id, AssistantError::Cancelled);
        assert!(failed.is_terminal());
        let back: StreamEnvelope = serde_json::from_value(serde_json::to_value(&failed).unwrap()).unwrap();
        assert_eq!(back.error, Some(AssistantError::Cancelled));
        assert!(StreamEnvelope::done(id).is_terminal());
    }

    #[test]
    fn test_timeouts_by_command() {
        let chat = Command::Chat { messages: vec![] };
        assert!(chat.is_streaming());
        assert_eq!(chat.default_timeout(), STREAM_TIMEOUT);

        let summarize = Command::Summarize {
            text: "x".to_string(),
            stream: false,
        };
        assert!(!summarize.is_streaming());
        assert_eq!(summarize.default_timeout(), UNARY_TIMEOUT);

        let download = Command::MonitorDownload {
            feature: FeatureKind::Translate,
            config: FeatureConfig::default(),
        };
        assert_eq!(download.default_timeout(), DOWNLOAD_TIMEOUT);
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        assert_eq!(Frame::parse("{\"kind\":\"bogus\"}").unwrap_err().kind_name(), "protocol");
    }
}
