//! Provider clients behind the session manager.
//!
//! A provider turns a [`TextTask`] into a stream of text deltas, or audio into
//! text and back. Networked providers (`openai`, `ollama`) talk HTTP; the
//! `on_device` provider delegates to a host runtime trait. Every provider
//! failure is a [`ProviderError`], mapped once into
//! [`AssistantError`](crate::error::AssistantError) by its `From` impl.

mod ollama;
mod on_device;
mod openai;
pub mod prompts;
pub mod sse;

pub use ollama::OllamaProvider;
pub use on_device::{OnDeviceRuntime, UnsupportedRuntime};
pub use openai::OpenAiProvider;

use crate::audio::{AudioUnit, WireBinary};
use crate::config::{FeatureConfig, FeatureKind, ProviderKind};
use crate::error::{AssistantError, NetworkErrorKind};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for non-streaming provider requests.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// Stream of text deltas produced by a provider.
pub type ProviderStream = BoxStream<'static, Result<String, ProviderError>>;

pub(crate) type ByteStream = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

/// Body of a streaming HTTP response. Dropping it aborts the request.
pub(crate) fn response_bytes(response: reqwest::Response) -> ByteStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()))
        .boxed()
}

/// Errors that can occur while talking to a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Context limit exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider not available: {0}")]
    Unavailable(String),

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Audio processing error: {0}")]
    Audio(String),
}

/// Map an HTTP status to the network error sub-kind, if it has one.
pub fn classify_status(status: u16) -> Option<NetworkErrorKind> {
    match status {
        401 | 403 => Some(NetworkErrorKind::Unauthorized),
        429 => Some(NetworkErrorKind::RateLimited),
        502..=504 => Some(NetworkErrorKind::Unreachable),
        _ => None,
    }
}

impl From<ProviderError> for AssistantError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Network(err) => {
                let kind = if err.is_connect() || err.is_timeout() {
                    NetworkErrorKind::Unreachable
                } else {
                    err.status()
                        .and_then(|s| classify_status(s.as_u16()))
                        .unwrap_or(NetworkErrorKind::Other)
                };
                AssistantError::Network {
                    kind,
                    message: err.to_string(),
                }
            }
            ProviderError::Http { status, message } => match classify_status(status) {
                Some(kind) => AssistantError::Network {
                    kind,
                    message: format!("HTTP {}: {}", status, message),
                },
                None => AssistantError::Provider {
                    message: format!("HTTP {}: {}", status, message),
                },
            },
            ProviderError::QuotaExceeded(message) => AssistantError::QuotaExceeded { message },
            ProviderError::Unavailable(message) => AssistantError::ProviderUnavailable { message },
            other => AssistantError::Provider {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One message of a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Image or audio attachments, forwarded only to providers with the
    /// matching capability flag enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<WireBinary>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn with_attachment(mut self, attachment: WireBinary) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// A text-generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum TextTask {
    Chat {
        messages: Vec<ChatMessage>,
    },
    Translate {
        text: String,
        source_language: Option<String>,
        target_language: String,
    },
    Summarize {
        text: String,
    },
    Rewrite {
        text: String,
        instructions: Option<String>,
    },
    DetectLanguage {
        text: String,
    },
}

impl TextTask {
    pub fn feature(&self) -> FeatureKind {
        match self {
            TextTask::Chat { .. } => FeatureKind::Chat,
            TextTask::Translate { .. } => FeatureKind::Translate,
            TextTask::Summarize { .. } => FeatureKind::Summarize,
            TextTask::Rewrite { .. } => FeatureKind::Rewrite,
            TextTask::DetectLanguage { .. } => FeatureKind::DetectLanguage,
        }
    }
}

/// Streaming text generation.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Start generating; the returned stream yields text deltas in order.
    async fn stream(&self, task: TextTask) -> Result<ProviderStream, ProviderError>;

    /// Get the provider name
    fn name(&self) -> &'static str;

    /// Release provider-side resources (on-device sessions hold model memory).
    async fn close(&self) {}
}

/// Trait for Speech-to-Text providers
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &AudioUnit) -> Result<String, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Trait for Text-to-Speech providers
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioUnit, ProviderError>;

    fn name(&self) -> &'static str;
}

/// The client half of a provider session.
#[derive(Clone)]
pub enum SessionClient {
    Text(Arc<dyn TextProvider>),
    SpeechToText(Arc<dyn SpeechToText>),
    TextToSpeech(Arc<dyn TextToSpeech>),
}

impl SessionClient {
    pub fn name(&self) -> &'static str {
        match self {
            SessionClient::Text(p) => p.name(),
            SessionClient::SpeechToText(p) => p.name(),
            SessionClient::TextToSpeech(p) => p.name(),
        }
    }

    pub async fn close(&self) {
        if let SessionClient::Text(p) = self {
            p.close().await;
        }
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            SessionClient::Text(_) => "Text",
            SessionClient::SpeechToText(_) => "SpeechToText",
            SessionClient::TextToSpeech(_) => "TextToSpeech",
        };
        write!(f, "SessionClient::{}({})", kind, self.name())
    }
}

/// Collect a provider stream into one string.
#[cfg(test)]
pub(crate) async fn collect_stream(mut stream: ProviderStream) -> Result<String, ProviderError> {
    let mut out = String::new();
    while let Some(delta) = stream.next().await {
        out.push_str(&delta?);
    }
    Ok(out)
}

/// Builds session clients from validated configuration.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(
        &self,
        feature: FeatureKind,
        config: &FeatureConfig,
    ) -> Result<SessionClient, ProviderError>;
}

/// Factory for the built-in providers.
pub struct DefaultProviderFactory {
    client: reqwest::Client,
    on_device: Arc<dyn OnDeviceRuntime>,
}

impl DefaultProviderFactory {
    pub fn new(on_device: Arc<dyn OnDeviceRuntime>) -> Self {
        Self {
            client: reqwest::Client::new(),
            on_device,
        }
    }
}

#[async_trait]
impl ProviderFactory for DefaultProviderFactory {
    async fn create(
        &self,
        feature: FeatureKind,
        config: &FeatureConfig,
    ) -> Result<SessionClient, ProviderError> {
        match config.provider {
            ProviderKind::OpenAi => {
                let provider = Arc::new(OpenAiProvider::from_settings(
                    self.client.clone(),
                    &config.openai,
                ));
                Ok(match feature {
                    FeatureKind::SpeechToText => SessionClient::SpeechToText(provider),
                    FeatureKind::TextToSpeech => SessionClient::TextToSpeech(provider),
                    _ => SessionClient::Text(provider),
                })
            }
            ProviderKind::Ollama => Ok(SessionClient::Text(Arc::new(
                OllamaProvider::from_settings(self.client.clone(), &config.ollama),
            ))),
            ProviderKind::OnDevice => {
                let session = self
                    .on_device
                    .create_session(feature, &config.on_device)
                    .await?;
                Ok(SessionClient::Text(session))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401), Some(NetworkErrorKind::Unauthorized));
        assert_eq!(classify_status(403), Some(NetworkErrorKind::Unauthorized));
        assert_eq!(classify_status(429), Some(NetworkErrorKind::RateLimited));
        assert_eq!(classify_status(503), Some(NetworkErrorKind::Unreachable));
        assert_eq!(classify_status(400), None);
    }

    #[test]
    fn test_provider_error_mapping() {
        let err: AssistantError = ProviderError::Http {
            status: 401,
            message: "bad key".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            AssistantError::Network {
                kind: NetworkErrorKind::Unauthorized,
                ..
            }
        ));

        let err: AssistantError = ProviderError::Http {
            status: 400,
            message: "bad request".to_string(),
        }
        .into();
        assert_eq!(err.kind_name(), "provider");

        let err: AssistantError = ProviderError::QuotaExceeded("too long".to_string()).into();
        assert_eq!(
            err,
            AssistantError::QuotaExceeded {
                message: "too long".to_string()
            }
        );

        let err: AssistantError = ProviderError::Unavailable("no model".to_string()).into();
        assert_eq!(err.kind_name(), "provider_unavailable");
    }

    #[test]
    fn test_task_feature() {
        let task = TextTask::Rewrite {
            text: "hi".to_string(),
            instructions: None,
        };
        assert_eq!(task.feature(), FeatureKind::Rewrite);
    }
}
