//! Ollama provider for local text generation.

use super::prompts::task_messages;
use super::{response_bytes, ByteStream, ProviderError, ProviderStream, TextProvider, TextTask};
use crate::config::{OllamaSettings, DEFAULT_OLLAMA_BASE_URL};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const DEFAULT_MODEL: &str = "llama3.2";

/// Ollama provider for local inference
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    temperature: Option<f32>,
    top_k: Option<u32>,
}

impl OllamaProvider {
    /// Create a new Ollama provider with default settings
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            top_k: None,
        }
    }

    /// Create from feature settings, sharing an HTTP client
    pub fn from_settings(client: Client, settings: &OllamaSettings) -> Self {
        let model = if settings.model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            settings.model.clone()
        };
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model,
            temperature: settings.temperature,
            top_k: settings.top_k,
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

/// One line of the NDJSON chat stream.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

struct StreamState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

impl StreamState {
    fn take_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<ChatChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.pending.push_back(Err(ProviderError::Http {
                        status: 500,
                        message: error,
                    }));
                    self.finished = true;
                    return;
                }
                if let Some(message) = chunk.message.filter(|m| !m.content.is_empty()) {
                    self.pending.push_back(Ok(message.content));
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                self.pending.push_back(Err(ProviderError::InvalidResponse(format!(
                    "bad stream line: {}",
                    e
                ))));
                self.finished = true;
            }
        }
    }
}

/// Turn an NDJSON byte stream into a stream of text deltas.
fn delta_stream(bytes: ByteStream) -> ProviderStream {
    let state = StreamState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while !state.finished {
                        let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') else {
                            break;
                        };
                        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                        state.take_line(&line);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ProviderError::Network(e)), state));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    state.take_line(&rest);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl TextProvider for OllamaProvider {
    async fn stream(&self, task: TextTask) -> Result<ProviderStream, ProviderError> {
        let messages = task_messages(&task);
        if messages.iter().any(|m| !m.attachments.is_empty()) {
            return Err(ProviderError::Unsupported(
                "attachments are not supported by the Ollama provider".to_string(),
            ));
        }

        let options = (self.temperature.is_some() || self.top_k.is_some()).then_some(ChatOptions {
            temperature: self.temperature,
            top_k: self.top_k,
        });
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages
                .into_iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: m.content,
                })
                .collect(),
            stream: true,
            options,
        };

        let url = format!("{}/api/chat", self.base_url);
        log::debug!("Ollama: streaming {:?} with model {}", task.feature(), self.model);

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&error_text)
                .map(|e| e.error)
                .unwrap_or(error_text);
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(delta_stream(response_bytes(response)))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{collect_stream, ChatMessage as Message};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_provider_name() {
        let provider = OllamaProvider::new();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_custom_url() {
        let settings = OllamaSettings {
            base_url: "http://192.168.1.100:11434/".to_string(),
            model: "codellama".to_string(),
            ..OllamaSettings::default()
        };
        let provider = OllamaProvider::from_settings(Client::new(), &settings);
        assert_eq!(provider.base_url, "http://192.168.1.100:11434");
        assert_eq!(provider.model, "codellama");
    }

    #[tokio::test]
    async fn test_ndjson_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Bon\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"jour\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let settings = OllamaSettings {
            base_url: server.uri(),
            model: "llama3.2".to_string(),
            ..OllamaSettings::default()
        };
        let provider = OllamaProvider::from_settings(Client::new(), &settings);
        let stream = provider
            .stream(TextTask::Chat {
                messages: vec![Message::user("hello in french")],
            })
            .await
            .unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), "Bonjour");
    }

    #[tokio::test]
    async fn test_in_band_error_after_partial_output() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"content\":\"partial\"},\"done\":false}\n",
            "{\"error\":\"model crashed\"}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let settings = OllamaSettings {
            base_url: server.uri(),
            model: "llama3.2".to_string(),
            ..OllamaSettings::default()
        };
        let provider = OllamaProvider::from_settings(Client::new(), &settings);
        let mut stream = provider
            .stream(TextTask::Summarize {
                text: "x".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        assert!(matches!(
            stream.next().await,
            Some(Err(ProviderError::Http { .. }))
        ));
        assert!(stream.next().await.is_none());
    }
}
