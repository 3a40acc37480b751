//! OpenAI-compatible provider: streamed chat completions, transcription and
//! speech synthesis.

use super::prompts::task_messages;
use super::sse::SseLineParser;
use super::{
    response_bytes, ByteStream, ChatMessage, ProviderError, ProviderStream, SpeechToText,
    TextProvider, TextTask, TextToSpeech, DEFAULT_PROVIDER_TIMEOUT,
};
use crate::audio::AudioUnit;
use crate::config::{OpenAiSettings, DEFAULT_OPENAI_BASE_URL, DEFAULT_TTS_VOICE};
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::StreamExt;
use reqwest::{multipart, Client};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const CONTEXT_LIMIT_CODES: &[&str] = &["context_length_exceeded", "string_above_max_length"];

/// OpenAI provider using the Chat Completions and Audio APIs
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
    voice: String,
    language: Option<String>,
    enable_image_support: bool,
    enable_audio_support: bool,
    timeout: Option<Duration>,
}

impl OpenAiProvider {
    /// Create a new OpenAI provider with the given API key
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            voice: DEFAULT_TTS_VOICE.to_string(),
            language: None,
            enable_image_support: false,
            enable_audio_support: false,
            timeout: Some(DEFAULT_PROVIDER_TIMEOUT),
        }
    }

    /// Create from feature settings, sharing an HTTP client
    pub fn from_settings(client: Client, settings: &OpenAiSettings) -> Self {
        let model = if settings.model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            settings.model.clone()
        };
        Self {
            client,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model,
            temperature: settings.temperature,
            voice: settings
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string()),
            language: settings.language.clone(),
            enable_image_support: settings.enable_image_support,
            enable_audio_support: settings.enable_audio_support,
            timeout: Some(DEFAULT_PROVIDER_TIMEOUT),
        }
    }

    /// Set the timeout for non-streaming requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn message_json(&self, message: &ChatMessage) -> Result<Value, ProviderError> {
        if message.attachments.is_empty() {
            return Ok(json!({ "role": message.role.as_str(), "content": message.content }));
        }

        let mut parts = vec![json!({ "type": "text", "text": message.content })];
        for attachment in &message.attachments {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&attachment.bytes);
            if attachment.mime_type.starts_with("image/") {
                if !self.enable_image_support {
                    return Err(ProviderError::Unsupported(
                        "image input is disabled for this provider".to_string(),
                    ));
                }
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", attachment.mime_type, encoded) }
                }));
            } else if attachment.mime_type.starts_with("audio/") {
                if !self.enable_audio_support {
                    return Err(ProviderError::Unsupported(
                        "audio input is disabled for this provider".to_string(),
                    ));
                }
                let format = if attachment.mime_type.contains("mpeg") {
                    "mp3"
                } else {
                    "wav"
                };
                parts.push(json!({
                    "type": "input_audio",
                    "input_audio": { "data": encoded, "format": format }
                }));
            } else {
                return Err(ProviderError::Unsupported(format!(
                    "unsupported attachment type '{}'",
                    attachment.mime_type
                )));
            }
        }
        Ok(json!({ "role": message.role.as_str(), "content": parts }))
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response.text().await.unwrap_or_default();
        Err(api_error(status.as_u16(), &error_text))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

fn api_error(status: u16, body: &str) -> ProviderError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => {
            let code = parsed.error.code.as_deref().unwrap_or("");
            if CONTEXT_LIMIT_CODES.contains(&code) {
                ProviderError::QuotaExceeded(parsed.error.message)
            } else {
                ProviderError::Http {
                    status,
                    message: parsed.error.message,
                }
            }
        }
        Err(_) => ProviderError::Http {
            status,
            message: body.to_string(),
        },
    }
}

/// Extract the text delta (or an in-band error) from one completions chunk.
fn parse_completions_chunk(data: &str) -> Result<Option<String>, ProviderError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad stream chunk: {}", e)))?;

    if let Some(error) = value.get("error") {
        let body = json!({ "error": error }).to_string();
        return Err(api_error(500, &body));
    }

    let delta = value
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Ok(delta)
}

struct StreamState {
    bytes: ByteStream,
    parser: SseLineParser,
    pending: VecDeque<String>,
    failure: Option<ProviderError>,
    finished: bool,
}

/// Turn an SSE byte stream into a stream of text deltas.
fn delta_stream(bytes: ByteStream) -> ProviderStream {
    let state = StreamState {
        bytes,
        parser: SseLineParser::new(),
        pending: VecDeque::new(),
        failure: None,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            // Deltas parsed before an in-band error are delivered first.
            if let Some(e) = state.failure.take() {
                return Some((Err(e), state));
            }
            if state.finished {
                return None;
            }

            let events = match state.bytes.next().await {
                Some(Ok(chunk)) => state.parser.push(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ProviderError::Network(e)), state));
                }
                None => {
                    state.finished = true;
                    state.parser.flush().into_iter().collect()
                }
            };

            for event in events {
                if event.is_done() {
                    state.finished = true;
                    break;
                }
                match parse_completions_chunk(&event.data) {
                    Ok(Some(delta)) => state.pending.push_back(delta),
                    Ok(None) => {}
                    Err(e) => {
                        state.finished = true;
                        state.failure = Some(e);
                        break;
                    }
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl TextProvider for OpenAiProvider {
    async fn stream(&self, task: TextTask) -> Result<ProviderStream, ProviderError> {
        let messages = task_messages(&task)
            .iter()
            .map(|m| self.message_json(m))
            .collect::<Result<Vec<_>, _>>()?;

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }

        log::debug!(
            "OpenAI: streaming {:?} with model {}",
            task.feature(),
            self.model
        );

        // No request timeout here: the caller bounds the whole stream.
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;

        Ok(delta_stream(response_bytes(response)))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[async_trait]
impl SpeechToText for OpenAiProvider {
    async fn transcribe(&self, audio: &AudioUnit) -> Result<String, ProviderError> {
        if audio.is_empty() {
            return Err(ProviderError::Audio("no audio to transcribe".to_string()));
        }

        let file_name = format!("audio.{}", audio.file_extension());
        let part = multipart::Part::bytes(audio.bytes().to_vec())
            .file_name(file_name)
            .mime_str(audio.mime_type())
            .map_err(|e| ProviderError::Audio(format!("Failed to create multipart: {}", e)))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");
        if let Some(language) = self.language.as_deref().filter(|l| !l.is_empty()) {
            form = form.text("language", language.to_string());
        }

        let mut req = self
            .client
            .post(self.url("/audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let response = Self::check_response(req.send().await?).await?;
        let result: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let text = result
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse("transcription has no 'text'".to_string()))?;
        Ok(text.trim().to_string())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[async_trait]
impl TextToSpeech for OpenAiProvider {
    async fn synthesize(&self, text: &str) -> Result<AudioUnit, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::Unsupported("nothing to synthesize".to_string()));
        }

        let body = json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            // WAV so the envelope extractor can derive lip-sync motion
            "response_format": "wav",
        });

        let mut req = self
            .client
            .post(self.url("/audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let response = Self::check_response(req.send().await?).await?;
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("audio/"))
            .unwrap_or("audio/wav")
            .to_string();
        let bytes = response.bytes().await?;
        Ok(AudioUnit::new(bytes.to_vec(), mime))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
