// Centralized defaults for provider models and endpoints.
//
// These are used when a feature has not explicitly selected a model.
// Keep these in sync with the provider implementations.

use super::{FeatureKind, ProviderKind};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_TTS_VOICE: &str = "alloy";

/// Returns the default model id for a feature served by a given provider.
pub fn default_model_for(feature: FeatureKind, provider: ProviderKind) -> Option<&'static str> {
    match (provider, feature) {
        (ProviderKind::OpenAi, FeatureKind::SpeechToText) => Some("whisper-1"),
        (ProviderKind::OpenAi, FeatureKind::TextToSpeech) => Some("gpt-4o-mini-tts"),
        (ProviderKind::OpenAi, _) => Some("gpt-4o-mini"),
        (ProviderKind::Ollama, f) if f.is_text() => Some("llama3.2"),
        _ => None,
    }
}
