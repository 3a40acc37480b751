//! Feature configuration: schema, validation and session fingerprints.
//!
//! [`AppConfig`] is the document persisted in the `config` storage namespace.
//! It holds one [`FeatureConfig`] per [`FeatureKind`] plus audio settings.
//! [`validate_feature_config`] is a pure function that reports *every*
//! violated constraint, and [`FeatureConfig::session_fingerprint`] defines
//! when two configurations are behaviorally identical.

pub mod controller;
mod defaults;

pub use controller::ConfigController;
pub use defaults::{
    default_model_for, DEFAULT_OLLAMA_BASE_URL, DEFAULT_OPENAI_BASE_URL, DEFAULT_TTS_VOICE,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_SETTLE_DELAY_MS: u64 = 300;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 500;
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 100;
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 500;

const MAX_TEMPERATURE: f32 = 2.0;

/// Every user-facing feature the assistant exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Chat,
    Translate,
    Summarize,
    Rewrite,
    DetectLanguage,
    SpeechToText,
    TextToSpeech,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 7] = [
        FeatureKind::Chat,
        FeatureKind::Translate,
        FeatureKind::Summarize,
        FeatureKind::Rewrite,
        FeatureKind::DetectLanguage,
        FeatureKind::SpeechToText,
        FeatureKind::TextToSpeech,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureKind::Chat => "chat",
            FeatureKind::Translate => "translate",
            FeatureKind::Summarize => "summarize",
            FeatureKind::Rewrite => "rewrite",
            FeatureKind::DetectLanguage => "detect_language",
            FeatureKind::SpeechToText => "speech_to_text",
            FeatureKind::TextToSpeech => "text_to_speech",
        }
    }

    /// Text-generation features (served by a `TextProvider`).
    pub fn is_text(self) -> bool {
        !matches!(self, FeatureKind::SpeechToText | FeatureKind::TextToSpeech)
    }

    pub fn supports(self, provider: ProviderKind) -> bool {
        match provider {
            ProviderKind::OpenAi => true,
            ProviderKind::Ollama | ProviderKind::OnDevice => self.is_text(),
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider backends a feature can be served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    OnDevice,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::OnDevice => "on_device",
        }
    }

    pub fn is_networked(self) -> bool {
        !matches!(self, ProviderKind::OnDevice)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    /// Voice for text-to-speech.
    pub voice: Option<String>,
    /// Language hint for speech-to-text (ISO-639-1).
    pub language: Option<String>,
    pub enable_image_support: bool,
    pub enable_audio_support: bool,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: String::new(),
            temperature: None,
            voice: None,
            language: None,
            enable_image_support: false,
            enable_audio_support: false,
        }
    }
}

/// Local Ollama server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: String::new(),
            temperature: None,
            top_k: None,
        }
    }
}

/// On-device model settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnDeviceSettings {
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
}

/// Per-feature configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub enabled: bool,
    pub provider: ProviderKind,
    /// Follow the chat feature's provider settings when chat is reconfigured.
    pub inherit_chat_provider: bool,
    pub openai: OpenAiSettings,
    pub ollama: OllamaSettings,
    pub on_device: OnDeviceSettings,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: ProviderKind::OpenAi,
            inherit_chat_provider: false,
            openai: OpenAiSettings::default(),
            ollama: OllamaSettings::default(),
            on_device: OnDeviceSettings::default(),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "provider", content = "settings", rename_all = "snake_case")]
enum Fingerprint<'a> {
    #[serde(rename = "openai")]
    OpenAi(&'a OpenAiSettings),
    Ollama(&'a OllamaSettings),
    OnDevice(&'a OnDeviceSettings),
}

impl FeatureConfig {
    /// Default configuration for a feature, with default models filled in.
    pub fn default_for(feature: FeatureKind) -> Self {
        let mut config = Self::default();
        if let Some(model) = default_model_for(feature, ProviderKind::OpenAi) {
            config.openai.model = model.to_string();
        }
        if let Some(model) = default_model_for(feature, ProviderKind::Ollama) {
            config.ollama.model = model.to_string();
        }
        if feature == FeatureKind::TextToSpeech {
            config.openai.voice = Some(DEFAULT_TTS_VOICE.to_string());
        }
        config
    }

    /// Canonical description of everything that affects a live session.
    ///
    /// Two configurations are behaviorally identical iff their fingerprints are
    /// byte-equal: the provider id plus the full settings block of the active
    /// provider, serialized as JSON in declaration order. `enabled`,
    /// `inherit_chat_provider` and the inactive provider blocks are excluded.
    pub fn session_fingerprint(&self) -> String {
        let fingerprint = match self.provider {
            ProviderKind::OpenAi => Fingerprint::OpenAi(&self.openai),
            ProviderKind::Ollama => Fingerprint::Ollama(&self.ollama),
            ProviderKind::OnDevice => Fingerprint::OnDevice(&self.on_device),
        };
        // Plain structs of strings, numbers and options always serialize.
        serde_json::to_string(&fingerprint).unwrap_or_default()
    }

    /// Copy the chat feature's provider selection and connection settings.
    ///
    /// On-device language pairs stay with the dependent feature.
    pub fn inherit_provider_from(&self, chat: &FeatureConfig) -> FeatureConfig {
        let mut merged = self.clone();
        merged.provider = chat.provider;
        merged.openai.api_key = chat.openai.api_key.clone();
        merged.openai.base_url = chat.openai.base_url.clone();
        merged.ollama = chat.ollama.clone();
        if self.openai.model.is_empty() {
            merged.openai.model = chat.openai.model.clone();
        }
        merged.on_device.temperature = chat.on_device.temperature;
        merged.on_device.top_k = chat.on_device.top_k;
        merged
    }
}

/// Audio pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Delay between releasing the microphone and the next playback.
    pub settle_delay_ms: u64,
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub lip_sync: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            lip_sync: false,
        }
    }
}

/// The persisted application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub features: BTreeMap<FeatureKind, FeatureConfig>,
    pub audio: AudioSettings,
    pub autosave_debounce_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            features: FeatureKind::ALL
                .iter()
                .map(|f| (*f, FeatureConfig::default_for(*f)))
                .collect(),
            audio: AudioSettings::default(),
            autosave_debounce_ms: DEFAULT_AUTOSAVE_DEBOUNCE_MS,
        }
    }
}

impl AppConfig {
    /// Configuration of a feature (defaults when absent).
    pub fn feature(&self, feature: FeatureKind) -> FeatureConfig {
        self.features
            .get(&feature)
            .cloned()
            .unwrap_or_else(|| FeatureConfig::default_for(feature))
    }

    pub fn feature_mut(&mut self, feature: FeatureKind) -> &mut FeatureConfig {
        self.features
            .entry(feature)
            .or_insert_with(|| FeatureConfig::default_for(feature))
    }

    /// Features whose configuration differs between `self` and `other`.
    pub fn changed_features(&self, other: &AppConfig) -> Vec<FeatureKind> {
        FeatureKind::ALL
            .iter()
            .copied()
            .filter(|f| self.feature(*f) != other.feature(*f))
            .collect()
    }
}

/// Result of validating a feature configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> Result<(), crate::error::AssistantError> {
        if self.valid {
            Ok(())
        } else {
            Err(crate::error::AssistantError::validation(self.errors))
        }
    }
}

fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    (url.starts_with("http://") && url.len() > "http://".len())
        || (url.starts_with("https://") && url.len() > "https://".len())
}

fn check_temperature(prefix: &str, temperature: Option<f32>, errors: &mut Vec<String>) {
    if let Some(t) = temperature {
        if !t.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&t) {
            errors.push(format!(
                "{}.temperature must be between 0 and {} (got {})",
                prefix, MAX_TEMPERATURE, t
            ));
        }
    }
}

fn check_top_k(prefix: &str, top_k: Option<u32>, errors: &mut Vec<String>) {
    if top_k == Some(0) {
        errors.push(format!("{}.top_k must be at least 1", prefix));
    }
}

/// Validate a feature configuration, listing every violated constraint.
///
/// Host support for on-device providers is checked separately by the
/// session manager because it depends on the runtime, not the document.
pub fn validate_feature_config(feature: FeatureKind, config: &FeatureConfig) -> ValidationReport {
    let mut errors = Vec::new();

    if !feature.supports(config.provider) {
        errors.push(format!(
            "provider '{}' does not support feature '{}'",
            config.provider, feature
        ));
    }

    match config.provider {
        ProviderKind::OpenAi => {
            let s = &config.openai;
            if s.api_key.trim().is_empty() {
                errors.push("openai.api_key is required".to_string());
            }
            if !is_http_url(&s.base_url) {
                errors.push("openai.base_url must be an http(s) URL".to_string());
            }
            if s.model.trim().is_empty() {
                errors.push("openai.model is required".to_string());
            }
            check_temperature("openai", s.temperature, &mut errors);
            if feature == FeatureKind::TextToSpeech
                && s.voice.as_deref().map(str::trim).unwrap_or("").is_empty()
            {
                errors.push("openai.voice is required for text_to_speech".to_string());
            }
        }
        ProviderKind::Ollama => {
            let s = &config.ollama;
            if !is_http_url(&s.base_url) {
                errors.push("ollama.base_url must be an http(s) URL".to_string());
            }
            if s.model.trim().is_empty() {
                errors.push("ollama.model is required".to_string());
            }
            check_temperature("ollama", s.temperature, &mut errors);
            check_top_k("ollama", s.top_k, &mut errors);
        }
        ProviderKind::OnDevice => {
            let s = &config.on_device;
            check_temperature("on_device", s.temperature, &mut errors);
            check_top_k("on_device", s.top_k, &mut errors);
            if feature == FeatureKind::Translate {
                if s.source_language.as_deref().unwrap_or("").trim().is_empty() {
                    errors.push("on_device.source_language is required for translate".to_string());
                }
                if s.target_language.as_deref().unwrap_or("").trim().is_empty() {
                    errors.push("on_device.target_language is required for translate".to_string());
                }
            }
        }
    }

    ValidationReport::from_errors(errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_chat() -> FeatureConfig {
        let mut config = FeatureConfig::default_for(FeatureKind::Chat);
        config.enabled = true;
        config.openai.api_key = "sk-test".to_string();
        config
    }

    #[test]
    fn test_validation_lists_every_missing_field() {
        let mut config = FeatureConfig::default();
        config.openai.base_url = String::new();
        config.openai.temperature = Some(3.5);

        let report = validate_feature_config(FeatureKind::Chat, &config);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4, "errors: {:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("api_key")));
        assert!(report.errors.iter().any(|e| e.contains("base_url")));
        assert!(report.errors.iter().any(|e| e.contains("model")));
        assert!(report.errors.iter().any(|e| e.contains("temperature")));
    }

    #[test]
    fn test_valid_openai_chat() {
        let report = validate_feature_config(FeatureKind::Chat, &openai_chat());
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn test_provider_must_support_feature() {
        let mut config = FeatureConfig::default_for(FeatureKind::SpeechToText);
        config.provider = ProviderKind::Ollama;
        let report = validate_feature_config(FeatureKind::SpeechToText, &config);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("does not support feature 'speech_to_text'")));
    }

    #[test]
    fn test_on_device_translate_needs_language_pair() {
        let mut config = FeatureConfig::default_for(FeatureKind::Translate);
        config.provider = ProviderKind::OnDevice;
        let report = validate_feature_config(FeatureKind::Translate, &config);
        assert_eq!(report.errors.len(), 2);

        config.on_device.source_language = Some("en".to_string());
        config.on_device.target_language = Some("de".to_string());
        assert!(validate_feature_config(FeatureKind::Translate, &config).valid);
    }

    #[test]
    fn test_fingerprint_ignores_enablement_and_inactive_blocks() {
        let a = openai_chat();
        let mut b = a.clone();
        b.enabled = false;
        b.inherit_chat_provider = true;
        b.ollama.model = "mistral".to_string();
        b.on_device.top_k = Some(3);
        assert_eq!(a.session_fingerprint(), b.session_fingerprint());

        let mut c = a.clone();
        c.openai.model = "gpt-4o".to_string();
        assert_ne!(a.session_fingerprint(), c.session_fingerprint());

        let mut d = a.clone();
        d.provider = ProviderKind::Ollama;
        assert_ne!(a.session_fingerprint(), d.session_fingerprint());
    }

    #[test]
    fn test_app_config_json_uses_feature_names() {
        let config = AppConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["features"]["speech_to_text"].is_object());
        assert_eq!(json["features"]["chat"]["provider"], "openai");

        let back: AppConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_inherit_provider_keeps_language_pair() {
        let mut chat = FeatureConfig::default_for(FeatureKind::Chat);
        chat.provider = ProviderKind::OnDevice;
        chat.on_device.temperature = Some(0.4);

        let mut translate = FeatureConfig::default_for(FeatureKind::Translate);
        translate.on_device.target_language = Some("fr".to_string());

        let merged = translate.inherit_provider_from(&chat);
        assert_eq!(merged.provider, ProviderKind::OnDevice);
        assert_eq!(merged.on_device.temperature, Some(0.4));
        assert_eq!(merged.on_device.target_language.as_deref(), Some("fr"));
    }

    #[test]
    fn test_changed_features() {
        let a = AppConfig::default();
        let mut b = a.clone();
        b.feature_mut(FeatureKind::Summarize).enabled = true;
        assert_eq!(a.changed_features(&b), vec![FeatureKind::Summarize]);
    }
}
