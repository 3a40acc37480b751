//! Execution router: one interface over both execution modes.
//!
//! The mode is fixed at construction. In [`ExecutionMode::Direct`] every call
//! goes to an in-process [`ProviderSessionManager`]; in
//! [`ExecutionMode::Bridged`] the same call becomes a [`Command`] sent to the
//! far side, and the reply is decoded back into the same types and error
//! kinds.

mod status;
mod stream;

pub use stream::TextStream;

use crate::audio::{AudioUnit, EnvelopeMotionExtractor, MotionData, MotionExtractor};
use crate::bridge::{BridgeClient, Command, SynthesisReply};
use crate::config::{FeatureConfig, FeatureKind};
use crate::error::{AssistantError, FeatureStatus};
use crate::lock;
use crate::providers::{ChatMessage, TextTask};
use crate::scope::ExecutionScope;
use crate::session::{AvailabilityReport, ConfigureOutcome, DownloadEvent, ProviderSessionManager};
use serde::de::DeserializeOwned;
use status::Tracker;
use stream::Source;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Where feature calls execute.
#[derive(Clone)]
pub enum ExecutionMode {
    Direct {
        manager: Arc<ProviderSessionManager>,
        motion: Arc<dyn MotionExtractor>,
    },
    Bridged(BridgeClient),
}

impl ExecutionMode {
    pub fn direct(manager: Arc<ProviderSessionManager>) -> Self {
        ExecutionMode::Direct {
            manager,
            motion: Arc::new(EnvelopeMotionExtractor::default()),
        }
    }

    pub fn bridged(client: BridgeClient) -> Self {
        ExecutionMode::Bridged(client)
    }

    pub fn is_bridged(&self) -> bool {
        matches!(self, ExecutionMode::Bridged(_))
    }
}

/// Synthesized speech plus optional lip-sync motion.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub audio: AudioUnit,
    pub motion: Option<MotionData>,
}

async fn cancellable<T>(
    token: &CancellationToken,
    operation: impl Future<Output = Result<T, AssistantError>>,
) -> Result<T, AssistantError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AssistantError::Cancelled),
        result = operation => result,
    }
}

fn bridged_text_command(task: TextTask) -> Command {
    match task {
        TextTask::Chat { messages } => Command::Chat { messages },
        TextTask::Translate {
            text,
            source_language,
            target_language,
        } => Command::Translate {
            text,
            source_language,
            target_language,
        },
        TextTask::Summarize { text } => Command::Summarize { text, stream: false },
        TextTask::Rewrite { text, instructions } => Command::Rewrite { text, instructions },
        TextTask::DetectLanguage { text } => Command::DetectLanguage { text },
    }
}

pub struct Router {
    mode: ExecutionMode,
    scope: ExecutionScope,
    /// Last configuration requested per feature (before inheritance).
    configs: Mutex<HashMap<FeatureKind, FeatureConfig>>,
    tracker: Arc<Tracker>,
}

impl Router {
    pub fn new(mode: ExecutionMode, scope: ExecutionScope) -> Self {
        log::info!(
            "Router: {} mode in {}",
            if mode.is_bridged() { "bridged" } else { "direct" },
            scope
        );
        Self {
            mode,
            scope,
            configs: Mutex::new(HashMap::new()),
            tracker: Arc::new(Tracker::default()),
        }
    }

    /// Router on the default scope of an in-process session manager.
    pub fn direct(manager: Arc<ProviderSessionManager>) -> Self {
        Self::new(ExecutionMode::direct(manager), ExecutionScope::DEFAULT)
    }

    /// Router on the default scope of a bridged session manager.
    pub fn bridged(client: BridgeClient) -> Self {
        Self::new(ExecutionMode::bridged(client), ExecutionScope::DEFAULT)
    }

    /// Create a fresh scope (e.g. for a new tab) and a router bound to it.
    pub async fn open_scope(mode: ExecutionMode) -> Result<Self, AssistantError> {
        let scope = match &mode {
            ExecutionMode::Direct { manager, .. } => manager.create_scope(),
            ExecutionMode::Bridged(client) => {
                client
                    .call_typed(ExecutionScope::DEFAULT, Command::CreateScope, &CancellationToken::new())
                    .await?
            }
        };
        Ok(Self::new(mode, scope))
    }

    /// Abort everything in flight and destroy every session of this scope.
    pub async fn close(&self) -> Result<usize, AssistantError> {
        for feature in FeatureKind::ALL {
            self.tracker.abort(feature);
        }
        lock(&self.configs).clear();
        match &self.mode {
            ExecutionMode::Direct { manager, .. } => Ok(manager.destroy_scope(self.scope).await),
            ExecutionMode::Bridged(client) => self.call_bridged(client, Command::DestroyScope, None).await,
        }
    }

    pub fn scope(&self) -> ExecutionScope {
        self.scope
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    pub fn status(&self, feature: FeatureKind) -> FeatureStatus {
        self.tracker.status(feature)
    }

    /// The configuration last passed to [`Router::configure`] for a feature.
    pub fn last_config(&self, feature: FeatureKind) -> Option<FeatureConfig> {
        lock(&self.configs).get(&feature).cloned()
    }

    async fn call_bridged<T: DeserializeOwned>(
        &self,
        client: &BridgeClient,
        command: Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, AssistantError> {
        match cancel {
            Some(token) => client.call_typed(self.scope, command, token).await,
            None => {
                client
                    .call_typed(self.scope, command, &CancellationToken::new())
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Configure a feature's session.
    ///
    /// A feature with `inherit_chat_provider` set runs on the chat feature's
    /// provider when chat is configured. After chat itself is configured,
    /// every enabled inheriting feature is reconfigured before this returns.
    pub async fn configure(
        &self,
        feature: FeatureKind,
        config: FeatureConfig,
    ) -> Result<ConfigureOutcome, AssistantError> {
        let effective = {
            let mut configs = lock(&self.configs);
            configs.insert(feature, config.clone());
            match configs.get(&FeatureKind::Chat) {
                Some(chat)
                    if feature != FeatureKind::Chat
                        && config.inherit_chat_provider
                        && feature.supports(chat.provider) =>
                {
                    config.inherit_provider_from(chat)
                }
                _ => config,
            }
        };

        let outcome = self.configure_session(feature, &effective).await?;
        if feature == FeatureKind::Chat {
            self.reconfigure_dependents(&effective).await;
        }
        Ok(outcome)
    }

    async fn configure_session(
        &self,
        feature: FeatureKind,
        config: &FeatureConfig,
    ) -> Result<ConfigureOutcome, AssistantError> {
        let outcome = match &self.mode {
            ExecutionMode::Direct { manager, .. } => manager.configure(self.scope, feature, config).await,
            ExecutionMode::Bridged(client) => {
                let command = Command::Configure {
                    feature,
                    config: config.clone(),
                };
                self.call_bridged(client, command, None).await
            }
        };
        match &outcome {
            Ok(outcome) => log::debug!("Router: configured {}: {:?}", feature, outcome),
            Err(e) => log::warn!("Router: failed to configure {}: {}", feature, e),
        }
        outcome
    }

    async fn reconfigure_dependents(&self, chat: &FeatureConfig) {
        let dependents: Vec<(FeatureKind, FeatureConfig)> = lock(&self.configs)
            .iter()
            .filter(|(feature, config)| {
                **feature != FeatureKind::Chat
                    && config.inherit_chat_provider
                    && config.enabled
                    && feature.supports(chat.provider)
            })
            .map(|(feature, config)| (*feature, config.inherit_provider_from(chat)))
            .collect();

        for (feature, config) in dependents {
            log::info!("Router: {} follows chat provider {}", feature, chat.provider);
            if let Err(e) = self.configure_session(feature, &config).await {
                log::warn!("Router: could not reconfigure {} after chat changed: {}", feature, e);
            }
        }
    }

    pub async fn is_configured(&self, feature: FeatureKind) -> Result<bool, AssistantError> {
        match &self.mode {
            ExecutionMode::Direct { manager, .. } => Ok(manager.is_configured(self.scope, feature)),
            ExecutionMode::Bridged(client) => {
                self.call_bridged(client, Command::IsConfigured { feature }, None)
                    .await
            }
        }
    }

    /// Abort the feature's in-flight calls and destroy its session.
    pub async fn destroy(&self, feature: FeatureKind) -> Result<bool, AssistantError> {
        self.tracker.abort(feature);
        lock(&self.configs).remove(&feature);
        match &self.mode {
            ExecutionMode::Direct { manager, .. } => Ok(manager.destroy(self.scope, feature).await),
            ExecutionMode::Bridged(client) => self.call_bridged(client, Command::Destroy { feature }, None).await,
        }
    }

    /// Cancel the feature's in-flight calls. Returns how many were running.
    pub fn abort(&self, feature: FeatureKind) -> usize {
        let cancelled = self.tracker.abort(feature);
        if cancelled > 0 {
            log::info!("Router: aborted {} {} call(s)", cancelled, feature);
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // On-device availability
    // ------------------------------------------------------------------

    fn config_for(&self, feature: FeatureKind) -> FeatureConfig {
        self.last_config(feature)
            .unwrap_or_else(|| FeatureConfig::default_for(feature))
    }

    pub async fn check_availability(&self, feature: FeatureKind) -> Result<AvailabilityReport, AssistantError> {
        let config = self.config_for(feature);
        match &self.mode {
            ExecutionMode::Direct { manager, .. } => manager.check_availability(feature, &config).await,
            ExecutionMode::Bridged(client) => {
                self.call_bridged(client, Command::CheckAvailability { feature, config }, None)
                    .await
            }
        }
    }

    /// Download the feature's on-device model, reporting progress (0-100).
    /// Returns the availability after the download.
    pub async fn monitor_download<F>(
        &self,
        feature: FeatureKind,
        on_progress: F,
    ) -> Result<AvailabilityReport, AssistantError>
    where
        F: FnMut(u8) + Send,
    {
        let ticket = self.tracker.begin(feature);
        let result = self
            .run_download(feature, ticket.token(), on_progress)
            .await;
        ticket.finish(&result);
        result
    }

    async fn run_download<F>(
        &self,
        feature: FeatureKind,
        token: &CancellationToken,
        mut on_progress: F,
    ) -> Result<AvailabilityReport, AssistantError>
    where
        F: FnMut(u8) + Send,
    {
        let config = self.config_for(feature);
        let client = match &self.mode {
            ExecutionMode::Direct { manager, .. } => {
                return manager
                    .monitor_download(feature, &config, token.clone(), on_progress)
                    .await;
            }
            ExecutionMode::Bridged(client) => client,
        };

        let mut events = client
            .stream(self.scope, Command::MonitorDownload { feature, config }, None)
            .await?;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    events.abort().await;
                    return Err(AssistantError::Cancelled);
                }
                next = events.next() => next,
            };
            let Some(chunk) = next else {
                return Err(AssistantError::protocol("download stream ended without a report"));
            };
            match serde_json::from_value::<DownloadEvent>(chunk?)? {
                DownloadEvent::Progress { percent } => on_progress(percent),
                DownloadEvent::Finished { report } => {
                    events.abort().await;
                    return Ok(report);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Text features
    // ------------------------------------------------------------------

    async fn open_text_stream(&self, task: TextTask) -> Result<TextStream, AssistantError> {
        let ticket = self.tracker.begin(task.feature());
        let opened = match &self.mode {
            ExecutionMode::Direct { manager, .. } => {
                cancellable(ticket.token(), manager.text_stream(self.scope, task))
                    .await
                    .map(Source::Local)
            }
            ExecutionMode::Bridged(client) => {
                let command = match task {
                    TextTask::Summarize { text } => Command::Summarize { text, stream: true },
                    other => bridged_text_command(other),
                };
                client
                    .stream(self.scope, command, None)
                    .await
                    .map(Source::Remote)
            }
        };
        match opened {
            Ok(source) => Ok(TextStream::new(source, ticket)),
            Err(e) => {
                let failed = Err(e);
                ticket.finish(&failed);
                failed
            }
        }
    }

    async fn run_text(&self, task: TextTask) -> Result<String, AssistantError> {
        let ticket = self.tracker.begin(task.feature());
        let result = match &self.mode {
            ExecutionMode::Direct { manager, .. } => {
                let run = async {
                    match task {
                        TextTask::DetectLanguage { text } => manager.detect_language(self.scope, &text).await,
                        other => manager.run_text(self.scope, other).await,
                    }
                };
                cancellable(ticket.token(), run).await
            }
            ExecutionMode::Bridged(client) => {
                self.call_bridged(client, bridged_text_command(task), Some(ticket.token()))
                    .await
            }
        };
        ticket.finish(&result);
        result
    }

    pub async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TextStream, AssistantError> {
        self.open_text_stream(TextTask::Chat { messages }).await
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, AssistantError> {
        self.chat_stream(messages).await?.collect_text().await
    }

    pub async fn translate(
        &self,
        text: &str,
        source_language: Option<&str>,
        target_language: &str,
    ) -> Result<String, AssistantError> {
        self.run_text(TextTask::Translate {
            text: text.to_string(),
            source_language: source_language.map(str::to_string),
            target_language: target_language.to_string(),
        })
        .await
    }

    pub async fn summarize(&self, text: &str) -> Result<String, AssistantError> {
        self.run_text(TextTask::Summarize { text: text.to_string() })
            .await
    }

    pub async fn summarize_stream(&self, text: &str) -> Result<TextStream, AssistantError> {
        self.open_text_stream(TextTask::Summarize { text: text.to_string() })
            .await
    }

    pub async fn rewrite(&self, text: &str, instructions: Option<&str>) -> Result<String, AssistantError> {
        self.run_text(TextTask::Rewrite {
            text: text.to_string(),
            instructions: instructions.map(str::to_string),
        })
        .await
    }

    /// ISO-639-1 code of the text's language.
    pub async fn detect_language(&self, text: &str) -> Result<String, AssistantError> {
        self.run_text(TextTask::DetectLanguage { text: text.to_string() })
            .await
    }

    // ------------------------------------------------------------------
    // Speech
    // ------------------------------------------------------------------

    pub async fn transcribe(&self, audio: AudioUnit) -> Result<String, AssistantError> {
        let ticket = self.tracker.begin(FeatureKind::SpeechToText);
        let result = match &self.mode {
            ExecutionMode::Direct { manager, .. } => {
                cancellable(ticket.token(), manager.transcribe(self.scope, &audio)).await
            }
            ExecutionMode::Bridged(client) => {
                let command = Command::Transcribe { audio: audio.to_wire() };
                self.call_bridged(client, command, Some(ticket.token())).await
            }
        };
        ticket.finish(&result);
        result
    }

    /// Synthesize speech. With `lip_sync`, motion data is extracted on the
    /// side that ran the synthesis; extraction failures leave `motion` empty.
    pub async fn synthesize(&self, text: &str, lip_sync: bool) -> Result<SynthesisOutput, AssistantError> {
        let ticket = self.tracker.begin(FeatureKind::TextToSpeech);
        let result = self.run_synthesis(text, lip_sync, ticket.token()).await;
        ticket.finish(&result);
        result
    }

    /// [`Router::synthesize`] that also stops when `cancel` fires. In
    /// bridged mode the far side is told to abort.
    pub async fn synthesize_with_cancel(
        &self,
        text: &str,
        lip_sync: bool,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, AssistantError> {
        let ticket = self.tracker.begin_linked(FeatureKind::TextToSpeech, cancel);
        let result = self.run_synthesis(text, lip_sync, ticket.token()).await;
        ticket.finish(&result);
        result
    }

    async fn run_synthesis(
        &self,
        text: &str,
        lip_sync: bool,
        token: &CancellationToken,
    ) -> Result<SynthesisOutput, AssistantError> {
        match &self.mode {
            ExecutionMode::Direct { manager, motion } => {
                let audio = cancellable(token, manager.synthesize(self.scope, text)).await?;
                let motion = if lip_sync {
                    motion
                        .extract(&audio)
                        .map_err(|e| log::warn!("Router: lip-sync extraction failed, audio only: {}", e))
                        .ok()
                } else {
                    None
                };
                Ok(SynthesisOutput { audio, motion })
            }
            ExecutionMode::Bridged(client) => {
                let command = Command::Synthesize {
                    text: text.to_string(),
                    lip_sync,
                };
                let reply: SynthesisReply = self.call_bridged(client, command, Some(token)).await?;
                let motion = reply.motion.and_then(|wire| {
                    MotionData::from_wire(&wire)
                        .map_err(|e| log::warn!("Router: dropping unreadable motion data: {}", e))
                        .ok()
                });
                Ok(SynthesisOutput {
                    audio: AudioUnit::from_wire(reply.audio),
                    motion,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::tests::mocks::{enabled_openai, MockFactory, MockRuntime};

    fn direct() -> (Router, Arc<ProviderSessionManager>) {
        let manager = Arc::new(ProviderSessionManager::new(
            Arc::new(MockFactory::default()),
            Arc::new(MockRuntime::default()),
        ));
        (Router::direct(manager.clone()), manager)
    }

    #[tokio::test]
    async fn test_dependent_feature_follows_chat() {
        let (router, manager) = direct();

        let mut summarize = enabled_openai(FeatureKind::Summarize);
        summarize.inherit_chat_provider = true;
        router.configure(FeatureKind::Summarize, summarize).await.unwrap();
        let before = manager
            .session(ExecutionScope::DEFAULT, FeatureKind::Summarize)
            .unwrap();

        let mut chat = enabled_openai(FeatureKind::Chat);
        chat.provider = ProviderKind::Ollama;
        chat.ollama.model = "llama3.2".to_string();
        router.configure(FeatureKind::Chat, chat).await.unwrap();

        let after = manager
            .session(ExecutionScope::DEFAULT, FeatureKind::Summarize)
            .unwrap();
        assert_ne!(before.id, after.id);
        assert_eq!(after.provider, ProviderKind::Ollama);
    }

    #[tokio::test]
    async fn test_disabled_dependent_is_not_built() {
        let (router, manager) = direct();

        let mut rewrite = enabled_openai(FeatureKind::Rewrite);
        rewrite.enabled = false;
        rewrite.inherit_chat_provider = true;
        let outcome = router.configure(FeatureKind::Rewrite, rewrite).await.unwrap();
        assert_eq!(outcome, ConfigureOutcome::Disabled);

        router
            .configure(FeatureKind::Chat, enabled_openai(FeatureKind::Chat))
            .await
            .unwrap();
        assert!(manager
            .session(ExecutionScope::DEFAULT, FeatureKind::Rewrite)
            .is_none());
        assert!(!router.is_configured(FeatureKind::Rewrite).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reports_failure_reason() {
        let (router, _) = direct();
        assert_eq!(router.status(FeatureKind::Translate), FeatureStatus::Idle);

        let err = router.translate("hola", None, "en").await.unwrap_err();
        assert_eq!(
            err,
            AssistantError::NotConfigured {
                feature: FeatureKind::Translate
            }
        );
        assert_eq!(
            router.status(FeatureKind::Translate).to_string(),
            "failed: Feature 'translate' is not configured"
        );
    }

    #[tokio::test]
    async fn test_open_scope_is_isolated() {
        let (router, manager) = direct();
        let tab = Router::open_scope(router.mode().clone()).await.unwrap();
        assert_ne!(tab.scope(), router.scope());

        tab.configure(FeatureKind::Chat, enabled_openai(FeatureKind::Chat))
            .await
            .unwrap();
        assert!(tab.is_configured(FeatureKind::Chat).await.unwrap());
        assert!(!router.is_configured(FeatureKind::Chat).await.unwrap());

        assert_eq!(tab.close().await.unwrap(), 1);
        assert!(!manager.has_scope(tab.scope()));
    }
}
