//! Provider session manager.
//!
//! Holds at most one live provider session per `(ExecutionScope, FeatureKind)`
//! key. Sessions are created by `configure`, reused when the configuration
//! fingerprint is unchanged, and destroyed on reconfiguration, explicit
//! `destroy`, scope teardown, or a quota/context-limit error.
//!
//! ## State machine (per key)
//! `Unconfigured → Configuring → Ready`, with `Configuring → Error` when the
//! provider could not be created. `Error` returns to `Unconfigured` on
//! `destroy`, or moves to `Configuring` on the next `configure`.

mod availability;

pub use availability::{AvailabilityReport, AvailabilityState, DownloadEvent};

use crate::audio::AudioUnit;
use crate::config::{validate_feature_config, FeatureConfig, FeatureKind, ProviderKind};
use crate::error::AssistantError;
use crate::lock;
use crate::providers::{
    prompts, DefaultProviderFactory, OnDeviceRuntime, ProviderError, ProviderFactory,
    SessionClient, TextTask,
};
use crate::scope::ExecutionScope;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub type SessionKey = (ExecutionScope, FeatureKind);

/// Stream of text deltas with errors already normalized.
pub type TextDeltaStream = BoxStream<'static, Result<String, AssistantError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unconfigured,
    Configuring,
    Ready,
    Error,
}

/// A live provider session. Owned by the manager; callers get `Arc` clones.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub feature: FeatureKind,
    pub provider: ProviderKind,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    client: SessionClient,
}

impl Session {
    pub fn client(&self) -> &SessionClient {
        &self.client
    }
}

/// What `configure` did with the session for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfigureOutcome {
    Created { session_id: Uuid },
    Reused { session_id: Uuid },
    Disabled,
}

impl ConfigureOutcome {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            ConfigureOutcome::Created { session_id } | ConfigureOutcome::Reused { session_id } => {
                Some(*session_id)
            }
            ConfigureOutcome::Disabled => None,
        }
    }
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    session: Option<Arc<Session>>,
    last_error: Option<String>,
    /// Stamped by every configure from a manager-wide counter, so a slot
    /// recreated after `destroy` never repeats a value. A configure that
    /// finds a different stamp when it finishes discards its session.
    generation: u64,
}

type Slots = Arc<Mutex<HashMap<SessionKey, Slot>>>;

/// Close a session in the background (closing may await the provider).
fn close_in_background(session: Arc<Session>) {
    tokio::spawn(async move {
        session.client.close().await;
    });
}

/// Normalize a provider error, tearing the session down on quota errors.
fn fail_session(slots: &Slots, key: SessionKey, session_id: Uuid, err: ProviderError) -> AssistantError {
    let err: AssistantError = err.into();
    if let AssistantError::QuotaExceeded { .. } = err {
        let evicted = {
            let mut slots = lock(slots);
            let current = slots
                .get(&key)
                .and_then(|slot| slot.session.as_ref())
                .map(|s| s.id);
            if current == Some(session_id) {
                slots.remove(&key).and_then(|slot| slot.session)
            } else {
                None
            }
        };
        if let Some(session) = evicted {
            log::warn!(
                "SessionManager: quota exceeded for {} in {}, session {} destroyed",
                key.1,
                key.0,
                session.id
            );
            close_in_background(session);
        }
    }
    err
}

/// Per-scope, per-feature provider sessions.
pub struct ProviderSessionManager {
    factory: Arc<dyn ProviderFactory>,
    on_device: Arc<dyn OnDeviceRuntime>,
    slots: Slots,
    scopes: Mutex<HashSet<ExecutionScope>>,
    next_scope: AtomicU64,
    next_generation: AtomicU64,
    downloads: Mutex<HashMap<FeatureKind, u8>>,
}

impl ProviderSessionManager {
    pub fn new(factory: Arc<dyn ProviderFactory>, on_device: Arc<dyn OnDeviceRuntime>) -> Self {
        let mut scopes = HashSet::new();
        scopes.insert(ExecutionScope::DEFAULT);
        Self {
            factory,
            on_device,
            slots: Arc::new(Mutex::new(HashMap::new())),
            scopes: Mutex::new(scopes),
            next_scope: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Manager backed by the built-in providers.
    pub fn with_defaults(on_device: Arc<dyn OnDeviceRuntime>) -> Self {
        let factory = Arc::new(DefaultProviderFactory::new(on_device.clone()));
        Self::new(factory, on_device)
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub fn create_scope(&self) -> ExecutionScope {
        let scope = ExecutionScope::new(self.next_scope.fetch_add(1, Ordering::Relaxed));
        lock(&self.scopes).insert(scope);
        log::info!("SessionManager: created {}", scope);
        scope
    }

    pub fn has_scope(&self, scope: ExecutionScope) -> bool {
        lock(&self.scopes).contains(&scope)
    }

    /// Tear down every session of a scope. The default scope stays registered.
    pub async fn destroy_scope(&self, scope: ExecutionScope) -> usize {
        if !scope.is_default() {
            lock(&self.scopes).remove(&scope);
        }
        let sessions: Vec<Arc<Session>> = {
            let mut slots = lock(&self.slots);
            let keys: Vec<SessionKey> = slots.keys().filter(|k| k.0 == scope).copied().collect();
            keys.into_iter()
                .filter_map(|k| slots.remove(&k).and_then(|slot| slot.session))
                .collect()
        };
        for session in &sessions {
            session.client.close().await;
        }
        log::info!(
            "SessionManager: destroyed {} ({} sessions)",
            scope,
            sessions.len()
        );
        sessions.len()
    }

    fn ensure_scope(&self, scope: ExecutionScope) -> Result<(), AssistantError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AssistantError::UnknownScope { scope: scope.id() })
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Configure the session for a feature.
    ///
    /// Validation, host support and session creation failures are returned
    /// as errors; a disabled feature never gets a session.
    pub async fn configure(
        &self,
        scope: ExecutionScope,
        feature: FeatureKind,
        config: &FeatureConfig,
    ) -> Result<ConfigureOutcome, AssistantError> {
        self.ensure_scope(scope)?;

        if !config.enabled {
            if self.destroy(scope, feature).await {
                log::info!("SessionManager: {} disabled in {}, session destroyed", feature, scope);
            }
            return Ok(ConfigureOutcome::Disabled);
        }

        validate_feature_config(feature, config).into_result()?;

        if config.provider == ProviderKind::OnDevice && !self.on_device.is_supported(feature) {
            return Err(AssistantError::ProviderUnavailable {
                message: format!("this host cannot run {} on-device", feature),
            });
        }

        let key = (scope, feature);
        let fingerprint = config.session_fingerprint();

        let (generation, previous) = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(key).or_default();
            if slot.state == SessionState::Ready {
                if let Some(session) = slot.session.as_ref().filter(|s| s.fingerprint == fingerprint) {
                    log::debug!("SessionManager: reusing session {} for {}", session.id, feature);
                    return Ok(ConfigureOutcome::Reused {
                        session_id: session.id,
                    });
                }
            }
            slot.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            slot.state = SessionState::Configuring;
            slot.last_error = None;
            (slot.generation, slot.session.take())
        };

        // The old session is gone before the new one is built.
        if let Some(old) = previous {
            log::info!("SessionManager: destroying session {} for {} (settings changed)", old.id, feature);
            old.client.close().await;
        }

        let created = self.factory.create(feature, config).await;

        let mut slots = lock(&self.slots);
        let slot = slots.entry(key).or_default();
        if slot.generation != generation {
            drop(slots);
            if let Ok(client) = created {
                tokio::spawn(async move { client.close().await });
            }
            return Err(AssistantError::Cancelled);
        }

        match created {
            Ok(client) => {
                let session = Arc::new(Session {
                    id: Uuid::new_v4(),
                    feature,
                    provider: config.provider,
                    fingerprint,
                    created_at: Utc::now(),
                    client,
                });
                let session_id = session.id;
                slot.state = SessionState::Ready;
                slot.session = Some(session);
                log::info!(
                    "SessionManager: created {} session {} for {} in {}",
                    config.provider,
                    session_id,
                    feature,
                    scope
                );
                Ok(ConfigureOutcome::Created { session_id })
            }
            Err(e) => {
                let err: AssistantError = e.into();
                log::error!("SessionManager: failed to configure {}: {}", feature, err);
                slot.state = SessionState::Error;
                slot.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn is_configured(&self, scope: ExecutionScope, feature: FeatureKind) -> bool {
        self.state(scope, feature) == SessionState::Ready
    }

    pub fn state(&self, scope: ExecutionScope, feature: FeatureKind) -> SessionState {
        lock(&self.slots)
            .get(&(scope, feature))
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Reason of the last failed configure, while the key is in `Error`.
    pub fn last_error(&self, scope: ExecutionScope, feature: FeatureKind) -> Option<String> {
        lock(&self.slots)
            .get(&(scope, feature))
            .and_then(|slot| slot.last_error.clone())
    }

    pub fn session(&self, scope: ExecutionScope, feature: FeatureKind) -> Option<Arc<Session>> {
        lock(&self.slots)
            .get(&(scope, feature))
            .filter(|slot| slot.state == SessionState::Ready)
            .and_then(|slot| slot.session.clone())
    }

    /// Destroy the session for a key. Returns whether anything was torn down.
    pub async fn destroy(&self, scope: ExecutionScope, feature: FeatureKind) -> bool {
        let removed = lock(&self.slots).remove(&(scope, feature));
        match removed {
            Some(slot) => {
                if let Some(session) = slot.session {
                    log::info!("SessionManager: destroying session {} for {}", session.id, feature);
                    session.client.close().await;
                }
                true
            }
            None => false,
        }
    }

    fn ready_session(
        &self,
        scope: ExecutionScope,
        feature: FeatureKind,
    ) -> Result<Arc<Session>, AssistantError> {
        self.ensure_scope(scope)?;
        self.session(scope, feature)
            .ok_or(AssistantError::NotConfigured { feature })
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Start a streaming text task on the feature's session.
    pub async fn text_stream(
        &self,
        scope: ExecutionScope,
        task: TextTask,
    ) -> Result<TextDeltaStream, AssistantError> {
        let feature = task.feature();
        let session = self.ready_session(scope, feature)?;
        let SessionClient::Text(provider) = session.client() else {
            return Err(AssistantError::provider(format!(
                "{} is not served by a text provider",
                feature
            )));
        };

        let key = (scope, feature);
        let stream = provider
            .stream(task)
            .await
            .map_err(|e| fail_session(&self.slots, key, session.id, e))?;

        let slots = self.slots.clone();
        let session_id = session.id;
        Ok(stream
            .map(move |item| item.map_err(|e| fail_session(&slots, key, session_id, e)))
            .boxed())
    }

    /// Run a text task to completion.
    pub async fn run_text(
        &self,
        scope: ExecutionScope,
        task: TextTask,
    ) -> Result<String, AssistantError> {
        let mut stream = self.text_stream(scope, task).await?;
        let mut out = String::new();
        while let Some(delta) = stream.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }

    pub async fn detect_language(
        &self,
        scope: ExecutionScope,
        text: &str,
    ) -> Result<String, AssistantError> {
        let raw = self
            .run_text(
                scope,
                TextTask::DetectLanguage {
                    text: text.to_string(),
                },
            )
            .await?;
        Ok(prompts::parse_language_code(&raw))
    }

    pub async fn transcribe(
        &self,
        scope: ExecutionScope,
        audio: &AudioUnit,
    ) -> Result<String, AssistantError> {
        let feature = FeatureKind::SpeechToText;
        let session = self.ready_session(scope, feature)?;
        let SessionClient::SpeechToText(provider) = session.client() else {
            return Err(AssistantError::provider("speech_to_text has no transcription client"));
        };
        provider
            .transcribe(audio)
            .await
            .map_err(|e| fail_session(&self.slots, (scope, feature), session.id, e))
    }

    pub async fn synthesize(
        &self,
        scope: ExecutionScope,
        text: &str,
    ) -> Result<AudioUnit, AssistantError> {
        let feature = FeatureKind::TextToSpeech;
        let session = self.ready_session(scope, feature)?;
        let SessionClient::TextToSpeech(provider) = session.client() else {
            return Err(AssistantError::provider("text_to_speech has no synthesis client"));
        };
        provider
            .synthesize(text)
            .await
            .map_err(|e| fail_session(&self.slots, (scope, feature), session.id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mocks::{enabled_openai, MockFactory, MockRuntime};
    use std::time::Duration;

    fn manager(factory: Arc<MockFactory>) -> ProviderSessionManager {
        ProviderSessionManager::new(factory, Arc::new(MockRuntime::default()))
    }

    #[tokio::test]
    async fn test_configure_twice_reuses_session() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(factory.clone());
        let config = enabled_openai(FeatureKind::Chat);

        let first = manager
            .configure(ExecutionScope::DEFAULT, FeatureKind::Chat, &config)
            .await
            .unwrap();
        let second = manager
            .configure(ExecutionScope::DEFAULT, FeatureKind::Chat, &config)
            .await
            .unwrap();

        assert!(matches!(first, ConfigureOutcome::Created { .. }));
        assert!(matches!(second, ConfigureOutcome::Reused { .. }));
        assert_eq!(first.session_id(), second.session_id());
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_disabled_feature_never_builds_a_session() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(factory.clone());
        let mut config = enabled_openai(FeatureKind::Summarize);
        config.enabled = false;

        let outcome = manager
            .configure(ExecutionScope::DEFAULT, FeatureKind::Summarize, &config)
            .await
            .unwrap();
        assert_eq!(outcome, ConfigureOutcome::Disabled);
        assert_eq!(factory.created(), 0);
        assert_eq!(
            manager.state(ExecutionScope::DEFAULT, FeatureKind::Summarize),
            SessionState::Unconfigured
        );
    }

    #[tokio::test]
    async fn test_invalid_config_reports_all_errors() {
        let manager = manager(Arc::new(MockFactory::default()));
        let mut config = FeatureConfig::default();
        config.enabled = true;

        let err = manager
            .configure(ExecutionScope::DEFAULT, FeatureKind::Chat, &config)
            .await
            .unwrap_err();
        match err {
            AssistantError::Validation { errors } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_factory_failure_enters_error_state() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_next_create("endpoint refused");
        let manager = manager(factory);

        let result = manager
            .configure(
                ExecutionScope::DEFAULT,
                FeatureKind::Chat,
                &enabled_openai(FeatureKind::Chat),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(
            manager.state(ExecutionScope::DEFAULT, FeatureKind::Chat),
            SessionState::Error
        );
        assert!(manager
            .last_error(ExecutionScope::DEFAULT, FeatureKind::Chat)
            .is_some());

        manager.destroy(ExecutionScope::DEFAULT, FeatureKind::Chat).await;
        assert_eq!(
            manager.state(ExecutionScope::DEFAULT, FeatureKind::Chat),
            SessionState::Unconfigured
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_started_before_destroy_does_not_win() {
        let factory = Arc::new(MockFactory::default());
        let manager = Arc::new(manager(factory.clone()));
        factory.delay_next_create(Duration::from_millis(100));

        let slow = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .configure(
                        ExecutionScope::DEFAULT,
                        FeatureKind::Chat,
                        &enabled_openai(FeatureKind::Chat),
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            manager.state(ExecutionScope::DEFAULT, FeatureKind::Chat),
            SessionState::Configuring
        );

        assert!(manager.destroy(ExecutionScope::DEFAULT, FeatureKind::Chat).await);
        let mut newer = enabled_openai(FeatureKind::Chat);
        newer.openai.model = "new-model".to_string();
        let outcome = manager
            .configure(ExecutionScope::DEFAULT, FeatureKind::Chat, &newer)
            .await
            .unwrap();
        assert!(matches!(outcome, ConfigureOutcome::Created { .. }));

        assert_eq!(slow.await.unwrap(), Err(AssistantError::Cancelled));
        let live = manager.session(ExecutionScope::DEFAULT, FeatureKind::Chat).unwrap();
        assert_eq!(Some(live.id), outcome.session_id());
        assert!(live.fingerprint.contains("new-model"));

        // The stale session is closed, not leaked.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn test_unknown_scope_is_rejected() {
        let manager = manager(Arc::new(MockFactory::default()));
        let err = manager
            .configure(
                ExecutionScope::new(42),
                FeatureKind::Chat,
                &enabled_openai(FeatureKind::Chat),
            )
            .await
            .unwrap_err();
        assert_eq!(err, AssistantError::UnknownScope { scope: 42 });
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(factory.clone());
        let tab = manager.create_scope();
        let config = enabled_openai(FeatureKind::Chat);

        manager
            .configure(ExecutionScope::DEFAULT, FeatureKind::Chat, &config)
            .await
            .unwrap();
        manager.configure(tab, FeatureKind::Chat, &config).await.unwrap();
        assert_eq!(factory.created(), 2);

        assert_eq!(manager.destroy_scope(tab).await, 1);
        assert!(!manager.has_scope(tab));
        assert!(manager.is_configured(ExecutionScope::DEFAULT, FeatureKind::Chat));
    }

    #[tokio::test]
    async fn test_not_configured_error() {
        let manager = manager(Arc::new(MockFactory::default()));
        let err = manager
            .run_text(
                ExecutionScope::DEFAULT,
                TextTask::Summarize {
                    text: "x".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AssistantError::NotConfigured {
                feature: FeatureKind::Summarize
            }
        );
    }
}
